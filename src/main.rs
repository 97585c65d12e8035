//! olm main entry point
//!
//! Handles CLI parsing, logging setup, the one-shot connectivity test
//! mode, and supervisor lifecycle. Exit codes: 0 on clean shutdown or
//! test success, 1 on fatal startup errors or test failure.

use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use olm::{
    config::{CredentialStore, Overrides, Settings},
    monitor::probe,
    platform::get_platform,
    status,
    supervisor::Supervisor,
    APP_NAME, VERSION,
};

/// WireGuard mesh client agent for Pangolin overlay networks
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Pangolin control-plane endpoint (env: PANGOLIN_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Client identifier (env: OLM_ID)
    #[arg(long)]
    id: Option<String>,

    /// Client secret (env: OLM_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Tunnel MTU (env: MTU)
    #[arg(long)]
    mtu: Option<u16>,

    /// DNS server for the tunnel interface (env: DNS)
    #[arg(long)]
    dns: Option<String>,

    /// Log level (env: LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Tunnel interface name (env: INTERFACE)
    #[arg(long)]
    interface: Option<String>,

    /// Status surface bind address (env: HTTP_ADDR)
    #[arg(long)]
    http_addr: Option<String>,

    /// Enable the local status HTTP surface
    #[arg(long)]
    http: bool,

    /// Control-plane ping cadence, e.g. 3s (env: PING_INTERVAL)
    #[arg(long)]
    ping_interval: Option<String>,

    /// Per-ping timeout, e.g. 5s (env: PING_TIMEOUT)
    #[arg(long)]
    ping_timeout: Option<String>,

    /// Probe a target once and exit; no control-plane connection is made
    #[arg(long)]
    test: bool,

    /// Target for --test, host:port
    #[arg(long)]
    test_target: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            endpoint: self.endpoint.clone(),
            id: self.id.clone(),
            secret: self.secret.clone(),
            mtu: self.mtu,
            dns: self.dns.clone(),
            log_level: self.log_level.clone(),
            interface: self.interface.clone(),
            http_addr: self.http_addr.clone(),
            enable_http: self.http,
            ping_interval: self.ping_interval.clone(),
            ping_timeout: self.ping_timeout.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::resolve(cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&settings.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    if cli.test {
        run_test_mode(cli.test_target.as_deref()).await;
    }

    if let Err(e) = run(settings).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// One-shot connectivity test: probe the target, report, exit
async fn run_test_mode(target: Option<&str>) {
    let Some(target) = target else {
        eprintln!("Error: --test requires --test-target host:port");
        std::process::exit(1);
    };

    match probe::test_target(target).await {
        Ok(rtt) => {
            println!("Probe to {} succeeded in {:?}", target, rtt);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Probe to {} failed: {}", target, e);
            std::process::exit(1);
        }
    }
}

/// Run the agent until a signal or a terminate directive
async fn run(mut settings: Settings) -> anyhow::Result<()> {
    let store = CredentialStore::default_location();

    // Persisted credentials fill whatever env and CLI left unset
    if !settings.has_credentials() {
        if let Ok(Some(saved)) = store.load() {
            info!("Loaded persisted credentials");
            if settings.id.is_none() {
                settings.id = Some(saved.olm_id);
            }
            if settings.secret.is_none() {
                settings.secret = Some(saved.secret);
            }
            if settings.endpoint.is_none() {
                settings.endpoint = Some(saved.endpoint);
            }
        }
    }

    let (status_handle, mut connect_rx) = status::channel();
    let http_shutdown = CancellationToken::new();

    // Without credentials the surface is the only way to obtain them
    let serve_http = settings.enable_http || !settings.has_credentials();
    if serve_http {
        let addr = settings.http_bind_addr();
        let handle = status_handle.clone();
        let shutdown = http_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, handle, shutdown).await {
                error!("Status surface failed: {}", e);
            }
        });
    }

    if !settings.has_credentials() {
        info!(
            "Missing credentials; waiting for POST /connect on {}",
            settings.http_bind_addr()
        );
        match connect_rx.recv().await {
            Some(request) => {
                settings.apply_credentials(request.id, request.secret, request.endpoint);
            }
            None => anyhow::bail!("Connect channel closed before credentials arrived"),
        }
    }

    let supervisor = Supervisor::new(
        settings,
        Arc::from(get_platform()),
        status_handle,
        store,
    )?;
    supervisor.start().await?;

    // Later connect requests cannot change a running session
    tokio::spawn(async move {
        while let Some(request) = connect_rx.recv().await {
            warn!(
                "Ignoring connect request for id {}; session already running",
                request.id
            );
        }
    });

    let terminate = supervisor.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = terminate.cancelled() => {
            info!("Terminate directive received");
        }
    }

    supervisor.stop().await;
    http_shutdown.cancel();
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
