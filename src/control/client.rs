//! Control-plane client
//!
//! One logical bidirectional message channel to the Pangolin server.
//! The session task loops forever: acquire a token, dial the WebSocket,
//! serve reads and heartbeats until something fails, then wait a fixed
//! interval and try again. Handlers registered per message type are
//! invoked serially on the read side, so directives are processed in
//! strict arrival order.

use crate::control::message::Envelope;
use crate::control::token::acquire_token;
use crate::error::{OlmError, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Fixed wait between reconnect attempts
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Control ping cadence
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for any single WebSocket write
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Future returned by message handlers and connect callbacks
pub type HandlerFuture = BoxFuture<'static, ()>;

/// A registered message handler; invoked once per inbound message of its
/// type, serially on the read task. Handlers must not block.
pub type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

type ConnectCallback = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;
type TokenCallback = Arc<dyn Fn(String) + Send + Sync>;

/// An outbound frame plus an optional write acknowledgement
type Outbound = (Message, Option<oneshot::Sender<()>>);

/// Authenticated, reconnecting control channel to the Pangolin server
pub struct ControlClient {
    endpoint: String,
    olm_id: String,
    secret: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    handlers: RwLock<HashMap<String, Handler>>,
    sender: RwLock<Option<mpsc::UnboundedSender<Outbound>>>,
    on_connect: RwLock<Vec<ConnectCallback>>,
    on_token_update: RwLock<Vec<TokenCallback>>,
    shutdown: CancellationToken,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl ControlClient {
    /// Create a client for the given endpoint and credentials
    pub fn new(endpoint: String, olm_id: String, secret: String) -> Self {
        Self {
            endpoint,
            olm_id,
            secret,
            http: reqwest::Client::new(),
            token: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
            sender: RwLock::new(None),
            on_connect: RwLock::new(Vec::new()),
            on_token_update: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            session: Mutex::new(None),
        }
    }

    /// Seed the token cache, e.g. from the credential store
    pub fn set_cached_token(&self, token: String) {
        *self.token.write().expect("token lock poisoned") = Some(token);
    }

    /// The currently cached token, if any
    pub fn cached_token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    /// Install a handler for a message type. Registrations happen during
    /// startup, before [`ControlClient::connect`].
    pub fn register_handler<F, Fut>(&self, message_type: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |data| -> HandlerFuture { Box::pin(handler(data)) });
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(message_type.to_string(), handler);
    }

    /// Register a callback fired after every successful dial
    pub fn on_connect<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: ConnectCallback = Arc::new(move || -> HandlerFuture { Box::pin(callback()) });
        self.on_connect
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    /// Register a callback fired whenever a fresh token is issued
    pub fn on_token_update<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.on_token_update
            .write()
            .expect("callback lock poisoned")
            .push(Arc::new(callback));
    }

    /// Serialize `{type, data}` and write it as a single text frame.
    /// Fails when no socket is currently connected.
    pub fn send_message<T: Serialize>(&self, message_type: &str, data: &T) -> Result<()> {
        self.enqueue(message_type, data, None)
    }

    /// Like [`ControlClient::send_message`], but waits until the frame
    /// has actually been written, failing after `deadline`.
    pub async fn send_message_with_timeout<T: Serialize>(
        &self,
        message_type: &str,
        data: &T,
        deadline: Duration,
    ) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(message_type, data, Some(ack_tx))?;

        match time::timeout(deadline, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(OlmError::Transport(
                "Connection lost before the message was written".to_string(),
            )),
            Err(_) => Err(OlmError::Timeout(format!(
                "Message '{}' not written within {:?}",
                message_type, deadline
            ))),
        }
    }

    fn enqueue<T: Serialize>(
        &self,
        message_type: &str,
        data: &T,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let envelope = Envelope::new(message_type, data)?;
        let text = serde_json::to_string(&envelope)?;

        let sender = self.sender.read().expect("sender lock poisoned");
        match sender.as_ref() {
            Some(tx) => tx
                .send((Message::Text(text), ack))
                .map_err(|_| OlmError::Transport("Control channel is shutting down".to_string())),
            None => Err(OlmError::Transport(
                "Not connected to the control plane".to_string(),
            )),
        }
    }

    /// Start the background session task. Returns immediately; dial and
    /// auth failures are retried forever at a fixed interval and never
    /// surface to the caller.
    pub async fn connect(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if client.shutdown.is_cancelled() {
                    break;
                }

                match client.run_session().await {
                    Ok(()) => {
                        // run_session only returns Ok on shutdown
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "Control channel lost: {}; reconnecting in {:?}",
                            e, RECONNECT_INTERVAL
                        );
                    }
                }

                tokio::select! {
                    _ = time::sleep(RECONNECT_INTERVAL) => {}
                    _ = client.shutdown.cancelled() => break,
                }
            }
            debug!("Control session task exited");
        });

        *self.session.lock().await = Some(handle);
    }

    /// One connected session: token, dial, then serve until failure
    async fn run_session(&self) -> Result<()> {
        let cached = self.cached_token();
        let token = acquire_token(
            &self.http,
            &self.endpoint,
            &self.olm_id,
            &self.secret,
            cached.as_deref(),
        )
        .await?;

        let is_fresh = cached.as_deref() != Some(token.as_str());
        *self.token.write().expect("token lock poisoned") = Some(token.clone());
        if is_fresh {
            let callbacks: Vec<TokenCallback> = self
                .on_token_update
                .read()
                .expect("callback lock poisoned")
                .clone();
            for callback in callbacks {
                callback(token.clone());
            }
        }

        let url = ws_url(&self.endpoint, &token)?;
        info!("Dialing control plane at {}", redact_token(&url));

        let (stream, _) = connect_async(url.as_str()).await?;
        info!("Control channel established");

        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        *self.sender.write().expect("sender lock poisoned") = Some(tx);

        let callbacks: Vec<ConnectCallback> = self
            .on_connect
            .read()
            .expect("callback lock poisoned")
            .clone();
        for callback in callbacks {
            callback().await;
        }

        let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(OlmError::Transport("Server closed the connection".to_string()));
                        }
                        Some(Ok(_)) => {} // ping/pong/binary frames
                        Some(Err(e)) => break Err(e.into()),
                    }
                }
                outbound = rx.recv() => {
                    let Some((message, ack)) = outbound else {
                        break Err(OlmError::Internal("Outbound channel closed".to_string()));
                    };
                    if let Err(e) = write_with_deadline(&mut sink, message).await {
                        break Err(e);
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write_with_deadline(&mut sink, Message::Ping(Vec::new())).await {
                        break Err(e);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Ok(());
                }
            }
        };

        *self.sender.write().expect("sender lock poisoned") = None;
        result
    }

    /// Decode an inbound frame and invoke its registered handler.
    /// Malformed JSON and unknown types drop the message, never the
    /// connection.
    async fn dispatch(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!("Dropping malformed control message: {}", e);
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .get(&envelope.message_type)
            .cloned();

        match handler {
            Some(handler) => {
                debug!("Dispatching {}", envelope.message_type);
                handler(envelope.data).await;
            }
            None => {
                debug!("No handler for message type {}", envelope.message_type);
            }
        }
    }

    /// Signal all tasks to exit and close the socket. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.session.lock().await.take() {
            if time::timeout(Duration::from_secs(5), handle).await.is_err() {
                error!("Timeout waiting for control session to stop");
            }
        }
        info!("Control client closed");
    }
}

async fn write_with_deadline<S>(sink: &mut S, message: Message) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match time::timeout(WRITE_DEADLINE, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(OlmError::Transport(format!("WebSocket write failed: {}", e))),
        Err(_) => Err(OlmError::Timeout(format!(
            "WebSocket write exceeded {:?}",
            WRITE_DEADLINE
        ))),
    }
}

/// Build the WebSocket URL for an endpoint: `wss` for https endpoints,
/// `ws` otherwise, path `/api/v1/ws`, token as a query parameter.
fn ws_url(endpoint: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| OlmError::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(OlmError::Config(format!(
                "Unsupported endpoint scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| OlmError::Config(format!("Cannot set scheme on '{}'", endpoint)))?;
    url.set_path("/api/v1/ws");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().append_pair("token", "…");
    redacted.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::MSG_PING;

    #[test]
    fn test_ws_url_https() {
        let url = ws_url("https://p.example", "tok").unwrap();
        assert_eq!(url.as_str(), "wss://p.example/api/v1/ws?token=tok");
    }

    #[test]
    fn test_ws_url_http() {
        let url = ws_url("http://p.example:3000", "tok").unwrap();
        assert_eq!(url.as_str(), "ws://p.example:3000/api/v1/ws?token=tok");
    }

    #[test]
    fn test_ws_url_rejects_unknown_scheme() {
        assert!(ws_url("ftp://p.example", "tok").is_err());
        assert!(ws_url("not a url", "tok").is_err());
    }

    #[test]
    fn test_redact_token_hides_value() {
        let url = ws_url("https://p.example", "secret-token").unwrap();
        assert!(!redact_token(&url).contains("secret-token"));
    }

    #[test]
    fn test_send_message_fails_when_disconnected() {
        let client = ControlClient::new(
            "https://p.example".to_string(),
            "olm-1".to_string(),
            "s".to_string(),
        );
        let result = client.send_message(MSG_PING, &serde_json::json!({}));
        assert!(matches!(result, Err(OlmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_dispatch_is_keyed_by_type() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let client = ControlClient::new(
            "https://p.example".to_string(),
            "olm-1".to_string(),
            "s".to_string(),
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        client.register_handler("olm/test", move |_| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
            }
        });

        client.dispatch(r#"{"type":"olm/test","data":{}}"#).await;
        client.dispatch(r#"{"type":"olm/other","data":{}}"#).await;
        client.dispatch("not json").await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
