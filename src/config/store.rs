//! Credential persistence
//!
//! The control-plane credentials (and the last issued token) survive
//! restarts in a small JSON file. The file is created with 0600
//! permissions; the token inside is optional and is revalidated against
//! the server on next use.

use crate::error::{OlmError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persisted control-plane credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    /// Client identifier
    #[serde(rename = "olmId")]
    pub olm_id: String,

    /// Client secret
    pub secret: String,

    /// Control-plane endpoint
    pub endpoint: String,

    /// Last issued token, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Reads and writes the credential file
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Create a store backed by the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store at the default location: `$HOME/.config/olm/credentials.json`,
    /// falling back to the working directory when HOME is unset.
    pub fn default_location() -> Self {
        let path = std::env::var_os("HOME")
            .map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("olm")
                    .join("credentials.json")
            })
            .unwrap_or_else(|| PathBuf::from("olm-credentials.json"));
        Self::new(path)
    }

    /// Load credentials, returning `None` when the file does not exist
    pub fn load(&self) -> Result<Option<StoredCredentials>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            OlmError::Config(format!(
                "Failed to read credential file {:?}: {}",
                self.path, e
            ))
        })?;

        let creds: StoredCredentials = serde_json::from_str(&content).map_err(|e| {
            OlmError::Config(format!(
                "Malformed credential file {:?}: {}",
                self.path, e
            ))
        })?;

        Ok(Some(creds))
    }

    /// Write credentials with restrictive permissions (0600 on Unix)
    pub fn save(&self, creds: &StoredCredentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                OlmError::Config(format!(
                    "Failed to create credential directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let encoded = serde_json::to_string_pretty(creds)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path).map_err(|e| {
            OlmError::Config(format!(
                "Failed to create credential file {:?}: {}",
                self.path, e
            ))
        })?;

        file.write_all(encoded.as_bytes()).map_err(|e| {
            OlmError::Config(format!(
                "Failed to write credential file {:?}: {}",
                self.path, e
            ))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> StoredCredentials {
        StoredCredentials {
            olm_id: "olm-1".to_string(),
            secret: "hunter2".to_string(),
            endpoint: "https://p.example".to_string(),
            token: Some("tok".to_string()),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));

        store.save(&sample()).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.olm_id, "olm-1");
        assert_eq!(loaded.secret, "hunter2");
        assert_eq!(loaded.endpoint, "https://p.example");
        assert_eq!(loaded.token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::new(&path);
        store.save(&sample()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"olmId\""));
        assert!(json.contains("\"endpoint\""));
    }

    #[test]
    fn test_token_is_optional() {
        let json = r#"{"olmId":"a","secret":"b","endpoint":"https://c"}"#;
        let creds: StoredCredentials = serde_json::from_str(json).unwrap();
        assert!(creds.token.is_none());
    }
}
