//! Session credential material.
//!
//! An [`AuthState`] is the protocol's opaque credential set for one session,
//! cached in a local directory: one primary credentials document
//! (`creds.json`) plus auxiliary key files named `<category>-<id>.json`.
//! The persistence manager owns it while the session is idle and lends it to
//! the connection pool (`Arc`) for the lifetime of one socket.

use crate::env;
use crate::error::{GatewayError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Credential material of one session.
#[derive(Debug)]
pub struct AuthState {
    dir: PathBuf,
    creds: RwLock<Value>,
}

impl AuthState {
    /// Load the credentials in `dir`, or generate and persist fresh ones.
    pub async fn load_or_init(dir: &Path) -> Result<Self> {
        async_fs::create_dir_all(dir).await.map_err(|e| {
            GatewayError::Persistence(format!(
                "Failed to create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let creds_path = env::creds_file_path(dir);
        let creds = if async_fs::try_exists(&creds_path).await? {
            let content = async_fs::read(&creds_path).await?;
            let creds: Value = serde_json::from_slice(&content)?;
            if !creds.is_object() {
                return Err(GatewayError::Persistence(format!(
                    "Credentials file {} is not a JSON object",
                    creds_path.display()
                )));
            }
            debug!("Loaded credentials from {}", creds_path.display());
            creds
        } else {
            let creds = Self::fresh_credentials();
            write_atomic(&creds_path, &serde_json::to_vec_pretty(&creds)?).await?;
            info!("Initialized fresh credentials in {}", dir.display());
            creds
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            creds: RwLock::new(creds),
        })
    }

    /// Fresh, unpaired credentials. The protocol fills in the rest while pairing.
    fn fresh_credentials() -> Value {
        let noise_key: [u8; 32] = rand::random();
        let identity_key: [u8; 32] = rand::random();
        let adv_secret: [u8; 32] = rand::random();
        let registration_id = rand::random::<u16>() & 0x3FFF;

        json!({
            "noiseKey": BASE64.encode(noise_key),
            "signedIdentityKey": BASE64.encode(identity_key),
            "advSecretKey": BASE64.encode(adv_secret),
            "registrationId": registration_id,
            "registered": false,
            "createdAt": Utc::now().to_rfc3339(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the primary credentials document.
    pub async fn creds(&self) -> Value {
        self.creds.read().await.clone()
    }

    /// Whether the session completed pairing.
    pub async fn is_registered(&self) -> bool {
        self.creds
            .read()
            .await
            .get("registered")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Merge a partial credentials update and write it through to disk.
    pub async fn apply_update(&self, update: &Value) -> Result<()> {
        let Value::Object(fields) = update else {
            return Err(GatewayError::Validation(
                "credentials update must be a JSON object".to_string(),
            ));
        };

        let mut creds = self.creds.write().await;
        if let Value::Object(current) = &mut *creds {
            merge_fields(current, fields);
        }
        write_atomic(
            &env::creds_file_path(&self.dir),
            &serde_json::to_vec_pretty(&*creds)?,
        )
        .await
    }

    /// Write an auxiliary key file (`<category>-<id>.json`); `None` deletes it.
    pub async fn write_key(&self, category: &str, id: &str, value: Option<&Value>) -> Result<()> {
        let path = self.key_path(category, id)?;
        match value {
            Some(value) => write_atomic(&path, &serde_json::to_vec(value)?).await,
            None => match async_fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Read an auxiliary key file.
    pub async fn read_key(&self, category: &str, id: &str) -> Result<Option<Value>> {
        let path = self.key_path(category, id)?;
        match async_fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn key_path(&self, category: &str, id: &str) -> Result<PathBuf> {
        let file_name = format!("{}-{}.json", category, id).replace(['/', '\\', ':'], "_");
        if file_name == env::session::CREDS_FILE_NAME || file_name.starts_with('.') {
            return Err(GatewayError::Validation(format!(
                "reserved key file name '{}'",
                file_name
            )));
        }
        Ok(self.dir.join(file_name))
    }
}

fn merge_fields(current: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (name, value) in update {
        match (current.get_mut(name), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_fields(existing, nested),
            _ => {
                current.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Write through a temp file and rename so readers never see a torn file.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GatewayError::Persistence(format!("Invalid file path {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let mut file = async_fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = async_fs::rename(&temp_path, path).await {
        let _ = async_fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
