//! Locally persisted OAuth credentials.
//!
//! Credentials are written by external CLIs (gemini-cli, Codex) and refreshed
//! out-of-band; the store watches the file's mtime and reloads when another
//! writer touched it. Reads are guarded by a mutex and writes go through the
//! same lock, preserving the single-writer invariant.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// On-disk token record: `{access_token, refresh_token, token_type,
/// expiry_date (ms since epoch)}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl OAuthCredentials {
    /// Whether the access token is expired or inside the refresh buffer.
    /// A missing expiry means the token does not expire.
    pub fn is_expired(&self, buffer_seconds: i64) -> bool {
        match self.expiry_date {
            Some(expiry_ms) => {
                let now_ms = Utc::now().timestamp_millis();
                now_ms >= expiry_ms - buffer_seconds * 1000
            }
            None => false,
        }
    }
}

/// Layout of the credential file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFormat {
    /// gemini-cli `oauth_creds.json`: the token record at the top level.
    GeminiCli,
    /// Codex `auth.json`: tokens nested under `tokens`, with an optional
    /// `OPENAI_API_KEY` fallback.
    CodexAuthJson,
}

struct CachedCredentials {
    mtime: Option<SystemTime>,
    credentials: OAuthCredentials,
}

/// Mutex-guarded credential file access with mtime-based reload.
pub struct OAuthFileStore {
    path: PathBuf,
    format: CredentialFormat,
    cache: Mutex<Option<CachedCredentials>>,
}

impl OAuthFileStore {
    pub fn new(path: impl Into<PathBuf>, format: CredentialFormat) -> Self {
        Self {
            path: path.into(),
            format,
            cache: Mutex::new(None),
        }
    }

    /// `~/.gemini/oauth_creds.json`
    pub fn gemini_default() -> Result<Self, ProxyError> {
        let home = dirs::home_dir().ok_or_else(|| ProxyError::Configuration {
            message: "cannot determine home directory".to_string(),
        })?;
        Ok(Self::new(
            home.join(".gemini").join("oauth_creds.json"),
            CredentialFormat::GeminiCli,
        ))
    }

    /// `~/.codex/auth.json`
    pub fn codex_default() -> Result<Self, ProxyError> {
        let home = dirs::home_dir().ok_or_else(|| ProxyError::Configuration {
            message: "cannot determine home directory".to_string(),
        })?;
        Ok(Self::new(
            home.join(".codex").join("auth.json"),
            CredentialFormat::CodexAuthJson,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load credentials, re-reading the file when its mtime changed since the
    /// last read (another process may have refreshed the token).
    pub fn load(&self) -> Result<OAuthCredentials, ProxyError> {
        let mut cache = self.cache.lock();
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        if let Some(cached) = cache.as_ref() {
            if cached.mtime.is_some() && cached.mtime == mtime {
                return Ok(cached.credentials.clone());
            }
            debug!(path = %self.path.display(), "credential file changed on disk, reloading");
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|e| ProxyError::Authentication {
            message: format!(
                "cannot read OAuth credentials at {}: {e}",
                self.path.display()
            ),
        })?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| ProxyError::Authentication {
                message: format!("malformed OAuth credentials: {e}"),
            })?;
        let credentials = self.parse(&value)?;

        *cache = Some(CachedCredentials {
            mtime,
            credentials: credentials.clone(),
        });
        Ok(credentials)
    }

    /// Persist refreshed credentials. Holding the cache lock keeps writers
    /// serialized with readers.
    pub fn save(&self, credentials: &OAuthCredentials) -> Result<(), ProxyError> {
        let mut cache = self.cache.lock();

        let serialized = match self.format {
            CredentialFormat::GeminiCli => serde_json::to_string_pretty(credentials),
            CredentialFormat::CodexAuthJson => {
                serde_json::to_string_pretty(&serde_json::json!({ "tokens": credentials }))
            }
        }
        .map_err(|e| ProxyError::internal(format!("cannot serialize credentials: {e}")))?;

        std::fs::write(&self.path, serialized).map_err(|e| ProxyError::internal(format!(
            "cannot write OAuth credentials at {}: {e}",
            self.path.display()
        )))?;

        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        *cache = Some(CachedCredentials {
            mtime,
            credentials: credentials.clone(),
        });
        Ok(())
    }

    fn parse(&self, value: &Value) -> Result<OAuthCredentials, ProxyError> {
        let record = match self.format {
            CredentialFormat::GeminiCli => value.clone(),
            CredentialFormat::CodexAuthJson => match value.get("tokens") {
                Some(tokens) => tokens.clone(),
                None => {
                    // An API key entry is an accepted fallback shape.
                    if let Some(key) = value.get("OPENAI_API_KEY").and_then(Value::as_str) {
                        return Ok(OAuthCredentials {
                            access_token: key.to_string(),
                            refresh_token: None,
                            token_type: Some("bearer".to_string()),
                            expiry_date: None,
                        });
                    }
                    warn!("auth.json carries neither tokens nor OPENAI_API_KEY");
                    return Err(ProxyError::Authentication {
                        message: "auth.json missing tokens.access_token and OPENAI_API_KEY"
                            .to_string(),
                    });
                }
            },
        };

        serde_json::from_value(record).map_err(|e| ProxyError::Authentication {
            message: format!("malformed OAuth credential record: {e}"),
        })
    }
}
