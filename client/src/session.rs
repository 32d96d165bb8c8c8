use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::TOKEN_EXPIRY_BUFFER_SECS;

pub const TOKENS_FILE: &str = "tokens.json";

/// Token set returned by the identity provider, stamped with when we got it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
    /// Milliseconds since the Unix epoch.
    pub obtained_at: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Tokens {
    pub fn expires_at_ms(&self) -> i64 {
        self.obtained_at
            .saturating_add(self.expires_in.saturating_mul(1000))
    }
}

/// The bearer credential attached to outgoing requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at_ms: i64,
}

impl Credential {
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Shared, observable credential store. Cloning shares the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    tokens: watch::Sender<Option<Tokens>>,
    path: Option<PathBuf>,
}

impl Session {
    /// In-memory session with no persistence.
    pub fn new(tokens: Option<Tokens>) -> Self {
        let (tx, _) = watch::channel(tokens);
        Self {
            inner: Arc::new(SessionInner {
                tokens: tx,
                path: None,
            }),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Session persisted to `tokens.json` under `state_dir`. A missing or
    /// unreadable file starts the session signed out.
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(TOKENS_FILE);
        let tokens = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Tokens>(&bytes) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "ignoring unreadable token file");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to read token file");
                None
            }
        };
        let (tx, _) = watch::channel(tokens);
        Self {
            inner: Arc::new(SessionInner {
                tokens: tx,
                path: Some(path),
            }),
        }
    }

    pub fn tokens(&self) -> Option<Tokens> {
        self.inner.tokens.borrow().clone()
    }

    pub fn set_tokens(&self, tokens: Tokens) -> io::Result<()> {
        self.inner.tokens.send_replace(Some(tokens.clone()));
        debug!("session tokens updated");
        match &self.inner.path {
            Some(path) => write_json(path, &tokens),
            None => Ok(()),
        }
    }

    pub fn clear(&self) -> io::Result<()> {
        self.inner.tokens.send_replace(None);
        debug!("session tokens cleared");
        match &self.inner.path {
            Some(path) => match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Notified whenever tokens are set or cleared.
    pub fn subscribe(&self) -> watch::Receiver<Option<Tokens>> {
        self.inner.tokens.subscribe()
    }

    pub fn current_credential(&self) -> Option<Credential> {
        self.credential_at(chrono::Utc::now().timestamp_millis())
    }

    /// Credential valid at `now_ms`. Tokens inside the expiry buffer count as
    /// absent so a request never races the expiry.
    pub fn credential_at(&self, now_ms: i64) -> Option<Credential> {
        let guard = self.inner.tokens.borrow();
        let tokens = guard.as_ref()?;
        let expires_at_ms = tokens.expires_at_ms();
        if now_ms >= expires_at_ms - TOKEN_EXPIRY_BUFFER_SECS * 1000 {
            return None;
        }
        Some(Credential {
            access_token: tokens.access_token.clone(),
            expires_at_ms,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.current_credential().is_some()
    }

    /// `sub` claim of the id token (or access token). Signatures are not
    /// checked; this only keys per-user preferences.
    pub fn user_sub(&self) -> Option<String> {
        let guard = self.inner.tokens.borrow();
        let tokens = guard.as_ref()?;
        let jwt = if tokens.id_token.is_empty() {
            &tokens.access_token
        } else {
            &tokens.id_token
        };
        jwt_sub(jwt)
    }
}

fn jwt_sub(jwt: &str) -> Option<String> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(path, bytes)
}
