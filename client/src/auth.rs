//! PKCE authorization-code login against the OIDC provider.
//!
//! The browser round-trip is external: `begin_login` hands back the URL to
//! open, and `handle_callback` finishes the exchange with the returned code.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::OidcConfig;
use crate::session::{Session, Tokens};

const VERIFIER_LEN: usize = 64;
const VERIFIER_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._~";
const SCOPES: &str = "openid email profile";
pub const VERIFIER_FILE: &str = "pkce_verifier";
pub const CODE_USED_FILE: &str = "code_used";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity provider is not configured (OIDC_DOMAIN/OIDC_CLIENT_ID/OIDC_REDIRECT_URI)")]
    MissingConfig,
    #[error("missing PKCE verifier; start the login again")]
    MissingVerifier,
    #[error("token exchange failed: {status}{detail}")]
    TokenExchange { status: u16, detail: String },
    #[error("token request failed: {0}")]
    Transport(String),
    #[error("invalid identity provider URL: {0}")]
    InvalidUrl(String),
    #[error("auth state storage failed: {0}")]
    Storage(#[from] io::Error),
    #[error("random source unavailable: {0}")]
    Random(String),
}

/// Random code verifier drawn from the RFC 7636 unreserved set.
pub fn generate_verifier() -> Result<String, AuthError> {
    let mut bytes = [0u8; VERIFIER_LEN];
    getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Random(e.to_string()))?;
    Ok(bytes
        .iter()
        .map(|b| VERIFIER_ALPHABET[*b as usize % VERIFIER_ALPHABET.len()] as char)
        .collect())
}

/// S256 challenge: base64url(sha256(verifier)) without padding.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn authorize_url(config: &OidcConfig, challenge: &str) -> Result<Url, AuthError> {
    let mut url = Url::parse(&format!("{}/oauth2/authorize", config.domain))
        .map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_uri)
        .append_pair("scope", SCOPES)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", challenge);
    Ok(url)
}

pub fn logout_url(config: &OidcConfig) -> Option<Url> {
    let logout_uri = config.logout_uri.as_deref()?;
    let mut url = Url::parse(&format!("{}/logout", config.domain)).ok()?;
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("logout_uri", logout_uri);
    Some(url)
}

/// PKCE verifier and one-shot code marker, kept beside the token file.
#[derive(Debug, Clone)]
pub struct PkceStore {
    dir: PathBuf,
}

impl PkceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn verifier_path(&self) -> PathBuf {
        self.dir.join(VERIFIER_FILE)
    }

    fn code_used_path(&self) -> PathBuf {
        self.dir.join(CODE_USED_FILE)
    }

    pub fn save_verifier(&self, verifier: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.verifier_path(), verifier)
    }

    pub fn verifier(&self) -> Option<String> {
        fs::read_to_string(self.verifier_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn clear_verifier(&self) -> io::Result<()> {
        remove_if_present(&self.verifier_path())
    }

    pub fn code_used(&self) -> bool {
        self.code_used_path().exists()
    }

    pub fn mark_code_used(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.code_used_path(), b"1")
    }

    pub fn clear_code_used(&self) -> io::Result<()> {
        remove_if_present(&self.code_used_path())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Starts a login: stores a fresh verifier and returns the URL to open.
pub fn begin_login(config: &OidcConfig, store: &PkceStore) -> Result<Url, AuthError> {
    store.clear_code_used()?;
    let verifier = generate_verifier()?;
    let url = authorize_url(config, &code_challenge(&verifier))?;
    store.save_verifier(&verifier)?;
    info!("login started; waiting for authorization code");
    Ok(url)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: i64,
}

#[derive(Deserialize, Default)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenErrorBody {
    fn detail(&self) -> String {
        match (&self.error, &self.error_description) {
            (Some(error), Some(description)) => format!(" - {error}: {description}"),
            (Some(error), None) => format!(" - {error}"),
            _ => String::new(),
        }
    }
}

/// Exchanges an authorization code for tokens. A code is redeemed at most
/// once; repeated callbacks are no-ops.
pub async fn handle_callback(
    http: &reqwest::Client,
    config: &OidcConfig,
    store: &PkceStore,
    session: &Session,
    code: &str,
) -> Result<(), AuthError> {
    if store.code_used() {
        return Ok(());
    }
    if session.tokens().is_some() {
        store.mark_code_used()?;
        store.clear_verifier()?;
        return Ok(());
    }

    let verifier = store.verifier().ok_or(AuthError::MissingVerifier)?;
    store.mark_code_used()?;

    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", config.client_id.as_str()),
        ("code", code),
        ("redirect_uri", config.redirect_uri.as_str()),
        ("code_verifier", verifier.as_str()),
    ];
    let result = http
        .post(format!("{}/oauth2/token", config.domain))
        .form(&form)
        .send()
        .await;
    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            store.clear_code_used()?;
            return Err(AuthError::Transport(e.to_string()));
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp.json::<TokenErrorBody>().await.unwrap_or_default();
        store.clear_code_used()?;
        warn!(status = status.as_u16(), "token exchange rejected");
        return Err(AuthError::TokenExchange {
            status: status.as_u16(),
            detail: body.detail(),
        });
    }

    let token = match resp.json::<TokenResponse>().await {
        Ok(token) => token,
        Err(e) => {
            store.clear_code_used()?;
            return Err(AuthError::Transport(e.to_string()));
        }
    };
    session.set_tokens(Tokens {
        access_token: token.access_token,
        id_token: token.id_token,
        refresh_token: token.refresh_token,
        token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_in: token.expires_in,
        obtained_at: chrono::Utc::now().timestamp_millis(),
    })?;
    store.clear_verifier()?;
    info!("login completed");
    Ok(())
}

/// Signs out locally and returns the provider logout URL when configured.
pub fn logout(
    config: Option<&OidcConfig>,
    store: &PkceStore,
    session: &Session,
) -> Result<Option<Url>, AuthError> {
    session.clear()?;
    store.clear_verifier()?;
    store.clear_code_used()?;
    info!("logged out");
    Ok(config.and_then(logout_url))
}
