//! OAuth access tokens for the Google Sheets API.
//!
//! A service account key mints short-lived tokens through the JWT bearer
//! grant; tokens are cached and re-minted shortly before they expire. A fixed
//! token from the environment is still accepted for quick local runs.

use crate::config::SheetAuth;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::Utc;
use reqwest::Client;
use ring::{
    rand::SystemRandom,
    signature::{RSA_PKCS1_SHA256, RsaKeyPair},
};
use serde::Deserialize;
use serde_json::json;
use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("service account key unreadable: {0}")]
    KeyFile(String),
    #[error("service account private key rejected: {0}")]
    InvalidKey(String),
    #[error("token request failed: {0}")]
    Request(String),
}

/// The fields of a downloaded service account JSON key that token minting needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AuthError::KeyFile(format!("{}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AuthError> {
        serde_json::from_str(raw).map_err(|err| AuthError::KeyFile(err.to_string()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct ServiceAccount {
    key: ServiceAccountKey,
    scope: String,
    signer: RsaKeyPair,
    rng: SystemRandom,
}

impl ServiceAccount {
    fn new(key: ServiceAccountKey, scope: &str) -> Result<Self, AuthError> {
        let der = pem_body(&key.private_key)?;
        let signer =
            RsaKeyPair::from_pkcs8(&der).map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        Ok(Self {
            key,
            scope: scope.to_string(),
            signer,
            rng: SystemRandom::new(),
        })
    }

    /// Signed RS256 JWT asserting this account for `scope`.
    fn assertion(&self, issued_at: i64) -> Result<String, AuthError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = json!({
            "iss": self.key.client_email,
            "scope": self.scope,
            "aud": self.key.token_uri,
            "iat": issued_at,
            "exp": issued_at + ASSERTION_LIFETIME_SECS,
        });
        let claims = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{header}.{claims}");

        let mut signature = vec![0; self.signer.public().modulus_len()];
        self.signer
            .sign(
                &RSA_PKCS1_SHA256,
                &self.rng,
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|_| AuthError::InvalidKey("signing failed".to_string()))?;
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }
}

/// DER bytes inside a PEM block.
fn pem_body(pem: &str) -> Result<Vec<u8>, AuthError> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(AuthError::InvalidKey("empty private key".to_string()));
    }
    STANDARD
        .decode(body)
        .map_err(|err| AuthError::InvalidKey(err.to_string()))
}

enum Source {
    Fixed(String),
    ServiceAccount(Box<ServiceAccount>),
}

pub struct TokenProvider {
    http: Client,
    source: Source,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Fixed(_) => "fixed".to_string(),
            Source::ServiceAccount(account) => account.key.client_email.clone(),
        };
        f.debug_struct("TokenProvider")
            .field("source", &source)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            source: Source::Fixed(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub fn service_account(
        http: Client,
        key: ServiceAccountKey,
        scope: &str,
    ) -> Result<Self, AuthError> {
        let account = ServiceAccount::new(key, scope)?;
        Ok(Self {
            http,
            source: Source::ServiceAccount(Box::new(account)),
            cached: Mutex::new(None),
        })
    }

    pub fn from_settings(http: Client, auth: &SheetAuth) -> Result<Self, AuthError> {
        match auth {
            SheetAuth::Token(token) => Ok(Self::fixed(token.clone())),
            SheetAuth::ServiceAccount(path) => {
                let key = ServiceAccountKey::from_file(path)?;
                info!(target = "sorteio.auth", account = %key.client_email, "using service account credentials");
                Self::service_account(http, key, SHEETS_SCOPE)
            }
        }
    }

    /// Whether a rejected token can be replaced by minting a new one.
    pub fn can_refresh(&self) -> bool {
        matches!(self.source, Source::ServiceAccount(_))
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        let account = match &self.source {
            Source::Fixed(token) => return Ok(token.clone()),
            Source::ServiceAccount(account) => account,
        };
        // Held across the mint so concurrent callers share one token request.
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + REFRESH_MARGIN
        {
            return Ok(token.value.clone());
        }
        let token = self.mint(account).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drops the cached token so the next call mints a fresh one.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn mint(&self, account: &ServiceAccount) -> Result<CachedToken, AuthError> {
        let assertion = account.assertion(Utc::now().timestamp())?;
        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self
            .http
            .post(&account.key.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Request(format!("HTTP {status}: {body}")));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;
        let lifetime = Duration::from_secs(payload.expires_in.unwrap_or(3600));
        debug!(target = "sorteio.auth", expires_in = lifetime.as_secs(), "access token minted");
        Ok(CachedToken {
            value: payload.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}
