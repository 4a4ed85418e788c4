//! Access token handling for HAT Core.
//!
//! [`AuthSession`] owns the current HAT access token. Any component that sees
//! HTTP 401 calls [`AuthSession::note_unauthorized`] before surfacing the
//! error, so later requests in the same cycle short-circuit instead of
//! repeating doomed calls.
//!
//! The token is persisted through a [`SecureStore`], which the host backs with
//! its keychain. Two implementations ship here: an in-memory one and a JSON
//! file one for hosts without a keychain.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{HatError, HatResult};
use crate::models::AuthToken;

pub const TOKEN_KEY: &str = "user_token";
pub const TOKEN_OBTAINED_AT_KEY: &str = "user_token_obtained_at";
pub const LOGIN_STATE_KEY: &str = "login_state";
pub const HAT_DOMAIN_KEY: &str = "hat_domain";

/// Domains a HAT address may live under
pub const ALLOWED_HAT_DOMAINS: &[&str] = &["hubofallthings.net", "warwickhat.net", "hubat.net"];

/// Opaque secure key-value store supplied by the host.
pub trait SecureStore: Send + Sync {
    fn get(&self, key: &str) -> HatResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> HatResult<()>;
    fn remove(&self, key: &str) -> HatResult<()>;
}

/// Secure store kept in process memory (tests, ephemeral sessions)
#[derive(Debug, Default)]
pub struct MemorySecureStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, key: &str) -> HatResult<Option<String>> {
        Ok(self.values.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> HatResult<()> {
        self.values.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> HatResult<()> {
        self.values.lock()?.remove(key);
        Ok(())
    }
}

/// Secure store persisted as a JSON object in a single file.
///
/// The file is rewritten on every change. Hosts with a platform keychain
/// should implement [`SecureStore`] over it instead.
pub struct FileSecureStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileSecureStore {
    pub fn open<P: AsRef<Path>>(path: P) -> HatResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &HashMap<String, String>) -> HatResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(values)?)?;
        Ok(())
    }
}

impl SecureStore for FileSecureStore {
    fn get(&self, key: &str) -> HatResult<Option<String>> {
        Ok(self.values.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> HatResult<()> {
        let mut values = self.values.lock()?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> HatResult<()> {
        let mut values = self.values.lock()?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Persisted login state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    LoggedIn,
    Expired,
}

impl LoginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginState::LoggedOut => "false",
            LoginState::LoggedIn => "true",
            LoginState::Expired => "expired",
        }
    }

    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("true") => LoginState::LoggedIn,
            Some("expired") => LoginState::Expired,
            _ => LoginState::LoggedOut,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenState {
    token: Option<AuthToken>,
    expired: bool,
}

/// Holder of the current access token.
pub struct AuthSession {
    state: RwLock<TokenState>,
    secure_store: Arc<dyn SecureStore>,
}

impl AuthSession {
    /// Create an empty session (no token)
    pub fn new(secure_store: Arc<dyn SecureStore>) -> Self {
        Self {
            state: RwLock::new(TokenState {
                token: None,
                expired: false,
            }),
            secure_store,
        }
    }

    /// Rebuild the session from the last persisted token.
    pub fn restore(secure_store: Arc<dyn SecureStore>) -> HatResult<Self> {
        let value = secure_store.get(TOKEN_KEY)?;
        let obtained_at = secure_store
            .get(TOKEN_OBTAINED_AT_KEY)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let login_state = LoginState::parse(secure_store.get(LOGIN_STATE_KEY)?.as_deref());

        let token = value.filter(|v| !v.is_empty()).map(|value| AuthToken {
            value,
            obtained_at: obtained_at.unwrap_or_else(Utc::now),
        });

        tracing::debug!(
            has_token = token.is_some(),
            login_state = login_state.as_str(),
            "Restored auth session"
        );

        Ok(Self {
            state: RwLock::new(TokenState {
                expired: token.is_none() || login_state == LoginState::Expired,
                token,
            }),
            secure_store,
        })
    }

    /// The current token value, or `Unauthorized` when expired or absent.
    pub fn current_token(&self) -> HatResult<String> {
        let state = self.state.read()?;
        match (&state.token, state.expired) {
            (Some(token), false) => Ok(token.value.clone()),
            (Some(_), true) => Err(HatError::Unauthorized("access token expired".to_string())),
            (None, _) => Err(HatError::Unauthorized("not logged in".to_string())),
        }
    }

    /// Snapshot of the whole token
    pub fn token(&self) -> HatResult<Option<AuthToken>> {
        Ok(self.state.read()?.token.clone())
    }

    pub fn is_valid(&self) -> bool {
        self.current_token().is_ok()
    }

    /// Mark the token expired after the HAT answered 401.
    pub fn note_unauthorized(&self) {
        let newly_expired = match self.state.write() {
            Ok(mut state) => {
                let was = state.expired;
                state.expired = true;
                !was
            }
            Err(_) => false,
        };

        if newly_expired {
            tracing::warn!("Access token rejected, re-authentication required");
            if let Err(e) = self
                .secure_store
                .set(LOGIN_STATE_KEY, LoginState::Expired.as_str())
            {
                tracing::error!(error = %e, "Failed to persist expired login state");
            }
        }
    }

    /// Install a new token and persist it.
    pub fn refresh(&self, new_token: impl Into<String>) -> HatResult<()> {
        let token = AuthToken::new(new_token);
        if token.value.trim().is_empty() {
            return Err(HatError::validation("token", "token must not be empty"));
        }

        self.secure_store.set(TOKEN_KEY, &token.value)?;
        self.secure_store
            .set(TOKEN_OBTAINED_AT_KEY, &token.obtained_at.to_rfc3339())?;
        self.secure_store
            .set(LOGIN_STATE_KEY, LoginState::LoggedIn.as_str())?;

        let mut state = self.state.write()?;
        *state = TokenState {
            token: Some(token),
            expired: false,
        };
        tracing::info!("Access token refreshed");
        Ok(())
    }

    /// Forget the token and every persisted login key.
    pub fn log_out(&self) -> HatResult<()> {
        {
            let mut state = self.state.write()?;
            *state = TokenState {
                token: None,
                expired: false,
            };
        }
        for key in [TOKEN_KEY, TOKEN_OBTAINED_AT_KEY, HAT_DOMAIN_KEY] {
            self.secure_store.remove(key)?;
        }
        self.secure_store
            .set(LOGIN_STATE_KEY, LoginState::LoggedOut.as_str())?;
        Ok(())
    }

    pub fn login_state(&self) -> HatResult<LoginState> {
        Ok(LoginState::parse(
            self.secure_store.get(LOGIN_STATE_KEY)?.as_deref(),
        ))
    }
}

/// Check that a HAT address belongs to a known HAT provider.
///
/// The first label is the user's name; the rest must be an allowed domain,
/// e.g. `alice.hubofallthings.net`.
pub fn verify_hat_domain(address: &str) -> bool {
    let address = address.trim();
    match address.split_once('.') {
        Some((user, domain)) if !user.is_empty() => ALLOWED_HAT_DOMAINS.contains(&domain),
        _ => false,
    }
}
