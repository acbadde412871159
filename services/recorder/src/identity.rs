//! Maps configured account identifiers to canonical numeric IDs.
//!
//! Numeric identifiers are canonical already. Login names are looked up in
//! the run-local map, then the persistent cache, and only then remotely; a
//! successful remote lookup is written back to the cache.

use crate::helix::{ApiError, StreamsApi};
use crate::rate_limiter::RateLimiter;
use crate::store::{SqliteStore, StoreError};
use crate::token_store::{TokenError, TokenStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// A watched account as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountIdentifier {
    /// Canonical numeric ID
    Id(String),
    /// Login name, lower-cased
    Login(String),
}

impl AccountIdentifier {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();

        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
            AccountIdentifier::Id(raw.to_string())
        } else {
            AccountIdentifier::Login(raw.to_lowercase())
        }
    }
}

impl fmt::Display for AccountIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountIdentifier::Id(id) => write!(f, "{}", id),
            AccountIdentifier::Login(login) => write!(f, "{}", login),
        }
    }
}

/// Errors that can occur while resolving an identifier.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No account named {0}")]
    NotFound(String),

    #[error("Identity lookup failed: {0}")]
    Api(#[from] ApiError),

    #[error("No access token: {0}")]
    Token(#[from] TokenError),
}

/// Persistent login-name to ID cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityCache: Send + Sync {
    async fn lookup(&self, login: &str) -> Result<Option<String>, StoreError>;

    async fn remember(&self, login: &str, user_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl IdentityCache for SqliteStore {
    async fn lookup(&self, login: &str) -> Result<Option<String>, StoreError> {
        self.cached_user_id(login).await
    }

    async fn remember(&self, login: &str, user_id: &str) -> Result<(), StoreError> {
        self.save_user_id(login, user_id).await
    }
}

/// Outcome of resolving a whole identifier list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical IDs, deduplicated, in configuration order
    pub ids: Vec<String>,
    /// Identifiers that failed transiently and should be retried
    pub pending: Vec<AccountIdentifier>,
    /// Identifiers with no matching account
    pub missing: Vec<AccountIdentifier>,
    /// Identifiers the endpoint refused outright; retrying cannot help
    pub rejected: Vec<AccountIdentifier>,
}

/// Resolves identifiers to canonical IDs.
pub struct UserResolver {
    api: Arc<dyn StreamsApi>,
    cache: Arc<dyn IdentityCache>,
    tokens: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    resolved: Mutex<HashMap<String, String>>,
}

impl UserResolver {
    pub fn new(
        api: Arc<dyn StreamsApi>,
        cache: Arc<dyn IdentityCache>,
        tokens: Arc<TokenStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            api,
            cache,
            tokens,
            limiter,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one identifier to its canonical ID.
    #[instrument(skip(self), fields(identifier = %identifier))]
    pub async fn resolve(&self, identifier: &AccountIdentifier) -> Result<String, ResolveError> {
        let login = match identifier {
            AccountIdentifier::Id(id) => return Ok(id.clone()),
            AccountIdentifier::Login(login) => login.to_lowercase(),
        };

        if let Some(id) = self.resolved.lock().get(&login).cloned() {
            return Ok(id);
        }

        match self.cache.lookup(&login).await {
            Ok(Some(id)) => {
                debug!(user_id = %id, "Identity served from cache");
                self.resolved.lock().insert(login, id.clone());
                return Ok(id);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Identity cache read failed, asking remote"),
        }

        let id = self
            .lookup_remote(&login)
            .await?
            .ok_or_else(|| ResolveError::NotFound(login.clone()))?;

        if let Err(e) = self.cache.remember(&login, &id).await {
            warn!(error = %e, "Failed to cache resolved identity");
        }

        info!(user_id = %id, "Resolved account");
        self.resolved.lock().insert(login, id.clone());

        Ok(id)
    }

    /// Resolve a list, sorting failures into retryable, missing and rejected.
    ///
    /// Credential failures stay retryable: they say nothing about the
    /// identifier itself.
    pub async fn resolve_all(&self, identifiers: &[AccountIdentifier]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut seen = HashSet::new();

        for identifier in identifiers {
            match self.resolve(identifier).await {
                Ok(id) => {
                    if seen.insert(id.clone()) {
                        resolution.ids.push(id);
                    }
                }
                Err(ResolveError::NotFound(_)) => {
                    warn!(identifier = %identifier, "Account not found, dropping it for this run");
                    resolution.missing.push(identifier.clone());
                }
                Err(ResolveError::Api(e)) if !e.is_transient() && !matches!(e, ApiError::Unauthorized) => {
                    warn!(identifier = %identifier, error = %e, "Account lookup rejected, dropping it for this run");
                    resolution.rejected.push(identifier.clone());
                }
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "Could not resolve account, will retry");
                    resolution.pending.push(identifier.clone());
                }
            }
        }

        resolution
    }

    async fn lookup_remote(&self, login: &str) -> Result<Option<String>, ResolveError> {
        let token = self.tokens.current_or_refresh().await?;

        self.limiter.wait().await;
        match self.api.user_id_by_login(login, &token.value).await {
            Err(ApiError::Unauthorized) => {
                warn!("Access token rejected during identity lookup, refreshing");
                let fresh = self.tokens.refresh_if_stale(&token).await?;

                self.limiter.wait().await;
                Ok(self.api.user_id_by_login(login, &fresh.value).await?)
            }
            other => Ok(other?),
        }
    }
}
