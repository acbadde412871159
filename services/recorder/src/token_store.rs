//! Access-token store shared by the poller, the resolver and the refresher.
//!
//! Readers take cheap snapshots of the current credential. Refreshes are
//! serialized behind an async gate; a caller that saw a stale credential only
//! triggers a fetch if nobody refreshed it in the meantime.

use crate::helix::{ApiError, TokenSource};
use backoff::backoff::{Backoff, Constant};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that can occur while refreshing the credential.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token refresh failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ApiError },
}

/// Snapshot of the current bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    /// Bearer credential
    pub value: String,
    /// When the credential was acquired
    pub acquired_at: DateTime<Utc>,
    /// Incremented on every successful refresh
    pub generation: u64,
}

/// Owner of the bearer credential.
pub struct TokenStore {
    source: Arc<dyn TokenSource>,
    state: RwLock<Option<TokenState>>,
    refresh_gate: Mutex<()>,
    retry_delay: Duration,
    max_attempts: Option<u32>,
}

impl TokenStore {
    /// Create a store that retries failed refreshes forever.
    pub fn new(source: Arc<dyn TokenSource>, retry_delay: Duration) -> Self {
        Self {
            source,
            state: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            retry_delay,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` failed requests instead of retrying forever.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Current credential, if one has been acquired.
    pub fn current(&self) -> Option<TokenState> {
        self.state.read().clone()
    }

    /// Current credential, acquiring one first if none exists yet.
    pub async fn current_or_refresh(&self) -> Result<TokenState, TokenError> {
        if let Some(state) = self.current() {
            return Ok(state);
        }

        let _gate = self.refresh_gate.lock().await;
        if let Some(state) = self.current() {
            return Ok(state);
        }
        self.fetch_and_store().await
    }

    /// Unconditionally acquire a new credential.
    pub async fn refresh(&self) -> Result<TokenState, TokenError> {
        let _gate = self.refresh_gate.lock().await;
        self.fetch_and_store().await
    }

    /// Replace `stale` unless another caller already replaced it.
    pub async fn refresh_if_stale(&self, stale: &TokenState) -> Result<TokenState, TokenError> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(state) = self.current() {
            if state.generation != stale.generation {
                return Ok(state);
            }
        }
        self.fetch_and_store().await
    }

    /// Must be called with the refresh gate held.
    async fn fetch_and_store(&self) -> Result<TokenState, TokenError> {
        let mut backoff = Constant::new(self.retry_delay);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match self.source.fetch_token().await {
                Ok(token) => {
                    let expires_in = token.expires_in;
                    let next = {
                        let mut state = self.state.write();
                        let next = TokenState {
                            value: token.value,
                            acquired_at: Utc::now(),
                            generation: state.as_ref().map_or(1, |s| s.generation + 1),
                        };
                        *state = Some(next.clone());
                        next
                    };

                    metrics::counter!("recorder.token.refreshes").increment(1);
                    info!(
                        generation = next.generation,
                        attempts = attempts,
                        expires_in_secs = expires_in.map(|d| d.as_secs()),
                        "Access token refreshed"
                    );

                    return Ok(next);
                }
                Err(e) => {
                    if let Some(max) = self.max_attempts {
                        if attempts >= max {
                            error!(attempts = attempts, error = %e, "Giving up on token refresh");
                            return Err(TokenError::Exhausted { attempts, last: e });
                        }
                    }

                    let delay = backoff.next_backoff().unwrap_or(self.retry_delay);
                    warn!(
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Token request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Force a refresh every `interval` until `cancel` fires.
    ///
    /// Cancellation also interrupts a refresh that is still retrying.
    pub async fn run_refresher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.refresh() => {
                    if let Err(e) = result {
                        error!(error = %e, "Scheduled token refresh failed");
                    }
                }
            }
        }

        info!("Token refresher stopped");
    }
}
