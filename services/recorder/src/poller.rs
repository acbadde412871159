//! Live-status polling loop.
//!
//! Each cycle walks the states of [`PollState`]: take a token snapshot, wait
//! for the rate limiter, issue one status query per batch, then sleep. A 401
//! forces a single token refresh and one retry of the same batch; any other
//! failure abandons the cycle and the loop carries on after the usual delay
//! plus the error delay.

use crate::coordinator::RecordingCoordinator;
use crate::helix::{ApiError, LiveStream, StreamsApi};
use crate::identity::{AccountIdentifier, UserResolver};
use crate::rate_limiter::RateLimiter;
use crate::token_store::{TokenState, TokenStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where the poller is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    RequestTokenSnapshot,
    RateLimitWait,
    IssueBatchQuery,
    Sleep,
}

/// Result of one status query.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Accounts in the batch that are live; empty if none
    Live(Vec<LiveStream>),
    /// The credential was rejected
    Unauthorized,
    /// Transport or server failure
    Failed(ApiError),
}

impl From<Result<Vec<LiveStream>, ApiError>> for BatchOutcome {
    fn from(result: Result<Vec<LiveStream>, ApiError>) -> Self {
        match result {
            Ok(streams) => BatchOutcome::Live(streams),
            Err(ApiError::Unauthorized) => BatchOutcome::Unauthorized,
            Err(e) => BatchOutcome::Failed(e),
        }
    }
}

/// What one cycle produced.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub queried: usize,
    pub live: Vec<LiveStream>,
    /// The cycle was abandoned after an error
    pub failed: bool,
}

pub struct LivePoller {
    api: Arc<dyn StreamsApi>,
    tokens: Arc<TokenStore>,
    limiter: Arc<RateLimiter>,
    coordinator: Arc<RecordingCoordinator>,
    max_batch_size: usize,
    interval: Duration,
    error_delay: Duration,
    state: Mutex<PollState>,
}

impl LivePoller {
    pub fn new(
        api: Arc<dyn StreamsApi>,
        tokens: Arc<TokenStore>,
        limiter: Arc<RateLimiter>,
        coordinator: Arc<RecordingCoordinator>,
        max_batch_size: usize,
        interval: Duration,
        error_delay: Duration,
    ) -> Self {
        Self {
            api,
            tokens,
            limiter,
            coordinator,
            max_batch_size: max_batch_size.max(1),
            interval,
            error_delay,
            state: Mutex::new(PollState::Idle),
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.lock()
    }

    fn transition(&self, next: PollState) {
        let mut state = self.state.lock();
        trace!(from = ?*state, to = ?next, "Poll state");
        *state = next;
    }

    /// Live streams among `user_ids`, or nothing if the cycle failed.
    pub async fn poll_once(&self, user_ids: &[String]) -> Vec<LiveStream> {
        self.poll_cycle(user_ids).await.live
    }

    /// Query every non-active account once.
    pub async fn poll_cycle(&self, user_ids: &[String]) -> CycleReport {
        let active: HashSet<String> = self.coordinator.active_ids().into_iter().collect();
        let mut seen = HashSet::new();
        let targets: Vec<String> = user_ids
            .iter()
            .filter(|id| !active.contains(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect();

        let mut report = CycleReport {
            queried: targets.len(),
            ..Default::default()
        };

        if user_ids.is_empty() {
            debug!("No resolved accounts to poll yet");
            return report;
        }
        if targets.is_empty() {
            debug!(active = active.len(), "Every watched account is being recorded");
            return report;
        }

        metrics::counter!("recorder.polls.total").increment(1);

        for batch in targets.chunks(self.max_batch_size) {
            match self.query_batch(batch).await {
                Some(mut streams) => report.live.append(&mut streams),
                None => {
                    metrics::counter!("recorder.polls.failed").increment(1);
                    report.live.clear();
                    report.failed = true;
                    break;
                }
            }
        }

        self.transition(PollState::Idle);
        debug!(
            queried = report.queried,
            live = report.live.len(),
            failed = report.failed,
            "Poll cycle completed"
        );

        report
    }

    /// Run one batch through the state machine; `None` abandons the cycle.
    async fn query_batch(&self, batch: &[String]) -> Option<Vec<LiveStream>> {
        self.transition(PollState::RequestTokenSnapshot);
        let mut token = match self.tokens.current_or_refresh().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "No access token available, skipping cycle");
                return None;
            }
        };
        let mut refreshed = false;

        loop {
            match self.issue(batch, &token).await {
                BatchOutcome::Live(streams) => return Some(streams),
                BatchOutcome::Unauthorized if !refreshed => {
                    warn!(generation = token.generation, "Access token rejected, refreshing");
                    self.transition(PollState::RequestTokenSnapshot);
                    token = match self.tokens.refresh_if_stale(&token).await {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            error!(error = %e, "Token refresh failed, skipping cycle");
                            return None;
                        }
                    };
                    refreshed = true;
                }
                BatchOutcome::Unauthorized => {
                    error!("Access token rejected again after refresh, skipping cycle");
                    return None;
                }
                BatchOutcome::Failed(e) => {
                    error!(error = %e, transient = e.is_transient(), "Status query failed, skipping cycle");
                    return None;
                }
            }
        }
    }

    async fn issue(&self, batch: &[String], token: &TokenState) -> BatchOutcome {
        self.transition(PollState::RateLimitWait);
        self.limiter.wait().await;

        self.transition(PollState::IssueBatchQuery);
        self.api.live_streams(batch, &token.value).await.into()
    }

    /// Poll until `cancel` fires, handing live streams to the coordinator.
    pub async fn run(
        self: Arc<Self>,
        resolver: Arc<UserResolver>,
        identifiers: Vec<AccountIdentifier>,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.poll_forever(&resolver, identifiers) => {}
        }

        self.transition(PollState::Idle);
        info!("Poller stopped");
    }

    async fn poll_forever(&self, resolver: &UserResolver, identifiers: Vec<AccountIdentifier>) {
        let mut user_ids: Vec<String> = Vec::new();
        let mut pending = identifiers;

        loop {
            if !pending.is_empty() {
                let resolution = resolver.resolve_all(&pending).await;
                for id in resolution.ids {
                    if !user_ids.contains(&id) {
                        user_ids.push(id);
                    }
                }
                pending = resolution.pending;

                info!(
                    watching = user_ids.len(),
                    pending = pending.len(),
                    dropped = resolution.missing.len() + resolution.rejected.len(),
                    "Watch list updated"
                );
            }

            let report = self.poll_cycle(&user_ids).await;
            for stream in report.live {
                self.coordinator.on_live_detected(stream);
            }

            let delay = if report.failed {
                self.interval + self.error_delay
            } else {
                self.interval
            };

            self.transition(PollState::Sleep);
            tokio::time::sleep(delay).await;
            self.transition(PollState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockCaptureRunner;
    use crate::coordinator::{ActiveRecording, MockBroadcastLog};
    use crate::helix::{AccessToken, MockStreamsApi, MockTokenSource};
    use crate::storage_selector::{MockSpaceProbe, StorageCandidate, StorageSelector};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn live(user_id: &str) -> LiveStream {
        LiveStream {
            user_id: user_id.to_string(),
            user_login: format!("user{}", user_id),
            user_name: format!("User{}", user_id),
            stream_id: format!("s{}", user_id),
            title: String::new(),
            started_at: Utc::now(),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    /// Token store handing out "t1", "t2", ... and counting fetches.
    fn tokens(fetches: Arc<AtomicUsize>) -> Arc<TokenStore> {
        let mut source = MockTokenSource::new();
        source.expect_fetch_token().returning(move || {
            let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken {
                value: format!("t{}", n),
                expires_in: None,
            })
        });
        Arc::new(TokenStore::new(Arc::new(source), Duration::from_secs(60)))
    }

    fn coordinator() -> Arc<RecordingCoordinator> {
        let mut probe = MockSpaceProbe::new();
        probe.expect_available_space().returning(|_| Ok(u64::MAX));
        let storage = StorageSelector::new(
            vec![StorageCandidate::new(std::env::temp_dir(), 1)],
            Arc::new(probe),
            Duration::from_secs(600),
            "mp4",
        );

        let mut log = MockBroadcastLog::new();
        log.expect_record().returning(|_| Ok(true));
        let mut runner = MockCaptureRunner::new();
        runner.expect_capture().returning(|_, _| Ok(()));

        Arc::new(RecordingCoordinator::new(
            Arc::new(storage),
            Arc::new(log),
            Arc::new(runner),
            4,
            Duration::from_secs(5),
        ))
    }

    fn poller(api: MockStreamsApi, tokens: Arc<TokenStore>, coordinator: Arc<RecordingCoordinator>) -> LivePoller {
        LivePoller::new(
            Arc::new(api),
            tokens,
            Arc::new(RateLimiter::new(100, Duration::from_secs(1))),
            coordinator,
            100,
            Duration::from_secs(5),
            Duration::from_secs(15),
        )
    }

    #[tokio::test]
    async fn test_live_accounts_returned() {
        let mut api = MockStreamsApi::new();
        api.expect_live_streams()
            .withf(|batch, token| batch.iter().map(String::as_str).eq(["1", "2", "3"]) && token == "t1")
            .times(1)
            .returning(|_, _| Ok(vec![live("2")]));

        let poller = poller(api, tokens(Arc::new(AtomicUsize::new(0))), coordinator());

        let streams = poller.poll_once(&ids(&["1", "2", "3"])).await;

        let live_ids: Vec<_> = streams.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(live_ids, vec!["2"]);
        assert_eq!(poller.state(), PollState::Idle);
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_one_refresh_and_retry() {
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut api = MockStreamsApi::new();
        api.expect_live_streams()
            .withf(|_, token| token == "t1")
            .times(1)
            .returning(|_, _| Err(ApiError::Unauthorized));
        api.expect_live_streams()
            .withf(|_, token| token == "t2")
            .times(1)
            .returning(|_, _| Ok(vec![live("42")]));

        let poller = poller(api, tokens(fetches.clone()), coordinator());

        let streams = poller.poll_once(&ids(&["42"])).await;

        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].user_id, "42");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_abandons_cycle() {
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut api = MockStreamsApi::new();
        api.expect_live_streams()
            .times(2)
            .returning(|_, _| Err(ApiError::Unauthorized));

        let poller = poller(api, tokens(fetches.clone()), coordinator());

        let report = poller.poll_cycle(&ids(&["42"])).await;

        assert!(report.failed);
        assert!(report.live.is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_error_returns_empty_without_refresh() {
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut api = MockStreamsApi::new();
        api.expect_live_streams().times(1).returning(|_, _| {
            Err(ApiError::Status {
                status: 500,
                body: "oops".to_string(),
            })
        });

        let poller = poller(api, tokens(fetches.clone()), coordinator());

        let report = poller.poll_cycle(&ids(&["42"])).await;

        assert!(report.failed);
        assert!(report.live.is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_active_accounts_are_excluded() {
        let coordinator = coordinator();
        let _slot = coordinator
            .active()
            .try_claim(ActiveRecording::for_stream(&live("42")))
            .unwrap();

        let mut api = MockStreamsApi::new();
        api.expect_live_streams()
            .withf(|batch, _| batch.iter().map(String::as_str).eq(["7"]))
            .times(1)
            .returning(|_, _| Ok(Vec::new()));

        let poller = poller(api, tokens(Arc::new(AtomicUsize::new(0))), coordinator);

        assert!(poller.poll_once(&ids(&["42", "7"])).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_query_when_everything_is_active() {
        let coordinator = coordinator();
        let _slot = coordinator
            .active()
            .try_claim(ActiveRecording::for_stream(&live("42")))
            .unwrap();

        let mut api = MockStreamsApi::new();
        api.expect_live_streams().never();

        let poller = poller(api, tokens(Arc::new(AtomicUsize::new(0))), coordinator);

        let report = poller.poll_cycle(&ids(&["42"])).await;
        assert_eq!(report.queried, 0);
        assert!(!report.failed);
    }

    #[tokio::test]
    async fn test_large_lists_are_split_into_batches() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let recorded = sizes.clone();

        let mut api = MockStreamsApi::new();
        api.expect_live_streams().times(3).returning(move |batch, _| {
            recorded.lock().push(batch.len());
            Ok(Vec::new())
        });

        let mut poller = poller(api, tokens(Arc::new(AtomicUsize::new(0))), coordinator());
        poller.max_batch_size = 2;

        poller.poll_once(&ids(&["1", "2", "3", "4", "5", "5"])).await;

        assert_eq!(*sizes.lock(), vec![2, 2, 1]);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(BatchOutcome::from(Ok(Vec::new())), BatchOutcome::Live(v) if v.is_empty()));
        assert!(matches!(
            BatchOutcome::from(Err(ApiError::Unauthorized)),
            BatchOutcome::Unauthorized
        ));
        assert!(matches!(
            BatchOutcome::from(Err(ApiError::Decode("x".to_string()))),
            BatchOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_watch_list_skips_query() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let mut api = MockStreamsApi::new();
        api.expect_live_streams().never();

        let poller = poller(api, tokens(fetches.clone()), coordinator());

        let report = poller.poll_cycle(&[]).await;

        assert_eq!(report.queried, 0);
        assert!(!report.failed);
        assert!(report.live.is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_account_waiting_for_storage_stays_claimed() {
        let root = tempfile::tempdir().unwrap();

        // Every location is full for the first five scans
        let scans = Arc::new(AtomicUsize::new(0));
        let counter = scans.clone();
        let mut probe = MockSpaceProbe::new();
        probe.expect_available_space().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                Ok(1)
            } else {
                Ok(u64::MAX)
            }
        });
        let storage = StorageSelector::new(
            vec![StorageCandidate::new(root.path(), 1)],
            Arc::new(probe),
            Duration::from_millis(50),
            "mp4",
        );

        let mut log = MockBroadcastLog::new();
        log.expect_record().times(1).returning(|_| Ok(true));

        let captures = Arc::new(AtomicUsize::new(0));
        let capture_count = captures.clone();
        let mut runner = MockCaptureRunner::new();
        runner.expect_capture().times(1).returning(move |_, _| {
            capture_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let coordinator = Arc::new(RecordingCoordinator::new(
            Arc::new(storage),
            Arc::new(log),
            Arc::new(runner),
            4,
            Duration::from_millis(50),
        ));

        let mut api = MockStreamsApi::new();
        api.expect_live_streams()
            .withf(|batch, _| batch.iter().map(String::as_str).eq(["7"]))
            .returning(|_, _| Ok(vec![live("7")]));
        let poller = poller(api, tokens(Arc::new(AtomicUsize::new(0))), coordinator.clone());

        assert!(coordinator.on_live_detected(live("42")));

        // Still waiting for space: claimed, left out of polls, not dispatched twice
        while scans.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(coordinator.active().contains("42"));
        assert_eq!(captures.load(Ordering::SeqCst), 0);

        let report = poller.poll_cycle(&ids(&["42", "7"])).await;
        assert_eq!(report.queried, 1);
        assert!(!coordinator.on_live_detected(live("42")));

        // Space frees up: exactly one capture, then the account is released
        let released = tokio::time::timeout(Duration::from_secs(5), async {
            while captures.load(Ordering::SeqCst) == 0 || coordinator.active().contains("42") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "capture never ran after space freed up");
        assert_eq!(captures.load(Ordering::SeqCst), 1);
        assert!(scans.load(Ordering::SeqCst) >= 6);

        coordinator.shutdown().await;
    }
}
