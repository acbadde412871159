//! Dispatches one supervised capture per live account.
//!
//! Membership in the [`ActiveRecordingSet`] is claimed atomically before a
//! capture task is spawned and released by the task's slot guard after the
//! cooldown, so an account can never have two captures in flight.

use crate::capture::CaptureRunner;
use crate::helix::LiveStream;
use crate::storage_selector::StorageSelector;
use crate::store::{BroadcastRecord, SqliteStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// An account currently under capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecording {
    pub user_id: String,
    pub user_name: String,
    pub stream_id: String,
    pub started_at: DateTime<Utc>,
    /// Distinguishes successive captures of the same account
    pub session_id: Uuid,
}

impl ActiveRecording {
    pub fn for_stream(stream: &LiveStream) -> Self {
        Self {
            user_id: stream.user_id.clone(),
            user_name: stream.user_name.clone(),
            stream_id: stream.stream_id.clone(),
            started_at: Utc::now(),
            session_id: Uuid::new_v4(),
        }
    }
}

/// Account IDs with a capture in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveRecordingSet {
    inner: Arc<Mutex<HashMap<String, ActiveRecording>>>,
}

impl ActiveRecordingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `recording` unless its account is already present.
    ///
    /// The returned slot removes the entry when dropped.
    pub fn try_claim(&self, recording: ActiveRecording) -> Option<RecordingSlot> {
        let mut active = self.inner.lock();

        if active.contains_key(&recording.user_id) {
            return None;
        }

        let slot = RecordingSlot {
            set: self.clone(),
            user_id: recording.user_id.clone(),
            session_id: recording.session_id,
        };
        active.insert(recording.user_id.clone(), recording);
        metrics::gauge!("recorder.captures.active").set(active.len() as f64);

        Some(slot)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.inner.lock().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Active recordings, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveRecording> {
        let mut recordings: Vec<_> = self.inner.lock().values().cloned().collect();
        recordings.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        recordings
    }

    fn release(&self, user_id: &str, session_id: Uuid) {
        let mut active = self.inner.lock();

        if active.get(user_id).map(|r| r.session_id) == Some(session_id) {
            active.remove(user_id);
        }
        metrics::gauge!("recorder.captures.active").set(active.len() as f64);
    }
}

/// Ownership of one entry in an [`ActiveRecordingSet`].
#[derive(Debug)]
pub struct RecordingSlot {
    set: ActiveRecordingSet,
    user_id: String,
    session_id: Uuid,
}

impl RecordingSlot {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for RecordingSlot {
    fn drop(&mut self) {
        self.set.release(&self.user_id, self.session_id);
    }
}

/// Append-only broadcast history.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BroadcastLog: Send + Sync {
    /// Returns false if the record was already present.
    async fn record(&self, record: &BroadcastRecord) -> Result<bool, StoreError>;
}

#[async_trait]
impl BroadcastLog for SqliteStore {
    async fn record(&self, record: &BroadcastRecord) -> Result<bool, StoreError> {
        self.insert_broadcast(record).await
    }
}

/// Collaborators shared by every capture task.
struct CaptureContext {
    storage: Arc<StorageSelector>,
    log: Arc<dyn BroadcastLog>,
    runner: Arc<dyn CaptureRunner>,
    permits: Arc<Semaphore>,
    cooldown: Duration,
}

/// Turns live detections into supervised capture tasks.
pub struct RecordingCoordinator {
    active: ActiveRecordingSet,
    context: Arc<CaptureContext>,
    tasks: Mutex<JoinSet<()>>,
}

impl RecordingCoordinator {
    pub fn new(
        storage: Arc<StorageSelector>,
        log: Arc<dyn BroadcastLog>,
        runner: Arc<dyn CaptureRunner>,
        max_concurrent: usize,
        cooldown: Duration,
    ) -> Self {
        Self {
            active: ActiveRecordingSet::new(),
            context: Arc::new(CaptureContext {
                storage,
                log,
                runner,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                cooldown,
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn active(&self) -> &ActiveRecordingSet {
        &self.active
    }

    /// Account IDs that must be left out of the next status query.
    pub fn active_ids(&self) -> Vec<String> {
        self.active.ids()
    }

    /// Dispatch a capture for `stream` unless its account is already active.
    ///
    /// Returns whether a capture task was spawned.
    pub fn on_live_detected(&self, stream: LiveStream) -> bool {
        let recording = ActiveRecording::for_stream(&stream);
        let started_at = recording.started_at;
        let session_id = recording.session_id;

        let Some(slot) = self.active.try_claim(recording) else {
            debug!(user_id = %stream.user_id, "Capture already active, ignoring detection");
            return false;
        };

        info!(
            user_id = %stream.user_id,
            user_name = %stream.user_name,
            stream_id = %stream.stream_id,
            title = %stream.title,
            "Live stream detected, dispatching capture"
        );
        metrics::counter!("recorder.live.detected").increment(1);

        let span = tracing::info_span!(
            "capture",
            user_id = %stream.user_id,
            stream_id = %stream.stream_id,
            session_id = %session_id
        );
        let context = self.context.clone();

        let mut tasks = self.tasks.lock();
        reap_finished(&mut tasks);
        tasks.spawn(run_capture(context, stream, started_at, slot).instrument(span));

        true
    }

    /// Log every active recording with its elapsed time.
    pub fn log_active(&self) {
        let recordings = self.active.snapshot();
        let now = Utc::now();

        info!(active = recordings.len(), "Active recordings");
        for r in recordings {
            let elapsed = (now - r.started_at).num_seconds().max(0);
            info!(
                user_name = %r.user_name,
                user_id = %r.user_id,
                stream_id = %r.stream_id,
                started_at = %r.started_at.format("%Y-%m-%d %H:%M:%S"),
                elapsed = %format_elapsed(elapsed),
                "Recording"
            );
        }
    }

    /// Log the active set every `interval` until `cancel` fires.
    pub async fn run_status_logger(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.log_active(),
            }
        }
    }

    /// Abort every outstanding capture and wait for the tasks to unwind.
    ///
    /// Aborting drops the capture future, which kills the child process.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        if !tasks.is_empty() {
            warn!(captures = tasks.len(), "Stopping outstanding captures");
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Collect finished capture tasks, logging any that panicked.
///
/// Returns how many of them failed.
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut failed = 0;

    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            metrics::counter!("recorder.captures.panicked").increment(1);
            error!(error = %e, "Capture task failed");
            failed += 1;
        }
    }

    failed
}

fn format_elapsed(secs: i64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

async fn run_capture(
    context: Arc<CaptureContext>,
    stream: LiveStream,
    started_at: DateTime<Utc>,
    slot: RecordingSlot,
) {
    let Ok(_permit) = context.permits.clone().acquire_owned().await else {
        error!("Capture pool closed, dropping capture");
        return;
    };

    let output = context
        .storage
        .output_path(&stream.user_name, &stream.stream_id, started_at)
        .await;

    let record = BroadcastRecord {
        user_id: stream.user_id.clone(),
        user_name: stream.user_name.clone(),
        stream_id: stream.stream_id.clone(),
        recording_start: started_at,
        title: stream.title.clone(),
        file_path: output.to_string_lossy().into_owned(),
    };
    match context.log.record(&record).await {
        Ok(true) => debug!("Broadcast recorded"),
        Ok(false) => debug!("Broadcast already recorded"),
        Err(e) => error!(error = %e, "Failed to persist broadcast record"),
    }

    metrics::counter!("recorder.captures.started").increment(1);
    info!(path = %output.display(), "Capture started");

    match context.runner.capture(&stream.user_login, &output).await {
        Ok(()) => info!(path = %output.display(), "Capture finished"),
        Err(e) => {
            metrics::counter!("recorder.captures.failed").increment(1);
            error!(error = %e, path = %output.display(), "Capture failed");
        }
    }

    tokio::time::sleep(context.cooldown).await;
    drop(slot);
    debug!("Account eligible for detection again");
}
