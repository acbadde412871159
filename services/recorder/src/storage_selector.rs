//! Picks the storage location for a new capture.
//!
//! Candidates are evaluated in configuration order and the first one whose
//! free space meets its threshold wins. When none qualifies, the dispatch
//! waits and rescans; a detected stream is never dropped for lack of space.

use crate::config::{StorageCandidateConfig, StorageConfig};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Format of the recording-start component of capture file names.
pub const FILE_TIME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";

/// A storage root and the free space it must keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCandidate {
    pub path: PathBuf,
    pub required_free_bytes: u64,
}

impl StorageCandidate {
    pub fn new(path: impl Into<PathBuf>, required_free_bytes: u64) -> Self {
        Self {
            path: path.into(),
            required_free_bytes,
        }
    }
}

impl From<&StorageCandidateConfig> for StorageCandidate {
    fn from(c: &StorageCandidateConfig) -> Self {
        Self::new(c.path.clone(), c.required_free_space_gb.saturating_mul(BYTES_PER_GIB))
    }
}

/// Free-space query for a filesystem path.
#[cfg_attr(test, mockall::automock)]
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by the filesystem statistics of the path's volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Where free space is measured for a candidate that may not exist yet.
fn probe_location(path: &Path) -> Option<PathBuf> {
    if let Some(existing) = path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists()) {
        return Some(existing.to_path_buf());
    }
    if path.is_relative() {
        return Some(PathBuf::from("."));
    }
    None
}

/// Build a capture file name from its components.
///
/// Components are joined with `" - "`; anything other than alphanumerics,
/// spaces, dashes, underscores and dots is dropped.
pub fn file_basename(components: &[&str], extension: &str) -> String {
    let raw = format!("{}.{}", components.join(" - "), extension);

    raw.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect()
}

/// Chooses storage roots and prepares capture output paths.
pub struct StorageSelector {
    candidates: Vec<StorageCandidate>,
    probe: Arc<dyn SpaceProbe>,
    retry_interval: Duration,
    extension: String,
}

impl StorageSelector {
    pub fn new(
        candidates: Vec<StorageCandidate>,
        probe: Arc<dyn SpaceProbe>,
        retry_interval: Duration,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            candidates,
            probe,
            retry_interval,
            extension: extension.into(),
        }
    }

    /// Build a selector from configuration using the filesystem probe.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.candidates.iter().map(StorageCandidate::from).collect(),
            Arc::new(FsSpaceProbe),
            config.retry_interval(),
            config.file_extension.clone(),
        )
    }

    pub fn candidates(&self) -> &[StorageCandidate] {
        &self.candidates
    }

    /// First candidate with enough free space, if any.
    pub fn choose(&self) -> Option<PathBuf> {
        for candidate in &self.candidates {
            let Some(location) = probe_location(&candidate.path) else {
                error!(path = %candidate.path.display(), "Storage location is not accessible");
                continue;
            };

            match self.probe.available_space(&location) {
                Ok(free) if free >= candidate.required_free_bytes => {
                    debug!(
                        path = %candidate.path.display(),
                        free_bytes = free,
                        required_bytes = candidate.required_free_bytes,
                        "Storage candidate selected"
                    );
                    return Some(candidate.path.clone());
                }
                Ok(free) => {
                    debug!(
                        path = %candidate.path.display(),
                        free_bytes = free,
                        required_bytes = candidate.required_free_bytes,
                        "Not enough free space"
                    );
                }
                Err(e) => {
                    error!(path = %candidate.path.display(), error = %e, "Failed to query free space");
                }
            }
        }

        None
    }

    /// Scan until some candidate qualifies, sleeping between scans.
    pub async fn choose_with_retry(&self) -> PathBuf {
        loop {
            if let Some(path) = self.choose() {
                return path;
            }

            metrics::counter!("recorder.storage.exhausted").increment(1);
            warn!(
                retry_in_secs = self.retry_interval.as_secs(),
                "No storage location has the required free space"
            );
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Choose a root and create `<root>/<user_name>/<file>` for a capture.
    ///
    /// Directory creation failures are treated like a full disk: the
    /// dispatch waits and the scan is repeated.
    pub async fn output_path(
        &self,
        user_name: &str,
        stream_id: &str,
        recording_start: DateTime<Utc>,
    ) -> PathBuf {
        let started = recording_start.format(FILE_TIME_FORMAT).to_string();
        let folder_name = file_basename(&[user_name], "").trim_end_matches('.').to_string();
        let basename = file_basename(&[&started, stream_id, "broadcast", user_name], &self.extension);

        loop {
            let root = self.choose_with_retry().await;
            let folder = root.join(&folder_name);

            match tokio::fs::create_dir_all(&folder).await {
                Ok(()) => {
                    let path = folder.join(&basename);
                    info!(path = %path.display(), "Capture output path prepared");
                    return path;
                }
                Err(e) => {
                    error!(
                        folder = %folder.display(),
                        error = %e,
                        retry_in_secs = self.retry_interval.as_secs(),
                        "Failed to create capture folder"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}
