//! Runs the external capture program for one live session.

use crate::config::CaptureConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

const CHANNEL_PLACEHOLDER: &str = "{channel}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Time between SIGTERM and SIGKILL when a capture is abandoned.
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur while running a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture exited unsuccessfully (code {code:?})")]
    Exited { code: Option<i32> },

    #[error("Capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Records a channel into a file, returning when the recording ends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureRunner: Send + Sync {
    async fn capture(&self, channel: &str, output: &Path) -> Result<(), CaptureError>;
}

/// Capture backed by an external program.
///
/// The program runs in its own process group. If the future driving it is
/// dropped, the whole group is terminated, so aborting the owning task stops
/// the recording along with anything the program spawned.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    /// Argument list with placeholders filled in.
    pub fn build_args(&self, channel: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();

        self.args
            .iter()
            .map(|arg| {
                arg.replace(CHANNEL_PLACEHOLDER, channel)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }

    fn command(&self, channel: &str, output: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.build_args(channel, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        // Keep terminal signals away from the child; shutdown kills the group explicitly
        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

/// Terminates a capture's process group when dropped while still armed.
///
/// The group id is the leader's pid since the child is spawned with
/// `process_group(0)`. Members get SIGTERM at once and SIGKILL after the
/// grace period if any survive.
#[cfg(unix)]
struct ProcessGroupGuard {
    pgid: Option<i32>,
    grace: Duration,
}

#[cfg(unix)]
impl ProcessGroupGuard {
    fn new(pid: Option<u32>, grace: Duration) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
            grace,
        }
    }

    /// Leave the group alone; called once the leader has been reaped.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.take() else {
            return;
        };
        let group = Pid::from_raw(pgid);

        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!(pgid, error = %e, "Capture process group already gone");
            return;
        }
        warn!(pgid, "Terminated abandoned capture process group");

        let grace = self.grace;
        std::thread::spawn(move || {
            std::thread::sleep(grace);
            if killpg(group, None).is_ok() {
                let _ = killpg(group, Signal::SIGKILL);
            }
        });
    }
}

fn check_exit(status: ExitStatus) -> Result<(), CaptureError> {
    if status.success() {
        Ok(())
    } else {
        Err(CaptureError::Exited {
            code: status.code(),
        })
    }
}

#[async_trait]
impl CaptureRunner for CommandCapture {
    #[instrument(skip(self), fields(program = %self.program, output = %output.display()))]
    async fn capture(&self, channel: &str, output: &Path) -> Result<(), CaptureError> {
        let mut child = self
            .command(channel, output)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        info!(pid = child.id(), "Capture process started");

        #[cfg(unix)]
        let mut group = ProcessGroupGuard::new(child.id(), KILL_GRACE);

        let status = child.wait().await?;
        debug!(status = %status, "Capture process exited");

        #[cfg(unix)]
        group.disarm();

        check_exit(status)
    }
}
