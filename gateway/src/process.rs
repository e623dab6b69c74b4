//! External pipeline process – spawns `gst-launch-1.0`, watches its stderr,
//! and tears it down (SIGTERM, grace period, SIGKILL).

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mcast_mjpeg_common::config::Config;
use mcast_mjpeg_common::pipeline::PipelineSpec;

/// Environment variables routing the child's own debug log to a file.
pub fn diagnostic_env(config: &Config) -> Vec<(String, String)> {
    vec![
        ("GST_DEBUG".into(), config.gst_debug_level.clone()),
        (
            "GST_DEBUG_FILE".into(),
            config.gst_log_file.to_string_lossy().into_owned(),
        ),
        ("GST_DEBUG_NO_COLOR".into(), "1".into()),
        ("GST_DEBUG_DUMP_DOT_DIR".into(), String::new()),
    ]
}

/// Handle that exclusively owns one running pipeline child.
///
/// [`PipelineProcess::shutdown`] consumes the handle, so teardown happens at
/// most once. The child is also killed if the handle is dropped without it.
pub struct PipelineProcess {
    child: Child,
    pid: Option<u32>,
}

/// Pipes taken from a freshly spawned child.
pub struct PipelineOutput {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl PipelineProcess {
    pub fn spawn(spec: &PipelineSpec, env: &[(String, String)]) -> io::Result<(Self, PipelineOutput)> {
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.args())
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(io::Error::other("child pipes were not captured"));
        };
        debug!("Pipeline started (pid={pid:?})");

        Ok((Self { child, pid }, PipelineOutput { stdout, stderr }))
    }

    /// Ask the child to exit, wait up to `grace`, then kill it.
    ///
    /// Returns the exit status when one could be collected.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Pipeline (pid={:?}) already exited with {status}", self.pid);
                return Some(status);
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check pipeline (pid={:?}): {e}", self.pid),
        }

        self.terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Pipeline (pid={:?}) exited with {status}", self.pid);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Waiting for pipeline (pid={:?}) failed: {e}", self.pid);
                self.kill().await
            }
            Err(_) => {
                warn!(
                    "Pipeline (pid={:?}) ignored termination for {grace:?}, killing",
                    self.pid
                );
                self.kill().await
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("SIGTERM to pipeline (pid={pid}) failed: {e}");
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    async fn kill(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.kill().await {
            error!("Cannot kill pipeline (pid={:?}): {e}", self.pid);
        }
        self.child.try_wait().ok().flatten()
    }
}

/// How loud a diagnostic line is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Classify one stderr line; `None` means it is noise.
pub fn severity(line: &str) -> Option<Severity> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("critical") {
        Some(Severity::Error)
    } else if lower.contains("warning") {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Surface error/critical/warning lines from the child's stderr.
///
/// Runs until EOF, a read error, or `cancel`. Returns how many lines were
/// surfaced. Nothing depends on this task for correctness.
pub async fn watch_diagnostics(stderr: ChildStderr, cancel: CancellationToken) -> usize {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::with_capacity(256);
    let mut surfaced = 0;

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                match severity(text) {
                    Some(Severity::Error) => error!("[gst] {text}"),
                    Some(Severity::Warning) => warn!("[gst] {text}"),
                    None => continue,
                }
                surfaced += 1;
            }
            Err(e) => {
                debug!("Pipeline stderr read failed: {e}");
                break;
            }
        }
    }

    info!("Pipeline diagnostics closed ({surfaced} line(s) surfaced)");
    surfaced
}
