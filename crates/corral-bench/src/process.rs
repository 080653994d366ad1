//! Deadline-bounded child processes, killed as a whole process group.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::launch::LaunchPlan;

/// Keep at most this much of each stream, from the end.
const MAX_CAPTURE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn `plan` in a new process group and wait at most `deadline`. On expiry
/// the group gets SIGTERM, then SIGKILL once `grace` has passed.
pub async fn run_with_deadline(plan: &LaunchPlan, deadline: Duration, grace: Duration) -> anyhow::Result<ProcessOutcome> {
    let start = Instant::now();
    let mut child = Command::new(&plan.program)
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning {}", plan.program))?;

    let pgid = child.id().map(|id| Pid::from_raw(id as i32));
    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());
    debug!(program=%plan.program, pgid=?pgid, "benchmark spawned");

    let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => (Some(status.context("waiting for benchmark")?), false),
        Err(_) => {
            warn!(program=%plan.program, deadline_secs = deadline.as_secs(), "deadline expired, terminating process group");
            (terminate_group(&mut child, pgid, grace).await, true)
        }
    };

    let stdout = collect(stdout, grace).await;
    let stderr = collect(stderr, grace).await;

    Ok(ProcessOutcome {
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

async fn terminate_group(child: &mut Child, pgid: Option<Pid>, grace: Duration) -> Option<std::process::ExitStatus> {
    let Some(pgid) = pgid else {
        // already reaped
        return child.wait().await.ok();
    };
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!(pgid=%pgid, error=%e, "SIGTERM to process group failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // stragglers that ignored SIGTERM after the leader exited
            let _ = killpg(pgid, Signal::SIGKILL);
            status.ok()
        }
        Err(_) => {
            warn!(pgid=%pgid, "process group ignored SIGTERM, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            child.wait().await.ok()
        }
    }
}

fn capture<R>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream.map(|s| tokio::spawn(read_tail(s, MAX_CAPTURE_BYTES)))
}

/// Drain `stream` to the end, keeping only its last `limit` bytes.
async fn read_tail<R>(mut stream: R, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                // trim in batches so the copy is amortized
                if buf.len() > limit.saturating_mul(2) {
                    buf.drain(..buf.len() - limit);
                }
            }
        }
    }
    if buf.len() > limit {
        buf.drain(..buf.len() - limit);
    }
    buf
}

/// Reader output, or whatever is missing if a stray process still holds the pipe.
async fn collect(handle: Option<JoinHandle<Vec<u8>>>, wait: Duration) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let bytes = match tokio::time::timeout(wait, handle).await {
        Ok(Ok(bytes)) => bytes,
        _ => return String::new(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            processes: 1,
        }
    }

    #[tokio::test]
    async fn test_read_tail_keeps_the_end() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let tail = read_tail(&data[..], 1000).await;
        assert_eq!(tail.len(), 1000);
        assert_eq!(tail, data[data.len() - 1000..].to_vec());

        assert_eq!(read_tail(&b"short"[..], 1000).await, b"short".to_vec());
    }

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let out = run_with_deadline(&sh("echo hello; echo oops >&2; exit 3"), Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_deadline_kills_whole_group() {
        let start = Instant::now();
        let out = run_with_deadline(
            &sh("sleep 30 & sleep 30 & echo started; wait"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.stdout, "started\n");
        // background sleeps held the pipe; they must be dead for the read to finish this fast
        assert!(start.elapsed() < Duration::from_secs(4), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_sigkill() {
        let start = Instant::now();
        let out = run_with_deadline(
            &sh("trap '' TERM; sleep 30"),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let plan = LaunchPlan {
            program: "/nonexistent/corral-bench".into(),
            args: vec![],
            processes: 1,
        };
        assert!(run_with_deadline(&plan, Duration::from_secs(1), Duration::from_secs(1)).await.is_err());
    }
}
