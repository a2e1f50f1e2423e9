use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const READ_CHUNK: usize = 8192;
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    pub fn success(&self) -> bool {
        self.status.map(|status| status.success()).unwrap_or(false)
    }
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Exited(CapturedOutput),
    /// The child was killed locally; whatever it started elsewhere may still run.
    TimedOut(CapturedOutput),
}

/// Spawns `cmd`, captures at most `max_bytes` per stream and kills the child
/// once `command_timeout` elapses. Spawn failures are returned as errors.
pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    max_bytes: usize,
    label: &str,
) -> anyhow::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().with_context(|| format!("failed to spawn {label}"))?;
    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;
    let stdout_task = tokio::spawn(read_capped(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, max_bytes));

    let (status, timed_out) = match timeout(command_timeout, child.wait()).await {
        Ok(result) => (Some(result.with_context(|| format!("{label} failed"))?), false),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            (None, true)
        }
    };

    if timed_out {
        // Orphaned grandchildren can keep the pipes open after the kill.
        let (stdout, stdout_truncated) = join_after_kill(stdout_task).await;
        let (stderr, stderr_truncated) = join_after_kill(stderr_task).await;
        return Ok(ProcessOutcome::TimedOut(CapturedOutput {
            status,
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated,
        }));
    }

    let (stdout, stdout_truncated) = stdout_task
        .await
        .context("stdout task join")?
        .context("stdout read")?;
    let (stderr, stderr_truncated) = stderr_task
        .await
        .context("stderr task join")?
        .context("stderr read")?;
    Ok(ProcessOutcome::Exited(CapturedOutput {
        status,
        stdout,
        stderr,
        truncated: stdout_truncated || stderr_truncated,
    }))
}

async fn join_after_kill(
    mut task: tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
) -> (Vec<u8>, bool) {
    match timeout(KILL_DRAIN_GRACE, &mut task).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(_) => (Vec::new(), false),
        Err(_) => {
            task.abort();
            (Vec::new(), true)
        }
    }
}

/// Reads the whole stream, keeping the first `max_bytes`. The rest is drained
/// so the child never blocks on a full pipe.
pub async fn read_capped<R>(mut reader: R, max_bytes: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        let room = max_bytes.saturating_sub(kept.len());
        if room < read {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..read.min(room)]);
    }
    Ok((kept, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_capped_truncates_but_drains() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let data = vec![b'x'; 20_000];
        let (kept, truncated) = rt
            .block_on(read_capped(&data[..], 100))
            .expect("read");
        assert_eq!(kept.len(), 100);
        assert!(truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello; printf oops >&2; exit 3");
        let outcome = run_command_with_timeout(&mut cmd, Duration::from_secs(5), 1024, "sh")
            .await
            .expect("run");
        match outcome {
            ProcessOutcome::Exited(output) => {
                assert_eq!(output.exit_code(), Some(3));
                assert_eq!(output.stdout, b"hello");
                assert_eq!(output.stderr, b"oops");
                assert!(!output.truncated);
            }
            ProcessOutcome::TimedOut(_) => panic!("unexpected timeout"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let outcome = run_command_with_timeout(&mut cmd, Duration::from_millis(100), 1024, "sh")
            .await
            .expect("run");
        assert!(matches!(outcome, ProcessOutcome::TimedOut(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let mut cmd = Command::new("/definitely/not/a/binary");
        let err = run_command_with_timeout(&mut cmd, Duration::from_secs(1), 1024, "missing")
            .await
            .expect_err("spawn should fail");
        assert!(err.to_string().contains("failed to spawn missing"));
    }
}
