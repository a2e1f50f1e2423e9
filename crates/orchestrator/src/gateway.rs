//! Running resolved commands on remote targets over ssh.
//!
//! Known limitation: when a synchronous run times out, the local ssh client
//! is killed but the remote command may keep running. The caller only learns
//! that the wait expired, not what happened remotely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use protocol::OperationMode;
use system_utils::process::{run_command_with_timeout, CapturedOutput, ProcessOutcome};
use system_utils::ssh::ssh_command;
use tokio::sync::OwnedMutexGuard;

use crate::audit::{redact_callback_url, AuditLog, DispatchRecord, ResultRecord};
use crate::error::GatewayError;
use crate::escape::shell_quote;
use crate::target::TargetSpec;
use crate::template::ResolvedCommand;
use crate::time::now_ms;

/// Line appended by the detached wrapper before the output is posted back.
pub const COMPLETION_MARKER: &str = "__OPSDECK_COMPLETE__";
const ACCEPTED_MARKER: &str = "__OPSDECK_ACCEPTED__";
/// ssh reserves this exit status for its own failures, but a remote command
/// may exit with it too.
const SSH_TRANSPORT_EXIT: i32 = 255;
/// Fragments of what ssh itself prints when the session never got going,
/// besides its `ssh: ` prefixed lines.
const SSH_FAILURE_PATTERNS: &[&str] = &[
    "Permission denied (",
    "Host key verification failed",
    "Connection closed by",
    "Connection reset by",
    "kex_exchange_identification",
];
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub text: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTicket {
    pub id: String,
    pub target_id: String,
    pub script_id: String,
    pub dispatched_at_ms: u64,
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn run_sync(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        timeout: Duration,
    ) -> Result<RawOutput, GatewayError>;

    /// Returns once the target accepted the detached command; the command's
    /// own outcome arrives later through `callback_url`.
    async fn dispatch_async(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        callback_url: &str,
    ) -> Result<DispatchTicket, GatewayError>;
}

/// One open session per target at a time.
#[derive(Debug, Default)]
struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TargetLocks {
    async fn acquire(&self, target: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(target.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct SshGateway {
    audit: AuditLog,
    sessions: TargetLocks,
    max_output_bytes: usize,
    dispatch_timeout: Duration,
}

impl SshGateway {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            audit,
            sessions: TargetLocks::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_dispatch_timeout(mut self, dispatch_timeout: Duration) -> Self {
        self.dispatch_timeout = dispatch_timeout;
        self
    }
}

#[async_trait]
impl ExecutionGateway for SshGateway {
    async fn run_sync(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        timeout: Duration,
    ) -> Result<RawOutput, GatewayError> {
        let _session = self.sessions.acquire(&target.id).await;
        let ticket = uuid::Uuid::new_v4().to_string();
        self.audit.record_dispatch(DispatchRecord {
            ticket: ticket.clone(),
            target: target.id.clone(),
            script_id: command.script_id().to_string(),
            mode: OperationMode::Sync,
            command: command.display_text().to_string(),
            callback_url: None,
            dispatched_at_ms: now_ms(),
        });

        let started = Instant::now();
        let remote = login_shell_command(command.command_text());
        let mut cmd = ssh_command(&target.ssh, &remote).map_err(|err| transport(target, err))?;
        let result = match run_command_with_timeout(&mut cmd, timeout, self.max_output_bytes, "ssh")
            .await
        {
            Err(err) => Err(transport(target, err)),
            Ok(ProcessOutcome::TimedOut(_)) => Err(GatewayError::Timeout {
                target: target.id.clone(),
                timeout_secs: timeout.as_secs(),
            }),
            Ok(ProcessOutcome::Exited(output))
                if is_ssh_failure(output.exit_code(), &output.stderr) =>
            {
                Err(GatewayError::Transport {
                    target: target.id.clone(),
                    message: failure_message(&output),
                })
            }
            Ok(ProcessOutcome::Exited(output)) => Ok(RawOutput {
                text: merge_output(&output),
                exit_code: output.exit_code(),
                truncated: output.truncated,
            }),
        };

        self.audit.record_result(
            ResultRecord {
                ticket,
                target: target.id.clone(),
                exit_code: result.as_ref().ok().and_then(|raw| raw.exit_code),
                error: result.as_ref().err().map(ToString::to_string),
                duration_ms: started.elapsed().as_millis(),
            },
            started.elapsed(),
        );
        result
    }

    async fn dispatch_async(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        callback_url: &str,
    ) -> Result<DispatchTicket, GatewayError> {
        let _session = self.sessions.acquire(&target.id).await;
        let ticket = DispatchTicket {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target.id.clone(),
            script_id: command.script_id().to_string(),
            dispatched_at_ms: now_ms(),
        };
        self.audit.record_dispatch(DispatchRecord {
            ticket: ticket.id.clone(),
            target: target.id.clone(),
            script_id: ticket.script_id.clone(),
            mode: OperationMode::Async,
            command: command.display_text().to_string(),
            callback_url: Some(redact_callback_url(callback_url)),
            dispatched_at_ms: ticket.dispatched_at_ms,
        });

        let remote = login_shell_command(&detached_command(command.command_text(), callback_url));
        let mut cmd = ssh_command(&target.ssh, &remote).map_err(|err| dispatch(target, err))?;
        let outcome = run_command_with_timeout(
            &mut cmd,
            self.dispatch_timeout,
            64 * 1024,
            "ssh dispatch",
        )
        .await
        .map_err(|err| dispatch(target, err))?;
        match outcome {
            ProcessOutcome::Exited(output)
                if output.success()
                    && String::from_utf8_lossy(&output.stdout).contains(ACCEPTED_MARKER) =>
            {
                Ok(ticket)
            }
            ProcessOutcome::Exited(output) => Err(GatewayError::Dispatch {
                target: target.id.clone(),
                message: failure_message(&output),
            }),
            ProcessOutcome::TimedOut(_) => Err(GatewayError::Dispatch {
                target: target.id.clone(),
                message: format!(
                    "no acknowledgement within {}s",
                    self.dispatch_timeout.as_secs()
                ),
            }),
        }
    }
}

/// Quotes the whole command for the remote login shell.
fn login_shell_command(command_text: &str) -> String {
    format!("bash -lc {}", shell_quote(command_text))
}

/// Runs `command_text` to completion in the same login shell a sync run
/// uses, appends the completion marker with the exit status and posts the
/// combined output to `callback_url`.
pub(crate) fn completion_script(command_text: &str, callback_url: &str) -> String {
    format!(
        "out=$(mktemp) || exit 1\n\
         {command} >\"$out\" 2>&1 </dev/null\n\
         status=$?\n\
         printf '\\n{COMPLETION_MARKER} exit=%s\\n' \"$status\" >>\"$out\"\n\
         curl -fsS -m 30 --retry 5 -X POST --data-binary @\"$out\" {url}\n\
         rm -f \"$out\"",
        command = login_shell_command(command_text),
        url = shell_quote(callback_url),
    )
}

/// Exit 255 is only a transport failure when ssh's own diagnostics say so.
fn is_ssh_failure(exit_code: Option<i32>, stderr: &[u8]) -> bool {
    if exit_code != Some(SSH_TRANSPORT_EXIT) {
        return false;
    }
    let stderr = String::from_utf8_lossy(stderr);
    stderr.lines().any(|line| {
        line.trim_start().starts_with("ssh: ")
            || SSH_FAILURE_PATTERNS
                .iter()
                .any(|pattern| line.contains(pattern))
    })
}

fn detached_command(command_text: &str, callback_url: &str) -> String {
    format!(
        "nohup sh -c {} >/dev/null 2>&1 </dev/null & echo {ACCEPTED_MARKER}",
        shell_quote(&completion_script(command_text, callback_url))
    )
}

fn merge_output(output: &CapturedOutput) -> String {
    let mut merged = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.stderr.is_empty() {
        if !merged.is_empty() {
            merged.push('\n');
        }
        merged.push_str("[stderr]\n");
        merged.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if output.truncated {
        merged.push_str("\n[output truncated]");
    }
    merged
}

fn failure_message(output: &CapturedOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    match output.exit_code() {
        Some(code) => format!("ssh exited with status {code}"),
        None => "ssh terminated by signal".to_string(),
    }
}

fn transport(target: &TargetSpec, err: anyhow::Error) -> GatewayError {
    GatewayError::Transport {
        target: target.id.clone(),
        message: format!("{err:#}"),
    }
}

fn dispatch(target: &TargetSpec, err: anyhow::Error) -> GatewayError {
    GatewayError::Dispatch {
        target: target.id.clone(),
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn login_shell_wraps_once() {
        let remote = login_shell_command("install-x 'my app'");
        assert!(remote.starts_with("bash -lc "));
        let tokens = shell_words::split(&remote).expect("split");
        assert_eq!(tokens, vec!["bash", "-lc", "install-x 'my app'"]);
    }

    #[test]
    fn exit_255_needs_ssh_diagnostics_to_be_transport() {
        assert!(is_ssh_failure(
            Some(255),
            b"ssh: connect to host 10.0.0.5 port 22: Connection refused\n"
        ));
        assert!(is_ssh_failure(
            Some(255),
            b"deploy@10.0.0.5: Permission denied (publickey,password).\n"
        ));
        assert!(is_ssh_failure(Some(255), b"Host key verification failed.\n"));
        assert!(!is_ssh_failure(Some(255), b""));
        assert!(!is_ssh_failure(Some(255), b"install-x: license expired\n"));
        assert!(!is_ssh_failure(Some(1), b"ssh: whatever\n"));
        assert!(!is_ssh_failure(None, b"ssh: whatever\n"));
    }

    #[test]
    fn completion_script_uses_login_shell() {
        let script = completion_script("echo $HOME", "http://console/callback/srv-1/x?token=t");
        assert!(script.contains(&format!(
            "{} >\"$out\" 2>&1",
            login_shell_command("echo $HOME")
        )));
    }

    #[test]
    fn merge_output_tags_stderr_and_truncation() {
        let output = CapturedOutput {
            status: None,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            truncated: true,
        };
        let merged = merge_output(&output);
        assert!(merged.starts_with("out\n[stderr]\nerr"));
        assert!(merged.ends_with("[output truncated]"));
    }

    #[test]
    fn detached_command_acknowledges_after_backgrounding() {
        let command = detached_command("echo hi", "http://console/callback/srv-1/x?token=t");
        assert!(command.starts_with("nohup sh -c "));
        assert!(command.ends_with(&format!("& echo {ACCEPTED_MARKER}")));
    }

    #[cfg(unix)]
    #[test]
    fn completion_script_posts_output_with_marker() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir("opsdeck-completion");
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).expect("bin dir");
        let posted = dir.join("posted");
        let url_file = dir.join("url");
        let fake_curl = bin.join("curl");
        std::fs::write(
            &fake_curl,
            "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    @*) cp \"${arg#@}\" \"$POSTED\" ;;\n    http*) printf '%s' \"$arg\" > \"$URL_FILE\" ;;\n  esac\ndone\n",
        )
        .expect("write curl");
        let mut perms = std::fs::metadata(&fake_curl).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake_curl, perms).expect("chmod");

        let url = "http://console/callback/srv-1/install_x?token=abc&x=1";
        let script = completion_script("echo INSTALL OK; exit 4", url);
        let path = format!(
            "{}:{}",
            bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .env("PATH", path)
            .env("POSTED", &posted)
            .env("URL_FILE", &url_file)
            .status()
            .expect("sh");
        assert!(status.success());
        let body = std::fs::read_to_string(&posted).expect("posted body");
        assert!(body.contains("INSTALL OK"));
        assert!(body.contains(&format!("{COMPLETION_MARKER} exit=4")));
        assert_eq!(std::fs::read_to_string(&url_file).expect("url"), url);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn sessions_on_one_target_are_serialized() {
        let locks = Arc::new(TargetLocks::default());
        let first = locks.acquire("srv-1").await;
        let blocked = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("srv-1").await;
            })
        };
        let other = tokio::time::timeout(Duration::from_millis(200), locks.acquire("srv-2")).await;
        assert!(other.is_ok(), "other targets are independent");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("second session proceeds")
            .expect("join");
    }
}
