use anyhow::Context;
use std::path::PathBuf;
use tokio::process::Command;

const PASSWORD_ENV: &str = "OPSDECK_SSH_PASS";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s' \"$OPSDECK_SSH_PASS\"\n";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for one ssh destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: String,
    pub args: Vec<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

impl SshTarget {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            args: Vec::new(),
            password: None,
            connect_timeout_secs: None,
        }
    }
}

/// Builds `ssh -T <options> <args> <destination> <remote_command>`.
pub fn ssh_command(target: &SshTarget, remote_command: &str) -> anyhow::Result<Command> {
    let mut cmd = Command::new("ssh");
    if let Some(password) = target.password.as_deref() {
        apply_askpass_env(&mut cmd, password)?;
    }
    cmd.arg("-T");
    for option in ssh_options(target) {
        cmd.arg("-o").arg(option);
    }
    cmd.args(&target.args);
    cmd.arg(&target.destination);
    cmd.arg(remote_command);
    Ok(cmd)
}

pub fn ssh_options(target: &SshTarget) -> Vec<String> {
    let mut options = vec![
        "StrictHostKeyChecking=accept-new".to_string(),
        format!(
            "ConnectTimeout={}",
            target
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
        ),
    ];
    if target.password.is_none() {
        options.push("BatchMode=yes".to_string());
    }
    options
}

pub fn askpass_env(password: &str) -> anyhow::Result<Vec<(String, String)>> {
    let script = ensure_askpass_script()?;
    Ok(vec![
        (PASSWORD_ENV.to_string(), password.to_string()),
        ("SSH_ASKPASS".to_string(), script.to_string_lossy().to_string()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
        ("DISPLAY".to_string(), "1".to_string()),
    ])
}

pub fn ensure_askpass_script() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("failed to resolve HOME for askpass")?;
    let dir = PathBuf::from(home).join(".opsdeck");
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("ssh-askpass.sh");
    let current = std::fs::read(&path).ok();
    if current.as_deref() != Some(ASKPASS_SCRIPT.as_bytes()) {
        std::fs::write(&path, ASKPASS_SCRIPT)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

pub fn apply_askpass_env(cmd: &mut Command, password: &str) -> anyhow::Result<()> {
    for (key, value) in askpass_env(password)? {
        cmd.env(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_mode_only_without_password() {
        let mut target = SshTarget::new("deploy@10.0.0.5");
        assert!(ssh_options(&target).contains(&"BatchMode=yes".to_string()));
        target.password = Some("secret".to_string());
        assert!(!ssh_options(&target).contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn connect_timeout_is_configurable() {
        let mut target = SshTarget::new("deploy@10.0.0.5");
        assert!(ssh_options(&target).contains(&"ConnectTimeout=10".to_string()));
        target.connect_timeout_secs = Some(3);
        assert!(ssh_options(&target).contains(&"ConnectTimeout=3".to_string()));
    }

    #[test]
    fn command_ends_with_destination_and_remote_command() {
        let mut target = SshTarget::new("deploy@10.0.0.5");
        target.args = vec!["-p".to_string(), "2222".to_string()];
        let cmd = ssh_command(&target, "true").expect("command");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert_eq!(args.first().map(String::as_str), Some("-T"));
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, ["-p", "2222", "deploy@10.0.0.5", "true"]);
    }
}
