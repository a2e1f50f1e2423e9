use anyhow::Context;
use protocol::config::{ScriptDefinition, TargetClass};
use protocol::OperationMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub(crate) struct ConsoleConfig {
    #[serde(default)]
    pub(crate) defaults: Option<ConsoleDefaults>,
    pub(crate) targets: Vec<TargetConfig>,
    #[serde(default)]
    pub(crate) scripts: Vec<ScriptDefinition>,
    #[serde(default)]
    pub(crate) queue: QueueConfig,
    #[serde(default)]
    pub(crate) callback: CallbackConfig,
    #[serde(default)]
    pub(crate) storage: StorageConfig,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConsoleDefaults {
    pub(crate) ssh_args: Option<Vec<String>>,
    pub(crate) ssh_password: Option<String>,
    pub(crate) connect_timeout_secs: Option<u64>,
    /// Sync wait when neither the request nor the script sets one.
    pub(crate) timeout: Option<String>,
    pub(crate) max_timeout: Option<String>,
    pub(crate) dispatch_timeout: Option<String>,
    pub(crate) max_output_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TargetConfig {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) desc: String,
    #[serde(default)]
    pub(crate) class: TargetClass,
    pub(crate) ssh: Option<String>,
    pub(crate) ssh_args: Option<Vec<String>>,
    pub(crate) ssh_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct QueueConfig {
    pub(crate) poll_interval: Option<String>,
    pub(crate) stale_after: Option<String>,
    pub(crate) lease_ttl: Option<String>,
    /// Groups of task types allowed to run together on one target.
    #[serde(default)]
    pub(crate) compatible: Vec<Vec<String>>,
    #[serde(default)]
    pub(crate) hooks: Vec<HookConfig>,
}

/// Binds a task `action_hook` to a script run with the task payload.
#[derive(Debug, Deserialize)]
pub(crate) struct HookConfig {
    pub(crate) name: String,
    pub(crate) script: String,
    #[serde(default)]
    pub(crate) mode: OperationMode,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CallbackConfig {
    /// Address targets use to reach this console.
    pub(crate) public_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StorageConfig {
    pub(crate) store_path: Option<PathBuf>,
    pub(crate) audit_dir: Option<PathBuf>,
}

pub(crate) fn load_console_config(path: &Path) -> anyhow::Result<ConsoleConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ConsoleConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    if config.targets.is_empty() {
        anyhow::bail!("config must include at least one target");
    }
    Ok(config)
}

/// Parses a humantime duration such as `90s` or `30m`.
pub(crate) fn parse_duration(
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> anyhow::Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("invalid duration for {field}: {raw}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
ssh_args = ["-o", "ServerAliveInterval=15"]
timeout = "2m"

[[targets]]
name = "srv-1"
desc = "edge server"
ssh = "ops@10.0.0.1"

[[targets]]
name = "app-1"
class = "app"
ssh = "deploy@10.0.1.1"
ssh_args = ["-p", "2222"]

[[scripts]]
id = "install_x"
template = "install-x --version {{version}}"
success_markers = ["INSTALL OK"]
failure_markers = ["INSTALL FAILED"]

[queue]
stale_after = "45m"
compatible = [["collect_logs", "health_check"]]

[[queue.hooks]]
name = "install"
script = "install_x"
mode = "async"

[callback]
public_base_url = "http://console.internal:19310"
"#;

    #[test]
    fn parses_full_config() {
        let config: ConsoleConfig = toml::from_str(SAMPLE).expect("parse");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].class, TargetClass::Server);
        assert_eq!(config.targets[1].class, TargetClass::App);
        assert_eq!(config.scripts[0].success_markers, vec!["INSTALL OK"]);
        assert_eq!(config.queue.hooks[0].mode, OperationMode::Async);
        assert_eq!(config.queue.compatible.len(), 1);
        assert_eq!(
            config.callback.public_base_url.as_deref(),
            Some("http://console.internal:19310")
        );
        assert!(config.storage.store_path.is_none());
    }

    #[test]
    fn durations_use_humantime() {
        assert_eq!(
            parse_duration("timeout", Some("2m"), Duration::ZERO).unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            parse_duration("timeout", None, Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
        let err = parse_duration("queue.stale_after", Some("soon"), Duration::ZERO)
            .unwrap_err()
            .to_string();
        assert!(err.contains("queue.stale_after"));
    }
}
