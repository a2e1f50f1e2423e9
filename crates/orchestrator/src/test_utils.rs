use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use protocol::config::{ScriptDefinition, TargetClass};
use system_utils::ssh::SshTarget;

use crate::classify::{MarkerClassifier, OutcomeClassifier};
use crate::error::GatewayError;
use crate::gateway::{DispatchTicket, ExecutionGateway, RawOutput};
use crate::target::{TargetDirectory, TargetSpec};
use crate::template::{ResolvedCommand, StaticScriptRegistry};
use crate::time::now_ms;

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("{prefix}-{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub(crate) fn fixture_scripts() -> Vec<ScriptDefinition> {
    vec![
        ScriptDefinition {
            id: "soft_reboot".to_string(),
            template: "systemctl soft-reboot --delay {{delay}} && echo REBOOT OK".to_string(),
            success_markers: vec!["REBOOT OK".to_string()],
            failure_markers: vec!["REBOOT FAILED".to_string()],
            secrets: Vec::new(),
            timeout_secs: Some(60),
        },
        ScriptDefinition {
            id: "install_x".to_string(),
            template: "install-x --version {{version}} --token {{token}}".to_string(),
            success_markers: vec!["INSTALL OK".to_string()],
            failure_markers: vec!["INSTALL FAILED".to_string()],
            secrets: vec!["token".to_string()],
            timeout_secs: None,
        },
    ]
}

pub(crate) fn fixture_registry() -> Arc<StaticScriptRegistry> {
    Arc::new(StaticScriptRegistry::from_definitions(&fixture_scripts()).expect("fixture scripts"))
}

pub(crate) fn fixture_classifier() -> Arc<dyn OutcomeClassifier> {
    Arc::new(MarkerClassifier::new(fixture_registry()))
}

pub(crate) fn fixture_targets() -> TargetDirectory {
    TargetDirectory::new(vec![
        TargetSpec::new("srv-1", TargetClass::Server, SshTarget::new("ops@10.0.0.1")),
        TargetSpec::new("srv-2", TargetClass::Server, SshTarget::new("ops@10.0.0.2")),
        TargetSpec::new("app-1", TargetClass::App, SshTarget::new("deploy@10.0.1.1")),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatewayCall {
    pub(crate) target_id: String,
    pub(crate) command_text: String,
    pub(crate) display_text: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) callback_url: Option<String>,
}

/// Gateway double returning queued replies; an empty queue answers with
/// `default_output`.
#[derive(Default)]
pub(crate) struct ScriptedGateway {
    replies: Mutex<VecDeque<Result<RawOutput, GatewayError>>>,
    default_output: String,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub(crate) fn answering(output: &str) -> Self {
        Self {
            default_output: output.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn push_reply(&self, reply: Result<RawOutput, GatewayError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<RawOutput, GatewayError> {
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(RawOutput {
                text: self.default_output.clone(),
                exit_code: Some(0),
                truncated: false,
            })
        })
    }

    fn record(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        timeout: Option<Duration>,
        callback_url: Option<&str>,
    ) {
        self.calls.lock().unwrap().push(GatewayCall {
            target_id: target.id.clone(),
            command_text: command.command_text().to_string(),
            display_text: command.display_text().to_string(),
            timeout,
            callback_url: callback_url.map(str::to_string),
        });
    }
}

#[async_trait]
impl ExecutionGateway for ScriptedGateway {
    async fn run_sync(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        timeout: Duration,
    ) -> Result<RawOutput, GatewayError> {
        self.record(target, command, Some(timeout), None);
        self.next_reply()
    }

    async fn dispatch_async(
        &self,
        target: &TargetSpec,
        command: &ResolvedCommand,
        callback_url: &str,
    ) -> Result<DispatchTicket, GatewayError> {
        self.record(target, command, None, Some(callback_url));
        self.next_reply().map(|_| DispatchTicket {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target.id.clone(),
            script_id: command.script_id().to_string(),
            dispatched_at_ms: now_ms(),
        })
    }
}
