use crate::config::{parse_duration, ConsoleConfig, ConsoleDefaults, TargetConfig};
use crate::events::EventStreamListener;
use orchestrator::{
    completion_channel, wire_default_listeners, AuditLog, CallbackReceiver, CallbackRegistry,
    Compatibility, CompletionDispatcher, CompletionEvent, MarkerClassifier, Orchestrator,
    OrchestratorSettings, QueueRunner, RecordStore, RunnerConfig, ScriptRegistry,
    ScriptTaskHandler, SshGateway, StaticScriptRegistry, TargetDirectory, TargetSpec, TaskQueue,
};
use protocol::config::{is_valid_identifier, parse_ssh_destination};
use protocol::control::ConsoleEvent;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use system_utils::path::expand_tilde;
use system_utils::ssh::SshTarget;
use tokio::sync::{broadcast, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub(crate) struct ServiceSettings {
    pub(crate) timeout: Duration,
    pub(crate) max_timeout: Duration,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) max_output_bytes: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) stale_after: Duration,
    pub(crate) lease_ttl: Duration,
    pub(crate) callback_base_url: String,
    pub(crate) store_path: PathBuf,
    pub(crate) audit_dir: PathBuf,
}

pub(crate) fn resolve_settings(
    config: &ConsoleConfig,
    listen_addr: &str,
) -> anyhow::Result<ServiceSettings> {
    let empty = ConsoleDefaults::default();
    let defaults = config.defaults.as_ref().unwrap_or(&empty);
    let queue = &config.queue;
    let settings = ServiceSettings {
        timeout: parse_duration(
            "defaults.timeout",
            defaults.timeout.as_deref(),
            Duration::from_secs(120),
        )?,
        max_timeout: parse_duration(
            "defaults.max_timeout",
            defaults.max_timeout.as_deref(),
            Duration::from_secs(30 * 60),
        )?,
        dispatch_timeout: parse_duration(
            "defaults.dispatch_timeout",
            defaults.dispatch_timeout.as_deref(),
            Duration::from_secs(30),
        )?,
        max_output_bytes: defaults.max_output_bytes.unwrap_or(1024 * 1024),
        poll_interval: parse_duration(
            "queue.poll_interval",
            queue.poll_interval.as_deref(),
            Duration::from_secs(2),
        )?,
        stale_after: parse_duration(
            "queue.stale_after",
            queue.stale_after.as_deref(),
            Duration::from_secs(30 * 60),
        )?,
        lease_ttl: parse_duration(
            "queue.lease_ttl",
            queue.lease_ttl.as_deref(),
            Duration::from_secs(30),
        )?,
        callback_base_url: config
            .callback
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{listen_addr}")),
        store_path: expand_tilde(
            config
                .storage
                .store_path
                .as_deref()
                .unwrap_or_else(|| std::path::Path::new("data/opsdeck-store.json")),
        ),
        audit_dir: expand_tilde(
            config
                .storage
                .audit_dir
                .as_deref()
                .unwrap_or_else(|| std::path::Path::new("logs/operations")),
        ),
    };
    if settings.poll_interval.is_zero() {
        anyhow::bail!("queue.poll_interval must be greater than zero");
    }
    if settings.timeout > settings.max_timeout {
        anyhow::bail!("defaults.timeout exceeds defaults.max_timeout");
    }
    Ok(settings)
}

pub(crate) fn build_targets(config: &ConsoleConfig) -> anyhow::Result<Vec<TargetSpec>> {
    let empty = ConsoleDefaults::default();
    let defaults = config.defaults.as_ref().unwrap_or(&empty);
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        if !is_valid_identifier(&target.name) {
            anyhow::bail!("target name {:?} must be [A-Za-z0-9_.-]+", target.name);
        }
        if !seen.insert(target.name.clone()) {
            anyhow::bail!("duplicate target name: {}", target.name);
        }
        targets.push(resolve_target(defaults, target)?);
    }
    Ok(targets)
}

fn resolve_target(defaults: &ConsoleDefaults, target: &TargetConfig) -> anyhow::Result<TargetSpec> {
    let Some(destination) = target.ssh.as_deref() else {
        anyhow::bail!("target {} missing ssh destination", target.name);
    };
    if parse_ssh_destination(destination).is_none() {
        anyhow::bail!("target {} ssh must be in the form user@host", target.name);
    }
    let mut ssh = SshTarget::new(destination.trim());
    ssh.args = defaults.ssh_args.clone().unwrap_or_default();
    if let Some(extra) = target.ssh_args.clone() {
        ssh.args.extend(extra);
    }
    ssh.password = target
        .ssh_password
        .clone()
        .or_else(|| defaults.ssh_password.clone());
    ssh.connect_timeout_secs = defaults.connect_timeout_secs;
    if ssh.password.is_some() {
        tracing::warn!(
            target = %target.name,
            "ssh_password is set; prefer SSH key auth (keyboard-interactive/2FA is not supported)"
        );
    }
    let mut spec = TargetSpec::new(&target.name, target.class, ssh);
    spec.desc = target.desc.clone();
    Ok(spec)
}

/// Handles shared by every HTTP route.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) receiver: Arc<CallbackReceiver>,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) event_tx: broadcast::Sender<ConsoleEvent>,
    pub(crate) stale_after: Duration,
}

pub(crate) struct Services {
    pub(crate) app: AppState,
    pub(crate) runner: Arc<QueueRunner>,
    pub(crate) dispatcher: Arc<CompletionDispatcher>,
    pub(crate) completions: mpsc::Receiver<CompletionEvent>,
}

pub(crate) fn build_services(
    config: &ConsoleConfig,
    settings: &ServiceSettings,
    store: Arc<dyn RecordStore>,
) -> anyhow::Result<Services> {
    let targets = Arc::new(TargetDirectory::new(build_targets(config)?));
    let registry: Arc<dyn ScriptRegistry> = Arc::new(
        StaticScriptRegistry::from_definitions(&config.scripts)
            .map_err(|err| anyhow::anyhow!("invalid [[scripts]]: {err}"))?,
    );
    let classifier = Arc::new(MarkerClassifier::new(Arc::clone(&registry)));
    let gateway = Arc::new(
        SshGateway::new(AuditLog::new(settings.audit_dir.clone()))
            .with_max_output_bytes(settings.max_output_bytes)
            .with_dispatch_timeout(settings.dispatch_timeout),
    );
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        Compatibility::new(config.queue.compatible.clone()),
    ));
    let dispatcher = Arc::new(CompletionDispatcher::new());
    wire_default_listeners(&dispatcher, Arc::clone(&queue), Arc::clone(&store));
    dispatcher.on_operation_complete(
        None,
        None,
        Arc::new(EventStreamListener::new(event_tx.clone())),
    );

    let callbacks = CallbackRegistry::new(Arc::clone(&store));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings {
            callback_base_url: settings.callback_base_url.clone(),
            default_timeout: settings.timeout,
            max_timeout: settings.max_timeout,
        },
        Arc::clone(&targets),
        Arc::clone(&registry),
        gateway,
        classifier.clone(),
        callbacks.clone(),
        Arc::clone(&dispatcher),
    ));
    let (completion_tx, completions) = completion_channel();
    let receiver = Arc::new(CallbackReceiver::new(
        callbacks,
        classifier,
        targets,
        completion_tx,
    ));

    let mut runner = QueueRunner::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        RunnerConfig {
            poll_interval: settings.poll_interval,
            stale_after: settings.stale_after,
            lease_ttl: settings.lease_ttl,
            ..RunnerConfig::default()
        },
    );
    let mut hooks = HashSet::new();
    for hook in &config.queue.hooks {
        if !hooks.insert(hook.name.as_str()) {
            anyhow::bail!("duplicate queue hook: {}", hook.name);
        }
        if registry.lookup(&hook.script).is_none() {
            anyhow::bail!("queue hook {} references unknown script {}", hook.name, hook.script);
        }
        runner.register(
            hook.name.clone(),
            Arc::new(ScriptTaskHandler::new(
                Arc::clone(&orchestrator),
                hook.script.clone(),
                hook.mode,
            )),
        );
    }

    Ok(Services {
        app: AppState {
            orchestrator,
            queue,
            receiver,
            store,
            event_tx,
            stale_after: settings.stale_after,
        },
        runner: Arc::new(runner),
        dispatcher,
        completions,
    })
}
