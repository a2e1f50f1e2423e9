mod cli;
mod config;
mod events;
mod http;
mod logging;
mod state;

use crate::cli::Args;
use crate::config::load_console_config;
use crate::events::spawn_task_forwarder;
use crate::logging::init_tracing;
use crate::state::{build_services, resolve_settings};
use anyhow::Context;
use clap::Parser;
use orchestrator::{spawn_dispatch_worker, FileStore, RecordStore};
use std::sync::Arc;
use system_utils::path::expand_tilde;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&expand_tilde(&args.log_dir), args.log_to_stderr)?;

    info!(
        listen_addr = %args.listen_addr,
        config = %args.config.display(),
        "console starting"
    );
    let config = load_console_config(&args.config)?;
    let settings = resolve_settings(&config, &args.listen_addr)?;
    let store: Arc<dyn RecordStore> = Arc::new(
        FileStore::open(&settings.store_path)
            .with_context(|| format!("failed to open store {}", settings.store_path.display()))?,
    );
    let services = build_services(&config, &settings, store)?;
    info!(
        targets = services.app.orchestrator.targets().len(),
        scripts = config.scripts.len(),
        hooks = config.queue.hooks.len(),
        callback_base_url = %settings.callback_base_url,
        store = %settings.store_path.display(),
        "console configured"
    );

    let shutdown = CancellationToken::new();
    let drain = CancellationToken::new();
    let dispatch_worker = spawn_dispatch_worker(
        Arc::clone(&services.dispatcher),
        services.completions,
        drain.clone(),
    );
    let forwarder = spawn_task_forwarder(
        services.app.queue.subscribe(),
        services.app.event_tx.clone(),
        shutdown.clone(),
    );
    let runner = tokio::spawn(Arc::clone(&services.runner).run(shutdown.clone()));

    let app = http::router(services.app);
    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "console listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await?;
    info!("console shutting down");
    shutdown.cancel();
    let _ = runner.await;
    // No request is in flight any more; deliver what the callbacks queued.
    drain.cancel();
    let _ = tokio::join!(dispatch_worker, forwarder);
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
