use std::sync::Arc;

use anyhow::Context;
use chainbox_gateway::config::Config;
use chainbox_gateway::gate::AccessGate;
use chainbox_gateway::routes;
use chainbox_gateway::state::AppState;
use chainbox_node::{AnvilLauncher, FileStore, InstanceManager};

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env()?;
    tracing::debug!(?cfg, "configuration loaded");

    let store = FileStore::open(&cfg.instances_dir)
        .await
        .with_context(|| format!("open instance store {}", cfg.instances_dir.display()))?;
    tracing::info!(dir = %store.dir().display(), "instance store ready");

    let launcher = AnvilLauncher::new(cfg.anvil());
    tracing::info!(
        bin = %launcher.config().bin,
        fork_url = %launcher.config().fork_url,
        chain_id = launcher.config().chain_id,
        "node launcher configured"
    );
    let manager = InstanceManager::new(Arc::new(store), Arc::new(launcher), cfg.ttl);

    // Nodes from a previous run died with it; their ports may be reused.
    let purged = manager
        .purge_stale()
        .await
        .context("purge stale instance records")?;
    if !purged.is_empty() {
        tracing::warn!(count = purged.len(), "removed instance records left by a previous run");
    }

    let state = AppState::new(manager.clone(), AccessGate::new(&cfg.shared_secret));
    let app = routes::router(state);

    tracing::info!(addr = %cfg.listen, ttl_secs = manager.ttl().as_secs(), "chainbox-gateway HTTP listening");
    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("bind {}", cfg.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(live = manager.live_count().await, "shutting down, destroying instances");
    manager.shutdown().await;

    Ok(())
}
