use std::sync::Arc;

use anyhow::{Context, Result};
use sheetkeeper::{
    BackupManager, DocumentStore, JsonFileStore,
    config::AppConfig,
    npc::{JsonNpcStore, NpcMirror},
    web::{AppState, auth::AuthService, build_router},
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("failed to load application configuration")?;
    let roster = config.roster();

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let backups = BackupManager::new(&config.backup_dir, &config.store_path())
        .with_history_keep(config.history_keep);
    let store: Arc<dyn DocumentStore> = Arc::new(
        JsonFileStore::new(config.store_path(), backups.clone())
            .with_lock_policy(config.lock_policy()),
    );
    let npcs: Arc<dyn NpcMirror> =
        Arc::new(JsonNpcStore::new(config.npc_path()).with_lock_policy(config.lock_policy()));

    let doc = store
        .load()
        .await
        .context("failed to read the character store")?;
    info!(
        path = %config.store_path().display(),
        records = doc.record_count(),
        characters = roster.len(),
        "character store ready"
    );

    if config.auth.is_empty() {
        warn!("AUTH_TABLE is empty; nobody can log in");
    }
    let auth = AuthService::new(&config.auth, &roster)
        .context("invalid AUTH_TABLE")?
        .with_session_ttl(config.session_ttl);

    let app = build_router(AppState::new(store, Arc::new(backups), npcs, roster, auth));

    let addr = config.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(address = %addr, "sheetkeeper started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sheetkeeper=debug,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
