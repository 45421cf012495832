mod config;
mod logging;

use std::{error::Error, process::ExitCode, sync::Arc};

use chat_core::{
    ChatStore, SelfIdentity, SessionOutcome, StoreSnapshot, SyncEvent, SyncEventStream,
    SyncSessionManager,
};
use chat_matrix::{MatrixBackendConfig, MatrixMessagingBackend};
use chat_platform::{FileKeyValueStore, ScopedKeyValueStore};
use config::AppConfig;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, error, info, trace, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "chat-sync failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_env()?;
    info!(homeserver = %config.homeserver, user = %config.user, "starting chat-sync");
    debug!(?config, "configuration loaded");

    let backend = MatrixMessagingBackend::new(MatrixBackendConfig::new(
        config.homeserver.as_str(),
        config.matrix_store_dir(),
        None,
    ))
    .await?;
    let credentials = backend
        .login_password(&config.user, &config.password, None)
        .await?;

    let sync_config = config.sync_config();
    let kv = ScopedKeyValueStore::new(
        FileKeyValueStore::new(config.chat_store_root()),
        config.account_scope(),
    );
    let store = ChatStore::with_persistence(
        &sync_config,
        SelfIdentity::user_id(credentials.user_id.clone()),
        Arc::new(kv),
    );
    store.hydrate()?;

    let rooms = if config.rooms.is_empty() {
        backend.discover_joined_rooms().await?
    } else {
        config.rooms.clone()
    };
    info!(rooms = rooms.len(), "tracking conversations");

    let manager = SyncSessionManager::new(Arc::new(backend), store.clone(), &sync_config);
    let unread_reporter = tokio::spawn(report_unread(store.subscribe()));
    let event_logger = tokio::spawn(log_sync_events(manager.subscribe_events()));

    match manager
        .start_sync(credentials, rooms.into_iter().collect())
        .await?
    {
        SessionOutcome::Live { generation } => info!(generation, "sync running; Ctrl-C to stop"),
        SessionOutcome::Superseded { generation } => {
            warn!(generation, "sync session superseded during startup")
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.stop();
    unread_reporter.abort();
    event_logger.abort();
    Ok(())
}

async fn report_unread(mut snapshots: watch::Receiver<Arc<StoreSnapshot>>) {
    let mut last_total = None;
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let total = snapshot.total_unread();
        if last_total != Some(total) {
            info!(total, "unread messages");
            for (conversation_id, count) in &snapshot.unread_counts {
                if *count > 0 {
                    debug!(%conversation_id, count, "unread in conversation");
                }
            }
            last_total = Some(total);
        }

        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

async fn log_sync_events(mut events: SyncEventStream) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::BackfillFailed {
                conversation_id,
                code,
                ..
            }) => warn!(%conversation_id, %code, "conversation history unavailable"),
            Ok(event) => trace!(?event, "sync event"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "sync event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
