mod logging;

use std::{env, process, sync::Arc, time::Duration};

use sync_client::{
    InMemorySessionStore, SessionFactory, SessionInfo, SyncClientConfig, SyncOrchestrator,
};
use sync_core::SyncStatus;
use sync_worker::{Reconnector, ReqwestTransport};
use tracing::{error, info};

const DEFAULT_WAIT_SECS: u64 = 60;

fn required(key: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => {
            eprintln!("{key} must be set for a live smoke run");
            process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SyncClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid sync configuration: {err}");
            process::exit(2);
        }
    };
    let info = SessionInfo {
        homeserver: env::var("PIKACHAT_HOMESERVER")
            .unwrap_or_else(|_| "https://matrix.example.org".to_owned()),
        user_id: required("PIKACHAT_USER"),
        device_id: required("PIKACHAT_DEVICE"),
        session_id: env::var("PIKACHAT_SESSION_ID").unwrap_or_else(|_| "smoke".to_owned()),
    };
    let access_token = required("PIKACHAT_ACCESS_TOKEN");
    let wait = env::var("PIKACHAT_SMOKE_WAIT_SECS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_WAIT_SECS);

    let factory = SessionFactory::new(
        Arc::new(ReqwestTransport::new(reqwest::Client::new())),
        Arc::new(InMemorySessionStore::default()),
        Arc::new(Reconnector::new(config.worker.retry)),
        config,
    );
    let registry = factory.worker_registry();
    let parts = match factory.make(info, access_token).await {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("Failed to create session: {err}");
            process::exit(1);
        }
    };

    let orchestrator = SyncOrchestrator::new(parts.session, registry.clone());
    if let Err(err) = orchestrator.start().await {
        eprintln!("Failed to start sync: {err}");
        registry.shutdown().await;
        process::exit(1);
    }

    let mut status = orchestrator.status();
    let reached = tokio::time::timeout(
        Duration::from_secs(wait),
        status.wait_for(|value| matches!(value, SyncStatus::Syncing | SyncStatus::Error)),
    )
    .await;

    let outcome = match reached {
        Ok(Some(SyncStatus::Syncing)) => {
            let token = orchestrator
                .session()
                .sync_info()
                .map(|info| info.token)
                .unwrap_or_default();
            info!(%token, "first sync completed");
            println!("Sync reached Syncing (next_batch={token}).");
            0
        }
        Ok(_) => {
            let reason = orchestrator
                .error()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown error".to_owned());
            error!(%reason, "sync failed");
            eprintln!("Sync failed: {reason}");
            1
        }
        Err(_) => {
            eprintln!(
                "Sync did not reach Syncing within {wait}s (status: {}).",
                orchestrator.current_status()
            );
            1
        }
    };

    orchestrator.stop().await;
    registry.shutdown().await;
    process::exit(outcome);
}
