//! pairlinkd — the pairlink relay daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use pairlink_api::ApiState;
use pairlink_core::config::RelayConfig;
use pairlink_services::{idle_reaper, Hub, SqliteStore, Store};

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
/// Ledger retention runs once a day.
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn usage() -> ! {
    eprintln!(
        "usage: pairlinkd [--addr <listen>] [--domain <tls-domain>] [--db <path>] [--admin-key <key>]"
    );
    std::process::exit(2);
}

fn apply_flags(config: &mut RelayConfig) {
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = |name: &str| args.next().unwrap_or_else(|| {
            eprintln!("missing value for {name}");
            usage()
        });
        match flag.as_str() {
            "--addr" => config.network.listen_addr = value("--addr"),
            "--domain" => config.network.tls_domain = value("--domain"),
            "--db" => config.store.path = value("--db").into(),
            "--admin-key" => config.admin.key = value("--admin-key"),
            _ => usage(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = RelayConfig::load().context("failed to load config")?;
    apply_flags(&mut config);

    let addr = config.listen_socket_addr()?;
    if !config.network.tls_domain.is_empty() {
        tracing::info!(
            domain = %config.network.tls_domain,
            "tls_domain set; expecting a fronting proxy to terminate TLS"
        );
    }

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.store.path)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?,
    );
    tracing::info!(path = %config.store.path.display(), "store opened");

    let hub = Arc::new(Hub::new(store.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Ctrl-C / SIGTERM fan-out.
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = tx.send(());
            }
        });
    }

    tokio::spawn(idle_reaper(hub.clone(), shutdown_tx.subscribe()));
    tokio::spawn(retention_loop(
        store.clone(),
        config.store.retention_days,
        shutdown_tx.subscribe(),
    ));

    let admin_key = if config.admin.key.is_empty() {
        None
    } else {
        Some(config.admin.key.clone())
    };
    let state = ApiState::new(hub, admin_key);

    let mut serve_rx = shutdown_tx.subscribe();
    let serve_shutdown = async move {
        let _ = serve_rx.recv().await;
    };

    let mut deadline_rx = shutdown_tx.subscribe();
    tokio::select! {
        result = pairlink_api::serve(state, addr, serve_shutdown) => {
            result.context("server exited")?;
        }
        _ = async {
            let _ = deadline_rx.recv().await;
            tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        } => {
            tracing::info!("drain deadline reached, exiting");
        }
    }

    Ok(())
}

/// Daily bandwidth-ledger pruning, shutdown-aware.
async fn retention_loop(
    store: Arc<dyn Store>,
    retention_days: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    interval.tick().await; // fires immediately; skip the first
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("retention task shutting down");
                return;
            }
            _ = interval.tick() => {
                match store.prune_ledger(retention_days) {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, retention_days, "ledger pruned");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "ledger prune failed"),
                }
            }
        }
    }
}
