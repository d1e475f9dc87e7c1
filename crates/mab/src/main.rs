use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mab_core::{
    cache::{MemoryStore, ResponseCache},
    config::Config,
    gatekeeper::Gatekeeper,
    router::{CommandRouter, Ports},
};

mod console;
mod offline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    mab_core::logging::init("mab", &cfg.log_level)?;

    let gatekeeper = Arc::new(Gatekeeper::new(&cfg)?);
    gatekeeper.start().await;

    let purge_cancel = CancellationToken::new();
    let mut purger = None;
    let cache = if cfg.cache.enabled {
        let store = Arc::new(MemoryStore::new());
        purger = Some(store.spawn_purger(cfg.cache.purge_interval, purge_cancel.clone()));
        let cache = ResponseCache::new(store, cfg.cache.key_prefix.clone(), cfg.cache.default_ttl);
        if cfg.cache.retry_enabled {
            cache.with_retry(cfg.retry.cache.clone())
        } else {
            cache
        }
    } else {
        ResponseCache::disabled(cfg.cache.key_prefix.clone())
    };

    let ports = Ports {
        messenger: Arc::new(console::ConsoleMessenger::new()),
        generator: Arc::new(offline::NoGenerator),
        documents: Arc::new(offline::NoDocuments),
    };
    let router = Arc::new(CommandRouter::new(
        gatekeeper.clone(),
        cache,
        ports,
        cfg.retry.clone(),
        cfg.command_prefix.clone(),
    ));

    info!(
        users = gatekeeper.access().stats().assigned_users,
        rate_limiting = cfg.security.enabled,
        cache = cfg.cache.enabled,
        "mab started; reading `identity room text` lines from stdin"
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, shutting down");
        on_signal.cancel();
    });

    let result = console::run(router, shutdown.clone()).await;

    shutdown.cancel();
    gatekeeper.shutdown().await;
    purge_cancel.cancel();
    if let Some(handle) = purger {
        if let Err(e) = handle.await {
            warn!(error = %e, "cache purger did not exit cleanly");
        }
    }
    info!("mab stopped");
    result
}
