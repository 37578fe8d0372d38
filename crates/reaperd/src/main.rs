//! Standalone expiry reaper.
//!
//! Sweeps the configured store on `HAGGLE_SWEEP_INTERVAL_MS` until Ctrl-C.
//! Without `DATABASE_URL` it runs against an empty in-memory store, which is
//! only useful for smoke-testing the process.

use std::sync::Arc;

use anyhow::Context;

use haggle_core::SystemClock;
use haggle_events::InMemoryEventBus;
use haggle_infra::{
    EngineConfig, ExpiryReaper, InMemoryDirectory, InMemoryNegotiationRepository,
    NegotiationEnvelope, NegotiationRepository, NegotiationService,
    PostgresNegotiationRepository,
};

const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    haggle_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    match config.database_url.clone() {
        Some(url) => {
            let repository = PostgresNegotiationRepository::connect(&url, DB_MAX_CONNECTIONS)
                .await
                .context("failed to connect to postgres")?;
            repository
                .migrate()
                .await
                .context("failed to apply schema")?;
            tracing::info!("using postgres negotiation store");
            run(repository, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set; sweeping an empty in-memory store");
            run(InMemoryNegotiationRepository::new(), config).await
        }
    }
}

async fn run<R>(repository: R, config: EngineConfig) -> anyhow::Result<()>
where
    R: NegotiationRepository + 'static,
{
    // Expiry never consults the directory, so the reaper runs with an empty one.
    let service = Arc::new(NegotiationService::new(
        repository,
        InMemoryDirectory::new(),
        InMemoryEventBus::<NegotiationEnvelope>::new(),
        config.rules,
    ));

    let handle = ExpiryReaper::new(service, config.sweep.batch_limit)
        .spawn(SystemClock, config.sweep.interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = tokio::task::spawn_blocking(move || {
        let stats = handle.stats();
        handle.shutdown();
        stats
    })
    .await
    .context("reaper shutdown task panicked")?;

    tracing::info!(
        sweeps_completed = stats.sweeps_completed,
        sweeps_failed = stats.sweeps_failed,
        negotiations_expired = stats.negotiations_expired,
        races_skipped = stats.races_skipped,
        "expiry reaper exited"
    );
    Ok(())
}
