//! Daemon wiring: builds the cleanup loop from the configuration.
//!
//! In `run` mode the daemon:
//! 1. Opens the redb state store
//! 2. Builds the network probe and the HTTP provisioner
//! 3. Creates one health monitor per configured pool, giving the
//!    application-hosting pool the rescheduler
//! 4. Runs the cleanup driver until ctrl-c

use std::sync::Arc;

use anyhow::Context;
use shepherd_core::ShepherdConfig;
use shepherd_health::{CleanupDriver, HealthMonitor, LivenessProbe, NetProbe};
use shepherd_scheduler::{HttpProvisioner, Provisioner, Rescheduler};
use shepherd_state::{ServiceInstance, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};

/// Run the cleanup loop until ctrl-c.
pub async fn run(config: ShepherdConfig) -> anyhow::Result<()> {
    info!(pools = config.pools.len(), "shepherd daemon starting");

    let state = open_store(&config)?;
    let probe = Arc::new(NetProbe::from_config(&config.probe)?);
    let provisioner = Arc::new(HttpProvisioner::new(config.probe.timeout));
    let driver = build_driver(&config, state, probe, provisioner);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver_handle = tokio::spawn(driver.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    driver_handle.await.context("cleanup driver task failed")?;
    info!("shepherd daemon stopped");
    Ok(())
}

/// Register (or re-score) an instance.
pub fn register(config: &ShepherdConfig, pool: &str, address: &str, score: u64) -> anyhow::Result<()> {
    if !config.pools.iter().any(|p| p.name == pool) {
        warn!(%pool, "pool is not in the configuration; the cleanup loop will not watch it");
    }
    let state = open_store(config)?;
    state.put_instance(pool, address, score)?;
    info!(%pool, %address, score, "instance registered");
    Ok(())
}

/// Instances registered in `pool`.
pub fn instances(config: &ShepherdConfig, pool: &str) -> anyhow::Result<Vec<ServiceInstance>> {
    let state = open_store(config)?;
    Ok(state.list_instances(pool)?)
}

fn open_store(config: &ShepherdConfig) -> anyhow::Result<StateStore> {
    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let state = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");
    Ok(state)
}

/// One monitor per pool over a shared store; the hosting pool reschedules.
pub fn build_driver(
    config: &ShepherdConfig,
    state: StateStore,
    probe: Arc<dyn LivenessProbe>,
    provisioner: Arc<dyn Provisioner>,
) -> CleanupDriver {
    let call_timeout = config.store.call_timeout;

    let rescheduler = config.hosting_pool().map(|pool| {
        Arc::new(Rescheduler::new(
            Arc::new(state.clone()),
            Arc::new(state.clone()),
            provisioner,
            pool.name.clone(),
            &config.dispatch,
            call_timeout,
        ))
    });
    if rescheduler.is_none() {
        warn!("no app_hosting pool configured; dead instances will not trigger rescheduling");
    }

    let monitors = config
        .pools
        .iter()
        .map(|pool| {
            let monitor = HealthMonitor::new(
                pool.clone(),
                Arc::new(state.clone()),
                Arc::new(state.clone()),
                Arc::clone(&probe),
                call_timeout,
            );
            match (&rescheduler, config.hosting_pool()) {
                (Some(r), Some(hosting)) if hosting.name == pool.name => {
                    monitor.with_rescheduler(Arc::clone(r))
                }
                _ => monitor,
            }
        })
        .collect();

    CleanupDriver::new(&config.cleanup, monitors)
}
