//! Health monitor: probes one pool's instances and removes the dead ones.
//!
//! A `HealthMonitor` is bound to a single service pool. Each cycle lists
//! the pool's instances and inspects them concurrently in a `JoinSet`;
//! every inspection is joined before the cycle reports back, and one
//! instance's failure never affects another's. For the application-hosting
//! pool, the applications of a removed instance are handed to the
//! rescheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shepherd_core::{PoolConfig, PoolRole};
use shepherd_scheduler::{RescheduleReport, Rescheduler};
use shepherd_state::{
    ApplicationDirectory, ApplicationRecord, InstanceRegistry, host_of, with_deadline,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, MonitorResult};
use crate::probe::{LivenessProbe, ProbeProtocol};

/// Outcome of inspecting one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Alive,
    /// Probe failed; the instance was removed from the registry.
    /// `rescheduled` is set when its applications were handed on.
    Removed {
        rescheduled: Option<RescheduleReport>,
    },
    /// Probe failed but the registry removal did not go through. The
    /// instance is still registered and is inspected again next cycle;
    /// its applications are left where they are until then.
    RemovalFailed { error: String },
}

/// Outcome of one pass over a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub pool: String,
    pub alive: Vec<String>,
    pub removed: Vec<String>,
    /// Inspections that did not complete (panicked, were cancelled, or
    /// could not remove a dead instance).
    pub failed: Vec<String>,
    pub reschedules: Vec<RescheduleReport>,
}

/// Inspects the instances of one service pool.
#[derive(Clone)]
pub struct HealthMonitor {
    pool: PoolConfig,
    protocol: ProbeProtocol,
    registry: Arc<dyn InstanceRegistry>,
    directory: Arc<dyn ApplicationDirectory>,
    probe: Arc<dyn LivenessProbe>,
    rescheduler: Option<Arc<Rescheduler>>,
    call_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: PoolConfig,
        registry: Arc<dyn InstanceRegistry>,
        directory: Arc<dyn ApplicationDirectory>,
        probe: Arc<dyn LivenessProbe>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            protocol: ProbeProtocol::from(pool.role),
            pool,
            registry,
            directory,
            probe,
            rescheduler: None,
            call_timeout,
        }
    }

    /// Attach the rescheduler used when an application-hosting instance dies.
    pub fn with_rescheduler(mut self, rescheduler: Arc<Rescheduler>) -> Self {
        if self.pool.role != PoolRole::AppHosting {
            warn!(pool = %self.pool.name, "rescheduler attached to a pool that does not host applications; ignored");
        }
        self.rescheduler = Some(rescheduler);
        self
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Probe one instance and remove it if it is dead.
    pub async fn inspect(&self, address: &str) -> Inspection {
        let pool = self.pool.name.as_str();
        if self.probe.probe(address, self.protocol).await {
            debug!(%pool, instance = %address, "instance alive");
            return Inspection::Alive;
        }

        warn!(%pool, instance = %address, "instance unreachable, removing");
        match with_deadline(self.call_timeout, self.registry.remove(pool, address)).await {
            Ok(true) => info!(%pool, instance = %address, "instance removed"),
            Ok(false) => debug!(%pool, instance = %address, "instance already absent"),
            Err(e) => {
                // Rescheduling now could plan onto the still-registered instance.
                error!(%pool, instance = %address, error = %e, "failed to remove instance; retrying next cycle");
                return Inspection::RemovalFailed {
                    error: e.to_string(),
                };
            }
        }

        let rescheduled = match (&self.rescheduler, self.pool.role) {
            (Some(rescheduler), PoolRole::AppHosting) => match self.orphans(address).await {
                Ok(apps) => Some(rescheduler.reschedule(apps).await),
                Err(e) => {
                    error!(%pool, instance = %address, error = %e, "rescheduling abandoned");
                    None
                }
            },
            _ => None,
        };

        Inspection::Removed { rescheduled }
    }

    /// Applications recorded against the host of `address`.
    async fn orphans(&self, address: &str) -> MonitorResult<Vec<ApplicationRecord>> {
        let host =
            host_of(address).ok_or_else(|| MonitorError::MalformedAddress(address.to_string()))?;
        let apps = with_deadline(self.call_timeout, self.directory.find_by_host(host)).await?;
        if !apps.is_empty() {
            info!(pool = %self.pool.name, %host, count = apps.len(), "orphaned applications found");
        }
        Ok(apps)
    }

    /// Inspect every instance currently listed for the pool.
    pub async fn inspect_pool(&self) -> PoolReport {
        let pool = self.pool.name.clone();
        let mut report = PoolReport {
            pool: pool.clone(),
            ..PoolReport::default()
        };

        let instances =
            match with_deadline(self.call_timeout, self.registry.fetch_instances(&pool)).await {
                Ok(instances) => instances,
                Err(e) => {
                    error!(%pool, error = %e, "failed to list instances; skipping cycle");
                    return report;
                }
            };

        let mut join_set = JoinSet::new();
        let mut task_address = HashMap::new();
        for address in instances {
            let monitor = self.clone();
            let task_addr = address.clone();
            let handle = join_set.spawn(async move {
                let inspection = monitor.inspect(&task_addr).await;
                (task_addr, inspection)
            });
            task_address.insert(handle.id(), address);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, (address, Inspection::Alive))) => report.alive.push(address),
                Ok((_, (address, Inspection::Removed { rescheduled }))) => {
                    report.removed.push(address);
                    report.reschedules.extend(rescheduled);
                }
                Ok((_, (address, Inspection::RemovalFailed { .. }))) => report.failed.push(address),
                Err(e) => {
                    let address = task_address.remove(&e.id()).unwrap_or_default();
                    error!(%pool, instance = %address, error = %e, "inspection did not complete");
                    report.failed.push(address);
                }
            }
        }

        debug!(
            %pool,
            alive = report.alive.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "pool inspected"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use shepherd_core::DispatchConfig;
    use shepherd_scheduler::{ProvisionError, Provisioner, RecreateRequest};
    use shepherd_state::{BoxFuture, InstanceAddress, StateError, StateResult, StateStore};

    /// Dead for listed addresses, panics for one, alive otherwise.
    #[derive(Default)]
    struct ScriptedProbe {
        dead: HashSet<String>,
        panics_on: Option<String>,
        seen: Mutex<Vec<(String, ProbeProtocol)>>,
    }

    impl ScriptedProbe {
        fn dead(addresses: &[&str]) -> Self {
            Self {
                dead: addresses.iter().map(|a| a.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl LivenessProbe for ScriptedProbe {
        fn probe<'a>(&'a self, address: &'a str, protocol: ProbeProtocol) -> BoxFuture<'a, bool> {
            Box::pin(async move {
                self.seen.lock().unwrap().push((address.to_string(), protocol));
                if self.panics_on.as_deref() == Some(address) {
                    panic!("probe blew up");
                }
                !self.dead.contains(address)
            })
        }
    }

    #[derive(Default)]
    struct RecordingProvisioner {
        requests: Mutex<Vec<RecreateRequest>>,
    }

    impl Provisioner for RecordingProvisioner {
        fn recreate<'a>(
            &'a self,
            request: &'a RecreateRequest,
        ) -> BoxFuture<'a, Result<(), ProvisionError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                Ok(())
            })
        }
    }

    /// Store-backed registry whose removals always fail.
    struct StuckRemovals(StateStore);

    impl InstanceRegistry for StuckRemovals {
        fn fetch_instances<'a>(
            &'a self,
            pool: &'a str,
        ) -> BoxFuture<'a, StateResult<Vec<InstanceAddress>>> {
            self.0.fetch_instances(pool)
        }

        fn fetch_least_loaded<'a>(
            &'a self,
            pool: &'a str,
            n: usize,
        ) -> BoxFuture<'a, StateResult<Vec<(InstanceAddress, u64)>>> {
            self.0.fetch_least_loaded(pool, n)
        }

        fn remove<'a>(&'a self, _pool: &'a str, _address: &'a str) -> BoxFuture<'a, StateResult<bool>> {
            Box::pin(async { Err(StateError::Write("disk full".to_string())) })
        }

        fn register<'a>(
            &'a self,
            pool: &'a str,
            address: &'a str,
            score: u64,
        ) -> BoxFuture<'a, StateResult<()>> {
            self.0.register(pool, address, score)
        }
    }

    fn pool(name: &str, role: PoolRole) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            role,
        }
    }

    fn monitor(store: &StateStore, config: PoolConfig, probe: ScriptedProbe) -> HealthMonitor {
        HealthMonitor::new(
            config,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(probe),
            Duration::from_secs(1),
        )
    }

    fn app(name: &str, host: &str) -> ApplicationRecord {
        ApplicationRecord {
            name: name.to_string(),
            language: "python".to_string(),
            owner: "bob".to_string(),
            host: host.to_string(),
            config: serde_json::Value::Null,
        }
    }

    fn hosting_monitor(
        store: &StateStore,
        probe: ScriptedProbe,
        provisioner: Arc<RecordingProvisioner>,
    ) -> HealthMonitor {
        let rescheduler = Rescheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            provisioner,
            "app",
            &DispatchConfig::default(),
            Duration::from_secs(1),
        );
        monitor(store, pool("app", PoolRole::AppHosting), probe)
            .with_rescheduler(Arc::new(rescheduler))
    }

    #[tokio::test]
    async fn alive_instance_is_kept() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("mysql", "10.0.0.1:3306", 0).unwrap();
        let monitor = monitor(&store, pool("mysql", PoolRole::Standard), ScriptedProbe::default());

        assert_eq!(monitor.inspect("10.0.0.1:3306").await, Inspection::Alive);
        assert!(store.get_instance("mysql", "10.0.0.1:3306").unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_instance_is_removed_without_rescheduling() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("mysql", "10.0.0.1:3306", 0).unwrap();
        store.put_application(&app("orders", "10.0.0.1")).unwrap();
        let monitor = monitor(
            &store,
            pool("mysql", PoolRole::Standard),
            ScriptedProbe::dead(&["10.0.0.1:3306"]),
        );

        let inspection = monitor.inspect("10.0.0.1:3306").await;

        assert_eq!(inspection, Inspection::Removed { rescheduled: None });
        assert!(store.get_instance("mysql", "10.0.0.1:3306").unwrap().is_none());
        // Not a hosting pool: application records are left alone.
        assert_eq!(store.applications_on_host("10.0.0.1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolver_pool_uses_datagram_probe() {
        let store = StateStore::open_in_memory().unwrap();
        let probe = Arc::new(ScriptedProbe::default());
        let monitor = HealthMonitor::new(
            pool("dns", PoolRole::Resolver),
            Arc::new(store.clone()),
            Arc::new(store),
            probe.clone(),
            Duration::from_secs(1),
        );

        monitor.inspect("10.0.0.53:53").await;

        let seen = probe.seen.lock().unwrap();
        assert_eq!(seen[0].1, ProbeProtocol::Datagram);
    }

    #[tokio::test]
    async fn removing_twice_is_harmless() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("mysql", "10.0.0.1:3306", 0).unwrap();
        let monitor = monitor(
            &store,
            pool("mysql", PoolRole::Standard),
            ScriptedProbe::dead(&["10.0.0.1:3306"]),
        );

        monitor.inspect("10.0.0.1:3306").await;
        let again = monitor.inspect("10.0.0.1:3306").await;

        assert_eq!(again, Inspection::Removed { rescheduled: None });
        assert!(store.list_instances("mysql").unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_hosting_instance_reschedules_its_applications() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("app", "10.0.0.5:9000", 0).unwrap();
        store.put_instance("app", "10.0.0.6:9000", 2).unwrap();
        store.put_application(&app("api", "10.0.0.5")).unwrap();
        store.put_application(&app("web", "10.0.0.5")).unwrap();
        let provisioner = Arc::new(RecordingProvisioner::default());
        let monitor =
            hosting_monitor(&store, ScriptedProbe::dead(&["10.0.0.5:9000"]), provisioner.clone());

        let Inspection::Removed {
            rescheduled: Some(report),
        } = monitor.inspect("10.0.0.5:9000").await
        else {
            panic!("expected a reschedule");
        };

        assert_eq!(report.placed.len(), 2);
        assert!(report.placed.iter().all(|p| p.destination == "10.0.0.6:9000"));
        assert_eq!(provisioner.requests.lock().unwrap().len(), 2);
        assert!(store.applications_on_host("10.0.0.5").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_removal_skips_rescheduling() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("app", "10.0.0.5:9000", 0).unwrap();
        store.put_instance("app", "10.0.0.6:9000", 2).unwrap();
        store.put_application(&app("api", "10.0.0.5")).unwrap();
        let registry = Arc::new(StuckRemovals(store.clone()));
        let provisioner = Arc::new(RecordingProvisioner::default());
        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(store.clone()),
            provisioner.clone(),
            "app",
            &DispatchConfig::default(),
            Duration::from_secs(1),
        );
        let monitor = HealthMonitor::new(
            pool("app", PoolRole::AppHosting),
            registry,
            Arc::new(store.clone()),
            Arc::new(ScriptedProbe::dead(&["10.0.0.5:9000"])),
            Duration::from_secs(1),
        )
        .with_rescheduler(Arc::new(rescheduler));

        let report = monitor.inspect_pool().await;

        assert_eq!(report.failed, vec!["10.0.0.5:9000"]);
        assert!(report.removed.is_empty());
        assert!(report.reschedules.is_empty());
        assert!(provisioner.requests.lock().unwrap().is_empty());
        assert_eq!(store.applications_on_host("10.0.0.5").unwrap().len(), 1);
        assert!(store.get_instance("app", "10.0.0.5:9000").unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_address_is_still_removed() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance("app", "10.0.0.5", 0).unwrap();
        let provisioner = Arc::new(RecordingProvisioner::default());
        let monitor = hosting_monitor(&store, ScriptedProbe::dead(&["10.0.0.5"]), provisioner.clone());

        let inspection = monitor.inspect("10.0.0.5").await;

        assert_eq!(inspection, Inspection::Removed { rescheduled: None });
        assert!(store.list_instances("app").unwrap().is_empty());
        assert!(provisioner.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failing_inspection_does_not_affect_the_rest() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 1..=5 {
            store.put_instance("mysql", &format!("10.0.0.{i}:3306"), 0).unwrap();
        }
        let probe = ScriptedProbe {
            panics_on: Some("10.0.0.3:3306".to_string()),
            ..ScriptedProbe::dead(&["10.0.0.2:3306", "10.0.0.4:3306"])
        };
        let monitor = monitor(&store, pool("mysql", PoolRole::Standard), probe);

        let mut report = monitor.inspect_pool().await;
        report.alive.sort();
        report.removed.sort();

        assert_eq!(report.alive, vec!["10.0.0.1:3306", "10.0.0.5:3306"]);
        assert_eq!(report.removed, vec!["10.0.0.2:3306", "10.0.0.4:3306"]);
        assert_eq!(report.failed, vec!["10.0.0.3:3306"]);

        let mut remaining: Vec<_> = store
            .list_instances("mysql")
            .unwrap()
            .into_iter()
            .map(|i| i.address)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["10.0.0.1:3306", "10.0.0.3:3306", "10.0.0.5:3306"]);
    }

    #[tokio::test]
    async fn empty_pool_reports_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let monitor = monitor(&store, pool("mysql", PoolRole::Standard), ScriptedProbe::default());

        let report = monitor.inspect_pool().await;

        assert_eq!(report.pool, "mysql");
        assert!(report.alive.is_empty() && report.removed.is_empty() && report.failed.is_empty());
    }
}
