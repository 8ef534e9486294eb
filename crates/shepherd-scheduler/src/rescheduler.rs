//! Rescheduler: moves the applications of a lost instance onto survivors.
//!
//! Given the applications that were recorded against a dead host, the
//! rescheduler:
//! 1. Fetches one least-loaded snapshot of the hosting pool, one candidate
//!    per application
//! 2. Asks the planner for a level-filling distribution
//! 3. Walks plan and applications together, giving each candidate its full
//!    count before moving on
//! 4. Dispatches recreate calls through the bounded pool. Failed jobs are
//!    re-planned over the projected scores of the candidates that have not
//!    rejected a recreate yet; once none are left a fresh snapshot is taken
//!    with the rejecting instances filtered out
//! 5. Points each placed application's record at its new host
//!
//! Applications that cannot be placed are stranded: their old host is gone
//! and will not be inspected again, so they are logged as alerts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use shepherd_core::DispatchConfig;
use shepherd_placement::{DistributionPlan, plan_distribution};
use shepherd_state::{ApplicationDirectory, ApplicationRecord, InstanceRegistry, host_of, with_deadline};
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchPool;
use crate::error::{SchedulerError, SchedulerResult};
use crate::provisioner::{Provisioner, RecreateRequest};

/// An application recreated on a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub owner: String,
    pub name: String,
    pub destination: String,
    /// Recreate calls made, including the successful one.
    pub attempts: u32,
}

/// An application that could not be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stranded {
    pub owner: String,
    pub name: String,
    pub reason: String,
}

/// Outcome of one `reschedule` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescheduleReport {
    pub placed: Vec<Placement>,
    pub stranded: Vec<Stranded>,
}

impl RescheduleReport {
    pub fn is_empty(&self) -> bool {
        self.placed.is_empty() && self.stranded.is_empty()
    }
}

/// One application moving through dispatch rounds.
struct Job {
    record: ApplicationRecord,
    destination: String,
    attempts: u32,
}

/// Candidates of the latest plan with their projected scores, ascending.
type Projection = Vec<(String, u64)>;

/// Re-places orphaned applications onto the hosting pool.
pub struct Rescheduler {
    registry: Arc<dyn InstanceRegistry>,
    directory: Arc<dyn ApplicationDirectory>,
    dispatch: DispatchPool,
    /// The application-hosting pool.
    pool: String,
    retry_limit: u32,
    call_timeout: Duration,
}

impl Rescheduler {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        directory: Arc<dyn ApplicationDirectory>,
        provisioner: Arc<dyn Provisioner>,
        pool: impl Into<String>,
        dispatch: &DispatchConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            dispatch: DispatchPool::new(provisioner, dispatch.worker_count(), dispatch.timeout),
            pool: pool.into(),
            retry_limit: dispatch.retry_limit,
            call_timeout,
        }
    }

    /// Re-place `apps`. An empty input returns immediately without touching the registry.
    pub async fn reschedule(&self, apps: Vec<ApplicationRecord>) -> RescheduleReport {
        let mut report = RescheduleReport::default();
        if apps.is_empty() {
            return report;
        }

        // Instances that rejected a recreate during this call.
        let mut rejected = HashSet::new();

        let plan = match self.fresh_plan(apps.len(), &rejected).await {
            Ok(plan) => plan,
            Err(e) => {
                for record in &apps {
                    self.strand(&mut report, record, format!("no plan: {e}"));
                }
                return report;
            }
        };

        let mut projection = projected_scores(&plan);
        let mut pending: Vec<Job> = apps
            .into_iter()
            .zip(plan.assignments())
            .map(|(record, destination)| Job {
                record,
                destination: destination.to_string(),
                attempts: 0,
            })
            .collect();

        while !pending.is_empty() {
            let failed = self.dispatch_round(pending, &mut rejected, &mut report).await;
            pending = self
                .reassign(failed, &mut projection, &rejected, &mut report)
                .await;
        }

        info!(
            pool = %self.pool,
            placed = report.placed.len(),
            stranded = report.stranded.len(),
            "reschedule complete"
        );
        report
    }

    /// Least-loaded snapshot planned for `count` applications, skipping `exclude`.
    ///
    /// The snapshot is widened by the excluded count so that up to `count`
    /// eligible candidates remain after filtering.
    async fn fresh_plan(
        &self,
        count: usize,
        exclude: &HashSet<String>,
    ) -> SchedulerResult<DistributionPlan> {
        let snapshot = with_deadline(
            self.call_timeout,
            self.registry
                .fetch_least_loaded(&self.pool, count + exclude.len()),
        )
        .await?;
        let candidates: Vec<(String, u64)> = snapshot
            .into_iter()
            .filter(|(address, _)| !exclude.contains(address))
            .collect();
        Ok(plan_distribution(count, &candidates)?)
    }

    /// Dispatch every pending job once; return the ones that failed.
    async fn dispatch_round(
        &self,
        jobs: Vec<Job>,
        rejected: &mut HashSet<String>,
        report: &mut RescheduleReport,
    ) -> Vec<Job> {
        let requests = jobs
            .iter()
            .map(|job| {
                info!(
                    app = %job.record.name,
                    owner = %job.record.owner,
                    destination = %job.destination,
                    attempt = job.attempts + 1,
                    "re-scheduling application"
                );
                RecreateRequest::for_record(&job.record, &job.destination)
            })
            .collect();

        let outcomes = self.dispatch.run(requests).await;

        let mut failed = Vec::new();
        for (mut job, (_, outcome)) in jobs.into_iter().zip(outcomes) {
            job.attempts += 1;
            match outcome {
                Ok(()) => {
                    self.record_move(&job).await;
                    report.placed.push(Placement {
                        owner: job.record.owner.clone(),
                        name: job.record.name.clone(),
                        destination: job.destination.clone(),
                        attempts: job.attempts,
                    });
                }
                Err(e) => {
                    warn!(
                        app = %job.record.name,
                        owner = %job.record.owner,
                        destination = %job.destination,
                        attempt = job.attempts,
                        error = %e,
                        "recreate failed"
                    );
                    rejected.insert(job.destination.clone());
                    if job.attempts > self.retry_limit {
                        let reason = format!("gave up after {} attempts: {e}", job.attempts);
                        self.strand(report, &job.record, reason);
                    } else {
                        failed.push(job);
                    }
                }
            }
        }
        failed
    }

    /// Re-plan the failed jobs onto instances that have not rejected a recreate.
    ///
    /// The untried candidates of the current projection are filled first,
    /// so concurrent failures spread the same way the first plan did. Only
    /// when every projected candidate has rejected is the registry asked
    /// again.
    async fn reassign(
        &self,
        failed: Vec<Job>,
        projection: &mut Projection,
        rejected: &HashSet<String>,
        report: &mut RescheduleReport,
    ) -> Vec<Job> {
        if failed.is_empty() {
            return failed;
        }

        let untried: Projection = projection
            .iter()
            .filter(|(address, _)| !rejected.contains(address))
            .cloned()
            .collect();
        let plan = if untried.is_empty() {
            debug!(count = failed.len(), "plan exhausted, fetching a fresh snapshot");
            self.fresh_plan(failed.len(), rejected).await
        } else {
            plan_distribution(failed.len(), &untried).map_err(SchedulerError::from)
        };

        match plan {
            Ok(plan) => {
                *projection = projected_scores(&plan);
                failed
                    .into_iter()
                    .zip(plan.assignments())
                    .map(|(mut job, destination)| {
                        job.destination = destination.to_string();
                        job
                    })
                    .collect()
            }
            Err(e) => {
                for job in &failed {
                    self.strand(report, &job.record, format!("no plan for retry: {e}"));
                }
                Vec::new()
            }
        }
    }

    /// Point the record at its new host so the dead host no longer matches it.
    async fn record_move(&self, job: &Job) {
        let Some(host) = host_of(&job.destination) else {
            error!(destination = %job.destination, "destination address is malformed; record not updated");
            return;
        };
        let update = self
            .directory
            .update_host(&job.record.owner, &job.record.name, host);
        if let Err(e) = with_deadline(self.call_timeout, update).await {
            error!(
                app = %job.record.name,
                owner = %job.record.owner,
                error = %e,
                "failed to update application host"
            );
        }
    }

    fn strand(&self, report: &mut RescheduleReport, record: &ApplicationRecord, reason: String) {
        error!(
            alert = true,
            pool = %self.pool,
            app = %record.name,
            owner = %record.owner,
            %reason,
            "application stranded; manual rescheduling required"
        );
        report.stranded.push(Stranded {
            owner: record.owner.clone(),
            name: record.name.clone(),
            reason,
        });
    }
}

/// Plan candidates at their post-plan scores, stable-sorted ascending.
fn projected_scores(plan: &DistributionPlan) -> Projection {
    let mut projected: Projection = plan
        .entries
        .iter()
        .map(|e| (e.address.clone(), e.final_score))
        .collect();
    projected.sort_by_key(|(_, score)| *score);
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shepherd_state::{BoxFuture, InstanceAddress, StateResult, StateStore};

    use crate::error::ProvisionError;

    /// Records every request; fails for listed destinations.
    #[derive(Default)]
    struct RecordingProvisioner {
        requests: Mutex<Vec<RecreateRequest>>,
        failing: Mutex<HashSet<String>>,
    }

    impl RecordingProvisioner {
        fn failing(destinations: &[&str]) -> Self {
            Self {
                failing: Mutex::new(destinations.iter().map(|d| d.to_string()).collect()),
                ..Self::default()
            }
        }

        fn destinations(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.destination.clone())
                .collect()
        }
    }

    impl Provisioner for RecordingProvisioner {
        fn recreate<'a>(
            &'a self,
            request: &'a RecreateRequest,
        ) -> BoxFuture<'a, Result<(), ProvisionError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                if self.failing.lock().unwrap().contains(&request.destination) {
                    return Err(ProvisionError::Rejected {
                        status: 503,
                        body: "busy".to_string(),
                    });
                }
                Ok(())
            })
        }
    }

    /// Registry wrapper counting every call.
    struct CountingRegistry {
        inner: StateStore,
        calls: AtomicUsize,
    }

    impl InstanceRegistry for CountingRegistry {
        fn fetch_instances<'a>(
            &'a self,
            pool: &'a str,
        ) -> BoxFuture<'a, StateResult<Vec<InstanceAddress>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_instances(pool)
        }

        fn fetch_least_loaded<'a>(
            &'a self,
            pool: &'a str,
            n: usize,
        ) -> BoxFuture<'a, StateResult<Vec<(InstanceAddress, u64)>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_least_loaded(pool, n)
        }

        fn remove<'a>(&'a self, pool: &'a str, address: &'a str) -> BoxFuture<'a, StateResult<bool>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(pool, address)
        }

        fn register<'a>(
            &'a self,
            pool: &'a str,
            address: &'a str,
            score: u64,
        ) -> BoxFuture<'a, StateResult<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.register(pool, address, score)
        }
    }

    fn app(name: &str, host: &str) -> ApplicationRecord {
        ApplicationRecord {
            name: name.to_string(),
            language: "node".to_string(),
            owner: "alice".to_string(),
            host: host.to_string(),
            config: serde_json::json!({ "index": "index.js" }),
        }
    }

    fn dispatch_config(retry_limit: u32) -> DispatchConfig {
        DispatchConfig {
            workers: 2,
            retry_limit,
            timeout: Duration::from_secs(5),
        }
    }

    fn seeded_store(instances: &[(&str, u64)], apps: &[ApplicationRecord]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for (address, score) in instances {
            store.put_instance("app", address, *score).unwrap();
        }
        for record in apps {
            store.put_application(record).unwrap();
        }
        store
    }

    fn rescheduler(
        store: &StateStore,
        provisioner: Arc<RecordingProvisioner>,
        retry_limit: u32,
    ) -> Rescheduler {
        Rescheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            provisioner,
            "app",
            &dispatch_config(retry_limit),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let store = seeded_store(&[("10.0.0.1:9000", 0)], &[]);
        let registry = Arc::new(CountingRegistry {
            inner: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let provisioner = Arc::new(RecordingProvisioner::default());
        let rescheduler = Rescheduler::new(
            registry.clone(),
            Arc::new(store),
            provisioner.clone(),
            "app",
            &dispatch_config(3),
            Duration::from_secs(1),
        );

        let report = rescheduler.reschedule(Vec::new()).await;

        assert!(report.is_empty());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
        assert!(provisioner.destinations().is_empty());
    }

    #[tokio::test]
    async fn applications_follow_plan_order() {
        let apps = vec![app("a", "10.0.0.5"), app("b", "10.0.0.5"), app("c", "10.0.0.5")];
        let store = seeded_store(
            &[("10.0.0.1:9000", 2), ("10.0.0.2:9000", 3), ("10.0.0.3:9000", 5)],
            &apps,
        );
        let provisioner = Arc::new(RecordingProvisioner::default());

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        let placed: Vec<_> = report
            .placed
            .iter()
            .map(|p| (p.name.as_str(), p.destination.as_str()))
            .collect();
        assert_eq!(
            placed,
            vec![
                ("a", "10.0.0.1:9000"),
                ("b", "10.0.0.1:9000"),
                ("c", "10.0.0.2:9000"),
            ]
        );
        assert!(report.stranded.is_empty());
        assert_eq!(provisioner.destinations().len(), 3);
    }

    #[tokio::test]
    async fn recreate_request_carries_application_fields() {
        let apps = vec![app("blog", "10.0.0.5")];
        let store = seeded_store(&[("10.0.0.1:9000", 0)], &apps);
        let provisioner = Arc::new(RecordingProvisioner::default());

        rescheduler(&store, provisioner.clone(), 0).reschedule(apps).await;

        let requests = provisioner.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].language, "node");
        assert_eq!(requests[0].owner, "alice");
        assert_eq!(requests[0].destination, "10.0.0.1:9000");
        assert_eq!(requests[0].config["index"], "index.js");
    }

    #[tokio::test]
    async fn placed_records_point_at_new_host() {
        let apps = vec![app("blog", "10.0.0.5")];
        let store = seeded_store(&[("10.0.0.7:9000", 0)], &apps);
        let provisioner = Arc::new(RecordingProvisioner::default());

        rescheduler(&store, provisioner, 3).reschedule(apps).await;

        assert!(store.applications_on_host("10.0.0.5").unwrap().is_empty());
        let moved = store.get_application("alice", "blog").unwrap().unwrap();
        assert_eq!(moved.host, "10.0.0.7");
    }

    #[tokio::test]
    async fn no_instances_strands_everything() {
        let apps = vec![app("a", "10.0.0.5"), app("b", "10.0.0.5")];
        let store = seeded_store(&[], &apps);
        let provisioner = Arc::new(RecordingProvisioner::default());

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        assert!(report.placed.is_empty());
        assert_eq!(report.stranded.len(), 2);
        assert!(report.stranded[0].reason.contains("no eligible instances"));
        assert!(provisioner.destinations().is_empty());
        // Records stay on the dead host.
        assert_eq!(store.applications_on_host("10.0.0.5").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_placement_moves_to_next_candidate() {
        let apps = vec![app("a", "10.0.0.5"), app("b", "10.0.0.5")];
        let store = seeded_store(&[("10.0.0.1:9000", 0), ("10.0.0.2:9000", 0)], &apps);
        let provisioner = Arc::new(RecordingProvisioner::failing(&["10.0.0.1:9000"]));

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        assert!(report.stranded.is_empty());
        let a = report.placed.iter().find(|p| p.name == "a").unwrap();
        assert_eq!(a.destination, "10.0.0.2:9000");
        assert_eq!(a.attempts, 2);
        let b = report.placed.iter().find(|p| p.name == "b").unwrap();
        assert_eq!(b.destination, "10.0.0.2:9000");
        assert_eq!(b.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_plan_fetches_fresh_snapshot() {
        let apps = vec![app("a", "10.0.0.5")];
        let store = seeded_store(&[("10.0.0.1:9000", 0), ("10.0.0.2:9000", 10)], &apps);
        let provisioner = Arc::new(RecordingProvisioner::failing(&["10.0.0.1:9000"]));

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        // The first plan only holds the least-loaded instance. The retry
        // snapshot still ranks it first but it is skipped once it rejected.
        assert_eq!(
            provisioner.destinations(),
            vec!["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()]
        );
        assert!(report.stranded.is_empty());
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].destination, "10.0.0.2:9000");
        assert_eq!(report.placed[0].attempts, 2);
        assert_eq!(store.get_application("alice", "a").unwrap().unwrap().host, "10.0.0.2");
    }

    #[tokio::test]
    async fn concurrent_failures_spread_over_untried_candidates() {
        let apps = vec![app("a", "10.0.0.5"), app("b", "10.0.0.5"), app("c", "10.0.0.5")];
        let store = seeded_store(
            &[("10.0.0.1:9000", 0), ("10.0.0.2:9000", 5), ("10.0.0.3:9000", 5)],
            &apps,
        );
        let provisioner = Arc::new(RecordingProvisioner::failing(&["10.0.0.1:9000"]));

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        // All three plan onto the idle instance, all fail, and the retry is
        // levelled over the two that are left.
        assert!(report.stranded.is_empty());
        assert!(report.placed.iter().all(|p| p.attempts == 2));
        let on = |address: &str| {
            report
                .placed
                .iter()
                .filter(|p| p.destination == address)
                .count()
        };
        assert_eq!(on("10.0.0.2:9000"), 2);
        assert_eq!(on("10.0.0.3:9000"), 1);
        assert_eq!(provisioner.destinations().len(), 6);
    }

    #[tokio::test]
    async fn rejecting_sole_instance_strands_without_retrying_it() {
        let apps = vec![app("a", "10.0.0.5")];
        let store = seeded_store(&[("10.0.0.1:9000", 0)], &apps);
        let provisioner = Arc::new(RecordingProvisioner::failing(&["10.0.0.1:9000"]));

        let report = rescheduler(&store, provisioner.clone(), 3)
            .reschedule(apps)
            .await;

        assert!(report.placed.is_empty());
        assert_eq!(report.stranded.len(), 1);
        assert!(report.stranded[0].reason.contains("no plan for retry"));
        assert_eq!(provisioner.destinations(), vec!["10.0.0.1:9000".to_string()]);
        assert_eq!(store.applications_on_host("10.0.0.5").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_retry_limit() {
        let apps = vec![app("a", "10.0.0.5")];
        let store = seeded_store(
            &[
                ("10.0.0.1:9000", 0),
                ("10.0.0.2:9000", 1),
                ("10.0.0.3:9000", 2),
                ("10.0.0.4:9000", 9),
            ],
            &apps,
        );
        let provisioner = Arc::new(RecordingProvisioner::failing(&[
            "10.0.0.1:9000",
            "10.0.0.2:9000",
            "10.0.0.3:9000",
        ]));

        let report = rescheduler(&store, provisioner.clone(), 1)
            .reschedule(apps)
            .await;

        assert!(report.placed.is_empty());
        assert_eq!(report.stranded.len(), 1);
        assert!(report.stranded[0].reason.contains("2 attempts"));
        assert_eq!(
            provisioner.destinations(),
            vec!["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()]
        );
    }
}
