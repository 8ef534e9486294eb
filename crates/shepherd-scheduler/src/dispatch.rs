//! Bounded recreation worker pool.
//!
//! Each round spawns one supervised task per pending placement into a
//! `JoinSet`, with a `Semaphore` capping how many recreate calls are in
//! flight. Every task is joined before the round returns, and each job
//! comes back paired with its outcome, including jobs whose task panicked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::provisioner::{Provisioner, RecreateRequest};

/// Runs recreate calls with bounded concurrency and a per-call deadline.
pub struct DispatchPool {
    provisioner: Arc<dyn Provisioner>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl DispatchPool {
    pub fn new(provisioner: Arc<dyn Provisioner>, workers: usize, timeout: Duration) -> Self {
        Self {
            provisioner,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Dispatch every request and return them with their outcomes, in input order.
    pub async fn run(
        &self,
        requests: Vec<RecreateRequest>,
    ) -> Vec<(RecreateRequest, Result<(), ProvisionError>)> {
        let mut outcomes: Vec<Option<Result<(), ProvisionError>>> = vec![None; requests.len()];
        let mut join_set = JoinSet::new();
        let mut task_index = HashMap::new();

        for (idx, request) in requests.iter().enumerate() {
            // Backpressure: wait for a free worker before spawning.
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes[idx] = Some(Err(ProvisionError::Aborted(e.to_string())));
                    continue;
                }
            };
            let provisioner = Arc::clone(&self.provisioner);
            let request = request.clone();
            let timeout = self.timeout;

            let handle = join_set.spawn(async move {
                let result = match tokio::time::timeout(timeout, provisioner.recreate(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProvisionError::Timeout(timeout)),
                };
                drop(permit);
                result
            });
            task_index.insert(handle.id(), idx);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    if let Some(&idx) = task_index.get(&id) {
                        outcomes[idx] = Some(result);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "recreate task did not complete");
                    if let Some(&idx) = task_index.get(&e.id()) {
                        outcomes[idx] = Some(Err(ProvisionError::Aborted(e.to_string())));
                    }
                }
            }
        }

        debug!(dispatched = requests.len(), "dispatch round complete");

        requests
            .into_iter()
            .zip(outcomes)
            .map(|(request, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| Err(ProvisionError::Aborted("task lost".to_string())));
                (request, outcome)
            })
            .collect()
    }
}
