//! Narrow collaborator interfaces consumed by the cleanup loop.
//!
//! The health monitor and the rescheduler only ever talk to shared state
//! through these two traits, so tests can substitute fakes and a different
//! backend can replace redb without touching the control loop.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::{ApplicationRecord, InstanceAddress};

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Live instances per service pool, each with a load score.
pub trait InstanceRegistry: Send + Sync {
    /// All currently registered instances of `pool`.
    fn fetch_instances<'a>(&'a self, pool: &'a str)
    -> BoxFuture<'a, StateResult<Vec<InstanceAddress>>>;

    /// Up to `n` instances ascending by score, taken as one atomic snapshot.
    fn fetch_least_loaded<'a>(
        &'a self,
        pool: &'a str,
        n: usize,
    ) -> BoxFuture<'a, StateResult<Vec<(InstanceAddress, u64)>>>;

    /// Remove an instance. Returns whether it was present; absent is not an error.
    fn remove<'a>(&'a self, pool: &'a str, address: &'a str) -> BoxFuture<'a, StateResult<bool>>;

    /// Register (or re-score) an instance.
    fn register<'a>(
        &'a self,
        pool: &'a str,
        address: &'a str,
        score: u64,
    ) -> BoxFuture<'a, StateResult<()>>;
}

/// Durable application records, queryable by host.
pub trait ApplicationDirectory: Send + Sync {
    /// All valid applications recorded against `host`.
    fn find_by_host<'a>(&'a self, host: &'a str)
    -> BoxFuture<'a, StateResult<Vec<ApplicationRecord>>>;

    /// Insert or replace a record after validating it.
    fn insert<'a>(&'a self, record: &'a ApplicationRecord) -> BoxFuture<'a, StateResult<()>>;

    /// Point an application at a new host.
    fn update_host<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        host: &'a str,
    ) -> BoxFuture<'a, StateResult<()>>;
}

/// Bound a store call so a stuck provider cannot stall the caller.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> StateResult<T>
where
    F: Future<Output = StateResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StateError::Timeout(limit)),
    }
}

impl StateStore {
    /// Run a synchronous store operation on the blocking pool.
    ///
    /// redb calls block the calling thread (a writer waits for the write
    /// lock), so they must not run on a runtime worker or a deadline around
    /// them could never fire.
    fn blocking<T, F>(&self, op: F) -> BoxFuture<'static, StateResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(StateStore) -> StateResult<T> + Send + 'static,
    {
        let store = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || op(store))
                .await
                .map_err(|e| StateError::Task(e.to_string()))?
        })
    }
}

impl InstanceRegistry for StateStore {
    fn fetch_instances<'a>(
        &'a self,
        pool: &'a str,
    ) -> BoxFuture<'a, StateResult<Vec<InstanceAddress>>> {
        let pool = pool.to_string();
        self.blocking(move |store| {
            let instances = store.list_instances(&pool)?;
            Ok(instances.into_iter().map(|i| i.address).collect())
        })
    }

    fn fetch_least_loaded<'a>(
        &'a self,
        pool: &'a str,
        n: usize,
    ) -> BoxFuture<'a, StateResult<Vec<(InstanceAddress, u64)>>> {
        let pool = pool.to_string();
        self.blocking(move |store| {
            let instances = store.least_loaded(&pool, n)?;
            Ok(instances.into_iter().map(|i| (i.address, i.score)).collect())
        })
    }

    fn remove<'a>(&'a self, pool: &'a str, address: &'a str) -> BoxFuture<'a, StateResult<bool>> {
        let (pool, address) = (pool.to_string(), address.to_string());
        self.blocking(move |store| store.remove_instance(&pool, &address))
    }

    fn register<'a>(
        &'a self,
        pool: &'a str,
        address: &'a str,
        score: u64,
    ) -> BoxFuture<'a, StateResult<()>> {
        let (pool, address) = (pool.to_string(), address.to_string());
        self.blocking(move |store| store.put_instance(&pool, &address, score))
    }
}

impl ApplicationDirectory for StateStore {
    fn find_by_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, StateResult<Vec<ApplicationRecord>>> {
        let host = host.to_string();
        self.blocking(move |store| store.applications_on_host(&host))
    }

    fn insert<'a>(&'a self, record: &'a ApplicationRecord) -> BoxFuture<'a, StateResult<()>> {
        let record = record.clone();
        self.blocking(move |store| store.put_application(&record))
    }

    fn update_host<'a>(
        &'a self,
        owner: &'a str,
        name: &'a str,
        host: &'a str,
    ) -> BoxFuture<'a, StateResult<()>> {
        let (owner, name, host) = (owner.to_string(), name.to_string(), host.to_string());
        self.blocking(move |store| store.set_application_host(&owner, &name, &host))
    }
}
