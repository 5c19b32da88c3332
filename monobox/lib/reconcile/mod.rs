//! Timer- and watch-driven reconciliation.
//!
//! Periodic sweeps are the authoritative trigger: every pass lists the world
//! fresh and converges it, so the controller heals from missed events,
//! restarts and stale caches within one sync interval. Watch events only
//! shorten latency for a handful of cases (first-time provisioning, pool
//! seeding, teardown); dropping them costs responsiveness, never
//! correctness.

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use kube::ResourceExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::resource::{Sandbox, SandboxPool};
use crate::store::{ResourceStore, StoreEvent};
use crate::{MonoboxError, MonoboxResult};

mod pool;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many objects a sweep reconciles at once.
const RECONCILE_CONCURRENCY: usize = 8;

/// Pause before reopening a watch that ended or failed to open.
const WATCH_REOPEN_DELAY: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owns the reconcilers and drives them from timers and watches.
///
/// `run` spawns four loops: a sweep and a watch each for sandboxes and
/// pools. All of them tolerate store hiccups by waiting for the next tick
/// or reopening the stream, so the dispatcher runs until shutdown is
/// requested.
pub struct Dispatcher<S> {
    store: Arc<S>,
    config: ControllerConfig,
    sandboxes: SandboxReconciler<S>,
    pools: PoolReconciler<S>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> Dispatcher<S>
where
    S: ResourceStore,
{
    /// Creates a dispatcher with reconcilers sharing the given store.
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        let sandboxes = SandboxReconciler::new(store.clone(), config.clone());
        let pools = PoolReconciler::new(store.clone(), config.clone());
        Self {
            store,
            config,
            sandboxes,
            pools,
        }
    }

    /// Runs all reconcile loops until `shutdown` signals.
    ///
    /// On shutdown, in-flight passes get the configured grace period to
    /// drain before being aborted. Returns an error only if a loop dies
    /// before shutdown was requested.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> MonoboxResult<()> {
        info!(namespace = %self.config.get_namespace(), "dispatcher starting");

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().sandbox_sweep_loop(shutdown.clone()));
        tasks.spawn(self.clone().pool_sweep_loop(shutdown.clone()));
        tasks.spawn(self.clone().sandbox_watch_loop(shutdown.clone()));
        tasks.spawn(self.clone().pool_watch_loop(shutdown.clone()));

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("shutdown requested, draining reconcile loops");
            }
            joined = tasks.join_next() => {
                tasks.abort_all();
                return match joined {
                    Some(Err(error)) => Err(error.into()),
                    _ => Err(MonoboxError::Store(
                        "reconcile loop exited before shutdown".to_string(),
                    )),
                };
            }
        }

        let grace = *self.config.get_shutdown_grace();
        let drained = time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "grace period elapsed, aborting in-flight reconciliations"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("dispatcher stopped");
        Ok(())
    }

    async fn sandbox_sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let namespace = self.config.get_namespace().clone();
        let mut ticker = time::interval(*self.config.get_sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_sandboxes(&namespace).await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn pool_sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let namespace = self.config.get_namespace().clone();
        let mut ticker = time::interval(*self.config.get_sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_pools(&namespace).await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn sandbox_watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let namespace = self.config.get_namespace().clone();
        loop {
            let mut events = match self.store.watch_sandboxes(&namespace).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%namespace, %error, "could not open sandbox watch");
                    tokio::select! {
                        _ = time::sleep(WATCH_REOPEN_DELAY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => self.route_sandbox_event(&namespace, event).await,
                        None => {
                            debug!(%namespace, "sandbox watch ended, reopening");
                            break;
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
            tokio::select! {
                _ = time::sleep(WATCH_REOPEN_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn pool_watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let namespace = self.config.get_namespace().clone();
        loop {
            let mut events = match self.store.watch_pools(&namespace).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%namespace, %error, "could not open pool watch");
                    tokio::select! {
                        _ = time::sleep(WATCH_REOPEN_DELAY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => self.route_pool_event(&namespace, event).await,
                        None => {
                            debug!(%namespace, "pool watch ended, reopening");
                            break;
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
            tokio::select! {
                _ = time::sleep(WATCH_REOPEN_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Lists every sandbox in the namespace and reconciles them with bounded
    /// concurrency. A failed list means this pass runs stale; the next tick
    /// retries.
    async fn sweep_sandboxes(&self, namespace: &str) {
        let sandboxes = match self.store.list_sandboxes(namespace, None).await {
            Ok(list) => list,
            Err(error) => {
                warn!(%namespace, %error, "sandbox sweep could not list");
                return;
            }
        };
        let total = sandboxes.len();
        stream::iter(sandboxes)
            .for_each_concurrent(RECONCILE_CONCURRENCY, |sandbox| async move {
                let name = sandbox.name_any();
                if let Err(error) = self.sandboxes.reconcile(namespace, &name).await {
                    warn!(%namespace, sandbox = %name, %error, "sandbox reconciliation failed");
                }
            })
            .await;
        debug!(%namespace, total, "sandbox sweep complete");
    }

    async fn sweep_pools(&self, namespace: &str) {
        let pools = match self.store.list_pools(namespace).await {
            Ok(list) => list,
            Err(error) => {
                warn!(%namespace, %error, "pool sweep could not list");
                return;
            }
        };
        let total = pools.len();
        stream::iter(pools)
            .for_each_concurrent(RECONCILE_CONCURRENCY, |pool| async move {
                let name = pool.name_any();
                if let Err(error) = self.pools.reconcile(namespace, &name).await {
                    warn!(%namespace, pool = %name, %error, "pool reconciliation failed");
                }
            })
            .await;
        debug!(%namespace, total, "pool sweep complete");
    }

    async fn route_sandbox_event(&self, namespace: &str, event: StoreEvent<Sandbox>) {
        self.pools.observe_member(&event);
        let (sandbox, result) = match &event {
            StoreEvent::Applied(sandbox) => {
                (sandbox, self.sandboxes.handle_applied(namespace, sandbox).await)
            }
            StoreEvent::Deleted(sandbox) => {
                (sandbox, self.sandboxes.handle_deleted(namespace, sandbox).await)
            }
        };
        if let Err(error) = result {
            warn!(
                %namespace,
                sandbox = %sandbox.name_any(),
                %error,
                "sandbox event handling failed"
            );
        }
    }

    /// Pool updates are routed narrowly: only a pool that has never been
    /// seeded gets reconciled off its event. Reacting to status-bearing
    /// pools here would loop, because every replenish pass patches status
    /// and thereby emits the next update.
    async fn route_pool_event(&self, namespace: &str, event: StoreEvent<SandboxPool>) {
        match event {
            StoreEvent::Applied(pool) => {
                if pool.status.is_some() {
                    return;
                }
                let name = pool.name_any();
                if let Err(error) = self.pools.reconcile(namespace, &name).await {
                    warn!(%namespace, pool = %name, %error, "pool seeding failed");
                }
            }
            StoreEvent::Deleted(pool) => {
                if let Err(error) = self.pools.handle_deleted(namespace, &pool).await {
                    warn!(%namespace, pool = %pool.name_any(), %error, "pool teardown failed");
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Collapses a lost optimistic-concurrency race into a quiet skip.
///
/// Conflicts are expected whenever two triggers reconcile the same object;
/// whichever write lost simply defers to the next sweep, which reads fresh.
pub(crate) fn yield_on_conflict<T>(result: MonoboxResult<T>) -> MonoboxResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_conflict() => {
            debug!(%error, "lost a write race, deferring to the next sweep");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use pool::*;
pub use sandbox::*;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{
        SandboxPhase, SandboxPoolSpec, SandboxTemplate, SandboxTemplateSpec, TemplateRef,
    };
    use crate::store::MemoryStore;

    const NS: &str = "default";

    fn fast_config() -> ControllerConfig {
        ControllerConfig::builder()
            .namespace(NS.to_string())
            .sync_interval(Duration::from_millis(25))
            .shutdown_grace(Duration::from_secs(1))
            .retry_base_delay(Duration::from_millis(1))
            .build()
    }

    fn pool(name: &str, min_size: u32, max_size: Option<u32>, template: &str) -> SandboxPool {
        SandboxPool::new(
            name,
            SandboxPoolSpec {
                min_size,
                max_size,
                template_ref: Some(TemplateRef {
                    name: template.to_string(),
                }),
            },
        )
    }

    fn template(name: &str) -> SandboxTemplate {
        SandboxTemplate::new(
            name,
            SandboxTemplateSpec {
                image: Some("python:3.12-slim".to_string()),
                ttl_minutes: Some(60),
                resources: None,
            },
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_dispatcher_converges_a_pool_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(NS, &template("py-tmpl")).await.unwrap();
        // Ceiling pinned to the floor so warmup cannot over-provision and
        // the member set stays fixed for the assertions below.
        store
            .insert_pool(NS, &pool("py-pool", 2, Some(2), "py-tmpl"))
            .await
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(store.clone(), fast_config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(dispatcher.run(shutdown_rx));

        // Seeding and provisioning: two members, each backed by a pod.
        let mut provisioned = false;
        for _ in 0..200 {
            let members = store.list_sandboxes(NS, None).await.unwrap();
            if members.len() == 2
                && members
                    .iter()
                    .all(|m| m.phase() == Some(SandboxPhase::Pending) && m.pod_name().is_some())
            {
                provisioned = true;
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(provisioned, "pool was not seeded and provisioned");

        // Backing pods go Running; the sweep promotes the members.
        for member in store.list_sandboxes(NS, None).await.unwrap() {
            let pod = member.pod_name().unwrap().to_string();
            store
                .set_pod_phase(NS, &pod, "Running", Some("10.0.0.9"))
                .await
                .unwrap();
        }
        let mut promoted = false;
        for _ in 0..200 {
            let members = store.list_sandboxes(NS, None).await.unwrap();
            if members
                .iter()
                .all(|m| m.phase() == Some(SandboxPhase::Running))
            {
                promoted = true;
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(promoted, "members were not promoted to running");

        // The pool status catches up with the warm floor.
        let mut counted = false;
        for _ in 0..200 {
            let status = store.get_pool(NS, "py-pool").await.unwrap().status;
            if status
                .map(|status| status.ready_count == 2 && status.claimed_count == 0)
                .unwrap_or(false)
            {
                counted = true;
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(counted, "pool status never reported two ready members");

        shutdown_tx.send(true).unwrap();
        let outcome = running.await.unwrap();
        assert!(outcome.is_ok(), "dispatcher did not stop cleanly: {outcome:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_dispatcher_stops_cleanly_with_nothing_to_do() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(store, fast_config()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(dispatcher.run(shutdown_rx));

        time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        let outcome = running.await.unwrap();
        assert!(outcome.is_ok(), "dispatcher did not stop cleanly: {outcome:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_yield_on_conflict_passes_and_absorbs() {
        let ok: MonoboxResult<u32> = Ok(7);
        assert_eq!(yield_on_conflict(ok).unwrap(), Some(7));

        let conflict: MonoboxResult<u32> = Err(MonoboxError::conflict("Sandbox", "a"));
        assert_eq!(yield_on_conflict(conflict).unwrap(), None);

        let other: MonoboxResult<u32> = Err(MonoboxError::Store("down".to_string()));
        assert!(yield_on_conflict(other).is_err());
    }
}
