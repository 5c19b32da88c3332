//! Pool reconciliation: seeding, replenishment and teardown.
//!
//! A pool's one job is to keep a floor of warm members standing. The timer
//! sweep is the single source of truth for sizing: member watch events are
//! advisory log lines only, so a burst of claims or a replayed notification
//! can never fan out into racing creations. Convergence latency is bounded
//! by the sweep interval, not by event delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::resource::{
    member_spec, pool_selector, Sandbox, SandboxPool, SandboxPoolStatus, SandboxTemplate,
    CLAIMED_LABEL, POOL_LABEL,
};
use crate::store::{ResourceStore, StoreEvent};
use crate::utils::{member_name, with_backoff};
use crate::{ignore_not_found, MonoboxError, MonoboxResult};

use super::yield_on_conflict;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Keeps a pool's warm-member floor standing and its status counts honest.
pub struct PoolReconciler<S> {
    store: Arc<S>,
    config: ControllerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> PoolReconciler<S>
where
    S: ResourceStore,
{
    /// Creates a reconciler over the given store.
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Runs one reconciliation pass for the named pool.
    ///
    /// A pool without status has never been seeded; one with status gets
    /// the steady-state replenishment treatment.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let Some(pool) = ignore_not_found(self.store.get_pool(namespace, name).await)? else {
            return Ok(());
        };
        if pool.status.is_none() {
            self.seed(namespace, &pool).await
        } else {
            self.replenish(namespace, &pool).await
        }
    }

    /// Tears down every member of a deleted pool.
    ///
    /// Members already gone are fine; other failures are logged and the
    /// remaining members still get their delete attempt. A member that
    /// survives teardown anyway terminates at its TTL.
    pub async fn handle_deleted(&self, namespace: &str, pool: &SandboxPool) -> MonoboxResult<()> {
        let name = pool.name_any();
        let members = self.list_members(namespace, &name).await?;
        info!(%namespace, pool = %name, members = members.len(), "tearing down deleted pool");

        let mut failed = 0usize;
        for member in &members {
            let member_name = member.name_any();
            match ignore_not_found(self.store.delete_sandbox(namespace, &member_name).await) {
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        %namespace,
                        pool = %name,
                        member = %member_name,
                        %error,
                        "failed to delete pool member"
                    );
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(MonoboxError::Store(format!(
                "{failed} of {} members of pool {name} could not be deleted",
                members.len()
            )));
        }
        Ok(())
    }

    /// Advisory hook for member watch events: log and leave sizing to the
    /// timer, which tolerates missed and duplicated notifications alike.
    pub fn observe_member(&self, event: &StoreEvent<Sandbox>) {
        let (member, action) = match event {
            StoreEvent::Applied(member) if member.is_claimed() => (member, "claimed"),
            StoreEvent::Applied(_) => return,
            StoreEvent::Deleted(member) => (member, "deleted"),
        };
        let Some(pool) = member
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(POOL_LABEL))
        else {
            return;
        };
        debug!(
            %pool,
            member = %member.name_any(),
            action,
            "pool member changed, next sweep rebalances"
        );
    }

    /// First pass over a new pool: create the minimum member floor and
    /// initialize status with zero counts, since freshly created members
    /// have not even gone Pending yet.
    ///
    /// Members that already exist count against the floor, so a pass
    /// interrupted between creates and the status write cannot over-seed
    /// when it reruns.
    async fn seed(&self, namespace: &str, pool: &SandboxPool) -> MonoboxResult<()> {
        let name = pool.name_any();
        let Some(template_name) = pool.template_name() else {
            return Err(MonoboxError::Validation(format!(
                "pool {name} has no template reference"
            )));
        };
        let Some(template) =
            ignore_not_found(self.store.get_template(namespace, template_name).await)?
        else {
            warn!(
                %namespace,
                pool = %name,
                template = template_name,
                "referenced template not found, seeding deferred"
            );
            return Ok(());
        };

        let members = self.list_members(namespace, &name).await?;
        let floor = pool.spec.min_size as usize;
        let missing = floor.saturating_sub(members.len());
        info!(
            %namespace,
            pool = %name,
            floor,
            existing = members.len(),
            "seeding pool"
        );

        let mut names: Vec<String> = members.iter().map(ResourceExt::name_any).collect();
        for _ in 0..missing {
            names.push(self.create_member(namespace, &name, &template).await?);
        }
        names.sort();

        let status = SandboxPoolStatus {
            ready_count: 0,
            claimed_count: 0,
            sandboxes: names,
        };
        self.write_status(namespace, pool, status).await?;
        Ok(())
    }

    /// Steady-state pass: recompute counts from live members, publish them,
    /// then top the warm floor back up, bounded by the member ceiling.
    async fn replenish(&self, namespace: &str, pool: &SandboxPool) -> MonoboxResult<()> {
        let name = pool.name_any();
        let members = self.list_members(namespace, &name).await?;

        let total = members.len() as u32;
        let claimed = members.iter().filter(|m| m.is_claimed()).count() as u32;
        let ready = members.iter().filter(|m| m.is_warm()).count() as u32;

        let status = SandboxPoolStatus {
            ready_count: ready,
            claimed_count: claimed,
            sandboxes: members.iter().map(ResourceExt::name_any).collect(),
        };
        if !self.write_status(namespace, pool, status).await? {
            // The pool object moved underneath this pass; rather than size
            // the pool off a stale spec, recompute on the next sweep.
            return Ok(());
        }

        let ceiling = pool.max_size();
        if ready >= pool.spec.min_size || total >= ceiling {
            return Ok(());
        }
        let missing = (pool.spec.min_size - ready).min(ceiling - total);

        let Some(template_name) = pool.template_name() else {
            warn!(%namespace, pool = %name, "pool has no template reference, cannot replenish");
            return Ok(());
        };
        let Some(template) =
            ignore_not_found(self.store.get_template(namespace, template_name).await)?
        else {
            warn!(
                %namespace,
                pool = %name,
                template = template_name,
                "referenced template not found, skipping replenishment this sweep"
            );
            return Ok(());
        };

        info!(%namespace, pool = %name, ready, claimed, total, missing, "replenishing pool");
        for _ in 0..missing {
            self.create_member(namespace, &name, &template).await?;
        }
        Ok(())
    }

    /// Creates one unclaimed member carrying the pool labels, with the
    /// template's contents pinned into its spec.
    async fn create_member(
        &self,
        namespace: &str,
        pool: &str,
        template: &SandboxTemplate,
    ) -> MonoboxResult<String> {
        let name = member_name(pool);
        let mut member = Sandbox::new(&name, member_spec(template));
        member.metadata.labels = Some(BTreeMap::from([
            (POOL_LABEL.to_string(), pool.to_string()),
            (CLAIMED_LABEL.to_string(), "false".to_string()),
        ]));
        self.store.create_sandbox(namespace, &member).await?;
        info!(%namespace, %pool, member = %name, "created pool member");
        Ok(name)
    }

    async fn list_members(&self, namespace: &str, pool: &str) -> MonoboxResult<Vec<Sandbox>> {
        let selector = pool_selector(pool);
        with_backoff(
            "list pool members",
            *self.config.get_retry_attempts(),
            *self.config.get_retry_base_delay(),
            || self.store.list_sandboxes(namespace, Some(&selector)),
        )
        .await
    }

    /// Writes `status` conditioned on the version `pool` was read at.
    /// Returns whether the write landed; a lost race defers to the next
    /// sweep.
    async fn write_status(
        &self,
        namespace: &str,
        pool: &SandboxPool,
        status: SandboxPoolStatus,
    ) -> MonoboxResult<bool> {
        let name = pool.name_any();
        let version = pool.meta().resource_version.as_deref().unwrap_or_default();
        let written = yield_on_conflict(
            self.store
                .patch_pool_status(namespace, &name, version, &status)
                .await,
        )?;
        Ok(written.is_some())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{
        SandboxPhase, SandboxPoolSpec, SandboxSpec, SandboxStatus, SandboxTemplateSpec, TemplateRef,
    };
    use crate::store::MemoryStore;

    const NS: &str = "default";

    fn fast_config() -> ControllerConfig {
        ControllerConfig::builder()
            .retry_base_delay(std::time::Duration::from_millis(1))
            .build()
    }

    fn reconciler(store: &Arc<MemoryStore>) -> PoolReconciler<MemoryStore> {
        PoolReconciler::new(store.clone(), fast_config())
    }

    fn pool(
        name: &str,
        min_size: u32,
        max_size: Option<u32>,
        template: Option<&str>,
    ) -> SandboxPool {
        SandboxPool::new(
            name,
            SandboxPoolSpec {
                min_size,
                max_size,
                template_ref: template.map(|name| TemplateRef {
                    name: name.to_string(),
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

    async fn insert_member(
        store: &MemoryStore,
        pool: &str,
        name: &str,
        phase: Option<SandboxPhase>,
        claimed: bool,
    ) {
        let mut member = Sandbox::new(name, SandboxSpec::default());
        member.metadata.labels = Some(BTreeMap::from([
            (POOL_LABEL.to_string(), pool.to_string()),
            (CLAIMED_LABEL.to_string(), claimed.to_string()),
        ]));
        let created = store.create_sandbox(NS, &member).await.unwrap();
        if let Some(phase) = phase {
            let status = SandboxStatus {
                phase: Some(phase),
                ..Default::default()
            };
            let version = created.metadata.resource_version.clone().unwrap();
            store
                .patch_sandbox_status(NS, name, &version, &status)
                .await
                .unwrap();
        }
    }

    async fn members(store: &MemoryStore, pool: &str) -> Vec<Sandbox> {
        store
            .list_sandboxes(NS, Some(&pool_selector(pool)))
            .await
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_seed_creates_the_member_floor() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(NS, &template("py-tmpl")).await.unwrap();
        store
            .insert_pool(NS, &pool("py-pool", 3, None, Some("py-tmpl")))
            .await
            .unwrap();

        reconciler(&store).reconcile(NS, "py-pool").await.unwrap();

        let members = members(&store, "py-pool").await;
        assert_eq!(members.len(), 3, "seed should create the minimum floor");
        for member in &members {
            let labels = member.metadata.labels.as_ref().unwrap();
            assert_eq!(labels.get(POOL_LABEL).map(String::as_str), Some("py-pool"));
            assert_eq!(labels.get(CLAIMED_LABEL).map(String::as_str), Some("false"));
            let suffix = member.name_any();
            let suffix = suffix.strip_prefix("py-pool-").unwrap();
            assert_eq!(suffix.len(), 8);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        }

        let status = store.get_pool(NS, "py-pool").await.unwrap().status.unwrap();
        assert_eq!(status.ready_count, 0, "fresh members are not ready yet");
        assert_eq!(status.claimed_count, 0);
        assert_eq!(status.sandboxes.len(), 3);
        let mut sorted = status.sandboxes.clone();
        sorted.sort();
        assert_eq!(status.sandboxes, sorted, "member names are recorded sorted");
    }

    #[test_log::test(tokio::test)]
    async fn test_seed_requires_a_template_reference() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_pool(NS, &pool("bare", 2, None, None))
            .await
            .unwrap();

        let result = reconciler(&store).reconcile(NS, "bare").await;
        assert!(
            matches!(result, Err(MonoboxError::Validation(_))),
            "template-less pools are a permanent validation failure"
        );
        assert!(members(&store, "bare").await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_seed_defers_when_template_object_is_missing() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_pool(NS, &pool("orphan", 2, None, Some("ghost")))
            .await
            .unwrap();

        reconciler(&store).reconcile(NS, "orphan").await.unwrap();

        assert!(members(&store, "orphan").await.is_empty());
        assert!(
            store.get_pool(NS, "orphan").await.unwrap().status.is_none(),
            "an unseeded pool keeps empty status so the next sweep retries"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_seed_counts_existing_members_toward_the_floor() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(NS, &template("py-tmpl")).await.unwrap();
        store
            .insert_pool(NS, &pool("py-pool", 3, None, Some("py-tmpl")))
            .await
            .unwrap();
        insert_member(&store, "py-pool", "py-pool-aaaaaaaa", None, false).await;

        reconciler(&store).reconcile(NS, "py-pool").await.unwrap();

        let members = members(&store, "py-pool").await;
        assert_eq!(members.len(), 3, "a rerun seed only tops up the shortfall");
        let status = store.get_pool(NS, "py-pool").await.unwrap().status.unwrap();
        assert!(status.sandboxes.contains(&"py-pool-aaaaaaaa".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn test_replenish_publishes_counts_then_tops_up() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(NS, &template("py-tmpl")).await.unwrap();
        let mut pool = pool("py-pool", 2, Some(5), Some("py-tmpl"));
        pool.status = Some(SandboxPoolStatus::default());
        store.insert_pool(NS, &pool).await.unwrap();

        insert_member(
            &store,
            "py-pool",
            "py-pool-claimed1",
            Some(SandboxPhase::Running),
            true,
        )
        .await;
        insert_member(
            &store,
            "py-pool",
            "py-pool-warm0001",
            Some(SandboxPhase::Running),
            false,
        )
        .await;

        reconciler(&store).reconcile(NS, "py-pool").await.unwrap();

        // One warm member against a floor of two: exactly one more created.
        assert_eq!(members(&store, "py-pool").await.len(), 3);

        // Status reflects what the pass observed, not what it created.
        let status = store.get_pool(NS, "py-pool").await.unwrap().status.unwrap();
        assert_eq!(status.ready_count, 1);
        assert_eq!(status.claimed_count, 1);
        assert_eq!(status.sandboxes.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_replenish_respects_the_member_ceiling() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(NS, &template("py-tmpl")).await.unwrap();
        let mut pool = pool("py-pool", 2, Some(4), Some("py-tmpl"));
        pool.status = Some(SandboxPoolStatus::default());
        store.insert_pool(NS, &pool).await.unwrap();

        // Four claimed husks exhaust the ceiling even though none is ready.
        for index in 0..4 {
            let name = format!("py-pool-husk000{index}");
            insert_member(&store, "py-pool", &name, Some(SandboxPhase::Terminated), true).await;
        }

        reconciler(&store).reconcile(NS, "py-pool").await.unwrap();

        assert_eq!(
            members(&store, "py-pool").await.len(),
            4,
            "a full pool must not grow past its ceiling"
        );
        let status = store.get_pool(NS, "py-pool").await.unwrap().status.unwrap();
        assert_eq!(status.ready_count, 0);
        assert_eq!(status.claimed_count, 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_teardown_deletes_every_member_once() {
        let store = Arc::new(MemoryStore::new());
        let pool = store
            .insert_pool(NS, &pool("py-pool", 3, None, Some("py-tmpl")))
            .await
            .unwrap();
        for index in 0..3 {
            let name = format!("py-pool-member00{index}");
            insert_member(&store, "py-pool", &name, Some(SandboxPhase::Running), false).await;
        }

        reconciler(&store).handle_deleted(NS, &pool).await.unwrap();

        assert!(members(&store, "py-pool").await.is_empty());
        assert_eq!(store.delete_calls("Sandbox").await.len(), 3);

        // Replayed deletion events find nothing left and stay quiet.
        reconciler(&store).handle_deleted(NS, &pool).await.unwrap();
        assert_eq!(store.delete_calls("Sandbox").await.len(), 3);
    }
}
