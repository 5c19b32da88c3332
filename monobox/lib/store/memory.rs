//! In-memory store used by the test suites.
//!
//! Mirrors the API server's observable behavior where the controller depends
//! on it: monotonically increasing resource versions, conditional writes that
//! conflict on staleness, name-ordered lists and watch events fanned out to
//! every subscriber.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::{Resource, ResourceExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::resource::{Sandbox, SandboxPool, SandboxPoolStatus, SandboxStatus, SandboxTemplate};
use crate::{MonoboxError, MonoboxResult};

use super::{ResourceStore, StoreEvent, WatchStream};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const EVENT_CHANNEL_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Store implementation holding everything in process memory.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    revision: AtomicU64,
    pod_create_fault: AtomicBool,
    sandbox_events: broadcast::Sender<StoreEvent<Sandbox>>,
    pool_events: broadcast::Sender<StoreEvent<SandboxPool>>,
}

#[derive(Default)]
struct Inner {
    sandboxes: HashMap<String, Sandbox>,
    pools: HashMap<String, SandboxPool>,
    templates: HashMap<String, SandboxTemplate>,
    pods: HashMap<String, Pod>,
    delete_log: Vec<(String, String)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (sandbox_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (pool_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            revision: AtomicU64::new(1),
            pod_create_fault: AtomicBool::new(false),
            sandbox_events,
            pool_events,
        }
    }

    /// Makes the next pod creation fail with a transient store error.
    pub fn fail_next_pod_create(&self) {
        self.pod_create_fault.store(true, Ordering::SeqCst);
    }

    /// Inserts a pool as an external client would, emitting a watch event.
    pub async fn insert_pool(
        &self,
        namespace: &str,
        pool: &SandboxPool,
    ) -> MonoboxResult<SandboxPool> {
        let name = required_name(pool.meta().name.as_deref())?;
        let key = object_key(namespace, &name);
        let mut stored = pool.clone();
        self.stamp(&mut stored.metadata, namespace);

        let mut inner = self.inner.write().await;
        if inner.pools.contains_key(&key) {
            return Err(MonoboxError::already_exists("SandboxPool", name));
        }
        inner.pools.insert(key, stored.clone());
        drop(inner);

        let _ = self.pool_events.send(StoreEvent::Applied(stored.clone()));
        Ok(stored)
    }

    /// Removes a pool as an external client would, emitting a watch event.
    pub async fn remove_pool(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let key = object_key(namespace, name);
        let mut inner = self.inner.write().await;
        let removed = inner
            .pools
            .remove(&key)
            .ok_or_else(|| MonoboxError::not_found("SandboxPool", name))?;
        drop(inner);

        let _ = self.pool_events.send(StoreEvent::Deleted(removed));
        Ok(())
    }

    /// Inserts a template for sandboxes and pools to reference.
    pub async fn insert_template(
        &self,
        namespace: &str,
        template: &SandboxTemplate,
    ) -> MonoboxResult<SandboxTemplate> {
        let name = required_name(template.meta().name.as_deref())?;
        let key = object_key(namespace, &name);
        let mut stored = template.clone();
        self.stamp(&mut stored.metadata, namespace);

        let mut inner = self.inner.write().await;
        if inner.templates.contains_key(&key) {
            return Err(MonoboxError::already_exists("SandboxTemplate", name));
        }
        inner.templates.insert(key, stored.clone());
        Ok(stored)
    }

    /// Returns the names passed to every delete call for `kind` so far,
    /// including calls that found nothing to remove.
    pub async fn delete_calls(&self, kind: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .delete_log
            .iter()
            .filter(|(logged, _)| logged == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Drives a pod through kubelet-like phase changes in tests.
    pub async fn set_pod_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: &str,
        pod_ip: Option<&str>,
    ) -> MonoboxResult<()> {
        let key = object_key(namespace, name);
        let mut inner = self.inner.write().await;
        let pod = inner
            .pods
            .get_mut(&key)
            .ok_or_else(|| MonoboxError::not_found("Pod", name))?;
        let status = pod.status.get_or_insert_with(PodStatus::default);
        status.phase = Some(phase.to_string());
        if let Some(ip) = pod_ip {
            status.pod_ip = Some(ip.to_string());
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        self.revision.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn stamp(&self, metadata: &mut kube::api::ObjectMeta, namespace: &str) {
        metadata.namespace = Some(namespace.to_string());
        metadata.resource_version = Some(self.next_version());
        if metadata.uid.is_none() {
            metadata.uid = Some(Uuid::new_v4().to_string());
        }
    }

    fn subscribe<K>(sender: &broadcast::Sender<StoreEvent<K>>, namespace: &str) -> WatchStream<K>
    where
        K: Resource + Clone + Send + 'static,
    {
        let namespace = namespace.to_string();
        BroadcastStream::new(sender.subscribe())
            .filter_map(move |event| {
                let namespace = namespace.clone();
                async move {
                    let event = event.ok()?;
                    let object_namespace = match &event {
                        StoreEvent::Applied(object) => object.meta().namespace.clone(),
                        StoreEvent::Deleted(object) => object.meta().namespace.clone(),
                    };
                    (object_namespace.as_deref() == Some(namespace.as_str())).then_some(event)
                }
            })
            .boxed()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn required_name(name: Option<&str>) -> MonoboxResult<String> {
    name.filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| MonoboxError::Validation("object has no name".to_string()))
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector.split(',').all(|clause| {
        let clause = clause.trim();
        match clause.split_once('=') {
            Some((key, value)) => {
                labels.is_some_and(|labels| labels.get(key).map(String::as_str) == Some(value))
            }
            None => labels.is_some_and(|labels| labels.contains_key(clause)),
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox> {
        let name = required_name(sandbox.meta().name.as_deref())?;
        let key = object_key(namespace, &name);
        let mut stored = sandbox.clone();
        self.stamp(&mut stored.metadata, namespace);

        let mut inner = self.inner.write().await;
        if inner.sandboxes.contains_key(&key) {
            return Err(MonoboxError::already_exists("Sandbox", name));
        }
        inner.sandboxes.insert(key, stored.clone());
        drop(inner);

        let _ = self.sandbox_events.send(StoreEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn get_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<Sandbox> {
        let inner = self.inner.read().await;
        inner
            .sandboxes
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| MonoboxError::not_found("Sandbox", name))
    }

    async fn list_sandboxes(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> MonoboxResult<Vec<Sandbox>> {
        let prefix = format!("{namespace}/");
        let inner = self.inner.read().await;
        let mut items: Vec<Sandbox> = inner
            .sandboxes
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, sandbox)| sandbox.clone())
            .filter(|sandbox| {
                label_selector.map_or(true, |selector| {
                    matches_selector(sandbox.meta().labels.as_ref(), selector)
                })
            })
            .collect();
        items.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        Ok(items)
    }

    async fn update_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox> {
        let name = required_name(sandbox.meta().name.as_deref())?;
        let key = object_key(namespace, &name);

        let mut inner = self.inner.write().await;
        let current = inner
            .sandboxes
            .get(&key)
            .ok_or_else(|| MonoboxError::not_found("Sandbox", &name))?;
        if sandbox.meta().resource_version != current.meta().resource_version {
            return Err(MonoboxError::conflict("Sandbox", name));
        }

        // Replacing the main resource must not touch the status subresource.
        let mut stored = sandbox.clone();
        stored.status = current.status.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(self.next_version());
        inner.sandboxes.insert(key, stored.clone());
        drop(inner);

        let _ = self.sandbox_events.send(StoreEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn patch_sandbox_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxStatus,
    ) -> MonoboxResult<Sandbox> {
        let key = object_key(namespace, name);

        let mut inner = self.inner.write().await;
        let current = inner
            .sandboxes
            .get_mut(&key)
            .ok_or_else(|| MonoboxError::not_found("Sandbox", name))?;
        if current.meta().resource_version.as_deref() != Some(resource_version) {
            return Err(MonoboxError::conflict("Sandbox", name));
        }

        current.status = Some(status.clone());
        current.metadata.resource_version = Some(self.next_version());
        let stored = current.clone();
        drop(inner);

        let _ = self.sandbox_events.send(StoreEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let key = object_key(namespace, name);
        let mut inner = self.inner.write().await;
        inner
            .delete_log
            .push(("Sandbox".to_string(), name.to_string()));
        let removed = inner
            .sandboxes
            .remove(&key)
            .ok_or_else(|| MonoboxError::not_found("Sandbox", name))?;
        drop(inner);

        let _ = self.sandbox_events.send(StoreEvent::Deleted(removed));
        Ok(())
    }

    async fn watch_sandboxes(&self, namespace: &str) -> MonoboxResult<WatchStream<Sandbox>> {
        Ok(Self::subscribe(&self.sandbox_events, namespace))
    }

    async fn get_pool(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxPool> {
        let inner = self.inner.read().await;
        inner
            .pools
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| MonoboxError::not_found("SandboxPool", name))
    }

    async fn list_pools(&self, namespace: &str) -> MonoboxResult<Vec<SandboxPool>> {
        let prefix = format!("{namespace}/");
        let inner = self.inner.read().await;
        let mut items: Vec<SandboxPool> = inner
            .pools
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, pool)| pool.clone())
            .collect();
        items.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        Ok(items)
    }

    async fn patch_pool_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxPoolStatus,
    ) -> MonoboxResult<SandboxPool> {
        let key = object_key(namespace, name);

        let mut inner = self.inner.write().await;
        let current = inner
            .pools
            .get_mut(&key)
            .ok_or_else(|| MonoboxError::not_found("SandboxPool", name))?;
        if current.meta().resource_version.as_deref() != Some(resource_version) {
            return Err(MonoboxError::conflict("SandboxPool", name));
        }

        current.status = Some(status.clone());
        current.metadata.resource_version = Some(self.next_version());
        let stored = current.clone();
        drop(inner);

        let _ = self.pool_events.send(StoreEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn watch_pools(&self, namespace: &str) -> MonoboxResult<WatchStream<SandboxPool>> {
        Ok(Self::subscribe(&self.pool_events, namespace))
    }

    async fn get_template(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxTemplate> {
        let inner = self.inner.read().await;
        inner
            .templates
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| MonoboxError::not_found("SandboxTemplate", name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> MonoboxResult<Pod> {
        if self.pod_create_fault.swap(false, Ordering::SeqCst) {
            return Err(MonoboxError::Store("injected pod create failure".to_string()));
        }
        let name = required_name(pod.metadata.name.as_deref())?;
        let key = object_key(namespace, &name);
        let mut stored = pod.clone();
        self.stamp(&mut stored.metadata, namespace);
        stored.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });

        let mut inner = self.inner.write().await;
        if inner.pods.contains_key(&key) {
            return Err(MonoboxError::already_exists("Pod", name));
        }
        inner.pods.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> MonoboxResult<Option<Pod>> {
        let inner = self.inner.read().await;
        Ok(inner.pods.get(&object_key(namespace, name)).cloned())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let mut inner = self.inner.write().await;
        inner.delete_log.push(("Pod".to_string(), name.to_string()));
        inner
            .pods
            .remove(&object_key(namespace, name))
            .ok_or_else(|| MonoboxError::not_found("Pod", name))?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
