//! Persistence and watch abstraction over the Kubernetes API.
//!
//! Reconcilers, the claim coordinator and the ops facade all talk to a
//! [`ResourceStore`] rather than to a concrete client, so the whole control
//! loop can run against the in-memory [`MemoryStore`] in tests while
//! production uses the API-server-backed [`KubeStore`].
//!
//! Writes that carry a resource version are conditional: they fail with
//! [`MonoboxError::Conflict`](crate::MonoboxError::Conflict) when the object
//! changed underneath the caller, which is how concurrent claimers and
//! overlapping reconcile passes stay correct without holding locks.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;

use crate::resource::{Sandbox, SandboxPool, SandboxPoolStatus, SandboxStatus, SandboxTemplate};
use crate::MonoboxResult;

mod kube;
mod memory;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A change observed on a watched resource kind.
#[derive(Clone, Debug)]
pub enum StoreEvent<K> {
    /// The object was created or updated, including watch-init replays.
    Applied(K),

    /// The object was deleted. Carries the last observed payload, which is
    /// all a stateless observer gets to work with.
    Deleted(K),
}

/// Stream of observed changes for one resource kind.
pub type WatchStream<K> = BoxStream<'static, StoreEvent<K>>;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Storage backend for sandboxes, pools, templates and their backing pods.
///
/// All methods are namespace-scoped. Status writes take the resource version
/// the caller last observed and fail on mismatch instead of clobbering
/// concurrent updates.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Persists a new sandbox, failing with `AlreadyExists` on a name clash.
    async fn create_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox>;

    /// Fetches a sandbox by name.
    async fn get_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<Sandbox>;

    /// Lists sandboxes, optionally narrowed by a label selector.
    async fn list_sandboxes(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> MonoboxResult<Vec<Sandbox>>;

    /// Replaces a sandbox whole, conditional on the resource version carried
    /// in its metadata. The status subresource is left untouched.
    async fn update_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox>;

    /// Writes a sandbox's status, conditional on `resource_version`.
    async fn patch_sandbox_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxStatus,
    ) -> MonoboxResult<Sandbox>;

    /// Deletes a sandbox by name.
    async fn delete_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<()>;

    /// Opens a watch over all sandboxes in `namespace`.
    async fn watch_sandboxes(&self, namespace: &str) -> MonoboxResult<WatchStream<Sandbox>>;

    /// Fetches a pool by name.
    async fn get_pool(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxPool>;

    /// Lists all pools in `namespace`.
    async fn list_pools(&self, namespace: &str) -> MonoboxResult<Vec<SandboxPool>>;

    /// Writes a pool's status, conditional on `resource_version`.
    async fn patch_pool_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxPoolStatus,
    ) -> MonoboxResult<SandboxPool>;

    /// Opens a watch over all pools in `namespace`.
    async fn watch_pools(&self, namespace: &str) -> MonoboxResult<WatchStream<SandboxPool>>;

    /// Fetches a template by name.
    async fn get_template(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxTemplate>;

    /// Creates a backing pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> MonoboxResult<Pod>;

    /// Fetches a pod by name, mapping absence to `None` because reconcilers
    /// treat a missing pod as a state, not a failure.
    async fn get_pod(&self, namespace: &str, name: &str) -> MonoboxResult<Option<Pod>>;

    /// Deletes a pod immediately, with no grace period.
    async fn delete_pod(&self, namespace: &str, name: &str) -> MonoboxResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use kube::KubeStore;
pub use memory::MemoryStore;
