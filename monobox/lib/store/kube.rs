//! API-server-backed store used by the running controller.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::core::ErrorResponse;
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::warn;

use crate::config::LIST_PAGE_SIZE;
use crate::exec::{ExecOutcome, ExecTransport};
use crate::resource::{Sandbox, SandboxPool, SandboxPoolStatus, SandboxStatus, SandboxTemplate};
use crate::MonoboxError;
use crate::MonoboxResult;

use super::{ResourceStore, StoreEvent, WatchStream};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Store implementation backed by the Kubernetes API server.
///
/// Cheap to clone; clones share the underlying client connection pool.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KubeStore {
    /// Creates a store from an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a store from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> MonoboxResult<Self> {
        let client = Client::try_default().await.map_err(|error| {
            MonoboxError::Store(format!("failed to build kubernetes client: {error}"))
        })?;
        Ok(Self { client })
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list_all<K>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> MonoboxResult<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;

        // Server-side pagination keeps a single list call bounded no matter
        // how large the namespace grows.
        loop {
            let params = ListParams {
                label_selector: label_selector.map(String::from),
                limit: Some(LIST_PAGE_SIZE),
                continue_token: continue_token.take(),
                ..Default::default()
            };
            let page = api
                .list(&params)
                .await
                .map_err(|error| MonoboxError::Store(error.to_string()))?;
            items.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        Ok(items)
    }

    fn watch_all<K>(&self, namespace: &str, kind: &'static str) -> WatchStream<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + 'static,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        watcher(api, watcher::Config::default())
            .filter_map(move |event| async move {
                match event {
                    Ok(watcher::Event::Apply(object))
                    | Ok(watcher::Event::InitApply(object)) => Some(StoreEvent::Applied(object)),
                    Ok(watcher::Event::Delete(object)) => Some(StoreEvent::Deleted(object)),
                    Ok(_) => None,
                    Err(error) => {
                        // The watcher restarts itself; events are advisory
                        // and timers catch anything missed meanwhile.
                        warn!(kind, error = %error, "watch stream error");
                        None
                    }
                }
            })
            .boxed()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn classify(error: kube::Error, kind: &'static str, name: &str) -> MonoboxError {
    match error {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => MonoboxError::not_found(kind, name),
        kube::Error::Api(ErrorResponse { code: 409, reason, .. }) if reason == "AlreadyExists" => {
            MonoboxError::already_exists(kind, name)
        }
        kube::Error::Api(ErrorResponse { code: 409, .. }) => MonoboxError::conflict(kind, name),
        error => MonoboxError::Store(error.to_string()),
    }
}

fn exit_code_from_status(status: Option<&Status>) -> (i32, Option<String>) {
    let Some(status) = status else {
        // Channel closed without a status message; the process completed.
        return (0, None);
    };
    if status.status.as_deref() == Some("Success") {
        return (0, None);
    }
    let parsed = status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse::<i32>().ok());
    match parsed {
        Some(code) => (code, None),
        None => (1, status.message.clone()),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ResourceStore for KubeStore {
    async fn create_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox> {
        let api: Api<Sandbox> = self.api(namespace);
        let name = sandbox.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), sandbox)
            .await
            .map_err(|error| classify(error, "Sandbox", &name))
    }

    async fn get_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<Sandbox> {
        let api: Api<Sandbox> = self.api(namespace);
        api.get(name)
            .await
            .map_err(|error| classify(error, "Sandbox", name))
    }

    async fn list_sandboxes(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> MonoboxResult<Vec<Sandbox>> {
        self.list_all(namespace, label_selector).await
    }

    async fn update_sandbox(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<Sandbox> {
        let api: Api<Sandbox> = self.api(namespace);
        let name = sandbox.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), sandbox)
            .await
            .map_err(|error| classify(error, "Sandbox", &name))
    }

    async fn patch_sandbox_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxStatus,
    ) -> MonoboxResult<Sandbox> {
        let api: Api<Sandbox> = self.api(namespace);
        // Carrying the observed resource version in the patch turns it into
        // a conditional write; stale writers get a conflict instead of
        // clobbering a newer status.
        let body = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|error| classify(error, "Sandbox", name))
    }

    async fn delete_sandbox(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let api: Api<Sandbox> = self.api(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|error| classify(error, "Sandbox", name))?;
        Ok(())
    }

    async fn watch_sandboxes(&self, namespace: &str) -> MonoboxResult<WatchStream<Sandbox>> {
        Ok(self.watch_all(namespace, "Sandbox"))
    }

    async fn get_pool(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxPool> {
        let api: Api<SandboxPool> = self.api(namespace);
        api.get(name)
            .await
            .map_err(|error| classify(error, "SandboxPool", name))
    }

    async fn list_pools(&self, namespace: &str) -> MonoboxResult<Vec<SandboxPool>> {
        self.list_all(namespace, None).await
    }

    async fn patch_pool_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        status: &SandboxPoolStatus,
    ) -> MonoboxResult<SandboxPool> {
        let api: Api<SandboxPool> = self.api(namespace);
        let body = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|error| classify(error, "SandboxPool", name))
    }

    async fn watch_pools(&self, namespace: &str) -> MonoboxResult<WatchStream<SandboxPool>> {
        Ok(self.watch_all(namespace, "SandboxPool"))
    }

    async fn get_template(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxTemplate> {
        let api: Api<SandboxTemplate> = self.api(namespace);
        api.get(name)
            .await
            .map_err(|error| classify(error, "SandboxTemplate", name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> MonoboxResult<Pod> {
        let api: Api<Pod> = self.api(namespace);
        let name = pod.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), pod)
            .await
            .map_err(|error| classify(error, "Pod", &name))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> MonoboxResult<Option<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        api.get_opt(name)
            .await
            .map_err(|error| classify(error, "Pod", name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let api: Api<Pod> = self.api(namespace);
        api.delete(name, &DeleteParams::default().grace_period(0))
            .await
            .map_err(|error| classify(error, "Pod", name))?;
        Ok(())
    }
}

#[async_trait]
impl ExecTransport for KubeStore {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
        timeout: Duration,
    ) -> MonoboxResult<ExecOutcome> {
        let api: Api<Pod> = self.api(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let work = async {
            let mut attached = api
                .exec(pod, argv.to_vec(), &params)
                .await
                .map_err(|error| classify(error, "Pod", pod))?;

            let mut stdout_reader = attached
                .stdout()
                .ok_or_else(|| MonoboxError::custom(anyhow!("exec stdout channel unavailable")))?;
            let mut stderr_reader = attached
                .stderr()
                .ok_or_else(|| MonoboxError::custom(anyhow!("exec stderr channel unavailable")))?;
            let status_future = attached
                .take_status()
                .ok_or_else(|| MonoboxError::custom(anyhow!("exec status channel unavailable")))?;

            // Drain both streams concurrently so a chatty process cannot
            // deadlock on a full stderr pipe while we read stdout.
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            tokio::try_join!(
                stdout_reader.read_to_end(&mut stdout_buf),
                stderr_reader.read_to_end(&mut stderr_buf),
            )?;

            let status = status_future.await;
            attached.join().await.map_err(MonoboxError::custom)?;

            let (exit_code, failure) = exit_code_from_status(status.as_ref());
            let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
            let mut stderr = String::from_utf8_lossy(&stderr_buf).into_owned();
            if stderr.is_empty() {
                if let Some(message) = failure {
                    stderr = message;
                }
            }

            Ok(ExecOutcome {
                exit_code,
                stdout,
                stderr,
            })
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(MonoboxError::Timeout {
                operation: format!("exec in pod {namespace}/{pod}"),
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> MonoboxResult<String> {
        let api: Api<Pod> = self.api(namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };
        api.logs(pod, &params)
            .await
            .map_err(|error| classify(error, "Pod", pod))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
