//! Named consumer operations with serializable arguments and results.
//!
//! This is the surface a tool-serving layer calls into: every operation takes
//! structured arguments and returns a value that serializes cleanly, so the
//! caller owns whatever wire framing it wants. The facade performs direct
//! reads and writes only; convergence (pod provisioning, phase sync, pool
//! sizing) stays with the reconcilers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::info;

use crate::claim::ClaimCoordinator;
use crate::config::ControllerConfig;
use crate::exec::{ExecGateway, ExecOutcome, ExecTransport};
use crate::resource::{
    Sandbox, SandboxPhase, SandboxResources, SandboxSpec, TemplateRef, POOL_LABEL,
};
use crate::store::ResourceStore;
use crate::utils::generated_name;
use crate::{ignore_not_found, MonoboxError, MonoboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for creating a sandbox.
///
/// Everything is optional: a missing name is generated, and missing spec
/// fields fall back to the referenced template and then to hard defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSandbox {
    /// Sandbox name; generated when absent.
    pub name: Option<String>,

    /// Container image override.
    pub image: Option<String>,

    /// Lifetime override in minutes.
    pub ttl_minutes: Option<u32>,

    /// Persistent volume claim to mount at the shared path.
    pub volume: Option<String>,

    /// Resource requests and limits.
    pub resources: Option<SandboxResources>,

    /// Name of the template to resolve at creation time.
    pub template: Option<String>,
}

/// Serializable view of one sandbox.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDetails {
    /// The sandbox name.
    pub name: String,

    /// Current phase, or `Unknown` before the controller has seen it.
    pub phase: String,

    /// Backing pod name, once provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Backing pod IP, once running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    /// When the backing pod was observed running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the sandbox expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Detail recorded at the last phase transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Pool this sandbox belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    /// Whether the claimed marker is set.
    pub claimed: bool,
}

/// Facade bundling sandbox CRUD, claiming and in-sandbox execution.
pub struct SandboxOps<S, T> {
    store: Arc<S>,
    claims: ClaimCoordinator<S>,
    gateway: ExecGateway<S, T>,
    config: ControllerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S, T> SandboxOps<S, T>
where
    S: ResourceStore,
    T: ExecTransport,
{
    /// Creates the facade over a store and an exec transport.
    pub fn new(store: Arc<S>, transport: Arc<T>, config: ControllerConfig) -> Self {
        let claims = ClaimCoordinator::new(store.clone(), config.clone());
        let gateway = ExecGateway::new(store.clone(), transport, config.clone());
        Self {
            store,
            claims,
            gateway,
            config,
        }
    }

    /// Creates a sandbox and returns its initial view.
    ///
    /// The returned phase is `Unknown`; provisioning happens asynchronously
    /// on the controller side. Use [`wait_until_ready`](Self::wait_until_ready)
    /// to block until it accepts commands.
    pub async fn create(
        &self,
        namespace: &str,
        request: CreateSandbox,
    ) -> MonoboxResult<SandboxDetails> {
        let name = request.name.unwrap_or_else(generated_name);
        let spec = SandboxSpec {
            image: request.image,
            ttl_minutes: request.ttl_minutes,
            volume: request.volume,
            resources: request.resources,
            template_ref: request.template.map(|name| TemplateRef { name }),
        };
        let created = self
            .store
            .create_sandbox(namespace, &Sandbox::new(&name, spec))
            .await?;
        info!(%namespace, sandbox = %name, "created sandbox");
        Ok(details(&created))
    }

    /// Fetches one sandbox by name.
    pub async fn get(&self, namespace: &str, name: &str) -> MonoboxResult<SandboxDetails> {
        let sandbox = self.store.get_sandbox(namespace, name).await?;
        Ok(details(&sandbox))
    }

    /// Lists every sandbox in the namespace.
    pub async fn list(&self, namespace: &str) -> MonoboxResult<Vec<SandboxDetails>> {
        let sandboxes = self.store.list_sandboxes(namespace, None).await?;
        Ok(sandboxes.iter().map(details).collect())
    }

    /// Deletes a sandbox, returning whether it existed.
    ///
    /// Backing-pod cleanup is the controller's job, triggered by the
    /// deletion it observes.
    pub async fn delete(&self, namespace: &str, name: &str) -> MonoboxResult<bool> {
        let deleted = ignore_not_found(self.store.delete_sandbox(namespace, name).await)?;
        if deleted.is_some() {
            info!(%namespace, sandbox = %name, "deleted sandbox");
        }
        Ok(deleted.is_some())
    }

    /// Claims a warm sandbox from `pool`, optionally attaching a volume.
    pub async fn claim(
        &self,
        namespace: &str,
        pool: &str,
        volume: Option<&str>,
    ) -> MonoboxResult<SandboxDetails> {
        let claimed = self.claims.claim(namespace, pool, volume).await?;
        Ok(details(&claimed))
    }

    /// Polls until the sandbox is running, bounded by the configured wait
    /// budget.
    ///
    /// A sandbox that terminates while waiting fails immediately with the
    /// recorded message rather than burning the rest of the budget.
    pub async fn wait_until_ready(
        &self,
        namespace: &str,
        name: &str,
    ) -> MonoboxResult<SandboxDetails> {
        let budget = *self.config.get_ready_wait_timeout();
        let poll = *self.config.get_ready_poll_interval();

        let waited = time::timeout(budget, async {
            loop {
                let sandbox = self.store.get_sandbox(namespace, name).await?;
                match sandbox.phase() {
                    Some(SandboxPhase::Running) => return Ok(sandbox),
                    Some(SandboxPhase::Terminated) => {
                        let message = sandbox
                            .status
                            .as_ref()
                            .and_then(|status| status.message.clone())
                            .unwrap_or_else(|| "no detail recorded".to_string());
                        return Err(MonoboxError::SandboxTerminated {
                            name: name.to_string(),
                            message,
                        });
                    }
                    _ => time::sleep(poll).await,
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result.map(|sandbox| details(&sandbox)),
            Err(_) => Err(MonoboxError::Timeout {
                operation: format!("sandbox {name} to become ready"),
                secs: budget.as_secs(),
            }),
        }
    }

    /// Runs a command inside the sandbox and returns its captured output.
    pub async fn execute(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        working_dir: Option<&str>,
    ) -> MonoboxResult<ExecOutcome> {
        self.gateway
            .execute(namespace, name, command, working_dir)
            .await
    }

    /// Writes `content` to `path` inside the sandbox.
    pub async fn upload_file(
        &self,
        namespace: &str,
        name: &str,
        path: &str,
        content: &str,
    ) -> MonoboxResult<()> {
        self.gateway.upload_file(namespace, name, path, content).await
    }

    /// Reads the file at `path` inside the sandbox.
    pub async fn download_file(
        &self,
        namespace: &str,
        name: &str,
        path: &str,
    ) -> MonoboxResult<String> {
        self.gateway.download_file(namespace, name, path).await
    }

    /// Fetches container logs from the sandbox's backing pod.
    pub async fn logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: Option<i64>,
    ) -> MonoboxResult<String> {
        self.gateway.logs(namespace, name, tail_lines).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn details(sandbox: &Sandbox) -> SandboxDetails {
    let status = sandbox.status.as_ref();
    SandboxDetails {
        name: sandbox.name_any(),
        phase: sandbox
            .phase()
            .map(|phase| phase.to_string())
            .unwrap_or_else(|| "Unknown".to_string()),
        pod_name: status.and_then(|status| status.pod_name.clone()),
        pod_ip: status.and_then(|status| status.pod_ip.clone()),
        started_at: status.and_then(|status| status.started_at),
        expires_at: status.and_then(|status| status.expires_at),
        message: status.and_then(|status| status.message.clone()),
        pool: sandbox
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(POOL_LABEL).cloned()),
        claimed: sandbox.is_claimed(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
