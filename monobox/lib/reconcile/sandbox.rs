//! Sandbox lifecycle reconciliation.
//!
//! Every pass has the same shape: read the sandbox fresh, look at its backing
//! pod, apply at most one phase transition, and write status conditioned on
//! the version that was read. A pass that loses a write race simply stops;
//! the next timer sweep re-reads and finishes the job. Phases only ever move
//! forward, so repeated or interleaved passes cannot undo each other.

use std::sync::Arc;

use chrono::Utc;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::resource::{
    backing_pod, mounts_claim, pod_ip, pod_phase, resolve, Sandbox, SandboxPhase, SandboxStatus,
};
use crate::store::ResourceStore;
use crate::utils::with_backoff;
use crate::{ignore_not_found, MonoboxResult};

use super::yield_on_conflict;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Converges a single sandbox toward its declared lifecycle.
pub struct SandboxReconciler<S> {
    store: Arc<S>,
    config: ControllerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S> SandboxReconciler<S>
where
    S: ResourceStore,
{
    /// Creates a reconciler over the given store.
    pub fn new(store: Arc<S>, config: ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Runs one reconciliation pass for the named sandbox.
    ///
    /// A sandbox without a phase still needs its backing pod provisioned;
    /// one with a phase gets its pod observed and its status advanced. A
    /// sandbox that disappeared between trigger and read is nobody's
    /// problem anymore.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> MonoboxResult<()> {
        let Some(sandbox) = ignore_not_found(self.store.get_sandbox(namespace, name).await)?
        else {
            return Ok(());
        };
        match sandbox.phase() {
            None => self.provision(namespace, &sandbox).await,
            Some(SandboxPhase::Terminated) => Ok(()),
            Some(_) => self.sync(namespace, &sandbox).await,
        }
    }

    /// Fast-path reaction to a watch event carrying `observed`.
    ///
    /// Timer sweeps remain the source of truth; events only shortcut the
    /// cases where waiting out a full sweep would be felt: provisioning
    /// brand-new sandboxes, reaping pods behind terminations another writer
    /// recorded, and rejecting storage attaches on live pods.
    pub async fn handle_applied(&self, namespace: &str, observed: &Sandbox) -> MonoboxResult<()> {
        match observed.phase() {
            None => self.reconcile(namespace, &observed.name_any()).await,
            Some(SandboxPhase::Terminated) => {
                // Another writer may have terminated without reaping.
                if let Some(pod_name) = observed.pod_name() {
                    if self.store.get_pod(namespace, pod_name).await?.is_some() {
                        self.reap_pod(namespace, &observed.name_any(), pod_name)
                            .await?;
                    }
                }
                Ok(())
            }
            Some(SandboxPhase::Running) => {
                self.reject_live_attach(namespace, observed).await;
                Ok(())
            }
            Some(SandboxPhase::Pending) => Ok(()),
        }
    }

    /// Reacts to a sandbox deletion by reaping its backing pod.
    ///
    /// The pod also carries an owner reference, so this is the fast path
    /// and cluster garbage collection is the backstop.
    pub async fn handle_deleted(&self, namespace: &str, observed: &Sandbox) -> MonoboxResult<()> {
        let name = observed.name_any();
        info!(%namespace, sandbox = %name, "sandbox deleted");
        if let Some(pod_name) = observed.pod_name() {
            self.reap_pod(namespace, &name, pod_name).await?;
        }
        Ok(())
    }

    /// Brings a status-less sandbox to life: resolve its template, request
    /// the backing pod and record Pending with a fixed expiry.
    ///
    /// A pod left behind by an earlier pass whose status write never landed
    /// is adopted rather than treated as a clash, which makes provisioning
    /// safe to re-run from any trigger.
    async fn provision(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<()> {
        let name = sandbox.name_any();

        let template = match &sandbox.spec.template_ref {
            Some(reference) => {
                let found =
                    ignore_not_found(self.store.get_template(namespace, &reference.name).await)?;
                if found.is_none() {
                    warn!(
                        %namespace,
                        sandbox = %name,
                        template = %reference.name,
                        "referenced template not found, falling back to spec and defaults"
                    );
                }
                found
            }
            None => None,
        };

        let resolved = resolve(&sandbox.spec, template.as_ref());
        let expires_at = Utc::now() + chrono::Duration::minutes(resolved.ttl_minutes as i64);
        let pod = backing_pod(sandbox, &resolved, &expires_at)?;

        match with_backoff(
            "create backing pod",
            *self.config.get_retry_attempts(),
            *self.config.get_retry_base_delay(),
            || self.store.create_pod(namespace, &pod),
        )
        .await
        {
            Ok(_) => {
                info!(
                    %namespace,
                    sandbox = %name,
                    image = %resolved.image,
                    ttl_minutes = resolved.ttl_minutes,
                    "created backing pod"
                );
            }
            Err(error) if error.is_already_exists() => {
                info!(%namespace, sandbox = %name, "backing pod already exists, adopting");
            }
            Err(error) => {
                error!(%namespace, sandbox = %name, %error, "backing pod creation failed");
                let status = SandboxStatus {
                    phase: Some(SandboxPhase::Terminated),
                    message: Some(format!("pod creation failed: {error}")),
                    ..Default::default()
                };
                return self.write_status(namespace, sandbox, status).await;
            }
        }

        let status = SandboxStatus {
            phase: Some(SandboxPhase::Pending),
            pod_name: Some(name),
            expires_at: Some(expires_at),
            ..Default::default()
        };
        self.write_status(namespace, sandbox, status).await
    }

    /// Observes the backing pod and applies at most one forward transition.
    ///
    /// Terminal outcomes are checked before the promotion to Running, so a
    /// tick that sees several applicable outcomes always terminates.
    async fn sync(&self, namespace: &str, sandbox: &Sandbox) -> MonoboxResult<()> {
        let name = sandbox.name_any();
        let status = sandbox.status.clone().unwrap_or_default();
        let Some(phase) = status.phase else {
            return Ok(());
        };
        let Some(pod_name) = status.pod_name.clone() else {
            warn!(%namespace, sandbox = %name, "status records no backing pod, nothing to sync");
            return Ok(());
        };

        let expired = status
            .expires_at
            .is_some_and(|expires_at| Utc::now() > expires_at);

        let Some(pod) = self.store.get_pod(namespace, &pod_name).await? else {
            return self
                .terminate(namespace, sandbox, status, None, "Pod was deleted")
                .await;
        };

        if phase == SandboxPhase::Running && expired {
            return self
                .terminate(namespace, sandbox, status, Some(&pod_name), "TTL expired")
                .await;
        }

        match pod_phase(&pod) {
            Some(observed @ ("Failed" | "Succeeded")) => {
                let message = format!("Pod phase: {observed}");
                self.terminate(namespace, sandbox, status, Some(&pod_name), &message)
                    .await
            }
            Some("Running") if phase == SandboxPhase::Pending => {
                info!(%namespace, sandbox = %name, "backing pod is running");
                let mut next = status;
                next.phase = Some(SandboxPhase::Running);
                next.pod_ip = pod_ip(&pod).map(String::from);
                next.started_at = Some(Utc::now());
                self.write_status(namespace, sandbox, next).await
            }
            _ => Ok(()),
        }
    }

    /// Moves the sandbox to Terminated and reaps its backing pod.
    ///
    /// The pod is deleted even if the status write lost a race: every path
    /// into here observed a pod state that justifies deletion on its own,
    /// and the next sweep records the terminal phase against whatever the
    /// winning writer left behind.
    async fn terminate(
        &self,
        namespace: &str,
        sandbox: &Sandbox,
        status: SandboxStatus,
        pod_name: Option<&str>,
        message: &str,
    ) -> MonoboxResult<()> {
        let name = sandbox.name_any();
        info!(%namespace, sandbox = %name, reason = message, "terminating sandbox");

        let mut next = status;
        next.phase = Some(SandboxPhase::Terminated);
        next.message = Some(message.to_string());
        self.write_status(namespace, sandbox, next).await?;

        if let Some(pod_name) = pod_name {
            self.reap_pod(namespace, &name, pod_name).await?;
        }
        Ok(())
    }

    /// Deletes a backing pod, treating absence as done.
    async fn reap_pod(&self, namespace: &str, sandbox: &str, pod_name: &str) -> MonoboxResult<()> {
        if ignore_not_found(self.store.delete_pod(namespace, pod_name).await)?.is_some() {
            info!(%namespace, sandbox, pod = pod_name, "deleted backing pod");
        }
        Ok(())
    }

    /// Writes `status` conditioned on the version `sandbox` was read at.
    async fn write_status(
        &self,
        namespace: &str,
        sandbox: &Sandbox,
        status: SandboxStatus,
    ) -> MonoboxResult<()> {
        let name = sandbox.name_any();
        let version = sandbox
            .meta()
            .resource_version
            .as_deref()
            .unwrap_or_default();
        yield_on_conflict(
            self.store
                .patch_sandbox_status(namespace, &name, version, &status)
                .await,
        )?;
        Ok(())
    }

    /// Logs a rejection when the spec names a volume the live pod does not
    /// mount. Pods cannot gain mounts after creation, so the reference stays
    /// recorded but takes effect only if the sandbox is ever recreated.
    async fn reject_live_attach(&self, namespace: &str, observed: &Sandbox) {
        let Some(claim) = observed.spec.volume.as_deref() else {
            return;
        };
        let Some(pod_name) = observed.pod_name() else {
            return;
        };
        match self.store.get_pod(namespace, pod_name).await {
            Ok(Some(pod)) if !mounts_claim(&pod, claim) => {
                warn!(
                    %namespace,
                    sandbox = %observed.name_any(),
                    volume = claim,
                    "cannot attach a volume to a running sandbox; recreate with the volume set"
                );
            }
            Ok(_) => {}
            Err(error) => {
                debug!(
                    %namespace,
                    sandbox = %observed.name_any(),
                    %error,
                    "skipping volume attach check, pod not readable"
                );
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
