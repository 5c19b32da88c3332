//! The `Sandbox` custom resource: a managed, ephemeral single-container execution
//! environment with a bounded lifetime.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{template::TemplateRef, CLAIMED_LABEL};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Desired state of a sandbox.
///
/// Every field is optional: unset fields fall back to the referenced template
/// and then to hard defaults at provisioning time.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monobox.zerocore.ai",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    namespaced,
    status = "SandboxStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Container image the sandbox runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Minutes until the sandbox is unconditionally terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<u32>,

    /// Name of a persistent volume claim mounted at `/shared`.
    ///
    /// Only honored at creation time; changing it on a running sandbox is
    /// rejected because live pods cannot be remounted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,

    /// Container resource requests and limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SandboxResources>,

    /// Template resolved once at creation; later template edits do not apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
}

/// Observed state of a sandbox.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    /// Current lifecycle phase; advances monotonically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SandboxPhase>,

    /// Name of the backing pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// IP of the backing pod, recorded at the transition to Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    /// When the backing pod was observed Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the sandbox expires; fixed at creation, never extended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Human-readable detail for the last transition, set on termination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle phase of a sandbox.
///
/// The declaration order defines the only legal direction of travel:
/// `Pending < Running < Terminated`, never backward.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum SandboxPhase {
    /// Backing pod requested but not yet observed Running.
    Pending,

    /// Backing pod is running; the sandbox accepts commands.
    Running,

    /// Final phase: expired, failed, completed or cleaned up.
    Terminated,
}

/// Container resource requests and limits in Kubernetes quantity syntax.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResources {
    /// CPU limit; defaults to `1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit; defaults to `2Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// CPU request; defaults to `100m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    /// Memory request; defaults to `256Mi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Current phase, if the controller has populated status yet.
    pub fn phase(&self) -> Option<SandboxPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    /// Name of the backing pod, if recorded.
    pub fn pod_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.pod_name.as_deref())
    }

    /// Whether the claimed marker label is set.
    pub fn is_claimed(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CLAIMED_LABEL))
            .is_some_and(|value| value == "true")
    }

    /// Whether the sandbox is warm: phase Running and not claimed.
    pub fn is_warm(&self) -> bool {
        self.phase() == Some(SandboxPhase::Running) && !self.is_claimed()
    }
}

impl SandboxPhase {
    /// Whether advancing to `next` preserves the monotonic phase order.
    pub fn permits(self, next: SandboxPhase) -> bool {
        next >= self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Running => "Running",
            SandboxPhase::Terminated => "Terminated",
        };
        write!(f, "{}", phase)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_phase_order_is_monotonic() {
        assert!(SandboxPhase::Pending < SandboxPhase::Running);
        assert!(SandboxPhase::Running < SandboxPhase::Terminated);

        assert!(SandboxPhase::Pending.permits(SandboxPhase::Running));
        assert!(SandboxPhase::Pending.permits(SandboxPhase::Pending));
        assert!(SandboxPhase::Running.permits(SandboxPhase::Terminated));
        assert!(!SandboxPhase::Running.permits(SandboxPhase::Pending));
        assert!(!SandboxPhase::Terminated.permits(SandboxPhase::Running));
    }

    #[test]
    fn test_phase_serializes_as_plain_name() {
        let json = serde_json::to_string(&SandboxPhase::Running).unwrap();
        assert_eq!(json, "\"Running\"");
    }

    #[test]
    fn test_claimed_and_warm_helpers() {
        let mut sandbox = Sandbox::new("sb", SandboxSpec::default());
        assert!(!sandbox.is_claimed());
        assert!(!sandbox.is_warm());

        sandbox.status = Some(SandboxStatus {
            phase: Some(SandboxPhase::Running),
            ..Default::default()
        });
        assert!(sandbox.is_warm());

        sandbox.metadata.labels = Some(BTreeMap::from([(
            CLAIMED_LABEL.to_string(),
            "true".to_string(),
        )]));
        assert!(sandbox.is_claimed());
        assert!(!sandbox.is_warm());
    }

    #[test]
    fn test_spec_roundtrips_camel_case() {
        let spec = SandboxSpec {
            ttl_minutes: Some(60),
            template_ref: Some(TemplateRef {
                name: "py".to_string(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ttlMinutes"], 60);
        assert_eq!(json["templateRef"]["name"], "py");
    }
}
