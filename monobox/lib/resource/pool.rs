//! The `SandboxPool` custom resource.
//!
//! A pool keeps a floor of warm, unclaimed sandboxes stamped from one
//! template, so callers can claim a running sandbox without paying pod
//! startup latency.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::template::TemplateRef;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Desired state of a warm pool of sandboxes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monobox.zerocore.ai",
    version = "v1alpha1",
    kind = "SandboxPool",
    plural = "sandboxpools",
    namespaced,
    status = "SandboxPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolSpec {
    /// Minimum number of warm (running, unclaimed) members to keep available.
    pub min_size: u32,

    /// Upper bound on total members; defaults to twice `min_size` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,

    /// Template every member is stamped from. Required; surfaced as a
    /// validation error rather than a schema failure so the pool object
    /// itself stays inspectable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
}

/// Observed state of a pool, recomputed on every reconciliation pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolStatus {
    /// Number of members currently warm and claimable.
    #[serde(default)]
    pub ready_count: u32,

    /// Number of members currently claimed.
    #[serde(default)]
    pub claimed_count: u32,

    /// Names of all current members, claimed or not.
    #[serde(default)]
    pub sandboxes: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxPool {
    /// Returns the effective cap on total members.
    pub fn max_size(&self) -> u32 {
        self.spec.max_size.unwrap_or(self.spec.min_size * 2)
    }

    /// Returns the name of the referenced template, if one is set and
    /// non-empty.
    pub fn template_name(&self) -> Option<&str> {
        self.spec
            .template_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_size_defaults_to_twice_min() {
        let pool = SandboxPool::new(
            "py-pool",
            SandboxPoolSpec {
                min_size: 3,
                ..Default::default()
            },
        );
        assert_eq!(pool.max_size(), 6);

        let pool = SandboxPool::new(
            "py-pool",
            SandboxPoolSpec {
                min_size: 3,
                max_size: Some(10),
                ..Default::default()
            },
        );
        assert_eq!(pool.max_size(), 10);
    }

    #[test]
    fn test_template_name_rejects_empty() {
        let mut pool = SandboxPool::new("py-pool", SandboxPoolSpec::default());
        assert_eq!(pool.template_name(), None);

        pool.spec.template_ref = Some(TemplateRef {
            name: String::new(),
        });
        assert_eq!(pool.template_name(), None);

        pool.spec.template_ref = Some(TemplateRef {
            name: "py-tmpl".to_string(),
        });
        assert_eq!(pool.template_name(), Some("py-tmpl"));
    }

    #[test]
    fn test_status_counts_serialize_even_when_zero() {
        let status = SandboxPoolStatus::default();
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["readyCount"], 0);
        assert_eq!(value["claimedCount"], 0);
        assert!(value["sandboxes"].as_array().unwrap().is_empty());
    }
}
