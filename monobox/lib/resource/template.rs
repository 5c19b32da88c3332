//! The `SandboxTemplate` custom resource and its resolution into concrete
//! sandbox parameters.
//!
//! Templates are read-only reference entities: they are resolved exactly once,
//! when a sandbox is created, so later template edits never retroactively
//! affect existing sandboxes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_IMAGE, DEFAULT_TTL_MINUTES};

use super::sandbox::{SandboxResources, SandboxSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reusable sandbox parameters referenced by name from sandboxes and pools.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "monobox.zerocore.ai",
    version = "v1alpha1",
    kind = "SandboxTemplate",
    plural = "sandboxtemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateSpec {
    /// Container image for sandboxes stamped from this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// TTL in minutes for sandboxes stamped from this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<u32>,

    /// Resource requests and limits for sandboxes stamped from this template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<SandboxResources>,
}

/// Reference to a [`SandboxTemplate`] by name within the same namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    /// Name of the referenced template.
    pub name: String,
}

/// Concrete sandbox parameters after template resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSandbox {
    /// The image to run.
    pub image: String,

    /// Minutes until unconditional termination.
    pub ttl_minutes: u32,

    /// Resource requests and limits; unset fields default at pod construction.
    pub resources: SandboxResources,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a sandbox spec against an optionally referenced template.
///
/// A resolved template replaces the spec wholesale: its fields win and its
/// gaps fall back to the hard defaults, not to the spec. Without a template
/// the spec's own fields apply, with the same defaults underneath.
pub fn resolve(spec: &SandboxSpec, template: Option<&SandboxTemplate>) -> ResolvedSandbox {
    match template {
        Some(template) => ResolvedSandbox {
            image: template
                .spec
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            ttl_minutes: template.spec.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES),
            resources: template.spec.resources.clone().unwrap_or_default(),
        },
        None => ResolvedSandbox {
            image: spec
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            ttl_minutes: spec.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES),
            resources: spec.resources.clone().unwrap_or_default(),
        },
    }
}

/// Builds the concrete spec for a pool member stamped from `template`.
///
/// The member records resolved values directly instead of a template
/// reference, pinning the template contents at creation time.
pub fn member_spec(template: &SandboxTemplate) -> SandboxSpec {
    let resolved = resolve(&SandboxSpec::default(), Some(template));
    SandboxSpec {
        image: Some(resolved.image),
        ttl_minutes: Some(resolved.ttl_minutes),
        volume: None,
        resources: template.spec.resources.clone(),
        template_ref: None,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
