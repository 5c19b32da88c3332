//! Construction of the backing pod for a sandbox.
//!
//! Every sandbox owns exactly one pod with the same name. The pod carries an
//! owner reference back to the sandbox so cascading deletion cleans it up
//! even if the controller is down when the sandbox goes away.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::config::{
    DEFAULT_CPU_LIMIT, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_LIMIT, DEFAULT_MEMORY_REQUEST,
};
use crate::MonoboxError;
use crate::MonoboxResult;

use super::sandbox::{Sandbox, SandboxResources};
use super::template::ResolvedSandbox;
use super::{
    api_version, EXPIRES_AT_ANNOTATION, SANDBOX_CONTAINER, SANDBOX_LABEL, SANDBOX_NAME_LABEL,
    SHARED_DIR, SHARED_VOLUME, WORKSPACE_DIR, WORKSPACE_VOLUME,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the pod backing `sandbox` from its resolved parameters.
///
/// The sandbox must already be persisted: its `uid` anchors the owner
/// reference, so a sandbox that has not round-tripped through the store
/// cannot be given a pod.
pub fn backing_pod(
    sandbox: &Sandbox,
    resolved: &ResolvedSandbox,
    expires_at: &DateTime<Utc>,
) -> MonoboxResult<Pod> {
    let name = sandbox.name_any();
    let uid = sandbox.meta().uid.clone().ok_or_else(|| {
        MonoboxError::Validation(format!("sandbox {} has no uid; cannot own a pod", name))
    })?;

    let mut labels = BTreeMap::new();
    labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
    labels.insert(SANDBOX_NAME_LABEL.to_string(), name.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(EXPIRES_AT_ANNOTATION.to_string(), expires_at.to_rfc3339());

    let mut volumes = vec![Volume {
        name: WORKSPACE_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_DIR.to_string(),
        ..Default::default()
    }];
    if let Some(claim) = &sandbox.spec.volume {
        volumes.push(Volume {
            name: SHARED_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: SHARED_VOLUME.to_string(),
            mount_path: SHARED_DIR.to_string(),
            ..Default::default()
        });
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: sandbox.meta().namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![OwnerReference {
                api_version: api_version(),
                kind: "Sandbox".to_string(),
                name,
                uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: SANDBOX_CONTAINER.to_string(),
                image: Some(resolved.image.clone()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                resources: Some(resource_requirements(&resolved.resources)),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Returns the pod's reported phase string, when the kubelet has set one.
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Returns the pod's assigned IP, once scheduled and networked.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

/// Checks whether `pod` already mounts the persistent volume claim `claim`.
pub fn mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|volume| {
                volume
                    .persistent_volume_claim
                    .as_ref()
                    .is_some_and(|source| source.claim_name == claim)
            })
        })
}

fn resource_requirements(resources: &SandboxResources) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    limits.insert(
        "cpu".to_string(),
        Quantity(
            resources
                .cpu
                .clone()
                .unwrap_or_else(|| DEFAULT_CPU_LIMIT.to_string()),
        ),
    );
    limits.insert(
        "memory".to_string(),
        Quantity(
            resources
                .memory
                .clone()
                .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string()),
        ),
    );

    let mut requests = BTreeMap::new();
    requests.insert(
        "cpu".to_string(),
        Quantity(
            resources
                .cpu_request
                .clone()
                .unwrap_or_else(|| DEFAULT_CPU_REQUEST.to_string()),
        ),
    );
    requests.insert(
        "memory".to_string(),
        Quantity(
            resources
                .memory_request
                .clone()
                .unwrap_or_else(|| DEFAULT_MEMORY_REQUEST.to_string()),
        ),
    );

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
