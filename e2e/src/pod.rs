// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    /// Current phase of `pod`; a pod without status is `Unknown`.
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True once the `ContainersReady` condition is `True`.
pub fn containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "ContainersReady" && c.status == "True")
        })
}

pub fn first_container_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.as_deref())
}

pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// One-line summary of phase and container readiness for log messages.
pub fn state_description(pod: &Pod) -> String {
    let phase = PodPhase::of(pod);
    match pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    {
        Some(statuses) => {
            let ready = statuses.iter().filter(|c| c.ready).count();
            let waiting: Vec<&str> = statuses
                .iter()
                .filter_map(|c| {
                    c.state
                        .as_ref()
                        .and_then(|s| s.waiting.as_ref())
                        .and_then(|w| w.reason.as_deref())
                })
                .collect();
            if waiting.is_empty() {
                format!("phase={phase}, containers {ready}/{} ready", statuses.len())
            } else {
                format!(
                    "phase={phase}, containers {ready}/{} ready, waiting: {}",
                    statuses.len(),
                    waiting.join(", ")
                )
            }
        }
        None => format!("phase={phase}, no container status"),
    }
}

pub type PodOption = Box<dyn FnOnce(&mut Pod)>;

/// Single-container pod, customised by `options` in order.
pub fn new_pod(
    namespace: &str,
    pod_name: &str,
    container_name: &str,
    image_name: &str,
    options: Vec<PodOption>,
) -> Pod {
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: container_name.to_string(),
                image: Some(image_name.to_string()),
                image_pull_policy: Some("Always".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    for option in options {
        option(&mut pod);
    }
    pod
}

fn spec_mut(pod: &mut Pod) -> &mut PodSpec {
    pod.spec.get_or_insert_with(PodSpec::default)
}

pub fn with_labels(labels: BTreeMap<String, String>) -> PodOption {
    Box::new(move |pod: &mut Pod| {
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels)
    })
}

pub fn with_restart_policy(policy: &str) -> PodOption {
    let policy = policy.to_string();
    Box::new(move |pod: &mut Pod| spec_mut(pod).restart_policy = Some(policy))
}

pub fn with_runtime_class(class: &str) -> PodOption {
    let class = class.to_string();
    Box::new(move |pod: &mut Pod| spec_mut(pod).runtime_class_name = Some(class))
}

pub fn with_node_name(node: &str) -> PodOption {
    let node = node.to_string();
    Box::new(move |pod: &mut Pod| spec_mut(pod).node_name = Some(node))
}

pub fn with_command(command: &[&str]) -> PodOption {
    let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
    Box::new(move |pod: &mut Pod| {
        if let Some(container) = spec_mut(pod).containers.first_mut() {
            container.command = Some(command);
        }
    })
}

/// Request and limit `quantity` of `resource` on the first container.
pub fn with_extended_resource(resource: &str, quantity: &str) -> PodOption {
    let resource = resource.to_string();
    let quantity = Quantity(quantity.to_string());
    Box::new(move |pod: &mut Pod| {
        if let Some(container) = spec_mut(pod).containers.first_mut() {
            let resources = container
                .resources
                .get_or_insert_with(ResourceRequirements::default);
            resources
                .requests
                .get_or_insert_with(BTreeMap::new)
                .insert(resource.clone(), quantity.clone());
            resources
                .limits
                .get_or_insert_with(BTreeMap::new)
                .insert(resource, quantity);
        }
    })
}
