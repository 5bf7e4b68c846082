// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, ObjectList};

use crate::config::CAA_APP_LABEL;
use crate::pod::node_name;
use crate::{AssessError, TestContext, pod_ref};

/// What to read from a pod once it has been looked up again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodObservation {
    Log,
    EventWarnings,
    NodeName,
}

impl TestContext {
    /// Fresh copy of `pod` from a listing of its namespace.
    ///
    /// The caller's object may predate scheduling, so observations go
    /// through this rather than the object they were handed.
    pub async fn refresh_pod(&self, pod: &Pod) -> anyhow::Result<Pod> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        let list = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list pods in namespace {namespace}"))?;
        list.items
            .into_iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .ok_or_else(|| {
                AssessError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn string_from_pod(
        &self,
        pod: &Pod,
        observation: PodObservation,
    ) -> anyhow::Result<String> {
        let fresh = self.refresh_pod(pod).await?;
        match observation {
            PodObservation::Log => self.pod_log(&fresh).await,
            PodObservation::EventWarnings => self.pod_event_warning_descriptions(&fresh).await,
            PodObservation::NodeName => Ok(node_name(&fresh).unwrap_or_default().to_string()),
        }
    }

    /// Node the pod is scheduled on; empty if it is not scheduled yet.
    pub async fn node_name_from_pod(&self, pod: &Pod) -> anyhow::Result<String> {
        self.string_from_pod(pod, PodObservation::NodeName).await
    }

    pub async fn pods_by_label(
        &self,
        namespace: &str,
        label_name: &str,
        label_value: &str,
    ) -> anyhow::Result<ObjectList<Pod>> {
        let lp = ListParams::default().labels(&format!("{label_name}={label_value}"));
        self.pods(namespace).list(&lp).await.with_context(|| {
            format!("failed to list pods labelled {label_name}={label_value} in {namespace}")
        })
    }

    /// The cloud-api-adaptor pod serving `node`.
    pub async fn caa_pod_on_node(&self, node: &str) -> anyhow::Result<Pod> {
        let namespace = &self.config.caa_namespace;
        let pods = self.pods_by_label(namespace, "app", CAA_APP_LABEL).await?;
        pods.items
            .into_iter()
            .find(|p| node_name(p) == Some(node))
            .ok_or_else(|| {
                AssessError::NoCaaPod {
                    namespace: namespace.clone(),
                    node: Some(node.to_string()),
                }
                .into()
            })
    }
}
