// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

//! Assessment helpers for peer-pods end-to-end tests.
//!
//! Everything hangs off [`TestContext`], which pairs a `kube::Client` with
//! the timeouts in [`E2eConfig`]. Helpers only observe the cluster: they
//! create and delete pods and namespaces, poll until a condition holds and
//! compare what they find with what the test expects.

pub mod assessment;
pub mod config;
pub mod error;
pub mod exec;
pub mod jobs;
pub mod lifecycle;
pub mod logs;
pub mod lookup;
pub mod pod;
pub mod test_case;
pub mod timer;

#[cfg(test)]
mod mock_client;

pub use config::{E2eConfig, is_ci};
pub use error::{AssessError, ExecError};
pub use exec::ExecOutput;
pub use jobs::JobPodSummary;
pub use lookup::PodObservation;
pub use pod::{PodPhase, new_pod};
pub use test_case::{CloudAssert, ExtraPod, TestCase, TestCommand};
pub use timer::{Check, Poller};

#[doc(hidden)]
pub use log as __log;

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::{Api, Client};
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise `env_logger` once for the whole test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Cluster client plus the timeouts the helpers run with.
#[derive(Clone)]
pub struct TestContext {
    client: Client,
    config: E2eConfig,
}

impl TestContext {
    pub fn new(client: Client, config: E2eConfig) -> Self {
        Self { client, config }
    }

    /// Client from the ambient kubeconfig, config from `CAA_E2E_*`.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build a Kubernetes client")?;
        Ok(Self::new(client, E2eConfig::from_env()?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &E2eConfig {
        &self.config
    }

    pub(crate) fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

pub fn name_or_default(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or("<no name>".to_string())
}

/// Namespace and name of a pod, falling back to the client's namespace.
pub(crate) fn pod_ref<'a>(pod: &'a Pod, client: &'a Client) -> anyhow::Result<(&'a str, &'a str)> {
    let name = pod
        .metadata
        .name
        .as_deref()
        .context("pod has no metadata.name")?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .unwrap_or(client.default_namespace());
    Ok((namespace, name))
}

/// Unique namespace name for a test run.
pub fn test_namespace_name() -> String {
    format!("caa-e2e-{}", &uuid::Uuid::new_v4().to_string()[..8])
}
