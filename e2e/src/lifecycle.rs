// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Context;
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, Pod, ServiceAccount};
use kube::Api;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use log::{debug, info, warn};
use std::fmt::Debug;
use std::time::Duration;

use crate::pod::{PodPhase, containers_ready, state_description};
use crate::timer::{Check, Poller};
use crate::{TestCommand, TestContext, pod_ref};

/// Poll `api` until `name` is gone.
async fn wait_for_deleted<K>(
    api: &Api<K>,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> anyhow::Result<()>
where
    K: kube::Resource<DynamicType = ()> + Clone + Debug,
    K: k8s_openapi::serde::de::DeserializeOwned,
{
    let poller = Poller::new()
        .with_timeout(timeout)
        .with_interval(interval)
        .with_error_message(format!("waiting for {name} to be deleted"));

    poller
        .poll_async(|| {
            let api = api.clone();
            async move {
                match api.get(name).await {
                    Ok(_) => Ok(Check::Pending(format!("{name} still exists"))),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Check::Done(())),
                    Err(e) => Err(e).with_context(|| format!("failed to look up {name}")),
                }
            }
        })
        .await
}

impl TestContext {
    /// Create `pod` and wait until it reaches `desired`. Running pods, and
    /// pods that will have commands run in them, must also become ready.
    pub async fn provision_pod(
        &self,
        pod: &Pod,
        desired: PodPhase,
        commands: &[TestCommand],
    ) -> anyhow::Result<()> {
        self.create_pod(pod).await?;
        self.wait_for_pod_state(pod, desired, commands).await
    }

    pub async fn create_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .with_context(|| format!("failed to create pod {namespace}/{name}"))?;
        info!("Created pod {namespace}/{name}");
        Ok(())
    }

    /// Wait until an already created `pod` reaches `desired`, and is ready
    /// when it is Running or `commands` will be run in it.
    pub async fn wait_for_pod_state(
        &self,
        pod: &Pod,
        desired: PodPhase,
        commands: &[TestCommand],
    ) -> anyhow::Result<()> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        let api = self.pods(namespace);
        info!("Waiting for pod {namespace}/{name} to be {desired}");

        Poller::new()
            .with_timeout(self.config.pod_running_timeout)
            .with_interval(self.config.phase_poll_interval)
            .with_error_message(format!("waiting for pod {namespace}/{name} to be {desired}"))
            .poll_async(|| {
                let api = api.clone();
                async move {
                    let current = api.get(name).await?;
                    if PodPhase::of(&current) == desired {
                        return Ok(Check::Done(()));
                    }
                    Ok(Check::Pending(state_description(&current)))
                }
            })
            .await?;

        if desired != PodPhase::Running && commands.is_empty() {
            return Ok(());
        }

        info!("Waiting for containers in pod {namespace}/{name} to be ready");
        let ready = Poller::new()
            .with_timeout(self.config.pod_running_timeout)
            .with_interval(self.config.phase_poll_interval)
            .with_error_message(format!("waiting for containers in {namespace}/{name} to be ready"))
            .poll_async(|| {
                let api = api.clone();
                async move {
                    let current = api.get(name).await?;
                    if containers_ready(&current) {
                        return Ok(Check::Done(()));
                    }
                    Ok(Check::Pending(state_description(&current)))
                }
            })
            .await;
        if ready.is_err() {
            self.log_pod_diagnostics(&api, name, desired).await;
        }
        ready
    }

    /// Best effort: dump the status and log of a pod that never got ready.
    async fn log_pod_diagnostics(&self, api: &Api<Pod>, name: &str, desired: PodPhase) {
        let actual = match api.get(name).await {
            Ok(pod) => pod,
            Err(e) => {
                warn!("Failed to fetch pod {name} for diagnostics: {e}");
                return;
            }
        };
        info!("Expected pod state: {desired}");
        match serde_yaml::to_string(&actual.status) {
            Ok(yaml) => info!("Current pod state:\n{yaml}"),
            Err(e) => warn!("Failed to render status of pod {name} as YAML: {e}"),
        }
        if PodPhase::of(&actual) == PodPhase::Running {
            if let Ok(log) = self.pod_log(&actual).await {
                info!("Log of the pod {name}\n===================\n{log}\n===================");
            }
        }
    }

    /// Delete `pod` and wait until the API no longer knows it.
    pub async fn delete_pod(&self, pod: &Pod, timeout: Option<Duration>) -> anyhow::Result<()> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        let timeout = timeout.unwrap_or(self.config.pod_deletion_timeout);
        let api = self.pods(namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete pod {namespace}/{name}"))?;
        wait_for_deleted(&api, name, timeout, self.config.deletion_poll_interval).await?;
        info!("Deleted pod {namespace}/{name}");
        Ok(())
    }

    /// Create namespace `name` and wait until pods can be created in it,
    /// which needs both the `Active` phase and the `default` service account.
    pub async fn create_and_wait_for_namespace(&self, name: &str) -> anyhow::Result<()> {
        info!("Creating namespace '{name}'...");
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace)
            .await
            .with_context(|| format!("failed to create namespace {name}"))?;

        let timeout = self.config.namespace_available_timeout;
        info!("Wait for namespace '{name}' be ready...");
        Poller::new()
            .with_timeout(timeout)
            .with_interval(self.config.phase_poll_interval)
            .with_error_message(format!("waiting for namespace '{name}' to be Active"))
            .poll_async(|| {
                let api = api.clone();
                async move {
                    let current = api.get(name).await?;
                    match current.status.and_then(|s| s.phase) {
                        Some(phase) if phase == "Active" => Ok(Check::Done(())),
                        phase => Ok(Check::Pending(format!("phase={}", phase.unwrap_or_default()))),
                    }
                }
            })
            .await?;

        // The default service account shows up shortly after the namespace
        // turns Active, and pods created before that are rejected.
        info!("Wait for default serviceaccount in namespace '{name}'...");
        let service_accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), name);
        Poller::new()
            .with_timeout(timeout)
            .with_interval(self.config.service_account_poll_interval)
            .with_error_message(format!(
                "default service account not found in namespace '{name}' after {} seconds wait",
                timeout.as_secs()
            ))
            .poll_async(|| {
                let api = service_accounts.clone();
                async move {
                    let list = api.list(&ListParams::default()).await?;
                    if list
                        .items
                        .iter()
                        .any(|sa| sa.metadata.name.as_deref() == Some("default"))
                    {
                        return Ok(Check::Done(()));
                    }
                    Ok(Check::Pending(format!(
                        "{} service accounts, none named default",
                        list.items.len()
                    )))
                }
            })
            .await?;
        info!("default serviceAccount exists, namespace '{name}' is ready for use");
        Ok(())
    }

    pub async fn delete_and_wait_for_namespace(&self, name: &str) -> anyhow::Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete namespace {name}"))?;
        info!("Deleting namespace '{name}'...");
        let timeout = self.config.namespace_deletion_timeout;
        wait_for_deleted(&api, name, timeout, self.config.deletion_poll_interval).await?;
        info!(
            "Namespace '{name}' has been successfully deleted within {}",
            humantime::format_duration(timeout)
        );
        Ok(())
    }

    /// Make `default` in `namespace` pull images with `secret`. No write
    /// happens when the secret is already listed.
    pub async fn add_image_pull_secret_to_default_service_account(
        &self,
        namespace: &str,
        secret: &str,
    ) -> anyhow::Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let mut service_account = api
            .get("default")
            .await
            .with_context(|| format!("failed to get default service account in {namespace}"))?;

        let secrets = service_account
            .image_pull_secrets
            .get_or_insert_with(Vec::new);
        if secrets.iter().any(|s| s.name == secret) {
            debug!("Service account {namespace}/default already uses pull secret {secret}");
            return Ok(());
        }
        secrets.push(LocalObjectReference {
            name: secret.to_string(),
        });
        api.replace("default", &PostParams::default(), &service_account)
            .await
            .with_context(|| format!("failed to update default service account in {namespace}"))?;
        info!("ServiceAccount {namespace}/default updated with pull secret {secret}");
        Ok(())
    }
}
