// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Context;
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerState, Event, Pod};
use kube::Api;
use kube::api::{WatchEvent, WatchParams};
use log::{info, warn};
use tokio::time::Instant;

use crate::pod::PodPhase;
use crate::{AssessError, TestContext, name_or_default};

/// Server-side limit of a single watch request, in seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// How the pods of a job ended up.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JobPodSummary {
    pub succeeded: usize,
    pub errored: usize,
    /// Log of the last pod that completed.
    pub log: String,
}

fn first_container_state(pod: &Pod) -> Option<&ContainerState> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|c| c.state.as_ref())
}

fn waiting_reason(pod: &Pod) -> Option<&str> {
    first_container_state(pod)
        .and_then(|s| s.waiting.as_ref())
        .and_then(|w| w.reason.as_deref())
}

fn terminated_reason(pod: &Pod) -> Option<&str> {
    first_container_state(pod)
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.as_deref())
}

impl TestContext {
    /// Count the job's pods that completed and those whose container
    /// failed to start, and capture the log of completed pods.
    pub async fn successful_and_errored_pods(&self, job: &Job) -> anyhow::Result<JobPodSummary> {
        let job_name = job.metadata.name.as_deref().context("job has no metadata.name")?;
        let namespace = job
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(self.client.default_namespace());
        let pods = self.pods_by_label(namespace, "job-name", job_name).await?;

        let mut summary = JobPodSummary::default();
        for pod in &pods.items {
            let pod_name = name_or_default(&pod.metadata);
            if PodPhase::of(pod) == PodPhase::Pending
                && waiting_reason(pod) == Some("ContainerCreating")
            {
                return Err(AssessError::PodVmCreation(pod_name).into());
            }
            match terminated_reason(pod) {
                Some("StartError") => {
                    summary.errored += 1;
                    warn!("{pod_name} - StartError");
                }
                Some("Completed") => {
                    summary.succeeded += 1;
                    self.wait_for_started_event(namespace, &pod_name).await?;
                    summary.log = self.pod_log(pod).await?;
                    info!("SUCCESS: {pod_name} - Completed - LOG: {}", summary.log);
                }
                _ => {}
            }
        }
        Ok(summary)
    }

    /// Watch the events of one pod until its container reports `Started`.
    async fn wait_for_started_event(&self, namespace: &str, pod_name: &str) -> anyhow::Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let wp = WatchParams::default()
            .fields(&format!("involvedObject.name={pod_name}"))
            .timeout(WATCH_TIMEOUT_SECS);

        let start = Instant::now();
        let started = async {
            let mut stream = events
                .watch(&wp, "0")
                .await
                .with_context(|| format!("failed to watch events of pod {namespace}/{pod_name}"))?
                .boxed();
            while let Some(event) = stream.try_next().await? {
                match event {
                    WatchEvent::Added(e) | WatchEvent::Modified(e)
                        if e.reason.as_deref() == Some("Started") =>
                    {
                        return Ok(true);
                    }
                    WatchEvent::Error(e) => {
                        return Err(anyhow::anyhow!("event watch for {pod_name} failed: {e:?}"));
                    }
                    _ => {}
                }
            }
            Ok::<_, anyhow::Error>(false)
        };

        match tokio::time::timeout(self.config.pod_running_timeout, started).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(anyhow::anyhow!(
                "event watch for pod {namespace}/{pod_name} ended before a Started event"
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AssessError::Timeout {
                what: format!("waiting for a Started event of pod {namespace}/{pod_name}"),
                elapsed: start.elapsed(),
                last_state: "no Started event".to_string(),
            }
            .into()),
        }
    }
}
