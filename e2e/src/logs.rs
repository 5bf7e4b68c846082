// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Context;
use chrono::NaiveTime;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::Api;
use kube::api::{ListParams, LogParams};
use log::{debug, info};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::pod::{PodPhase, first_container_image, node_name};
use crate::{AssessError, TestContext, pod_ref};

const PULL_START_MARKER: &str = "calling PullImage for";
const PULL_END_MARKER: &str = "successfully pulled image";

static TIME_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{2}):(\d{2}):(\d{2})\b").expect("valid time regex"));

/// First `HH:MM:SS` token in a log line.
pub fn time_extractor(line: &str) -> anyhow::Result<&str> {
    TIME_TOKEN
        .find(line)
        .map(|m| m.as_str())
        .ok_or_else(|| AssessError::InvalidTimeData.into())
}

fn log_time(line: &str) -> anyhow::Result<NaiveTime> {
    let token = time_extractor(line)?;
    NaiveTime::parse_from_str(token, "%H:%M:%S").map_err(|_| AssessError::InvalidTimeData.into())
}

/// Time between the most recent `calling PullImage` entry for `image` and
/// the `successfully pulled image` entry that follows it.
pub fn image_pull_duration(log: &str, image: &str) -> anyhow::Result<Duration> {
    let start_marker = format!("{PULL_START_MARKER} \"{image}\"");
    let end_marker = format!("{PULL_END_MARKER} \"{image}\"");

    let mut start = None;
    let mut end = None;
    for line in log.lines().rev() {
        if line.contains(&start_marker) {
            start = Some(log_time(line)?);
            break;
        }
        if line.contains(&end_marker) {
            end = Some(log_time(line)?);
        }
    }

    let missing = |marker| AssessError::PullMarkerMissing {
        marker,
        image: image.to_string(),
    };
    let start = start.ok_or_else(|| missing(PULL_START_MARKER))?;
    let end = end.ok_or_else(|| missing(PULL_END_MARKER))?;
    (end - start).to_std().map_err(|_| {
        anyhow::anyhow!("pull of {image} finished at {end} before it started at {start}")
    })
}

/// Concatenated messages of all `Warning` events, in list order.
pub fn warning_descriptions(events: &[Event]) -> String {
    events
        .iter()
        .filter(|e| e.type_.as_deref() == Some("Warning"))
        .filter_map(|e| e.message.as_deref())
        .collect()
}

/// Whether the adaptor log shows `container_id` mounted through guest pull.
pub fn log_shows_guest_pull(log: &str, container_id: &str) -> anyhow::Result<bool> {
    let re = Regex::new(&format!(
        r".*mount_point:/run/kata-containers.*{}.*driver:image_guest_pull.*$",
        regex::escape(container_id)
    ))?;
    Ok(log.lines().rev().any(|line| re.is_match(line)))
}

impl TestContext {
    /// Whole current log of the pod, trimmed.
    pub async fn pod_log(&self, pod: &Pod) -> anyhow::Result<String> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        let log = self
            .pods(namespace)
            .logs(name, &LogParams::default())
            .await
            .with_context(|| format!("failed to read log of pod {namespace}/{name}"))?;
        Ok(log.trim().to_string())
    }

    /// Warning (and error) event messages recorded against the pod.
    pub async fn pod_event_warning_descriptions(&self, pod: &Pod) -> anyhow::Result<String> {
        let (namespace, name) = pod_ref(pod, &self.client)?;
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.name={name}"));
        let list = events
            .list(&lp)
            .await
            .with_context(|| format!("failed to list events of pod {namespace}/{name}"))?;
        Ok(warning_descriptions(&list.items))
    }

    /// How long the adaptor took to pull the image of `pod`, e.g. `"12s"`.
    pub async fn watch_image_pull_time(&self, caa_pod: &Pod, pod: &Pod) -> anyhow::Result<String> {
        if PodPhase::of(pod) != PodPhase::Running {
            return Err(AssessError::PodNotRunning.into());
        }
        let log = self.pod_log(caa_pod).await?;
        if log.is_empty() {
            return Err(AssessError::EmptyLog.into());
        }
        let image = first_container_image(pod).context("pod has no container image")?;
        let pulling = image_pull_duration(&log, image)?;
        info!("Image {image} pulled in {}", humantime::format_duration(pulling));
        Ok(humantime::format_duration(pulling).to_string())
    }

    /// Image pull time of `pod` as logged by the adaptor on its node.
    pub async fn image_pull_time(&self, pod: &Pod) -> anyhow::Result<String> {
        let fresh = self.refresh_pod(pod).await?;
        let node = node_name(&fresh).unwrap_or_default();
        let caa_pod = self.caa_pod_on_node(node).await?;
        self.watch_image_pull_time(&caa_pod, &fresh).await
    }

    /// Whether the adaptor on `node` pulled `container_id` with the nydus
    /// snapshotter (guest pull). A missing adaptor pod is `NoCaaPod`.
    pub async fn is_pulled_with_nydus_snapshotter(
        &self,
        node: &str,
        container_id: &str,
    ) -> anyhow::Result<bool> {
        let caa_pod = self.caa_pod_on_node(node).await?;
        let log = self.pod_log(&caa_pod).await?;
        let pulled = log_shows_guest_pull(&log, container_id)?;
        if pulled {
            debug!("Container {container_id} was pulled in the guest on {node}");
        } else {
            debug!("No guest pull entry for container {container_id} on {node}");
        }
        Ok(pulled)
    }
}
