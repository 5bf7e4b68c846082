// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use std::time::Duration;

/// Failures reported by the assessment helpers.
///
/// Helpers return `anyhow::Result`; callers that need to tell a mismatch
/// apart from an API failure can `downcast_ref::<AssessError>()`.
#[derive(Debug, thiserror::Error)]
pub enum AssessError {
    #[error("no pod matching {namespace}/{name} was found")]
    PodNotFound { namespace: String, name: String },

    #[error("no cloud-api-adaptor pod found in namespace {namespace}{}", node_suffix(.node))]
    NoCaaPod {
        namespace: String,
        node: Option<String>,
    },

    #[error("invalid time data")]
    InvalidTimeData,

    #[error("pod failed to start")]
    PodNotRunning,

    #[error("pod failed to log expected output")]
    EmptyLog,

    #[error("no {marker} entry for image {image} in the adaptor log")]
    PullMarkerMissing { marker: &'static str, image: String },

    #[error("pod log doesn't contain expected string {expected:?}")]
    LogMismatch { expected: String, actual: String },

    #[error("pod events don't contain expected string {expected:?}")]
    EventMismatch { expected: String, actual: String },

    #[error("pod instance type was {actual}, but we expected {expected}")]
    InstanceTypeMismatch { expected: String, actual: String },

    #[error("{kind} for podvm extended resource is not set to 1")]
    ExtendedResource { kind: &'static str },

    #[error("no pull entry found for container {container_id} in the adaptor log")]
    NoPullEntry { container_id: String },

    #[error("failed to create PodVM for pod {0}")]
    PodVmCreation(String),

    #[error("command {command:?} running in container {container} produced unexpected output on {stream}: {output}")]
    UnexpectedOutput {
        command: Vec<String>,
        container: String,
        stream: &'static str,
        output: String,
    },

    #[error("we expected an error from pod {0}, but it was not found")]
    ExpectedCommandError(String),

    #[error("timed out after {elapsed:?} {what}: {last_state}")]
    Timeout {
        what: String,
        elapsed: Duration,
        last_state: String,
    },
}

fn node_suffix(node: &Option<String>) -> String {
    node.as_ref()
        .map(|n| format!(" on node {n}"))
        .unwrap_or_default()
}

/// A command run inside a container did not complete successfully.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("exec in {pod}/{container} failed: {source}")]
    Api {
        pod: String,
        container: String,
        #[source]
        source: kube::Error,
    },

    #[error("exec session failed: {0}")]
    Session(String),

    #[error("command exited with {reason}: {message}")]
    NonZeroExit { reason: String, message: String },

    #[error("reading {stream} of the command failed: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
}
