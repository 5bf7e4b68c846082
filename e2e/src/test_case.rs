// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use log::{info, warn};
use std::future::Future;
use std::time::Duration;

use crate::assessment::assess_pod_request_and_limit;
use crate::pod::{PodOption, PodPhase, new_pod};
use crate::{ExecError, TestContext, name_or_default};

/// Provider-specific knowledge the generic assertions need.
pub trait CloudAssert {
    /// How long a test pod may take to go away.
    fn default_timeout(&self) -> Duration;

    /// Cloud instance type of the PodVM backing `pod_name`.
    fn get_instance_type(
        &self,
        pod_name: &str,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

pub type ErrorPredicate = Box<dyn Fn(&ExecError) -> bool + Send + Sync>;
pub type OutputPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// A command to run inside a test pod, with optional validators.
pub struct TestCommand {
    pub command: Vec<String>,
    pub container_name: String,
    pub test_error_fn: Option<ErrorPredicate>,
    pub test_stderr_fn: Option<OutputPredicate>,
    pub test_stdout_fn: Option<OutputPredicate>,
}

impl TestCommand {
    pub fn new(container_name: &str, command: &[&str]) -> Self {
        Self {
            command: command.iter().map(|s| s.to_string()).collect(),
            container_name: container_name.to_string(),
            test_error_fn: None,
            test_stderr_fn: None,
            test_stdout_fn: None,
        }
    }

    /// The command is expected to fail, and `f` must accept the failure.
    pub fn expect_error(mut self, f: impl Fn(&ExecError) -> bool + Send + Sync + 'static) -> Self {
        self.test_error_fn = Some(Box::new(f));
        self
    }

    pub fn expect_stderr(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.test_stderr_fn = Some(Box::new(f));
        self
    }

    pub fn expect_stdout(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.test_stdout_fn = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for TestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCommand")
            .field("command", &self.command)
            .field("container_name", &self.container_name)
            .field("test_error_fn", &self.test_error_fn.is_some())
            .field("test_stderr_fn", &self.test_stderr_fn.is_some())
            .field("test_stdout_fn", &self.test_stdout_fn.is_some())
            .finish()
    }
}

/// A pod provisioned alongside the pod under test.
#[derive(Debug)]
pub struct ExtraPod {
    pub pod: Pod,
    pub pod_state: PodPhase,
    pub expected_pod_log_string: Option<String>,
    pub test_commands: Vec<TestCommand>,
}

impl ExtraPod {
    pub fn new(
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        image_name: &str,
        options: Vec<PodOption>,
    ) -> Self {
        Self {
            pod: new_pod(namespace, pod_name, container_name, image_name, options),
            pod_state: PodPhase::Running,
            expected_pod_log_string: None,
            test_commands: Vec::new(),
        }
    }

    pub fn with_pod_state(mut self, state: PodPhase) -> Self {
        self.pod_state = state;
        self
    }

    pub fn with_expected_pod_log_string(mut self, expected: &str) -> Self {
        self.expected_pod_log_string = Some(expected.to_string());
        self
    }

    pub fn with_test_commands(mut self, commands: Vec<TestCommand>) -> Self {
        self.test_commands = commands;
        self
    }
}

/// One pod under test and everything expected of it.
pub struct TestCase<A: CloudAssert> {
    name: String,
    assert: A,
    assess_message: String,
    pod: Option<Pod>,
    pod_state: PodPhase,
    test_commands: Vec<TestCommand>,
    expected_pod_log_string: Option<String>,
    expected_pod_event_warning: Option<String>,
    expected_instance_type: Option<String>,
    alternate_image_name: Option<String>,
    image_pull_timer: bool,
    check_request_and_limit: bool,
    extra_pods: Vec<ExtraPod>,
    deletion_within: Duration,
}

impl<A: CloudAssert> TestCase<A> {
    pub fn new(name: &str, assert: A, assess_message: &str) -> Self {
        let deletion_within = assert.default_timeout();
        Self {
            name: name.to_string(),
            assert,
            assess_message: assess_message.to_string(),
            pod: None,
            pod_state: PodPhase::Running,
            test_commands: Vec::new(),
            expected_pod_log_string: None,
            expected_pod_event_warning: None,
            expected_instance_type: None,
            alternate_image_name: None,
            image_pull_timer: false,
            check_request_and_limit: false,
            extra_pods: Vec::new(),
            deletion_within,
        }
    }

    pub fn with_pod(mut self, pod: Pod) -> Self {
        self.pod = Some(pod);
        self
    }

    pub fn with_pod_state(mut self, state: PodPhase) -> Self {
        self.pod_state = state;
        self
    }

    pub fn with_test_commands(mut self, commands: Vec<TestCommand>) -> Self {
        self.test_commands = commands;
        self
    }

    pub fn with_expected_pod_log_string(mut self, expected: &str) -> Self {
        self.expected_pod_log_string = Some(expected.to_string());
        self
    }

    pub fn with_expected_pod_event_warning(mut self, expected: &str) -> Self {
        self.expected_pod_event_warning = Some(expected.to_string());
        self
    }

    pub fn with_expected_instance_type(mut self, expected: &str) -> Self {
        self.expected_instance_type = Some(expected.to_string());
        self
    }

    pub fn with_alternate_image(mut self, image: &str) -> Self {
        self.alternate_image_name = Some(image.to_string());
        self
    }

    pub fn with_image_pull_timer(mut self) -> Self {
        self.image_pull_timer = true;
        self
    }

    pub fn with_request_and_limit_check(mut self) -> Self {
        self.check_request_and_limit = true;
        self
    }

    pub fn with_extra_pods(mut self, extra_pods: Vec<ExtraPod>) -> Self {
        self.extra_pods = extra_pods;
        self
    }

    pub fn with_deletion_within(mut self, timeout: Duration) -> Self {
        self.deletion_within = timeout;
        self
    }

    /// Provision the pods, run every configured assertion, then delete the
    /// pods this run created. Cleanup runs even when an assertion fails;
    /// the first error wins.
    pub async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let pod = self
            .pod
            .as_ref()
            .with_context(|| format!("test case {} has no pod", self.name))?;
        info!("{}: {}", self.name, self.assess_message);

        let mut created: Vec<&Pod> = Vec::new();
        let outcome = async {
            for extra in &self.extra_pods {
                ctx.create_pod(&extra.pod).await?;
                created.push(&extra.pod);
                ctx.wait_for_pod_state(&extra.pod, extra.pod_state, &extra.test_commands)
                    .await?;
            }
            ctx.create_pod(pod).await?;
            created.push(pod);
            ctx.wait_for_pod_state(pod, self.pod_state, &self.test_commands)
                .await?;
            self.assess(ctx, pod).await
        }
        .await;

        let mut cleanup = Ok(());
        for p in created.iter().rev() {
            if let Err(e) = ctx.delete_pod(p, Some(self.deletion_within)).await {
                warn!("{}: failed to delete pod {}: {e:#}", self.name, name_or_default(&p.metadata));
                if cleanup.is_ok() {
                    cleanup = Err(e);
                }
            }
        }
        outcome.and(cleanup)
    }

    async fn assess(&self, ctx: &TestContext, pod: &Pod) -> anyhow::Result<()> {
        if self.check_request_and_limit {
            assess_pod_request_and_limit(&ctx.refresh_pod(pod).await?)?;
        }
        if let Some(expected) = &self.expected_pod_log_string {
            ctx.compare_pod_log_string(pod, expected).await?;
        }
        if let Some(expected) = &self.expected_pod_event_warning {
            ctx.compare_pod_event_warning_descriptions(pod, expected)
                .await?;
        }
        if let Some(expected) = &self.expected_instance_type {
            ctx.compare_instance_type(pod, expected, async |name: &str| {
                self.assert.get_instance_type(name).await
            })
            .await?;
        }
        if let Some(image) = &self.alternate_image_name {
            ctx.verify_alternate_image(image).await?;
        }
        if !self.test_commands.is_empty() {
            let output = ctx
                .assess_pod_test_commands(pod, &self.test_commands)
                .await?;
            info!("{}: command output: {output}", self.name);
        }
        if self.image_pull_timer {
            let pulling = ctx.image_pull_time(pod).await?;
            info!("{}: image pulled in {pulling}", self.name);
        }

        for extra in &self.extra_pods {
            if let Some(expected) = &extra.expected_pod_log_string {
                ctx.compare_pod_log_string(&extra.pod, expected).await?;
            }
            if !extra.test_commands.is_empty() {
                ctx.assess_pod_test_commands(&extra.pod, &extra.test_commands)
                    .await?;
            }
        }
        Ok(())
    }
}
