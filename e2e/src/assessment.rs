// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

//! Assertions over a provisioned pod and the adaptor that serves it.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use log::{debug, info};
use tokio::time::sleep;

use crate::config::{CAA_APP_LABEL, PODVM_EXTENDED_RESOURCE};
use crate::exec::ExecOutput;
use crate::lookup::PodObservation;
use crate::pod::PodPhase;
use crate::{AssessError, TestCommand, TestContext, pod_ref};

/// A Kubernetes quantity such as `1`, `1000m`, `1e0` or `2Gi` as the
/// exact fraction `(numerator, denominator)`. Values that do not fit an
/// `i128` are rejected.
fn quantity_fraction(quantity: &Quantity) -> Option<(i128, i128)> {
    let q = quantity.0.trim();
    let (negative, q) = match q.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, q.strip_prefix('+').unwrap_or(q)),
    };
    let split = q
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return None;
    }
    let fraction = fraction.trim_end_matches('0');

    let mut numerator: i128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        numerator = numerator
            .checked_mul(10)?
            .checked_add(i128::from(digit - b'0'))?;
    }

    // Decimal exponent and power of 1024 of the suffix. A bare `E` is exa,
    // `e`/`E` followed by a number is an exponent.
    let (exp10, exp1024): (i32, u32) = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        other => {
            let exponent = other.strip_prefix(|c: char| c == 'e' || c == 'E')?;
            (exponent.parse().ok()?, 0)
        }
    };

    let exponent = exp10.checked_sub(i32::try_from(fraction.len()).ok()?)?;
    let power = 10_i128.checked_pow(exponent.unsigned_abs())?;
    let mut denominator = 1;
    if exponent >= 0 {
        numerator = numerator.checked_mul(power)?;
    } else {
        denominator = power;
    }
    numerator = numerator.checked_mul(1024_i128.checked_pow(exp1024)?)?;
    if negative {
        numerator = -numerator;
    }
    Some((numerator, denominator))
}

fn is_one(quantity: Option<&Quantity>) -> bool {
    quantity
        .and_then(quantity_fraction)
        .is_some_and(|(numerator, denominator)| numerator == denominator)
}

/// The first container must request and limit exactly one PodVM.
pub fn assess_pod_request_and_limit(pod: &Pod) -> anyhow::Result<()> {
    let resources = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.resources.as_ref());
    let request = resources
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(PODVM_EXTENDED_RESOURCE));
    let limit = resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get(PODVM_EXTENDED_RESOURCE));

    if !is_one(request) {
        return Err(AssessError::ExtendedResource { kind: "request" }.into());
    }
    if !is_one(limit) {
        return Err(AssessError::ExtendedResource { kind: "limit" }.into());
    }
    Ok(())
}

/// Apply the validators of `command` to its output.
///
/// `Ok(Some(output))` is a verdict from an output validator, `Ok(None)`
/// means the command had nothing to say and the next one should run.
pub fn check_command_output(
    command: &TestCommand,
    pod_name: &str,
    output: ExecOutput,
) -> anyhow::Result<Option<String>> {
    let unexpected = |stream, output: String| AssessError::UnexpectedOutput {
        command: command.command.clone(),
        container: command.container_name.clone(),
        stream,
        output,
    };

    match (output.status, &command.test_error_fn) {
        (Err(e), Some(accepts)) => {
            if !accepts(&e) {
                return Err(unexpected("error", e.to_string()).into());
            }
            debug!("Command {:?} failed as expected: {e}", command.command);
        }
        (Err(e), None) => return Err(e.into()),
        (Ok(()), Some(_)) => {
            return Err(AssessError::ExpectedCommandError(pod_name.to_string()).into());
        }
        (Ok(()), None) => {}
    }

    if let Some(accepts) = &command.test_stderr_fn {
        if !accepts(&output.stderr) {
            return Err(unexpected("stderr", output.stderr).into());
        }
        return Ok(Some(output.stderr));
    }
    if let Some(accepts) = &command.test_stdout_fn {
        if !accepts(&output.stdout) {
            return Err(unexpected("stdout", output.stdout).into());
        }
        return Ok(Some(output.stdout));
    }
    Ok(None)
}

impl TestContext {
    /// Wait for the container to start, then require `expected` in the
    /// pod's log. Returns the log.
    pub async fn compare_pod_log_string(&self, pod: &Pod, expected: &str) -> anyhow::Result<String> {
        sleep(self.config.container_start_grace).await;
        let log = self.string_from_pod(pod, PodObservation::Log).await?;
        if !log.contains(expected) {
            return Err(AssessError::LogMismatch {
                expected: expected.to_string(),
                actual: log,
            }
            .into());
        }
        debug!("Pod log contains {expected:?}");
        Ok(log)
    }

    /// Require `expected` among the pod's warning events, retrying while
    /// the events trickle in. A failed pod is checked only once.
    pub async fn compare_pod_event_warning_descriptions(
        &self,
        pod: &Pod,
        expected: &str,
    ) -> anyhow::Result<()> {
        let interval = self.config.warning_retry_interval;
        let attempts = if PodPhase::of(pod) == PodPhase::Failed {
            1
        } else {
            let attempts =
                self.config.pod_running_timeout.as_millis() / interval.as_millis().max(1);
            u64::try_from(attempts).unwrap_or(u64::MAX).max(1)
        };

        let mut actual = String::new();
        for attempt in 1..=attempts {
            actual = self
                .string_from_pod(pod, PodObservation::EventWarnings)
                .await?;
            if actual.contains(expected) {
                debug!("Pod events contain {expected:?}");
                return Ok(());
            }
            debug!("Attempt {attempt}/{attempts}: pod events don't contain {expected:?} yet");
            if attempt < attempts {
                sleep(interval).await;
            }
        }
        Err(AssessError::EventMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into())
    }

    /// Compare the instance type reported by `instance_type` for the pod
    /// with `expected`.
    pub async fn compare_instance_type(
        &self,
        pod: &Pod,
        expected: &str,
        instance_type: impl AsyncFn(&str) -> anyhow::Result<String>,
    ) -> anyhow::Result<()> {
        let fresh = self.refresh_pod(pod).await?;
        let (_, name) = pod_ref(&fresh, &self.client)?;
        let actual = instance_type(name).await?;
        if actual != expected {
            return Err(AssessError::InstanceTypeMismatch {
                expected: expected.to_string(),
                actual,
            }
            .into());
        }
        info!("Pod {name} runs on instance type {actual}");
        Ok(())
    }

    /// The adaptor must have logged that it chose `image` for the PodVM.
    pub async fn verify_alternate_image(&self, image: &str) -> anyhow::Result<()> {
        let namespace = &self.config.caa_namespace;
        let pods = self.pods_by_label(namespace, "app", CAA_APP_LABEL).await?;
        let caa_pod = pods.items.first().ok_or_else(|| AssessError::NoCaaPod {
            namespace: namespace.clone(),
            node: None,
        })?;
        self.compare_pod_log_string(caa_pod, &format!("Choosing {image}"))
            .await?;
        info!("PodVM was brought up using the alternate PodVM image {image}");
        Ok(())
    }

    /// Run `commands` in order and validate their output. Returns the
    /// output of the first command whose output validator decided, or an
    /// empty string if none did.
    pub async fn assess_pod_test_commands(
        &self,
        pod: &Pod,
        commands: &[TestCommand],
    ) -> anyhow::Result<String> {
        let fresh = self.refresh_pod(pod).await?;
        let (namespace, name) = pod_ref(&fresh, &self.client)?;
        for command in commands {
            sleep(self.config.container_start_grace).await;
            let output = self
                .exec_in_pod(namespace, name, &command.container_name, &command.command)
                .await;
            if let Some(verdict) = check_command_output(command, name, output)? {
                return Ok(verdict);
            }
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecError;
    use crate::mock_client::*;
    use crate::pod::{new_pod, with_extended_resource};
    use http::{Method, Request, StatusCode};
    use kube::client::Body;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn podvm_pod(request: Option<&str>, limit: Option<&str>) -> Pod {
        let mut pod = new_pod("ns", "p", "c", "img", vec![]);
        let resources = pod.spec.as_mut().unwrap().containers[0]
            .resources
            .get_or_insert_with(Default::default);
        if let Some(q) = request {
            resources.requests = Some([(PODVM_EXTENDED_RESOURCE.to_string(), Quantity(q.to_string()))].into());
        }
        if let Some(q) = limit {
            resources.limits = Some([(PODVM_EXTENDED_RESOURCE.to_string(), Quantity(q.to_string()))].into());
        }
        pod
    }

    #[test]
    fn test_request_and_limit_of_one() {
        let pod = new_pod(
            "ns",
            "p",
            "c",
            "img",
            vec![with_extended_resource(PODVM_EXTENDED_RESOURCE, "1")],
        );
        assess_pod_request_and_limit(&pod).unwrap();
        assess_pod_request_and_limit(&podvm_pod(Some("1000m"), Some("1"))).unwrap();
        for one in ["1e0", "1E0", "1e-0", "+1", "1.0", "0.1e1", "1000000000n", "0.0009765625Ki"] {
            assess_pod_request_and_limit(&podvm_pod(Some(one), Some(one)))
                .unwrap_or_else(|e| panic!("{one}: {e}"));
        }
    }

    #[test]
    fn test_request_and_limit_not_one() {
        let err = assess_pod_request_and_limit(&podvm_pod(Some("0"), Some("1"))).unwrap_err();
        assert_eq!(err.to_string(), "request for podvm extended resource is not set to 1");

        let err = assess_pod_request_and_limit(&podvm_pod(Some("1"), Some("2"))).unwrap_err();
        assert_eq!(err.to_string(), "limit for podvm extended resource is not set to 1");

        let err = assess_pod_request_and_limit(&podvm_pod(None, Some("1"))).unwrap_err();
        assert!(err.to_string().starts_with("request"));

        for not_one in ["1e1", "1E", "1.000000001", "999999999n", "1Ki", "-1", "1e", "e0"] {
            let err = assess_pod_request_and_limit(&podvm_pod(Some(not_one), Some("1")))
                .expect_err(not_one);
            assert!(err.to_string().starts_with("request"), "{not_one}");
        }
    }

    #[test]
    fn test_quantity_fraction() {
        let fraction = |q: &str| quantity_fraction(&Quantity(q.to_string()));
        assert_eq!(fraction("2k"), Some((2000, 1)));
        assert_eq!(fraction("1Ki"), Some((1024, 1)));
        assert_eq!(fraction("1500m"), Some((1500, 1000)));
        assert_eq!(fraction("2.50"), Some((25, 10)));
        assert_eq!(fraction("1E"), Some((1_000_000_000_000_000_000, 1)));
        assert_eq!(fraction("5e-3"), Some((5, 1000)));
        assert_eq!(fraction("-1"), Some((-1, 1)));
        assert_eq!(fraction("1x"), None);
        assert_eq!(fraction("1.2.3"), None);
        assert_eq!(fraction("."), None);
        assert_eq!(fraction(""), None);
        assert_eq!(fraction("1e99"), None);
    }

    fn output(stdout: &str, stderr: &str, status: Result<(), ExecError>) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
        }
    }

    fn failed() -> Result<(), ExecError> {
        Err(ExecError::NonZeroExit {
            reason: "NonZeroExitCode".to_string(),
            message: "command terminated with non-zero exit code".to_string(),
        })
    }

    #[test]
    fn test_stdout_validator_decides() {
        let command = TestCommand::new("c", &["cat", "/etc/hostname"])
            .expect_stdout(|out| out.contains("busybox"));
        let verdict = check_command_output(&command, "p", output("busybox\n", "", Ok(())));
        assert_eq!(verdict.unwrap().as_deref(), Some("busybox\n"));

        let err = check_command_output(&command, "p", output("nginx\n", "", Ok(()))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssessError>(),
            Some(AssessError::UnexpectedOutput { stream: "stdout", .. })
        ));
    }

    #[test]
    fn test_stderr_validator_wins_over_stdout() {
        let command = TestCommand::new("c", &["ls", "/nope"])
            .expect_stderr(|err| err.contains("No such file"))
            .expect_stdout(|_| false);
        let verdict =
            check_command_output(&command, "p", output("", "ls: /nope: No such file", Ok(())));
        assert_eq!(verdict.unwrap().as_deref(), Some("ls: /nope: No such file"));
    }

    #[test]
    fn test_error_expectations() {
        let expects_error =
            TestCommand::new("c", &["false"]).expect_error(|e| e.to_string().contains("non-zero"));
        assert_eq!(
            check_command_output(&expects_error, "p", output("", "", failed())).unwrap(),
            None
        );

        let err = check_command_output(&expects_error, "p", output("", "", Ok(()))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "we expected an error from pod p, but it was not found"
        );

        let rejects =
            TestCommand::new("c", &["false"]).expect_error(|e| e.to_string().contains("timeout"));
        let err = check_command_output(&rejects, "p", output("", "", failed())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssessError>(),
            Some(AssessError::UnexpectedOutput { stream: "error", .. })
        ));

        let no_expectation = TestCommand::new("c", &["false"]);
        let err = check_command_output(&no_expectation, "p", output("", "", failed())).unwrap_err();
        assert!(err.downcast_ref::<ExecError>().is_some());
    }

    #[test]
    fn test_command_without_validators_falls_through() {
        let command = TestCommand::new("c", &["true"]);
        assert_eq!(
            check_command_output(&command, "p", output("x", "y", Ok(()))).unwrap(),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_pod_log_string() {
        let clos = |req: Request<Body>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/api/v1/namespaces/ns/pods") => {
                    Ok(list_json("Pod", &[dummy_pod("ns", "busybox")]))
                }
                (&Method::GET, "/api/v1/namespaces/ns/pods/busybox/log") => {
                    Ok("Hello from busybox\n".to_string())
                }
                _ => panic!("unexpected API interaction: {req:?}"),
            }
        };
        let ctx = MockClient::new(clos, "ns".to_string()).into_context();
        let pod = dummy_pod("ns", "busybox");

        let start = Instant::now();
        let log = ctx.compare_pod_log_string(&pod, "Hello").await.unwrap();
        assert_eq!(log, "Hello from busybox");
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        let err = ctx.compare_pod_log_string(&pod, "hello").await.unwrap_err();
        match err.downcast_ref::<AssessError>() {
            Some(AssessError::LogMismatch { actual, .. }) => {
                assert_eq!(actual, "Hello from busybox")
            }
            other => panic!("expected log mismatch, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_pod_log_string_missing_pod() {
        let clos = |req: Request<Body>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/api/v1/namespaces/ns/pods") => Ok(list_json::<Pod>("Pod", &[])),
                _ => panic!("unexpected API interaction: {req:?}"),
            }
        };
        let ctx = MockClient::new(clos, "ns".to_string()).into_context();
        let err = ctx
            .compare_pod_log_string(&dummy_pod("ns", "busybox"), "Hello")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no pod matching ns/busybox was found");
    }

    /// Events appear only after `ready_after` event list calls.
    fn event_server(ready_after: usize) -> (TestContext, Arc<AtomicUsize>) {
        let lists = Arc::new(AtomicUsize::new(0));
        let counter = lists.clone();
        let clos = move |req: Request<Body>| {
            let counter = counter.clone();
            async move {
                match (req.method(), req.uri().path()) {
                    (&Method::GET, "/api/v1/namespaces/ns/pods") => {
                        Ok(list_json("Pod", &[dummy_pod("ns", "busybox")]))
                    }
                    (&Method::GET, "/api/v1/namespaces/ns/events") => {
                        let seen = counter.fetch_add(1, Ordering::SeqCst);
                        let events = if seen >= ready_after {
                            vec![dummy_event("busybox", "Warning", "Failed", "ErrImagePull")]
                        } else {
                            vec![]
                        };
                        Ok(list_json("Event", &events))
                    }
                    _ => panic!("unexpected API interaction: {req:?}"),
                }
            }
        };
        (MockClient::new(clos, "ns".to_string()).into_context(), lists)
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_warnings_retry_until_present() {
        let (ctx, lists) = event_server(2);
        let start = Instant::now();
        ctx.compare_pod_event_warning_descriptions(&dummy_pod("ns", "busybox"), "ErrImagePull")
            .await
            .unwrap();
        assert_eq!(lists.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_warnings_sub_second_interval() {
        let (mut ctx, lists) = event_server(2);
        ctx.config.pod_running_timeout = Duration::from_secs(10);
        ctx.config.warning_retry_interval = Duration::from_millis(500);
        let start = Instant::now();
        ctx.compare_pod_event_warning_descriptions(&dummy_pod("ns", "busybox"), "ErrImagePull")
            .await
            .unwrap();
        assert_eq!(lists.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_warnings_failed_pod_checked_once() {
        let (ctx, lists) = event_server(usize::MAX);
        let pod = with_phase(dummy_pod("ns", "busybox"), "Failed");
        let err = ctx
            .compare_pod_event_warning_descriptions(&pod, "ErrImagePull")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssessError>(),
            Some(AssessError::EventMismatch { .. })
        ));
        assert_eq!(lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_warnings_give_up_after_timeout() {
        let (mut ctx, lists) = event_server(usize::MAX);
        ctx.config.pod_running_timeout = Duration::from_secs(30);
        let start = Instant::now();
        let err = ctx
            .compare_pod_event_warning_descriptions(&dummy_pod("ns", "busybox"), "ErrImagePull")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ErrImagePull"));
        assert_eq!(lists.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    async fn small_instance(name: &str) -> anyhow::Result<String> {
        assert_eq!(name, "busybox");
        Ok("t3.small".to_string())
    }

    async fn cloud_down(_: &str) -> anyhow::Result<String> {
        anyhow::bail!("cloud API down")
    }

    #[tokio::test]
    async fn test_compare_instance_type() {
        let clos = |req: Request<Body>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/api/v1/namespaces/ns/pods") => {
                    Ok(list_json("Pod", &[dummy_pod("ns", "busybox")]))
                }
                _ => panic!("unexpected API interaction: {req:?}"),
            }
        };
        let ctx = MockClient::new(clos, "ns".to_string()).into_context();
        let pod = dummy_pod("ns", "busybox");

        ctx.compare_instance_type(&pod, "t3.small", small_instance)
            .await
            .unwrap();
        let err = ctx
            .compare_instance_type(&pod, "t3.large", small_instance)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pod instance type was t3.small, but we expected t3.large"
        );

        let err = ctx
            .compare_instance_type(&dummy_pod("ns", "ghost"), "t3.small", small_instance)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssessError>(),
            Some(AssessError::PodNotFound { .. })
        ));

        let err = ctx
            .compare_instance_type(&pod, "t3.small", cloud_down)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cloud API down");
    }

    fn caa_server(pods: Vec<Pod>, log: &'static str) -> TestContext {
        let clos = move |req: Request<Body>| {
            let pods = pods.clone();
            async move {
                match (req.method(), req.uri().path()) {
                    (&Method::GET, "/api/v1/namespaces/confidential-containers-system/pods") => {
                        Ok(list_json("Pod", &pods))
                    }
                    (&Method::GET, p) if p.ends_with("/pods/caa-xyz/log") => Ok(log.to_string()),
                    _ => Err(StatusCode::NOT_FOUND),
                }
            }
        };
        MockClient::new(clos, "ns".to_string()).into_context()
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_alternate_image() {
        let caa_pod = with_labels(
            dummy_pod("confidential-containers-system", "caa-xyz"),
            &[("app", "cloud-api-adaptor")],
        );
        let ctx = caa_server(
            vec![caa_pod],
            "2024/05/02 11:46:00 [adaptor/cloud] Choosing podvm-alt-image",
        );
        ctx.verify_alternate_image("podvm-alt-image").await.unwrap();

        let err = ctx.verify_alternate_image("podvm-other").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssessError>(),
            Some(AssessError::LogMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_alternate_image_without_adaptor() {
        let ctx = caa_server(vec![], "");
        let err = ctx.verify_alternate_image("podvm-alt-image").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no cloud-api-adaptor pod found in namespace confidential-containers-system"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_assess_pod_test_commands_missing_pod() {
        let clos = |req: Request<Body>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/api/v1/namespaces/ns/pods") => {
                    Ok(list_json("Pod", &[dummy_pod("ns", "nginx")]))
                }
                _ => panic!("unexpected API interaction: {req:?}"),
            }
        };
        let ctx = MockClient::new(clos, "ns".to_string()).into_context();
        let commands = vec![TestCommand::new("busybox", &["true"])];
        let err = ctx
            .assess_pod_test_commands(&dummy_pod("ns", "busybox"), &commands)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no pod matching ns/busybox was found");
    }
}
