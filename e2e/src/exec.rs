// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use kube::api::AttachParams;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{ExecError, TestContext};

/// Captured output of a command run in a container.
///
/// Output is kept even when the command fails, since validators may want
/// to look at it.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: Result<(), ExecError>,
}

async fn read_all(
    reader: Option<impl AsyncRead + Unpin>,
    stream: &'static str,
) -> Result<String, ExecError> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|source| ExecError::Stream { stream, source })?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl TestContext {
    /// Run `command` in `container` of the pod, capturing stdout and stderr.
    pub async fn exec_in_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        command: &[String],
    ) -> ExecOutput {
        let ap = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = match self
            .pods(namespace)
            .exec(pod_name, command.to_vec(), &ap)
            .await
        {
            Ok(attached) => attached,
            Err(source) => {
                return ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    status: Err(ExecError::Api {
                        pod: format!("{namespace}/{pod_name}"),
                        container: container.to_string(),
                        source,
                    }),
                };
            }
        };

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(read_all(stdout, "stdout"), read_all(stderr, "stderr"));
        let exit = match status {
            Some(status) => status.await,
            None => None,
        };

        let mut result = match exit {
            Some(s) if s.status.as_deref() != Some("Success") => Err(ExecError::NonZeroExit {
                reason: s.reason.unwrap_or_default(),
                message: s.message.unwrap_or_default(),
            }),
            _ => Ok(()),
        };
        if let Err(e) = attached.join().await {
            keep_first_error(&mut result, ExecError::Session(e.to_string()));
        }

        let stdout = stdout.unwrap_or_else(|e| {
            keep_first_error(&mut result, e);
            String::new()
        });
        let stderr = stderr.unwrap_or_else(|e| {
            keep_first_error(&mut result, e);
            String::new()
        });

        debug!(
            "Executed {command:?} in {namespace}/{pod_name}[{container}]: {}",
            if result.is_ok() { "ok" } else { "failed" }
        );
        ExecOutput {
            stdout,
            stderr,
            status: result,
        }
    }
}

fn keep_first_error(result: &mut Result<(), ExecError>, err: ExecError) {
    if result.is_ok() {
        *result = Err(err);
    }
}
