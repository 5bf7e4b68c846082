// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::AssessError;

/// Outcome of a single poll attempt.
#[derive(Debug)]
pub enum Check<T> {
    Done(T),
    /// Not there yet; the string describes the last observed state.
    Pending(String),
}

/// Fixed-interval poller with a wall-clock deadline.
///
/// Runs on tokio's clock, so tests can use a paused runtime.
#[derive(Clone, Debug)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
    error_message: String,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(5),
            error_message: "waiting for condition".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Run `check` until it reports `Done`, fails, or the timeout elapses.
    ///
    /// An `Err` from `check` aborts the poll immediately. The check always
    /// runs at least once, even with a zero timeout.
    pub async fn poll_async<T, F, Fut>(&self, mut check: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Check<T>>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        loop {
            let last_state = match check().await? {
                Check::Done(value) => return Ok(value),
                Check::Pending(state) => state,
            };
            debug!(
                "{}: {last_state} after {:.0}s",
                self.error_message,
                start.elapsed().as_secs_f64()
            );

            let now = Instant::now();
            if now >= deadline {
                return Err(AssessError::Timeout {
                    what: self.error_message.clone(),
                    elapsed: now - start,
                    last_state,
                }
                .into());
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}
