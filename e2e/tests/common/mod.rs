// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use caa_e2e::{CloudAssert, TestContext, init_test_logging, test_namespace_name};
use log::info;
use std::time::Duration;

/// A test namespace on the live cluster.
pub struct ClusterTest {
    ctx: TestContext,
    namespace: String,
}

impl ClusterTest {
    pub async fn new() -> anyhow::Result<Self> {
        init_test_logging();
        let ctx = TestContext::try_default().await?;
        let namespace = test_namespace_name();
        ctx.create_and_wait_for_namespace(&namespace).await?;
        info!("Execute tests in the namespace: {namespace}");
        Ok(Self { ctx, namespace })
    }

    pub fn ctx(&self) -> &TestContext {
        &self.ctx
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn cleanup(&self) -> anyhow::Result<()> {
        self.ctx.delete_and_wait_for_namespace(&self.namespace).await
    }
}

#[macro_export]
macro_rules! setup {
    () => {{ $crate::common::ClusterTest::new() }};
}

/// Provider without instance type introspection.
pub struct NoCloud;

impl CloudAssert for NoCloud {
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(90)
    }

    async fn get_instance_type(&self, pod_name: &str) -> anyhow::Result<String> {
        anyhow::bail!("instance type of {pod_name} is not known to this provider")
    }
}
