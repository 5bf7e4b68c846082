// SPDX-FileCopyrightText: The cloud-api-adaptor e2e authors
//
// SPDX-License-Identifier: MIT

use anyhow::Result;
use caa_e2e::{AssessError, E2eConfig, TestContext};
use clap::{Parser, Subcommand};
use env_logger::Env;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::ObjectMeta;
use log::info;
use std::time::Duration;

/// Run single peer-pods assessment steps against the current cluster.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// How long a pod may take to start [default: 900s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pod_running_timeout: Option<Duration>,

    /// How long a new namespace may take to become usable [default: 120s]
    #[arg(long, value_parser = humantime::parse_duration)]
    namespace_timeout: Option<Duration>,

    /// How long a pod may take to go away [default: 60s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pod_deletion_timeout: Option<Duration>,

    /// Namespace the cloud-api-adaptor runs in [default: confidential-containers-system]
    #[arg(long)]
    caa_namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a namespace and wait until pods can be created in it
    CreateNamespace { name: String },
    /// Delete a namespace and wait until it is gone
    DeleteNamespace { name: String },
    /// Add an image pull secret to the default service account
    AddPullSecret {
        #[arg(long, default_value = "default")]
        namespace: String,
        secret: String,
    },
    /// Check the adaptor booted a PodVM from an alternate image
    VerifyAlternateImage { image: String },
    /// Check a container was pulled in the guest by the nydus snapshotter
    SnapshotterPull {
        #[arg(long)]
        node: String,
        container_id: String,
    },
    /// Report how long the adaptor took to pull the image of a pod
    ImagePullTime {
        #[arg(long, default_value = "default")]
        namespace: String,
        pod: String,
    },
    /// Print the node a pod is scheduled on
    NodeName {
        #[arg(long, default_value = "default")]
        namespace: String,
        pod: String,
    },
}

impl Args {
    /// `CAA_E2E_*` settings, overridden by flags.
    fn config(&self) -> Result<E2eConfig> {
        let mut config = E2eConfig::from_env()?;
        if let Some(d) = self.pod_running_timeout {
            config.pod_running_timeout = d;
        }
        if let Some(d) = self.namespace_timeout {
            config.namespace_available_timeout = d;
        }
        if let Some(d) = self.pod_deletion_timeout {
            config.pod_deletion_timeout = d;
        }
        if let Some(ns) = &self.caa_namespace {
            config.caa_namespace = ns.clone();
        }
        Ok(config)
    }
}

fn pod_named(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let client = Client::try_default().await?;
    let ctx = TestContext::new(client, args.config()?);

    match &args.command {
        Command::CreateNamespace { name } => ctx.create_and_wait_for_namespace(name).await?,
        Command::DeleteNamespace { name } => ctx.delete_and_wait_for_namespace(name).await?,
        Command::AddPullSecret { namespace, secret } => {
            ctx.add_image_pull_secret_to_default_service_account(namespace, secret)
                .await?
        }
        Command::VerifyAlternateImage { image } => ctx.verify_alternate_image(image).await?,
        Command::SnapshotterPull { node, container_id } => {
            if !ctx.is_pulled_with_nydus_snapshotter(node, container_id).await? {
                return Err(AssessError::NoPullEntry {
                    container_id: container_id.clone(),
                }
                .into());
            }
            info!("Container {container_id} on {node} was pulled with the nydus snapshotter");
        }
        Command::ImagePullTime { namespace, pod } => {
            let pulling = ctx.image_pull_time(&pod_named(namespace, pod)).await?;
            println!("{pulling}");
        }
        Command::NodeName { namespace, pod } => {
            let node = ctx.node_name_from_pod(&pod_named(namespace, pod)).await?;
            println!("{node}");
        }
    }
    Ok(())
}
