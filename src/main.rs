use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use kube_fledged::{Config, Controller};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pre-caches container images on cluster nodes.
#[derive(Parser, Debug)]
#[command(name = "kubefledged-controller", version, about)]
struct Flags {
    /// Namespace the controller runs in.
    #[arg(long, env = "KUBEFLEDGED_NAMESPACE", default_value = "kube-fledged")]
    namespace: String,
    /// Number of workers processing image caches concurrently.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    threadiness: u16,
    /// How often image caches are refreshed (0 disables the refresh loop).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "15m")]
    image_cache_refresh_frequency: Duration,
    /// Maximum duration allowed for a single image pull.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    image_pull_deadline_duration: Duration,
    /// Image of the CRI client used by image delete jobs.
    #[arg(long, default_value = "senthilrch/kubefledged-cri-client:v0.10.0")]
    cri_client_image: String,
    /// Image of busybox, used by image pull jobs.
    #[arg(long, default_value = "senthilrch/busybox:1.35.0")]
    busybox_image: String,
    /// Image pull policy of the image pull jobs.
    #[arg(long, default_value = "IfNotPresent")]
    image_pull_policy: String,
    /// Service account of the job pods.
    #[arg(long, default_value = "")]
    service_account_name: String,
    /// Run image delete jobs with host networking.
    #[arg(long)]
    image_delete_job_host_network: bool,
    /// Priority class of the job pods.
    #[arg(long, default_value = "")]
    job_priority_class_name: String,
    /// Delete jobs once their result has been recorded.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    can_delete_job: bool,
    /// Host path of the CRI socket mounted into image delete jobs.
    #[arg(long, default_value = "/run/containerd/containerd.sock")]
    cri_socket_path: String,
    /// Settle delay between a node turning ready and the refresh fan-out.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    node_settle_delay: Duration,
}

impl From<Flags> for Config {
    fn from(flags: Flags) -> Self {
        Config {
            namespace: flags.namespace,
            threadiness: flags.threadiness as usize,
            image_cache_refresh_frequency: flags.image_cache_refresh_frequency,
            image_pull_deadline_duration: flags.image_pull_deadline_duration,
            cri_client_image: flags.cri_client_image,
            busybox_image: flags.busybox_image,
            image_pull_policy: flags.image_pull_policy,
            service_account_name: flags.service_account_name,
            image_delete_job_host_network: flags.image_delete_job_host_network,
            job_priority_class_name: flags.job_priority_class_name,
            can_delete_job: flags.can_delete_job,
            cri_socket_path: flags.cri_socket_path,
            node_settle_delay: flags.node_settle_delay,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let flags = Flags::parse();
    let client = Client::try_default()
        .await
        .context("failed to build cluster client")?;
    let controller = Controller::new(client, Config::from(flags));

    controller
        .preflight_checks()
        .await
        .context("preflight checks failed")?;
    info!("preflight checks completed");

    let token = CancellationToken::new();
    let mut run = tokio::spawn(controller.run(token.clone()));

    tokio::select! {
        result = &mut run => {
            token.cancel();
            result.context("controller task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            token.cancel();
            run.await.context("controller task panicked")??;
        }
    }
    Ok(())
}
