//! bsu-csi-driver: a Container Storage Interface driver for cloud block
//! storage (design spec §6).

mod controller_service;
mod error_map;
mod identity;
mod node_service;
mod params;
mod topology;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bsu_attach::AttachmentTracker;
use bsu_backoff::BackoffPolicy;
use bsu_cloud::HttpCloudAdapter;
use bsu_common::config::{parse_duration_flexible, BackoffConfig, CloudConfig, DriverConfig};
use bsu_coordinator::Coordinator;
use bsu_csi_proto::csi::controller_server::ControllerServer;
use bsu_csi_proto::csi::identity_server::IdentityServer;
use bsu_csi_proto::csi::node_server::NodeServer;
use bsu_node_block::{max_volumes_per_node, NodeBlockLayer, OsCrypto, OsMounter};

use crate::controller_service::ControllerService;
use crate::identity::IdentityService;
use crate::node_service::NodeService;

const DEFAULT_VOLUME_GIB: u64 = 10;
const DEFAULT_FSTYPE: &str = "ext4";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "bsu-csi-driver", about = "Container Storage Interface driver for cloud block storage")]
struct Cli {
    #[command(subcommand)]
    command: SubCommand,
}

#[derive(Debug, ClapArgs)]
struct CommonArgs {
    /// CSI gRPC listen endpoint, e.g. `unix:///csi/csi.sock`.
    #[arg(long, default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Log verbosity, klog-style: 0 = warn, 1 = info, 2-3 = debug, 4+ = trace.
    #[arg(long, default_value_t = 1)]
    v: u8,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Run the Controller and Identity services.
    Controller {
        #[command(flatten)]
        common: CommonArgs,

        /// Extra tags applied to every volume this driver creates.
        #[arg(long, value_delimiter = ',')]
        extra_volume_tags: Vec<String>,

        /// Extra tags applied to every snapshot this driver creates.
        #[arg(long, value_delimiter = ',')]
        extra_snapshot_tags: Vec<String>,
    },
    /// Run the Node and Identity services.
    Node {
        #[command(flatten)]
        common: CommonArgs,

        /// Extra arguments forwarded to `cryptsetup luksOpen` (repeatable).
        #[arg(long)]
        luks_open_flags: Vec<String>,
    },
}

fn init_tracing(v: u8) {
    let level = match v {
        0 => "warn",
        1 => "info",
        2..=3 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn parse_tags(raw: &[String]) -> bsu_common::types::Tags {
    raw.iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn load_driver_config() -> Result<DriverConfig> {
    let cloud = CloudConfig {
        access_key: std::env::var("BSU_ACCESS_KEY").context("BSU_ACCESS_KEY is required")?,
        secret_key: std::env::var("BSU_SECRET_KEY").context("BSU_SECRET_KEY is required")?,
        region: std::env::var("BSU_REGION").context("BSU_REGION is required")?,
        endpoint: env_opt("BSU_ENDPOINT"),
        https_proxy: env_opt("HTTPS_PROXY"),
        no_proxy: env_opt("NO_PROXY"),
        ca_bundle_path: env_opt("BSU_CA_BUNDLE"),
    };

    let default_backoff = BackoffConfig::default();
    let backoff = BackoffConfig {
        initial: env_opt("BACKOFF_DURATION")
            .and_then(|raw| parse_duration_flexible(&raw))
            .unwrap_or(default_backoff.initial),
        factor: env_opt("BACKOFF_FACTOR")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default_backoff.factor),
        steps: env_opt("BACKOFF_STEPS")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default_backoff.steps),
    };

    let readiness_interval = env_opt("READINESS_INTERVAL")
        .and_then(|raw| parse_duration_flexible(&raw))
        .unwrap_or(Duration::from_secs(30));

    let max_volumes_per_node = env_opt("MAX_BSU_VOLUMES").and_then(|raw| raw.parse().ok());

    Ok(DriverConfig {
        cloud,
        backoff,
        readiness_interval,
        max_volumes_per_node,
    })
}

fn node_id() -> String {
    env_opt("NODE_ID")
        .or_else(|| {
            nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
        })
        .unwrap_or_else(|| "unknown-node".to_string())
}

async fn bind_unix_socket(endpoint: &str) -> Result<UnixListenerStream> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    let _ = std::fs::remove_file(path);
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
    }
    let listener = UnixListener::bind(path).with_context(|| format!("binding {path}"))?;
    Ok(UnixListenerStream::new(listener))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        SubCommand::Controller {
            common,
            extra_volume_tags,
            extra_snapshot_tags,
        } => {
            init_tracing(common.v);
            let config = load_driver_config()?;
            info!(endpoint = %common.endpoint, "starting bsu-csi-driver controller");

            let cloud = Arc::new(HttpCloudAdapter::new(&config.cloud)?);
            let tracker = Arc::new(AttachmentTracker::new());
            let backoff = BackoffPolicy::from(config.backoff);
            let coordinator = Coordinator::new(cloud, tracker, backoff, DEFAULT_VOLUME_GIB);

            let controller = ControllerService::new(
                coordinator,
                parse_tags(&extra_volume_tags),
                parse_tags(&extra_snapshot_tags),
            );

            let incoming = bind_unix_socket(&common.endpoint).await?;
            Server::builder()
                .add_service(IdentityServer::new(IdentityService))
                .add_service(ControllerServer::new(controller))
                .serve_with_incoming(incoming)
                .await
                .context("controller gRPC server error")?;
        }
        SubCommand::Node { common, luks_open_flags } => {
            init_tracing(common.v);
            let config = load_driver_config()?;
            info!(endpoint = %common.endpoint, "starting bsu-csi-driver node");

            let mounter = Arc::new(OsMounter::new(COMMAND_TIMEOUT));
            let crypto = Arc::new(OsCrypto::new(COMMAND_TIMEOUT));
            let backoff = BackoffPolicy::from(config.backoff);
            let layer = Arc::new(NodeBlockLayer::new(mounter, crypto, backoff, DEFAULT_FSTYPE));

            let max_volumes = max_volumes_per_node(config.max_volumes_per_node);
            let node_id = node_id();
            let sub_region = env_opt("NODE_ZONE").unwrap_or_default();

            let node = NodeService::new(layer, node_id, sub_region, max_volumes, luks_open_flags);

            let incoming = bind_unix_socket(&common.endpoint).await?;
            Server::builder()
                .add_service(IdentityServer::new(IdentityService))
                .add_service(NodeServer::new(node))
                .serve_with_incoming(incoming)
                .await
                .context("node gRPC server error")?;
        }
    }

    Ok(())
}
