use std::{
    collections::HashMap,
    path::Path,
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, ValueEnum};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use ebs_csi_driver::{
    cloud::CloudApi,
    controller::ControllerService,
    coordination::OperationLocks,
    csi::{
        controller_server::ControllerServer, identity_server::IdentityServer,
        node_server::NodeServer,
    },
    device::{discovery::DeviceResolver, DeviceAllocator, DeviceNaming},
    ec2::{
        metadata::{MetadataClient, NodeMeta},
        Manager,
    },
    identity::IdentityService,
    load_config,
    mount::SystemMounter,
    node::NodeService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    All,
    Controller,
    Node,
}

#[derive(Debug, Parser)]
#[command(name = "ebs-csi-driver", version, about = "CSI driver for Amazon EBS volumes")]
struct Flags {
    /// gRPC listen URI (unix:// or tcp://).
    #[arg(long, default_value = "unix:///var/lib/csi/sockets/pluginproxy/csi.sock")]
    endpoint: String,

    /// Which services to register.
    #[arg(long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Default tags applied to every created volume and snapshot,
    /// as "key=value,key=value".
    #[arg(long = "extra-tags")]
    extra_tags: Option<String>,

    /// Adds the cluster-identifying ownership tag.
    #[arg(long = "k8s-tag-cluster-id")]
    k8s_tag_cluster_id: Option<String>,

    /// Overrides the per-node attachable-volume limit.
    #[arg(long = "volume-attach-limit")]
    volume_attach_limit: Option<i64>,

    /// Turns on AWS SDK request logging; accepts an explicit true/false.
    #[arg(
        long = "aws-sdk-debug-log",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    aws_sdk_debug_log: bool,
}

fn parse_extra_tags(spec: &str) -> Result<HashMap<String, String>, String> {
    let mut tags = HashMap::new();
    for pair in spec.split(',').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                tags.insert(k.to_string(), v.to_string());
            }
            _ => return Err(format!("malformed tag '{}' (expected key=value)", pair)),
        }
    }
    Ok(tags)
}

/// Node identity when IMDS is unreachable (e.g. tests against a local
/// endpoint): fall back to the orchestrator-provided node name.
fn synthetic_node_meta() -> Option<NodeMeta> {
    let node_name = std::env::var("CSI_NODE_NAME").ok()?;
    let zone = std::env::var("AWS_AVAILABILITY_ZONES")
        .ok()
        .and_then(|zs| zs.split(',').next().map(str::to_string))
        .unwrap_or_default();
    Some(NodeMeta {
        instance_id: node_name,
        instance_type: String::new(),
        region: ebs_csi_driver::ec2::metadata::region_from_az(&zone),
        availability_zone: zone,
        max_attachable_volumes: 27,
        max_network_interfaces: 3,
        attachment_count: 0,
    })
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    // unknown flags are configuration errors
    let flags = match Flags::try_parse() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let extra_tags = match flags.extra_tags.as_deref().map(parse_extra_tags) {
        Some(Ok(tags)) => tags,
        Some(Err(e)) => {
            log::error!("invalid --extra-tags: {}", e);
            exit(1);
        }
        None => HashMap::new(),
    };

    if flags.aws_sdk_debug_log {
        log::info!("AWS SDK debug logging enabled");
        std::env::set_var("RUST_LOG", "aws_config=debug,aws_sdk_ec2=debug,info");
    }

    let shared_config = load_config(None, None).await;
    if shared_config.region().is_none() {
        log::error!("no AWS region could be resolved");
        exit(1);
    }
    log::info!("using region {:?}", shared_config.region());

    let manager = Manager::new(&shared_config).with_describe_batching();
    let cloud: Arc<dyn CloudApi> = Arc::new(manager);
    let locks = OperationLocks::new();
    let ready = Arc::new(AtomicBool::new(true));

    let run_controller = flags.mode != Mode::Node;
    let run_node = flags.mode != Mode::Controller;

    let metadata_client = MetadataClient::default();
    let node_meta = if run_node {
        match NodeMeta::load(&metadata_client).await {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("instance metadata unavailable ({}), falling back", e.message());
                synthetic_node_meta()
            }
        }
    } else {
        None
    };

    let default_zone = node_meta
        .as_ref()
        .map(|m| m.availability_zone.clone())
        .filter(|z| !z.is_empty());

    let controller = run_controller.then(|| {
        log::info!("registering the controller service");
        ControllerService::new(
            Arc::clone(&cloud),
            Arc::clone(&locks),
            Arc::new(DeviceAllocator::new(DeviceNaming::Linux)),
            extra_tags.clone(),
            flags.k8s_tag_cluster_id.clone(),
            default_zone.clone(),
        )
    });

    let node = if run_node {
        let meta = match node_meta {
            Some(m) => m,
            None => {
                log::error!("node mode needs instance metadata or CSI_NODE_NAME");
                exit(1);
            }
        };
        log::info!("registering the node service");
        Some(NodeService::new(
            Arc::new(SystemMounter::new()),
            DeviceResolver::default(),
            Arc::clone(&locks),
            meta,
            Some(Arc::clone(&cloud)),
            flags.volume_attach_limit,
        ))
    } else {
        None
    };

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(Arc::clone(&ready))))
        .add_optional_service(controller.map(ControllerServer::new))
        .add_optional_service(node.map(NodeServer::new));

    // flip the probe to not-serving before the listener closes so sidecars
    // observe departure
    let shutdown_ready = Arc::clone(&ready);
    let shutdown = async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        log::info!("shutting down");
        shutdown_ready.store(false, Ordering::SeqCst);
    };

    let serve = async move {
        if let Some(path) = flags.endpoint.strip_prefix("unix://") {
            // a stale socket from a previous run refuses the bind
            if Path::new(path).exists() {
                let _ = std::fs::remove_file(path);
            }
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            log::info!("listening on unix socket '{}'", path);
            let listener = match UnixListener::bind(path) {
                Ok(l) => l,
                Err(e) => {
                    log::error!("failed to bind '{}': {}", path, e);
                    exit(2);
                }
            };
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await
        } else {
            let addr = flags.endpoint.trim_start_matches("tcp://");
            let addr = match addr.parse() {
                Ok(a) => a,
                Err(e) => {
                    log::error!("invalid endpoint '{}': {}", flags.endpoint, e);
                    exit(1);
                }
            };
            log::info!("listening on '{}'", addr);
            router.serve_with_shutdown(addr, shutdown).await
        }
    };

    if let Err(e) = serve.await {
        log::error!("server failed: {}", e);
        exit(2);
    }
}
