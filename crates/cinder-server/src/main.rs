//! cinder-server: one shard of the distributed key-value store.
//!
//! Runs as a master (accepting writes and fanning them out to replicas)
//! or as a replica (applying inbound replication commands). State is
//! persisted through an append-only log and periodic snapshots in the
//! data directory; on startup the snapshot is loaded and the log
//! replayed on top of it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cinder_core::{ReplicationSender, Snapshotter, Storage};
use cinder_persistence::aof::AofLog;
use cinder_persistence::snapshot::RdbSnapshot;
use cinder_proto::key_value_store_server::KeyValueStoreServer;
use tracing::{error, info, warn};

use cinder_server::replication::{NodeRole, ReplicationManager};
use cinder_server::service::KvService;

/// Shard server for the cinder distributed key-value store.
#[derive(Parser, Debug)]
#[command(name = "cinder-server", version, about)]
struct Args {
    /// Run as a master node (the default).
    #[arg(long, conflicts_with = "replica")]
    master: bool,

    /// Run as a read-capable replica.
    #[arg(long)]
    replica: bool,

    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:50051")]
    address: String,

    /// Address of this replica's master (required with --replica).
    #[arg(long, required_if_eq("replica", "true"))]
    master_address: Option<String>,

    /// Comma-separated replica addresses to fan mutations out to
    /// (master only).
    #[arg(long, value_delimiter = ',')]
    replicas: Vec<String>,

    /// Directory holding kvstore.rdb and kvstore.aof.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Seconds between background snapshots.
    #[arg(long, default_value_t = 60)]
    snapshot_interval_secs: u64,
}

impl Args {
    fn role(&self) -> NodeRole {
        if self.replica {
            NodeRole::Replica
        } else {
            NodeRole::Master
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = args
        .address
        .parse()
        .map_err(|e| format!("invalid listen address {:?}: {e}", args.address))?;
    let role = args.role();

    if role == NodeRole::Replica && !args.replicas.is_empty() {
        return Err("--replicas is only valid on a master node".into());
    }
    if args.snapshot_interval_secs == 0 {
        return Err("--snapshot-interval-secs must be positive".into());
    }

    info!(?role, address = %addr, "starting cinder-server");

    let mut builder = Storage::builder();

    let aof_path = args.data_dir.join("kvstore.aof");
    match AofLog::open(&aof_path) {
        Ok(log) => builder = builder.journal(Box::new(log)),
        Err(e) => {
            // keep serving from memory; durability is gone until restart
            error!(path = %aof_path.display(), "failed to open append-only log, continuing in-memory: {e}");
        }
    }
    builder = builder.snapshots(Box::new(RdbSnapshot::new(args.data_dir.join("kvstore.rdb"))));

    let manager = Arc::new(ReplicationManager::new(role));
    let mut fanout = None;
    match role {
        NodeRole::Master => {
            let (sender, rx) = ReplicationSender::channel();
            builder = builder.replicator(Box::new(sender));
            for replica in &args.replicas {
                if !manager.add_replica(replica) {
                    return Err(format!("invalid replica address: {replica:?}").into());
                }
            }
            fanout = Some(Arc::clone(&manager).spawn_fanout(rx));
        }
        NodeRole::Replica => {
            if let Some(master) = &args.master_address {
                manager.set_master_address(master);
            }
        }
    }

    let storage = Arc::new(builder.recover());
    info!(keys = storage.len(), "storage ready");

    let mut snapshotter = Snapshotter::start(
        Arc::clone(&storage),
        Duration::from_secs(args.snapshot_interval_secs),
    );

    info!(%addr, "server listening");
    tonic::transport::Server::builder()
        .add_service(KeyValueStoreServer::new(KvService::new(storage)))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("shutting down");
    snapshotter.stop();
    if let Some(handle) = fanout {
        handle.abort();
    }
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
