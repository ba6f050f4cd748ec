//! Daemon bootstrap
//!
//! Wires the record store (local layout or remote registry, behind the
//! cache), the peer host, the label index, the gossip receive loop, the
//! publication pipeline, and the gRPC surface, then serves until shutdown.

use crate::config::Config;
use crate::grpc::{RoutingService, StoreService};
use crate::proto;
use crate::publication::{PublicationConfig, PublicationService, PublicationStore};
use agent_dir_routing::{index_writer, spawn_receive_loop, LabelIndex, Network, NetworkConfig, Routing};
use agent_dir_store::{
    CachedStore, LocalLayout, OciStore, RecordStore, RegistryCredentials, RemoteRegistry,
};
use anyhow::Context;
use libp2p::identity;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Load the persisted peer identity, creating one on first start so the peer
/// id is stable across restarts.
fn load_or_create_keypair(path: &Path) -> anyhow::Result<identity::Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path).context("reading peer key")?;
        identity::Keypair::from_protobuf_encoding(&bytes).context("decoding peer key")
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding peer key")?;
        std::fs::write(path, bytes).context("writing peer key")?;
        Ok(keypair)
    }
}

fn open_record_store(config: &Config, db: &sled::Db) -> anyhow::Result<Arc<dyn RecordStore>> {
    let cache_tree = db.open_tree("store-cache")?;
    match &config.registry_url {
        Some(url) => {
            let credentials = config
                .registry_username
                .clone()
                .zip(config.registry_password.clone())
                .map(|(username, password)| RegistryCredentials { username, password });
            info!("using remote registry {url}");
            Ok(Arc::new(CachedStore::new(
                OciStore::new(RemoteRegistry::new(
                    url,
                    &config.registry_repository,
                    credentials,
                )),
                cache_tree,
            )))
        }
        None => {
            let layout_dir = config.data_dir.join("registry");
            info!("using local layout at {}", layout_dir.display());
            Ok(Arc::new(CachedStore::new(
                OciStore::new(LocalLayout::open(&layout_dir)?),
                cache_tree,
            )))
        }
    }
}

/// Run the daemon until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&config.data_dir).context("creating data directory")?;

    let db = sled::open(config.data_dir.join("datastore")).context("opening datastore")?;
    let record_store = open_record_store(&config, &db)?;
    let keypair = load_or_create_keypair(&config.data_dir.join("peer.key"))?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let bootstrap = config
        .bootstrap
        .iter()
        .map(|a| a.parse())
        .collect::<Result<Vec<_>, _>>()
        .context("parsing bootstrap addresses")?;
    let (network, announce_rx, net_handle) = Network::spawn(
        NetworkConfig {
            keypair,
            listen_addr: config.p2p_listen.parse().context("parsing p2p listen address")?,
            bootstrap,
        },
        shutdown_tx.subscribe(),
    )?;
    info!("peer id {}", network.local_peer_id());

    let index = Arc::new(LabelIndex::new(db.open_tree("labels")?));
    let routing = Arc::new(Routing::new(index.clone(), network));
    let receive_handle = spawn_receive_loop(
        announce_rx,
        shutdown_tx.subscribe(),
        index_writer(index.clone()),
    );

    let publications = Arc::new(PublicationService::new(
        PublicationStore::new(db.open_tree("publications")?),
        record_store.clone(),
        routing.clone(),
        PublicationConfig {
            scheduler_interval: config.scheduler_interval(),
            worker_count: config.worker_count,
            worker_timeout: config.worker_timeout(),
            queue_capacity: config.queue_capacity,
        },
        shutdown_tx.clone(),
    ));
    publications.start();

    info!("serving gRPC on {}", config.listen);
    tonic::transport::Server::builder()
        .add_service(proto::store_server::StoreServer::new(StoreService::new(
            record_store,
        )))
        .add_service(proto::routing_server::RoutingServer::new(
            RoutingService::new(routing, publications.clone()),
        ))
        .serve_with_shutdown(config.listen, async {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        })
        .await
        .context("grpc server")?;

    publications.stop().await;
    let _ = shutdown_tx.send(());
    let _ = receive_handle.await;
    let _ = net_handle.await;
    db.flush().context("flushing datastore")?;
    Ok(())
}
