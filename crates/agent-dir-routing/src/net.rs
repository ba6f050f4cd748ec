//! libp2p peer host
//!
//! One swarm task owns the Kademlia DHT, the gossipsub mesh, and identify.
//! Callers drive it through a bounded command channel; validated label
//! announcements flow out through an event channel. A pinned-peer set
//! (bootstrap peers and announcement sources) is re-dialed when connections
//! drop so the mesh does not shed its high-priority peers.

use crate::gossip::{LabelAnnouncement, LABEL_TOPIC, MAX_ANNOUNCEMENT_BYTES};
use agent_dir_core::Error;
use agent_dir_core::Result as DirResult;
use futures::StreamExt;
use libp2p::kad::store::MemoryStore;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::{gossipsub, identify, identity, kad, noise, tcp, yamux, Multiaddr, PeerId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IDENTIFY_PROTOCOL: &str = "/agent-dir/1.0.0";
const COMMAND_CHANNEL_CAPACITY: usize = 100;
const ANNOUNCEMENT_CHANNEL_CAPACITY: usize = 100;

#[derive(NetworkBehaviour)]
pub struct DirBehaviour {
    pub kad: kad::Behaviour<MemoryStore>,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
}

/// Host configuration.
pub struct NetworkConfig {
    pub keypair: identity::Keypair,
    pub listen_addr: Multiaddr,
    pub bootstrap: Vec<Multiaddr>,
}

enum NetCommand {
    Provide {
        cid: String,
        reply: oneshot::Sender<DirResult<()>>,
    },
    Unprovide {
        cid: String,
    },
    FindProviders {
        cid: String,
        reply: oneshot::Sender<DirResult<Vec<String>>>,
    },
    PublishAnnouncement {
        bytes: Vec<u8>,
        reply: oneshot::Sender<DirResult<()>>,
    },
}

enum Pending {
    Provide(oneshot::Sender<DirResult<()>>),
    Providers {
        reply: oneshot::Sender<DirResult<Vec<String>>>,
        found: HashSet<PeerId>,
    },
}

/// Handle to the running peer host. Cloneable and safe to share across
/// workers; every method suspends on the command channel.
#[derive(Clone)]
pub struct Network {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<NetCommand>,
}

impl Network {
    /// Build the swarm and spawn its task. Returns the handle, the stream of
    /// validated remote announcements, and the task handle.
    pub fn spawn(
        config: NetworkConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> DirResult<(Self, mpsc::Receiver<LabelAnnouncement>, JoinHandle<()>)> {
        let local_peer_id = config.keypair.public().to_peer_id();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(config.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(Error::internal)?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                let kad = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub::ConfigBuilder::default()
                        .max_transmit_size(MAX_ANNOUNCEMENT_BYTES)
                        .validation_mode(gossipsub::ValidationMode::Strict)
                        .build()?,
                )?;
                let identify = identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                ));
                Ok(DirBehaviour {
                    kad,
                    gossipsub,
                    identify,
                })
            })
            .map_err(Error::internal)?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        swarm.behaviour_mut().kad.set_mode(Some(kad::Mode::Server));

        let topic = gossipsub::IdentTopic::new(LABEL_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(Error::internal)?;

        swarm
            .listen_on(config.listen_addr.clone())
            .map_err(Error::internal)?;

        let mut pinned = HashSet::new();
        for addr in &config.bootstrap {
            if let Some(peer_id) = peer_id_of(addr) {
                swarm
                    .behaviour_mut()
                    .kad
                    .add_address(&peer_id, strip_peer(addr));
                pinned.insert(peer_id);
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("dialing bootstrap peer {addr}: {e}");
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (announce_tx, announce_rx) = mpsc::channel(ANNOUNCEMENT_CHANNEL_CAPACITY);

        let host = HostLoop {
            swarm,
            topic,
            local_peer_id,
            announce_tx,
            pending: HashMap::new(),
            pinned,
        };
        let handle = tokio::spawn(host.run(cmd_rx, shutdown_rx));

        Ok((
            Self {
                local_peer_id,
                cmd_tx,
            },
            announce_rx,
            handle,
        ))
    }

    pub fn local_peer_id(&self) -> String {
        self.local_peer_id.to_string()
    }

    async fn send(&self, command: NetCommand) -> DirResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::internal("peer host loop stopped"))
    }

    /// Announce this node as a provider of `cid` on the DHT.
    pub async fn provide(&self, cid: &str) -> DirResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(NetCommand::Provide {
            cid: cid.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop announcing `cid`.
    pub async fn unprovide(&self, cid: &str) -> DirResult<()> {
        self.send(NetCommand::Unprovide {
            cid: cid.to_string(),
        })
        .await
    }

    /// Resolve the peers currently providing `cid`.
    pub async fn find_providers(&self, cid: &str) -> DirResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(NetCommand::FindProviders {
            cid: cid.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Publish a label announcement. Propagation is asynchronous; this only
    /// hands the payload to the mesh.
    pub async fn publish_announcement(&self, announcement: &LabelAnnouncement) -> DirResult<()> {
        let bytes = announcement.encode()?;
        let (reply, rx) = oneshot::channel();
        self.send(NetCommand::PublishAnnouncement { bytes, reply })
            .await?;
        rx.await.map_err(|_| Error::Cancelled)?
    }
}

struct HostLoop {
    swarm: Swarm<DirBehaviour>,
    topic: gossipsub::IdentTopic,
    local_peer_id: PeerId,
    announce_tx: mpsc::Sender<LabelAnnouncement>,
    pending: HashMap<kad::QueryId, Pending>,
    pinned: HashSet<PeerId>,
}

impl HostLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<NetCommand>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event).await,
                _ = shutdown_rx.recv() => {
                    info!("peer host stopped");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: NetCommand) {
        match command {
            NetCommand::Provide { cid, reply } => {
                let key = kad::RecordKey::new(&cid.as_bytes());
                match self.swarm.behaviour_mut().kad.start_providing(key) {
                    Ok(query_id) => {
                        self.pending.insert(query_id, Pending::Provide(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::internal(format!("provide {cid}: {e}"))));
                    }
                }
            }
            NetCommand::Unprovide { cid } => {
                let key = kad::RecordKey::new(&cid.as_bytes());
                self.swarm.behaviour_mut().kad.stop_providing(&key);
            }
            NetCommand::FindProviders { cid, reply } => {
                let key = kad::RecordKey::new(&cid.as_bytes());
                let query_id = self.swarm.behaviour_mut().kad.get_providers(key);
                self.pending.insert(
                    query_id,
                    Pending::Providers {
                        reply,
                        found: HashSet::new(),
                    },
                );
            }
            NetCommand::PublishAnnouncement { bytes, reply } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), bytes)
                {
                    Ok(_) => Ok(()),
                    // Re-announcing an identical payload is fine.
                    Err(gossipsub::PublishError::Duplicate) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        warn!("no gossip peers yet, announcement not propagated");
                        Ok(())
                    }
                    Err(e) => Err(Error::internal(format!("gossip publish: {e}"))),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<DirBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connected to {peer_id}");
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                if self.pinned.contains(&peer_id) {
                    debug!("re-dialing pinned peer {peer_id}");
                    if let Err(e) = self.swarm.dial(peer_id) {
                        debug!("re-dial of {peer_id} failed: {e}");
                    }
                }
            }
            SwarmEvent::Behaviour(DirBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.handle_message(propagation_source, message).await;
            }
            SwarmEvent::Behaviour(DirBehaviourEvent::Kad(
                kad::Event::OutboundQueryProgressed {
                    id, result, step, ..
                },
            )) => {
                self.handle_query_result(id, result, step.last);
            }
            SwarmEvent::Behaviour(DirBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
            })) => {
                // Learned addresses feed the routing table.
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            _ => {}
        }
    }

    async fn handle_message(&mut self, source: PeerId, message: gossipsub::Message) {
        if message.source == Some(self.local_peer_id) || source == self.local_peer_id {
            return;
        }
        // Invalid payloads are logged and dropped; the loop never terminates
        // over a bad message.
        let announcement = match LabelAnnouncement::decode(&message.data) {
            Ok(a) => a,
            Err(e) => {
                warn!("dropping announcement from {source}: {e}");
                return;
            }
        };
        // Announcement sources count as mesh members worth keeping.
        self.pinned.insert(source);
        if self.announce_tx.send(announcement).await.is_err() {
            debug!("announcement consumer is gone");
        }
    }

    fn handle_query_result(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::StartProviding(outcome) => {
                if let Some(Pending::Provide(reply)) = self.pending.remove(&id) {
                    let _ = reply.send(
                        outcome
                            .map(|_| ())
                            .map_err(|e| Error::internal(format!("dht provide: {e}"))),
                    );
                }
            }
            kad::QueryResult::GetProviders(outcome) => {
                match outcome {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        if let Some(Pending::Providers { found, .. }) = self.pending.get_mut(&id) {
                            for provider in providers {
                                // Recent providers stay pinned.
                                self.pinned.insert(provider);
                                found.insert(provider);
                            }
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                    Err(e) => {
                        debug!("provider lookup failed: {e}");
                    }
                }
                if last {
                    if let Some(Pending::Providers { reply, found }) = self.pending.remove(&id) {
                        let _ =
                            reply.send(Ok(found.iter().map(|p| p.to_string()).collect()));
                    }
                }
            }
            _ => {}
        }
    }
}

fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

fn strip_peer(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect()
}
