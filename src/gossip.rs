//! Gossip subsystem based on Iroh.
//!
//! Every node subscribes to one gossip topic.  Entries published locally
//! are broadcast as single frames; whatever arrives from the topic is
//! merged into the store.  Since gossip only delivers what is sent while a
//! node is online, the full state is pushed whenever a neighbor comes up
//! and periodically afterwards, merging is idempotent so the duplicates
//! are harmless.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use iroh::key::SecretKey;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};
use iroh_gossip::net::{Event, Gossip, GossipEvent, GossipSender, JoinOptions, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};

use crate::codec;
use crate::config::Cluster;
use crate::store::Store;
use crate::types::MeshEntry;

/// Room left in every gossip message for the topic and the envelope.
const MESSAGE_HEADROOM: usize = 128;

/// Current gossip neighbors of this node.
pub type Peers = Arc<RwLock<BTreeSet<NodeId>>>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] codec::Error),
    #[error("a newer entry of {0} is already known")]
    Stale(String),
    #[error("gossip subsystem is gone")]
    Closed,
}

/// Hands locally declared entries to the mesh.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<Store>,
    tx: mpsc::Sender<Bytes>,
}

impl Publisher {
    pub fn new(store: Arc<Store>, tx: mpsc::Sender<Bytes>) -> Self {
        Self { store, tx }
    }

    /// Merges `entry` into the local store, then queues it for broadcast.
    /// An entry the store rejects is not broadcast.
    pub async fn publish(&self, entry: &MeshEntry) -> Result<(), PublishError> {
        let frame = codec::encode(entry)?;
        if self.store.merge(&frame).await? == 0 {
            return Err(PublishError::Stale(entry.name.clone()));
        }
        self.tx.send(frame).await.map_err(|_| PublishError::Closed)
    }
}

/// The configured topic, or one derived from the cluster name.
pub fn topic_id(cfg: &Cluster) -> anyhow::Result<TopicId> {
    let bytes: [u8; 32] = match &cfg.topic_id {
        Some(topic) => hex::decode(topic)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid topic ID length"))?,
        None => Sha256::digest(format!("gossiping/{}", cfg.cluster_name)).into(),
    };

    Ok(TopicId::from_bytes(bytes))
}

fn secret_key(cfg: &Cluster) -> anyhow::Result<Option<SecretKey>> {
    let Some(key) = &cfg.secret_key else {
        return Ok(None);
    };

    let bytes: [u8; 32] = hex::decode(key)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid secret key length"))?;
    Ok(Some(SecretKey::from_bytes(&bytes)))
}

/// Largest payload that still fits a gossip message of `max_message_size`.
fn payload_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_sub(MESSAGE_HEADROOM)
}

/// Runs the gossip subsystem.
pub async fn run_gossip(
    cfg: Cluster,
    store: Arc<Store>,
    mut publish_rx: mpsc::Receiver<Bytes>,
    peers: Peers,
) -> anyhow::Result<()> {
    // Create a new Iroh endpoint.
    let mut builder = Endpoint::builder().discovery_n0();
    if let Some(key) = secret_key(&cfg)? {
        builder = builder.secret_key(key);
    }
    let endpoint = builder.bind().await?;
    info!("Gossip endpoint created with ID: {}", endpoint.node_id());

    let my_addr = endpoint.node_addr().await?;
    let gossip = Gossip::from_endpoint(
        endpoint.clone(),
        iroh_gossip::proto::Config {
            max_message_size: cfg.max_message_size,
            ..Default::default()
        },
        &my_addr.info,
    );
    let router = Router::builder(endpoint.clone())
        .accept(GOSSIP_ALPN, Arc::new(gossip.clone()))
        .spawn()
        .await?;

    // Parse bootstrap peers
    let mut bootstrap_ids = Vec::new();
    for peer in &cfg.bootstrap_peers {
        match peer.parse::<NodeId>() {
            Ok(id) => bootstrap_ids.push(id),
            Err(_) => warn!("Invalid bootstrap peer ID: {}", peer),
        }
    }

    // Joining does not wait for a neighbor, the first node of a cluster
    // has none.
    let topic = topic_id(&cfg)?;
    let (sender, mut receiver) = gossip
        .join_with_opts(topic, JoinOptions::with_bootstrap(bootstrap_ids))
        .split();

    let limit = payload_limit(cfg.max_message_size);

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.push_pull_interval.max(1)));
    loop {
        tokio::select! {
            frame = publish_rx.recv() => {
                let Some(frame) = frame else {
                    info!("Gossip update channel closed, shutting down");
                    break;
                };

                if frame.len() > limit {
                    warn!(
                        "Entry of {} bytes exceeds the {} bytes message limit, not broadcast",
                        frame.len(), limit
                    );
                    continue;
                }

                if let Err(e) = sender.broadcast(frame).await {
                    error!("Failed to broadcast gossip message: {}", e);
                }
            }

            event = receiver.next() => match event {
                Some(Ok(Event::Gossip(GossipEvent::Received(msg)))) => {
                    match store.merge(&msg.content).await {
                        Ok(accepted) => debug!(
                            "Merged {} entries from {}",
                            accepted, msg.delivered_from
                        ),
                        Err(e) => warn!(
                            "Failed to merge gossip message from {}: {}",
                            msg.delivered_from, e
                        ),
                    }
                }
                Some(Ok(Event::Gossip(GossipEvent::NeighborUp(peer)))) => {
                    info!("Gossip peer joined: {}", peer);
                    peers.write().await.insert(peer);
                    push_state(&sender, &store, limit).await;
                }
                Some(Ok(Event::Gossip(GossipEvent::NeighborDown(peer)))) => {
                    info!("Gossip peer left: {}", peer);
                    peers.write().await.remove(&peer);
                }
                Some(Ok(Event::Gossip(GossipEvent::Joined(neighbors)))) => {
                    info!("Joined gossip topic with {} neighbors", neighbors.len());
                    peers.write().await.extend(neighbors);
                }
                Some(Ok(Event::Lagged)) => {
                    warn!("Gossip receiver lagged, messages were dropped");
                }
                Some(Err(e)) => {
                    error!("Gossip receiver error: {}", e);
                    break;
                }
                None => {
                    warn!("Gossip receiver closed");
                    break;
                }
            },

            _ = ticker.tick() => {
                if !peers.read().await.is_empty() {
                    push_state(&sender, &store, limit).await;
                }
            }
        }
    }

    router.shutdown().await?;
    Ok(())
}

/// Broadcasts every entry of the store in chunks of at most `limit` bytes.
async fn push_state(sender: &GossipSender, store: &Store, limit: usize) {
    let chunks = match store
        .serialize_all()
        .await
        .and_then(|buf| codec::split_frames(&buf, limit))
    {
        Ok(chunks) => chunks,
        Err(e) => {
            error!("Failed to serialize state: {}", e);
            return;
        }
    };

    debug!("Pushing full state in {} messages", chunks.len());
    for chunk in chunks {
        if let Err(e) = sender.broadcast(chunk).await {
            error!("Failed to push state: {}", e);
            return;
        }
    }
}
