//! Routing façade
//!
//! Ties the label index, the DHT provider plane, and the gossip mesh into
//! the publish/unpublish surface the daemon and the publication pipeline
//! drive. Label and cache writes are best-effort; a failed DHT provide is
//! logged rather than fatal since the publication pipeline retries.

use crate::gossip::LabelAnnouncement;
use crate::index::{LabelIndex, ListMatch};
use crate::net::Network;
use agent_dir_core::label::record_labels;
use agent_dir_core::query::RecordQuery;
use agent_dir_core::{Record, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Routing {
    index: Arc<LabelIndex>,
    network: Network,
}

impl Routing {
    pub fn new(index: Arc<LabelIndex>, network: Network) -> Self {
        Self { index, network }
    }

    pub fn index(&self) -> &Arc<LabelIndex> {
        &self.index
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn local_peer_id(&self) -> String {
        self.network.local_peer_id()
    }

    /// Announce a record to the network: DHT provide, one gossip
    /// announcement, and a local index write.
    pub async fn publish(&self, record: &Record) -> Result<()> {
        let cid = record.cid()?;
        let labels = record_labels(record);
        let peer_id = self.network.local_peer_id();

        if let Err(e) = self.network.provide(&cid).await {
            // Not fatal: the publication pipeline re-announces on its next
            // scheduled pass.
            warn!("dht provide for {cid}: {e}");
        }

        let announcement = LabelAnnouncement::new(&cid, &peer_id, labels.clone());
        self.network.publish_announcement(&announcement).await?;

        if let Err(e) = self.index.put_labels(&labels, &cid, &peer_id) {
            warn!("local label write for {cid}: {e}");
        }
        info!("published {cid} with {} labels", labels.len());
        Ok(())
    }

    /// Withdraw a record: stop providing and drop the local label entries.
    pub async fn unpublish(&self, cid: &str) -> Result<()> {
        self.network.unprovide(cid).await?;
        let removed = self.index.remove_labels(cid, &self.network.local_peer_id())?;
        info!("unpublished {cid}, removed {removed} labels");
        Ok(())
    }

    /// Local-only listing with intersection semantics. Never touches the
    /// network and never sees remote entries.
    pub fn list(&self, queries: &[RecordQuery], limit: Option<usize>) -> Result<Vec<ListMatch>> {
        self.index
            .list(queries, &self.network.local_peer_id(), limit)
    }
}

/// Spawn the gossip receive loop: validated announcements are handed to
/// `on_announcement` until the channel drains or shutdown fires. Callback
/// errors are logged and the loop continues.
pub fn spawn_receive_loop(
    mut announce_rx: mpsc::Receiver<LabelAnnouncement>,
    mut shutdown_rx: broadcast::Receiver<()>,
    on_announcement: impl Fn(&LabelAnnouncement) -> Result<()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = announce_rx.recv() => match maybe {
                    Some(announcement) => {
                        if let Err(e) = on_announcement(&announcement) {
                            warn!(
                                "handling announcement for {} from {}: {e}",
                                announcement.cid, announcement.peer_id
                            );
                        }
                    }
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    info!("label receive loop stopped");
                    break;
                }
            }
        }
    })
}

/// The standard receive-loop callback: write the announcement's labels into
/// the local index under the announcing peer's id.
pub fn index_writer(index: Arc<LabelIndex>) -> impl Fn(&LabelAnnouncement) -> Result<()> {
    move |announcement| {
        index.put_labels(
            &announcement.labels,
            &announcement.cid,
            &announcement.peer_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    fn label_index() -> (tempfile::TempDir, Arc<LabelIndex>) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, Arc::new(LabelIndex::new(db.open_tree("labels").unwrap())))
    }

    #[tokio::test]
    async fn test_receive_loop_writes_remote_labels() {
        let (_dir, index) = label_index();
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn_receive_loop(rx, shutdown_tx.subscribe(), index_writer(index.clone()));

        let announcement = LabelAnnouncement::new(
            "cid-remote",
            "peer-remote",
            vec!["/skills/planning".to_string()],
        );
        tx.send(announcement).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            index.labels_for("cid-remote", "peer-remote").unwrap(),
            vec!["/skills/planning".to_string()]
        );
    }

    #[tokio::test]
    async fn test_receive_loop_stops_on_shutdown() {
        let (_dir, index) = label_index();
        let (_tx, rx) = mpsc::channel::<LabelAnnouncement>(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn_receive_loop(rx, shutdown_tx.subscribe(), index_writer(index));
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_loop_survives_callback_errors() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn_receive_loop(rx, shutdown_tx.subscribe(), |_: &LabelAnnouncement| {
            Err(agent_dir_core::Error::internal("datastore offline"))
        });

        tx.send(LabelAnnouncement::new("a", "p", vec![]))
            .await
            .unwrap();
        tx.send(LabelAnnouncement::new("b", "p", vec![]))
            .await
            .unwrap();
        drop(tx);
        // Both messages are consumed despite the failing callback.
        handle.await.unwrap();
    }
}
