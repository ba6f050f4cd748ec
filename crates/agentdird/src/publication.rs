//! Publication pipeline
//!
//! A sled-backed request queue drained by a scheduler task and a bounded
//! worker pool. The publications table is the single source of truth for
//! status transitions; the in-memory work queue only carries publication ids.

use agent_dir_core::query::RecordQuery;
use agent_dir_core::{Error, RecordRef, Result};
use agent_dir_routing::Routing;
use agent_dir_store::RecordStore;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Publication status lifecycle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PublicationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Deleted,
}

/// What a publication announces: an explicit CID list or a saved query set
/// resolved against the local index at processing time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum PublicationRequest {
    Refs(Vec<String>),
    Queries(Vec<RecordQuery>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Publication {
    pub id: String,
    pub request: PublicationRequest,
    pub status: PublicationStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Work handed from the scheduler to the pool.
#[derive(Clone, Debug)]
struct WorkItem {
    publication_id: String,
}

// =============================================================================
// PUBLICATION STORE
// =============================================================================

pub struct PublicationStore {
    tree: sled::Tree,
}

impl PublicationStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Persist a new publication in `Pending` state.
    pub fn create(&self, request: PublicationRequest) -> Result<Publication> {
        let now = Utc::now().to_rfc3339();
        let publication = Publication {
            id: Uuid::new_v4().to_string(),
            request,
            status: PublicationStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
        };
        self.put(&publication)?;
        Ok(publication)
    }

    fn put(&self, publication: &Publication) -> Result<()> {
        let bytes = postcard::to_allocvec(publication).map_err(Error::internal)?;
        self.tree
            .insert(publication.id.as_bytes(), bytes)
            .map_err(Error::internal)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Publication>> {
        match self.tree.get(id.as_bytes()).map_err(Error::internal)? {
            Some(bytes) => Ok(Some(
                postcard::from_bytes(&bytes).map_err(Error::internal)?,
            )),
            None => Ok(None),
        }
    }

    /// Single-row status transition.
    pub fn set_status(&self, id: &str, status: PublicationStatus) -> Result<()> {
        let mut publication = self
            .get(id)?
            .ok_or_else(|| Error::not_found(format!("publication {id}")))?;
        publication.status = status;
        publication.updated_at = Utc::now().to_rfc3339();
        self.put(&publication)
    }

    /// Tombstone a publication. Deleted publications are never scheduled.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.set_status(id, PublicationStatus::Deleted)
    }

    /// Enumerate publications with the given status.
    pub fn by_status(&self, status: PublicationStatus) -> Result<Vec<Publication>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item.map_err(Error::internal)?;
            let publication: Publication =
                postcard::from_bytes(&bytes).map_err(Error::internal)?;
            if publication.status == status {
                out.push(publication);
            }
        }
        Ok(out)
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone, Debug)]
pub struct PublicationConfig {
    pub scheduler_interval: Duration,
    pub worker_count: usize,
    pub worker_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: Duration::from_secs(3600),
            worker_count: 4,
            worker_timeout: Duration::from_secs(1800),
            queue_capacity: 100,
        }
    }
}

/// Process-wide publication service: one scheduler, N workers, one bounded
/// queue. All state lives in the publications table plus the queue.
pub struct PublicationService {
    store: Arc<PublicationStore>,
    record_store: Arc<dyn RecordStore>,
    routing: Arc<Routing>,
    config: PublicationConfig,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PublicationService {
    pub fn new(
        store: PublicationStore,
        record_store: Arc<dyn RecordStore>,
        routing: Arc<Routing>,
        config: PublicationConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store: Arc::new(store),
            record_store,
            routing,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<PublicationStore> {
        &self.store
    }

    /// Queue a new publication. The scheduler picks it up on its next pass.
    pub fn submit(&self, request: PublicationRequest) -> Result<Publication> {
        let publication = self.store.create(request)?;
        info!("queued publication {}", publication.id);
        Ok(publication)
    }

    /// Spawn the scheduler and the worker pool.
    pub fn start(&self) {
        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(self.config.queue_capacity);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(run_scheduler(
            self.store.clone(),
            queue_tx,
            self.config.scheduler_interval,
            self.shutdown_tx.subscribe(),
        )));
        for worker_id in 0..self.config.worker_count {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                queue_rx.clone(),
                self.store.clone(),
                self.record_store.clone(),
                self.routing.clone(),
                self.config.worker_timeout,
                self.shutdown_tx.subscribe(),
            )));
        }
        info!(
            "publication pipeline started with {} workers",
            self.config.worker_count
        );
    }

    /// Signal shutdown and join every task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("publication pipeline stopped");
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

async fn run_scheduler(
    store: Arc<PublicationStore>,
    queue_tx: mpsc::Sender<WorkItem>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    // The first tick fires immediately, covering the startup pass.
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => dispatch_pending(&store, &queue_tx),
            _ = shutdown_rx.recv() => {
                debug!("scheduler stopped");
                break;
            }
        }
    }
}

fn dispatch_pending(store: &PublicationStore, queue_tx: &mpsc::Sender<WorkItem>) {
    let pending = match store.by_status(PublicationStatus::Pending) {
        Ok(pending) => pending,
        Err(e) => {
            error!("enumerating pending publications: {e}");
            return;
        }
    };
    for publication in pending {
        // Non-blocking hand-off: a full queue means the next tick retries.
        match queue_tx.try_send(WorkItem {
            publication_id: publication.id.clone(),
        }) {
            Ok(()) => {
                if let Err(e) = store.set_status(&publication.id, PublicationStatus::InProgress) {
                    warn!("marking {} in progress: {e}", publication.id);
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("work queue full, retrying on the next tick");
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

// =============================================================================
// WORKERS
// =============================================================================

async fn run_worker(
    worker_id: usize,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    store: Arc<PublicationStore>,
    record_store: Arc<dyn RecordStore>,
    routing: Arc<Routing>,
    worker_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let item = {
            let mut queue = queue_rx.lock().await;
            tokio::select! {
                item = queue.recv() => item,
                _ = shutdown_rx.recv() => None,
            }
        };
        let Some(item) = item else {
            debug!("worker {worker_id} stopped");
            break;
        };

        let id = item.publication_id;
        let status = match tokio::time::timeout(
            worker_timeout,
            process_publication(&store, record_store.as_ref(), &routing, &id),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!("publication {id}: {e}");
                PublicationStatus::Failed
            }
            Err(_) => {
                error!("publication {id}: {}", Error::Timeout);
                PublicationStatus::Failed
            }
        };
        if let Err(e) = store.set_status(&id, status) {
            error!("recording status for {id}: {e}");
        }
    }
}

/// Resolve a publication's CID list and announce each record. A batch
/// completes only when every CID announces cleanly; per-CID failures are
/// logged and counted, not aborted on.
async fn process_publication(
    store: &PublicationStore,
    record_store: &dyn RecordStore,
    routing: &Routing,
    id: &str,
) -> Result<PublicationStatus> {
    let publication = store
        .get(id)?
        .ok_or_else(|| Error::not_found(format!("publication {id}")))?;

    let cids: Vec<String> = match publication.request {
        PublicationRequest::Refs(refs) => refs,
        PublicationRequest::Queries(queries) => routing
            .list(&queries, None)?
            .into_iter()
            .map(|m| m.cid)
            .collect(),
    };

    let total = cids.len();
    let mut succeeded = 0;
    for cid in cids {
        match announce(record_store, routing, &cid).await {
            Ok(()) => succeeded += 1,
            Err(e) => warn!("announcing {cid}: {e}"),
        }
    }
    info!("publication {id}: announced {succeeded}/{total} records");
    Ok(if succeeded == total {
        PublicationStatus::Completed
    } else {
        PublicationStatus::Failed
    })
}

async fn announce(record_store: &dyn RecordStore, routing: &Routing, cid: &str) -> Result<()> {
    let record = record_store.pull(&RecordRef::new(cid)).await?;
    routing.publish(&record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_dir_core::query::QueryType;
    use agent_dir_core::record::*;
    use agent_dir_routing::{LabelIndex, Network, NetworkConfig};
    use agent_dir_store::{LocalLayout, OciStore};
    use libp2p::identity;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn publication_store(dir: &std::path::Path) -> PublicationStore {
        let db = sled::open(dir.join("pubs")).unwrap();
        PublicationStore::new(db.open_tree("publications").unwrap())
    }

    fn test_record(name: &str) -> Record {
        Record::V2(RecordV2 {
            schema_version: "v0.4.0".into(),
            name: name.into(),
            version: "v1.0.0".into(),
            description: String::new(),
            created_at: "2025-04-01T00:00:00Z".into(),
            authors: vec![],
            skills: vec![SkillV2 {
                name: "planning".into(),
            }],
            domains: vec![],
            locators: vec![],
            extensions: vec![],
            signature: None,
            annotations: BTreeMap::new(),
        })
    }

    #[test]
    fn test_store_lifecycle() {
        let dir = tempdir().unwrap();
        let store = publication_store(dir.path());

        let publication = store
            .create(PublicationRequest::Refs(vec!["cid-a".into()]))
            .unwrap();
        assert_eq!(publication.status, PublicationStatus::Pending);

        store
            .set_status(&publication.id, PublicationStatus::InProgress)
            .unwrap();
        let loaded = store.get(&publication.id).unwrap().unwrap();
        assert_eq!(loaded.status, PublicationStatus::InProgress);
        assert!(loaded.updated_at >= loaded.created_at);

        assert_eq!(
            store.by_status(PublicationStatus::InProgress).unwrap().len(),
            1
        );
        assert!(store.by_status(PublicationStatus::Pending).unwrap().is_empty());
    }

    #[test]
    fn test_deleted_publications_are_not_scheduled() {
        let dir = tempdir().unwrap();
        let store = publication_store(dir.path());

        let publication = store
            .create(PublicationRequest::Refs(vec!["cid-a".into()]))
            .unwrap();
        store.delete(&publication.id).unwrap();

        assert!(store.by_status(PublicationStatus::Pending).unwrap().is_empty());
        assert_eq!(
            store.get(&publication.id).unwrap().unwrap().status,
            PublicationStatus::Deleted
        );
    }

    #[test]
    fn test_unknown_publication_status_update() {
        let dir = tempdir().unwrap();
        let store = publication_store(dir.path());
        assert!(matches!(
            store
                .set_status("missing", PublicationStatus::Failed)
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    struct Pipeline {
        service: PublicationService,
        record_store: Arc<dyn RecordStore>,
        _dir: tempfile::TempDir,
    }

    async fn pipeline(interval: Duration) -> Pipeline {
        let dir = tempdir().unwrap();
        let record_store: Arc<dyn RecordStore> =
            Arc::new(OciStore::new(LocalLayout::open(dir.path().join("layout")).unwrap()));

        let db = sled::open(dir.path().join("datastore")).unwrap();
        let index = Arc::new(LabelIndex::new(db.open_tree("labels").unwrap()));

        let (shutdown_tx, _) = broadcast::channel(1);
        let (network, _announce_rx, _net_handle) = Network::spawn(
            NetworkConfig {
                keypair: identity::Keypair::generate_ed25519(),
                listen_addr: "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                bootstrap: vec![],
            },
            shutdown_tx.subscribe(),
        )
        .unwrap();
        let routing = Arc::new(Routing::new(index, network));

        let service = PublicationService::new(
            publication_store(dir.path()),
            record_store.clone(),
            routing,
            PublicationConfig {
                scheduler_interval: interval,
                worker_count: 2,
                worker_timeout: Duration::from_secs(30),
                queue_capacity: 16,
            },
            shutdown_tx,
        );
        Pipeline {
            service,
            record_store,
            _dir: dir,
        }
    }

    async fn wait_for_terminal(
        store: &PublicationStore,
        id: &str,
    ) -> PublicationStatus {
        for _ in 0..100 {
            let status = store.get(id).unwrap().unwrap().status;
            if matches!(
                status,
                PublicationStatus::Completed | PublicationStatus::Failed
            ) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("publication {id} never reached a terminal status");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publication_with_local_records_completes() {
        let p = pipeline(Duration::from_millis(100)).await;

        let ref_a = p.record_store.push(&test_record("agent-a")).await.unwrap();
        let ref_b = p.record_store.push(&test_record("agent-b")).await.unwrap();

        let publication = p
            .service
            .submit(PublicationRequest::Refs(vec![ref_a.cid, ref_b.cid]))
            .unwrap();
        p.service.start();

        let status = wait_for_terminal(p.service.store(), &publication.id).await;
        assert_eq!(status, PublicationStatus::Completed);
        p.service.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publication_with_missing_record_fails() {
        let p = pipeline(Duration::from_millis(100)).await;

        let ref_a = p.record_store.push(&test_record("agent-a")).await.unwrap();
        let publication = p
            .service
            .submit(PublicationRequest::Refs(vec![
                ref_a.cid,
                "baeareig77vqcdozl2wyk6z3cscaj5q5fggi53aoh64fewkdiri3cdauyn4".into(),
            ]))
            .unwrap();
        p.service.start();

        let status = wait_for_terminal(p.service.store(), &publication.id).await;
        assert_eq!(status, PublicationStatus::Failed);
        p.service.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_publication_resolves_against_local_index() {
        let p = pipeline(Duration::from_millis(100)).await;

        // First publication by ref seeds the local index; the query-derived
        // publication then re-announces whatever matches.
        let ref_a = p.record_store.push(&test_record("agent-a")).await.unwrap();
        let direct = p
            .service
            .submit(PublicationRequest::Refs(vec![ref_a.cid]))
            .unwrap();
        p.service.start();
        wait_for_terminal(p.service.store(), &direct.id).await;

        let queried = p
            .service
            .submit(PublicationRequest::Queries(vec![RecordQuery::new(
                QueryType::Skill,
                "planning",
            )]))
            .unwrap();
        let status = wait_for_terminal(p.service.store(), &queried.id).await;
        assert_eq!(status, PublicationStatus::Completed);
        p.service.stop().await;
    }
}
