//! Remote discovery engine
//!
//! Search streams remote-only matches: scored hits from the label index
//! (entries seeded by gossip and prior DHT walks, excluding our own), plus a
//! DHT provider lookup when the query set narrows to a single CID. List never
//! leaves the local index.

use crate::routing::Routing;
use agent_dir_core::cid::cid_to_digest;
use agent_dir_core::query::RecordQuery;
use agent_dir_core::RecordRef;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SEARCH_CHANNEL_CAPACITY: usize = 64;

/// One remote search result.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub record_ref: RecordRef,
    pub peer_id: String,
    pub match_score: u32,
    pub matched_queries: Vec<RecordQuery>,
}

impl Routing {
    /// Stream remote matches for a query set. `min_score` 0 is coerced to 1;
    /// `limit` bounds the stream.
    pub fn search(
        &self,
        queries: Vec<RecordQuery>,
        limit: Option<usize>,
        min_score: u32,
    ) -> mpsc::Receiver<SearchHit> {
        let min_score = min_score.max(1);
        let (tx, rx) = mpsc::channel(SEARCH_CHANNEL_CAPACITY);
        let index = self.index().clone();
        let network = self.network().clone();
        let self_peer = self.local_peer_id();

        tokio::spawn(async move {
            let cap = limit.unwrap_or(usize::MAX);
            let mut emitted: HashSet<(String, String)> = HashSet::new();

            let local_hits =
                match index.match_entries(&queries, min_score, limit, Some(&self_peer)) {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!("label index scan: {e}");
                        Vec::new()
                    }
                };
            for hit in local_hits {
                if emitted.len() >= cap {
                    return;
                }
                emitted.insert((hit.cid.clone(), hit.peer_id.clone()));
                let sent = tx
                    .send(SearchHit {
                        record_ref: RecordRef::new(hit.cid),
                        peer_id: hit.peer_id,
                        match_score: hit.match_score,
                        matched_queries: hit.matched_queries,
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }

            // A single query whose value is itself a CID narrows the search
            // enough for a direct provider lookup.
            let cid_query = match queries.as_slice() {
                [only] if cid_to_digest(&only.value).is_ok() => Some(only.clone()),
                _ => None,
            };
            let Some(query) = cid_query else { return };

            let providers = match network.find_providers(&query.value).await {
                Ok(providers) => providers,
                Err(e) => {
                    debug!("provider lookup for {}: {e}", query.value);
                    return;
                }
            };
            for peer_id in providers {
                if emitted.len() >= cap {
                    return;
                }
                if peer_id == self_peer {
                    continue;
                }
                if !emitted.insert((query.value.clone(), peer_id.clone())) {
                    continue;
                }
                let sent = tx
                    .send(SearchHit {
                        record_ref: RecordRef::new(query.value.clone()),
                        peer_id,
                        match_score: 1,
                        matched_queries: vec![query.clone()],
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }
        });

        rx
    }
}
