//! Label index over sled
//!
//! Reverse entries live under `<labelKey>/<peerId>/<cid>` with empty values;
//! a forward index under `/cid/<cid>/<peerId><labelKey>` supports deletion by
//! `(cid, peerId)` pair. Label keys contain `/` internally, but peer ids and
//! CIDs never do, so reverse keys parse unambiguously from the end.

use agent_dir_core::query::{match_score, matches_all, RecordQuery};
use agent_dir_core::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

const FORWARD_PREFIX: &str = "/cid/";

/// One reverse-index entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub label: String,
    pub cid: String,
    pub peer_id: String,
}

/// Local List hit: a record plus every label it matched under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListMatch {
    pub cid: String,
    pub labels: Vec<String>,
}

/// Scored Match hit.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredMatch {
    pub cid: String,
    pub peer_id: String,
    pub match_score: u32,
    pub matched_queries: Vec<RecordQuery>,
}

pub struct LabelIndex {
    tree: sled::Tree,
}

impl LabelIndex {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    fn reverse_key(label: &str, peer_id: &str, cid: &str) -> String {
        format!("{label}/{peer_id}/{cid}")
    }

    fn forward_key(cid: &str, peer_id: &str, label: &str) -> String {
        format!("{FORWARD_PREFIX}{cid}/{peer_id}{label}")
    }

    /// Idempotently index a record's labels under a peer.
    pub fn put_labels(&self, labels: &[String], cid: &str, peer_id: &str) -> Result<()> {
        if cid.is_empty() || peer_id.is_empty() {
            return Err(Error::invalid("label entries need a cid and a peer id"));
        }
        for label in labels {
            self.tree
                .insert(Self::reverse_key(label, peer_id, cid), vec![])
                .map_err(Error::internal)?;
            self.tree
                .insert(Self::forward_key(cid, peer_id, label), vec![])
                .map_err(Error::internal)?;
        }
        debug!("indexed {} labels for {cid} via {peer_id}", labels.len());
        Ok(())
    }

    /// Remove every label recorded for a `(cid, peerId)` pair. Returns the
    /// number of labels removed.
    pub fn remove_labels(&self, cid: &str, peer_id: &str) -> Result<usize> {
        // Labels start with '/', so including it in the scan prefix keeps
        // `peer-1` from matching `peer-10` keys.
        let base = format!("{FORWARD_PREFIX}{cid}/{peer_id}");
        let prefix = format!("{base}/");
        let mut removed = 0;
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(Error::internal)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let label = &key[base.len()..];
            self.tree
                .remove(Self::reverse_key(label, peer_id, cid))
                .map_err(Error::internal)?;
            self.tree.remove(key.as_bytes()).map_err(Error::internal)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Labels currently recorded for a `(cid, peerId)` pair.
    pub fn labels_for(&self, cid: &str, peer_id: &str) -> Result<Vec<String>> {
        let base = format!("{FORWARD_PREFIX}{cid}/{peer_id}");
        let prefix = format!("{base}/");
        let mut labels = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(Error::internal)?;
            let key = String::from_utf8_lossy(&key);
            labels.push(key[base.len()..].to_string());
        }
        Ok(labels)
    }

    /// Iterate every reverse entry in datastore key order.
    fn entries(&self) -> impl Iterator<Item = Result<IndexEntry>> + '_ {
        self.tree.iter().filter_map(|item| {
            let (key, _) = match item {
                Ok(kv) => kv,
                Err(e) => return Some(Err(Error::internal(e))),
            };
            let key = String::from_utf8_lossy(&key).into_owned();
            if key.starts_with(FORWARD_PREFIX) {
                return None;
            }
            // <labelKey>/<peerId>/<cid>, parsed from the end.
            let mut parts = key.rsplitn(3, '/');
            let cid = parts.next()?.to_string();
            let peer_id = parts.next()?.to_string();
            let label = parts.next()?.to_string();
            Some(Ok(IndexEntry {
                label,
                cid,
                peer_id,
            }))
        })
    }

    /// Group every entry by `(cid, peerId)`, preserving first-seen key order.
    fn grouped(&self) -> Result<Vec<((String, String), Vec<String>)>> {
        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<String>> = HashMap::new();
        for entry in self.entries() {
            let entry = entry?;
            let key = (entry.cid, entry.peer_id);
            match groups.get_mut(&key) {
                Some(labels) => labels.push(entry.label),
                None => {
                    order.push(key.clone());
                    groups.insert(key, vec![entry.label]);
                }
            }
        }
        Ok(order
            .into_iter()
            .map(|key| {
                let labels = groups.remove(&key).unwrap_or_default();
                (key, labels)
            })
            .collect())
    }

    /// Intersection (AND) semantics over one peer's entries.
    pub fn list(
        &self,
        queries: &[RecordQuery],
        peer_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ListMatch>> {
        let cap = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for ((cid, peer), labels) in self.grouped()? {
            if out.len() >= cap {
                break;
            }
            if peer != peer_id {
                continue;
            }
            if matches_all(queries, &labels) {
                out.push(ListMatch { cid, labels });
            }
        }
        Ok(out)
    }

    /// Union (OR) semantics with per-query match counting. Entries belonging
    /// to `exclude_peer` are skipped.
    pub fn match_entries(
        &self,
        queries: &[RecordQuery],
        min_score: u32,
        limit: Option<usize>,
        exclude_peer: Option<&str>,
    ) -> Result<Vec<ScoredMatch>> {
        let cap = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for ((cid, peer), labels) in self.grouped()? {
            if out.len() >= cap {
                break;
            }
            if exclude_peer == Some(peer.as_str()) {
                continue;
            }
            let (score, matched) = match_score(queries, &labels);
            if score >= min_score {
                out.push(ScoredMatch {
                    cid,
                    peer_id: peer,
                    match_score: score,
                    matched_queries: matched,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_dir_core::query::QueryType;
    use tempfile::tempdir;

    fn index() -> (tempfile::TempDir, LabelIndex) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("labels").unwrap();
        (dir, LabelIndex::new(tree))
    }

    fn labels() -> Vec<String> {
        vec![
            "/skills/planning".to_string(),
            "/locators/docker-image".to_string(),
            "/name/directory.example.org/acme/planner".to_string(),
        ]
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "peer-1").unwrap();
        index.put_labels(&labels(), "cid-a", "peer-1").unwrap();
        assert_eq!(index.labels_for("cid-a", "peer-1").unwrap().len(), 3);
    }

    #[test]
    fn test_remove_by_pair() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "peer-1").unwrap();
        index.put_labels(&labels(), "cid-a", "peer-2").unwrap();

        assert_eq!(index.remove_labels("cid-a", "peer-1").unwrap(), 3);
        assert!(index.labels_for("cid-a", "peer-1").unwrap().is_empty());
        // The other peer's entries survive.
        assert_eq!(index.labels_for("cid-a", "peer-2").unwrap().len(), 3);
        let hits = index
            .match_entries(
                &[RecordQuery::new(QueryType::Skill, "planning")],
                1,
                None,
                None,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].peer_id, "peer-2");
    }

    #[test]
    fn test_list_is_intersection() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "self").unwrap();
        index
            .put_labels(&["/skills/planning".to_string()], "cid-b", "self")
            .unwrap();

        let queries = vec![
            RecordQuery::new(QueryType::Skill, "planning"),
            RecordQuery::new(QueryType::Locator, "docker-image"),
        ];
        let hits = index.list(&queries, "self", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cid, "cid-a");
    }

    #[test]
    fn test_list_filters_by_peer() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "remote-peer").unwrap();
        let hits = index
            .list(
                &[RecordQuery::new(QueryType::Skill, "planning")],
                "self",
                None,
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_match_scores_per_query() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "peer-1").unwrap();

        let queries = vec![
            RecordQuery::new(QueryType::Skill, "planning"),
            RecordQuery::new(QueryType::Locator, "helm-chart"),
            RecordQuery::new(QueryType::Name, "*acme*"),
        ];
        let hits = index.match_entries(&queries, 1, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_score, 2);
        assert_eq!(hits[0].matched_queries.len(), 2);

        // Raising the floor filters the record out.
        assert!(index.match_entries(&queries, 3, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_match_excludes_peer() {
        let (_dir, index) = index();
        index.put_labels(&labels(), "cid-a", "self").unwrap();
        index.put_labels(&labels(), "cid-a", "peer-1").unwrap();

        let hits = index
            .match_entries(
                &[RecordQuery::new(QueryType::Skill, "planning")],
                1,
                None,
                Some("self"),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].peer_id, "peer-1");
    }

    #[test]
    fn test_limit_caps_results() {
        let (_dir, index) = index();
        for i in 0..10 {
            index
                .put_labels(&labels(), &format!("cid-{i}"), "peer-1")
                .unwrap();
        }
        let hits = index
            .match_entries(
                &[RecordQuery::new(QueryType::Skill, "planning")],
                1,
                Some(3),
                None,
            )
            .unwrap();
        assert_eq!(hits.len(), 3);
    }
}
