//! Read-through/write-through record cache
//!
//! A transparent decorator over any [`RecordStore`]. Record bytes live under
//! `/record/<cid>` and serialized metadata under `/meta/<cid>` in a sled
//! tree. Cache failures never propagate; they downgrade to a source fetch.

use crate::store::{RecordStore, ReferrerVisitor};
use agent_dir_core::{codec, Record, RecordMeta, RecordRef, Referrer, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

const RECORD_PREFIX: &str = "/record/";
const META_PREFIX: &str = "/meta/";

pub struct CachedStore<S> {
    source: S,
    tree: sled::Tree,
}

impl<S: RecordStore> CachedStore<S> {
    pub fn new(source: S, tree: sled::Tree) -> Self {
        Self { source, tree }
    }

    fn record_key(cid: &str) -> String {
        format!("{RECORD_PREFIX}{cid}")
    }

    fn meta_key(cid: &str) -> String {
        format!("{META_PREFIX}{cid}")
    }

    fn cached_record(&self, cid: &str) -> Option<Record> {
        let bytes = self.tree.get(Self::record_key(cid)).ok().flatten()?;
        match codec::unmarshal(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("dropping corrupt cache entry for {cid}: {e}");
                let _ = self.tree.remove(Self::record_key(cid));
                None
            }
        }
    }

    fn cached_meta(&self, cid: &str) -> Option<RecordMeta> {
        let bytes = self.tree.get(Self::meta_key(cid)).ok().flatten()?;
        match postcard::from_bytes(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("dropping corrupt cache metadata for {cid}: {e}");
                let _ = self.tree.remove(Self::meta_key(cid));
                None
            }
        }
    }

    fn fill_record(&self, cid: &str, record: &Record) {
        match codec::marshal(record) {
            Ok(bytes) => {
                if let Err(e) = self.tree.insert(Self::record_key(cid), bytes) {
                    warn!("record cache write for {cid}: {e}");
                }
            }
            Err(e) => warn!("record cache encode for {cid}: {e}"),
        }
    }

    fn fill_meta(&self, cid: &str, meta: &RecordMeta) {
        match postcard::to_allocvec(meta) {
            Ok(bytes) => {
                if let Err(e) = self.tree.insert(Self::meta_key(cid), bytes) {
                    warn!("metadata cache write for {cid}: {e}");
                }
            }
            Err(e) => warn!("metadata cache encode for {cid}: {e}"),
        }
    }

    fn invalidate(&self, cid: &str) {
        if let Err(e) = self.tree.remove(Self::record_key(cid)) {
            warn!("record cache invalidation for {cid}: {e}");
        }
        if let Err(e) = self.tree.remove(Self::meta_key(cid)) {
            warn!("metadata cache invalidation for {cid}: {e}");
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for CachedStore<S> {
    async fn push(&self, record: &Record) -> Result<RecordRef> {
        let record_ref = self.source.push(record).await?;
        self.fill_record(&record_ref.cid, record);
        if let Ok(meta) = self.source.lookup(&record_ref).await {
            self.fill_meta(&record_ref.cid, &meta);
        }
        Ok(record_ref)
    }

    async fn pull(&self, record_ref: &RecordRef) -> Result<Record> {
        if let Some(record) = self.cached_record(&record_ref.cid) {
            debug!("record cache hit for {}", record_ref.cid);
            return Ok(record);
        }
        let record = self.source.pull(record_ref).await?;
        self.fill_record(&record_ref.cid, &record);
        Ok(record)
    }

    async fn lookup(&self, record_ref: &RecordRef) -> Result<RecordMeta> {
        if let Some(meta) = self.cached_meta(&record_ref.cid) {
            debug!("metadata cache hit for {}", record_ref.cid);
            return Ok(meta);
        }
        let meta = self.source.lookup(record_ref).await?;
        self.fill_meta(&record_ref.cid, &meta);
        Ok(meta)
    }

    async fn delete(&self, record_ref: &RecordRef) -> Result<()> {
        self.source.delete(record_ref).await?;
        self.invalidate(&record_ref.cid);
        Ok(())
    }

    async fn push_referrer(&self, cid: &str, referrer: &Referrer) -> Result<()> {
        self.source.push_referrer(cid, referrer).await
    }

    async fn walk_referrers(
        &self,
        cid: &str,
        type_filter: Option<&str>,
        visit: ReferrerVisitor<'_>,
    ) -> Result<()> {
        self.source.walk_referrers(cid, type_filter, visit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LocalLayout;
    use crate::store::OciStore;
    use agent_dir_core::record::*;
    use agent_dir_core::Error;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_record() -> Record {
        Record::V2(RecordV2 {
            schema_version: "v0.4.0".into(),
            name: "cached-agent".into(),
            version: "v1.0.0".into(),
            description: String::new(),
            created_at: "2025-04-01T00:00:00Z".into(),
            authors: vec![],
            skills: vec![SkillV2 {
                name: "search".into(),
            }],
            domains: vec![],
            locators: vec![],
            extensions: vec![],
            signature: None,
            annotations: BTreeMap::new(),
        })
    }

    fn cached_store(dir: &std::path::Path) -> CachedStore<OciStore<LocalLayout>> {
        let db = sled::open(dir.join("cache")).unwrap();
        let tree = db.open_tree("store-cache").unwrap();
        CachedStore::new(OciStore::new(LocalLayout::open(dir.join("layout")).unwrap()), tree)
    }

    #[tokio::test]
    async fn test_pull_served_from_cache_after_push() {
        let dir = tempdir().unwrap();
        let store = cached_store(dir.path());

        let record = test_record();
        let record_ref = store.push(&record).await.unwrap();

        assert!(store.cached_record(&record_ref.cid).is_some());
        assert_eq!(store.pull(&record_ref).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_delete_invalidates_cache() {
        let dir = tempdir().unwrap();
        let store = cached_store(dir.path());

        let record_ref = store.push(&test_record()).await.unwrap();
        store.delete(&record_ref).await.unwrap();

        assert!(store.cached_record(&record_ref.cid).is_none());
        assert!(matches!(
            store.pull(&record_ref).await.unwrap_err(),
            Error::NotFound(_) | Error::Integrity(_)
        ));
    }

    #[tokio::test]
    async fn test_lookup_fills_meta_cache() {
        let dir = tempdir().unwrap();
        let store = cached_store(dir.path());

        let record_ref = store.push(&test_record()).await.unwrap();
        // Drop what push cached so lookup has to fill it again.
        store.invalidate(&record_ref.cid);

        let meta = store.lookup(&record_ref).await.unwrap();
        assert_eq!(meta.schema_version, "v0.4.0");
        assert!(store.cached_meta(&record_ref.cid).is_some());
    }
}
