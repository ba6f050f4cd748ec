//! Record store over a registry backend
//!
//! Implements push/pull/lookup/delete plus the referrer operations against
//! either backend. Push is idempotent; delete is best-effort; network errors
//! surface as `Internal` with the original message preserved.

use crate::backend::RegistryBackend;
use crate::manifest::{
    meta_from_annotations, record_annotations, Descriptor, ImageManifest,
    MEDIA_TYPE_EMPTY_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_RECORD_LAYER,
};
use crate::referrer::{
    custom_annotations, referrer_annotations, referrer_media_type, KeyTrustEndpoint,
    SignatureAttacher, ANNOTATION_COSIGN_SIGNATURE, ANNOTATION_REFERRER_CREATED_AT,
    ANNOTATION_REFERRER_TYPE, MEDIA_TYPE_COSIGN_SIMPLESIGNING, MEDIA_TYPE_REFERRER_JSON,
    REFERRER_ANNOTATION_SIGNATURE,
};
use agent_dir_core::cid::{digest_to_cid, RecordDigest};
use agent_dir_core::{codec, Error, Record, RecordMeta, RecordRef, Referrer, Result};
use agent_dir_core::{REFERRER_TYPE_PUBLIC_KEY, REFERRER_TYPE_SIGNATURE};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Callback invoked per referrer during a walk. The walk stops on the first
/// error the callback returns.
pub type ReferrerVisitor<'a> = &'a mut (dyn FnMut(Referrer) -> Result<()> + Send);

/// Storage surface for records and their referrers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn push(&self, record: &Record) -> Result<RecordRef>;
    async fn pull(&self, record_ref: &RecordRef) -> Result<Record>;
    async fn lookup(&self, record_ref: &RecordRef) -> Result<RecordMeta>;
    async fn delete(&self, record_ref: &RecordRef) -> Result<()>;
    async fn push_referrer(&self, cid: &str, referrer: &Referrer) -> Result<()>;
    async fn walk_referrers(
        &self,
        cid: &str,
        type_filter: Option<&str>,
        visit: ReferrerVisitor<'_>,
    ) -> Result<()>;
}

/// Record store over an OCI registry backend.
pub struct OciStore<B> {
    backend: B,
    signer: Option<Box<dyn SignatureAttacher>>,
    key_endpoint: Option<Box<dyn KeyTrustEndpoint>>,
}

impl<B: RegistryBackend> OciStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            signer: None,
            key_endpoint: None,
        }
    }

    /// Install the external signing tool collaborator.
    pub fn with_signer(mut self, signer: Box<dyn SignatureAttacher>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Install the registry key-acceptance collaborator.
    pub fn with_key_endpoint(mut self, endpoint: Box<dyn KeyTrustEndpoint>) -> Self {
        self.key_endpoint = Some(endpoint);
        self
    }

    fn check_ref(record_ref: &RecordRef) -> Result<()> {
        if record_ref.cid.is_empty() {
            return Err(Error::invalid("record ref has an empty cid"));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: RegistryBackend> RecordStore for OciStore<B> {
    async fn push(&self, record: &Record) -> Result<RecordRef> {
        let bytes = codec::marshal(record)?;
        let layer = self.backend.push_blob(MEDIA_TYPE_RECORD_LAYER, &bytes).await?;

        let cid = digest_to_cid(&RecordDigest::parse(&layer.digest)?);
        let derived = record.cid()?;
        if cid != derived {
            return Err(Error::internal(format!(
                "registry digest maps to {cid} but the record derives {derived}"
            )));
        }

        // Idempotent: a manifest already tagged with this CID wins.
        if self.lookup(&RecordRef::new(&cid)).await.is_ok() {
            debug!("record {cid} already stored");
            return Ok(RecordRef::new(cid));
        }

        let config = self.backend.push_blob(MEDIA_TYPE_EMPTY_CONFIG, b"{}").await?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            artifact_type: None,
            config,
            layers: vec![layer],
            subject: None,
            annotations: record_annotations(record, &cid),
        };
        self.backend.put_manifest(&manifest, Some(&cid)).await?;
        Ok(RecordRef::new(cid))
    }

    async fn pull(&self, record_ref: &RecordRef) -> Result<Record> {
        Self::check_ref(record_ref)?;
        let (_, manifest) = self.backend.resolve_manifest(&record_ref.cid).await?;

        if manifest.layers.is_empty() {
            return Err(Error::integrity(format!(
                "manifest for {} has no layers",
                record_ref.cid
            )));
        }
        if manifest.layers.len() > 1 {
            warn!(
                "manifest for {} has {} layers, using the first",
                record_ref.cid,
                manifest.layers.len()
            );
        }
        let layer = &manifest.layers[0];

        let bytes = self
            .backend
            .fetch_blob(&layer.digest)
            .await
            .map_err(|e| Error::integrity(format!("record blob for {}: {e}", record_ref.cid)))?;
        if bytes.len() as u64 != layer.size {
            warn!(
                "blob for {} is {} bytes but the descriptor declares {}",
                record_ref.cid,
                bytes.len(),
                layer.size
            );
        }
        codec::unmarshal(&bytes)
    }

    async fn lookup(&self, record_ref: &RecordRef) -> Result<RecordMeta> {
        Self::check_ref(record_ref)?;
        let (_, manifest) = self.backend.resolve_manifest(&record_ref.cid).await?;
        meta_from_annotations(&record_ref.cid, &manifest.annotations)
    }

    async fn delete(&self, record_ref: &RecordRef) -> Result<()> {
        Self::check_ref(record_ref)?;
        let (desc, manifest) = self.backend.resolve_manifest(&record_ref.cid).await?;

        if let Err(e) = self
            .backend
            .delete_manifest(&desc.digest, Some(&record_ref.cid))
            .await
        {
            warn!("deleting manifest for {}: {e}", record_ref.cid);
        }

        if self.backend.deletes_blobs() {
            for layer in manifest.layers.iter().chain(Some(&manifest.config)) {
                if let Err(e) = self.backend.delete_blob(&layer.digest).await {
                    warn!("deleting blob {}: {e}", layer.digest);
                }
            }
        }
        Ok(())
    }

    async fn push_referrer(&self, cid: &str, referrer: &Referrer) -> Result<()> {
        if cid.is_empty() {
            return Err(Error::invalid("empty cid"));
        }
        if referrer.referrer_type.is_empty() {
            return Err(Error::invalid("empty referrer type"));
        }

        // Subject must exist before anything attaches to it.
        let (subject_desc, _) = self.backend.resolve_manifest(cid).await?;

        let media_type = referrer_media_type(&referrer.referrer_type);
        let mut layer_annotations = Default::default();

        match referrer.referrer_type.as_str() {
            REFERRER_TYPE_SIGNATURE => {
                if let Some(signer) = &self.signer {
                    let value = referrer
                        .annotations
                        .get(REFERRER_ANNOTATION_SIGNATURE)
                        .map(String::as_str)
                        .unwrap_or_default();
                    signer.attach(cid, value, &referrer.data)?;
                }
                layer_annotations = referrer
                    .annotations
                    .get(REFERRER_ANNOTATION_SIGNATURE)
                    .map(|sig| {
                        std::collections::BTreeMap::from([(
                            ANNOTATION_COSIGN_SIGNATURE.to_string(),
                            sig.clone(),
                        )])
                    })
                    .unwrap_or_default();
            }
            REFERRER_TYPE_PUBLIC_KEY => {
                if let Some(endpoint) = &self.key_endpoint {
                    endpoint.accept_key(&referrer.data).await?;
                }
            }
            _ => {}
        }

        let blob = if media_type == MEDIA_TYPE_REFERRER_JSON {
            serde_json::to_vec(referrer).map_err(Error::internal)?
        } else {
            referrer.data.clone()
        };
        let mut layer = self.backend.push_blob(media_type, &blob).await?;
        layer.annotations = layer_annotations;

        let config = self.backend.push_blob(MEDIA_TYPE_EMPTY_CONFIG, b"{}").await?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            artifact_type: Some(media_type.to_string()),
            config,
            layers: vec![layer],
            subject: Some(subject_desc),
            annotations: referrer_annotations(referrer),
        };
        self.backend.put_manifest(&manifest, None).await?;
        Ok(())
    }

    async fn walk_referrers(
        &self,
        cid: &str,
        type_filter: Option<&str>,
        visit: ReferrerVisitor<'_>,
    ) -> Result<()> {
        if cid.is_empty() {
            return Err(Error::invalid("empty cid"));
        }
        let (subject_desc, _) = self.backend.resolve_manifest(cid).await?;
        let media_filter = type_filter.map(referrer_media_type);

        let referrers = self
            .backend
            .referrers(&subject_desc.digest, media_filter)
            .await?;
        for (_, manifest) in referrers {
            let referrer = match reconstitute(&manifest, self).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unreadable referrer on {cid}: {e}");
                    continue;
                }
            };
            if let Some(filter) = type_filter {
                if referrer.referrer_type != filter {
                    continue;
                }
            }
            visit(referrer)?;
        }
        Ok(())
    }
}

async fn reconstitute<B: RegistryBackend>(
    manifest: &ImageManifest,
    store: &OciStore<B>,
) -> Result<Referrer> {
    let layer: &Descriptor = manifest
        .layers
        .first()
        .ok_or_else(|| Error::integrity("referrer manifest has no layers"))?;
    let blob = store.backend.fetch_blob(&layer.digest).await?;

    if layer.media_type == MEDIA_TYPE_REFERRER_JSON {
        let mut referrer: Referrer = serde_json::from_slice(&blob).map_err(Error::internal)?;
        // Manifest annotations are authoritative for type and timestamps.
        if let Some(t) = manifest.annotations.get(ANNOTATION_REFERRER_TYPE) {
            referrer.referrer_type = t.clone();
        }
        return Ok(referrer);
    }

    let mut annotations = custom_annotations(&manifest.annotations);
    if layer.media_type == MEDIA_TYPE_COSIGN_SIMPLESIGNING {
        if let Some(sig) = layer.annotations.get(ANNOTATION_COSIGN_SIGNATURE) {
            annotations.insert(REFERRER_ANNOTATION_SIGNATURE.to_string(), sig.clone());
        }
    }
    Ok(Referrer {
        referrer_type: manifest
            .annotations
            .get(ANNOTATION_REFERRER_TYPE)
            .cloned()
            .unwrap_or_default(),
        data: blob,
        annotations,
        created_at: manifest
            .annotations
            .get(ANNOTATION_REFERRER_CREATED_AT)
            .cloned()
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LocalLayout;
    use agent_dir_core::record::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn store_at(path: &std::path::Path) -> OciStore<LocalLayout> {
        OciStore::new(LocalLayout::open(path).unwrap())
    }

    fn test_record(name: &str) -> Record {
        Record::V1(RecordV1 {
            schema_version: "v0.3.1".into(),
            name: name.into(),
            version: "v1.0.0".into(),
            description: "A test agent".into(),
            created_at: "2025-03-18T10:00:00Z".into(),
            authors: vec!["Acme".into()],
            skills: vec![SkillV1 {
                category: "nlp".into(),
                class: "summarization".into(),
            }],
            locators: vec![Locator {
                locator_type: "docker-image".into(),
                url: "https://example.org/agents/test".into(),
            }],
            extensions: vec![],
            signature: None,
            annotations: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn test_push_pull_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record = test_record("test-agent");
        let record_ref = store.push(&record).await.unwrap();
        assert_eq!(record_ref.cid, record.cid().unwrap());

        let pulled = store.pull(&record_ref).await.unwrap();
        assert_eq!(pulled, record);
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record = test_record("test-agent");
        let first = store.push(&record).await.unwrap();
        let second = store.push(&record).await.unwrap();
        assert_eq!(first, second);

        let meta = store.lookup(&first).await.unwrap();
        assert_eq!(meta.cid, first.cid);
    }

    #[tokio::test]
    async fn test_lookup_meta_fields() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record_ref = store.push(&test_record("test-agent")).await.unwrap();
        let meta = store.lookup(&record_ref).await.unwrap();
        assert_eq!(meta.schema_version, "v0.3.1");
        assert_eq!(meta.annotations["name"], "test-agent");
        assert_eq!(meta.annotations["skills"], "nlp/summarization");
        assert_eq!(meta.annotations["locator-types"], "docker-image");
    }

    #[tokio::test]
    async fn test_pull_unknown_cid_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        let missing = RecordRef::new("baeareig77vqcdozl2wyk6z3cscaj5q5fggi53aoh64fewkdiri3cdauyn4");
        assert!(matches!(
            store.pull(&missing).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_ref_is_invalid() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        assert!(matches!(
            store.lookup(&RecordRef::new("")).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_makes_record_unreachable() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record_ref = store.push(&test_record("test-agent")).await.unwrap();
        store.delete(&record_ref).await.unwrap();
        assert!(matches!(
            store.lookup(&record_ref).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_referrer_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record_ref = store.push(&test_record("test-agent")).await.unwrap();
        let referrer = Referrer {
            referrer_type: REFERRER_TYPE_SIGNATURE.into(),
            data: br#"{"critical":{}}"#.to_vec(),
            annotations: BTreeMap::from([(
                REFERRER_ANNOTATION_SIGNATURE.to_string(),
                "MEUCIQexample".to_string(),
            )]),
            created_at: "2025-03-18T10:05:00Z".into(),
        };
        store.push_referrer(&record_ref.cid, &referrer).await.unwrap();

        let mut seen = Vec::new();
        store
            .walk_referrers(&record_ref.cid, Some(REFERRER_TYPE_SIGNATURE), &mut |r| {
                seen.push(r);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].referrer_type, REFERRER_TYPE_SIGNATURE);
        assert_eq!(seen[0].data, referrer.data);
        assert_eq!(
            seen[0].annotations[REFERRER_ANNOTATION_SIGNATURE],
            "MEUCIQexample"
        );
    }

    #[tokio::test]
    async fn test_referrer_requires_existing_subject() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        let referrer = Referrer {
            referrer_type: REFERRER_TYPE_PUBLIC_KEY.into(),
            data: b"-----BEGIN PUBLIC KEY-----".to_vec(),
            annotations: BTreeMap::new(),
            created_at: String::new(),
        };
        assert!(matches!(
            store
                .push_referrer("baeareig77vqcdozl2wyk6z3cscaj5q5fggi53aoh64fewkdiri3cdauyn4", &referrer)
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_referrer_type_filter() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        let record_ref = store.push(&test_record("test-agent")).await.unwrap();
        let key = Referrer {
            referrer_type: REFERRER_TYPE_PUBLIC_KEY.into(),
            data: b"-----BEGIN PUBLIC KEY-----".to_vec(),
            annotations: BTreeMap::new(),
            created_at: String::new(),
        };
        store.push_referrer(&record_ref.cid, &key).await.unwrap();

        let mut signatures = 0;
        store
            .walk_referrers(&record_ref.cid, Some(REFERRER_TYPE_SIGNATURE), &mut |_| {
                signatures += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(signatures, 0);

        let mut keys = 0;
        store
            .walk_referrers(&record_ref.cid, Some(REFERRER_TYPE_PUBLIC_KEY), &mut |_| {
                keys += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(keys, 1);
    }
}
