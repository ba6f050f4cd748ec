//! Local OCI image-layout backend
//!
//! Directory layout: `oci-layout` marker, `blobs/sha256/<hex>` for blobs and
//! manifests alike, and `index.json` listing every manifest. Record manifests
//! carry their CID tag as the standard ref-name annotation; referrer
//! manifests are listed untagged and found by scanning for a matching
//! subject.

use crate::backend::RegistryBackend;
use crate::manifest::{
    Descriptor, ImageIndex, ImageManifest, ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_MANIFEST,
};
use agent_dir_core::cid::digest;
use agent_dir_core::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const LAYOUT_MARKER: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs/sha256";

#[derive(Serialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: &'static str,
}

/// Filesystem-backed registry. All blob and index IO is synchronous and
/// small; the index lock is never held across an await point.
pub struct LocalLayout {
    root: PathBuf,
    index: Mutex<ImageIndex>,
}

impl LocalLayout {
    /// Open (or initialize) a layout directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOBS_DIR)).map_err(Error::internal)?;

        let marker = root.join(LAYOUT_MARKER);
        if !marker.exists() {
            let body = serde_json::to_vec(&LayoutMarker {
                image_layout_version: "1.0.0",
            })
            .map_err(Error::internal)?;
            fs::write(&marker, body).map_err(Error::internal)?;
        }

        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            let bytes = fs::read(&index_path).map_err(Error::internal)?;
            serde_json::from_slice(&bytes).map_err(Error::internal)?
        } else {
            ImageIndex::empty()
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex_part = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::invalid(format!("unexpected digest form {digest}")))?;
        Ok(self.root.join(BLOBS_DIR).join(hex_part))
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index).map_err(Error::internal)?;
        fs::write(self.root.join(INDEX_FILE), bytes).map_err(Error::internal)
    }

    fn store_bytes(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor> {
        let d = digest(bytes)?.to_string();
        let path = self.blob_path(&d)?;
        if !path.exists() {
            fs::write(&path, bytes).map_err(Error::internal)?;
        }
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest: d,
            size: bytes.len() as u64,
            artifact_type: None,
            annotations: Default::default(),
        })
    }
}

#[async_trait]
impl RegistryBackend for LocalLayout {
    async fn push_blob(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor> {
        self.store_bytes(media_type, bytes)
    }

    async fn fetch_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|_| Error::not_found(format!("blob {digest}")))
    }

    async fn put_manifest(
        &self,
        manifest: &ImageManifest,
        tag: Option<&str>,
    ) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(manifest).map_err(Error::internal)?;
        let mut desc = self.store_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &bytes)?;

        let mut index = self.index.lock();
        if let Some(tag) = tag {
            // A tag points at exactly one manifest.
            index
                .manifests
                .retain(|m| m.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) != Some(tag));
            desc.annotations
                .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
        }
        if !index.manifests.iter().any(|m| m.digest == desc.digest) {
            index.manifests.push(desc.clone());
        }
        self.write_index(&index)?;
        Ok(desc)
    }

    async fn resolve_manifest(&self, tag: &str) -> Result<(Descriptor, ImageManifest)> {
        let desc = {
            let index = self.index.lock();
            index
                .manifests
                .iter()
                .find(|m| m.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) == Some(tag))
                .cloned()
        }
        .ok_or_else(|| Error::not_found(format!("tag {tag}")))?;
        let manifest = self.fetch_manifest(&desc.digest).await?;
        Ok((desc, manifest))
    }

    async fn fetch_manifest(&self, digest: &str) -> Result<ImageManifest> {
        let bytes = self.fetch_blob(digest).await?;
        serde_json::from_slice(&bytes).map_err(Error::internal)
    }

    async fn delete_manifest(&self, digest: &str, _tag: Option<&str>) -> Result<()> {
        {
            let mut index = self.index.lock();
            index.manifests.retain(|m| m.digest != digest);
            self.write_index(&index)?;
        }
        let path = self.blob_path(digest)?;
        if path.exists() {
            fs::remove_file(&path).map_err(Error::internal)?;
        }
        Ok(())
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest)?;
        if path.exists() {
            fs::remove_file(&path).map_err(Error::internal)?;
        }
        Ok(())
    }

    fn deletes_blobs(&self) -> bool {
        true
    }

    async fn referrers(
        &self,
        digest: &str,
        artifact_type: Option<&str>,
    ) -> Result<Vec<(Descriptor, ImageManifest)>> {
        let candidates: Vec<Descriptor> = self.index.lock().manifests.clone();
        let mut out = Vec::new();
        for desc in candidates {
            let manifest = match self.fetch_manifest(&desc.digest).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("skipping unreadable manifest {}: {e}", desc.digest);
                    continue;
                }
            };
            let subject_matches = manifest
                .subject
                .as_ref()
                .is_some_and(|s| s.digest == digest);
            if !subject_matches {
                continue;
            }
            if let Some(filter) = artifact_type {
                if manifest.artifact_type.as_deref() != Some(filter) {
                    continue;
                }
            }
            out.push((desc, manifest));
        }
        Ok(out)
    }
}
