//! Registry backend abstraction
//!
//! Two backends implement this trait: a local OCI image-layout directory and
//! a remote registry speaking the distribution API. The record store drives
//! either through the same calls; the cache decorates the store, not the
//! backend.

use crate::manifest::{Descriptor, ImageManifest};
use agent_dir_core::Result;
use async_trait::async_trait;

#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Store a blob under its SHA2-256 digest, returning its descriptor.
    /// Pushing the same bytes twice is a no-op.
    async fn push_blob(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor>;

    /// Fetch a blob by `sha256:<hex>` digest.
    async fn fetch_blob(&self, digest: &str) -> Result<Vec<u8>>;

    /// Store a manifest. When `tag` is set the manifest becomes resolvable
    /// by that tag; untagged manifests (referrers) are reachable only via the
    /// referrers listing or by digest.
    async fn put_manifest(&self, manifest: &ImageManifest, tag: Option<&str>)
        -> Result<Descriptor>;

    /// Resolve a manifest by tag in a single round trip.
    async fn resolve_manifest(&self, tag: &str) -> Result<(Descriptor, ImageManifest)>;

    /// Fetch a manifest by digest.
    async fn fetch_manifest(&self, digest: &str) -> Result<ImageManifest>;

    /// Delete a manifest by digest, dropping the tag when given.
    async fn delete_manifest(&self, digest: &str, tag: Option<&str>) -> Result<()>;

    /// Delete a blob by digest.
    async fn delete_blob(&self, digest: &str) -> Result<()>;

    /// Whether record deletion should also remove layer blobs. Remote
    /// registries reclaim unreferenced blobs through garbage collection and
    /// return `false` here.
    fn deletes_blobs(&self) -> bool;

    /// Enumerate manifests whose `subject` points at `digest`, optionally
    /// filtered by artifact type.
    async fn referrers(
        &self,
        digest: &str,
        artifact_type: Option<&str>,
    ) -> Result<Vec<(Descriptor, ImageManifest)>>;
}
