//! Remote registry backend over the OCI distribution API
//!
//! Speaks the distribution endpoints directly: monolithic blob upload
//! sessions, manifest put/get/delete, and the referrers listing. The HTTP
//! client is shared and safe for concurrent use across workers.

use crate::backend::RegistryBackend;
use crate::manifest::{
    Descriptor, ImageIndex, ImageManifest, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use agent_dir_core::cid::digest;
use agent_dir_core::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

/// Credentials for registries requiring basic auth.
#[derive(Clone, Debug)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

pub struct RemoteRegistry {
    client: Client,
    /// Registry origin, e.g. `https://registry.example.org`.
    base_url: String,
    /// Repository all records live under, e.g. `dir`.
    repository: String,
    credentials: Option<RegistryCredentials>,
}

impl RemoteRegistry {
    pub fn new(
        base_url: impl Into<String>,
        repository: impl Into<String>,
        credentials: Option<RegistryCredentials>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url, self.repository, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(c) => req.basic_auth(&c.username, Some(&c.password)),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Response> {
        self.authed(req)
            .send()
            .await
            .map_err(|e| Error::internal(format!("{what}: {e}")))
    }

    async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let resp = self
            .send(self.client.head(self.url(&format!("blobs/{digest}"))), "blob head")
            .await?;
        Ok(resp.status().is_success())
    }
}

fn unexpected(what: &str, status: StatusCode) -> Error {
    Error::internal(format!("{what} returned status {status}"))
}

#[async_trait]
impl RegistryBackend for RemoteRegistry {
    async fn push_blob(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor> {
        let d = digest(bytes)?.to_string();
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest: d.clone(),
            size: bytes.len() as u64,
            artifact_type: None,
            annotations: Default::default(),
        };
        if self.blob_exists(&d).await? {
            return Ok(descriptor);
        }

        let resp = self
            .send(self.client.post(self.url("blobs/uploads/")), "blob upload start")
            .await?;
        if resp.status() != StatusCode::ACCEPTED {
            return Err(unexpected("blob upload start", resp.status()));
        }
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::internal("blob upload start returned no location"))?
            .to_string();
        let upload_url = if location.starts_with("http") {
            location
        } else {
            format!("{}{}", self.base_url, location)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };

        let resp = self
            .send(
                self.client
                    .put(format!("{upload_url}{separator}digest={d}"))
                    .header("content-type", "application/octet-stream")
                    .body(bytes.to_vec()),
                "blob upload",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(unexpected("blob upload", resp.status()));
        }
        Ok(descriptor)
    }

    async fn fetch_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let resp = self
            .send(self.client.get(self.url(&format!("blobs/{digest}"))), "blob fetch")
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::not_found(format!("blob {digest}"))),
            s if s.is_success() => Ok(resp
                .bytes()
                .await
                .map_err(|e| Error::internal(format!("blob body: {e}")))?
                .to_vec()),
            s => Err(unexpected("blob fetch", s)),
        }
    }

    async fn put_manifest(
        &self,
        manifest: &ImageManifest,
        tag: Option<&str>,
    ) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(manifest).map_err(Error::internal)?;
        let d = digest(&bytes)?.to_string();
        // Untagged referrer manifests are pushed by digest.
        let reference = tag.map(str::to_string).unwrap_or_else(|| d.clone());

        let resp = self
            .send(
                self.client
                    .put(self.url(&format!("manifests/{reference}")))
                    .header("content-type", MEDIA_TYPE_IMAGE_MANIFEST)
                    .body(bytes.clone()),
                "manifest put",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(unexpected("manifest put", resp.status()));
        }
        Ok(Descriptor {
            media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            digest: d,
            size: bytes.len() as u64,
            artifact_type: None,
            annotations: Default::default(),
        })
    }

    async fn resolve_manifest(&self, tag: &str) -> Result<(Descriptor, ImageManifest)> {
        let resp = self
            .send(
                self.client
                    .get(self.url(&format!("manifests/{tag}")))
                    .header("accept", MEDIA_TYPE_IMAGE_MANIFEST),
                "manifest get",
            )
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(Error::not_found(format!("tag {tag}"))),
            s if !s.is_success() => return Err(unexpected("manifest get", s)),
            _ => {}
        }
        let header_digest = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::internal(format!("manifest body: {e}")))?;
        let d = match header_digest {
            Some(d) => d,
            None => digest(&bytes)?.to_string(),
        };
        let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(Error::internal)?;
        Ok((
            Descriptor {
                media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                digest: d,
                size: bytes.len() as u64,
                artifact_type: None,
                annotations: Default::default(),
            },
            manifest,
        ))
    }

    async fn fetch_manifest(&self, digest: &str) -> Result<ImageManifest> {
        let (_, manifest) = self.resolve_manifest(digest).await?;
        Ok(manifest)
    }

    async fn delete_manifest(&self, digest: &str, _tag: Option<&str>) -> Result<()> {
        // Tag cleanup is left to registry garbage collection.
        let resp = self
            .send(
                self.client.delete(self.url(&format!("manifests/{digest}"))),
                "manifest delete",
            )
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(unexpected("manifest delete", s)),
        }
    }

    async fn delete_blob(&self, digest: &str) -> Result<()> {
        let resp = self
            .send(
                self.client.delete(self.url(&format!("blobs/{digest}"))),
                "blob delete",
            )
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(unexpected("blob delete", s)),
        }
    }

    fn deletes_blobs(&self) -> bool {
        // Registries reclaim unreferenced blobs via garbage collection.
        false
    }

    async fn referrers(
        &self,
        digest: &str,
        artifact_type: Option<&str>,
    ) -> Result<Vec<(Descriptor, ImageManifest)>> {
        let mut url = self.url(&format!("referrers/{digest}"));
        if let Some(filter) = artifact_type {
            url.push_str(&format!("?artifactType={filter}"));
        }
        let resp = self
            .send(
                self.client.get(url).header("accept", MEDIA_TYPE_IMAGE_INDEX),
                "referrers list",
            )
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!("registry has no referrers endpoint for {digest}");
                return Ok(Vec::new());
            }
            s if !s.is_success() => return Err(unexpected("referrers list", s)),
            _ => {}
        }
        let index: ImageIndex = resp
            .json()
            .await
            .map_err(|e| Error::internal(format!("referrers body: {e}")))?;

        let mut out = Vec::new();
        for desc in index.manifests {
            match self.fetch_manifest(&desc.digest).await {
                Ok(manifest) => {
                    // The registry may have applied the filter already; check
                    // again for registries that ignore the parameter.
                    if let Some(filter) = artifact_type {
                        if manifest.artifact_type.as_deref() != Some(filter) {
                            continue;
                        }
                    }
                    out.push((desc, manifest));
                }
                Err(e) => debug!("skipping unreadable referrer {}: {e}", desc.digest),
            }
        }
        Ok(out)
    }
}
