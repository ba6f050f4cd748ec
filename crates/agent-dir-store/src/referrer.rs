//! Referrer artifact packing
//!
//! Signatures and public keys attach to a record as subject-linked artifacts.
//! The external signing tool and the registry's key-acceptance endpoint are
//! collaborators consumed through the narrow traits below; when neither is
//! configured, referrers are still stored as plain subject-linked artifacts
//! so they remain walkable.

use agent_dir_core::{
    Referrer, Result, REFERRER_TYPE_PUBLIC_KEY, REFERRER_TYPE_SIGNATURE,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Cosign simple-signing payload media type.
pub const MEDIA_TYPE_COSIGN_SIMPLESIGNING: &str =
    "application/vnd.dev.cosign.simplesigning.v1+json";
/// PEM public key media type.
pub const MEDIA_TYPE_PEM: &str = "application/x-pem-file";
/// Generic referrer payload media type.
pub const MEDIA_TYPE_REFERRER_JSON: &str = "application/vnd.agntcy.dir.referrer.v1+json";

/// Referrer manifest annotations.
pub const ANNOTATION_REFERRER_TYPE: &str = "agntcy.dir.referrer.type";
pub const ANNOTATION_REFERRER_CREATED_AT: &str = "agntcy.dir.referrer.created_at";
pub const ANNOTATION_REFERRER_CUSTOM_PREFIX: &str = "agntcy.dir.referrer.annotation.";

/// Cosign layer annotation carrying the detached signature value.
pub const ANNOTATION_COSIGN_SIGNATURE: &str = "dev.cosignproject.cosign/signature";

/// Referrer annotation key under which the signature value travels in the
/// public [`Referrer`] type.
pub const REFERRER_ANNOTATION_SIGNATURE: &str = "signature";

/// Map a public referrer type to its layer media type.
pub fn referrer_media_type(referrer_type: &str) -> &'static str {
    match referrer_type {
        REFERRER_TYPE_SIGNATURE => MEDIA_TYPE_COSIGN_SIMPLESIGNING,
        REFERRER_TYPE_PUBLIC_KEY => MEDIA_TYPE_PEM,
        _ => MEDIA_TYPE_REFERRER_JSON,
    }
}

/// External signing tool. Consumed with the subject image reference, the
/// signature value, and the payload; credentials are the tool's concern.
pub trait SignatureAttacher: Send + Sync {
    fn attach(&self, image_ref: &str, signature: &str, payload: &[u8]) -> Result<()>;
}

/// Registry endpoint accepting public keys for server-side trust.
#[async_trait]
pub trait KeyTrustEndpoint: Send + Sync {
    async fn accept_key(&self, pem: &[u8]) -> Result<()>;
}

/// Build the manifest annotation set for a referrer.
pub fn referrer_annotations(referrer: &Referrer) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(
        ANNOTATION_REFERRER_TYPE.to_string(),
        referrer.referrer_type.clone(),
    );
    out.insert(
        ANNOTATION_REFERRER_CREATED_AT.to_string(),
        referrer.created_at.clone(),
    );
    for (k, v) in &referrer.annotations {
        out.insert(format!("{ANNOTATION_REFERRER_CUSTOM_PREFIX}{k}"), v.clone());
    }
    out
}

/// Recover the custom annotation map from referrer manifest annotations.
pub fn custom_annotations(manifest_annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    manifest_annotations
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(ANNOTATION_REFERRER_CUSTOM_PREFIX)
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_mapping() {
        assert_eq!(
            referrer_media_type(REFERRER_TYPE_SIGNATURE),
            MEDIA_TYPE_COSIGN_SIMPLESIGNING
        );
        assert_eq!(referrer_media_type(REFERRER_TYPE_PUBLIC_KEY), MEDIA_TYPE_PEM);
        assert_eq!(
            referrer_media_type("agntcy.dir.other.v1.Sbom"),
            MEDIA_TYPE_REFERRER_JSON
        );
    }

    #[test]
    fn test_annotation_roundtrip() {
        let referrer = Referrer {
            referrer_type: REFERRER_TYPE_SIGNATURE.into(),
            data: b"payload".to_vec(),
            annotations: BTreeMap::from([("key-id".to_string(), "kid-1".to_string())]),
            created_at: "2025-03-18T10:00:00Z".into(),
        };
        let manifest_annotations = referrer_annotations(&referrer);
        assert_eq!(
            manifest_annotations[ANNOTATION_REFERRER_TYPE],
            REFERRER_TYPE_SIGNATURE
        );
        let custom = custom_annotations(&manifest_annotations);
        assert_eq!(custom["key-id"], "kid-1");
    }
}
