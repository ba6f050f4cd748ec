//! OCI image manifest model and the record annotation table
//!
//! Records are stored as single-layer OCI image manifests tagged with the
//! record CID. All record metadata surfaces as manifest annotations under the
//! `org.agntcy.dir/` prefix so a lookup costs one manifest round trip.

use agent_dir_core::{Error, Record, RecordMeta, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";
/// Record layers are plain canonical JSON.
pub const MEDIA_TYPE_RECORD_LAYER: &str = "application/json";

/// OCI-standard tag annotation used in layout indexes.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Prefix for every directory-owned manifest annotation.
pub const ANNOTATION_PREFIX: &str = "org.agntcy.dir/";

pub const ANNOTATION_TYPE: &str = "org.agntcy.dir/type";
pub const ANNOTATION_CID: &str = "org.agntcy.dir/cid";
pub const ANNOTATION_NAME: &str = "org.agntcy.dir/name";
pub const ANNOTATION_VERSION: &str = "org.agntcy.dir/version";
pub const ANNOTATION_DESCRIPTION: &str = "org.agntcy.dir/description";
pub const ANNOTATION_OASF_VERSION: &str = "org.agntcy.dir/oasf-version";
pub const ANNOTATION_SCHEMA_VERSION: &str = "org.agntcy.dir/schema-version";
pub const ANNOTATION_CREATED_AT: &str = "org.agntcy.dir/created-at";
pub const ANNOTATION_AUTHORS: &str = "org.agntcy.dir/authors";
pub const ANNOTATION_SKILLS: &str = "org.agntcy.dir/skills";
pub const ANNOTATION_LOCATOR_TYPES: &str = "org.agntcy.dir/locator-types";
pub const ANNOTATION_MODULE_NAMES: &str = "org.agntcy.dir/module-names";
pub const ANNOTATION_SIGNED: &str = "org.agntcy.dir/signed";
pub const ANNOTATION_SIGNATURE_ALGORITHM: &str = "org.agntcy.dir/signature-algorithm";
pub const ANNOTATION_SIGNED_AT: &str = "org.agntcy.dir/signed-at";
pub const ANNOTATION_PREVIOUS_CID: &str = "org.agntcy.dir/previous-cid";
pub const ANNOTATION_CUSTOM_PREFIX: &str = "org.agntcy.dir/custom.";

/// Manifest type marker for record manifests.
pub const MANIFEST_TYPE_RECORD: &str = "record";

// =============================================================================
// WIRE TYPES
// =============================================================================

/// OCI content descriptor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "artifactType")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// OCI image manifest (v1.1): single JSON layer for records, `subject` set
/// only on referrer manifests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "artifactType")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// OCI image index, used for the layout index file and referrers responses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn empty() -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_IMAGE_INDEX.to_string(),
            manifests: Vec::new(),
        }
    }
}

// =============================================================================
// ANNOTATION TABLE
// =============================================================================

/// Build the manifest annotation set for a record.
pub fn record_annotations(record: &Record, cid: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(ANNOTATION_TYPE.into(), MANIFEST_TYPE_RECORD.into());
    out.insert(ANNOTATION_CID.into(), cid.into());
    out.insert(ANNOTATION_NAME.into(), record.name().into());
    out.insert(ANNOTATION_VERSION.into(), record.version().into());
    out.insert(ANNOTATION_DESCRIPTION.into(), record.description().into());
    out.insert(ANNOTATION_OASF_VERSION.into(), record.schema_version().into());
    out.insert(ANNOTATION_SCHEMA_VERSION.into(), record.schema_version().into());
    out.insert(ANNOTATION_CREATED_AT.into(), record.created_at().into());
    out.insert(ANNOTATION_AUTHORS.into(), record.authors().join(","));
    out.insert(ANNOTATION_SKILLS.into(), record.skill_names().join(","));
    out.insert(
        ANNOTATION_LOCATOR_TYPES.into(),
        record
            .locators()
            .iter()
            .map(|l| l.locator_type.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    out.insert(
        ANNOTATION_MODULE_NAMES.into(),
        record
            .modules()
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    match record.signature() {
        Some(sig) => {
            out.insert(ANNOTATION_SIGNED.into(), "true".into());
            out.insert(ANNOTATION_SIGNATURE_ALGORITHM.into(), sig.algorithm.clone());
            out.insert(ANNOTATION_SIGNED_AT.into(), sig.signed_at.clone());
        }
        None => {
            out.insert(ANNOTATION_SIGNED.into(), "false".into());
        }
    }
    if let Some(prev) = record.previous_record_cid() {
        out.insert(ANNOTATION_PREVIOUS_CID.into(), prev.into());
    }
    for (k, v) in record.annotations() {
        out.insert(format!("{ANNOTATION_CUSTOM_PREFIX}{k}"), v.clone());
    }
    out
}

/// Parse manifest annotations back into a [`RecordMeta`].
///
/// A manifest without the `type` annotation is not something this directory
/// wrote and is reported as `Internal`.
pub fn meta_from_annotations(
    cid: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<RecordMeta> {
    match annotations.get(ANNOTATION_TYPE) {
        Some(t) if t == MANIFEST_TYPE_RECORD => {}
        Some(t) => {
            return Err(Error::internal(format!(
                "manifest for {cid} has unexpected type annotation {t:?}"
            )))
        }
        None => {
            return Err(Error::internal(format!(
                "manifest for {cid} has no type annotation"
            )))
        }
    }

    let mut meta = RecordMeta {
        cid: cid.to_string(),
        schema_version: annotations
            .get(ANNOTATION_SCHEMA_VERSION)
            .cloned()
            .unwrap_or_default(),
        created_at: annotations
            .get(ANNOTATION_CREATED_AT)
            .cloned()
            .unwrap_or_default(),
        annotations: BTreeMap::new(),
    };

    for (key, value) in annotations {
        let Some(stripped) = key.strip_prefix(ANNOTATION_PREFIX) else {
            continue;
        };
        match stripped {
            "type" | "cid" | "schema-version" | "oasf-version" | "created-at" => continue,
            _ => {
                meta.annotations.insert(stripped.to_string(), value.clone());
            }
        }
    }

    // Count-of counterparts for the comma-joined list fields.
    for list_key in ["authors", "skills", "locator-types", "module-names"] {
        let count = meta
            .annotations
            .get(list_key)
            .map(|v| {
                if v.is_empty() {
                    0
                } else {
                    v.split(',').count()
                }
            })
            .unwrap_or(0);
        meta.annotations
            .insert(format!("{list_key}-count"), count.to_string());
    }

    Ok(meta)
}
