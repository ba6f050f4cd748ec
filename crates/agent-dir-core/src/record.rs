//! Versioned agent descriptor records
//!
//! A record is an immutable, content-addressed description of a software
//! agent. Three schema generations coexist on the wire, distinguished by the
//! top-level `schema_version` string; every mutation of a record yields a new
//! record with a new CID.

use crate::cid::{digest, digest_to_cid};
use crate::codec::marshal;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// SHARED FIELD TYPES
// =============================================================================

/// Locator entry: where an agent can be reached or fetched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Locator {
    #[serde(rename = "type")]
    pub locator_type: String,
    pub url: String,
}

/// Module entry (called "extensions" in pre-v0.5.0 schemas).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Hierarchical skill taxonomy entry (V1 records only).
///
/// The canonical label string joins the two levels as `category/class`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillV1 {
    pub category: String,
    pub class: String,
}

/// Flat skill entry (V2/V3 records).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillV2 {
    pub name: String,
}

/// Domain tag (V2/V3 records).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub name: String,
}

/// Detached signature envelope embedded in a record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSignature {
    pub algorithm: String,
    pub signed_at: String,
    pub value: String,
}

// =============================================================================
// SCHEMA VARIANTS
// =============================================================================

// `created_at` and `signed_at` stay as verbatim strings: re-formatting a
// timestamp would change the canonical bytes and therefore the CID.

/// v0.3.x record schema.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordV1 {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<SkillV1>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locators: Vec<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Module>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RecordSignature>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// v0.4.x record schema. Skills flatten to plain names and domain tags appear.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordV2 {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<SkillV2>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<Domain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locators: Vec<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Module>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RecordSignature>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// v0.5.x record schema. Extensions are renamed to modules and a record may
/// point at the record it supersedes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordV3 {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<SkillV2>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<Domain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locators: Vec<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Module>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_record_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RecordSignature>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Union of the supported record schemas.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    V1(RecordV1),
    V2(RecordV2),
    V3(RecordV3),
}

static NO_DOMAINS: Vec<Domain> = Vec::new();
static NO_MODULES: Vec<Module> = Vec::new();

impl Record {
    pub fn schema_version(&self) -> &str {
        match self {
            Record::V1(r) => &r.schema_version,
            Record::V2(r) => &r.schema_version,
            Record::V3(r) => &r.schema_version,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Record::V1(r) => &r.name,
            Record::V2(r) => &r.name,
            Record::V3(r) => &r.name,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Record::V1(r) => &r.version,
            Record::V2(r) => &r.version,
            Record::V3(r) => &r.version,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Record::V1(r) => &r.description,
            Record::V2(r) => &r.description,
            Record::V3(r) => &r.description,
        }
    }

    pub fn created_at(&self) -> &str {
        match self {
            Record::V1(r) => &r.created_at,
            Record::V2(r) => &r.created_at,
            Record::V3(r) => &r.created_at,
        }
    }

    pub fn authors(&self) -> &[String] {
        match self {
            Record::V1(r) => &r.authors,
            Record::V2(r) => &r.authors,
            Record::V3(r) => &r.authors,
        }
    }

    /// Canonical skill names. V1 skills join `category/class`; V2/V3 skills
    /// are emitted verbatim.
    pub fn skill_names(&self) -> Vec<String> {
        match self {
            Record::V1(r) => r
                .skills
                .iter()
                .map(|s| format!("{}/{}", s.category, s.class))
                .collect(),
            Record::V2(r) => r.skills.iter().map(|s| s.name.clone()).collect(),
            Record::V3(r) => r.skills.iter().map(|s| s.name.clone()).collect(),
        }
    }

    pub fn locators(&self) -> &[Locator] {
        match self {
            Record::V1(r) => &r.locators,
            Record::V2(r) => &r.locators,
            Record::V3(r) => &r.locators,
        }
    }

    /// Module list, whatever the variant calls it on the wire.
    pub fn modules(&self) -> &[Module] {
        match self {
            Record::V1(r) => &r.extensions,
            Record::V2(r) => &r.extensions,
            Record::V3(r) => &r.modules,
        }
    }

    /// Domain tags. V1 records predate domains and return an empty slice.
    pub fn domains(&self) -> &[Domain] {
        match self {
            Record::V1(_) => &NO_DOMAINS,
            Record::V2(r) => &r.domains,
            Record::V3(r) => &r.domains,
        }
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        match self {
            Record::V1(r) => &r.annotations,
            Record::V2(r) => &r.annotations,
            Record::V3(r) => &r.annotations,
        }
    }

    pub fn signature(&self) -> Option<&RecordSignature> {
        match self {
            Record::V1(r) => r.signature.as_ref(),
            Record::V2(r) => r.signature.as_ref(),
            Record::V3(r) => r.signature.as_ref(),
        }
    }

    pub fn previous_record_cid(&self) -> Option<&str> {
        match self {
            Record::V3(r) => r.previous_record_cid.as_deref(),
            _ => None,
        }
    }

    /// Derive this record's CID from its canonical encoding.
    ///
    /// Equal canonical bytes always yield equal CIDs; records differing only
    /// in `schema_version` yield different CIDs.
    pub fn cid(&self) -> Result<String> {
        let bytes = marshal(self)?;
        Ok(digest_to_cid(&digest(&bytes)?))
    }
}

// =============================================================================
// REFERENCES AND METADATA
// =============================================================================

/// Sole external reference for push/pull/delete/routing operations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub cid: String,
}

impl RecordRef {
    pub fn new(cid: impl Into<String>) -> Self {
        Self { cid: cid.into() }
    }
}

/// Metadata surface without the full record blob, derived from manifest
/// annotations at pull/lookup time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecordMeta {
    pub cid: String,
    pub schema_version: String,
    pub created_at: String,
    /// Normalized fields (`name`, `version`, `skills`, `locator-types`,
    /// `module-names`, …) plus their count-of counterparts.
    pub annotations: BTreeMap<String, String>,
}

/// Typed artifact attached to a record as its registry subject.
///
/// A referrer's subject must exist at push time; deleting the subject makes
/// its referrers unreachable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Referrer {
    #[serde(rename = "type")]
    pub referrer_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub created_at: String,
}

/// Referrer type for cosign-style signatures.
pub const REFERRER_TYPE_SIGNATURE: &str = "agntcy.dir.sign.v1.Signature";
/// Referrer type for PEM public keys.
pub const REFERRER_TYPE_PUBLIC_KEY: &str = "agntcy.dir.sign.v1.PublicKey";
