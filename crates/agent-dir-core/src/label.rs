//! Canonical label derivation
//!
//! Labels are the routing index keys derived deterministically from a record.
//! The same record always yields the same ordered, duplicate-free label
//! sequence, on every peer.

use crate::record::Record;
use std::collections::HashSet;

/// Skill dimension prefix (`/skills/<skill>`).
pub const LABEL_PREFIX_SKILLS: &str = "/skills/";
/// Locator dimension prefix (`/locators/<locator-type>`).
pub const LABEL_PREFIX_LOCATORS: &str = "/locators/";
/// Domain dimension prefix (`/domains/<domain>`).
pub const LABEL_PREFIX_DOMAINS: &str = "/domains/";
/// Module dimension prefix (`/modules/<module-name>`).
pub const LABEL_PREFIX_MODULES: &str = "/modules/";
/// Feature dimension prefix (`/features/<module-name>/<module-version>`).
pub const LABEL_PREFIX_FEATURES: &str = "/features/";
/// Full-text name dimension prefix (`/name/<name>`).
pub const LABEL_PREFIX_NAME: &str = "/name/";
/// Full-text version dimension prefix (`/version/<version>`).
pub const LABEL_PREFIX_VERSION: &str = "/version/";

/// Derive the ordered, duplicate-free label sequence for a record.
///
/// Dimension order is fixed: skills, locators, domains, modules, features,
/// then the full-text name and version keys. A module emits a feature label
/// only when it declares a version (`/features/<name>/<version>`).
pub fn record_labels(record: &Record) -> Vec<String> {
    let mut labels = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |label: String| {
        if seen.insert(label.clone()) {
            labels.push(label);
        }
    };

    for skill in record.skill_names() {
        push(format!("{LABEL_PREFIX_SKILLS}{skill}"));
    }
    for locator in record.locators() {
        push(format!("{LABEL_PREFIX_LOCATORS}{}", locator.locator_type));
    }
    for domain in record.domains() {
        push(format!("{LABEL_PREFIX_DOMAINS}{}", domain.name));
    }
    for module in record.modules() {
        push(format!("{LABEL_PREFIX_MODULES}{}", module.name));
        if let Some(version) = &module.version {
            push(format!("{LABEL_PREFIX_FEATURES}{}/{version}", module.name));
        }
    }
    push(format!("{LABEL_PREFIX_NAME}{}", record.name()));
    push(format!("{LABEL_PREFIX_VERSION}{}", record.version()));

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::*;
    use std::collections::BTreeMap;

    fn sample() -> Record {
        Record::V3(RecordV3 {
            schema_version: "v0.5.0".into(),
            name: "directory.example.org/acme/planner".into(),
            version: "v2.1.0".into(),
            description: String::new(),
            created_at: String::new(),
            authors: vec![],
            skills: vec![
                SkillV2 {
                    name: "planning".into(),
                },
                SkillV2 {
                    name: "planning".into(),
                },
            ],
            domains: vec![Domain {
                name: "research".into(),
            }],
            locators: vec![Locator {
                locator_type: "docker-image".into(),
                url: "https://example.org/planner".into(),
            }],
            modules: vec![
                Module {
                    name: "runtime/language".into(),
                    version: Some("v1".into()),
                },
                Module {
                    name: "memory".into(),
                    version: None,
                },
            ],
            previous_record_cid: None,
            signature: None,
            annotations: BTreeMap::new(),
        })
    }

    #[test]
    fn test_label_dimensions_and_order() {
        let labels = record_labels(&sample());
        assert_eq!(
            labels,
            vec![
                "/skills/planning",
                "/locators/docker-image",
                "/domains/research",
                "/modules/runtime/language",
                "/features/runtime/language/v1",
                "/modules/memory",
                "/name/directory.example.org/acme/planner",
                "/version/v2.1.0",
            ]
        );
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let labels = record_labels(&sample());
        let unique: HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }

    #[test]
    fn test_v1_hierarchical_skills() {
        let record = Record::V1(RecordV1 {
            schema_version: "v0.3.1".into(),
            name: "a".into(),
            version: "v1".into(),
            description: String::new(),
            created_at: String::new(),
            authors: vec![],
            skills: vec![SkillV1 {
                category: "nlp".into(),
                class: "translation".into(),
            }],
            locators: vec![],
            extensions: vec![],
            signature: None,
            annotations: BTreeMap::new(),
        });
        assert!(record_labels(&record)
            .iter()
            .any(|l| l == "/skills/nlp/translation"));
    }
}
