//! Query model and glob matching
//!
//! Queries select records by label dimension. String-valued dimensions (name,
//! version, and the value part of any structured label) are matched with an
//! anchored glob grammar: `*` matches any run (including `/`), `?` a single
//! character, and `[abc]`, `[a-z]`, `[^xyz]` character classes.

use crate::label::*;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};

/// Query dimension.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Name,
    Version,
    Skill,
    Locator,
    Domain,
    Module,
    Feature,
}

impl QueryType {
    /// Label key family this dimension selects on.
    pub fn label_prefix(&self) -> &'static str {
        match self {
            QueryType::Name => LABEL_PREFIX_NAME,
            QueryType::Version => LABEL_PREFIX_VERSION,
            QueryType::Skill => LABEL_PREFIX_SKILLS,
            QueryType::Locator => LABEL_PREFIX_LOCATORS,
            QueryType::Domain => LABEL_PREFIX_DOMAINS,
            QueryType::Module => LABEL_PREFIX_MODULES,
            QueryType::Feature => LABEL_PREFIX_FEATURES,
        }
    }
}

/// A single label predicate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordQuery {
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub value: String,
}

impl RecordQuery {
    pub fn new(query_type: QueryType, value: impl Into<String>) -> Self {
        Self {
            query_type,
            value: value.into(),
        }
    }

    /// Whether this predicate matches a single canonical label string.
    pub fn matches_label(&self, label: &str) -> bool {
        label
            .strip_prefix(self.query_type.label_prefix())
            .is_some_and(|value| glob_match(&self.value, value))
    }

    /// Whether this predicate matches any label in a record's label set.
    pub fn matches_any(&self, labels: &[String]) -> bool {
        labels.iter().any(|l| self.matches_label(l))
    }
}

/// Anchored glob match. Patterns without metacharacters short-circuit to
/// equality; unparseable patterns match nothing.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains(['*', '?', '[']) {
        return pattern == value;
    }
    // globset spells negated classes [!xyz]
    let normalized = pattern.replace("[^", "[!");
    match GlobBuilder::new(&normalized).build() {
        Ok(glob) => glob.compile_matcher().is_match(value),
        Err(_) => false,
    }
}

/// AND semantics: every query matches some label.
pub fn matches_all(queries: &[RecordQuery], labels: &[String]) -> bool {
    queries.iter().all(|q| q.matches_any(labels))
}

/// OR semantics with per-query counting: the score is the number of queries
/// matching at least one label. Returns the score and the matched subset.
pub fn match_score(queries: &[RecordQuery], labels: &[String]) -> (u32, Vec<RecordQuery>) {
    let matched: Vec<RecordQuery> = queries
        .iter()
        .filter(|q| q.matches_any(labels))
        .cloned()
        .collect();
    (matched.len() as u32, matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star_crosses_separators() {
        assert!(glob_match(
            "*cisco*",
            "directory.agntcy.org/cisco/marketing-strategy-v3"
        ));
    }

    #[test]
    fn test_glob_character_class_range() {
        assert!(glob_match("v[0-2].0.0", "v1.0.0"));
        assert!(!glob_match("v[0-2].0.0", "v3.0.0"));
    }

    #[test]
    fn test_glob_question_mark_is_single_char() {
        assert!(!glob_match(
            "directory.agntcy.org/cisco/marketing-strategy-v??",
            "directory.agntcy.org/cisco/marketing-strategy-v3"
        ));
        assert!(glob_match("v??", "v42"));
    }

    #[test]
    fn test_glob_negated_class() {
        assert!(glob_match("v[^3]", "v2"));
        assert!(!glob_match("v[^3]", "v3"));
    }

    #[test]
    fn test_literal_patterns_are_exact() {
        assert!(glob_match("planning", "planning"));
        assert!(!glob_match("planning", "planning-extra"));
    }

    #[test]
    fn test_query_matches_label_dimension() {
        let q = RecordQuery::new(QueryType::Skill, "nlp/*");
        assert!(q.matches_label("/skills/nlp/translation"));
        assert!(!q.matches_label("/modules/nlp/translation"));
    }

    #[test]
    fn test_match_score_counts_queries_not_labels() {
        let labels = vec![
            "/skills/planning".to_string(),
            "/skills/research".to_string(),
            "/locators/docker-image".to_string(),
        ];
        let queries = vec![
            RecordQuery::new(QueryType::Skill, "*"),
            RecordQuery::new(QueryType::Locator, "helm-chart"),
            RecordQuery::new(QueryType::Domain, "*"),
        ];
        let (score, matched) = match_score(&queries, &labels);
        assert_eq!(score, 1);
        assert_eq!(matched, vec![RecordQuery::new(QueryType::Skill, "*")]);
    }

    #[test]
    fn test_matches_all_intersection() {
        let labels = vec![
            "/skills/planning".to_string(),
            "/locators/docker-image".to_string(),
        ];
        let both = vec![
            RecordQuery::new(QueryType::Skill, "planning"),
            RecordQuery::new(QueryType::Locator, "docker-image"),
        ];
        let miss = vec![
            RecordQuery::new(QueryType::Skill, "planning"),
            RecordQuery::new(QueryType::Locator, "helm-chart"),
        ];
        assert!(matches_all(&both, &labels));
        assert!(!matches_all(&miss, &labels));
    }
}
