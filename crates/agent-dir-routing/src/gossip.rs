//! Label announcement wire format
//!
//! Announcements travel on a single versioned gossip topic. The topic name,
//! the maximum message size, and the label cap are protocol constants, not
//! configuration: every peer on the network must agree on them.

use agent_dir_core::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The one label announcement topic.
pub const LABEL_TOPIC: &str = "dir/labels/v1";
/// Hard cap on an encoded announcement.
pub const MAX_ANNOUNCEMENT_BYTES: usize = 10 * 1024;
/// Hard cap on labels per announcement.
pub const MAX_ANNOUNCEMENT_LABELS: usize = 100;

/// Allowed clock skew for announcement timestamps.
const MAX_FUTURE_SKEW_MINUTES: i64 = 10;

/// JSON payload published per record publication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelAnnouncement {
    pub cid: String,
    pub peer_id: String,
    pub labels: Vec<String>,
    /// RFC3339 publication time, announcer's clock.
    pub timestamp: String,
}

impl LabelAnnouncement {
    pub fn new(cid: impl Into<String>, peer_id: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            cid: cid.into(),
            peer_id: peer_id.into(),
            labels,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Validate invariants shared by the publish and receive paths.
    pub fn validate(&self) -> Result<()> {
        if self.cid.is_empty() {
            return Err(Error::invalid("announcement has an empty cid"));
        }
        if self.peer_id.is_empty() {
            return Err(Error::invalid("announcement has an empty peer id"));
        }
        if self.labels.len() > MAX_ANNOUNCEMENT_LABELS {
            return Err(Error::invalid(format!(
                "announcement carries {} labels, cap is {MAX_ANNOUNCEMENT_LABELS}",
                self.labels.len()
            )));
        }
        let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| Error::invalid(format!("announcement timestamp: {e}")))?
            .into();
        if parsed > Utc::now() + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
            return Err(Error::invalid(format!(
                "announcement timestamp {} is in the future",
                self.timestamp
            )));
        }
        Ok(())
    }

    /// Validate and encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let bytes = serde_json::to_vec(self).map_err(Error::internal)?;
        if bytes.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(Error::invalid(format!(
                "announcement is {} bytes, cap is {MAX_ANNOUNCEMENT_BYTES}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode and validate a received payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(Error::invalid(format!(
                "announcement is {} bytes, cap is {MAX_ANNOUNCEMENT_BYTES}",
                bytes.len()
            )));
        }
        let announcement: LabelAnnouncement =
            serde_json::from_slice(bytes).map_err(|e| Error::invalid(format!("announcement: {e}")))?;
        announcement.validate()?;
        Ok(announcement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement() -> LabelAnnouncement {
        LabelAnnouncement::new(
            "baeareig77vqcdozl2wyk6z3cscaj5q5fggi53aoh64fewkdiri3cdauyn4",
            "12D3KooWExample",
            vec!["/skills/planning".to_string()],
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let a = announcement();
        let decoded = LabelAnnouncement::decode(&a.encode().unwrap()).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn test_empty_cid_rejected() {
        let mut a = announcement();
        a.cid.clear();
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_empty_peer_rejected() {
        let mut a = announcement();
        a.peer_id.clear();
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_label_cap_enforced() {
        let mut a = announcement();
        a.labels = (0..=MAX_ANNOUNCEMENT_LABELS)
            .map(|i| format!("/skills/s{i}"))
            .collect();
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let mut a = announcement();
        a.timestamp = (Utc::now() + Duration::hours(2)).to_rfc3339();
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_garbage_timestamp_rejected() {
        let mut a = announcement();
        a.timestamp = "yesterday".into();
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut a = announcement();
        // Few labels, each long enough to blow the byte cap without
        // tripping the label-count cap first.
        a.labels = (0..50).map(|i| format!("/name/{}{i}", "x".repeat(300))).collect();
        assert!(a.encode().is_err());
        let raw = serde_json::to_vec(&a).unwrap();
        assert!(LabelAnnouncement::decode(&raw).is_err());
    }
}
