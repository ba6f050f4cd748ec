//! Content identifier derivation
//!
//! CIDs are CIDv1 with a fixed codec over a SHA2-256 multihash, rendered as a
//! base32 multibase string. SHA2-256 is the only admitted algorithm; digests
//! and CIDs round-trip losslessly in both directions.

use crate::error::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Multicodec code carried by every directory CID.
pub const CID_CODEC: u64 = 0x01;
/// Multihash code for SHA2-256.
pub const MULTIHASH_SHA2_256: u64 = 0x12;
/// Byte length of a SHA2-256 digest.
pub const SHA2_256_LEN: usize = 32;

const DIGEST_PREFIX: &str = "sha256:";

/// A SHA2-256 record digest. Text form is `sha256:<hex>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordDigest(pub [u8; SHA2_256_LEN]);

impl fmt::Display for RecordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", DIGEST_PREFIX, hex::encode(self.0))
    }
}

impl RecordDigest {
    /// Parse the `sha256:<hex>` text form.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(DIGEST_PREFIX).ok_or_else(|| {
            Error::UnsupportedAlgorithm(format!("digest {s} is not sha256-prefixed"))
        })?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| Error::invalid(format!("digest {s}: {e}")))?;
        let arr: [u8; SHA2_256_LEN] = bytes
            .try_into()
            .map_err(|_| Error::invalid(format!("digest {s} has wrong length")))?;
        Ok(RecordDigest(arr))
    }
}

/// Digest arbitrary bytes with SHA2-256. Empty input is rejected.
pub fn digest(bytes: &[u8]) -> Result<RecordDigest> {
    if bytes.is_empty() {
        return Err(Error::invalid("cannot digest empty input"));
    }
    Ok(RecordDigest(Sha256::digest(bytes).into()))
}

/// Render a digest as its CIDv1 base32 string.
pub fn digest_to_cid(d: &RecordDigest) -> String {
    let mh = Multihash::<64>::wrap(MULTIHASH_SHA2_256, &d.0)
        .expect("a 32-byte digest always fits a 64-byte multihash");
    Cid::new_v1(CID_CODEC, mh).to_string()
}

/// Recover the SHA2-256 digest from a CID string.
pub fn cid_to_digest(s: &str) -> Result<RecordDigest> {
    if s.is_empty() {
        return Err(Error::invalid("empty cid"));
    }
    let c = Cid::try_from(s).map_err(|e| Error::invalid(format!("cid {s}: {e}")))?;
    if c.hash().code() != MULTIHASH_SHA2_256 {
        return Err(Error::UnsupportedAlgorithm(format!(
            "cid {s} uses multihash code {:#x}, expected sha2-256",
            c.hash().code()
        )));
    }
    let arr: [u8; SHA2_256_LEN] = c
        .hash()
        .digest()
        .try_into()
        .map_err(|_| Error::invalid(format!("cid {s} carries a truncated digest")))?;
    Ok(RecordDigest(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Literal vectors shared with other-language implementations.
    const HELLO_DIGEST: &str =
        "sha256:dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";
    const HELLO_CID: &str = "baeareig77vqcdozl2wyk6z3cscaj5q5fggi53aoh64fewkdiri3cdauyn4";

    #[test]
    fn test_digest_hello_world() {
        let d = digest(b"Hello, World!").unwrap();
        assert_eq!(d.to_string(), HELLO_DIGEST);
    }

    #[test]
    fn test_digest_to_cid_vector() {
        let d = RecordDigest::parse(HELLO_DIGEST).unwrap();
        assert_eq!(digest_to_cid(&d), HELLO_CID);
    }

    #[test]
    fn test_digest_empty_input() {
        assert!(matches!(
            digest(b"").unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_roundtrip_digest_cid_digest() {
        let d = digest(b"roundtrip").unwrap();
        let back = cid_to_digest(&digest_to_cid(&d)).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn test_roundtrip_cid_digest_cid() {
        let d = cid_to_digest(HELLO_CID).unwrap();
        assert_eq!(digest_to_cid(&d), HELLO_CID);
    }

    #[test]
    fn test_non_sha256_digest_rejected() {
        assert!(matches!(
            RecordDigest::parse("sha512:00ff").unwrap_err(),
            Error::UnsupportedAlgorithm(_)
        ));
    }

    #[test]
    fn test_non_sha256_cid_rejected() {
        // CIDv1 with a sha3-256 multihash (code 0x16).
        let mh = Multihash::<64>::wrap(0x16, &[0u8; 32]).unwrap();
        let other = Cid::new_v1(CID_CODEC, mh).to_string();
        assert!(matches!(
            cid_to_digest(&other).unwrap_err(),
            Error::UnsupportedAlgorithm(_)
        ));
    }

    #[test]
    fn test_garbage_cid_rejected() {
        assert!(cid_to_digest("not-a-cid").is_err());
        assert!(cid_to_digest("").is_err());
    }
}
