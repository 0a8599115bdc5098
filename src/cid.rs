/// Content identifier format and validation.
///
/// A CID is an opaque token: `Qm` followed by exactly 44 characters from
/// a 58-symbol base58-style alphabet (no `0`, `O`, `I` or `l`). Both the
/// live backend and the offline fallback produce identifiers in this shape,
/// so anything accepted here can be used as a download key.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Required identifier prefix.
pub const CID_PREFIX: &str = "Qm";

/// Number of alphabet characters following the prefix.
pub const CID_BODY_LEN: usize = 44;

/// Total identifier length.
pub const CID_LEN: usize = CID_PREFIX.len() + CID_BODY_LEN;

/// The 58-symbol alphabet identifiers are drawn from.
pub const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Check whether `cid` matches the identifier format exactly.
///
/// Pure and total: empty or malformed input returns `false`.
pub fn is_valid(cid: &str) -> bool {
    let Some(body) = cid.strip_prefix(CID_PREFIX) else {
        return false;
    };
    body.len() == CID_BODY_LEN && body.bytes().all(|b| ALPHABET.contains(&b))
}

/// A validated content identifier. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Parse and validate a CID string.
    pub fn parse(cid: &str) -> Result<Self> {
        if is_valid(cid) {
            Ok(Self(cid.to_string()))
        } else {
            Err(StoreError::Validation(cid.to_string()))
        }
    }

    /// Build from characters already known to satisfy the format.
    pub(crate) fn from_trusted(cid: String) -> Self {
        debug_assert!(is_valid(&cid));
        Self(cid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self> {
        if is_valid(&s) {
            Ok(Self(s))
        } else {
            Err(StoreError::Validation(s))
        }
    }
}

impl From<ContentId> for String {
    fn from(cid: ContentId) -> Self {
        cid.0
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";

    #[test]
    fn test_alphabet_excludes_ambiguous() {
        assert_eq!(ALPHABET.len(), 58);
        for c in [b'0', b'O', b'I', b'l'] {
            assert!(!ALPHABET.contains(&c));
        }
    }

    #[test]
    fn test_valid_cid() {
        assert_eq!(GOOD.len(), CID_LEN);
        assert!(is_valid(GOOD));
    }

    #[test]
    fn test_too_short() {
        assert!(!is_valid("Qm123"));
        assert!(!is_valid(""));
        assert!(!is_valid("Qm"));
    }

    #[test]
    fn test_wrong_prefix() {
        let swapped = format!("Qn{}", &GOOD[2..]);
        assert!(!is_valid(&swapped));
    }

    #[test]
    fn test_excluded_characters() {
        for bad in ['0', 'O', 'I', 'l', '-', ' '] {
            let cid = format!("{}{}", &GOOD[..45], bad);
            assert_eq!(cid.len(), CID_LEN);
            assert!(!is_valid(&cid), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_too_long() {
        assert!(!is_valid(&format!("{GOOD}a")));
    }

    #[test]
    fn test_multibyte_input_rejected() {
        let cid = format!("Qm{}é", &GOOD[2..45]);
        assert!(!is_valid(&cid));
    }

    #[test]
    fn test_content_id_parse() {
        let cid: ContentId = GOOD.parse().unwrap();
        assert_eq!(cid.as_str(), GOOD);
        assert!(matches!(
            ContentId::parse("Qm123"),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_content_id_serde() {
        let cid = ContentId::parse(GOOD).unwrap();
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{GOOD}\""));
        let back: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
        assert!(serde_json::from_str::<ContentId>("\"Qm123\"").is_err());
    }
}
