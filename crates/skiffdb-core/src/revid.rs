use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::varint::{read_uvarint, write_uvarint};
use crate::version::Version;

/// Longest digest accepted in a digest-form revision ID, in bytes.
const MAX_DIGEST_LEN: usize = 42;

/// A revision identifier, in one of two disjoint forms.
///
/// - *Digest form* (`12-cafebabe`): a generation count and a content digest,
///   produced by tree-versioned documents and older peers.
/// - *Version form* (`1b2c3@SOURCE`): the current version of a version
///   vector.
///
/// The two forms never compare equal and cannot be converted into each
/// other. In binary, a version form always starts with a zero byte while a
/// digest form starts with a nonzero generation varint, so stored blobs can
/// be classified without a tag.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum RevId {
    Digest { generation: u32, digest: Vec<u8> },
    Version(Version),
}

impl RevId {
    pub fn digest_form(generation: u32, digest: impl Into<Vec<u8>>) -> Self {
        RevId::Digest {
            generation,
            digest: digest.into(),
        }
    }

    pub fn is_version(&self) -> bool {
        matches!(self, RevId::Version(_))
    }

    /// The generation count, for digest-form IDs only.
    pub fn generation(&self) -> Option<u32> {
        match self {
            RevId::Digest { generation, .. } => Some(*generation),
            RevId::Version(_) => None,
        }
    }

    pub fn as_version(&self) -> Option<&Version> {
        match self {
            RevId::Version(v) => Some(v),
            RevId::Digest { .. } => None,
        }
    }

    /// Total order within a form; `None` across forms.
    ///
    /// Digest forms order by generation then raw digest bytes; version forms
    /// by ascending logical time. Used as the final tie-break when selecting
    /// a tree's current revision.
    pub fn compare(&self, other: &RevId) -> Option<Ordering> {
        match (self, other) {
            (
                RevId::Digest { generation: g1, digest: d1 },
                RevId::Digest { generation: g2, digest: d2 },
            ) => Some(g1.cmp(g2).then_with(|| d1.cmp(d2))),
            (RevId::Version(v1), RevId::Version(v2)) => {
                Some(Version::ascending_times(v1, v2))
            }
            _ => None,
        }
    }

    pub fn to_binary(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            RevId::Digest { generation, digest } => {
                write_uvarint(&mut buf, u64::from(*generation));
                buf.extend_from_slice(digest);
            }
            RevId::Version(v) => v.write_binary(&mut buf, true),
        }
        buf
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            None => Err(Error::CorruptRevisionData("empty revision id".into())),
            Some(0) => {
                let mut slice = bytes;
                let (version, _current) = Version::read_binary(&mut slice)?;
                Ok(RevId::Version(version))
            }
            Some(_) => {
                let mut slice = bytes;
                let generation = read_uvarint(&mut slice)
                    .ok_or_else(|| Error::CorruptRevisionData("bad generation varint".into()))?;
                if generation == 0 || generation > u64::from(u32::MAX) {
                    return Err(Error::CorruptRevisionData("bad generation".into()));
                }
                if slice.is_empty() || slice.len() > MAX_DIGEST_LEN {
                    return Err(Error::CorruptRevisionData("bad digest length".into()));
                }
                Ok(RevId::Digest {
                    generation: generation as u32,
                    digest: slice.to_vec(),
                })
            }
        }
    }

    /// Like equality, except two version forms also match when their current
    /// versions are equal even if rendered differently.
    pub fn is_equivalent_to(&self, other: &RevId) -> bool {
        if self == other {
            return true;
        }
        matches!((self, other), (RevId::Version(a), RevId::Version(b)) if a == b)
    }
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 2 == 0
        && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((gen_str, digest_str)) = s.split_once('-') {
            let generation: u32 = gen_str
                .parse()
                .map_err(|_| Error::BadRevisionId(format!("bad generation in '{s}'")))?;
            if generation == 0 {
                return Err(Error::BadRevisionId(format!("zero generation in '{s}'")));
            }
            if !is_lower_hex(digest_str) || digest_str.len() / 2 > MAX_DIGEST_LEN {
                return Err(Error::BadRevisionId(format!("bad digest in '{s}'")));
            }
            let digest = (0..digest_str.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&digest_str[i..i + 2], 16).unwrap())
                .collect();
            Ok(RevId::Digest { generation, digest })
        } else {
            Ok(RevId::Version(Version::parse(s)?))
        }
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevId::Digest { generation, digest } => {
                write!(f, "{generation}-")?;
                for b in digest {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            RevId::Version(v) => write!(f, "{v}"),
        }
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::SourceId;

    #[test]
    fn parses_digest_form() {
        let rev: RevId = "12-cafebabe".parse().unwrap();
        assert_eq!(rev.generation(), Some(12));
        assert_eq!(rev.to_string(), "12-cafebabe");
        assert!(!rev.is_version());
    }

    #[test]
    fn parses_version_form() {
        let rev: RevId = "1b2@*".parse().unwrap();
        assert!(rev.is_version());
        assert_eq!(rev.as_version().unwrap().time(), 0x1b2);
        assert_eq!(rev.to_string(), "1b2@*");
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!("0-aa".parse::<RevId>().is_err()); // generation must be ≥ 1
        assert!("1-".parse::<RevId>().is_err()); // empty digest
        assert!("1-AB".parse::<RevId>().is_err()); // uppercase
        assert!("1-aB".parse::<RevId>().is_err()); // mixed case
        assert!("1-abc".parse::<RevId>().is_err()); // odd length
        assert!("x-ab".parse::<RevId>().is_err());
        assert!("nope".parse::<RevId>().is_err());
    }

    #[test]
    fn digest_and_version_never_equal() {
        let d: RevId = "1-aa".parse().unwrap();
        let v: RevId = "1@*".parse().unwrap();
        assert_ne!(d, v);
        assert_eq!(d.compare(&v), None);
        assert!(!d.is_equivalent_to(&v));
    }

    #[test]
    fn digest_ordering() {
        let a: RevId = "1-aa".parse().unwrap();
        let b: RevId = "2-00".parse().unwrap();
        let c: RevId = "2-ff".parse().unwrap();
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(b.compare(&c), Some(Ordering::Less));
        assert_eq!(c.compare(&c), Some(Ordering::Equal));
    }

    #[test]
    fn version_ordering_by_time() {
        let a = RevId::Version(Version::new(5, SourceId::random()));
        let b = RevId::Version(Version::new(9, SourceId::random()));
        assert_eq!(a.compare(&b), Some(Ordering::Less));
    }

    #[test]
    fn binary_classification() {
        let d: RevId = "3-beef".parse().unwrap();
        let bin = d.to_binary();
        assert_ne!(bin[0], 0);
        assert_eq!(RevId::from_binary(&bin).unwrap(), d);

        let v: RevId = "1b2@*".parse().unwrap();
        let bin = v.to_binary();
        assert_eq!(bin[0], 0);
        assert_eq!(RevId::from_binary(&bin).unwrap(), v);
    }

    #[test]
    fn binary_rejects_garbage() {
        assert!(RevId::from_binary(&[]).is_err());
        assert!(RevId::from_binary(&[0x01]).is_err()); // generation, no digest
        assert!(RevId::from_binary(&[0x00, 0x07]).is_err()); // bad version flag
    }
}
