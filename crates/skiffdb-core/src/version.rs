use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::varint::{read_uvarint, write_uvarint};

/// Result of comparing two versions or version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Same,
    Older,
    Newer,
    Conflicting,
}

/// Opaque 20-byte identifier of a database participating in version-vector
/// replication.
///
/// The all-zero value is the sentinel meaning "this device"; it renders as
/// `*` in ASCII and is rewritten to the database's concrete ID before a
/// vector goes over the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub [u8; 20]);

impl SourceId {
    /// Sentinel for the local database.
    pub const ME: SourceId = SourceId([0; 20]);

    /// Reserved source used when synthesizing a version from a legacy
    /// digest-form revision ID.
    pub const LEGACY: SourceId = SourceId(*b"legacy\0\0\0\0\0\0\0\0\0\0\0\0\0\0");

    /// Derives a source ID from a database UUID.
    pub fn from_uuid(uuid: &Uuid) -> Self {
        let digest = Sha1::digest(uuid.as_bytes());
        SourceId(digest.into())
    }

    pub fn random() -> Self {
        Self::from_uuid(&Uuid::new_v4())
    }

    pub fn is_me(&self) -> bool {
        *self == Self::ME
    }

    pub fn parse(ascii: &str) -> Result<Self> {
        if ascii == "*" {
            return Ok(Self::ME);
        }
        let bytes = STANDARD_NO_PAD
            .decode(ascii)
            .map_err(|_| Error::BadRevisionId(format!("bad source id '{ascii}'")))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::BadRevisionId(format!("source id '{ascii}' is not 20 bytes")))?;
        Ok(SourceId(arr))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_me() {
            write!(f, "*")
        } else {
            write!(f, "{}", STANDARD_NO_PAD.encode(self.0))
        }
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({self})")
    }
}

/// One `(source, logical time)` entry of a version vector.
///
/// ASCII form is `HEXTIME@SOURCE`, e.g. `1772f87a8b20001@ZmFr…` or
/// `1772f87a8b20001@*` for the local device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    source: SourceId,
    time: u64,
}

impl Version {
    pub fn new(time: u64, source: SourceId) -> Self {
        Version { source, time }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    /// Synthesizes a version standing in for a legacy digest-form revision:
    /// the generation becomes the logical time, under the reserved legacy
    /// source. Deterministic, so every peer derives the same version.
    pub fn legacy(generation: u32) -> Self {
        Version::new(u64::from(generation), SourceId::LEGACY)
    }

    /// Tie-break ordering used for revision-ID comparison: ascending logical
    /// time, source as a final disambiguator.
    pub fn ascending_times(a: &Version, b: &Version) -> std::cmp::Ordering {
        a.time
            .cmp(&b.time)
            .then_with(|| a.source.cmp(&b.source))
    }

    pub fn parse(ascii: &str) -> Result<Self> {
        let (time_str, source_str) = ascii
            .split_once('@')
            .ok_or_else(|| Error::BadRevisionId(format!("'{ascii}' is not a version")))?;
        if time_str.is_empty()
            || time_str.len() > 16
            || !time_str.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(Error::BadRevisionId(format!("bad logical time in '{ascii}'")));
        }
        let time = u64::from_str_radix(time_str, 16)
            .map_err(|_| Error::BadRevisionId(format!("bad logical time in '{ascii}'")))?;
        if time == 0 {
            return Err(Error::BadRevisionId(format!("zero logical time in '{ascii}'")));
        }
        let source = SourceId::parse(source_str)?;
        Ok(Version { source, time })
    }

    /// Writes the binary form. The leading zero byte distinguishes versions
    /// and vectors from digest-form revision IDs, whose first byte is a
    /// varint of a generation ≥ 1.
    pub fn write_binary(&self, out: &mut Vec<u8>, current: bool) {
        out.push(0);
        out.push(u8::from(current));
        write_uvarint(out, self.time);
        out.extend_from_slice(&self.source.0);
    }

    /// Reads one binary version from the front of `bytes`, advancing the
    /// slice. Returns the version and its `current` flag.
    pub fn read_binary(bytes: &mut &[u8]) -> Result<(Self, bool)> {
        let corrupt = || Error::CorruptRevisionData("truncated binary version".into());
        if bytes.first() != Some(&0) {
            return Err(Error::CorruptRevisionData("missing version marker".into()));
        }
        let current = match bytes.get(1) {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(corrupt()),
        };
        *bytes = &bytes[2..];
        let time = read_uvarint(bytes).ok_or_else(corrupt)?;
        if time == 0 {
            return Err(Error::CorruptRevisionData("zero logical time".into()));
        }
        if bytes.len() < 20 {
            return Err(corrupt());
        }
        let mut source = [0u8; 20];
        source.copy_from_slice(&bytes[..20]);
        *bytes = &bytes[20..];
        Ok((
            Version {
                source: SourceId(source),
                time,
            },
            current,
        ))
    }

    /// Renders with `my_id` substituted for the local sentinel, for sharing
    /// with a peer.
    pub fn to_ascii_as(&self, my_id: &SourceId) -> String {
        let source = if self.source.is_me() { my_id } else { &self.source };
        format!("{:x}@{}", self.time, source)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}@{}", self.time, self.source)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(D::Error::custom)
    }
}
