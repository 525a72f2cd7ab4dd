use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::clock::HybridClock;
use crate::error::{Error, Result};
use crate::version::{SourceId, Version, VersionOrder};

/// A version vector: versions in reverse chronological order, more or less.
///
/// The first version is the **current** one identifying the document's
/// revision; the remainder are ancestors that once were current. The first
/// `n_current` entries are current-or-merged: after a conflict merge the two
/// losing current versions stay at the front, flagged, so that two vectors
/// produced by merging the same conflict can recognize each other.
///
/// Invariant: at most one version per source.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    versions: Vec<Version>,
    n_current: usize,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn count(&self) -> usize {
        self.versions.len()
    }

    pub fn get(&self, i: usize) -> Option<&Version> {
        self.versions.get(i)
    }

    /// The current version. Empty vectors have none.
    pub fn current(&self) -> Option<&Version> {
        self.versions.first()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Number of leading current-or-merged versions; > 1 means this vector
    /// is the direct result of a conflict merge.
    pub fn current_versions(&self) -> usize {
        self.n_current
    }

    pub fn is_merge(&self) -> bool {
        self.n_current > 1
    }

    /// The merged conflicting versions of a merge vector (usually two).
    pub fn merged_versions(&self) -> &[Version] {
        if self.is_merge() {
            &self.versions[1..self.n_current]
        } else {
            &[]
        }
    }

    /// True if both vectors are merges of the same conflicting versions.
    pub fn merges_same_versions(&self, other: &VersionVector) -> bool {
        if !self.is_merge() || !other.is_merge() {
            return false;
        }
        let mut mine: Vec<&Version> = self.merged_versions().iter().collect();
        let mut theirs: Vec<&Version> = other.merged_versions().iter().collect();
        mine.sort_by(|a, b| Version::ascending_times(a, b));
        theirs.sort_by(|a, b| Version::ascending_times(a, b));
        mine == theirs
    }

    /// The logical time recorded for `source`, or 0 if absent.
    pub fn time_of(&self, source: &SourceId) -> u64 {
        self.versions
            .iter()
            .find(|v| v.source() == source)
            .map(Version::time)
            .unwrap_or(0)
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.time_of(source) != 0
    }

    // ---- Comparison -------------------------------------------------------

    /// Componentwise comparison: `Older` iff every source's time here is ≤
    /// the other's and at least one is strictly less; symmetric for `Newer`;
    /// identical per-source times are `Same`; anything else `Conflicting`.
    pub fn compare_to(&self, other: &VersionVector) -> VersionOrder {
        let mut some_less = false;
        let mut some_greater = false;
        for v in &self.versions {
            let theirs = other.time_of(v.source());
            if v.time() > theirs {
                some_greater = true;
            } else if v.time() < theirs {
                some_less = true;
            }
        }
        for v in &other.versions {
            if !self.contains(v.source()) {
                some_less = true;
            }
        }
        match (some_less, some_greater) {
            (false, false) => VersionOrder::Same,
            (true, false) => VersionOrder::Older,
            (false, true) => VersionOrder::Newer,
            (true, true) => VersionOrder::Conflicting,
        }
    }

    /// Compares against a single version, as if it were a one-entry vector's
    /// current version. Never returns `Conflicting`.
    pub fn compare_to_version(&self, version: &Version) -> VersionOrder {
        let mine = self.time_of(version.source());
        if mine == version.time() {
            if self.count() == 1 {
                VersionOrder::Same
            } else {
                VersionOrder::Newer
            }
        } else if mine > version.time() {
            VersionOrder::Newer
        } else {
            VersionOrder::Older
        }
    }

    /// Is this vector newer than `other` when entries for `ignoring` are
    /// disregarded? Used by the conflict tie-break.
    pub fn is_newer_ignoring(&self, ignoring: &SourceId, other: &VersionVector) -> bool {
        other.versions.iter().all(|v| {
            v.source() == ignoring || self.time_of(v.source()) >= v.time()
        }) && self
            .versions
            .iter()
            .any(|v| v.source() != ignoring && v.time() > other.time_of(v.source()))
    }

    // ---- Mutation ---------------------------------------------------------

    /// Updates/creates the version for `source` with a time from the clock,
    /// strictly greater than any time already recorded for it, and moves it
    /// to the front. Resets the merge marking.
    pub fn add_new_version(&mut self, clock: &HybridClock, source: SourceId) {
        let prev = self.time_of(&source);
        if prev != 0 {
            clock.see(prev);
        }
        let time = clock.now();
        self.remove_source(&source);
        self.versions.insert(0, Version::new(time, source));
        self.n_current = 1;
    }

    /// Adds a version to the front, making it current. Fails if an equal or
    /// newer version by the same source is already present.
    pub fn add(&mut self, version: Version) -> Result<()> {
        if self.time_of(version.source()) >= version.time() {
            return Err(Error::BadRevisionId(format!(
                "version {version} is not newer than the vector"
            )));
        }
        self.remove_source(version.source());
        self.versions.insert(0, version);
        self.n_current = 1;
        Ok(())
    }

    fn remove_source(&mut self, source: &SourceId) {
        self.versions.retain(|v| v.source() != source);
    }

    /// Drops the oldest non-current versions until at most `max_count`
    /// remain or every remaining ancestor is at least as new as `before`.
    pub fn prune(&mut self, max_count: usize, before: u64) {
        let floor = self.n_current.max(1).min(self.versions.len());
        while self.versions.len() > max_count.max(floor) {
            // Ancestors are ordered newest-first, so scan from the back.
            let oldest = (floor..self.versions.len())
                .rev()
                .min_by_key(|&i| self.versions[i].time());
            match oldest {
                Some(i) if self.versions[i].time() < before => {
                    self.versions.remove(i);
                }
                _ => break,
            }
        }
    }

    /// Ratchets `clock` past this vector's times so newly minted versions
    /// dominate it. With `anyone` false only local-sentinel entries count.
    pub fn update_clock(&self, clock: &HybridClock, anyone: bool) -> bool {
        self.versions
            .iter()
            .filter(|v| anyone || v.source().is_me())
            .all(|v| clock.see(v.time()))
    }

    /// Replaces the local sentinel with a concrete source ID.
    pub fn make_absolute(&mut self, my_id: &SourceId) {
        self.replace_source(&SourceId::ME, my_id);
    }

    /// Replaces a concrete source ID with the local sentinel.
    pub fn make_local(&mut self, my_id: &SourceId) {
        self.replace_source(my_id, &SourceId::ME);
    }

    fn replace_source(&mut self, from: &SourceId, to: &SourceId) {
        for v in &mut self.versions {
            if v.source() == from {
                *v = Version::new(v.time(), *to);
            }
        }
    }

    pub fn is_absolute(&self) -> bool {
        !self.contains(&SourceId::ME)
    }

    // ---- Merging ----------------------------------------------------------

    /// Merges two conflicting vectors. Every source in either input appears
    /// with the larger of the two times; the two pre-merge current versions
    /// sit behind a freshly minted local version and are flagged as merges.
    /// Commutative modulo version order.
    pub fn merge(a: &VersionVector, b: &VersionVector, clock: &HybridClock) -> VersionVector {
        let max_time = |s: &SourceId| a.time_of(s).max(b.time_of(s));
        // Front: the conflicting current versions, raised to the max time
        // recorded for their source in either input.
        let fronts: Vec<Version> = match (a.current(), b.current()) {
            (Some(ca), Some(cb)) if ca.source() == cb.source() => {
                vec![Version::new(max_time(ca.source()), *ca.source())]
            }
            (Some(ca), Some(cb)) => vec![
                Version::new(max_time(ca.source()), *ca.source()),
                Version::new(max_time(cb.source()), *cb.source()),
            ],
            (Some(c), None) | (None, Some(c)) => {
                vec![Version::new(max_time(c.source()), *c.source())]
            }
            (None, None) => vec![],
        };
        let me_in_fronts = fronts.iter().any(|f| f.source().is_me());
        let n_merged = fronts.len();
        let mut merged = VersionVector {
            versions: fronts,
            n_current: n_merged,
        };
        for v in a.versions.iter().chain(b.versions.iter()) {
            if merged.time_of(v.source()) == 0 {
                merged
                    .versions
                    .push(Version::new(max_time(v.source()), *v.source()));
            }
        }
        let _ = a.update_clock(clock, false);
        let _ = b.update_clock(clock, false);
        merged.add_new_version(clock, SourceId::ME);
        merged.n_current = 1 + n_merged - usize::from(me_in_fronts);
        merged
    }

    // ---- Deltas -----------------------------------------------------------

    /// Expresses the change from `base` to `self`, such that
    /// `base.by_applying_delta(d) == self`. `None` unless `self ≥ base`.
    pub fn delta_from(&self, base: &VersionVector) -> Option<VersionVector> {
        match self.compare_to(base) {
            VersionOrder::Same => Some(VersionVector::new()),
            VersionOrder::Newer => {
                let versions: Vec<Version> = self
                    .versions
                    .iter()
                    .filter(|v| v.time() > base.time_of(v.source()))
                    .copied()
                    .collect();
                let n_current = self
                    .versions
                    .iter()
                    .take(self.n_current)
                    .filter(|v| v.time() > base.time_of(v.source()))
                    .count()
                    .max(1)
                    .min(versions.len());
                Some(VersionVector { versions, n_current })
            }
            _ => None,
        }
    }

    /// Applies a delta produced by [`delta_from`](Self::delta_from). Each
    /// delta version adds or overwrites its source; untouched sources carry
    /// over.
    pub fn by_applying_delta(&self, delta: &VersionVector) -> Result<VersionVector> {
        if delta.is_empty() {
            return Ok(self.clone());
        }
        let mut versions = delta.versions.clone();
        for v in &self.versions {
            if delta.time_of(v.source()) == 0 {
                versions.push(*v);
            } else if delta.time_of(v.source()) < v.time() {
                return Err(Error::BadRevisionId(
                    "delta is older than its base".into(),
                ));
            }
        }
        Ok(VersionVector {
            versions,
            n_current: delta.n_current,
        })
    }

    // ---- Serialization ----------------------------------------------------

    /// ASCII form `v1, v2; v3, v4`: the `;` separates the current/merged
    /// prefix from the ancestors. A trailing `;` marks a merge vector with
    /// no ancestors. `my_id`, when given, substitutes for the `*` sentinel.
    pub fn to_ascii_as(&self, my_id: Option<&SourceId>) -> String {
        let mut out = String::new();
        for (i, v) in self.versions.iter().enumerate() {
            if i > 0 {
                out.push_str(if i == self.n_current { "; " } else { ", " });
            }
            match my_id {
                Some(id) => out.push_str(&v.to_ascii_as(id)),
                None => out.push_str(&v.to_string()),
            }
        }
        if self.n_current > 1 && self.n_current == self.versions.len() {
            out.push(';');
        }
        out
    }

    pub fn parse(ascii: &str) -> Result<Self> {
        Self::parse_as(ascii, None)
    }

    /// Parses, rewriting occurrences of `my_id` (when given) to the local
    /// sentinel.
    pub fn parse_as(ascii: &str, my_id: Option<&SourceId>) -> Result<Self> {
        let mut versions = Vec::new();
        let mut n_current = None;
        let trimmed = ascii.trim();
        if trimmed.is_empty() {
            return Ok(VersionVector::new());
        }
        let mut rest = trimmed;
        loop {
            let split = rest.find([',', ';']);
            let (tok, delim) = match split {
                Some(i) => (&rest[..i], rest.as_bytes()[i]),
                None => (rest, 0),
            };
            let tok = tok.trim();
            if !tok.is_empty() {
                let mut v = Version::parse(tok)?;
                if let Some(id) = my_id
                    && v.source() == id
                {
                    v = Version::new(v.time(), SourceId::ME);
                }
                if versions.iter().any(|e: &Version| e.source() == v.source()) {
                    return Err(Error::BadRevisionId(format!(
                        "duplicate source in vector '{ascii}'"
                    )));
                }
                versions.push(v);
            } else if delim != 0 || versions.is_empty() {
                return Err(Error::BadRevisionId(format!("empty version in '{ascii}'")));
            }
            if delim == b';' {
                if n_current.is_some() {
                    return Err(Error::BadRevisionId(format!(
                        "multiple ';' in vector '{ascii}'"
                    )));
                }
                n_current = Some(versions.len());
            }
            match split {
                Some(i) => rest = &rest[i + 1..],
                None => break,
            }
            if rest.trim().is_empty() {
                break;
            }
        }
        let n_current = n_current.unwrap_or(usize::from(!versions.is_empty()));
        if n_current == 0 && !versions.is_empty() {
            return Err(Error::BadRevisionId(format!("bad ';' in vector '{ascii}'")));
        }
        Ok(VersionVector { versions, n_current })
    }

    pub fn to_binary(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, v) in self.versions.iter().enumerate() {
            v.write_binary(&mut buf, i < self.n_current);
        }
        buf
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let mut versions = Vec::new();
        let mut n_current = 0;
        let mut slice = bytes;
        while !slice.is_empty() {
            let (v, current) = Version::read_binary(&mut slice)?;
            if current {
                if versions.len() != n_current {
                    return Err(Error::CorruptRevisionData(
                        "current versions are not a prefix".into(),
                    ));
                }
                n_current += 1;
            }
            versions.push(v);
        }
        Ok(VersionVector { versions, n_current })
    }

    /// Builds a single-version vector (e.g. from a version-form revision ID).
    pub fn from_current(version: Version) -> Self {
        VersionVector {
            versions: vec![version],
            n_current: 1,
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ascii_as(None))
    }
}

impl fmt::Debug for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionVector({self})")
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionVector::parse(&s).map_err(D::Error::custom)
    }
}
