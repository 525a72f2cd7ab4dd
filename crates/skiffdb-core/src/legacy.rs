use std::fmt;

use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::version::{SourceId, Version, VersionOrder};
use crate::version_vector::VersionVector;

/// A version vector and/or a legacy tree-based revision history; either may
/// be empty. When both are present the legacy history is older than every
/// version in the vector.
///
/// This is the bridge that lets a version-mode document keep replicating
/// with peers that still speak digest revision IDs: the last digest revID
/// travels behind the vector in `history` properties, and incoming mixed
/// histories are split back apart here.
#[derive(Debug, Clone, Default)]
pub struct VersionVectorWithLegacy {
    pub vector: VersionVector,
    /// Digest-form revision IDs in descending-generation order.
    pub legacy: Vec<RevId>,
}

impl VersionVectorWithLegacy {
    pub fn new(vector: VersionVector, legacy: Vec<RevId>) -> Self {
        let mut v = VersionVectorWithLegacy { vector, legacy };
        v.sort_legacy();
        v
    }

    /// Builds from a single revision ID of either form.
    pub fn from_rev_id(rev_id: &RevId) -> Self {
        match rev_id {
            RevId::Version(v) => VersionVectorWithLegacy {
                vector: VersionVector::from_current(*v),
                legacy: Vec::new(),
            },
            RevId::Digest { .. } => VersionVectorWithLegacy {
                vector: VersionVector::new(),
                legacy: vec![rev_id.clone()],
            },
        }
    }

    /// Parses a wire history: one string containing versions and/or legacy
    /// revIDs separated by `,`, with at most one `;` after a version, all
    /// versions strictly before all legacy revIDs — or a pre-split list of
    /// individual revision IDs.
    pub fn parse_history(history: &[&str], my_id: &SourceId) -> Result<Self> {
        if history.len() == 1 && history[0].contains([',', ';']) {
            return Self::parse_mixed(history[0], my_id);
        }
        let mut vector = VersionVector::new();
        let mut legacy = Vec::new();
        for (i, item) in history.iter().enumerate() {
            let rev: RevId = item.trim().parse()?;
            match rev {
                RevId::Version(v) => {
                    if !legacy.is_empty() {
                        return Err(Error::BadHistory(
                            "versions must precede legacy revisions".into(),
                        ));
                    }
                    let mut v = v;
                    if v.source() == my_id {
                        v = Version::new(v.time(), SourceId::ME);
                    }
                    if i == 0 {
                        vector = VersionVector::from_current(v);
                    } else {
                        // Ancestors arrive oldest-last; append keeps order.
                        vector = Self::append_ancestor(vector, v)?;
                    }
                }
                digest @ RevId::Digest { .. } => legacy.push(digest),
            }
        }
        Ok(Self::new(vector, legacy))
    }

    fn parse_mixed(list: &str, my_id: &SourceId) -> Result<Self> {
        // Split the vector part (up to and including any ';') from the tail,
        // then classify each tail token.
        let mut vector_part = String::new();
        let mut tail_tokens: Vec<&str> = Vec::new();
        if let Some(semi) = list.find(';') {
            vector_part = list[..=semi].to_string();
            tail_tokens = list[semi + 1..]
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect();
        } else {
            for tok in list.split(',').map(str::trim) {
                if tok.is_empty() {
                    return Err(Error::BadHistory(format!("empty item in '{list}'")));
                }
                if tok.contains('@') && tail_tokens.is_empty() {
                    if !vector_part.is_empty() {
                        vector_part.push_str(", ");
                    }
                    vector_part.push_str(tok);
                } else {
                    tail_tokens.push(tok);
                }
            }
        }
        let mut vector = VersionVector::parse_as(&vector_part, Some(my_id))?;
        let mut legacy = Vec::new();
        for tok in tail_tokens {
            match tok.parse::<RevId>()? {
                RevId::Version(v) => {
                    if !legacy.is_empty() {
                        return Err(Error::BadHistory(
                            "versions must precede legacy revisions".into(),
                        ));
                    }
                    let v = if v.source() == my_id {
                        Version::new(v.time(), SourceId::ME)
                    } else {
                        v
                    };
                    vector = Self::append_ancestor(vector, v)?;
                }
                digest @ RevId::Digest { .. } => legacy.push(digest),
            }
        }
        Ok(Self::new(vector, legacy))
    }

    fn append_ancestor(vector: VersionVector, v: Version) -> Result<VersionVector> {
        let ascii = if vector.is_empty() {
            v.to_string()
        } else {
            format!("{vector}, {v}")
        };
        VersionVector::parse(&ascii)
    }

    /// Sorts the legacy list into canonical descending-generation order.
    pub fn sort_legacy(&mut self) {
        self.legacy
            .sort_by(|a, b| b.generation().cmp(&a.generation()));
    }

    /// Compares two histories. The vector comparison dominates; the legacy
    /// chains act as a lower-significance dimension, and a legacy-only
    /// history equals a vector whose current version is the synthesized
    /// stand-in for that legacy revision.
    pub fn compare(a: &VersionVectorWithLegacy, b: &VersionVectorWithLegacy) -> VersionOrder {
        // One side never upgraded: its head legacy rev may equal the other
        // side's synthesized legacy version.
        let matching_legacy = |x: &Self, y: &Self| {
            x.vector.is_empty()
                && !x.legacy.is_empty()
                && !y.vector.is_empty()
                && x.legacy[0]
                    .generation()
                    .map(Version::legacy)
                    .as_ref()
                    == y.vector.get(0)
        };
        if matching_legacy(a, b) || matching_legacy(b, a) {
            return VersionOrder::Same;
        }

        let vector_order = extended_compare_vectors(&a.vector, &b.vector);
        let legacy_order = compare_legacy(&a.legacy, &b.legacy);
        combine_orders(vector_order, legacy_order)
    }

    /// Renders for a `history` property: `vector; legacy1, legacy2`.
    pub fn to_history_ascii(&self, my_id: &SourceId) -> String {
        let mut out = self.vector.to_ascii_as(Some(my_id));
        let mut delimiter: &str = if self.vector.is_empty() {
            ""
        } else if self.vector.current_versions() < self.vector.count() {
            ", "
        } else if self.vector.current_versions() == 1 {
            "; "
        } else {
            // Vector already ends with the merge-marking ';'.
            " "
        };
        for rev in &self.legacy {
            out.push_str(delimiter);
            out.push_str(&rev.to_string());
            delimiter = ", ";
        }
        out
    }
}

impl fmt::Display for VersionVectorWithLegacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_history_ascii(&SourceId::ME))
    }
}

/// Per-dimension result; `Empty` when neither side has data to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DimOrder {
    Empty,
    Same,
    Older,
    Newer,
    Conflicting,
}

fn extended_compare_vectors(a: &VersionVector, b: &VersionVector) -> DimOrder {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => DimOrder::Empty,
        (true, false) => DimOrder::Older,
        (false, true) => DimOrder::Newer,
        (false, false) => match a.compare_to(b) {
            VersionOrder::Same => DimOrder::Same,
            VersionOrder::Older => DimOrder::Older,
            VersionOrder::Newer => DimOrder::Newer,
            VersionOrder::Conflicting => DimOrder::Conflicting,
        },
    }
}

fn compare_legacy(a: &[RevId], b: &[RevId]) -> DimOrder {
    if a.is_empty() || b.is_empty() {
        return DimOrder::Empty;
    }
    if a[0] == b[0] {
        return DimOrder::Same;
    }
    if b.contains(&a[0]) {
        return DimOrder::Older;
    }
    if a.contains(&b[0]) {
        return DimOrder::Newer;
    }
    DimOrder::Conflicting
}

fn combine_orders(vector: DimOrder, legacy: DimOrder) -> VersionOrder {
    use DimOrder::*;
    if vector == Conflicting || legacy == Conflicting {
        return VersionOrder::Conflicting;
    }
    let merged = match (vector, legacy) {
        (Empty, l) => l,
        (v, Empty) => v,
        (Same, l) => l,
        (v, Same) => v,
        (v, l) if v == l => v,
        // The vector dimension wins when both sides have vectors; a
        // disagreement means divergent histories.
        _ => Conflicting,
    };
    match merged {
        Empty | Same => VersionOrder::Same,
        Older => VersionOrder::Older,
        Newer => VersionOrder::Newer,
        Conflicting => VersionOrder::Conflicting,
    }
}
