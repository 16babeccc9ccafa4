//! Canonical feature model for one browsing session.
//!
//! The model is a tree keyed by stable identifiers at every level:
//!
//! ```text
//! FeatureContext
//!   └── Alignment            (one per aligned genome)
//!         └── Block          (one contiguous mapped region)
//!               └── FeatureSet
//!                     └── Feature
//! ```
//!
//! The tree grows by merge and shrinks only through explicit erase; both live
//! in [`merge`]. `BTreeMap` keys keep iteration deterministic, which keeps
//! diffs and tests deterministic too.

pub mod merge;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, ViewError};

pub use merge::MergeDiff;

// =============================================================================
// Region
// =============================================================================

/// The sequence region a view is looking at.
///
/// Coordinates are 1-based and inclusive. `end == 0` means "to the end of the
/// sequence" (the extent is not yet known).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub sequence_name: String,
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(sequence_name: impl Into<String>, start: u64, end: u64) -> Result<Self> {
        let region = Self {
            sequence_name: sequence_name.into(),
            start,
            end,
        };
        region.validate()?;
        Ok(region)
    }

    /// `start > 0` and `end == 0 or end >= start`.
    pub fn validate(&self) -> Result<()> {
        if self.sequence_name.is_empty() {
            return Err(ViewError::InvalidRegion {
                name: self.sequence_name.clone(),
                start: self.start,
                end: self.end,
                reason: "empty sequence name".to_string(),
            });
        }
        if self.start == 0 {
            return Err(ViewError::InvalidRegion {
                name: self.sequence_name.clone(),
                start: self.start,
                end: self.end,
                reason: "start must be positive".to_string(),
            });
        }
        if self.end != 0 && self.end < self.start {
            return Err(ViewError::InvalidRegion {
                name: self.sequence_name.clone(),
                start: self.start,
                end: self.end,
                reason: "end precedes start".to_string(),
            });
        }
        Ok(())
    }

    /// Whether the region has a known right edge (required for strand flips).
    pub fn is_bounded(&self) -> bool {
        self.end != 0
    }

    /// Mirror a coordinate across the region midpoint.
    ///
    /// Only meaningful on bounded regions; callers check `is_bounded` first.
    pub fn mirror(&self, coord: u64) -> u64 {
        self.start + self.end - coord
    }
}

// =============================================================================
// Spans and strands
// =============================================================================

/// 1-based inclusive coordinate span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start > 0 && self.end >= self.start
    }

    /// Mirror the span across a bounded region's midpoint.
    pub fn mirrored(&self, region: &Region) -> Span {
        Span {
            start: region.mirror(self.end),
            end: region.mirror(self.start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn flipped(self) -> Strand {
        match self {
            Strand::Forward => Strand::Reverse,
            Strand::Reverse => Strand::Forward,
        }
    }
}

// =============================================================================
// Feature tree
// =============================================================================

/// A single annotated feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub span: Span,
    pub strand: Strand,
    /// Name of the style used to draw this feature, if any.
    pub style: Option<String>,
    pub score: Option<f64>,
}

/// A named group of features drawn as one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub id: String,
    /// Default style for features in this set.
    pub style: Option<String>,
    pub features: BTreeMap<String, Feature>,
}

impl FeatureSet {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            style: None,
            features: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, feature: Feature) {
        self.features.insert(feature.id.clone(), feature);
    }
}

/// One contiguous mapped region of an alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub span: Span,
    pub feature_sets: BTreeMap<String, FeatureSet>,
}

impl Block {
    pub fn new(id: impl Into<String>, span: Span) -> Self {
        Self {
            id: id.into(),
            span,
            feature_sets: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, set: FeatureSet) {
        self.feature_sets.insert(set.id.clone(), set);
    }
}

/// One aligned genome within the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    pub id: String,
    pub blocks: BTreeMap<String, Block>,
}

impl Alignment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, block: Block) {
        self.blocks.insert(block.id.clone(), block);
    }
}

/// The merged feature model, or one per-source fragment of it.
///
/// Fragments arriving from workers use the same shape as the canonical model;
/// [`merge::merge`] folds a fragment in and reports the incremental diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContext {
    pub region: Region,
    pub alignments: BTreeMap<String, Alignment>,
    /// DNA for the region, once a sequence-capable source has supplied it.
    #[serde(skip)]
    pub dna: Option<Bytes>,
}

impl FeatureContext {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            alignments: BTreeMap::new(),
            dna: None,
        }
    }

    pub fn insert(&mut self, alignment: Alignment) {
        self.alignments.insert(alignment.id.clone(), alignment);
    }

    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty() && self.dna.is_none()
    }

    /// Total number of features across the whole tree.
    pub fn feature_count(&self) -> usize {
        self.alignments
            .values()
            .flat_map(|a| a.blocks.values())
            .flat_map(|b| b.feature_sets.values())
            .map(|s| s.features.len())
            .sum()
    }

    /// Look up a feature by its path through the tree.
    pub fn find_feature(
        &self,
        alignment: &str,
        block: &str,
        set: &str,
        feature: &str,
    ) -> Option<&Feature> {
        self.alignments
            .get(alignment)?
            .blocks
            .get(block)?
            .feature_sets
            .get(set)?
            .features
            .get(feature)
    }

    /// Flip the coordinate frame: mirror every span across the region
    /// midpoint and swap strands. DNA is reverse-complemented.
    ///
    /// Only legal on bounded regions.
    pub fn reverse_complement(&mut self) -> Result<()> {
        if !self.region.is_bounded() {
            return Err(ViewError::InvalidRegion {
                name: self.region.sequence_name.clone(),
                start: self.region.start,
                end: self.region.end,
                reason: "cannot reverse-complement an unbounded region".to_string(),
            });
        }
        let region = self.region.clone();
        for alignment in self.alignments.values_mut() {
            for block in alignment.blocks.values_mut() {
                block.span = block.span.mirrored(&region);
                for set in block.feature_sets.values_mut() {
                    for feature in set.features.values_mut() {
                        feature.span = feature.span.mirrored(&region);
                        feature.strand = feature.strand.flipped();
                    }
                }
            }
        }
        if let Some(dna) = self.dna.take() {
            let flipped: Vec<u8> = dna.iter().rev().map(|b| complement_base(*b)).collect();
            self.dna = Some(Bytes::from(flipped));
        }
        Ok(())
    }
}

fn complement_base(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        other => other,
    }
}

// =============================================================================
// Styles
// =============================================================================

/// Drawing style for a feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub name: String,
    pub fill_colour: Option<String>,
    pub border_colour: Option<String>,
    pub width: Option<f64>,
}

impl Style {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fill_colour: None,
            border_colour: None,
            width: None,
        }
    }
}

/// Style table keyed by style name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleSet {
    styles: BTreeMap<String, Style>,
}

impl StyleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, style: Style) {
        self.styles.insert(style.name.clone(), style);
    }

    pub fn get(&self, name: &str) -> Option<&Style> {
        self.styles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.styles.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.styles.keys()
    }

    /// Merge `other` in, preserving existing entries on name conflict.
    ///
    /// A source can add new named styles but never overwrites one already
    /// present from an earlier source. Returns how many styles were added.
    pub fn merge_preserving(&mut self, other: &StyleSet) -> usize {
        let mut added = 0;
        for (name, style) in &other.styles {
            if !self.styles.contains_key(name) {
                self.styles.insert(name.clone(), style.clone());
                added += 1;
            }
        }
        added
    }
}

// =============================================================================
// Tests
// =============================================================================
