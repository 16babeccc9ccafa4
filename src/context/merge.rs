//! Merge and diff engine for the canonical feature model.
//!
//! Merging is structurally additive: new alignments, blocks, feature sets and
//! features are added by identity; an identity collision with differing
//! content replaces the feature payload in place (the canonical keeps the
//! superseded container). Every merge reports the incremental diff so
//! consumers only redraw what changed.
//!
//! Validation runs before any mutation, so a rejected fragment leaves both
//! the canonical model and the diff untouched.

use bytes::Bytes;

use super::{Alignment, Block, Feature, FeatureContext, FeatureSet};
use crate::error::{Result, ViewError};

/// The incremental portion of the canonical model produced by one merge or
/// erase, handed to the rendering consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDiff {
    /// New or changed (for erase: removed) parts of the model. Containers
    /// appear only when needed to hold a changed child.
    pub context: FeatureContext,
    /// Set on the first-ever merge into an empty canonical: the diff covers
    /// the whole model and consumers must draw everything, not nothing.
    full_redraw: bool,
}

impl MergeDiff {
    fn empty(ctx: &FeatureContext) -> Self {
        Self {
            context: FeatureContext::new(ctx.region.clone()),
            full_redraw: false,
        }
    }

    /// A diff that covers the whole model (reverse-complement, first merge).
    pub(crate) fn full(context: FeatureContext) -> Self {
        Self {
            context,
            full_redraw: true,
        }
    }

    pub fn is_full_redraw(&self) -> bool {
        self.full_redraw
    }

    /// An empty diff means nothing new to render.
    pub fn is_empty(&self) -> bool {
        !self.full_redraw && self.context.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.context.feature_count()
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Fold `fragment` into `canonical`, returning the diff.
///
/// On a validation failure neither `canonical` nor any diff is produced; the
/// caller keeps rendering the model it already has.
pub fn merge(canonical: &mut FeatureContext, fragment: &FeatureContext) -> Result<MergeDiff> {
    validate_fragment(canonical, fragment)?;

    let first_merge = canonical.is_empty();
    let mut diff = MergeDiff::empty(canonical);

    for (align_id, fragment_align) in &fragment.alignments {
        match canonical.alignments.get_mut(align_id) {
            None => {
                canonical
                    .alignments
                    .insert(align_id.clone(), fragment_align.clone());
                if !first_merge {
                    diff.context
                        .alignments
                        .insert(align_id.clone(), fragment_align.clone());
                }
            }
            Some(canon_align) => {
                merge_alignment(canon_align, fragment_align, &mut diff, first_merge);
            }
        }
    }

    // First source to supply DNA wins; later sequences never overwrite it.
    if canonical.dna.is_none() {
        if let Some(dna) = &fragment.dna {
            canonical.dna = Some(dna.clone());
            if !first_merge {
                diff.context.dna = Some(dna.clone());
            }
        }
    }

    if first_merge && !canonical.is_empty() {
        diff.context = canonical.clone();
        diff.full_redraw = true;
    }
    Ok(diff)
}

fn merge_alignment(
    canon: &mut Alignment,
    fragment: &Alignment,
    diff: &mut MergeDiff,
    first_merge: bool,
) {
    let align_id = canon.id.clone();
    for (block_id, fragment_block) in &fragment.blocks {
        match canon.blocks.get_mut(block_id) {
            None => {
                canon.blocks.insert(block_id.clone(), fragment_block.clone());
                if !first_merge {
                    diff_alignment(diff, &align_id)
                        .blocks
                        .insert(block_id.clone(), fragment_block.clone());
                }
            }
            Some(canon_block) => {
                merge_block(&align_id, canon_block, fragment_block, diff, first_merge);
            }
        }
    }
}

fn merge_block(
    align_id: &str,
    canon: &mut Block,
    fragment: &Block,
    diff: &mut MergeDiff,
    first_merge: bool,
) {
    let block_id = canon.id.clone();
    let block_span = canon.span;
    for (set_id, fragment_set) in &fragment.feature_sets {
        match canon.feature_sets.get_mut(set_id) {
            None => {
                canon
                    .feature_sets
                    .insert(set_id.clone(), fragment_set.clone());
                if !first_merge {
                    diff_block(diff, align_id, &block_id, block_span)
                        .feature_sets
                        .insert(set_id.clone(), fragment_set.clone());
                }
            }
            Some(canon_set) => {
                let set_style = canon_set.style.clone();
                let mut changed: Vec<Feature> = Vec::new();
                for (feature_id, fragment_feature) in &fragment_set.features {
                    match canon_set.features.get_mut(feature_id) {
                        None => {
                            canon_set
                                .features
                                .insert(feature_id.clone(), fragment_feature.clone());
                            changed.push(fragment_feature.clone());
                        }
                        Some(existing) if existing != fragment_feature => {
                            // Identity collision with differing content:
                            // the new payload replaces the old in place.
                            *existing = fragment_feature.clone();
                            changed.push(fragment_feature.clone());
                        }
                        Some(_) => {}
                    }
                }
                if !changed.is_empty() && !first_merge {
                    let diff_set = diff_feature_set(
                        diff, align_id, &block_id, block_span, set_id, set_style,
                    );
                    for feature in changed {
                        diff_set.insert(feature);
                    }
                }
            }
        }
    }
}

// Diff-side container accessors: create containers on demand so the diff
// only holds the path down to what actually changed.

fn diff_alignment<'a>(diff: &'a mut MergeDiff, align_id: &str) -> &'a mut Alignment {
    diff.context
        .alignments
        .entry(align_id.to_string())
        .or_insert_with(|| Alignment::new(align_id))
}

fn diff_block<'a>(
    diff: &'a mut MergeDiff,
    align_id: &str,
    block_id: &str,
    span: super::Span,
) -> &'a mut Block {
    diff_alignment(diff, align_id)
        .blocks
        .entry(block_id.to_string())
        .or_insert_with(|| Block::new(block_id, span))
}

fn diff_feature_set<'a>(
    diff: &'a mut MergeDiff,
    align_id: &str,
    block_id: &str,
    span: super::Span,
    set_id: &str,
    style: Option<String>,
) -> &'a mut FeatureSet {
    diff_block(diff, align_id, block_id, span)
        .feature_sets
        .entry(set_id.to_string())
        .or_insert_with(|| {
            let mut set = FeatureSet::new(set_id);
            set.style = style;
            set
        })
}

// =============================================================================
// Validation
// =============================================================================

fn validate_fragment(canonical: &FeatureContext, fragment: &FeatureContext) -> Result<()> {
    if fragment.region.sequence_name != canonical.region.sequence_name {
        return Err(ViewError::MergeRejected(format!(
            "fragment is for sequence '{}', canonical is '{}'",
            fragment.region.sequence_name, canonical.region.sequence_name
        )));
    }
    for (align_id, alignment) in &fragment.alignments {
        if align_id.is_empty() || alignment.id.is_empty() {
            return Err(ViewError::MergeRejected(
                "alignment with empty identifier".to_string(),
            ));
        }
        for (block_id, block) in &alignment.blocks {
            if block_id.is_empty() || block.id.is_empty() {
                return Err(ViewError::MergeRejected(format!(
                    "block with empty identifier under alignment '{align_id}'"
                )));
            }
            if !block.span.is_valid() {
                return Err(ViewError::MergeRejected(format!(
                    "block '{block_id}' has invalid span {}-{}",
                    block.span.start, block.span.end
                )));
            }
            for (set_id, set) in &block.feature_sets {
                if set_id.is_empty() || set.id.is_empty() {
                    return Err(ViewError::MergeRejected(format!(
                        "feature set with empty identifier in block '{block_id}'"
                    )));
                }
                for (feature_id, feature) in &set.features {
                    if feature_id.is_empty() || feature.id.is_empty() {
                        return Err(ViewError::MergeRejected(format!(
                            "feature with empty identifier in set '{set_id}'"
                        )));
                    }
                    if !feature.span.is_valid() {
                        return Err(ViewError::MergeRejected(format!(
                            "feature '{feature_id}' has invalid span {}-{}",
                            feature.span.start, feature.span.end
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Erase
// =============================================================================

/// Remove from `canonical` every feature named in `to_erase`, returning a
/// diff that holds exactly what was removed (for symmetric undraw).
///
/// Feature sets left empty by the erase are pruned; blocks and alignments
/// stay, they are structural.
pub fn erase(canonical: &mut FeatureContext, to_erase: &FeatureContext) -> MergeDiff {
    let mut diff = MergeDiff::empty(canonical);

    for (align_id, erase_align) in &to_erase.alignments {
        let Some(canon_align) = canonical.alignments.get_mut(align_id) else {
            continue;
        };
        for (block_id, erase_block) in &erase_align.blocks {
            let Some(canon_block) = canon_align.blocks.get_mut(block_id) else {
                continue;
            };
            for (set_id, erase_set) in &erase_block.feature_sets {
                let Some(canon_set) = canon_block.feature_sets.get_mut(set_id) else {
                    continue;
                };
                let mut removed: Vec<Feature> = Vec::new();
                for feature_id in erase_set.features.keys() {
                    if let Some(feature) = canon_set.features.remove(feature_id) {
                        removed.push(feature);
                    }
                }
                if !removed.is_empty() {
                    let style = canon_set.style.clone();
                    let span = canon_block.span;
                    let diff_set =
                        diff_feature_set(&mut diff, align_id, block_id, span, set_id, style);
                    for feature in removed {
                        diff_set.insert(feature);
                    }
                }
            }
            canon_block.feature_sets.retain(|_, set| !set.features.is_empty());
        }
    }
    diff
}

/// Fetch-once DNA attach used by the sequence stage: wraps the raw bytes in a
/// fragment shaped for [`merge`].
pub fn dna_fragment(region: &super::Region, dna: Bytes) -> FeatureContext {
    let mut fragment = FeatureContext::new(region.clone());
    fragment.dna = Some(dna);
    fragment
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Region, Span, Strand, StyleSet};
    use proptest::prelude::*;

    fn region() -> Region {
        Region::new("chr11", 1, 10_000).unwrap()
    }

    fn feature(id: &str, start: u64, end: u64) -> Feature {
        Feature {
            id: id.to_string(),
            name: id.to_string(),
            span: Span::new(start, end),
            strand: Strand::Forward,
            style: None,
            score: None,
        }
    }

    fn fragment_with(features: &[(&str, u64, u64)]) -> FeatureContext {
        let mut ctx = FeatureContext::new(region());
        let mut align = Alignment::new("master");
        let mut block = Block::new("b1", Span::new(1, 10_000));
        let mut set = FeatureSet::new("genes");
        for (id, start, end) in features {
            set.insert(feature(id, *start, *end));
        }
        block.insert(set);
        align.insert(block);
        ctx.insert(align);
        ctx
    }

    #[test]
    fn test_first_merge_is_full_redraw() {
        let mut canonical = FeatureContext::new(region());
        let fragment = fragment_with(&[("f1", 10, 20), ("f2", 30, 40)]);

        let diff = merge(&mut canonical, &fragment).unwrap();
        assert!(diff.is_full_redraw());
        assert!(!diff.is_empty());
        assert_eq!(diff.context, canonical);
        assert_eq!(canonical.feature_count(), 2);
    }

    #[test]
    fn test_merge_empty_fragment_is_noop() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();
        let before = canonical.clone();

        let diff = merge(&mut canonical, &FeatureContext::new(region())).unwrap();
        assert!(diff.is_empty());
        assert_eq!(canonical, before);
    }

    #[test]
    fn test_incremental_merge_reports_only_new_features() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();

        let diff = merge(
            &mut canonical,
            &fragment_with(&[("f1", 10, 20), ("f2", 30, 40)]),
        )
        .unwrap();
        assert!(!diff.is_full_redraw());
        assert_eq!(diff.feature_count(), 1);
        assert!(diff
            .context
            .find_feature("master", "b1", "genes", "f2")
            .is_some());
        assert_eq!(canonical.feature_count(), 2);
    }

    #[test]
    fn test_identity_collision_replaces_payload() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();

        let diff = merge(&mut canonical, &fragment_with(&[("f1", 10, 25)])).unwrap();
        assert_eq!(diff.feature_count(), 1);
        let replaced = canonical.find_feature("master", "b1", "genes", "f1").unwrap();
        assert_eq!(replaced.span, Span::new(10, 25));
    }

    #[test]
    fn test_rejected_fragment_leaves_canonical_untouched() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();
        let before = canonical.clone();

        // Wrong sequence.
        let mut foreign = fragment_with(&[("f9", 1, 2)]);
        foreign.region.sequence_name = "chrX".to_string();
        assert!(merge(&mut canonical, &foreign).is_err());
        assert_eq!(canonical, before);

        // Inverted span.
        let bad_span = fragment_with(&[("f9", 50, 40)]);
        assert!(merge(&mut canonical, &bad_span).is_err());
        assert_eq!(canonical, before);

        // Empty identifier.
        let empty_id = fragment_with(&[("", 1, 2)]);
        assert!(merge(&mut canonical, &empty_id).is_err());
        assert_eq!(canonical, before);
    }

    #[test]
    fn test_erase_returns_exactly_what_was_removed() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20), ("f2", 30, 40)])).unwrap();

        let diff = erase(&mut canonical, &fragment_with(&[("f2", 30, 40)]));
        assert_eq!(diff.feature_count(), 1);
        assert!(diff
            .context
            .find_feature("master", "b1", "genes", "f2")
            .is_some());
        assert_eq!(canonical.feature_count(), 1);

        // Erasing something absent produces an empty diff.
        let diff = erase(&mut canonical, &fragment_with(&[("f9", 1, 2)]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_merge_then_erase_diff_round_trips() {
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();
        let before = canonical.clone();

        let diff = merge(&mut canonical, &fragment_with(&[("f2", 30, 40), ("f3", 50, 60)]))
            .unwrap();
        let _removed = erase(&mut canonical, &diff.context);
        assert_eq!(canonical.feature_count(), before.feature_count());
        assert!(canonical.find_feature("master", "b1", "genes", "f1").is_some());
        assert!(canonical.find_feature("master", "b1", "genes", "f2").is_none());
    }

    #[test]
    fn test_dna_preserved_across_merges() {
        let mut canonical = FeatureContext::new(region());
        let first = dna_fragment(&region(), bytes::Bytes::from_static(b"ACGT"));
        merge(&mut canonical, &first).unwrap();

        let second = dna_fragment(&region(), bytes::Bytes::from_static(b"TTTT"));
        let diff = merge(&mut canonical, &second).unwrap();
        assert!(diff.is_empty());
        assert_eq!(canonical.dna.as_deref(), Some(b"ACGT".as_slice()));
    }

    #[test]
    fn test_style_set_unaffected_by_feature_merge() {
        // Styles travel separately from features; a merge never touches them.
        let mut styles = StyleSet::new();
        styles.insert(crate::context::Style::named("gene"));
        let mut canonical = FeatureContext::new(region());
        merge(&mut canonical, &fragment_with(&[("f1", 10, 20)])).unwrap();
        assert_eq!(styles.len(), 1);
    }

    proptest! {
        /// Erasing a merge's diff restores the canonical model
        /// feature-for-feature, for any fresh batch of features.
        #[test]
        fn prop_merge_erase_round_trip(
            ids in proptest::collection::btree_set("[a-z]{1,6}", 1..8),
            starts in proptest::collection::vec(1u64..5_000, 8),
        ) {
            let mut canonical = FeatureContext::new(region());
            merge(&mut canonical, &fragment_with(&[("seed", 1, 5)])).unwrap();
            let before = canonical.clone();

            let features: Vec<(String, u64, u64)> = ids
                .iter()
                .zip(starts.iter())
                .map(|(id, start)| (format!("new-{id}"), *start, *start + 10))
                .collect();
            let borrowed: Vec<(&str, u64, u64)> = features
                .iter()
                .map(|(id, s, e)| (id.as_str(), *s, *e))
                .collect();

            let diff = merge(&mut canonical, &fragment_with(&borrowed)).unwrap();
            erase(&mut canonical, &diff.context);

            prop_assert_eq!(canonical.feature_count(), before.feature_count());
            for (id, _, _) in &features {
                prop_assert!(canonical
                    .find_feature("master", "b1", "genes", id)
                    .is_none());
            }
        }
    }
}
