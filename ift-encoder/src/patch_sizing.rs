//! Patch size governor.
//!
//! Reshapes candidate patches so that per-patch byte estimates stay inside
//! the configured `[patch_size_min_bytes, patch_size_max_bytes]` window:
//! undersized patches are merged with a neighbor of the same condition
//! class, oversized patches are split by a stable glyph-id hash. Glyphs
//! never move between condition classes.

use std::collections::BTreeSet;
use std::hash::Hasher;

use fnv::FnvHasher;
use skrifa::raw::collections::IntSet;
use skrifa::GlyphId;

use crate::closure::GlyphClosure;
use crate::error::IftError;
use crate::glyph_segmentation::{disjoin_clauses, SegmentIndex, SegmentationOptions};

/// Condition class of a candidate patch. Merging only pairs members of the
/// same class: exclusive and OR patches are both disjunctive, AND patches
/// are conjunctive, the fallback bucket is left alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PatchClass {
    Exclusive,
    And,
    Or,
    Fallback,
}

impl PatchClass {
    fn is_disjunctive(&self) -> bool {
        matches!(self, PatchClass::Exclusive | PatchClass::Or)
    }
}

/// A patch under construction: the glyphs it will carry and the CNF
/// clauses of the activation condition it will receive once patch ids are
/// assigned.
#[derive(Clone, Debug)]
pub(crate) struct CandidatePatch {
    pub class: PatchClass,
    pub clauses: Vec<BTreeSet<SegmentIndex>>,
    pub glyphs: IntSet<GlyphId>,
    /// 1-based position among the subpatches of a split; 0 for patches
    /// that were not split.
    pub split_part: usize,
}

fn merge_compatible(a: &CandidatePatch, b: &CandidatePatch) -> bool {
    (a.class.is_disjunctive() && b.class.is_disjunctive())
        || (a.class == PatchClass::And && b.class == PatchClass::And)
}

pub(crate) fn enforce_patch_sizes<F: GlyphClosure>(
    face: &F,
    mut candidates: Vec<CandidatePatch>,
    options: &SegmentationOptions,
) -> Result<Vec<CandidatePatch>, IftError> {
    if options.patch_size_min_bytes > 0 {
        merge_undersized(face, &mut candidates, options)?;
    }
    if options.patch_size_max_bytes < u32::MAX {
        candidates = split_oversized(face, candidates, options)?;
    }
    Ok(candidates)
}

/// Repeatedly merges the first undersized patch into its nearest
/// same-class neighbor until every patch meets the floor or its class has
/// nothing left to merge with.
fn merge_undersized<F: GlyphClosure>(
    face: &F,
    candidates: &mut Vec<CandidatePatch>,
    options: &SegmentationOptions,
) -> Result<(), IftError> {
    let floor = options.patch_size_min_bytes as u64;
    let mut sizes: Vec<u64> = Vec::with_capacity(candidates.len());
    for candidate in candidates.iter() {
        sizes.push(patch_size(face, &candidate.glyphs)?);
    }

    loop {
        let Some((small, partner)) = (0..candidates.len()).find_map(|i| {
            if sizes[i] >= floor || candidates[i].class == PatchClass::Fallback {
                return None;
            }
            merge_partner(candidates, i).map(|j| (i, j))
        }) else {
            return Ok(());
        };

        let (keep, gone) = (small.min(partner), small.max(partner));
        let removed = candidates.remove(gone);
        let removed_size = sizes.remove(gone);
        let kept = &mut candidates[keep];
        kept.glyphs.union(&removed.glyphs);
        kept.clauses = disjoin_clauses(&kept.clauses, &removed.clauses);
        // Merging two exclusives (or an exclusive with an OR group)
        // produces a plain OR group; merged ANDs become composites but
        // stay conjunctive.
        if kept.class.is_disjunctive() {
            kept.class = PatchClass::Or;
        }
        sizes[keep] += removed_size;
    }
}

fn merge_partner(candidates: &[CandidatePatch], index: usize) -> Option<usize> {
    let after = (index + 1..candidates.len())
        .find(|&j| merge_compatible(&candidates[index], &candidates[j]));
    after.or_else(|| {
        (0..index)
            .rev()
            .find(|&j| merge_compatible(&candidates[index], &candidates[j]))
    })
}

/// Splits every patch whose estimate exceeds the ceiling into the minimum
/// number of subpatches that each meet it, partitioning glyphs in stable
/// hash order. A single glyph larger than the ceiling keeps its own
/// subpatch and the ceiling is relaxed for it with a logged note.
fn split_oversized<F: GlyphClosure>(
    face: &F,
    candidates: Vec<CandidatePatch>,
    options: &SegmentationOptions,
) -> Result<Vec<CandidatePatch>, IftError> {
    let ceiling = options.patch_size_max_bytes as u64;
    let mut result = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if patch_size(face, &candidate.glyphs)? <= ceiling {
            result.push(candidate);
            continue;
        }

        let mut ordered: Vec<(u64, GlyphId, u64)> = Vec::new();
        for gid in candidate.glyphs.iter() {
            let size = face.glyph_data_size(gid)? as u64;
            ordered.push((stable_hash(gid), gid, size));
        }
        ordered.sort_unstable();

        let mut buckets: Vec<IntSet<GlyphId>> = vec![IntSet::empty()];
        let mut bucket_size = 0u64;
        for (_, gid, size) in ordered {
            if bucket_size > 0 && bucket_size + size > ceiling {
                buckets.push(IntSet::empty());
                bucket_size = 0;
            }
            if size > ceiling {
                log::warn!(
                    "patch size ceiling exceeded: glyph {} alone is {} bytes (ceiling {})",
                    gid,
                    size,
                    ceiling
                );
            }
            if let Some(bucket) = buckets.last_mut() {
                bucket.insert(gid);
            }
            bucket_size += size;
        }

        let single = buckets.len() == 1;
        for (part, glyphs) in buckets.into_iter().enumerate() {
            result.push(CandidatePatch {
                class: candidate.class,
                clauses: candidate.clauses.clone(),
                glyphs,
                split_part: if single { 0 } else { part + 1 },
            });
        }
    }

    Ok(result)
}

fn patch_size<F: GlyphClosure>(face: &F, glyphs: &IntSet<GlyphId>) -> Result<u64, IftError> {
    let mut total = 0u64;
    for gid in glyphs.iter() {
        total += face.glyph_data_size(gid)? as u64;
    }
    Ok(total)
}

fn stable_hash(gid: GlyphId) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write_u32(gid.to_u32());
    hasher.finish()
}
