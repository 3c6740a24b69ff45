//! Computes glyph segmentation plans.
//!
//! Given a font face (behind the [`GlyphClosure`] oracle) and a list of
//! disjoint codepoint segments, the planner decides how the font's glyphs
//! should be grouped into independently loadable patches and under which
//! conditions each patch must be loaded. The produced plan satisfies the
//! glyph closure requirement: for any subset definition, the glyphs carried
//! by the activated patches (plus the initial font) are a superset of the
//! glyphs the face's closure reaches for that definition.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use fnv::FnvHashMap;
use skrifa::raw::collections::IntSet;
use skrifa::GlyphId;

use crate::closure::GlyphClosure;
use crate::error::IftError;
use crate::patch_map::{Coverage, PatchEncoding, PatchMap};
use crate::patch_sizing::{self, CandidatePatch, PatchClass};

/// Identifies a codepoint segment by its position in the caller's list.
pub type SegmentIndex = u32;

/// Identifies a patch. Id 0 is reserved for the initial font.
pub type PatchId = u32;

/// Tuning options for the segmentation planner.
#[derive(Clone, Copy, Debug)]
pub struct SegmentationOptions {
    /// Patches estimated below this many bytes are merged with a neighbor
    /// of the same condition class. 0 disables merging.
    pub patch_size_min_bytes: u32,
    /// Patches estimated above this many bytes are split. `u32::MAX`
    /// disables splitting.
    pub patch_size_max_bytes: u32,
    /// Largest segment combination probed when attributing glyphs that no
    /// single segment reaches on its own.
    pub max_probe_segments: usize,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        SegmentationOptions {
            patch_size_min_bytes: 0,
            patch_size_max_bytes: u32::MAX,
            max_probe_segments: 3,
        }
    }
}

/// The condition under which a patch must be loaded: a conjunction of
/// disjunctions over segment indices.
///
/// The condition holds for a subset definition when every clause contains
/// at least one segment intersecting the definition. Conditions order
/// lexicographically by their clause list, then by activated patch id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActivationCondition {
    clauses: Vec<BTreeSet<SegmentIndex>>,
    activated: PatchId,
    is_fallback: bool,
    is_exclusive: bool,
}

impl ActivationCondition {
    /// A condition that activates when `index` intersects the subset
    /// definition; the segment maps one to one to the patch.
    pub fn exclusive_segment(index: SegmentIndex, activated: PatchId) -> Self {
        ActivationCondition {
            clauses: vec![BTreeSet::from([index])],
            activated,
            is_fallback: false,
            is_exclusive: true,
        }
    }

    /// A condition that activates when every one of `segments` intersects
    /// the subset definition.
    pub fn and_segments(segments: &BTreeSet<SegmentIndex>, activated: PatchId) -> Self {
        ActivationCondition {
            clauses: segments.iter().map(|s| BTreeSet::from([*s])).collect(),
            activated,
            is_fallback: false,
            is_exclusive: false,
        }
    }

    /// A condition that activates when any of `segments` intersects the
    /// subset definition.
    pub fn or_segments(
        segments: &BTreeSet<SegmentIndex>,
        activated: PatchId,
        is_fallback: bool,
    ) -> Self {
        ActivationCondition {
            clauses: vec![segments.clone()],
            activated,
            is_fallback,
            is_exclusive: false,
        }
    }

    /// A condition over an arbitrary conjunction of disjunctions:
    /// (s … OR …) AND (… OR …) AND ….
    pub fn composite_condition(
        clauses: impl IntoIterator<Item = BTreeSet<SegmentIndex>>,
        activated: PatchId,
    ) -> Self {
        ActivationCondition {
            clauses: canonical_clauses(clauses.into_iter().collect()),
            activated,
            is_fallback: false,
            is_exclusive: false,
        }
    }

    /// The clauses of this condition. Every clause must intersect the
    /// subset definition for the condition to hold.
    pub fn conditions(&self) -> &[BTreeSet<SegmentIndex>] {
        &self.clauses
    }

    /// The patch to load when the condition is satisfied.
    pub fn activated(&self) -> PatchId {
        self.activated
    }

    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    pub fn is_unitary(&self) -> bool {
        self.clauses.len() == 1 && self.clauses[0].len() == 1
    }

    /// Every segment index referenced by this condition.
    pub fn triggering_segments(&self) -> BTreeSet<SegmentIndex> {
        self.clauses.iter().flatten().copied().collect()
    }

    /// Evaluates the condition against the set of segments that intersect
    /// a subset definition.
    pub fn activated_by(&self, intersecting_segments: &BTreeSet<SegmentIndex>) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.iter().any(|s| intersecting_segments.contains(s)))
    }
}

impl fmt::Display for ActivationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.len() > 1 {
            write!(f, "(")?;
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            if clause.len() > 1 {
                write!(f, "(")?;
            }
            for (j, segment) in clause.iter().enumerate() {
                if j > 0 {
                    write!(f, " OR ")?;
                }
                write!(f, "s{segment}")?;
            }
            if clause.len() > 1 {
                write!(f, ")")?;
            }
        }
        if self.clauses.len() > 1 {
            write!(f, ")")?;
        }
        write!(f, " => p{}", self.activated)?;
        if self.is_fallback {
            write!(f, ", fallback")?;
        }
        Ok(())
    }
}

/// Canonical form of a CNF clause list: clauses sorted, duplicates
/// removed, and clauses subsumed by a subset clause dropped.
pub(crate) fn canonical_clauses(
    mut clauses: Vec<BTreeSet<SegmentIndex>>,
) -> Vec<BTreeSet<SegmentIndex>> {
    clauses.sort();
    clauses.dedup();
    let subsumed: Vec<bool> = clauses
        .iter()
        .map(|clause| {
            clauses
                .iter()
                .any(|other| other != clause && other.is_subset(clause))
        })
        .collect();
    let mut keep = subsumed.iter().map(|s| !s);
    clauses.retain(|_| keep.next().unwrap_or(true));
    clauses
}

/// The CNF of `a OR b`: the pairwise unions of their clauses. Used when
/// the size governor merges two patches; their glyphs now load together,
/// so the merged patch must activate whenever either input would have.
pub(crate) fn disjoin_clauses(
    a: &[BTreeSet<SegmentIndex>],
    b: &[BTreeSet<SegmentIndex>],
) -> Vec<BTreeSet<SegmentIndex>> {
    let mut product = Vec::with_capacity(a.len() * b.len());
    for left in a {
        for right in b {
            product.push(left.union(right).copied().collect());
        }
    }
    canonical_clauses(product)
}

/// How a font's glyphs should be grouped into glyph keyed patches, and the
/// conditions under which those patches load.
#[derive(Clone, Debug, Default)]
pub struct GlyphSegmentation {
    segments: Vec<IntSet<u32>>,
    init_font_glyphs: IntSet<GlyphId>,
    unmapped_glyphs: IntSet<GlyphId>,
    conditions: BTreeSet<ActivationCondition>,
    patches: BTreeMap<PatchId, IntSet<GlyphId>>,
}

impl GlyphSegmentation {
    /// Analyzes `codepoint_segments` against the face's glyph closure and
    /// computes a segmentation satisfying the glyph closure requirement.
    ///
    /// `initial_segment` is the set of codepoints shipped in the initial
    /// font; its closure is never placed into a patch. Segments must be
    /// disjoint; a segment's index in `codepoint_segments` is the index
    /// conditions refer to.
    pub fn from_codepoint_segments<F: GlyphClosure>(
        face: &F,
        initial_segment: IntSet<u32>,
        codepoint_segments: Vec<IntSet<u32>>,
        options: SegmentationOptions,
    ) -> Result<GlyphSegmentation, IftError> {
        let segment_count = u32::try_from(codepoint_segments.len())
            .map_err(|_| IftError::Overflow("too many codepoint segments"))?;

        let init_closure = face.glyph_closure(&initial_segment)?;

        let mut segment_closures: Vec<IntSet<GlyphId>> =
            Vec::with_capacity(codepoint_segments.len());
        for segment in &codepoint_segments {
            let mut codepoints = initial_segment.clone();
            codepoints.union(segment);
            let mut closure = face.glyph_closure(&codepoints)?;
            closure.remove_all(init_closure.iter());
            segment_closures.push(closure);
        }

        let mut all_codepoints = initial_segment.clone();
        for segment in &codepoint_segments {
            all_codepoints.union(segment);
        }
        let mut full_closure = face.glyph_closure(&all_codepoints)?;
        full_closure.remove_all(init_closure.iter());

        // Attribute every glyph some single segment can reach to the set of
        // segments that reach it.
        let mut owners: BTreeMap<GlyphId, BTreeSet<SegmentIndex>> = BTreeMap::new();
        for (index, closure) in segment_closures.iter().enumerate() {
            for gid in closure.iter() {
                owners.entry(gid).or_default().insert(index as u32);
            }
        }

        let mut or_glyph_groups: BTreeMap<BTreeSet<SegmentIndex>, IntSet<GlyphId>> =
            BTreeMap::new();
        let mut remaining = full_closure.clone();
        for (gid, segments) in owners {
            remaining.remove(gid);
            or_glyph_groups.entry(segments).or_default().insert(gid);
        }

        // The rest only appear when several segments are present together;
        // probe combinations to find the minimal sets that force them in.
        let mut and_glyph_groups: BTreeMap<BTreeSet<SegmentIndex>, IntSet<GlyphId>> =
            BTreeMap::new();
        let mut fallback_group: BTreeSet<SegmentIndex> = BTreeSet::new();
        let mut fallback_glyphs: IntSet<GlyphId> = IntSet::empty();
        let mut unmapped_glyphs: IntSet<GlyphId> = IntSet::empty();

        if !remaining.is_empty() {
            let minimal_sets = probe_combinations(
                face,
                &initial_segment,
                &codepoint_segments,
                &init_closure,
                &remaining,
                options.max_probe_segments,
            )?;

            for gid in remaining.iter() {
                match minimal_sets.get(&gid.to_u32()).map(Vec::as_slice) {
                    None | Some([]) => {
                        log::warn!(
                            "glyph {gid} exceeds the probing budget and was left unmapped"
                        );
                        unmapped_glyphs.insert(gid);
                    }
                    Some([required]) => {
                        and_glyph_groups
                            .entry(required.clone())
                            .or_default()
                            .insert(gid);
                    }
                    Some(sets) => {
                        // Reachable through more than one minimal segment
                        // combination; absorbed by the fallback patch.
                        fallback_glyphs.insert(gid);
                        for set in sets {
                            fallback_group.extend(set.iter().copied());
                        }
                    }
                }
            }
        }

        Self::groups_to_segmentation(
            face,
            codepoint_segments,
            init_closure,
            or_glyph_groups,
            and_glyph_groups,
            fallback_group,
            fallback_glyphs,
            unmapped_glyphs,
            segment_count,
            options,
        )
    }

    /// Resolves the glyph groups into patches with dense ids and one
    /// activation condition per patch, applying the size governor first.
    #[allow(clippy::too_many_arguments)]
    fn groups_to_segmentation<F: GlyphClosure>(
        face: &F,
        segments: Vec<IntSet<u32>>,
        init_font_glyphs: IntSet<GlyphId>,
        or_glyph_groups: BTreeMap<BTreeSet<SegmentIndex>, IntSet<GlyphId>>,
        and_glyph_groups: BTreeMap<BTreeSet<SegmentIndex>, IntSet<GlyphId>>,
        fallback_group: BTreeSet<SegmentIndex>,
        fallback_glyphs: IntSet<GlyphId>,
        unmapped_glyphs: IntSet<GlyphId>,
        segment_count: u32,
        options: SegmentationOptions,
    ) -> Result<GlyphSegmentation, IftError> {
        let mut candidates: Vec<CandidatePatch> = Vec::new();
        for (group, glyphs) in &or_glyph_groups {
            candidates.push(CandidatePatch {
                class: if group.len() == 1 {
                    PatchClass::Exclusive
                } else {
                    PatchClass::Or
                },
                clauses: vec![group.clone()],
                glyphs: glyphs.clone(),
                split_part: 0,
            });
        }
        for (group, glyphs) in &and_glyph_groups {
            candidates.push(CandidatePatch {
                class: PatchClass::And,
                clauses: group.iter().map(|s| BTreeSet::from([*s])).collect(),
                glyphs: glyphs.clone(),
                split_part: 0,
            });
        }
        if !fallback_glyphs.is_empty() {
            candidates.push(CandidatePatch {
                class: PatchClass::Fallback,
                clauses: vec![fallback_group],
                glyphs: fallback_glyphs,
                split_part: 0,
            });
        }

        let mut candidates = patch_sizing::enforce_patch_sizes(face, candidates, &options)?;

        // Dense patch ids, allocated in priority order: exclusive segments,
        // then AND groups, then OR groups, fallback last. Id 0 belongs to
        // the initial font.
        candidates.sort_by(|a, b| {
            (a.class, &a.clauses, a.split_part).cmp(&(b.class, &b.clauses, b.split_part))
        });

        let mut patches = BTreeMap::new();
        let mut conditions = BTreeSet::new();
        let mut fallback_patches: Vec<(PatchId, Vec<BTreeSet<SegmentIndex>>)> = Vec::new();
        let mut next_id: PatchId = 1;

        for candidate in candidates {
            let patch_id = next_id;
            next_id += 1;
            patches.insert(patch_id, candidate.glyphs);

            match candidate.class {
                PatchClass::Exclusive if candidate.split_part == 0 => {
                    let segment = candidate
                        .clauses
                        .first()
                        .and_then(|clause| clause.first())
                        .copied()
                        .ok_or(IftError::Internal("exclusive patch without a segment"))?;
                    conditions.insert(ActivationCondition::exclusive_segment(segment, patch_id));
                }
                PatchClass::Exclusive | PatchClass::Or => {
                    let clause = candidate
                        .clauses
                        .first()
                        .cloned()
                        .ok_or(IftError::Internal("disjunctive patch without a clause"))?;
                    conditions.insert(ActivationCondition::or_segments(&clause, patch_id, false));
                }
                PatchClass::And => {
                    if candidate.clauses.iter().all(|c| c.len() == 1) {
                        let group: BTreeSet<SegmentIndex> =
                            candidate.clauses.iter().flatten().copied().collect();
                        conditions.insert(ActivationCondition::and_segments(&group, patch_id));
                    } else {
                        conditions.insert(ActivationCondition::composite_condition(
                            candidate.clauses,
                            patch_id,
                        ));
                    }
                }
                PatchClass::Fallback => {
                    fallback_patches.push((patch_id, candidate.clauses));
                }
            }
        }

        // The fallback activates whenever any segment of its group, or any
        // segment no other condition references, intersects the subset.
        if !fallback_patches.is_empty() {
            let referenced: BTreeSet<SegmentIndex> = conditions
                .iter()
                .flat_map(|c| c.triggering_segments())
                .collect();
            for (patch_id, clauses) in fallback_patches {
                let mut clause: BTreeSet<SegmentIndex> =
                    clauses.into_iter().flatten().collect();
                clause.extend((0..segment_count).filter(|s| !referenced.contains(s)));
                conditions.insert(ActivationCondition::or_segments(&clause, patch_id, true));
            }
        }

        Ok(GlyphSegmentation {
            segments,
            init_font_glyphs,
            unmapped_glyphs,
            conditions,
            patches,
        })
    }

    /// The conditions describing how the patches of this segmentation are
    /// activated, in canonical order.
    pub fn conditions(&self) -> &BTreeSet<ActivationCondition> {
        &self.conditions
    }

    /// The codepoint segments condition segment indices refer to.
    pub fn segments(&self) -> &[IntSet<u32>] {
        &self.segments
    }

    /// The glyphs carried by each patch, keyed by patch id.
    pub fn patches(&self) -> &BTreeMap<PatchId, IntSet<GlyphId>> {
        &self.patches
    }

    /// Glyphs whose interactions were too complex to attribute within the
    /// probing budget. Reported, never silently dropped.
    pub fn unmapped_glyphs(&self) -> &IntSet<GlyphId> {
        &self.unmapped_glyphs
    }

    /// Glyphs that must ship in the initial font.
    pub fn init_font_glyphs(&self) -> &IntSet<GlyphId> {
        &self.init_font_glyphs
    }

    /// Converts this segmentation into patch mapping entries, one per
    /// activation condition in ascending patch id order.
    ///
    /// Entry coverage is the union of the codepoints of every segment the
    /// condition references. Conjunctive conditions over-activate on this
    /// wire format (coverage intersection cannot express conjunction),
    /// which keeps the closure requirement intact at the cost of some
    /// spurious patch loads.
    pub fn to_patch_map(&self, encoding: PatchEncoding) -> PatchMap {
        let mut ordered: Vec<&ActivationCondition> = self.conditions.iter().collect();
        ordered.sort_by_key(|c| c.activated());

        let mut map = PatchMap::new();
        for condition in ordered {
            let mut codepoints: IntSet<u32> = IntSet::empty();
            for segment in condition.triggering_segments() {
                if let Some(set) = self.segments.get(segment as usize) {
                    codepoints.union(set);
                }
            }
            map.add_entry(
                Coverage::from_codepoints(codepoints),
                condition.activated(),
                encoding,
            );
        }
        map
    }
}

impl fmt::Display for GlyphSegmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "initial font: {}", format_glyphs(&self.init_font_glyphs))?;
        for (patch_id, glyphs) in &self.patches {
            writeln!(f, "p{patch_id}: {}", format_glyphs(glyphs))?;
        }
        for condition in &self.conditions {
            writeln!(f, "if {condition}")?;
        }
        if !self.unmapped_glyphs.is_empty() {
            writeln!(f, "unmapped: {}", format_glyphs(&self.unmapped_glyphs))?;
        }
        Ok(())
    }
}

fn format_glyphs(glyphs: &IntSet<GlyphId>) -> String {
    if glyphs.is_empty() {
        return "{}".to_string();
    }
    let ids: Vec<String> = glyphs.iter().map(|g| g.to_u32().to_string()).collect();
    format!("{{ {} }}", ids.join(", "))
}

/// For every glyph in `remaining`, finds the minimal segment combinations
/// (size 2 up to `max_probe_segments`) whose joint closure contains the
/// glyph. Combinations are probed in ascending lexicographic order.
fn probe_combinations<F: GlyphClosure>(
    face: &F,
    initial_segment: &IntSet<u32>,
    codepoint_segments: &[IntSet<u32>],
    init_closure: &IntSet<GlyphId>,
    remaining: &IntSet<GlyphId>,
    max_probe_segments: usize,
) -> Result<FnvHashMap<u32, Vec<BTreeSet<SegmentIndex>>>, IftError> {
    let mut minimal_sets: FnvHashMap<u32, Vec<BTreeSet<SegmentIndex>>> = Default::default();
    let segment_count = codepoint_segments.len();

    for size in 2..=max_probe_segments.min(segment_count) {
        for combination in Combinations::new(segment_count, size) {
            let mut codepoints = initial_segment.clone();
            for &index in &combination {
                codepoints.union(&codepoint_segments[index]);
            }
            let mut closure = face.glyph_closure(&codepoints)?;
            closure.remove_all(init_closure.iter());
            closure.intersect(remaining);
            if closure.is_empty() {
                continue;
            }

            let combination: BTreeSet<SegmentIndex> =
                combination.iter().map(|&i| i as u32).collect();
            for gid in closure.iter() {
                let sets = minimal_sets.entry(gid.to_u32()).or_default();
                // A combination containing an already known minimal set
                // adds no information.
                if !sets.iter().any(|s| s.is_subset(&combination)) {
                    sets.push(combination.clone());
                }
            }
        }
    }

    Ok(minimal_sets)
}

/// Iterates the k-element subsets of `0..n` in ascending lexicographic
/// order.
struct Combinations {
    indices: Vec<usize>,
    n: usize,
    started: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Combinations {
            indices: (0..k).collect(),
            n,
            started: false,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let k = self.indices.len();
        if k > self.n || k == 0 {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.indices.clone());
        }

        // Advance the rightmost index that still has room.
        let mut i = k;
        loop {
            if i == 0 {
                return None;
            }
            i -= 1;
            if self.indices[i] + 1 <= self.n - (k - i) {
                break;
            }
        }
        self.indices[i] += 1;
        for j in i + 1..k {
            self.indices[j] = self.indices[j - 1] + 1;
        }
        Some(self.indices.clone())
    }
}
