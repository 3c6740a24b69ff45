//! Glyph closure oracle consumed by the segmentation planner.
//!
//! The planner only needs two capabilities from a font: the glyph closure
//! of a codepoint set and a per-glyph byte-size estimate. Both are behind
//! the [`GlyphClosure`] trait so callers with a full shaping closure (a
//! subsetter, harfbuzz, ...) can substitute their own oracle.
//!
//! The [`FontRef`] implementation provided here closes over the character
//! map (including format 14 variation-selector subtables) and composite
//! `glyf` components. It does not chase GSUB substitutions.

use skrifa::raw::collections::IntSet;
use skrifa::raw::tables::glyf::{Glyf, Glyph};
use skrifa::raw::tables::loca::Loca;
use skrifa::raw::TableProvider;
use skrifa::charmap::Charmap;
use skrifa::{FontRef, GlyphId};

use crate::error::IftError;

const MAX_COMPOSITE_OPERATIONS_PER_GLYPH: u64 = 64;
const MAX_NESTING_LEVEL: u8 = 64;

/// Provides the font-face capabilities the segmentation planner depends on.
pub trait GlyphClosure {
    /// Returns the set of glyphs the font may use to render any subset of
    /// `codepoints`.
    fn glyph_closure(&self, codepoints: &IntSet<u32>) -> Result<IntSet<GlyphId>, IftError>;

    /// Returns the estimated byte size of the data backing `gid`, used to
    /// budget patch sizes.
    fn glyph_data_size(&self, gid: GlyphId) -> Result<u32, IftError>;
}

impl GlyphClosure for FontRef<'_> {
    fn glyph_closure(&self, codepoints: &IntSet<u32>) -> Result<IntSet<GlyphId>, IftError> {
        let mut gids: IntSet<GlyphId> = IntSet::empty();
        gids.insert(GlyphId::NOTDEF);

        let charmap = Charmap::new(self);
        for cp in codepoints.iter() {
            if let Some(gid) = charmap.map(cp) {
                gids.insert(gid);
            }
        }

        if let Ok(cmap) = self.cmap() {
            cmap.closure_glyphs(codepoints, &mut gids);
        }

        if let (Ok(loca), Ok(glyf)) = (self.loca(None), self.glyf()) {
            let mut closed: IntSet<GlyphId> = IntSet::empty();
            let mut operation_count =
                (gids.len() * MAX_COMPOSITE_OPERATIONS_PER_GLYPH) as i64;
            for gid in gids.iter() {
                operation_count =
                    component_closure(&loca, &glyf, gid, &mut closed, operation_count, 0);
            }
            gids = closed;
        }

        let num_glyphs = self
            .maxp()
            .map_err(|e| IftError::OracleError(e.to_string()))?
            .num_glyphs() as u32;
        gids.remove_range(GlyphId::new(num_glyphs)..=GlyphId::new(u32::MAX));

        Ok(gids)
    }

    fn glyph_data_size(&self, gid: GlyphId) -> Result<u32, IftError> {
        let loca = self
            .loca(None)
            .map_err(|e| IftError::OracleError(e.to_string()))?;
        let index = gid.to_u32() as usize;
        let start = loca
            .get_raw(index)
            .ok_or(IftError::NotFound("glyph has no loca entry"))?;
        let end = loca
            .get_raw(index + 1)
            .ok_or(IftError::NotFound("glyph has no loca entry"))?;
        end.checked_sub(start)
            .ok_or(IftError::InvalidFormat("loca entries are not ascending"))
    }
}

/// Adds `gid` and, for composites, every transitively referenced component
/// to `gids_to_retain`. Recursion is bounded by a nesting limit and an
/// operation budget.
fn component_closure(
    loca: &Loca,
    glyf: &Glyf,
    gid: GlyphId,
    gids_to_retain: &mut IntSet<GlyphId>,
    operation_count: i64,
    depth: u8,
) -> i64 {
    if gids_to_retain.contains(gid) {
        return operation_count;
    }
    gids_to_retain.insert(gid);

    if depth > MAX_NESTING_LEVEL {
        return operation_count;
    }

    let mut operation_count = operation_count - 1;
    if operation_count < 0 {
        return operation_count;
    }

    if let Some(Glyph::Composite(glyph)) = loca.get_glyf(gid, glyf).ok().flatten() {
        for component in glyph.components() {
            operation_count = component_closure(
                loca,
                glyf,
                component.glyph.into(),
                gids_to_retain,
                operation_count,
                depth + 1,
            );
        }
    }
    operation_count
}
