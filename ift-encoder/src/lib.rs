//! Encoder side of the Incremental Font Transfer patch map tables.
//!
//! This crate plans how a font's glyphs should be partitioned into
//! independently loadable patches and writes the legacy Format 2 `IFT `
//! patch mapping table describing that plan:
//!
//! - [`glyph_segmentation`] analyzes codepoint segments against the font's
//!   glyph closure and produces per-patch glyph sets plus the activation
//!   conditions that guarantee the glyph closure requirement.
//! - [`format2`] serializes and deserializes the binary mapping table.
//! - [`ift_table`] embeds the serialized table into a font container.
//!
//! Built on top of the skrifa / read-fonts crates. The shaping closure is
//! consumed through the [`closure::GlyphClosure`] trait, so a caller with a
//! full subsetter can supply a richer oracle than the cmap and composite
//! based one provided here.

#![forbid(unsafe_code)]

pub mod closure;
pub mod error;
pub mod format2;
pub mod glyph_segmentation;
pub mod ift_table;
pub mod patch_map;
mod patch_sizing;

#[cfg(test)]
mod testdata {
    use write_fonts::{
        tables::{cmap::Cmap, head::Head, loca::Loca, maxp::Maxp},
        types::{GlyphId, Tag},
        FontBuilder,
    };

    pub const GLYPH_1_SIZE: u32 = 12;
    pub const GLYPH_2_SIZE: u32 = 12;

    /// A minimal font for closure tests: 'a' and 'b' map to simple glyphs
    /// 1 and 2, 'c' maps to glyph 3, a composite referencing glyph 1.
    /// Glyph 4 exists but is empty and unmapped.
    pub fn closure_test_font() -> Vec<u8> {
        let mut builder = FontBuilder::new();

        let maxp = Maxp {
            num_glyphs: 5,
            ..Default::default()
        };
        builder.add_table(&maxp).unwrap();

        let head = Head {
            index_to_loc_format: 0,
            ..Default::default()
        };
        builder.add_table(&head).unwrap();

        let cmap = Cmap::from_mappings([
            ('a', GlyphId::new(1)),
            ('b', GlyphId::new(2)),
            ('c', GlyphId::new(3)),
        ])
        .unwrap();
        builder.add_table(&cmap).unwrap();

        // Three empty simple glyphs (0 contours, no instructions) followed
        // by a composite that references glyph 1.
        let simple: &[u8] = &[
            0, 0, // numberOfContours
            0, 0, 0, 0, 0, 0, 0, 0, // bbox
            0, 0, // instructionLength
        ];
        let composite: &[u8] = &[
            0xFF, 0xFF, // numberOfContours = -1
            0, 0, 0, 0, 0, 0, 0, 0, // bbox
            0x00, 0x01, // flags: ARG_1_AND_2_ARE_WORDS
            0, 1, // glyphIndex = 1
            0, 0, 0, 0, // args
        ];
        let mut glyf: Vec<u8> = Vec::new();
        let mut loca: Vec<u32> = vec![0];
        for glyph in [simple, simple, simple, composite, &[]] {
            glyf.extend_from_slice(glyph);
            loca.push(glyf.len() as u32);
        }
        builder.add_table(&Loca::new(loca)).unwrap();
        builder.add_raw(Tag::new(b"glyf"), glyf);

        builder.build()
    }
}
