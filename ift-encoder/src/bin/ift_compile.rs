//! IFT compile
//!
//! Plans a glyph segmentation for a font from a list of codepoint segments
//! and installs the resulting Format 2 patch mapping as the font's `IFT `
//! table.

use clap::Parser;
use ift_encoder::format2;
use ift_encoder::glyph_segmentation::{GlyphSegmentation, SegmentationOptions};
use ift_encoder::ift_table;
use ift_encoder::patch_map::PatchEncoding;
use skrifa::raw::collections::IntSet;
use skrifa::FontRef;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Plans a glyph segmentation for a font and embeds the resulting IFT patch mapping table."
)]
struct Args {
    /// The input font file.
    #[arg(short, long)]
    font: std::path::PathBuf,

    /// The output font file.
    #[arg(short, long)]
    output: std::path::PathBuf,

    /// A codepoint segment: comma separated unicode values or ranges,
    /// e.g. "0x41-0x5A,0x61". Repeat for additional segments.
    #[arg(short, long, required = true)]
    segment: Vec<String>,

    /// Codepoints guaranteed to be covered by the initial font.
    #[arg(long)]
    initial_unicodes: Option<String>,

    /// Merge patches estimated below this many bytes.
    #[arg(long, default_value_t = 0)]
    min_patch_size: u32,

    /// Split patches estimated above this many bytes.
    #[arg(long, default_value_t = u32::MAX)]
    max_patch_size: u32,

    /// URI template stored in the mapping table header.
    #[arg(long, default_value = "patches/{id}.br")]
    uri_template: String,

    /// Drop the legacy IFTB table and reorder outline tables for appending.
    #[arg(long)]
    iftb_conversion: bool,
}

/// Parses "0x41-0x5A,0x61,97" style codepoint lists.
fn parse_unicodes(spec: &str) -> IntSet<u32> {
    let mut out = IntSet::empty();
    for part in spec.split(',').filter(|p| !p.is_empty()) {
        let mut bounds = part.splitn(2, '-').map(|value| {
            let value = value.trim();
            let parsed = if let Some(hex) = value.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                value.parse()
            };
            parsed.unwrap_or_else(|_| panic!("bad unicode value: {value}"))
        });
        let start = bounds.next().expect("empty unicode range");
        let end = bounds.next().unwrap_or(start);
        out.insert_range(start..=end);
    }
    out
}

fn main() {
    let args = Args::parse();

    let initial_segment = args
        .initial_unicodes
        .as_deref()
        .map(parse_unicodes)
        .unwrap_or_default();
    let segments: Vec<IntSet<u32>> = args.segment.iter().map(|s| parse_unicodes(s)).collect();

    let font_bytes = std::fs::read(&args.font).unwrap_or_else(|e| {
        panic!(
            "Unable to read input font file ({}): {:?}",
            args.font.display(),
            e
        )
    });
    let font = FontRef::new(&font_bytes).expect("Input font parsing failed");

    let options = SegmentationOptions {
        patch_size_min_bytes: args.min_patch_size,
        patch_size_max_bytes: args.max_patch_size,
        ..Default::default()
    };
    let segmentation =
        GlyphSegmentation::from_codepoint_segments(&font, initial_segment, segments, options)
            .expect("Glyph segmentation failed");
    print!("{segmentation}");

    let patch_map = segmentation.to_patch_map(PatchEncoding::SharedBrotli);
    let ift_bytes = format2::serialize(&patch_map, false, &args.uri_template)
        .expect("Patch map serialization failed");
    let new_font = ift_table::add_to_font(&font, &ift_bytes, args.iftb_conversion)
        .expect("Adding IFT table to font failed");

    std::fs::write(&args.output, new_font).unwrap_or_else(|e| {
        panic!(
            "Unable to write output font file ({}): {:?}",
            args.output.display(),
            e
        )
    });
    println!("Wrote {}", args.output.display());
}
