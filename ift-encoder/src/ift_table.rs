//! Embeds a serialized patch mapping into a font as the `IFT ` table.
//!
//! The font container is rebuilt rather than patched in place: every table
//! of the source face is copied in its current physical order, the `IFT `
//! table is inserted or replaced, and — for fonts converted from the legacy
//! IFTB scheme — the outline tables are moved to the back of the file so
//! that patches can extend them by appending.

use skrifa::raw::types::Tag;
use skrifa::FontRef;

use crate::error::IftError;

pub const IFT_TAG: Tag = Tag::new(b"IFT ");
pub const IFTB_TAG: Tag = Tag::new(b"IFTB");

/// Returns a new font binary with `ift_table` installed as the `IFT `
/// table.
///
/// With `iftb_conversion` set the legacy `IFTB` table is dropped and the
/// physical order is fixed up so that `gvar` precedes `glyf`, `glyf`
/// precedes `loca`, and `loca` and `CFF `/`CFF2` sit at the end of the
/// file.
pub fn add_to_font(
    font: &FontRef,
    ift_table: &[u8],
    iftb_conversion: bool,
) -> Result<Vec<u8>, IftError> {
    let mut records: Vec<_> = font.table_directory.table_records().iter().collect();
    records.sort_by_key(|r| r.offset());

    let mut tables: Vec<(Tag, &[u8])> = Vec::with_capacity(records.len() + 1);
    for record in records {
        let tag = record.tag();
        if iftb_conversion && tag == IFTB_TAG {
            continue;
        }
        if tag == IFT_TAG {
            tables.push((tag, ift_table));
            continue;
        }
        let data = font
            .table_data(tag)
            .ok_or(IftError::InvalidFormat("table data is out of bounds"))?;
        tables.push((tag, data.as_bytes()));
    }
    if !tables.iter().any(|(tag, _)| *tag == IFT_TAG) {
        tables.push((IFT_TAG, ift_table));
    }

    if iftb_conversion {
        for tag in [b"gvar", b"glyf", b"loca", b"CFF ", b"CFF2"] {
            move_tag_to_back(&mut tables, Tag::new(tag));
        }
    }

    build_font(font.table_directory.sfnt_version(), &tables)
}

fn move_tag_to_back(tables: &mut Vec<(Tag, &[u8])>, tag: Tag) {
    if let Some(index) = tables.iter().position(|(t, _)| *t == tag) {
        let entry = tables.remove(index);
        tables.push(entry);
    }
}

/// Serializes a font container with the given physical table order. The
/// table directory itself is sorted by tag as the sfnt format requires;
/// only the data placement follows `tables`.
fn build_font(sfnt_version: u32, tables: &[(Tag, &[u8])]) -> Result<Vec<u8>, IftError> {
    const TABLE_RECORD_LEN: usize = 16;
    let num_tables = u16::try_from(tables.len())
        .map_err(|_| IftError::Overflow("too many tables (0xFFFF)"))?;
    let header_len = 12 + tables.len() * TABLE_RECORD_LEN;

    let mut position = u32::try_from(header_len)
        .map_err(|_| IftError::Overflow("font directory too large"))?;
    let mut records = Vec::with_capacity(tables.len());
    for (tag, data) in tables {
        let length = u32::try_from(data.len())
            .map_err(|_| IftError::Overflow("table larger than 4GiB"))?;
        let (checksum, padding) = checksum_and_padding(data);
        records.push((*tag, checksum, position, length));
        position = length
            .checked_add(padding)
            .and_then(|len| position.checked_add(len))
            .ok_or(IftError::Overflow("font larger than 4GiB"))?;
    }
    records.sort_by_key(|r| r.0);

    // Binary search assist fields, per the sfnt table directory definition.
    let entry_selector: u16 = if num_tables == 0 {
        0
    } else {
        15 - num_tables.leading_zeros() as u16
    };
    let search_range = ((16u32 << entry_selector) & 0xFFFF) as u16;
    let range_shift =
        (tables.len() * TABLE_RECORD_LEN).saturating_sub(search_range as usize) as u16;

    let mut out = Vec::with_capacity(position as usize);
    out.extend_from_slice(&sfnt_version.to_be_bytes());
    out.extend_from_slice(&num_tables.to_be_bytes());
    out.extend_from_slice(&search_range.to_be_bytes());
    out.extend_from_slice(&entry_selector.to_be_bytes());
    out.extend_from_slice(&range_shift.to_be_bytes());
    for (tag, checksum, offset, length) in records {
        out.extend_from_slice(&tag.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
    }
    for (_, data) in tables {
        out.extend_from_slice(data);
        let rem = data.len() % 4;
        if rem > 0 {
            out.extend_from_slice(&[0u8; 4][rem..]);
        }
    }
    Ok(out)
}

fn checksum_and_padding(table: &[u8]) -> (u32, u32) {
    let padding = (4 - table.len() % 4) % 4;
    let mut sum = 0u32;
    let mut iter = table.chunks_exact(4);
    for quad in &mut iter {
        let array: [u8; 4] = quad.try_into().unwrap_or_default();
        sum = sum.wrapping_add(u32::from_be_bytes(array));
    }

    let rem = match *iter.remainder() {
        [a] => u32::from_be_bytes([a, 0, 0, 0]),
        [a, b] => u32::from_be_bytes([a, b, 0, 0]),
        [a, b, c] => u32::from_be_bytes([a, b, c, 0]),
        _ => 0,
    };

    (sum.wrapping_add(rem), padding as u32)
}
