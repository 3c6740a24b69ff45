//! Format 2 patch mapping wire codec.
//!
//! Serializes a [`PatchMap`] into the binary `IFT ` table payload and reads
//! it back. All multi-byte integers are big-endian. Codepoint coverages are
//! stored as biased sparse bit sets; the sparse-bit-set codec itself comes
//! from `read-fonts` and is treated as a black box that reports how many
//! bytes it consumed.

use skrifa::raw::collections::IntSet;
use skrifa::raw::types::Tag;

use crate::error::IftError;
use crate::patch_map::{Coverage, Entry, PatchEncoding, PatchMap};

/// Size of the fixed header prefix, up to but not including the URI
/// template.
const HEADER_MIN_LENGTH: usize = 22;

const FEATURES_BIT: u8 = 1;
const DESIGN_SPACE_BIT: u8 = 1 << 1;
const COPY_MAPPINGS_BIT: u8 = 1 << 2;
const INDEX_DELTA_BIT: u8 = 1 << 3;
const ENCODING_BIT: u8 = 1 << 4;
const CODEPOINTS_BIT: u8 = 1 << 5;
const IGNORE_BIT: u8 = 1 << 6;
const RESERVED_BIT: u8 = 1 << 7;

/// Serializes `map` as a Format 2 patch mapping table.
///
/// `is_ext` selects which segment of the map is written: only entries whose
/// `is_extension` flag matches are emitted. On error nothing is returned;
/// partially written bytes are discarded.
pub fn serialize(map: &PatchMap, is_ext: bool, uri_template: &str) -> Result<Vec<u8>, IftError> {
    if !uri_template.is_ascii() {
        return Err(IftError::InvalidFormat("uri template must be ascii"));
    }
    let uri_template_length = u16::try_from(uri_template.len())
        .map_err(|_| IftError::Overflow("exceeded maximum uri template size (0xFFFF)"))?;

    let entries: Vec<&Entry> = map
        .entries()
        .iter()
        .filter(|e| e.is_extension == is_ext)
        .collect();
    let mapping_count = u16::try_from(entries.len())
        .map_err(|_| IftError::Overflow("exceeded maximum number of entries (0xFFFF)"))?;

    let default_encoding = map.default_encoding();

    let mut out = Vec::with_capacity(HEADER_MIN_LENGTH + uri_template.len());
    out.push(0x02); // format
    write_u32(&mut out, 0); // reserved
    write_u32(&mut out, 0); // compatibility id (truncated legacy field)
    out.push(default_encoding.format_number());
    write_u16(&mut out, mapping_count);
    write_u32(&mut out, (HEADER_MIN_LENGTH + uri_template.len()) as u32); // mappingsOffset
    write_u32(&mut out, 0); // idStringsOffset, none
    write_u16(&mut out, uri_template_length);
    out.extend_from_slice(uri_template.as_bytes());

    let mut last_patch_index = 0u32;
    let mut current_encoding = default_encoding;
    for entry in entries {
        encode_entry(entry, last_patch_index, &mut current_encoding, &mut out)?;
        last_patch_index = entry.patch_index;
    }

    Ok(out)
}

/// Reads a Format 2 patch mapping table, returning the decoded map and the
/// URI template carried in the header.
pub fn deserialize(data: &[u8]) -> Result<(PatchMap, String), IftError> {
    let mut reader = Reader::new(data);

    let format = reader.read_u8()?;
    if format != 2 {
        return Err(IftError::InvalidFormat("invalid format number (!= 2)"));
    }
    reader.skip(4)?; // reserved
    reader.skip(4)?; // compatibility id (truncated legacy field)

    let default_encoding = PatchEncoding::from_format_number(reader.read_u8()?)?;
    let mapping_count = reader.read_u16()?;
    let mappings_offset = reader.read_u32()? as usize;
    let _id_strings_offset = reader.read_u32()?;
    let uri_template_length = reader.read_u16()? as usize;
    let uri_template = reader.read_ascii(uri_template_length)?;

    let mut entries = Reader::new(data);
    entries.skip(mappings_offset)?;

    let mut map = PatchMap::new();
    let mut patch_index = 0i64;
    let mut current_encoding = default_encoding;
    for _ in 0..mapping_count {
        decode_entry(&mut entries, &mut patch_index, &mut current_encoding, &mut map)?;
    }

    Ok((map, uri_template))
}

fn encode_entry(
    entry: &Entry,
    last_patch_index: u32,
    current_encoding: &mut PatchEncoding,
    out: &mut Vec<u8>,
) -> Result<(), IftError> {
    let coverage = &entry.coverage;
    if !coverage.design_space.is_empty() {
        return Err(IftError::Unsupported(
            "design space entries cannot be serialized",
        ));
    }

    let has_features = !coverage.features.is_empty();
    let has_codepoints = !coverage.codepoints.is_empty();
    // The decoder pre-increments before applying the delta, so consecutive
    // indices need no field at all.
    let delta = i64::from(entry.patch_index) - i64::from(last_patch_index) - 1;
    let has_delta = delta != 0;
    let has_encoding = entry.encoding != *current_encoding;

    let flags = (has_features as u8 * FEATURES_BIT)
        | (has_delta as u8 * INDEX_DELTA_BIT)
        | (has_encoding as u8 * ENCODING_BIT)
        | (has_codepoints as u8 * CODEPOINTS_BIT);
    out.push(flags);

    if has_features {
        let count = u8::try_from(coverage.features.len())
            .map_err(|_| IftError::Overflow("exceeded max number of feature tags (0xFF)"))?;
        out.push(count);
        for tag in &coverage.features {
            out.extend_from_slice(&tag.to_be_bytes());
        }
    }

    if has_delta {
        let delta = i16::try_from(delta)
            .map_err(|_| IftError::Overflow("exceeded max entry index delta (int16)"))?;
        out.extend_from_slice(&delta.to_be_bytes());
    }

    if has_encoding {
        out.push(entry.encoding.format_number());
        *current_encoding = entry.encoding;
    }

    if has_codepoints {
        let bias = coverage.codepoints.first().unwrap_or_default();
        if bias > 0xFFFFFF {
            return Err(IftError::Overflow("codepoint bias exceeds 24 bits"));
        }
        write_u24(out, bias);
        let biased: IntSet<u32> = coverage.codepoints.iter().map(|cp| cp - bias).collect();
        out.extend_from_slice(&biased.to_sparse_bit_set());
    }

    Ok(())
}

fn decode_entry(
    reader: &mut Reader,
    patch_index: &mut i64,
    current_encoding: &mut PatchEncoding,
    map: &mut PatchMap,
) -> Result<(), IftError> {
    let flags = reader.read_u8()?;
    if flags & RESERVED_BIT != 0 {
        return Err(IftError::InvalidFormat("reserved entry flag bit is set"));
    }

    let mut coverage = Coverage::default();

    if flags & FEATURES_BIT != 0 {
        let feature_count = reader.read_u8()?;
        for _ in 0..feature_count {
            coverage.features.insert(Tag::from_be_bytes(reader.read_array()?));
        }
    }

    if flags & DESIGN_SPACE_BIT != 0 {
        // Design space segments are reserved; skip axis + min + max records.
        let segment_count = reader.read_u16()? as usize;
        reader.skip(segment_count * 12)?;
    }

    if flags & COPY_MAPPINGS_BIT != 0 {
        // Copy mappings are reserved; skip the index list.
        let copy_count = reader.read_u16()? as usize;
        reader.skip(copy_count * 2)?;
    }

    *patch_index += 1;
    if flags & INDEX_DELTA_BIT != 0 {
        *patch_index += i64::from(reader.read_i16()?);
    }
    let entry_index = u32::try_from(*patch_index)
        .map_err(|_| IftError::Overflow("entry index out of range (u32)"))?;

    if flags & ENCODING_BIT != 0 {
        *current_encoding = PatchEncoding::from_format_number(reader.read_u8()?)?;
    }

    if flags & CODEPOINTS_BIT != 0 {
        let bias = reader.read_u24()?;
        let (codepoints, remaining) =
            IntSet::<u32>::from_sparse_bit_set_bounded(reader.remaining(), bias, 0x10FFFF)
                .map_err(|_| IftError::InvalidFormat("failed to decode sparse bit set"))?;
        let consumed = reader.remaining().len() - remaining.len();
        reader.skip(consumed)?;
        coverage.codepoints = codepoints;
    }

    if flags & IGNORE_BIT == 0 {
        map.add_entry(coverage, entry_index, *current_encoding);
    }

    Ok(())
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes()[1..]);
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// An advancing cursor over the table bytes. Every read checks the
/// remaining length; running off the end is an invalid-format error.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn skip(&mut self, count: usize) -> Result<(), IftError> {
        if count > self.data.len() - self.pos {
            return Err(IftError::InvalidFormat("not enough input data"));
        }
        self.pos += count;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], IftError> {
        let bytes = self
            .remaining()
            .get(..N)
            .ok_or(IftError::InvalidFormat("not enough input data"))?
            .try_into()
            .unwrap_or([0; N]);
        self.pos += N;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, IftError> {
        self.read_array::<1>().map(|b| b[0])
    }

    fn read_u16(&mut self) -> Result<u16, IftError> {
        self.read_array().map(u16::from_be_bytes)
    }

    fn read_u24(&mut self) -> Result<u32, IftError> {
        let bytes = self.read_array::<3>()?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    fn read_u32(&mut self) -> Result<u32, IftError> {
        self.read_array().map(u32::from_be_bytes)
    }

    fn read_i16(&mut self) -> Result<i16, IftError> {
        self.read_array().map(i16::from_be_bytes)
    }

    fn read_ascii(&mut self, length: usize) -> Result<String, IftError> {
        let bytes = self
            .remaining()
            .get(..length)
            .ok_or(IftError::InvalidFormat("not enough input data"))?;
        if !bytes.is_ascii() {
            return Err(IftError::InvalidFormat("uri template must be ascii"));
        }
        self.pos += length;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_map::AxisSegment;
    use skrifa::raw::types::Fixed;

    fn single_codepoint_map(cp: u32) -> PatchMap {
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([cp].iter().copied().collect()),
            1,
            PatchEncoding::SharedBrotli,
        );
        map
    }

    fn sparse_bytes(codepoints: &[u32]) -> Vec<u8> {
        let set: IntSet<u32> = codepoints.iter().copied().collect();
        set.to_sparse_bit_set()
    }

    #[test]
    fn header_layout_is_byte_exact() {
        let bytes = serialize(&single_codepoint_map(0x41), false, "p/{id}").unwrap();

        // format, reserved
        assert_eq!(&bytes[0..5], &[0x02, 0, 0, 0, 0]);
        // compatibility id remnant
        assert_eq!(&bytes[5..9], &[0, 0, 0, 0]);
        // defaultPatchEncoding = shared brotli
        assert_eq!(bytes[9], 1);
        // mappingCount
        assert_eq!(&bytes[10..12], &[0, 1]);
        // mappingsOffset = 22 + len("p/{id}")
        assert_eq!(&bytes[12..16], &28u32.to_be_bytes());
        // idStringsOffset
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
        // uriTemplateLength + template
        assert_eq!(&bytes[20..22], &[0, 6]);
        assert_eq!(&bytes[22..28], b"p/{id}");
    }

    #[test]
    fn single_entry_round_trip() {
        let map = single_codepoint_map(0x41);
        let bytes = serialize(&map, false, "p/{id}").unwrap();

        // Entry: codepoints only, bias = 0x41, empty remainder after the
        // biased set (a single zero value).
        let entry = &bytes[28..];
        assert_eq!(entry[0], CODEPOINTS_BIT);
        assert_eq!(&entry[1..4], &[0, 0, 0x41]);
        assert_eq!(&entry[4..], sparse_bytes(&[0]).as_slice());

        let (decoded, uri) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(uri, "p/{id}");
    }

    #[test]
    fn empty_map_round_trip() {
        let map = PatchMap::new();
        let bytes = serialize(&map, false, "").unwrap();
        assert_eq!(bytes.len(), HEADER_MIN_LENGTH);

        let (decoded, uri) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(uri, "");
    }

    #[test]
    fn multi_entry_round_trip_with_features_and_encodings() {
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41, 0x45, 0x1F600].iter().copied().collect()),
            1,
            PatchEncoding::SharedBrotli,
        );
        let mut with_features = Coverage::from_codepoints([0x62].iter().copied().collect());
        with_features.features.insert(Tag::new(b"liga"));
        with_features.features.insert(Tag::new(b"smcp"));
        map.add_entry(with_features, 2, PatchEncoding::Iftb);
        map.add_entry(
            Coverage::from_codepoints([0x63].iter().copied().collect()),
            7,
            PatchEncoding::SharedBrotli,
        );

        let bytes = serialize(&map, false, "patches/{id}").unwrap();
        let (decoded, uri) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(uri, "patches/{id}");
    }

    #[test]
    fn negative_delta_round_trip() {
        // Indices [5, 3]: the second record stores 3 - (5 + 1) = -3.
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41].iter().copied().collect()),
            5,
            PatchEncoding::SharedBrotli,
        );
        map.add_entry(
            Coverage::from_codepoints([0x42].iter().copied().collect()),
            3,
            PatchEncoding::SharedBrotli,
        );

        let bytes = serialize(&map, false, "").unwrap();

        let first_entry = &bytes[HEADER_MIN_LENGTH..];
        assert_eq!(first_entry[0], CODEPOINTS_BIT | INDEX_DELTA_BIT);
        // 5 - (0 + 1) = 4
        assert_eq!(&first_entry[1..3], &4i16.to_be_bytes());

        let second_start = 3 + 3 + sparse_bytes(&[0]).len();
        let second_entry = &first_entry[second_start..];
        assert_eq!(second_entry[0], CODEPOINTS_BIT | INDEX_DELTA_BIT);
        assert_eq!(&second_entry[1..3], &(-3i16).to_be_bytes());

        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn extreme_deltas_round_trip() {
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41].iter().copied().collect()),
            32768, // 32767 - (0 + 1) + 1 => stored delta 32767
            PatchEncoding::Iftb,
        );
        map.add_entry(
            Coverage::from_codepoints([0x42].iter().copied().collect()),
            1, // 1 - (32768 + 1) = -32768
            PatchEncoding::Iftb,
        );

        let bytes = serialize(&map, false, "").unwrap();
        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn delta_too_large_overflows() {
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41].iter().copied().collect()),
            40000,
            PatchEncoding::Iftb,
        );
        assert!(matches!(
            serialize(&map, false, ""),
            Err(IftError::Overflow(_))
        ));
    }

    #[test]
    fn entry_index_underflow_rejected() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[11] = 1; // mappingCount = 1
        bytes.push(INDEX_DELTA_BIT);
        bytes.extend_from_slice(&(-5i16).to_be_bytes()); // 0 + 1 - 5 < 0
        assert!(matches!(
            deserialize(&bytes),
            Err(IftError::Overflow(_))
        ));
    }

    #[test]
    fn running_encoding_state_round_trips() {
        // default is elected as shared brotli (2 of 3 entries); the middle
        // entry switches the running state and the final entry must switch
        // it back.
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41].iter().copied().collect()),
            1,
            PatchEncoding::SharedBrotli,
        );
        map.add_entry(
            Coverage::from_codepoints([0x42].iter().copied().collect()),
            2,
            PatchEncoding::Iftb,
        );
        map.add_entry(
            Coverage::from_codepoints([0x43].iter().copied().collect()),
            3,
            PatchEncoding::SharedBrotli,
        );

        let bytes = serialize(&map, false, "").unwrap();
        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn extension_entries_are_segmented() {
        let mut map = PatchMap::new();
        map.add_entry(
            Coverage::from_codepoints([0x41].iter().copied().collect()),
            1,
            PatchEncoding::SharedBrotli,
        );
        map.add_extension_entry(
            Coverage::from_codepoints([0x42].iter().copied().collect()),
            2,
            PatchEncoding::SharedBrotli,
        );

        let (main, _) = deserialize(&serialize(&map, false, "").unwrap()).unwrap();
        assert_eq!(main.entries().len(), 1);
        assert_eq!(main.entries()[0].patch_index, 1);

        let (ext, _) = deserialize(&serialize(&map, true, "").unwrap()).unwrap();
        assert_eq!(ext.entries().len(), 1);
        assert_eq!(ext.entries()[0].patch_index, 2);
        // extension flags don't survive the wire; the caller picks the
        // segment at read time.
        assert!(!ext.entries()[0].is_extension);
    }

    #[test]
    fn ignored_entries_advance_state_but_are_dropped() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[11] = 2; // mappingCount = 2

        // ignored entry carrying an encoding switch
        bytes.push(IGNORE_BIT | ENCODING_BIT);
        bytes.push(2); // per table shared brotli
                       // plain codepoints entry; inherits index 2 and the switched encoding
        bytes.push(CODEPOINTS_BIT);
        bytes.extend_from_slice(&[0, 0, 0x41]);
        bytes.extend_from_slice(&sparse_bytes(&[0]));

        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded.entries().len(), 1);
        let entry = &decoded.entries()[0];
        assert_eq!(entry.patch_index, 2);
        assert_eq!(entry.encoding, PatchEncoding::PerTableSharedBrotli);
    }

    #[test]
    fn design_space_and_copy_mappings_are_skipped() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[11] = 1; // mappingCount = 1

        bytes.push(DESIGN_SPACE_BIT | COPY_MAPPINGS_BIT | CODEPOINTS_BIT);
        bytes.extend_from_slice(&1u16.to_be_bytes()); // one design space segment
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.extend_from_slice(&2u16.to_be_bytes()); // two copy indices
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&[0, 0, 0x41]);
        bytes.extend_from_slice(&sparse_bytes(&[0]));

        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded.entries().len(), 1);
        assert_eq!(
            decoded.entries()[0].coverage.codepoints,
            [0x41u32].iter().copied().collect()
        );
    }

    #[test]
    fn emitting_design_space_is_unsupported() {
        let mut coverage = Coverage::from_codepoints([0x41].iter().copied().collect());
        coverage.design_space.push(AxisSegment {
            axis_tag: Tag::new(b"wght"),
            start: Fixed::from_i32(100),
            end: Fixed::from_i32(900),
        });
        let mut map = PatchMap::new();
        map.add_entry(coverage, 1, PatchEncoding::SharedBrotli);
        assert_eq!(
            serialize(&map, false, ""),
            Err(IftError::Unsupported(
                "design space entries cannot be serialized"
            ))
        );
    }

    #[test]
    fn reserved_flag_bit_rejected() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[11] = 1;
        bytes.push(RESERVED_BIT);
        assert!(matches!(
            deserialize(&bytes),
            Err(IftError::InvalidFormat(_))
        ));
    }

    #[test]
    fn wrong_format_number_rejected() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[0] = 1;
        assert_eq!(
            deserialize(&bytes),
            Err(IftError::InvalidFormat("invalid format number (!= 2)"))
        );
    }

    #[test]
    fn unknown_encoding_rejected() {
        let mut bytes = serialize(&PatchMap::new(), false, "").unwrap();
        bytes[9] = 3;
        assert_eq!(
            deserialize(&bytes),
            Err(IftError::InvalidFormat("unrecognized encoding value"))
        );
    }

    #[test]
    fn truncated_inputs_rejected() {
        let bytes = serialize(&single_codepoint_map(0x41), false, "p/{id}").unwrap();
        for len in 0..bytes.len() {
            assert!(
                deserialize(&bytes[..len]).is_err(),
                "expected failure at length {len}"
            );
        }
    }

    #[test]
    fn large_codepoints_use_bias() {
        // A codepoint above 2^16 still fits the 24-bit bias.
        let map = single_codepoint_map(0x10FFFF);
        let bytes = serialize(&map, false, "").unwrap();
        let entry = &bytes[HEADER_MIN_LENGTH..];
        assert_eq!(&entry[1..4], &[0x10, 0xFF, 0xFF]);

        let (decoded, _) = deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }
}
