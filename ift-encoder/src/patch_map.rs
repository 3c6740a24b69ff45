//! In-memory model of an IFT patch mapping.
//!
//! A [`PatchMap`] is an ordered list of entries, each pairing a
//! [`Coverage`] (the codepoints and optional layout features that identify
//! a subset) with the index of the patch that serves it and the encoding of
//! that patch's payload. The Format 2 wire representation of this model is
//! handled by [`crate::format2`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use skrifa::raw::collections::IntSet;
use skrifa::raw::types::{Fixed, Tag};

use crate::error::IftError;

/// Compression format used for a patch payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchEncoding {
    Iftb,
    SharedBrotli,
    PerTableSharedBrotli,
}

impl PatchEncoding {
    /// Maps a wire format number to an encoding.
    ///
    /// Unknown values are rejected so that future format numbers are never
    /// silently misread.
    pub fn from_format_number(value: u8) -> Result<Self, IftError> {
        match value {
            0 => Ok(Self::Iftb),
            1 => Ok(Self::SharedBrotli),
            2 => Ok(Self::PerTableSharedBrotli),
            _ => Err(IftError::InvalidFormat("unrecognized encoding value")),
        }
    }

    pub fn format_number(&self) -> u8 {
        match self {
            Self::Iftb => 0,
            Self::SharedBrotli => 1,
            Self::PerTableSharedBrotli => 2,
        }
    }
}

/// A design space range on a single variation axis.
///
/// Reserved for future use: the serializer rejects entries carrying one and
/// the deserializer skips over them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisSegment {
    pub axis_tag: Tag,
    pub start: Fixed,
    pub end: Fixed,
}

/// The subset a mapping entry applies to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Coverage {
    pub codepoints: IntSet<u32>,
    pub features: BTreeSet<Tag>,
    pub design_space: Vec<AxisSegment>,
}

impl Coverage {
    pub fn from_codepoints(codepoints: IntSet<u32>) -> Self {
        Coverage {
            codepoints,
            ..Default::default()
        }
    }
}

/// One patch mapping record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub coverage: Coverage,
    pub patch_index: u32,
    pub encoding: PatchEncoding,
    /// Extension entries live in the extension segment of the mapping and
    /// are serialized only when the caller asks for that segment.
    pub is_extension: bool,
}

/// An ordered collection of patch mapping entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchMap {
    entries: Vec<Entry>,
}

impl PatchMap {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn add_entry(&mut self, coverage: Coverage, patch_index: u32, encoding: PatchEncoding) {
        self.entries.push(Entry {
            coverage,
            patch_index,
            encoding,
            is_extension: false,
        });
    }

    pub fn add_extension_entry(
        &mut self,
        coverage: Coverage,
        patch_index: u32,
        encoding: PatchEncoding,
    ) {
        self.entries.push(Entry {
            coverage,
            patch_index,
            encoding,
            is_extension: true,
        });
    }

    /// Removes every entry whose patch index is in `patch_indices`.
    pub fn remove_patches(&mut self, patch_indices: &IntSet<u32>) {
        self.entries
            .retain(|e| !patch_indices.contains(e.patch_index));
    }

    /// Elects the default encoding written into the table header: the most
    /// common encoding among the entries, ties resolved toward the smaller
    /// format number.
    pub fn default_encoding(&self) -> PatchEncoding {
        let mut counts = [0u32; 3];
        for entry in &self.entries {
            counts[entry.encoding.format_number() as usize] += 1;
        }

        if counts[0] >= counts[1] && counts[0] >= counts[2] {
            PatchEncoding::Iftb
        } else if counts[1] >= counts[2] {
            PatchEncoding::SharedBrotli
        } else {
            PatchEncoding::PerTableSharedBrotli
        }
    }

    /// Builds the one-to-one lookup view of this map: codepoint to
    /// (patch index, encoding).
    ///
    /// Maps produced from conjunctive activation conditions intentionally
    /// cover some codepoints with more than one entry; those cannot be
    /// represented in this view and are rejected with
    /// [`IftError::Inconsistent`].
    pub fn codepoint_to_patch(&self) -> Result<BTreeMap<u32, (u32, PatchEncoding)>, IftError> {
        let mut result = BTreeMap::new();
        for entry in &self.entries {
            for cp in entry.coverage.codepoints.iter() {
                let previous = result.insert(cp, (entry.patch_index, entry.encoding));
                if let Some((index, _)) = previous {
                    if index != entry.patch_index {
                        return Err(IftError::Inconsistent(
                            "codepoint is mapped to more than one patch",
                        ));
                    }
                }
            }
        }
        Ok(result)
    }
}
