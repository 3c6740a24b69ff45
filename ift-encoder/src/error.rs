//! Error type shared by the segmentation planner and the patch map codec.

use thiserror::Error;

/// An error produced while planning a glyph segmentation or while reading
/// or writing an IFT patch mapping table.
///
/// Fallible operations in this crate never recover silently; the first
/// failure is propagated to the caller. Non-fatal conditions (unmapped
/// glyphs, relaxed size ceilings) are not errors and are reported through
/// the planner output and the [`log`] facade instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IftError {
    /// Malformed or truncated table data, or a field holding a value the
    /// format does not define.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    /// A value does not fit the width of the field that carries it.
    #[error("field overflow: {0}")]
    Overflow(&'static str),

    /// The operation is defined by the format but not supported by this
    /// implementation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The data is well formed but self-contradictory.
    #[error("inconsistent patch map: {0}")]
    Inconsistent(&'static str),

    /// The glyph closure oracle reported a failure.
    #[error("glyph closure failed: {0}")]
    OracleError(String),

    /// A required table or record is missing.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// An invariant of this crate was violated. Always a bug.
    #[error("internal error: {0}")]
    Internal(&'static str),
}
