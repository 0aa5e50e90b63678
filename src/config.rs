//! Caller-tunable knobs for the directory and xattr encoders.
//!
//! Deliberately small: the compressor implementation is a direct argument to
//! [`crate::meta_writer::MetaWriter::new`], not something threaded through
//! here, and size/count-string parsing (`parse_size`-style) stays an
//! external collaborator this crate never touches.

/// Options controlling encoder behavior that isn't part of the on-disk
/// contract itself.
#[derive(Debug, Clone, Copy)]
pub struct Options {
	/// Whether a single directory entry that alone overruns a meta-block is
	/// still admitted as the first (and only) entry of its group, rather
	/// than rejected.
	///
	/// The original encoder this crate's directory grouping is modeled on
	/// always admits it; disabling this is a redesign hook for a stricter
	/// encoder that refuses to produce a straddling header. Defaults to
	/// `true` to match on-disk behavior bit for bit.
	pub straddle_oversized_first_entry: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			straddle_oversized_first_entry: true,
		}
	}
}
