//! Error type shared by every fallible operation in this crate.

use std::io;

/// The result type returned by this crate's encoders.
pub type Result<T> = std::result::Result<T, SqfsError>;

/// An error raised while encoding a directory or xattr table.
///
/// Mirrors the four error kinds a SquashFS writer can raise: an unsupported
/// input was given, an allocation failed, a size computation overflowed, or
/// the underlying meta-block/file I/O failed.
#[derive(Debug, thiserror::Error)]
pub enum SqfsError {
	/// A directory entry's mode has no SquashFS inode type, or an xattr
	/// key's namespace is not recognized.
	#[error("unsupported: {0}")]
	Unsupported(&'static str),

	/// A growable buffer or table failed to allocate the requested
	/// capacity.
	#[error("allocation failed")]
	Alloc,

	/// A ID or size computation would not fit in its on-disk field.
	#[error("overflow: {0}")]
	Overflow(&'static str),

	/// The meta-block writer or backing file object failed.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl From<std::collections::TryReserveError> for SqfsError {
	fn from(_: std::collections::TryReserveError) -> Self {
		SqfsError::Alloc
	}
}
