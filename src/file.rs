//! The file object contract required by [`crate::xattr_writer::flush`].
//!
//! Two operations: `write_at(offset, bytes)` and `get_size()`. Implemented
//! for [`std::fs::File`] directly, and for an
//! in-memory buffer so the flush algorithm's exact byte layout can be
//! asserted in tests without touching a real disk.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

/// The image file as seen by the xattr table's flush step.
pub trait SqfsFile {
	/// Writes `bytes` at absolute `offset`, growing the file if needed.
	fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;

	/// Returns the current length of the file in bytes.
	fn get_size(&self) -> io::Result<u64>;
}

impl SqfsFile for File {
	fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
		self.seek(SeekFrom::Start(offset))?;
		self.write_all(bytes)
	}

	fn get_size(&self) -> io::Result<u64> {
		self.metadata().map(|m| m.len())
	}
}

/// An in-memory [`SqfsFile`], used by tests.
#[derive(Default, Clone)]
pub struct MemFile {
	data: Vec<u8>,
}

impl MemFile {
	/// Creates an empty in-memory file.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the file's contents.
	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}
}

impl SqfsFile for MemFile {
	fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
		let offset = offset as usize;
		let end = offset + bytes.len();
		if end > self.data.len() {
			self.data.resize(end, 0);
		}
		self.data[offset..end].copy_from_slice(bytes);
		Ok(())
	}

	fn get_size(&self) -> io::Result<u64> {
		Ok(self.data.len() as u64)
	}
}
