//! A forward-only stream of 8 KiB meta-blocks.
//!
//! The directory and xattr encoders are the two consumers in this crate;
//! neither knows or cares how a block is compressed, only that `append`
//! eventually seals full blocks and that `get_position` reports where the
//! *next* byte will land so it can be embedded as a back-reference in a
//! later table.

use crate::byte_stream::put_u16;
use crate::compressor::Compressor;
use crate::error::{Result, SqfsError};
use crate::file::SqfsFile;
use crate::meta_ref::MetaRef;

/// Size of one logical meta-block, in bytes.
pub const META_BLOCK_SIZE: usize = 8192;

/// High bit of the 2-byte on-disk length prefix: set when the payload that
/// follows is stored literally (compression did not shrink it).
const STORED_LITERAL_FLAG: u16 = 0x8000;

/// A forward-only meta-block stream writer over a [`SqfsFile`].
pub struct MetaWriter<'f, F: SqfsFile> {
	file: &'f mut F,
	compressor: Box<dyn Compressor>,
	pending: Vec<u8>,
	block_index: u64,
	file_offset: u64,
}

impl<'f, F: SqfsFile> MetaWriter<'f, F> {
	/// Creates a writer that appends meta-blocks starting at `file`'s
	/// current end.
	pub fn new(file: &'f mut F, compressor: Box<dyn Compressor>) -> Result<Self> {
		let file_offset = file.get_size()?;
		Ok(Self {
			file,
			compressor,
			pending: Vec::new(),
			block_index: 0,
			file_offset,
		})
	}

	/// Appends `bytes` to the stream, sealing and emitting any meta-blocks
	/// that become full in the process.
	pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
		self.pending.try_reserve(bytes.len())?;
		self.pending.extend_from_slice(bytes);
		while self.pending.len() >= META_BLOCK_SIZE {
			let rest = self.pending.split_off(META_BLOCK_SIZE);
			let block = std::mem::replace(&mut self.pending, rest);
			self.seal(&block)?;
		}
		Ok(())
	}

	/// Reports the logical position the next appended byte will reach: the
	/// index of the block currently being filled, and the byte offset
	/// within it, before that block has been sealed.
	pub fn get_position(&self) -> MetaRef {
		MetaRef::new(self.block_index, self.pending.len() as u16)
	}

	/// Returns the current length of the underlying file, i.e. the absolute
	/// offset the next sealed block will be written at.
	pub fn file_position(&self) -> u64 {
		self.file_offset
	}

	/// Forces the current partial block, if any, to be sealed and emitted.
	pub fn flush(&mut self) -> Result<()> {
		if !self.pending.is_empty() {
			let block = std::mem::take(&mut self.pending);
			self.seal(&block)?;
		}
		Ok(())
	}

	/// Flushes any pending bytes, then resets the block index to zero so a
	/// new logical table can begin in the same file.
	pub fn reset(&mut self) -> Result<()> {
		self.flush()?;
		self.block_index = 0;
		Ok(())
	}

	fn seal(&mut self, block: &[u8]) -> Result<()> {
		let compressed = self.compressor.compress(block)?;
		let (payload, stored_literal): (&[u8], bool) = if compressed.len() < block.len() {
			(&compressed, false)
		} else {
			(block, true)
		};

		let len = u16::try_from(payload.len())
			.map_err(|_| SqfsError::Overflow("meta-block payload too large"))?;
		if len & STORED_LITERAL_FLAG != 0 {
			return Err(SqfsError::Overflow("meta-block payload too large"));
		}
		let prefix = if stored_literal {
			len | STORED_LITERAL_FLAG
		} else {
			len
		};

		let mut out = Vec::with_capacity(2 + payload.len());
		put_u16(&mut out, prefix);
		out.extend_from_slice(payload);

		self.file.write_at(self.file_offset, &out)?;
		self.file_offset += out.len() as u64;
		self.block_index += 1;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::compressor::StoreCompressor;
	use crate::file::MemFile;

	#[test]
	fn position_advances_within_block() {
		let mut file = MemFile::new();
		let mut mw = MetaWriter::new(&mut file, Box::new(StoreCompressor)).unwrap();
		assert_eq!(mw.get_position(), MetaRef::new(0, 0));
		mw.append(&[0u8; 100]).unwrap();
		assert_eq!(mw.get_position(), MetaRef::new(0, 100));
	}

	#[test]
	fn seals_full_blocks_and_advances_block_index() {
		let mut file = MemFile::new();
		let mut mw = MetaWriter::new(&mut file, Box::new(StoreCompressor)).unwrap();
		mw.append(&vec![0xAB; META_BLOCK_SIZE]).unwrap();
		assert_eq!(mw.get_position(), MetaRef::new(1, 0));

		// 2-byte length prefix + stored-literal flag (store compressor
		// never shrinks anything) + the full block.
		let data = file.as_slice();
		assert_eq!(data.len(), 2 + META_BLOCK_SIZE);
		let prefix = u16::from_le_bytes([data[0], data[1]]);
		assert_eq!(prefix, META_BLOCK_SIZE as u16 | 0x8000);
	}

	#[test]
	fn flush_seals_partial_block() {
		let mut file = MemFile::new();
		let mut mw = MetaWriter::new(&mut file, Box::new(StoreCompressor)).unwrap();
		mw.append(&[1, 2, 3]).unwrap();
		mw.flush().unwrap();
		assert_eq!(file.as_slice().len(), 2 + 3);
		assert_eq!(mw.get_position(), MetaRef::new(1, 0));
	}

	#[test]
	fn reset_starts_new_logical_table() {
		let mut file = MemFile::new();
		let mut mw = MetaWriter::new(&mut file, Box::new(StoreCompressor)).unwrap();
		mw.append(&vec![0u8; META_BLOCK_SIZE + 10]).unwrap();
		mw.reset().unwrap();
		assert_eq!(mw.get_position(), MetaRef::new(0, 0));
	}
}
