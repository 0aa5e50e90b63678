//! The directory encoder: clusters directory entries into headers with
//! delta-encoded inode numbers, and produces a parallel sparse directory
//! index.
//!
//! Groups are maximal runs sharing one inode meta-block and a small inode
//! number delta, capped at [`SQFS_MAX_DIR_ENT`] entries and (normally) at one
//! meta-block's worth of bytes. The one exception: the first entry considered
//! for a new header is always admitted, even if its own record alone would
//! overrun a meta-block (see [`crate::config::Options`]).

use tracing::{debug, trace};

use crate::byte_stream::{checked_add, put_i16_bits, put_u16, put_u32};
use crate::config::Options;
use crate::error::{Result, SqfsError};
use crate::file::SqfsFile;
use crate::meta_ref::MetaRef;
use crate::meta_writer::{MetaWriter, META_BLOCK_SIZE};

/// Maximum number of entries a single directory header may cover.
pub const SQFS_MAX_DIR_ENT: usize = 256;

/// SquashFS basic inode type codes, as written into a directory entry's
/// `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FileType {
	Directory = 1,
	Regular = 2,
	Symlink = 3,
	BlockDev = 4,
	CharDev = 5,
	Fifo = 6,
	Socket = 7,
}

/// Unix mode bits, from `<sys/stat.h>`.
mod mode_bits {
	pub const S_IFMT: u32 = 0o170000;
	pub const S_IFSOCK: u32 = 0o140000;
	pub const S_IFLNK: u32 = 0o120000;
	pub const S_IFREG: u32 = 0o100000;
	pub const S_IFBLK: u32 = 0o060000;
	pub const S_IFDIR: u32 = 0o040000;
	pub const S_IFCHR: u32 = 0o020000;
	pub const S_IFIFO: u32 = 0o010000;
}

/// Maps a Unix file mode to a SquashFS basic inode type, or
/// [`SqfsError::Unsupported`] if `mode` names a type the format has no
/// inode for.
fn file_type_of_mode(mode: u32) -> Result<FileType> {
	use mode_bits::*;
	match mode & S_IFMT {
		S_IFSOCK => Ok(FileType::Socket),
		S_IFLNK => Ok(FileType::Symlink),
		S_IFREG => Ok(FileType::Regular),
		S_IFBLK => Ok(FileType::BlockDev),
		S_IFDIR => Ok(FileType::Directory),
		S_IFCHR => Ok(FileType::CharDev),
		S_IFIFO => Ok(FileType::Fifo),
		_ => Err(SqfsError::Unsupported("directory entry mode")),
	}
}

/// A pending directory entry, in insertion order.
struct DirEntry {
	inode_ref: u64,
	inode_num: u32,
	file_type: FileType,
	name: Vec<u8>,
}

/// One emitted header's index hint: the first entry it covers, the
/// meta-block it was written to, and the running byte offset into the
/// directory listing at the moment it was emitted.
struct IndexDescriptor {
	/// Index into `entries` of the group's first entry (entries aren't
	/// dropped after grouping, so this stays valid for the lifetime of one
	/// `begin..end` cycle).
	ref_entry: usize,
	meta_block: u64,
	running_dir_size: u32,
}

/// Encodes one directory's entries into a meta-block stream, plus a sparse
/// index over the emitted headers.
///
/// Reusable across directories: call [`DirWriter::begin`] to start a new
/// one.
pub struct DirWriter {
	entries: Vec<DirEntry>,
	index: Vec<IndexDescriptor>,
	dir_ref: u64,
	dir_size: u64,
	idx_size: u64,
	options: Options,
}

impl Default for DirWriter {
	fn default() -> Self {
		Self::with_options(Options::default())
	}
}

impl DirWriter {
	/// Creates an empty writer with default options. Call [`DirWriter::begin`]
	/// before adding entries.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates an empty writer with caller-chosen [`Options`].
	pub fn with_options(options: Options) -> Self {
		Self {
			entries: Vec::new(),
			index: Vec::new(),
			dir_ref: 0,
			dir_size: 0,
			idx_size: 0,
			options,
		}
	}

	/// Starts encoding a new directory: captures `dm`'s current position as
	/// this directory's reference, and clears any state left over from a
	/// previous directory.
	pub fn begin<F: SqfsFile>(&mut self, dm: &MetaWriter<'_, F>) {
		self.entries.clear();
		self.index.clear();
		self.dir_ref = dm.get_position().pack();
		self.dir_size = 0;
		self.idx_size = 0;
	}

	/// Adds one entry to the directory currently being built.
	///
	/// Returns [`SqfsError::Unsupported`] if `mode` names a type the format
	/// cannot represent; the caller must not add this entry in that case.
	pub fn add_entry(
		&mut self,
		name: &[u8],
		inode_num: u32,
		inode_ref: u64,
		mode: u32,
	) -> Result<()> {
		let file_type = file_type_of_mode(mode)?;
		self.entries.try_reserve(1)?;
		self.entries.push(DirEntry {
			inode_ref,
			inode_num,
			file_type,
			name: name.to_vec(),
		});
		// header (8 B) + name, bookkeeping size for the running index offset.
		self.dir_size = checked_add(
			self.dir_size,
			8 + name.len() as u64,
			"directory entry size",
		)?;
		Ok(())
	}

	/// Groups the pending entries into headers and appends them, and their
	/// entry records, to `dm`.
	pub fn end<F: SqfsFile>(&mut self, dm: &mut MetaWriter<'_, F>) -> Result<()> {
		let mut i = 0;
		while i < self.entries.len() {
			let pos = dm.get_position();
			let count = conseq_entry_count(pos.offset, &self.entries[i..]);

			if count == 1 && !self.options.straddle_oversized_first_entry {
				let head = &self.entries[i];
				let size = pos.offset as u64 + 12 + 8 + head.name.len() as u64;
				if size > META_BLOCK_SIZE as u64 {
					return Err(SqfsError::Overflow(
						"directory entry exceeds a meta-block and straddling is disabled",
					));
				}
			}

			self.add_header(dm, i, count, pos.block)?;

			let first_inode_num = self.entries[i].inode_num;

			for e in &self.entries[i..i + count] {
				let diff = i16::try_from(e.inode_num as i64 - first_inode_num as i64)
					.map_err(|_| SqfsError::Overflow("inode_diff"))?;
				let offset = (e.inode_ref & 0xFFFF) as u16;

				let mut rec = Vec::with_capacity(8 + e.name.len());
				put_u16(&mut rec, offset);
				put_i16_bits(&mut rec, diff);
				put_u16(&mut rec, e.file_type as u16);
				let size = u16::try_from(e.name.len().saturating_sub(1))
					.map_err(|_| SqfsError::Overflow("directory entry name length"))?;
				put_u16(&mut rec, size);
				rec.extend_from_slice(&e.name);

				trace!(name = ?String::from_utf8_lossy(&e.name), "directory entry");
				dm.append(&rec)?;
			}

			i += count;
		}
		Ok(())
	}

	fn add_header<F: SqfsFile>(
		&mut self,
		dm: &mut MetaWriter<'_, F>,
		first_idx: usize,
		count: usize,
		block: u64,
	) -> Result<()> {
		let first = &self.entries[first_idx];

		let mut hdr = Vec::with_capacity(12);
		put_u32(&mut hdr, (count - 1) as u32);
		put_u32(&mut hdr, (first.inode_ref >> 16) as u32);
		put_u32(&mut hdr, first.inode_num);
		dm.append(&hdr)?;

		debug!(count, block, "emitted directory header");

		self.index.try_reserve(1)?;
		self.index.push(IndexDescriptor {
			ref_entry: first_idx,
			meta_block: block,
			running_dir_size: self.dir_size as u32,
		});

		self.dir_size = checked_add(self.dir_size, 12, "directory size")?;
		self.idx_size += 1;
		Ok(())
	}

	/// Total number of bytes appended to the directory meta-stream since
	/// [`DirWriter::begin`].
	pub fn get_size(&self) -> u64 {
		self.dir_size
	}

	/// The `(block, offset)` of the first byte of this directory's listing,
	/// as captured by [`DirWriter::begin`].
	pub fn get_dir_reference(&self) -> u64 {
		self.dir_ref
	}

	/// Number of headers emitted by the last [`DirWriter::end`] call.
	pub fn get_index_size(&self) -> u64 {
		self.idx_size
	}

	/// Serializes the sparse directory index to `index_sink`.
	pub fn write_index<F: SqfsFile>(&self, index_sink: &mut MetaWriter<'_, F>) -> Result<()> {
		for idx in &self.index {
			let first = &self.entries[idx.ref_entry];

			let mut rec = Vec::with_capacity(12 + first.name.len());
			put_u32(&mut rec, idx.meta_block as u32);
			put_u32(&mut rec, idx.running_dir_size);
			let size = u16::try_from(first.name.len().saturating_sub(1))
				.map_err(|_| SqfsError::Overflow("directory index name length"))?;
			put_u32(&mut rec, size as u32);
			rec.extend_from_slice(&first.name);

			index_sink.append(&rec)?;
		}
		Ok(())
	}
}

/// Computes the largest group starting at `head` that satisfies the four
/// grouping constraints above, given the meta-stream offset `offset` the
/// group's header would start at.
fn conseq_entry_count(offset: u16, entries: &[DirEntry]) -> usize {
	let head = &entries[0];
	let mut size = (offset as u64 + 12) % META_BLOCK_SIZE as u64;
	let mut count = 0;

	for it in entries {
		if (it.inode_ref >> 16) != (head.inode_ref >> 16) {
			break;
		}

		let diff = it.inode_num as i64 - head.inode_num as i64;
		if !(-32767..=32767).contains(&diff) {
			break;
		}

		size += 8 + it.name.len() as u64;

		// the first entry in a group is always admitted, even if it alone
		// overruns a meta-block; grouping must make progress regardless of
		// options, so this is unconditional. `Options::
		// straddle_oversized_first_entry` gates whether that admission is
		// allowed to stand, checked by the caller once the group size is
		// known.
		if count > 0 && size > META_BLOCK_SIZE as u64 {
			break;
		}

		count += 1;
		if count == SQFS_MAX_DIR_ENT {
			break;
		}
	}

	count
}
