//! The xattr encoder: deduplicates key/value pairs and whole sets of them,
//! clusters the survivors into pair blocks, and emits the block-descriptor
//! and meta-block location tables a reader needs to find them again.
//!
//! Values are arbitrary bytes but the intern table's contract is text, so
//! every value is hex-encoded (low nibble first, then high) before it is
//! interned; [`crate::byte_stream::hex_decode`] reverses that at write time.

use tracing::{debug, trace};

use crate::byte_stream::{checked_add, hex_decode, hex_encode, put_u16, put_u32, put_u64};
use crate::compressor::Compressor;
use crate::error::{Result, SqfsError};
use crate::file::SqfsFile;
use crate::intern::StrTable;
use crate::meta_writer::MetaWriter;
use crate::superblock::{Superblock, NO_XATTR_TABLE};

/// Sentinel out-of-line value location, meaning "not materialized yet".
const OOL_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Sentinel inode xattr index meaning "this inode carries no xattrs".
pub const NO_XATTR_ID: u32 = 0xFFFF_FFFF;

/// Bit 8 of an on-disk xattr key's `type` field: the paired value record is
/// stored out-of-line rather than inline.
const XATTR_FLAG_OOL: u16 = 0x0100;

/// Recognized xattr key namespaces, matched against the prefix before the
/// first `.` in the key.
fn namespace_id(key: &[u8]) -> Option<(u16, usize)> {
	let dot = key.iter().position(|&b| b == b'.')?;
	let id = match &key[..dot] {
		b"user" => 0,
		b"trusted" => 1,
		b"security" => 2,
		_ => return None,
	};
	Some((id, dot))
}

fn pack_pair(key_id: u32, value_id: u32) -> u64 {
	((key_id as u64) << 32) | value_id as u64
}

fn pair_key(pair: u64) -> u32 {
	(pair >> 32) as u32
}

fn pair_value(pair: u64) -> u32 {
	(pair & 0xFFFF_FFFF) as u32
}

/// Whether a value is cheaper to store once out-of-line than inline at every
/// reference.
///
/// Inline cost is `refcount * len`; out-of-line cost is `len + (refcount -
/// 1) * 8` (one real record plus an 8-byte pointer at every other
/// reference). The break-even point is `len == 8`.
fn should_store_ool(decoded_len: usize, refcount: u32) -> bool {
	if refcount < 2 {
		return false;
	}
	decoded_len > 8
}

/// A finalized, deduplicated pair block: a run of `kv_pairs` written as one
/// unit by [`XattrWriter::end`].
struct KvBlockDesc {
	/// Start index into `kv_pairs` of this block's pairs.
	start: usize,
	/// Number of pairs in this block.
	count: usize,
	/// Meta-stream position of the block's first record, captured at flush.
	start_ref: u64,
	/// Total bytes the block occupies in the pair meta-stream.
	size_bytes: u32,
}

/// Accumulates per-inode xattr sets, deduplicates them, and serializes the
/// result at image finalization.
///
/// One `begin`/`add`*/`end` cycle per inode that carries xattrs; `flush` is
/// called once, after every inode has been processed.
#[derive(Default)]
pub struct XattrWriter {
	keys: StrTable,
	values: StrTable,
	kv_pairs: Vec<u64>,
	kv_start: usize,
	kv_blocks: Vec<KvBlockDesc>,
}

impl XattrWriter {
	/// Creates an empty writer.
	pub fn new() -> Self {
		Self::default()
	}

	/// Starts accumulating the xattr set for one inode.
	pub fn begin(&mut self) {
		self.kv_start = self.kv_pairs.len();
	}

	/// Adds one key/value pair to the xattr set currently being built.
	///
	/// `key` must carry a recognized namespace prefix (`user.`, `trusted.`,
	/// or `security.`) or this returns [`SqfsError::Unsupported`]. Adding the
	/// same key twice overwrites the earlier value, matching "last write
	/// wins" for a single inode's attribute set.
	pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
		if namespace_id(key).is_none() {
			return Err(SqfsError::Unsupported("xattr key namespace"));
		}

		let key_id = self.keys.get_index(key)?;
		let value_id = self.values.get_index(&hex_encode(value))?;
		self.values.add_ref(value_id);

		let pair = pack_pair(key_id, value_id);

		for slot in &mut self.kv_pairs[self.kv_start..] {
			if *slot == pair {
				return Ok(());
			}
			if pair_key(*slot) == key_id {
				self.values.del_ref(pair_value(*slot));
				*slot = pair;
				return Ok(());
			}
		}

		self.kv_pairs.try_reserve(1)?;
		self.kv_pairs.push(pair);
		Ok(())
	}

	/// Finalizes the xattr set started by the last [`XattrWriter::begin`]:
	/// sorts it, matches it against already-finalized blocks, and either
	/// reuses the match (rolling back the fresh pairs' value references) or
	/// commits it as a new block.
	///
	/// Returns the block's descriptor index, to be stored as the inode's
	/// xattr reference, or [`NO_XATTR_TABLE`]'s 32-bit counterpart if the
	/// inode carries no xattrs at all.
	pub fn end(&mut self) -> Result<u32> {
		let count = self.kv_pairs.len() - self.kv_start;
		if count == 0 {
			return Ok(NO_XATTR_ID);
		}

		self.kv_pairs[self.kv_start..].sort_unstable();

		let fresh = self.kv_start..self.kv_start + count;
		let matched = self.kv_blocks.iter().position(|blk| {
			blk.count == count
				&& self.kv_pairs[blk.start..blk.start + blk.count] == self.kv_pairs[fresh.clone()]
		});

		if let Some(idx) = matched {
			let blk_start = self.kv_blocks[idx].start;
			for i in 0..count {
				let fresh_value = pair_value(self.kv_pairs[self.kv_start + i]);
				self.values.del_ref(fresh_value);
				let existing_value = pair_value(self.kv_pairs[blk_start + i]);
				self.values.add_ref(existing_value);
			}
			self.kv_pairs.truncate(self.kv_start);
			trace!(block = idx, "xattr set deduplicated against existing block");
			return Ok(idx as u32);
		}

		let idx =
			u32::try_from(self.kv_blocks.len()).map_err(|_| SqfsError::Overflow("xattr descriptor index"))?;
		if idx == NO_XATTR_ID {
			return Err(SqfsError::Overflow("xattr descriptor index"));
		}

		self.kv_blocks.try_reserve(1)?;
		self.kv_blocks.push(KvBlockDesc {
			start: self.kv_start,
			count,
			start_ref: 0,
			size_bytes: 0,
		});
		debug!(block = idx, count, "new xattr block committed");
		Ok(idx)
	}

	/// Serializes every accumulated state to `file`, using `compressor` for
	/// the meta-block streams it writes, and updates `super_block`'s xattr
	/// fields.
	///
	/// No-op beyond the super-block fixup if no inode ever carried an xattr.
	pub fn flush<F: SqfsFile>(
		&mut self,
		file: &mut F,
		compressor: Box<dyn Compressor>,
		super_block: &mut Superblock,
	) -> Result<()> {
		if self.kv_pairs.is_empty() || self.kv_blocks.is_empty() {
			super_block.xattr_id_table_start = NO_XATTR_TABLE;
			super_block.no_xattrs = true;
			return Ok(());
		}

		let kv_start_file = file.get_size()?;
		let mut mw = MetaWriter::new(file, compressor)?;

		self.write_kv_pairs(&mut mw)?;
		let id_start_file = mw.file_position();

		mw.reset()?;
		let locations = self.write_id_table(&mut mw)?;
		let id_table_start = mw.file_position();

		super_block.xattr_id_table_start = id_table_start;
		super_block.no_xattrs = false;

		self.write_location_table(file, kv_start_file, id_start_file, &locations)?;
		Ok(())
	}

	fn write_kv_pairs<F: SqfsFile>(&mut self, mw: &mut MetaWriter<'_, F>) -> Result<()> {
		let mut ool_loc = vec![OOL_SENTINEL; self.values.num_strings()];

		for blk_idx in 0..self.kv_blocks.len() {
			let start_ref = mw.get_position().pack();
			self.kv_blocks[blk_idx].start_ref = start_ref;

			let (start, count) = {
				let blk = &self.kv_blocks[blk_idx];
				(blk.start, blk.count)
			};

			let mut total = 0u32;
			for i in 0..count {
				let pair = self.kv_pairs[start + i];
				let key_id = pair_key(pair);
				let value_id = pair_value(pair);

				let written = if ool_loc[value_id as usize] == OOL_SENTINEL {
					let key_bytes = self.write_key(mw, key_id, false)?;
					let (value_bytes, value_ref) = self.write_value(mw, value_id)?;

					let decoded_len = self.values.get_string(value_id).len() / 2;
					let refcount = self.values.get_ref_count(value_id);
					if should_store_ool(decoded_len, refcount) {
						ool_loc[value_id as usize] = value_ref;
					}
					key_bytes + value_bytes
				} else {
					let key_bytes = self.write_key(mw, key_id, true)?;
					let value_bytes = write_value_ool(mw, ool_loc[value_id as usize])?;
					key_bytes + value_bytes
				};

				total = checked_add(total as u64, written as u64, "xattr block size")? as u32;
			}

			self.kv_blocks[blk_idx].size_bytes = total;
		}

		mw.flush()
	}

	fn write_key<F: SqfsFile>(&self, mw: &mut MetaWriter<'_, F>, key_id: u32, ool: bool) -> Result<u32> {
		let key = self.keys.get_string(key_id);
		let (ns, dot) = namespace_id(key).expect("namespace validated in add()");
		let suffix = &key[dot + 1..];

		let mut type_field = ns;
		if ool {
			type_field |= XATTR_FLAG_OOL;
		}
		let size = u16::try_from(suffix.len()).map_err(|_| SqfsError::Overflow("xattr key size"))?;

		let mut rec = Vec::with_capacity(4 + suffix.len());
		put_u16(&mut rec, type_field);
		put_u16(&mut rec, size);
		rec.extend_from_slice(suffix);
		mw.append(&rec)?;
		Ok(rec.len() as u32)
	}

	fn write_value<F: SqfsFile>(&self, mw: &mut MetaWriter<'_, F>, value_id: u32) -> Result<(u32, u64)> {
		let value_ref = mw.get_position().pack();
		let decoded = hex_decode(self.values.get_string(value_id));
		let size = u32::try_from(decoded.len()).map_err(|_| SqfsError::Overflow("xattr value size"))?;

		let mut rec = Vec::with_capacity(4 + decoded.len());
		put_u32(&mut rec, size);
		rec.extend_from_slice(&decoded);
		mw.append(&rec)?;
		Ok((rec.len() as u32, value_ref))
	}

	/// Meta-block location table for the id table: entry 0 is the block the
	/// id table's meta-stream actually starts at, captured explicitly rather
	/// than assumed to be 0; subsequent entries capture the block index
	/// whenever it advances past the last one recorded.
	fn write_id_table<F: SqfsFile>(&mut self, mw: &mut MetaWriter<'_, F>) -> Result<Vec<u64>> {
		let mut last_block = mw.get_position().block;
		let mut locations = vec![last_block];

		for blk in &self.kv_blocks {
			let mut rec = Vec::with_capacity(16);
			put_u64(&mut rec, blk.start_ref);
			put_u32(&mut rec, blk.count as u32);
			put_u32(&mut rec, blk.size_bytes);
			mw.append(&rec)?;

			let block = mw.get_position().block;
			if block != last_block {
				locations.push(block);
				last_block = block;
			}
		}

		mw.flush()?;
		Ok(locations)
	}

	/// Writes the `XattrIdTable` header and its location array directly to
	/// `file`, outside any meta-block: a reader locates this structure by the
	/// super-block's `xattr_id_table_start` field alone.
	fn write_location_table<F: SqfsFile>(
		&self,
		file: &mut F,
		kv_start_file: u64,
		id_start_file: u64,
		locations: &[u64],
	) -> Result<()> {
		let num_blocks =
			u32::try_from(self.kv_blocks.len()).map_err(|_| SqfsError::Overflow("xattr block count"))?;

		let mut buf = Vec::with_capacity(16 + locations.len() * 8);
		put_u64(&mut buf, kv_start_file);
		put_u32(&mut buf, num_blocks);
		put_u32(&mut buf, 0);
		for &loc in locations {
			let abs = checked_add(loc, id_start_file, "xattr id-table location")?;
			put_u64(&mut buf, abs);
		}

		let at = file.get_size()?;
		file.write_at(at, &buf)?;
		Ok(())
	}
}

fn write_value_ool<F: SqfsFile>(mw: &mut MetaWriter<'_, F>, location: u64) -> Result<u32> {
	let mut rec = Vec::with_capacity(12);
	put_u32(&mut rec, 8);
	put_u64(&mut rec, location);
	mw.append(&rec)?;
	Ok(rec.len() as u32)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::compressor::StoreCompressor;
	use crate::file::MemFile;

	#[test]
	fn rejects_unknown_namespace() {
		let mut w = XattrWriter::new();
		w.begin();
		assert!(w.add(b"bogus.thing", b"x").is_err());
	}

	#[test]
	fn overwrite_within_inode_keeps_last_value() {
		let mut w = XattrWriter::new();
		w.begin();
		w.add(b"user.a", b"first").unwrap();
		w.add(b"user.a", b"second").unwrap();
		let idx = w.end().unwrap();
		assert_eq!(idx, 0);
		assert_eq!(w.kv_blocks[0].count, 1);
	}

	#[test]
	fn identical_sets_dedup_to_one_block() {
		let mut w = XattrWriter::new();
		w.begin();
		w.add(b"user.a", b"v1").unwrap();
		w.add(b"trusted.b", b"v2").unwrap();
		let first = w.end().unwrap();

		w.begin();
		w.add(b"trusted.b", b"v2").unwrap();
		w.add(b"user.a", b"v1").unwrap();
		let second = w.end().unwrap();

		assert_eq!(first, second);
		assert_eq!(w.kv_blocks.len(), 1);
	}

	#[test]
	fn distinct_sets_get_distinct_blocks() {
		let mut w = XattrWriter::new();
		w.begin();
		w.add(b"user.a", b"v1").unwrap();
		let first = w.end().unwrap();

		w.begin();
		w.add(b"user.a", b"v2").unwrap();
		let second = w.end().unwrap();

		assert_ne!(first, second);
		assert_eq!(w.kv_blocks.len(), 2);
	}

	#[test]
	fn ool_cost_rule_matches_break_even_point() {
		assert!(!should_store_ool(9, 1));
		assert!(!should_store_ool(8, 5));
		assert!(should_store_ool(9, 2));
		assert!(!should_store_ool(9, 0));
	}

	#[test]
	fn no_xattrs_sets_sentinel_and_flag() {
		let mut w = XattrWriter::new();
		let mut file = MemFile::new();
		let mut sb = Superblock::new();
		w.flush(&mut file, Box::new(StoreCompressor), &mut sb).unwrap();
		assert_eq!(sb.xattr_id_table_start, NO_XATTR_TABLE);
		assert!(sb.no_xattrs);
		assert!(file.as_slice().is_empty());
	}

	#[test]
	fn flush_writes_kv_pairs_id_table_and_location_header() {
		let mut w = XattrWriter::new();
		w.begin();
		w.add(b"user.a", b"hello").unwrap();
		w.end().unwrap();

		let mut file = MemFile::new();
		let mut sb = Superblock::new();
		w.flush(&mut file, Box::new(StoreCompressor), &mut sb).unwrap();

		assert!(!sb.no_xattrs);
		assert_ne!(sb.xattr_id_table_start, NO_XATTR_TABLE);
		assert!(file.get_size().unwrap() > sb.xattr_id_table_start);

		let data = file.as_slice();
		let header_start = sb.xattr_id_table_start as usize;
		let xattr_table_start = u64::from_le_bytes(data[header_start..header_start + 8].try_into().unwrap());
		let xattr_ids = u32::from_le_bytes(data[header_start + 8..header_start + 12].try_into().unwrap());
		assert_eq!(xattr_table_start, 0);
		assert_eq!(xattr_ids, 1);
	}

	#[test]
	fn shared_value_stores_inline_once_and_ool_for_the_rest() {
		let long_value = vec![0u8; 16];
		let mut w = XattrWriter::new();
		for key in [b"user.a".as_slice(), b"user.b", b"user.c"] {
			w.begin();
			w.add(key, &long_value).unwrap();
			w.end().unwrap();
		}
		assert_eq!(w.kv_blocks.len(), 3);

		let mut file = MemFile::new();
		let mut sb = Superblock::new();
		w.flush(&mut file, Box::new(StoreCompressor), &mut sb).unwrap();

		let data = file.as_slice();
		let len = u16::from_le_bytes([data[0], data[1]]) & 0x7FFF;
		let body = &data[2..2 + len as usize];

		let mut pos = 0usize;
		let mut inline_count = 0;
		let mut ool_count = 0;
		while pos < body.len() {
			let key_type = u16::from_le_bytes([body[pos], body[pos + 1]]);
			let key_size = u16::from_le_bytes([body[pos + 2], body[pos + 3]]) as usize;
			pos += 4 + key_size;
			let value_size = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
			pos += 4 + value_size;
			if key_type & XATTR_FLAG_OOL != 0 {
				ool_count += 1;
				assert_eq!(value_size, 8);
			} else {
				inline_count += 1;
				assert_eq!(value_size, 16);
			}
		}
		assert_eq!(inline_count, 1);
		assert_eq!(ool_count, 2);
	}

	#[test]
	fn value_shared_across_inodes_can_go_out_of_line() {
		let mut w = XattrWriter::new();
		let long_value = vec![0x42u8; 32];

		w.begin();
		w.add(b"user.a", &long_value).unwrap();
		w.end().unwrap();

		w.begin();
		w.add(b"user.b", &long_value).unwrap();
		w.end().unwrap();

		let value_id = w.values.get_index(&hex_encode(&long_value)).unwrap();
		assert_eq!(w.values.get_ref_count(value_id), 2);
		assert!(should_store_ool(long_value.len(), 2));

		let mut file = MemFile::new();
		let mut sb = Superblock::new();
		w.flush(&mut file, Box::new(StoreCompressor), &mut sb).unwrap();
		assert!(!sb.no_xattrs);
	}

	proptest::proptest! {
		#[test]
		fn finalized_blocks_stay_sorted(
			sets in proptest::collection::vec(
				proptest::collection::vec((0usize..5, 0u8..255), 1..8),
				1..20,
			)
		) {
			let mut w = XattrWriter::new();
			for set in &sets {
				w.begin();
				for (k, v) in set {
					let key = format!("user.k{k}");
					let _ = w.add(key.as_bytes(), &[*v]);
				}
				let _ = w.end();
			}

			for blk in &w.kv_blocks {
				let pairs = &w.kv_pairs[blk.start..blk.start + blk.count];
				for pair in pairs.windows(2) {
					proptest::prop_assert!(pair[0] <= pair[1]);
				}
			}
		}

		#[test]
		fn descriptor_index_never_exceeds_block_count(
			sets in proptest::collection::vec(
				proptest::collection::vec((0usize..5, 0u8..255), 1..8),
				1..20,
			)
		) {
			let mut w = XattrWriter::new();
			for set in &sets {
				w.begin();
				for (k, v) in set {
					let key = format!("user.k{k}");
					let _ = w.add(key.as_bytes(), &[*v]);
				}
				if let Ok(idx) = w.end() {
					proptest::prop_assert!((idx as usize) < w.kv_blocks.len());
				}
			}
		}
	}
}
