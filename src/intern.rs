//! A dense, reference-counted string interning table.
//!
//! Both the xattr key table and value table are instances of this: arbitrary
//! byte strings map to monotonically assigned 32-bit ids, with O(1) lookup
//! in either direction and a per-id reference count the xattr encoder uses
//! to decide whether a value is worth storing out-of-line.

use std::collections::HashMap;

use crate::error::{Result, SqfsError};

/// A table interning byte strings into dense `u32` ids.
#[derive(Default, Clone)]
pub struct StrTable {
	strings: Vec<Vec<u8>>,
	refcounts: Vec<u32>,
	by_string: HashMap<Vec<u8>, u32>,
}

impl StrTable {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the id for `s`, interning it if not already present.
	///
	/// Does not touch the reference count; callers that want a fresh
	/// reference call [`StrTable::add_ref`] explicitly, matching the
	/// two-step "resolve, then reference" shape the xattr encoder needs.
	pub fn get_index(&mut self, s: &[u8]) -> Result<u32> {
		if let Some(&id) = self.by_string.get(s) {
			return Ok(id);
		}

		let id = u32::try_from(self.strings.len())
			.map_err(|_| SqfsError::Overflow("string table id"))?;

		self.strings.try_reserve(1)?;
		self.refcounts.try_reserve(1)?;
		self.by_string.try_reserve(1)?;

		self.strings.push(s.to_vec());
		self.refcounts.push(0);
		self.by_string.insert(s.to_vec(), id);
		Ok(id)
	}

	/// Increments the reference count of `id`.
	pub fn add_ref(&mut self, id: u32) {
		self.refcounts[id as usize] += 1;
	}

	/// Decrements the reference count of `id`.
	///
	/// Saturates at zero: a block that is deduplicated away can otherwise
	/// race a decrement against a not-yet-applied increment for the same
	/// logical reference (see `xattr_writer::end`).
	pub fn del_ref(&mut self, id: u32) {
		self.refcounts[id as usize] = self.refcounts[id as usize].saturating_sub(1);
	}

	/// Returns the current reference count of `id`.
	pub fn get_ref_count(&self, id: u32) -> u32 {
		self.refcounts[id as usize]
	}

	/// Returns the interned bytes for `id`.
	pub fn get_string(&self, id: u32) -> &[u8] {
		&self.strings[id as usize]
	}

	/// Returns the number of distinct strings interned so far.
	pub fn num_strings(&self) -> usize {
		self.strings.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn interns_densely_and_dedups() {
		let mut t = StrTable::new();
		let a = t.get_index(b"user.foo").unwrap();
		let b = t.get_index(b"user.bar").unwrap();
		let a2 = t.get_index(b"user.foo").unwrap();
		assert_eq!(a, 0);
		assert_eq!(b, 1);
		assert_eq!(a, a2);
		assert_eq!(t.num_strings(), 2);
	}

	#[test]
	fn refcounts_track_add_del() {
		let mut t = StrTable::new();
		let id = t.get_index(b"v").unwrap();
		assert_eq!(t.get_ref_count(id), 0);
		t.add_ref(id);
		t.add_ref(id);
		assert_eq!(t.get_ref_count(id), 2);
		t.del_ref(id);
		assert_eq!(t.get_ref_count(id), 1);
	}
}
