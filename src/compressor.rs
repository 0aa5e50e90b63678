//! The meta-block writer's compression backend.
//!
//! Compression algorithm choice is explicitly out of scope for this crate;
//! what's here is the narrow contract the meta-block writer needs plus the two implementations that make it testable:
//! [`StoreCompressor`], used throughout the test suite so assertions don't
//! depend on a real algorithm's exact output, and an optional
//! [`GzipCompressor`] for callers that want a real one without pulling in
//! their own.

use std::io;

/// A block compressor as consumed by [`crate::meta_writer::MetaWriter`].
pub trait Compressor {
	/// Compresses `input`. The meta-block writer stores the result only if
	/// it is smaller than `input`; otherwise it stores `input` literally.
	fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>>;

	/// Decompresses `input` back into its original bytes.
	fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>>;
}

/// A no-op compressor: "compression" is the identity function.
///
/// Every meta-block written through this compressor round-trips through the
/// literal-store path, since a same-size "compressed" result never beats
/// the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreCompressor;

impl Compressor for StoreCompressor {
	fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
		Ok(input.to_vec())
	}

	fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
		Ok(input.to_vec())
	}
}

/// A `gzip`-backed compressor, via `flate2`.
#[cfg(feature = "gzip")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipCompressor;

#[cfg(feature = "gzip")]
impl Compressor for GzipCompressor {
	fn compress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
		use std::io::Write;
		let mut enc =
			flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
		enc.write_all(input)?;
		enc.finish()
	}

	fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
		use std::io::Read;
		let mut dec = flate2::read::GzDecoder::new(input);
		let mut out = Vec::new();
		dec.read_to_end(&mut out)?;
		Ok(out)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn store_is_identity() {
		let c = StoreCompressor;
		let data = b"some data to round-trip";
		let compressed = c.compress(data).unwrap();
		assert_eq!(compressed, data);
		assert_eq!(c.decompress(&compressed).unwrap(), data);
	}

	#[cfg(feature = "gzip")]
	#[test]
	fn gzip_roundtrips() {
		let c = GzipCompressor;
		let data = vec![0u8; 4096];
		let compressed = c.compress(&data).unwrap();
		assert!(compressed.len() < data.len());
		assert_eq!(c.decompress(&compressed).unwrap(), data);
	}
}
