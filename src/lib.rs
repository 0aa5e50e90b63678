//! Write-side encoders for two SquashFS on-disk tables: directory listings
//! and extended attributes.
//!
//! Both encoders are pure transformations over a caller-supplied sequence of
//! operations ([`dir_writer::DirWriter::begin`]/`add_entry`/`end`,
//! [`xattr_writer::XattrWriter::begin`]/`add`/`end`/`flush`) that write into
//! a shared [`meta_writer::MetaWriter`] stream. Building and driving that
//! stream, choosing a compressor, and assembling a full image from the
//! tables this crate produces are all left to the caller; see
//! [`config::Options`] for the handful of knobs this crate does own.

pub mod byte_stream;
pub mod compressor;
pub mod config;
pub mod dir_writer;
pub mod error;
pub mod file;
pub mod intern;
pub mod meta_ref;
pub mod meta_writer;
pub mod superblock;
pub mod xattr_writer;

pub use error::{Result, SqfsError};
