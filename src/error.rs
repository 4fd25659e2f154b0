//! Crate-wide error taxonomy (spec §7).

use std::io;
use thiserror::Error;

/// A malformed on-disk record: bad magic, impossible length, bad offset.
/// Fatal at the transaction level.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 8], found: [u8; 8] },

    #[error("unsupported WIM version: 0x{0:08X}")]
    BadVersion(u32),

    #[error("header length {0} != 208")]
    BadHeaderLength(u32),

    #[error("record length {field} is {value}, which is not a valid length here")]
    BadRecordLength { field: &'static str, value: u64 },

    #[error("offset {offset} exceeds archive bounds ({bound})")]
    OffsetOutOfBounds { offset: u64, bound: u64 },

    #[error("truncated record: needed {needed} bytes, found {found}")]
    Truncated { needed: usize, found: usize },

    #[error("malformed XML manifest: {0}")]
    Xml(String),
}

/// SHA-1 mismatch, either per-resource or per-integrity-window.
/// Treated as a reportable defect, not necessarily a fatal one.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("resource at offset {offset} failed SHA-1 verification")]
    ResourceHashMismatch { offset: u64 },

    #[error("integrity window {index} failed SHA-1 verification")]
    WindowHashMismatch { index: u64 },
}

/// Decompressor failure or an uncompressed-length mismatch; folded into
/// `IntegrityError` for that resource at the transaction layer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown codec id {0}")]
    UnknownCodec(u8),

    #[error("required codec back-end not registered: {0}")]
    CodecUnavailable(&'static str),

    #[error("decompressor produced {produced} bytes, expected {expected}")]
    WrongOutputLength { produced: usize, expected: usize },

    #[error("compressor produced zero bytes for a non-empty input")]
    EmptyOutput,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// read-only flag set, unknown image id, missing destination directory,
/// and similar preconditions. These fail fast, before any mutation begins.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("archive has the read-only flag set")]
    ReadOnly,

    #[error("unknown image id {0}")]
    UnknownImage(String),

    #[error("destination directory does not exist: {0}")]
    MissingDestination(String),

    #[error("source directory does not exist: {0}")]
    MissingSource(String),

    #[error("no image present in archive")]
    NoImages,
}

/// The top-level error type returned by every public `archive` operation.
#[derive(Debug, Error)]
pub enum WimError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("archive is not clean; write-in-progress flag was set and recovery truncation failed: {0}")]
    Recovery(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, WimError>;
