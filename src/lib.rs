//! # wimrs — content-addressed, chunk-compressed disk-image archive engine
//!
//! Format guarantees (spec §3):
//! - All integers are little-endian; the header magic is the literal 8 bytes
//!   `MSWIM\0\0\0`, header length is fixed at 208, version is `0x00010D00`.
//! - At most one compression flag (XPRESS or LZX) is set; when either is,
//!   the uncompressed chunk size is exactly 32768 bytes.
//! - Content is deduplicated archive-wide by SHA-1; the offset table is the
//!   single content-addressed index every operation consults.
//! - A write-in-progress bit guards every mutation; a reader that finds it
//!   set truncates back to the last known-good XML tail before proceeding
//!   (see [`recovery`]).
//! - Platform-specific metadata (security descriptors, reparse points,
//!   alternate data streams, short names) is carried as opaque blobs and
//!   indices through the narrow [`platform::PlatformCapabilities`] trait —
//!   never interpreted by the core.

pub mod archive;
pub mod chunked;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod hash;
pub mod header;
pub mod metadata;
pub mod perf;
pub mod platform;
pub mod records;
pub mod recovery;
pub mod time;
pub mod wildcard;
pub mod xml;

// Flat re-exports for the most common types.
pub use archive::{
    apply, append, capture, delete, export, split, test, update, ImageNaming, TestReport,
    WimArchive, WriteOptions, WriteSummary,
};
pub use codec::{ChunkCodec, CodecRegistry};
pub use error::{CodecError, FormatError, IntegrityError, PreconditionError, Result, WimError};
pub use hash::Sha1Key;
pub use header::{CompressionKind, WimHeader};
pub use metadata::{DirEntry, ParsedMetadata};
pub use records::{IntegrityTable, OffsetTableEntry, ResourceHeader};
pub use xml::{ImageXmlInfo, WimXml};
