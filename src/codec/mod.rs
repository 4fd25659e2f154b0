//! Pluggable chunk codecs (C4, spec §1/§4.4): the copy codec plus two
//! pluggable back-end slots, `Xpress` and `Lzx`. The real Microsoft XPRESS
//! Huffman / LZX bitstream algorithms are out of scope (spec §1: "invoked as
//! pluggable codec back-ends"); this module defines the slot interface and
//! ships a default, swappable registration for each slot so the pipeline and
//! CLI are runnable end to end (SPEC_FULL.md Supplemented Features).
//!
//! Grounded on `byte271-6cy/codec/mod.rs`'s `Codec` trait/factory shape and
//! `byte271-6cy/plugin.rs`'s C-ABI plugin pattern, generalized from an open
//! set of codec UUIDs to exactly the two named WIM codec slots.

pub mod plugin;
pub mod pool;

use crate::error::CodecError;
use crate::header::CompressionKind;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A codec that operates on one 32768-byte (or final, shorter) chunk at a
/// time — the granularity the worker pool dispatches at (C4).
pub trait ChunkCodec: Send + Sync {
    /// Compress one chunk. The caller is responsible for falling back to raw
    /// storage if the result is not smaller than `data` (C3's raw-chunk
    /// rule) — a codec only ever reports what it produced.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompress one chunk to exactly `expected_len` bytes.
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError>;
}

/// The identity codec: every chunk is stored verbatim. Used for
/// `CompressionKind::Copy` and as the fallback a worker reports to when a
/// real codec fails to shrink a chunk.
pub struct CopyCodec;

impl ChunkCodec for CopyCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        if data.len() != expected_len {
            return Err(CodecError::WrongOutputLength { produced: data.len(), expected: expected_len });
        }
        Ok(data.to_vec())
    }
}

/// Default back-end registered under the XPRESS slot. zstd at a low level
/// approximates XPRESS's "fast, modest ratio" profile well enough to drive
/// the pipeline and its tests; it is not bit-compatible with Microsoft's
/// XPRESS Huffman format (see module docs and DESIGN.md).
pub struct ZstdBackend {
    pub level: i32,
}

impl ChunkCodec for ZstdBackend {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, self.level).map_err(CodecError::Io)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let out = zstd::decode_all(data).map_err(CodecError::Io)?;
        if out.len() != expected_len {
            return Err(CodecError::WrongOutputLength { produced: out.len(), expected: expected_len });
        }
        Ok(out)
    }
}

/// Default back-end registered under the LZX slot, standing in the same way
/// `ZstdBackend` stands in for XPRESS.
pub struct Lz4Backend;

impl ChunkCodec for Lz4Backend {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress(data))
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress(data, expected_len)
            .map_err(|e| CodecError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

/// A process-wide registry mapping each compressible slot to its current
/// back-end. `--threads`/`--compress` select a `CompressionKind`; this
/// registry supplies the codec that kind dispatches to. An external plugin
/// loaded through `codec::plugin` replaces a slot's entry wholesale — there
/// is no negotiation, matching the teacher's fail-hard codec-availability
/// philosophy.
#[derive(Clone)]
pub struct CodecRegistry {
    backends: Arc<RwLock<HashMap<&'static str, Arc<dyn ChunkCodec>>>>,
}

impl CodecRegistry {
    /// The default registry: `Xpress` -> zstd, `Lzx` -> lz4_flex.
    pub fn with_defaults() -> Self {
        let mut m: HashMap<&'static str, Arc<dyn ChunkCodec>> = HashMap::new();
        m.insert("xpress", Arc::new(ZstdBackend { level: 3 }));
        m.insert("lzx", Arc::new(Lz4Backend));
        Self { backends: Arc::new(RwLock::new(m)) }
    }

    pub fn register(&self, slot: &'static str, codec: Arc<dyn ChunkCodec>) {
        self.backends.write().unwrap().insert(slot, codec);
    }

    pub fn get(&self, kind: CompressionKind) -> Result<Arc<dyn ChunkCodec>, CodecError> {
        match kind {
            CompressionKind::Copy => Ok(Arc::new(CopyCodec)),
            CompressionKind::Xpress => self
                .backends
                .read()
                .unwrap()
                .get("xpress")
                .cloned()
                .ok_or(CodecError::CodecUnavailable("xpress")),
            CompressionKind::Lzx => self
                .backends
                .read()
                .unwrap()
                .get("lzx")
                .cloned()
                .ok_or(CodecError::CodecUnavailable("lzx")),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_codec_roundtrip() {
        let c = CopyCodec;
        let data = b"hello world".to_vec();
        let z = c.compress(&data).unwrap();
        let back = c.decompress(&z, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn registry_resolves_both_slots() {
        let reg = CodecRegistry::with_defaults();
        assert!(reg.get(CompressionKind::Xpress).is_ok());
        assert!(reg.get(CompressionKind::Lzx).is_ok());
        assert!(reg.get(CompressionKind::Copy).is_ok());
    }

    #[test]
    fn zstd_backend_roundtrip() {
        let z = ZstdBackend { level: 3 };
        let data = vec![0u8; 32768];
        let c = z.compress(&data).unwrap();
        assert!(c.len() < data.len());
        let back = z.decompress(&c, data.len()).unwrap();
        assert_eq!(back, data);
    }
}
