//! Frozen C ABI for an external XPRESS or LZX codec plugin.
//!
//! A plugin is a shared library exporting one symbol per slot it implements:
//!
//! ```c
//! const WimCodecPlugin *wim_codec_register_xpress(void);
//! const WimCodecPlugin *wim_codec_register_lzx(void);
//! ```
//!
//! The returned pointer is **static** — the host never frees it. This lets an
//! operator drop in the real Microsoft XPRESS Huffman / LZX implementations
//! (out of scope for this crate, spec §1) without touching the archive
//! engine: `CodecRegistry::register` swaps the slot's back-end for the
//! loaded plugin.
//!
//! # Stability contract
//! - `WIM_PLUGIN_ABI_VERSION` is monotonically increasing, never decremented.
//! - New fields are appended at the end of `WimCodecPlugin` only.
//! - A plugin compiled against ABI version N is compatible with any host >= N.
//!
//! # Thread safety
//! Both `compress` and `decompress` MUST be reentrant: safe to call
//! concurrently from multiple worker threads on disjoint buffer pairs, with
//! no shared mutable state inside the plugin.

use super::ChunkCodec;
use crate::error::CodecError;

pub const WIM_PLUGIN_ABI_VERSION: u32 = 1;

pub mod rc {
    pub const OK: i32 = 0;
    pub const OVERFLOW: i32 = -1;
    pub const CORRUPT: i32 = -2;
    pub const INTERNAL: i32 = -3;
}

/// Frozen C ABI descriptor for one codec slot's external implementation.
///
/// # Safety
/// Function pointers cross an FFI boundary; [`PluginChunkCodec`] enforces
/// the buffer-validity invariants documented per field before delegating.
#[repr(C)]
pub struct WimCodecPlugin {
    /// Must equal `WIM_PLUGIN_ABI_VERSION`; a plugin declaring a higher
    /// version than the host understands is rejected before use.
    pub abi_version: u32,

    /// Compress `in_len` bytes from `in_buf` into `out_buf`.
    ///
    /// On entry `*out_len` is the capacity of `out_buf`; on `rc::OK` it is
    /// set to the number of bytes written.
    ///
    /// # Safety
    /// `in_buf[0..in_len]` and `out_buf[0..*out_len]` must be valid,
    /// non-overlapping, readable/writable regions; neither pointer is null.
    pub compress: Option<
        unsafe extern "C" fn(in_buf: *const u8, in_len: u32, out_buf: *mut u8, out_len: *mut u32) -> i32,
    >,

    /// Decompress `in_len` bytes from `in_buf` into exactly `*out_len` bytes
    /// of `out_buf` (the caller always supplies the true uncompressed chunk
    /// length, known from the chunk-offset table — see the `chunked`
    /// module). Same safety contract as `compress`.
    pub decompress: Option<
        unsafe extern "C" fn(in_buf: *const u8, in_len: u32, out_buf: *mut u8, out_len: *mut u32) -> i32,
    >,

    /// Upper bound on compressed size for `in_len` bytes of input. Must be a
    /// pure, deterministic, side-effect-free function safe to call from any
    /// thread at any time.
    pub compress_bound: Option<unsafe extern "C" fn(in_len: u32) -> u32>,
}

unsafe impl Send for WimCodecPlugin {}
unsafe impl Sync for WimCodecPlugin {}

/// Safe wrapper adapting a loaded [`WimCodecPlugin`] to [`ChunkCodec`].
pub struct PluginChunkCodec {
    desc: &'static WimCodecPlugin,
}

impl PluginChunkCodec {
    pub fn new(desc: &'static WimCodecPlugin) -> Result<Self, String> {
        if desc.abi_version > WIM_PLUGIN_ABI_VERSION {
            return Err(format!(
                "plugin ABI version {} is newer than host ABI version {}",
                desc.abi_version, WIM_PLUGIN_ABI_VERSION
            ));
        }
        Ok(Self { desc })
    }
}

impl ChunkCodec for PluginChunkCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let f = self.desc.compress.ok_or(CodecError::CodecUnavailable("plugin compress"))?;
        let bound_fn = self.desc.compress_bound.ok_or(CodecError::CodecUnavailable("plugin compress_bound"))?;
        let cap = unsafe { bound_fn(data.len() as u32) } as usize;
        let mut out = vec![0u8; cap];
        let mut out_len = cap as u32;
        let rc = unsafe { f(data.as_ptr(), data.len() as u32, out.as_mut_ptr(), &mut out_len) };
        if rc != rc::OK {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("plugin compress returned code {rc}"),
            )));
        }
        out.truncate(out_len as usize);
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let f = self.desc.decompress.ok_or(CodecError::CodecUnavailable("plugin decompress"))?;
        let mut out = vec![0u8; expected_len];
        let mut out_len = expected_len as u32;
        let rc = unsafe { f(data.as_ptr(), data.len() as u32, out.as_mut_ptr(), &mut out_len) };
        if rc != rc::OK {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("plugin decompress returned code {rc}"),
            )));
        }
        out.truncate(out_len as usize);
        if out.len() != expected_len {
            return Err(CodecError::WrongOutputLength { produced: out.len(), expected: expected_len });
        }
        Ok(out)
    }
}
