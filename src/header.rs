//! Archive header — the 208-byte anchor at offset 0 (C1, spec §3/§4.1).
//!
//! # On-disk layout (208 bytes, all integers little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic            = "MSWIM\0\0\0"  (literal 8 bytes)
//!    8      4   header_size      = 208
//!   12      4   version          = 0x00010D00
//!   16      4   flags            bit 0x4=read-only, 0x40=write-in-progress,
//!                                 0x20000=XPRESS, 0x40000=LZX
//!   20      4   chunk_size       32768 when a compression flag is set
//!   24     16   guid             archive identity, shared by a split set
//!   40      2   part_number      1-based; 1 unless this unit came from `split`
//!   42      2   total_parts      N for a split set, else 1
//!   44      4   image_count
//!   48     24   rh_offset_table  resource header (see `records::ResourceHeader`)
//!   72     24   rh_xml_data      resource header for the XML manifest
//!   96     24   rh_boot_metadata reserved boot-metadata resource slot (unused)
//!  120      4   boot_index       reserved, paired with rh_boot_metadata
//!  124     24   rh_integrity     resource header for the optional integrity table
//!  148     60   reserved         preserved verbatim on round-trip
//!  208
//! ```
//!
//! `rh_boot_metadata`/`boot_index` name a bootable-image slot this crate
//! never populates (out of scope per spec §1) but still encodes/decodes so a
//! round-trip through this crate never drops bytes another WIM tool wrote.

use crate::error::FormatError;
use crate::records::ResourceHeader;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use uuid::Uuid;

pub const MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
pub const HEADER_SIZE: u32 = 208;
pub const VERSION: u32 = 0x0001_0D00;
pub const CHUNK_SIZE: u64 = 32768;
pub const RESERVED_TAIL_LEN: usize = 60;

pub const FLAG_READONLY: u32 = 0x0000_0004;
pub const FLAG_WRITE_IN_PROGRESS: u32 = 0x0000_0040;
pub const FLAG_COMPRESS_XPRESS: u32 = 0x0002_0000;
pub const FLAG_COMPRESS_LZX: u32 = 0x0004_0000;

/// Which of the two compressible codecs (if any) an archive uses for its
/// file and metadata resources. `Copy` corresponds to neither flag bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Copy,
    Xpress,
    Lzx,
}

impl CompressionKind {
    pub fn from_flags(flags: u32) -> Self {
        if flags & FLAG_COMPRESS_XPRESS != 0 {
            CompressionKind::Xpress
        } else if flags & FLAG_COMPRESS_LZX != 0 {
            CompressionKind::Lzx
        } else {
            CompressionKind::Copy
        }
    }

    pub fn flag_bits(self) -> u32 {
        match self {
            CompressionKind::Copy => 0,
            CompressionKind::Xpress => FLAG_COMPRESS_XPRESS,
            CompressionKind::Lzx => FLAG_COMPRESS_LZX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::Copy => "none",
            CompressionKind::Xpress => "XPRESS",
            CompressionKind::Lzx => "LZX",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WimHeader {
    pub flags: u32,
    pub chunk_size: u64,
    pub guid: Uuid,
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub rh_offset_table: ResourceHeader,
    pub rh_xml_data: ResourceHeader,
    pub rh_boot_metadata: ResourceHeader,
    pub boot_index: u32,
    pub rh_integrity: ResourceHeader,
    pub reserved: [u8; RESERVED_TAIL_LEN],
}

impl WimHeader {
    /// A fresh header for `capture`: no compression flags set yet (the
    /// caller sets `flags` from the chosen `CompressionKind` and ORs in
    /// `FLAG_WRITE_IN_PROGRESS` before the first byte past the header lands).
    pub fn new(compression: CompressionKind) -> Self {
        let flags = compression.flag_bits();
        let chunk_size = if flags == 0 { 0 } else { CHUNK_SIZE };
        Self {
            flags,
            chunk_size,
            guid: Uuid::new_v4(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            rh_offset_table: ResourceHeader::default(),
            rh_xml_data: ResourceHeader::default(),
            rh_boot_metadata: ResourceHeader::default(),
            boot_index: 0,
            rh_integrity: ResourceHeader::default(),
            reserved: [0u8; RESERVED_TAIL_LEN],
        }
    }

    pub fn compression(&self) -> CompressionKind {
        CompressionKind::from_flags(self.flags)
    }

    pub fn is_write_in_progress(&self) -> bool {
        self.flags & FLAG_WRITE_IN_PROGRESS != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & FLAG_READONLY != 0
    }

    pub fn set_write_in_progress(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_WRITE_IN_PROGRESS;
        } else {
            self.flags &= !FLAG_WRITE_IN_PROGRESS;
        }
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self, FormatError> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        r.read_exact(&mut buf)
            .map_err(|_| FormatError::Truncated { needed: HEADER_SIZE as usize, found: 0 })?;
        Self::decode(&buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(FormatError::Truncated { needed: HEADER_SIZE as usize, found: buf.len() });
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        if &magic != MAGIC {
            return Err(FormatError::BadMagic { expected: *MAGIC, found: magic });
        }
        let mut cur = &buf[8..];
        let header_size = cur.read_u32::<LittleEndian>().unwrap();
        if header_size != HEADER_SIZE {
            return Err(FormatError::BadHeaderLength(header_size));
        }
        let version = cur.read_u32::<LittleEndian>().unwrap();
        if version != VERSION {
            return Err(FormatError::BadVersion(version));
        }
        let flags = cur.read_u32::<LittleEndian>().unwrap();
        let chunk_size = cur.read_u32::<LittleEndian>().unwrap() as u64;
        let mut guid_bytes = [0u8; 16];
        cur.read_exact(&mut guid_bytes).unwrap();
        let guid = Uuid::from_bytes(guid_bytes);
        let part_number = cur.read_u16::<LittleEndian>().unwrap();
        let total_parts = cur.read_u16::<LittleEndian>().unwrap();
        let image_count = cur.read_u32::<LittleEndian>().unwrap();

        let rh_offset_table = ResourceHeader::decode(&buf[48..72])?;
        let rh_xml_data = ResourceHeader::decode(&buf[72..96])?;
        let rh_boot_metadata = ResourceHeader::decode(&buf[96..120])?;
        let boot_index = u32::from_le_bytes(buf[120..124].try_into().unwrap());
        let rh_integrity = ResourceHeader::decode(&buf[124..148])?;
        let mut reserved = [0u8; RESERVED_TAIL_LEN];
        reserved.copy_from_slice(&buf[148..208]);

        Ok(Self {
            flags,
            chunk_size,
            guid,
            part_number,
            total_parts,
            image_count,
            rh_offset_table,
            rh_xml_data,
            rh_boot_metadata,
            boot_index,
            rh_integrity,
            reserved,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        out[12..16].copy_from_slice(&VERSION.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20..24].copy_from_slice(&(self.chunk_size as u32).to_le_bytes());
        out[24..40].copy_from_slice(self.guid.as_bytes());
        out[40..42].copy_from_slice(&self.part_number.to_le_bytes());
        out[42..44].copy_from_slice(&self.total_parts.to_le_bytes());
        out[44..48].copy_from_slice(&self.image_count.to_le_bytes());
        out[48..72].copy_from_slice(&self.rh_offset_table.encode());
        out[72..96].copy_from_slice(&self.rh_xml_data.encode());
        out[96..120].copy_from_slice(&self.rh_boot_metadata.encode());
        out[120..124].copy_from_slice(&self.boot_index.to_le_bytes());
        out[124..148].copy_from_slice(&self.rh_integrity.encode());
        out[148..208].copy_from_slice(&self.reserved);
        out
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_fresh_header() {
        let mut h = WimHeader::new(CompressionKind::Xpress);
        h.image_count = 3;
        h.rh_xml_data.offset = 4096;
        let encoded = h.encode();
        let back = WimHeader::decode(&encoded).unwrap();
        assert_eq!(back.flags, h.flags);
        assert_eq!(back.image_count, 3);
        assert_eq!(back.rh_xml_data.offset, 4096);
        assert_eq!(back.compression(), CompressionKind::Xpress);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(b"NOTAWIM!");
        assert!(matches!(WimHeader::decode(&buf), Err(FormatError::BadMagic { .. })));
    }

    #[test]
    fn write_in_progress_toggle() {
        let mut h = WimHeader::new(CompressionKind::Copy);
        assert!(!h.is_write_in_progress());
        h.set_write_in_progress(true);
        assert!(h.is_write_in_progress());
        h.set_write_in_progress(false);
        assert!(!h.is_write_in_progress());
    }
}
