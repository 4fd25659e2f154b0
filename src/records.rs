//! Self-describing fixed records shared by every resource in the archive:
//! the resource header (24 B), the offset-table entry (50 B), and the
//! integrity table (C1, C9). See design note §9: the packed 56-bit size is a
//! value object with named getter/setter, never touched as a raw `u64`.

use crate::error::FormatError;
use crate::hash::Sha1Key;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const RESOURCE_HEADER_SIZE: usize = 24;
pub const OFFSET_TABLE_ENTRY_SIZE: usize = 50;
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

pub const RESFLAG_FREE: u8 = 0x01;
pub const RESFLAG_METADATA: u8 = 0x02;
pub const RESFLAG_COMPRESSED: u8 = 0x04;
pub const RESFLAG_SPANNED: u8 = 0x08;

/// A resource header: byte offset, on-disk size, uncompressed size, and a
/// flag byte packed into the top byte of the on-disk-size field. Callers
/// always read/write `size` and `flags` together through this type — never
/// through the raw packed u64 — so the pack/unpack step can't be forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceHeader {
    pub offset: u64,
    on_disk_size: u64,
    pub uncompressed_size: u64,
    flags: u8,
}

impl ResourceHeader {
    pub fn new(offset: u64, on_disk_size: u64, uncompressed_size: u64, flags: u8) -> Self {
        Self { offset, on_disk_size, uncompressed_size, flags }
    }

    pub fn on_disk_size(&self) -> u64 {
        self.on_disk_size
    }

    pub fn set_on_disk_size(&mut self, size: u64) {
        self.on_disk_size = size & 0x00FF_FFFF_FFFF_FFFF;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & RESFLAG_METADATA != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & RESFLAG_COMPRESSED != 0
    }

    pub fn is_free(&self) -> bool {
        self.flags & RESFLAG_FREE != 0
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < RESOURCE_HEADER_SIZE {
            return Err(FormatError::Truncated { needed: RESOURCE_HEADER_SIZE, found: buf.len() });
        }
        let packed = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let on_disk_size = packed & 0x00FF_FFFF_FFFF_FFFF;
        let flags = buf[7];
        let offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let uncompressed_size = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(Self { offset, on_disk_size, uncompressed_size, flags })
    }

    pub fn encode(&self) -> [u8; RESOURCE_HEADER_SIZE] {
        let mut out = [0u8; RESOURCE_HEADER_SIZE];
        let packed = (self.on_disk_size & 0x00FF_FFFF_FFFF_FFFF) | ((self.flags as u64) << 56);
        out[0..8].copy_from_slice(&packed.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// One entry in the content-addressed offset table: a resource header, the
/// split-set part number it lives in, a reference count, and the SHA-1 key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTableEntry {
    pub resource: ResourceHeader,
    pub part_number: u16,
    pub ref_count: u32,
    pub hash: Sha1Key,
}

impl OffsetTableEntry {
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < OFFSET_TABLE_ENTRY_SIZE {
            return Err(FormatError::Truncated { needed: OFFSET_TABLE_ENTRY_SIZE, found: buf.len() });
        }
        let resource = ResourceHeader::decode(&buf[0..24])?;
        let part_number = u16::from_le_bytes(buf[24..26].try_into().unwrap());
        let ref_count = u32::from_le_bytes(buf[26..30].try_into().unwrap());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&buf[30..50]);
        Ok(Self { resource, part_number, ref_count, hash: Sha1Key(hash) })
    }

    pub fn encode(&self) -> [u8; OFFSET_TABLE_ENTRY_SIZE] {
        let mut out = [0u8; OFFSET_TABLE_ENTRY_SIZE];
        out[0..24].copy_from_slice(&self.resource.encode());
        out[24..26].copy_from_slice(&self.part_number.to_le_bytes());
        out[26..30].copy_from_slice(&self.ref_count.to_le_bytes());
        out[30..50].copy_from_slice(&self.hash.0);
        out
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self, FormatError> {
        let mut buf = [0u8; OFFSET_TABLE_ENTRY_SIZE];
        r.read_exact(&mut buf).map_err(|_| FormatError::Truncated {
            needed: OFFSET_TABLE_ENTRY_SIZE,
            found: 0,
        })?;
        Self::decode(&buf)
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.encode())
    }
}

/// The optional integrity table: fixed-size header plus `count` SHA-1
/// digests, one per 10-MiB window of the archive body.
#[derive(Debug, Clone, Default)]
pub struct IntegrityTable {
    pub chunk_size: u32,
    pub entries: Vec<Sha1Key>,
}

impl IntegrityTable {
    pub fn new(entries: Vec<Sha1Key>) -> Self {
        Self { chunk_size: INTEGRITY_CHUNK_SIZE, entries }
    }

    pub fn encoded_len(&self) -> usize {
        12 + self.entries.len() * 20
    }

    pub fn decode<R: Read>(mut r: R) -> Result<Self, FormatError> {
        let mut head = [0u8; 12];
        r.read_exact(&mut head).map_err(|_| FormatError::Truncated { needed: 12, found: 0 })?;
        let _size = u32::from_le_bytes(head[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
        let chunk_size = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut h = [0u8; 20];
            r.read_exact(&mut h)
                .map_err(|_| FormatError::Truncated { needed: 20, found: 0 })?;
            entries.push(Sha1Key(h));
        }
        Ok(Self { chunk_size, entries })
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let size = self.encoded_len() as u32;
        w.write_u32::<LittleEndian>(size)?;
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        w.write_u32::<LittleEndian>(self.chunk_size)?;
        for e in &self.entries {
            w.write_all(&e.0)?;
        }
        Ok(())
    }
}

/// A chunk-offset table entry is 32-bit unless the uncompressed resource
/// size exceeds 4 GiB (C3).
pub fn chunk_offset_width(uncompressed_size: u64) -> usize {
    if uncompressed_size > 4 * (1u64 << 30) {
        8
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_header_packs_flag_in_top_byte() {
        let mut rh = ResourceHeader::new(0, 0, 0, 0);
        rh.set_on_disk_size(0x00AA_BBCC_DDEE_FF11);
        rh.set_flags(RESFLAG_COMPRESSED | RESFLAG_METADATA);
        let encoded = rh.encode();
        // top byte of the first 8 bytes must be the flag byte
        assert_eq!(encoded[7], RESFLAG_COMPRESSED | RESFLAG_METADATA);
        let back = ResourceHeader::decode(&encoded).unwrap();
        assert_eq!(back.on_disk_size(), 0x00AA_BBCC_DDEE_FF11);
        assert!(back.is_compressed());
        assert!(back.is_metadata());
    }

    #[test]
    fn offset_table_entry_roundtrip() {
        let e = OffsetTableEntry {
            resource: ResourceHeader::new(208, 5, 5, 0),
            part_number: 1,
            ref_count: 2,
            hash: Sha1Key([7u8; 20]),
        };
        let encoded = e.encode();
        assert_eq!(encoded.len(), OFFSET_TABLE_ENTRY_SIZE);
        let back = OffsetTableEntry::decode(&encoded).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn chunk_offset_width_crosses_4gib() {
        assert_eq!(chunk_offset_width(4 * (1u64 << 30)), 4);
        assert_eq!(chunk_offset_width(4 * (1u64 << 30) + 1), 8);
    }

    #[test]
    fn integrity_table_roundtrip() {
        let it = IntegrityTable::new(vec![Sha1Key([1u8; 20]), Sha1Key([2u8; 20])]);
        let mut buf = Vec::new();
        it.write(&mut buf).unwrap();
        let back = IntegrityTable::decode(&buf[..]).unwrap();
        assert_eq!(back.entries, it.entries);
        assert_eq!(back.chunk_size, INTEGRITY_CHUNK_SIZE);
    }

    use proptest::prelude::*;

    proptest! {
        /// The packed 56-bit on-disk size and top-byte flag never bleed into
        /// each other, for any size that actually fits the field.
        #[test]
        fn resource_header_size_and_flags_roundtrip(
            size in 0u64..=0x00FF_FFFF_FFFF_FFFF,
            offset in any::<u64>(),
            uncompressed in any::<u64>(),
            flags in any::<u8>(),
        ) {
            let mut rh = ResourceHeader::new(offset, 0, uncompressed, 0);
            rh.set_on_disk_size(size);
            rh.set_flags(flags);
            let back = ResourceHeader::decode(&rh.encode()).unwrap();
            prop_assert_eq!(back.on_disk_size(), size);
            prop_assert_eq!(back.flags(), flags);
            prop_assert_eq!(back.offset, offset);
            prop_assert_eq!(back.uncompressed_size, uncompressed);
        }

        /// Any offset-table entry, not just the hand-picked ones above,
        /// survives an encode/decode cycle byte for byte.
        #[test]
        fn offset_table_entry_roundtrip_arbitrary(
            offset in any::<u64>(),
            size in 0u64..=0x00FF_FFFF_FFFF_FFFF,
            uncompressed in any::<u64>(),
            part_number in any::<u16>(),
            ref_count in any::<u32>(),
            hash_bytes in proptest::collection::vec(any::<u8>(), 20),
        ) {
            let mut resource = ResourceHeader::new(offset, 0, uncompressed, 0);
            resource.set_on_disk_size(size);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&hash_bytes);
            let entry = OffsetTableEntry { resource, part_number, ref_count, hash: Sha1Key(hash) };
            let back = OffsetTableEntry::decode(&entry.encode()).unwrap();
            prop_assert_eq!(back, entry);
        }
    }
}
