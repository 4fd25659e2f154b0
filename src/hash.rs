//! Streaming SHA-1 (C2). Three use sites per spec §4.2: content hash of an
//! input file (dedup key), content hash of a serialized metadata resource
//! (image identity), and per-10-MiB-window hash of the archive body (the
//! optional integrity table).

use sha1::{Digest, Sha1};
use std::io::{self, Read};

pub const PREFILTER_WINDOW: usize = 32768;
pub const INTEGRITY_WINDOW: usize = 10 * 1024 * 1024;

/// A 20-byte SHA-1 digest, the dedup/identity key everywhere in the format.
/// Never compare by hex string (design note §9); this type is `Copy` and
/// `Ord` so it is cheap to use directly as a `BTreeMap`/`HashMap` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Key(pub [u8; 20]);

impl Default for Sha1Key {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Sha1Key {
    pub const ZERO: Sha1Key = Sha1Key([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Sha1Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash an entire stream with SHA-1, reading in 32 KiB windows, matching the
/// chunk granularity the rest of the pipeline already reads at.
pub fn hash_stream<R: Read>(mut r: R) -> io::Result<Sha1Key> {
    let mut hasher = Sha1::new();
    let mut buf = [0u8; PREFILTER_WINDOW];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Sha1Key(hasher.finalize().into()))
}

pub fn hash_bytes(data: &[u8]) -> Sha1Key {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Sha1Key(hasher.finalize().into())
}

/// Hash only the first 32 KiB of a seekable stream and rewind — the cheap
/// prefilter used before a full-file hash (§4.5). Streams shorter than the
/// window are hashed in full; the position is restored in every case.
pub fn hash_prefilter<R: Read + std::io::Seek>(r: &mut R) -> io::Result<Sha1Key> {
    let start = r.stream_position()?;
    let mut buf = vec![0u8; PREFILTER_WINDOW];
    let mut total = 0usize;
    while total < buf.len() {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    r.seek(std::io::SeekFrom::Start(start))?;
    Ok(hash_bytes(&buf[..total]))
}

/// An incremental SHA-1 accumulator, used by the codec pool to hash input or
/// output as it streams through, and to be reinitialized mid-resource when
/// the compression-abort heuristic restarts the pass (§4.4 step 4).
#[derive(Default)]
pub struct RunningHash {
    hasher: Sha1,
}

impl RunningHash {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn reset(&mut self) {
        self.hasher = Sha1::new();
    }

    pub fn finalize(self) -> Sha1Key {
        Sha1Key(self.hasher.finalize().into())
    }
}

/// Split the archive body (bytes `[208, end_of_offset_table)`) into fixed
/// 10-MiB windows and hash each one, for the optional integrity table (C9).
pub fn hash_integrity_windows<R: Read>(mut r: R, body_len: u64) -> io::Result<Vec<Sha1Key>> {
    let mut entries = Vec::new();
    let mut remaining = body_len;
    let mut buf = vec![0u8; INTEGRITY_WINDOW];
    while remaining > 0 {
        let window = std::cmp::min(remaining, INTEGRITY_WINDOW as u64) as usize;
        let mut got = 0usize;
        while got < window {
            let n = r.read(&mut buf[got..window])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        entries.push(hash_bytes(&buf[..got]));
        remaining -= got as u64;
        if got < window {
            break;
        }
    }
    Ok(entries)
}
