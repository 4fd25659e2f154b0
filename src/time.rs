//! NT-tick <-> Unix time conversions.
//!
//! An NT tick is a 100-nanosecond interval since 1601-01-01 UTC. WIM stores
//! every timestamp (directory entry creation/access/write time, XML
//! CREATIONTIME/LASTMODIFICATIONTIME) in this form.

use chrono::{DateTime, Utc};

/// Seconds between the NT epoch (1601-01-01) and the Unix epoch (1970-01-01).
pub const NT_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;
const TICKS_PER_SEC: i64 = 10_000_000;

/// Convert an NT tick count to Unix seconds (truncating sub-second precision,
/// matching the reference implementation's `nt2uxtime`).
pub fn nt_to_unix_secs(nt_ticks: u64) -> i64 {
    (nt_ticks as i64) / TICKS_PER_SEC - NT_EPOCH_OFFSET_SECS
}

/// Convert Unix seconds to an NT tick count (`ux2nttime`).
pub fn unix_secs_to_nt(unix_secs: i64) -> u64 {
    ((unix_secs + NT_EPOCH_OFFSET_SECS) * TICKS_PER_SEC) as u64
}

/// Convert a `SystemTime` to NT ticks, for stamping freshly captured entries.
pub fn system_time_to_nt(t: std::time::SystemTime) -> u64 {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs() as i64;
            let nanos = d.subsec_nanos() as i64;
            unix_secs_to_nt(secs) + (nanos / 100) as u64
        }
        Err(_) => 0,
    }
}

/// Render NT ticks as a `chrono` UTC timestamp, for the `info`/`dir` CLI
/// output. Returns `None` if the tick count doesn't map to a representable
/// time.
pub fn nt_to_datetime(nt_ticks: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(nt_to_unix_secs(nt_ticks), 0)
}

/// Split an NT tick count into the hex HIGHPART/LOWPART pair the XML
/// manifest uses (`0x%08X` each).
pub fn nt_to_high_low(nt_ticks: u64) -> (u32, u32) {
    ((nt_ticks >> 32) as u32, (nt_ticks & 0xFFFF_FFFF) as u32)
}

/// Recombine a HIGHPART/LOWPART hex pair read back out of the XML manifest.
pub fn high_low_to_nt(high: u32, low: u32) -> u64 {
    ((high as u64) << 32) | low as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_unix_nt() {
        let now = 1_700_000_000i64;
        let ticks = unix_secs_to_nt(now);
        assert_eq!(nt_to_unix_secs(ticks), now);
    }

    #[test]
    fn high_low_roundtrip() {
        let ticks = unix_secs_to_nt(1_700_000_000);
        let (h, l) = nt_to_high_low(ticks);
        assert_eq!(high_low_to_nt(h, l), ticks);
    }

    #[test]
    fn epoch_offset_matches_reference() {
        // 1601-01-01 in NT ticks is tick 0, which must map to -11644473600s.
        assert_eq!(nt_to_unix_secs(0), -NT_EPOCH_OFFSET_SECS);
    }
}
