//! NTP-format timestamps [RFC 1305].

use std::ops::Sub;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (Unix epoch).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp: 32-bit seconds since 1900 plus a 32-bit binary
/// fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn now() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_unix_f64(unix.as_secs_f64())
    }

    /// Build from float seconds since the Unix epoch.
    pub fn from_unix_f64(t: f64) -> Self {
        let whole = t.floor();
        let fraction = ((t - whole) * (u32::MAX as f64 + 1.0)) as u32;
        Self {
            seconds: (whole as u64).wrapping_add(NTP_UNIX_OFFSET) as u32,
            fraction,
        }
    }

    /// Float seconds since the Unix epoch.
    pub fn to_unix_f64(self) -> f64 {
        let secs = (self.seconds as i64) - (NTP_UNIX_OFFSET as i64);
        secs as f64 + (self.fraction as f64) / (u32::MAX as f64 + 1.0)
    }

    /// Big-endian 8-byte wire form.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        Some(Self {
            seconds: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

impl Sub for NtpTimestamp {
    type Output = f64;

    /// Difference between two timestamps in float seconds.
    fn sub(self, other: Self) -> f64 {
        self.to_unix_f64() - other.to_unix_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let ts = NtpTimestamp { seconds: 3_900_000_123, fraction: 0x8000_0000 };
        assert_eq!(NtpTimestamp::from_bytes(&ts.to_bytes()), Some(ts));
    }

    #[test]
    fn test_from_bytes_short_input() {
        assert_eq!(NtpTimestamp::from_bytes(&[0u8; 7]), None);
    }

    #[test]
    fn test_unix_conversion_round_trip() {
        let t = 1_700_000_000.125_f64;
        let ts = NtpTimestamp::from_unix_f64(t);
        assert!((ts.to_unix_f64() - t).abs() < 1e-6);
    }

    #[test]
    fn test_half_second_fraction() {
        let ts = NtpTimestamp::from_unix_f64(100.5);
        assert_eq!(ts.fraction, 0x8000_0000);
    }

    #[test]
    fn test_subtraction_yields_seconds() {
        let a = NtpTimestamp::from_unix_f64(1000.0);
        let b = NtpTimestamp::from_unix_f64(1000.25);
        assert!((b - a - 0.25).abs() < 1e-6);
        assert!((a - b + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_now_is_after_ntp_epoch() {
        // Any current time is far past 1900 + offset wraparound concerns.
        let ts = NtpTimestamp::now();
        assert!(ts.to_unix_f64() > 1_600_000_000.0);
    }
}
