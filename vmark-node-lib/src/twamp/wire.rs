//! TWAMP-Light packet layouts. All integers are big-endian on the wire.

use rand::RngCore;

use super::clock::NtpTimestamp;

/// Fixed part of a reflector reply:
/// `rseq: u32 | T2: 8B | err_est: u16 | T3: 8B | err_est: u16 | sseq: u32`.
pub const REPLY_LEN: usize = 28;

/// Minimum test packet: just the sender sequence number.
pub const TEST_MIN_LEN: usize = 4;

/// Build a sender test packet: sequence number followed by random padding.
pub fn encode_test(sseq: u32, padding: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TEST_MIN_LEN + padding);
    buf.extend_from_slice(&sseq.to_be_bytes());
    if padding > 0 {
        let mut pad = vec![0u8; padding];
        rand::rng().fill_bytes(&mut pad);
        buf.extend_from_slice(&pad);
    }
    buf
}

/// Sequence number of a received test packet, if long enough.
pub fn decode_test_seq(data: &[u8]) -> Option<u32> {
    if data.len() < TEST_MIN_LEN {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// A reflector reply. The error-estimate fields are MBZ in Light mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    pub rseq: u32,
    pub t2: NtpTimestamp,
    pub t3: NtpTimestamp,
    pub sseq: u32,
}

impl Reply {
    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        buf[0..4].copy_from_slice(&self.rseq.to_be_bytes());
        buf[4..12].copy_from_slice(&self.t2.to_bytes());
        // buf[12..14]: error estimate, must be zero
        buf[14..22].copy_from_slice(&self.t3.to_bytes());
        // buf[22..24]: error estimate, must be zero
        buf[24..28].copy_from_slice(&self.sseq.to_be_bytes());
        buf
    }

    /// Decode a reply; trailing padding beyond the fixed 28 bytes is ignored.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < REPLY_LEN {
            return None;
        }
        Some(Self {
            rseq: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            t2: NtpTimestamp::from_bytes(&data[4..12])?,
            t3: NtpTimestamp::from_bytes(&data[14..22])?,
            sseq: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply {
            rseq: 7,
            t2: NtpTimestamp { seconds: 100, fraction: 200 },
            t3: NtpTimestamp { seconds: 101, fraction: 300 },
            sseq: 42,
        };
        let encoded = reply.encode();
        assert_eq!(encoded.len(), REPLY_LEN);
        assert_eq!(Reply::decode(&encoded), Some(reply));
    }

    #[test]
    fn test_reply_error_estimates_are_zero() {
        let reply = Reply {
            rseq: 1,
            t2: NtpTimestamp { seconds: 1, fraction: 1 },
            t3: NtpTimestamp { seconds: 2, fraction: 2 },
            sseq: 1,
        };
        let encoded = reply.encode();
        assert_eq!(&encoded[12..14], &[0, 0]);
        assert_eq!(&encoded[22..24], &[0, 0]);
    }

    #[test]
    fn test_reply_decode_tolerates_padding() {
        let reply = Reply {
            rseq: 1,
            t2: NtpTimestamp { seconds: 1, fraction: 1 },
            t3: NtpTimestamp { seconds: 2, fraction: 2 },
            sseq: 9,
        };
        let mut data = reply.encode().to_vec();
        data.extend_from_slice(&[0xffu8; 32]);
        assert_eq!(Reply::decode(&data), Some(reply));
    }

    #[test]
    fn test_reply_decode_rejects_short() {
        assert_eq!(Reply::decode(&[0u8; 27]), None);
    }

    #[test]
    fn test_test_packet_layout() {
        let pkt = encode_test(0x01020304, 16);
        assert_eq!(pkt.len(), 20);
        assert_eq!(&pkt[0..4], &[1, 2, 3, 4]);
        assert_eq!(decode_test_seq(&pkt), Some(0x01020304));
    }

    #[test]
    fn test_test_packet_too_short() {
        assert_eq!(decode_test_seq(&[1, 2, 3]), None);
    }
}
