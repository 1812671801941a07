//! Generic RTP packetizer/depacketizer shared by codecs with no payload
//! structure beyond raw samples (G.711, L16) or a single opaque frame per
//! packet (Opus). H.264/H.265 stay external; AAC has its own AU-header
//! framing in [`super::aac`].
//!
//! The encoder splits a frame into RTP chunks of at most `mtu - 20` bytes
//! and derives the RTP timestamp from `dts % cycle_ms`; the decoder groups
//! payloads sharing one RTP timestamp into a single frame and drops the
//! whole group (with a warning) the moment it observes a sequence-number
//! gap.

use bytes::{Bytes, BytesMut};
use log::warn;

/// RTP header overhead reserved when computing the per-packet payload
/// budget.
const RTP_HEADER_OVERHEAD: usize = 20;

/// Splits `payload` into RTP-payload-sized chunks of at most `mtu - 20`
/// bytes each.
pub fn packetize(payload: &[u8], mtu: usize) -> Vec<Bytes> {
    let budget = mtu.saturating_sub(RTP_HEADER_OVERHEAD).max(1);
    payload.chunks(budget).map(Bytes::copy_from_slice).collect()
}

/// Maps a `dts` (milliseconds) to the 90kHz-or-codec-clock-rate RTP
/// timestamp, wrapping at the configured cycle modulus (`rtp.cycleMS`).
pub fn rtp_timestamp(dts_ms: u32, clock_rate: u32, cycle_ms: u32) -> u32 {
    let wrapped = dts_ms % cycle_ms;
    ((wrapped as u64) * clock_rate as u64 / 1000) as u32
}

/// Reassembles RTP packets carrying one codec's raw samples back into
/// frames: same-timestamp payloads are concatenated into a single frame: a
/// sequence-number gap drops the in-progress group and starts fresh,
/// mirroring `CommonRtpDecoder::inputRtp`'s `_drop_flag` behavior.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected_seq: Option<u16>,
    current_ts: Option<u32>,
    buf: BytesMut,
    dropping: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one RTP packet. Returns a completed frame's payload once a
    /// packet with a new timestamp arrives, signalling the prior group is
    /// done.
    pub fn push(&mut self, seq: u16, timestamp: u32, payload: &[u8]) -> Option<Bytes> {
        if let Some(expected) = self.expected_seq {
            if seq != expected {
                warn!("RTP sequence gap: expected {}, got {}; dropping in-progress frame", expected, seq);
                self.dropping = true;
                self.buf.clear();
            }
        }
        self.expected_seq = Some(seq.wrapping_add(1));

        let mut completed = None;
        if self.current_ts != Some(timestamp) {
            if !self.dropping && !self.buf.is_empty() {
                completed = Some(self.buf.split().freeze());
            } else {
                self.buf.clear();
            }
            self.dropping = false;
            self.current_ts = Some(timestamp);
        }
        if !self.dropping {
            self.buf.extend_from_slice(payload);
        }
        completed
    }

    /// Flushes whatever partial group remains (e.g. at stream end).
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.dropping || self.buf.is_empty() {
            self.buf.clear();
            return None;
        }
        Some(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packetizes_into_mtu_sized_chunks() {
        let payload = vec![0u8; 100];
        let chunks = packetize(&payload, 50);
        assert_eq!(chunks.len(), (100 + 29) / 30);
        assert!(chunks.iter().all(|c| c.len() <= 30));
    }

    #[test]
    fn rtp_timestamp_wraps_at_cycle() {
        let ts = rtp_timestamp(1_000, 8_000, 500);
        // 1000 % 500 = 0
        assert_eq!(ts, 0);
    }

    #[test]
    fn reassembles_same_timestamp_payloads_into_one_frame() {
        let mut r = Reassembler::new();
        assert!(r.push(0, 100, b"abc").is_none());
        assert!(r.push(1, 100, b"def").is_none());
        let done = r.push(2, 200, b"ghi").unwrap();
        assert_eq!(&done[..], b"abcdef");
    }

    #[test]
    fn sequence_gap_drops_in_progress_group() {
        let mut r = Reassembler::new();
        assert!(r.push(0, 100, b"abc").is_none());
        // skip seq 1: gap.
        assert!(r.push(2, 100, b"def").is_none());
        let done = r.push(3, 200, b"ghi");
        // The group at ts=100 was dropped entirely; nothing to flush until
        // a full untouched group completes.
        assert!(done.is_none());
    }
}
