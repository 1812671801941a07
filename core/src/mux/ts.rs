//! MPEG-TS muxer adapter.
//!
//! PES/TS packing itself is an external collaborator ([`TsWriter`]); what
//! lives here is keyframe-aligned PAT/PMT repetition and demand-gated
//! quiesce behavior specific to this protocol: when the ring's last
//! reader detaches, the muxer empties its cache and starts dropping
//! frames, but not instantly — a short residual window tolerates a reader
//! reattaching mid-burst before the muxer actually goes quiet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;
use crate::flush::{FlushPolicy, PacketCache};
use crate::frame::Frame;
use crate::ring::{FlushUnit, Ring};
use crate::sink::{MediaSink, TrackGate, TrackMeta};

/// How long a TS muxer keeps accepting/packetizing frames after its last
/// reader detaches before actually quiescing, so a reader that reattaches
/// mid-burst isn't starved by a
/// muxer that already threw its cache away.
const RESIDUAL_WINDOW: Duration = Duration::from_millis(200);

/// External PES/TS packer. The muxer calls `write_pat_pmt` once per keyframe
/// boundary and `write_pes` once per frame.
pub trait TsWriter: Send {
    fn write_pat_pmt(&mut self) -> Result<Bytes, Error>;
    fn write_pes(&mut self, frame: &Frame) -> Result<Bytes, Error>;
}

pub struct TsMuxer {
    gate: TrackGate,
    demand: bool,
    writer: Box<dyn TsWriter>,
    cache: PacketCache<Bytes>,
    ring: Arc<Ring<Bytes>>,
    zero_reader_since: Option<Instant>,
    quiesced: bool,
}

impl TsMuxer {
    pub fn new(merge_ms: i64, ring_capacity: usize, demand: bool, writer: Box<dyn TsWriter>) -> Self {
        TsMuxer {
            gate: TrackGate::new(),
            demand,
            writer,
            cache: PacketCache::new(FlushPolicy::new(merge_ms)),
            ring: Arc::new(Ring::new(ring_capacity)),
            zero_reader_since: None,
            quiesced: false,
        }
    }

    pub fn ring(&self) -> Arc<Ring<Bytes>> {
        self.ring.clone()
    }

    /// Re-evaluates the demand gate against current reader count, updating
    /// the residual-window/quiesce state machine. Returns whether the
    /// muxer should currently packetize frames.
    pub fn tick(&mut self) -> bool {
        if !self.demand {
            return true;
        }
        if self.ring.reader_count() > 0 {
            self.zero_reader_since = None;
            self.quiesced = false;
            return true;
        }
        match self.zero_reader_since {
            None => {
                self.zero_reader_since = Some(Instant::now());
                true
            }
            Some(since) if since.elapsed() < RESIDUAL_WINDOW => true,
            Some(_) => {
                if !self.quiesced {
                    self.cache.clear();
                    self.quiesced = true;
                }
                false
            }
        }
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    /// True iff at least one reader is attached, or demand-gating is off
    /// for TS (`general.tsDemand`).
    pub fn is_enabled(&self) -> bool {
        !self.demand || self.ring.reader_count() > 0
    }
}

impl MediaSink for TsMuxer {
    fn add_track(&mut self, _track: &TrackMeta) -> Result<(), Error> {
        self.gate.observe_add()
    }

    fn add_track_completed(&mut self) {
        self.gate.complete();
    }

    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if !self.tick() {
            return Ok(());
        }
        let ring = self.ring.clone();
        if frame.codec.is_video() && frame.key_frame {
            let pat_pmt = self.writer.write_pat_pmt()?;
            self.cache.input(i64::from(frame.dts), true, pat_pmt, true, |pending, key| {
                ring.push(FlushUnit { packets: pending, is_key: key });
            });
        }
        let pes = self.writer.write_pes(frame)?;
        let ring = self.ring.clone();
        let is_video = frame.codec.is_video();
        self.cache.input(i64::from(frame.dts), is_video, pes, frame.key_frame && is_video, |pending, key| {
            ring.push(FlushUnit { packets: pending, is_key: key });
        });
        Ok(())
    }

    fn reset_tracks(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as B;
    use crate::frame::Codec;

    struct FakeWriter;
    impl TsWriter for FakeWriter {
        fn write_pat_pmt(&mut self) -> Result<Bytes, Error> {
            Ok(B::from_static(b"patpmt"))
        }
        fn write_pes(&mut self, frame: &Frame) -> Result<Bytes, Error> {
            Ok(B::copy_from_slice(&frame.payload()))
        }
    }

    #[test]
    fn writes_pat_pmt_before_every_video_keyframe() {
        let mut mux = TsMuxer::new(0, 16, false, Box::new(FakeWriter));
        let key = Frame::new(Codec::H264, 0, 0, B::from_static(&[0, 0, 0, 1, 1, 2]), 4, true, false);
        mux.input_frame(&key).unwrap();
        mux.cache.flush(|pending, is_key| {
            assert_eq!(pending.len(), 2);
            assert_eq!(&pending[0][..], b"patpmt");
            assert!(is_key);
        });
    }

    #[test]
    fn on_demand_gate_quiesces_after_residual_window_with_no_readers() {
        let mut mux = TsMuxer::new(0, 16, true, Box::new(FakeWriter));
        assert!(mux.tick()); // first observation: grace, still enabled
        std::thread::sleep(RESIDUAL_WINDOW + Duration::from_millis(20));
        assert!(!mux.tick());
        assert!(mux.is_quiesced());
    }

    #[test]
    fn attaching_a_reader_re_enables_immediately() {
        let mut mux = TsMuxer::new(0, 16, true, Box::new(FakeWriter));
        assert!(!{
            std::thread::sleep(RESIDUAL_WINDOW + Duration::from_millis(20));
            mux.tick()
        });
        let _reader = mux.ring.attach(|| {});
        assert!(mux.tick());
        assert!(!mux.is_quiesced());
    }

    #[test]
    fn is_enabled_reflects_demand_gate_and_readers() {
        let mux = TsMuxer::new(0, 16, false, Box::new(FakeWriter));
        assert!(mux.is_enabled(), "demand gating off: always enabled");

        let mux = TsMuxer::new(0, 16, true, Box::new(FakeWriter));
        assert!(!mux.is_enabled(), "demand gating on, no readers yet");
        let _reader = mux.ring.attach(|| {});
        assert!(mux.is_enabled());
    }
}
