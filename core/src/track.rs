//! Track: per-elementary-stream metadata and readiness tracking.
//!
//! `Track` is the first [`FrameSink`] a `Frame` passes through after the
//! ingest demuxer parses it, and the chain-of-responsibility style it uses
//! (update local state, then forward zero-or-more frames to whatever comes
//! next) mirrors [`crate::event::MediaSourceEventInterceptor`].

use bytes::Bytes;
use log::warn;

use crate::codec::{aac, g711, h264, h265};
use crate::error::Error;
use crate::frame::{Codec, Frame, FrameSink, TrackType};

/// Frames cached while a track waits for its config (SPS/PPS/VPS) to
/// arrive. Chosen to bound memory under a misbehaving producer that never
/// sends config while still allowing a typical GOP's worth of leading
/// frames through once it does.
const PENDING_CACHE_CAP: usize = 64;

/// Video-specific metadata.
#[derive(Debug, Default, Clone)]
pub struct VideoInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
}

/// Audio-specific metadata.
#[derive(Debug, Default, Clone)]
pub struct AudioInfo {
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub sample_bits: Option<u8>,
}

enum ConfigTracker {
    H264(h264::ConfigState),
    H265(h265::ConfigState),
    Aac(Option<aac::AudioSpecificConfig>),
    /// G.711, Opus, L16: ready without an explicit config handshake.
    None,
}

/// One elementary stream's metadata, readiness, and config cache, wrapping
/// a downstream [`FrameSink`] (ultimately the fan-out) that only
/// config-ready frames reach.
pub struct Track<D: FrameSink> {
    pub codec: Codec,
    pub video: VideoInfo,
    pub audio: AudioInfo,
    config: ConfigTracker,
    pending: Vec<Frame>,
    downstream: D,
}

impl<D: FrameSink> Track<D> {
    pub fn new(codec: Codec, downstream: D) -> Self {
        let config = match codec {
            Codec::H264 => ConfigTracker::H264(h264::ConfigState::default()),
            Codec::H265 => ConfigTracker::H265(h265::ConfigState::default()),
            Codec::Aac => ConfigTracker::Aac(None),
            Codec::G711A | Codec::G711U | Codec::Opus | Codec::L16 => ConfigTracker::None,
        };
        Track {
            codec,
            video: VideoInfo::default(),
            audio: AudioInfo::default(),
            config,
            pending: Vec::new(),
            downstream,
        }
    }

    pub fn track_type(&self) -> TrackType {
        self.codec.track_type()
    }

    /// True once enough codec-specific configuration has been parsed that a
    /// decoder downstream could make sense of a frame.
    pub fn ready(&self) -> bool {
        match &self.config {
            ConfigTracker::H264(c) => c.ready(),
            ConfigTracker::H265(c) => c.ready(),
            ConfigTracker::Aac(c) => c.is_some(),
            ConfigTracker::None => {
                debug_assert!(g711::READY_WITHOUT_CONFIG);
                true
            }
        }
    }

    /// `AVCDecoderConfigurationRecord` bytes, once known.
    pub fn avc_config(&self) -> Option<Bytes> {
        match &self.config {
            ConfigTracker::H264(c) if c.ready() => c.avc_decoder_config().ok(),
            _ => None,
        }
    }

    /// `HEVCDecoderConfigurationRecord` bytes, once known.
    pub fn hevc_config(&self) -> Option<Bytes> {
        match &self.config {
            ConfigTracker::H265(c) if c.ready() => c.hevc_decoder_config().ok(),
            _ => None,
        }
    }

    /// The 2-byte MPEG-4 AudioSpecificConfig, once derived.
    pub fn aac_config(&self) -> Option<aac::AudioSpecificConfig> {
        match &self.config {
            ConfigTracker::Aac(c) => *c,
            _ => None,
        }
    }

    fn observe_video_config(&mut self, frame: &Frame) {
        let nal = frame.payload();
        match &mut self.config {
            ConfigTracker::H264(c) => {
                c.observe_nal(&nal);
            }
            ConfigTracker::H265(c) => {
                c.observe_nal(&nal);
            }
            _ => {}
        }
    }

    fn drain_pending(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        for f in pending {
            self.forward(&f)?;
        }
        Ok(())
    }

    fn forward(&mut self, frame: &Frame) -> Result<(), Error> {
        if self.codec == Codec::Aac {
            for sub in aac::split_adts(frame)? {
                self.downstream.input_frame(&sub)?;
            }
            Ok(())
        } else {
            self.downstream.input_frame(frame)
        }
    }

    fn cache_or_drop(&mut self, frame: Frame) {
        if self.pending.len() >= PENDING_CACHE_CAP {
            warn!("track pending-config cache full ({} frames); dropping oldest", PENDING_CACHE_CAP);
            self.pending.remove(0);
        }
        self.pending.push(frame);
    }
}

impl<D: FrameSink> FrameSink for Track<D> {
    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.codec.is_video() {
            self.observe_video_config(frame);
        } else if frame.codec == Codec::Aac {
            if let ConfigTracker::Aac(cfg @ None) = &mut self.config {
                if frame.prefix_size as usize == crate::frame::ADTS_HEADER_LEN {
                    if let Ok(c) = aac::AudioSpecificConfig::from_adts_header(&frame.data) {
                        self.audio.sample_rate = c.sampling_frequency().ok();
                        self.audio.channels = Some(c.channel_config);
                        self.audio.sample_bits = Some(16);
                        *cfg = Some(c);
                    }
                }
            }
        }

        if frame.config_frame {
            // Config frames are cheap and self-contained; forward
            // immediately regardless of readiness so a muxer watching the
            // raw frame stream (rather than polling `avc_config()`) still
            // sees them in order.
            self.downstream.input_frame(frame)?;
            if self.ready() {
                self.drain_pending()?;
            }
            return Ok(());
        }

        if !self.ready() {
            self.cache_or_drop(frame.get_cacheable());
            return Ok(());
        }

        self.forward(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ADTS_HEADER_LEN;
    use bytes::BytesMut;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct Collector(Rc<RefCell<Vec<Frame>>>);

    impl FrameSink for Collector {
        fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
            self.0.borrow_mut().push(frame.clone());
            Ok(())
        }
    }

    #[test]
    fn h264_track_drops_frames_before_config_then_forwards_after() {
        let sink_buf = Rc::new(RefCell::new(Vec::new()));
        let mut track = Track::new(Codec::H264, Collector(sink_buf.clone()));

        let idr = Frame::new(Codec::H264, 100, 100, Bytes::from_static(&[0, 0, 0, 1, 0x65, 1, 2]), 4, true, false);
        track.input_frame(&idr).unwrap();
        assert!(!track.ready());
        assert!(sink_buf.borrow().is_empty());

        let sps = Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e]), 4, false, true);
        let pps = Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]), 4, false, true);
        track.input_frame(&sps).unwrap();
        track.input_frame(&pps).unwrap();
        assert!(track.ready());
        assert!(track.avc_config().is_some());

        let idr2 = Frame::new(Codec::H264, 200, 200, Bytes::from_static(&[0, 0, 0, 1, 0x65, 3, 4]), 4, true, false);
        track.input_frame(&idr2).unwrap();

        let forwarded = sink_buf.borrow();
        // sps, pps forwarded as config frames; idr2 forwarded once ready.
        // The original idr (before config) is dropped, not cached, since
        // H.264 media frames carry no self-describing config to derive.
        assert_eq!(forwarded.len(), 3);
        assert_eq!(forwarded[2].dts, 200);
    }

    #[test]
    fn aac_track_becomes_ready_from_first_adts_frame_and_splits_concatenated_aus() {
        let sink_buf = Rc::new(RefCell::new(Vec::new()));
        let mut track = Track::new(Codec::Aac, Collector(sink_buf.clone()));
        assert!(!track.ready());

        fn adts_header(frame_len: usize) -> [u8; ADTS_HEADER_LEN] {
            let profile = 1u8;
            let sfi = 3u8;
            let chan = 2u8;
            [
                0xFF,
                0xF1,
                (profile << 6) | (sfi << 2) | (chan >> 2),
                ((chan & 0x03) << 6) | ((frame_len >> 11) as u8),
                ((frame_len >> 3) & 0xFF) as u8,
                (((frame_len & 0x07) as u8) << 5) | 0x1F,
                0xFC,
            ]
        }

        let mut data = BytesMut::new();
        data.extend_from_slice(&adts_header(ADTS_HEADER_LEN + 2));
        data.extend_from_slice(&[9, 9]);
        data.extend_from_slice(&adts_header(ADTS_HEADER_LEN + 3));
        data.extend_from_slice(&[1, 2, 3]);
        let frame = Frame::new(Codec::Aac, 50, 50, data.freeze(), ADTS_HEADER_LEN as u8, false, false);
        track.input_frame(&frame).unwrap();

        assert!(track.ready());
        let forwarded = sink_buf.borrow();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(&forwarded[0].payload()[..], &[9, 9]);
        assert_eq!(&forwarded[1].payload()[..], &[1, 2, 3]);
    }

    #[test]
    fn g711_track_is_ready_immediately() {
        let sink_buf = Rc::new(RefCell::new(Vec::new()));
        let track = Track::new(Codec::G711A, Collector(sink_buf));
        assert!(track.ready());
    }
}
