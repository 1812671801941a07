//! RTMP muxer adapter.
//!
//! Builds FLV tag bodies directly (no RTMP chunk-stream framing — that
//! stays an external collaborator) and batches them through a
//! [`PacketCache`] before publishing to the ring, exactly as every other
//! muxer in this module does.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;

use crate::codec::{aac, h264, h265};
use crate::error::Error;
use crate::flush::{FlushPolicy, PacketCache};
use crate::frame::{Codec, Frame, ADTS_HEADER_LEN};
use crate::ring::{FlushUnit, Ring};
use crate::sink::{MediaSink, TrackGate, TrackMeta};

const VIDEO_CODEC_H264: u8 = 7;
const VIDEO_CODEC_HEVC: u8 = 12;
const AUDIO_CODEC_AAC: u8 = 10;
const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;
const PACKET_TYPE_CONFIG: u8 = 0;
const PACKET_TYPE_DATA: u8 = 1;

/// Frames accumulated for the access unit currently being built, for one
/// track type: same-DTS frames accumulate together and flush on DTS
/// change.
struct NalGroup {
    codec: Codec,
    dts: u32,
    pts: u32,
    key_frame: bool,
    nals: Vec<Bytes>,
}

fn flv_header(codec_byte: u8, packet_type: u8, composition_time: i32) -> [u8; 5] {
    let ct = composition_time.max(0) as u32;
    [codec_byte, packet_type, (ct >> 16) as u8, (ct >> 8) as u8, ct as u8]
}

pub struct RtmpMuxer {
    gate: TrackGate,
    demand: bool,
    h264: h264::ConfigState,
    h265: h265::ConfigState,
    aac_config: Option<aac::AudioSpecificConfig>,
    video_group: Option<NalGroup>,
    audio_group: Option<NalGroup>,
    video_cache: PacketCache<Bytes>,
    audio_cache: PacketCache<Bytes>,
    ring: Arc<Ring<Bytes>>,
}

impl RtmpMuxer {
    pub fn new(merge_ms: i64, ring_capacity: usize, demand: bool) -> Self {
        RtmpMuxer {
            gate: TrackGate::new(),
            demand,
            h264: h264::ConfigState::default(),
            h265: h265::ConfigState::default(),
            aac_config: None,
            video_group: None,
            audio_group: None,
            video_cache: PacketCache::new(FlushPolicy::new(merge_ms)),
            audio_cache: PacketCache::new(FlushPolicy::new(merge_ms)),
            ring: Arc::new(Ring::new(ring_capacity)),
        }
    }

    pub fn ring(&self) -> Arc<Ring<Bytes>> {
        self.ring.clone()
    }

    /// True iff at least one reader is attached, or demand-gating is off
    /// for RTMP (`general.rtmpDemand`).
    pub fn is_enabled(&self) -> bool {
        !self.demand || self.ring.reader_count() > 0
    }

    fn emit_video_config(&mut self, codec: Codec) {
        let record = match codec {
            Codec::H264 if self.h264.ready() => self.h264.avc_decoder_config().ok(),
            Codec::H265 if self.h265.ready() => self.h265.hevc_decoder_config().ok(),
            _ => None,
        };
        let Some(record) = record else { return };
        let codec_byte = (FRAME_TYPE_KEY << 4) | if codec == Codec::H264 { VIDEO_CODEC_H264 } else { VIDEO_CODEC_HEVC };
        let mut buf = BytesMut::with_capacity(5 + record.len());
        buf.put_slice(&flv_header(codec_byte, PACKET_TYPE_CONFIG, 0));
        buf.put_slice(&record);
        self.flush_tag(true, buf.freeze(), true);
    }

    fn emit_aac_config(&mut self, cfg: &aac::AudioSpecificConfig) {
        let payload = cfg.to_bytes();
        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_slice(&flv_header(AUDIO_CODEC_AAC << 4, PACKET_TYPE_CONFIG, 0));
        buf.put_slice(&payload);
        self.flush_tag(false, buf.freeze(), true);
    }

    fn flush_tag(&mut self, is_video: bool, tag: Bytes, is_key: bool) {
        let ring = self.ring.clone();
        if is_video {
            self.video_cache.input(0, true, tag, is_key, |pending, key| {
                ring.push(FlushUnit { packets: pending, is_key: key });
            });
        } else {
            let ring = self.ring.clone();
            self.audio_cache.input(0, false, tag, is_key, |pending, key| {
                ring.push(FlushUnit { packets: pending, is_key: key });
            });
        }
    }

    fn close_group(&mut self, is_video: bool) {
        let group = if is_video { self.video_group.take() } else { self.audio_group.take() };
        let Some(group) = group else { return };
        let tag = build_tag(&group);
        let stamp = i64::from(group.dts);
        let ring = self.ring.clone();
        let cache = if is_video { &mut self.video_cache } else { &mut self.audio_cache };
        cache.input(stamp, is_video, tag, group.key_frame, |pending, key| {
            ring.push(FlushUnit { packets: pending, is_key: key });
        });
    }
}

fn build_tag(group: &NalGroup) -> Bytes {
    let codec_byte = match group.codec {
        Codec::H264 => (if group.key_frame { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER } << 4) | VIDEO_CODEC_H264,
        Codec::H265 => (if group.key_frame { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER } << 4) | VIDEO_CODEC_HEVC,
        _ => AUDIO_CODEC_AAC << 4,
    };
    let composition_time = (group.pts as i64 - group.dts as i64) as i32;
    let body_len: usize = if group.codec.is_video() {
        group.nals.iter().map(|n| 4 + n.len()).sum()
    } else {
        group.nals.iter().map(|n| n.len()).sum()
    };
    let mut buf = BytesMut::with_capacity(5 + body_len);
    buf.put_slice(&flv_header(codec_byte, PACKET_TYPE_DATA, composition_time));
    for nal in &group.nals {
        if group.codec.is_video() {
            buf.put_u32(nal.len() as u32);
        }
        buf.put_slice(nal);
    }
    buf.freeze()
}

impl MediaSink for RtmpMuxer {
    fn add_track(&mut self, _track: &TrackMeta) -> Result<(), Error> {
        self.gate.observe_add()
    }

    fn add_track_completed(&mut self) {
        self.gate.complete();
    }

    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let is_video = frame.codec.is_video();

        if frame.config_frame {
            match frame.codec {
                Codec::H264 => {
                    if self.h264.observe_nal(&frame.payload()) {
                        self.emit_video_config(Codec::H264);
                    }
                    return Ok(());
                }
                Codec::H265 => {
                    if self.h265.observe_nal(&frame.payload()) {
                        self.emit_video_config(Codec::H265);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }

        if frame.codec == Codec::Aac && self.aac_config.is_none() && frame.prefix_size as usize == ADTS_HEADER_LEN {
            if let Ok(cfg) = aac::AudioSpecificConfig::from_adts_header(&frame.data) {
                self.aac_config = Some(cfg);
                self.emit_aac_config(&cfg);
            }
        }

        let nal = frame.payload();
        let group = if is_video { &mut self.video_group } else { &mut self.audio_group };
        match group {
            Some(g) if g.dts == frame.dts => {
                g.nals.push(nal);
                g.key_frame = g.key_frame || frame.key_frame;
            }
            Some(_) => {
                self.close_group(is_video);
                *(if is_video { &mut self.video_group } else { &mut self.audio_group }) = Some(NalGroup {
                    codec: frame.codec,
                    dts: frame.dts,
                    pts: frame.pts,
                    key_frame: frame.key_frame,
                    nals: vec![nal],
                });
            }
            None => {
                *(if is_video { &mut self.video_group } else { &mut self.audio_group }) = Some(NalGroup {
                    codec: frame.codec,
                    dts: frame.dts,
                    pts: frame.pts,
                    key_frame: frame.key_frame,
                    nals: vec![nal],
                });
            }
        }
        Ok(())
    }

    fn reset_tracks(&mut self) {
        self.h264 = h264::ConfigState::default();
        self.h265 = h265::ConfigState::default();
        self.aac_config = None;
        self.video_group = None;
        self.audio_group = None;
        warn!("rtmp muxer tracks reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes as B;

    fn sps() -> Frame {
        Frame::new(Codec::H264, 0, 0, B::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e]), 4, false, true)
    }
    fn pps() -> Frame {
        Frame::new(Codec::H264, 0, 0, B::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]), 4, false, true)
    }
    fn idr(dts: u32) -> Frame {
        Frame::new(Codec::H264, dts, dts, B::from_static(&[0, 0, 0, 1, 0x65, 1, 2, 3]), 4, true, false)
    }

    #[test]
    fn emits_avc_config_once_sps_and_pps_seen() {
        let mut mux = RtmpMuxer::new(300, 16, false);
        mux.add_track(&TrackMeta { codec: Codec::H264, video: Default::default(), audio: Default::default() }).unwrap();
        mux.input_frame(&sps()).unwrap();
        mux.input_frame(&pps()).unwrap();
        mux.input_frame(&idr(40)).unwrap();
        mux.close_group(true);
        // Config tag (packet_type=0) should have been flushed ahead of the
        // media tag once both config tags were force-flushed by the next
        // keyframe boundary in a real pipeline; here we flush explicitly.
        mux.video_cache.flush(|pending, _key| {
            for tag in &pending {
                assert_eq!(tag[1], if tag[0] >> 4 == FRAME_TYPE_KEY { PACKET_TYPE_CONFIG } else { PACKET_TYPE_DATA });
            }
        });
    }

    #[test]
    fn aac_frame_without_adts_prefix_never_derives_a_config() {
        // Holding media back until a codec config is known is the upstream
        // Track's job; this muxer only derives the AAC sequence header it
        // needs to emit from whatever ADTS-framed frames actually reach it.
        let mut mux = RtmpMuxer::new(0, 16, false);
        let bare = Frame::new(Codec::Aac, 0, 0, B::from_static(&[1, 2, 3]), 0, false, false);
        mux.input_frame(&bare).unwrap();
        assert!(mux.aac_config.is_none());
    }
}
