//! RTSP muxer adapter.
//!
//! Produces an SDP from ready tracks and, per frame, one or more
//! [`RtpPacket`]s. AAC and the generic codecs (G.711/Opus/L16) are
//! packetized in-crate ([`crate::codec::aac`], [`crate::codec::generic_rtp`]);
//! H.264/H.265 RTP packetization is explicitly external and is reached
//! through [`H26xPacketizer`], a seam an RTP-aware collaborator fills in
//! (the mirror image of the depacketizing role an RTSP client's NAL
//! assembler plays on the receive side).

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{aac, generic_rtp};
use crate::config::RtpConfig;
use crate::error::Error;
use crate::flush::{FlushPolicy, PacketCache};
use crate::frame::{Codec, Frame};
use crate::ring::{FlushUnit, Ring};
use crate::sink::{MediaSink, TrackGate, TrackMeta};

/// One RTP packet ready to be wrapped in its transport header (sequence
/// number, SSRC, UDP/interleaved framing) by an external session — all of
/// which stay out of scope here.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload: Bytes,
    pub dts: u32,
}

/// External collaborator for H.264/H.265 RTP packetization (RFC 6184 /
/// RFC 7798), the one piece of the RTSP contract pushed outside this
/// crate.
pub trait H26xPacketizer: Send {
    fn packetize(&mut self, codec: Codec, frame: &Frame, mtu: usize) -> Result<Vec<RtpPacket>, Error>;
}

/// Falls back to dropping H.26x frames with a warning when no real
/// packetizer is wired in — keeps the muxer usable for AAC/G.711/Opus-only
/// streams (and in tests) without requiring every caller to supply one.
struct NoH26xPacketizer;

impl H26xPacketizer for NoH26xPacketizer {
    fn packetize(&mut self, codec: Codec, _frame: &Frame, _mtu: usize) -> Result<Vec<RtpPacket>, Error> {
        Err(failure::format_err!("no H.26x RTP packetizer configured for {:?}", codec))
    }
}

pub struct RtspMuxer {
    gate: TrackGate,
    demand: bool,
    rtp: RtpConfig,
    h26x: Box<dyn H26xPacketizer>,
    cache: PacketCache<RtpPacket>,
    ring: Arc<Ring<RtpPacket>>,
    sdp_ready: bool,
}

impl RtspMuxer {
    pub fn new(merge_ms: i64, ring_capacity: usize, demand: bool, rtp: RtpConfig) -> Self {
        RtspMuxer {
            gate: TrackGate::new(),
            demand,
            rtp,
            h26x: Box::new(NoH26xPacketizer),
            cache: PacketCache::new(FlushPolicy::new(merge_ms)),
            ring: Arc::new(Ring::new(ring_capacity)),
            sdp_ready: false,
        }
    }

    pub fn with_h26x_packetizer(mut self, p: Box<dyn H26xPacketizer>) -> Self {
        self.h26x = p;
        self
    }

    pub fn ring(&self) -> Arc<Ring<RtpPacket>> {
        self.ring.clone()
    }

    pub fn is_enabled(&self) -> bool {
        !self.demand || self.ring.reader_count() > 0
    }

    pub fn sdp_ready(&self) -> bool {
        self.sdp_ready
    }

    fn clock_rate(codec: Codec) -> u32 {
        match codec {
            Codec::H264 | Codec::H265 => 90_000,
            Codec::Aac => 48_000, // actual rate comes from AudioSpecificConfig in a real SDP
            Codec::Opus => 48_000,
            Codec::G711A | Codec::G711U => 8_000,
            Codec::L16 => 44_100,
        }
    }

    fn push_packets(&mut self, dts: u32, is_video: bool, packets: Vec<RtpPacket>, key: bool) {
        let ring = self.ring.clone();
        for (i, pkt) in packets.into_iter().enumerate() {
            let is_key_pos = key && i == 0;
            self.cache.input(i64::from(dts), is_video, pkt, is_key_pos, |pending, key| {
                ring.push(FlushUnit { packets: pending, is_key: key });
            });
        }
    }
}

impl MediaSink for RtspMuxer {
    fn add_track(&mut self, _track: &TrackMeta) -> Result<(), Error> {
        self.gate.observe_add()
    }

    fn add_track_completed(&mut self) {
        self.gate.complete();
        self.sdp_ready = true;
    }

    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let mtu = self.rtp.video_mtu_size;
        let packets = match frame.codec {
            Codec::H264 | Codec::H265 => self.h26x.packetize(frame.codec, frame, mtu)?,
            Codec::Aac => {
                let payload = aac::packetize(&frame.payload())?;
                vec![RtpPacket { marker: true, payload, dts: frame.dts }]
            }
            Codec::G711A | Codec::G711U | Codec::Opus | Codec::L16 => generic_rtp::packetize(&frame.payload(), mtu)
                .into_iter()
                .map(|payload| RtpPacket { marker: true, payload, dts: frame.dts })
                .collect(),
        };
        self.push_packets(frame.dts, frame.codec.is_video(), packets, frame.key_frame);
        Ok(())
    }

    fn reset_tracks(&mut self) {
        self.sdp_ready = false;
    }
}
