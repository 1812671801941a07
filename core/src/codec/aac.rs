//! AAC: ADTS scanning/splitting, AudioSpecificConfig derivation, and the
//! MPEG4-GENERIC RTP (de)packetizer.
//!
//! Builds on the same `AudioSpecificConfig` parsing and AU-header fragment
//! reassembly approach an RTP-receiving AAC client needs, plus ISO/IEC
//! 13818-7 Annex-B (the ADTS header this crate additionally needs to
//! scan/emit, since an ingest source may hand over AAC already ADTS-framed
//! rather than pre-split into access units).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::frame::{Codec, Frame, ADTS_HEADER_LEN};
use failure::bail;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

/// A 2-byte MPEG-4 AudioSpecificConfig (ISO/IEC 14496-3 §1.6.2.1), limited to
/// the GASpecificConfig-less fixed fields an ADTS header directly carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn sampling_frequency(&self) -> Result<u32, Error> {
        SAMPLING_FREQUENCIES
            .get(self.sampling_frequency_index as usize)
            .copied()
            .ok_or_else(|| failure::format_err!("reserved sampling_frequency_index {}", self.sampling_frequency_index))
    }

    /// Derives the config directly from an ADTS fixed header (first 7
    /// bytes): object type, sample-rate index, and channel config all live
    /// in those bytes, so no separate AAC config frame is required when
    /// ingest hands over ADTS-framed audio.
    pub fn from_adts_header(header: &[u8]) -> Result<Self, Error> {
        if header.len() < ADTS_HEADER_LEN {
            bail!("ADTS header too short ({} bytes)", header.len());
        }
        if header[0] != 0xFF || header[1] & 0xF0 != 0xF0 {
            bail!("bad ADTS syncword");
        }
        let profile = (header[2] >> 6) & 0x03;
        let sampling_frequency_index = (header[2] >> 2) & 0x0F;
        let channel_config = ((header[2] & 0x01) << 2) | ((header[3] >> 6) & 0x03);
        Ok(AudioSpecificConfig {
            object_type: profile + 1,
            sampling_frequency_index,
            channel_config,
        })
    }

    /// Packs into the 2-byte wire form RTMP's AAC sequence header and an MP4
    /// `esds` box both embed.
    pub fn to_bytes(&self) -> [u8; 2] {
        let b0 = (self.object_type << 3) | (self.sampling_frequency_index >> 1);
        let b1 = ((self.sampling_frequency_index & 0x01) << 7) | (self.channel_config << 3);
        [b0, b1]
    }
}

/// Length, in bytes, of one ADTS access unit, read from its 13-bit
/// `frame_length` field (bytes 3-5, spanning the header itself).
fn adts_frame_length(header: &[u8]) -> usize {
    (((header[3] & 0x03) as usize) << 11) | ((header[4] as usize) << 3) | ((header[5] as usize) >> 5)
}

/// Splits a frame whose payload is one or more concatenated ADTS access
/// units into one sub-frame per unit, all sharing the parent's `dts`
///. Returns a single-element vec unchanged if `prefix_size`
/// isn't 7 (bare payload, nothing to scan).
pub fn split_adts(frame: &Frame) -> Result<Vec<Frame>, Error> {
    if frame.prefix_size != ADTS_HEADER_LEN as u8 {
        return Ok(vec![frame.clone()]);
    }
    let mut out = Vec::new();
    let mut data = frame.data.clone();
    while !data.is_empty() {
        if data.len() < ADTS_HEADER_LEN {
            bail!("trailing bytes too short for an ADTS header ({} left)", data.len());
        }
        let au_len = adts_frame_length(&data);
        if au_len < ADTS_HEADER_LEN {
            // A declared length shorter than the header itself is invalid.
            bail!("ADTS frame_length {} shorter than header", au_len);
        }
        if au_len > data.len() {
            bail!("ADTS frame_length {} exceeds remaining {} bytes", au_len, data.len());
        }
        let au = data.slice(0..au_len);
        out.push(Frame {
            codec: Codec::Aac,
            dts: frame.dts,
            pts: frame.pts,
            data: au,
            prefix_size: ADTS_HEADER_LEN as u8,
            key_frame: false,
            config_frame: frame.config_frame,
            cacheable: frame.cacheable,
        });
        data.advance(au_len);
    }
    Ok(out)
}

/// Builds the 4-byte AU-header section:
/// `{0x00, 0x10, size>>5, (size&0x1F)<<3}` (a 2-byte AU-headers-length field
/// of 16 bits, followed by one 13-bit size + 3-bit index AU-header).
pub fn au_header(size: u16) -> [u8; 4] {
    [0x00, 0x10, (size >> 5) as u8, ((size & 0x1F) << 3) as u8]
}

/// One RTP packet's worth of a single AAC access unit, built as a
/// MPEG4-GENERIC single-payload packet; callers are responsible for
/// fragmenting across multiple packets if `payload.len() > mtu - 20`
/// (handled generically by [`super::generic_rtp`] for codecs that need it —
/// AAC's hbr mode never crosses that boundary in practice).
pub fn packetize(payload: &[u8]) -> Result<Bytes, Error> {
    if payload.len() > 0x1FFF {
        bail!("AAC access unit too large for a 13-bit AU-header size field");
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_slice(&au_header(payload.len() as u16));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// One depacketized access unit: its payload plus the dts/pts the caller
/// should assign it (derived from the RTP timestamp delta divided evenly
/// across however many AUs the packet carried).
pub struct Depacketized {
    pub payload: Bytes,
    pub dts_offset_ms: u32,
}

/// Parses an MPEG4-GENERIC RTP payload carrying one or more AU-headers
/// followed by their AU data: parses the AU-header count, computes
/// `dts_inc = (rtp_ts - last_rtp_ts) / count`, and emits one frame per AU
/// with interpolated timestamps.
pub fn depacketize(mut payload: Bytes, rtp_ts_delta: u32, clock_rate: u32) -> Result<Vec<Depacketized>, Error> {
    if payload.len() < 2 {
        bail!("AAC RTP payload too short for AU-headers-length");
    }
    let au_headers_length_bits = payload.get_u16() as usize;
    let au_header_count = au_headers_length_bits / 16;
    if au_header_count == 0 {
        bail!("AAC RTP payload declares zero AU-headers");
    }
    if payload.len() < au_header_count * 2 {
        bail!("AAC RTP payload truncated before AU-headers end");
    }
    let mut sizes = Vec::with_capacity(au_header_count);
    for _ in 0..au_header_count {
        let h0 = payload.get_u8();
        let h1 = payload.get_u8();
        let size = ((h0 as u16) << 5) | ((h1 as u16) >> 3);
        sizes.push(size as usize);
    }
    let total: usize = sizes.iter().sum();
    if payload.len() < total {
        bail!("AAC RTP payload shorter than sum of AU sizes");
    }
    let dts_inc_ms = ((rtp_ts_delta as u64) * 1000 / (au_header_count as u64) / clock_rate as u64) as u32;
    let mut out = Vec::with_capacity(au_header_count);
    for (i, size) in sizes.into_iter().enumerate() {
        let au = payload.slice(0..size);
        payload.advance(size);
        out.push(Depacketized {
            payload: au,
            dts_offset_ms: dts_inc_ms * i as u32,
        });
    }
    Ok(out)
}

/// Prepends a synthesized ADTS header, derived from the cached AAC config,
/// to a depacketized payload before forwarding it upstream.
pub fn prepend_adts(config: &AudioSpecificConfig, payload: &[u8]) -> Result<Bytes, Error> {
    let frame_len = ADTS_HEADER_LEN + payload.len();
    if frame_len > 0x1FFF {
        bail!("AAC access unit too large for a 13-bit ADTS frame_length field");
    }
    let mut buf = BytesMut::with_capacity(frame_len);
    buf.put_u8(0xFF);
    buf.put_u8(0xF1); // MPEG-4, no CRC
    let profile = config.object_type.saturating_sub(1);
    buf.put_u8((profile << 6) | (config.sampling_frequency_index << 2) | (config.channel_config >> 2));
    buf.put_u8(((config.channel_config & 0x03) << 6) | ((frame_len >> 11) as u8));
    buf.put_u8(((frame_len >> 3) & 0xFF) as u8);
    buf.put_u8((((frame_len & 0x07) as u8) << 5) | 0x1F);
    buf.put_u8(0xFC);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_adts_header(frame_len: usize) -> [u8; ADTS_HEADER_LEN] {
        // object_type=2 (AAC LC), sampling_frequency_index=3 (48kHz), channel_config=2 (stereo).
        let profile = 1u8; // object_type - 1
        let sfi = 3u8;
        let chan = 2u8;
        [
            0xFF,
            0xF1,
            (profile << 6) | (sfi << 2) | (chan >> 2),
            (((chan & 0x03) << 6) | ((frame_len >> 11) as u8)) as u8,
            ((frame_len >> 3) & 0xFF) as u8,
            (((frame_len & 0x07) as u8) << 5) | 0x1F,
            0xFC,
        ]
    }

    #[test]
    fn derives_config_from_adts_header() {
        let hdr = sample_adts_header(ADTS_HEADER_LEN + 10);
        let cfg = AudioSpecificConfig::from_adts_header(&hdr).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sampling_frequency_index, 3);
        assert_eq!(cfg.channel_config, 2);
        assert_eq!(cfg.sampling_frequency().unwrap(), 48_000);
    }

    #[test]
    fn splits_two_concatenated_adts_units() {
        let mut data = BytesMut::new();
        let payload_a = [1u8, 2, 3];
        let payload_b = [4u8, 5];
        data.extend_from_slice(&sample_adts_header(ADTS_HEADER_LEN + payload_a.len()));
        data.extend_from_slice(&payload_a);
        data.extend_from_slice(&sample_adts_header(ADTS_HEADER_LEN + payload_b.len()));
        data.extend_from_slice(&payload_b);
        let frame = Frame::new(Codec::Aac, 10, 10, data.freeze(), ADTS_HEADER_LEN as u8, false, false);
        let subs = split_adts(&frame).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].dts, 10);
        assert_eq!(&subs[0].payload()[..], &payload_a);
        assert_eq!(&subs[1].payload()[..], &payload_b);
    }

    #[test]
    fn rejects_declared_length_shorter_than_header() {
        let mut data = BytesMut::new();
        let mut hdr = sample_adts_header(3);
        hdr[3] &= !0x03;
        hdr[4] = 0;
        hdr[5] = ((3u8) << 5) | 0x1F;
        data.extend_from_slice(&hdr);
        let frame = Frame::new(Codec::Aac, 0, 0, data.freeze(), ADTS_HEADER_LEN as u8, false, false);
        assert!(split_adts(&frame).is_err());
    }

    #[test]
    fn au_header_packs_size_bits() {
        let h = au_header(256);
        assert_eq!(h, [0x00, 0x10, 8, 0]);
    }

    #[test]
    fn depacketizes_two_access_units_with_interpolated_timestamps() {
        // Scenario: two AU-headers declaring sizes 256 and 128, rtp_ts delta
        // 2048 at 48kHz clock rate, 384 payload bytes total.
        let mut buf = BytesMut::new();
        buf.put_u16(32); // 2 AU-headers * 16 bits
        buf.put_slice(&au_header(256));
        buf.put_slice(&au_header(128));
        buf.extend_from_slice(&vec![0xAAu8; 256]);
        buf.extend_from_slice(&vec![0xBBu8; 128]);
        let frames = depacketize(buf.freeze(), 2048, 48_000).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), 256);
        assert_eq!(frames[1].payload.len(), 128);
        assert_eq!(frames[0].dts_offset_ms, 0);
        assert_eq!(frames[1].dts_offset_ms, 21); // 1024/48 truncated
    }

    #[test]
    fn prepends_adts_matching_cached_config() {
        let cfg = AudioSpecificConfig {
            object_type: 2,
            sampling_frequency_index: 3,
            channel_config: 2,
        };
        let payload = [9u8, 9, 9];
        let framed = prepend_adts(&cfg, &payload).unwrap();
        assert_eq!(framed.len(), ADTS_HEADER_LEN + payload.len());
        let parsed = AudioSpecificConfig::from_adts_header(&framed).unwrap();
        assert_eq!(parsed, cfg);
    }
}
