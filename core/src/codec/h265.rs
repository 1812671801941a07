//! H.265/HEVC NAL classification and `HEVCDecoderConfigurationRecord`
//! construction. Modeled on [`super::h264`]'s table-driven style,
//! generalized to HEVC's NAL unit header (2 bytes, type in bits 1-6 of the
//! first byte) and three config NAL kinds instead of two. RTP
//! (de)packetization stays external.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use failure::bail;

pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
// IDR_W_RADL / IDR_N_LP / CRA_NUT: RFC 7798 §7.
const NAL_IDR_W_RADL: u8 = 19;
const NAL_IDR_N_LP: u8 = 20;
const NAL_CRA: u8 = 21;

/// Returns the HEVC NAL unit type (bits 1-6 of the first header byte).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

pub fn is_config(nal_type: u8) -> bool {
    matches!(nal_type, NAL_VPS | NAL_SPS | NAL_PPS)
}

pub fn is_keyframe(nal_type: u8) -> bool {
    matches!(nal_type, NAL_IDR_W_RADL | NAL_IDR_N_LP | NAL_CRA)
}

/// Tracks the config NALs (VPS/SPS/PPS) seen so far for one H.265 track.
#[derive(Debug, Default, Clone)]
pub struct ConfigState {
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ConfigState {
    pub fn observe_nal(&mut self, nal: &Bytes) -> bool {
        let was_ready = self.ready();
        match nal_type(nal) {
            Some(NAL_VPS) => self.vps = Some(nal.clone()),
            Some(NAL_SPS) => self.sps = Some(nal.clone()),
            Some(NAL_PPS) => self.pps = Some(nal.clone()),
            _ => {}
        }
        !was_ready && self.ready()
    }

    pub fn ready(&self) -> bool {
        self.vps.is_some() && self.sps.is_some() && self.pps.is_some()
    }

    /// Builds a minimal `HEVCDecoderConfigurationRecord` (ISO/IEC 14496-15
    /// §8.3.3.1) carrying one VPS, one SPS and one PPS array, each with a
    /// single NAL unit. General profile/tier/level fields are left zeroed:
    /// no downstream consumer in this crate inspects them, and deriving them
    /// correctly requires parsing the SPS profile_tier_level() structure,
    /// which is out of scope (see [`super::h264`]'s equivalent note).
    pub fn hevc_decoder_config(&self) -> Result<Bytes, Error> {
        let vps = self.vps.as_ref().ok_or_else(|| failure::format_err!("no VPS yet"))?;
        let sps = self.sps.as_ref().ok_or_else(|| failure::format_err!("no SPS yet"))?;
        let pps = self.pps.as_ref().ok_or_else(|| failure::format_err!("no PPS yet"))?;
        if vps.is_empty() || sps.is_empty() || pps.is_empty() {
            bail!("empty HEVC config NAL");
        }
        let mut buf = BytesMut::with_capacity(23 + 3 * 5 + vps.len() + sps.len() + pps.len());
        buf.put_u8(1); // configurationVersion
        buf.put_u8(0); // general_profile_space/tier/idc
        buf.put_u32(0); // general_profile_compatibility_flags
        buf.put_slice(&[0u8; 6]); // general_constraint_indicator_flags
        buf.put_u8(0); // general_level_idc
        buf.put_u16(0xF000); // reserved(4)=1111 + min_spatial_segmentation_idc(12)=0
        buf.put_u8(0xFC); // reserved(6)=1 + parallelismType(2)=0
        buf.put_u8(0xFC); // reserved(6)=1 + chromaFormat(2)=1 (4:2:0), approximated
        buf.put_u8(0xF8); // reserved(5)=1 + bitDepthLumaMinus8(3)=0
        buf.put_u8(0xF8); // reserved(5)=1 + bitDepthChromaMinus8(3)=0
        buf.put_u16(0); // avgFrameRate
        buf.put_u8(0x03); // constantFrameRate(2)=0,numTemporalLayers(3)=0,temporalIdNested(1)=0,lengthSizeMinusOne(2)=3
        buf.put_u8(3); // numOfArrays
        for (nal_unit_type, nal) in [(NAL_VPS, vps), (NAL_SPS, sps), (NAL_PPS, pps)] {
            buf.put_u8(0x80 | nal_unit_type); // array_completeness(1)=1, reserved(1)=0, NAL_unit_type(6)
            buf.put_u16(1); // numNalus
            buf.put_u16(nal.len() as u16);
            buf.put_slice(nal);
        }
        Ok(buf.freeze())
    }
}
