//! H.264 NAL classification and AVCDecoderConfigurationRecord construction.
//!
//! The NAL type table follows Table 7-1 of ISO/IEC 14496-10:2014(E); RTP
//! depacketization (FU-A reassembly) stays an external collaborator —
//! only NAL *classification*, used by [`crate::track::Track`] to detect
//! config NALs and keyframes, and the RTMP `AVCDecoderConfigurationRecord`
//! builder live here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use failure::bail;

pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_IDR: u8 = 5;
pub const NAL_NON_IDR: u8 = 1;
pub const NAL_SEI: u8 = 6;
pub const NAL_AUD: u8 = 9;

/// Returns the NAL unit type (bits 3-7 of the NAL header byte).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

pub fn is_config(nal_type: u8) -> bool {
    matches!(nal_type, NAL_SPS | NAL_PPS)
}

pub fn is_keyframe(nal_type: u8) -> bool {
    nal_type == NAL_IDR
}

pub fn is_vcl(nal_type: u8) -> bool {
    matches!(nal_type, 1..=5)
}

/// Tracks the config NALs (SPS/PPS) seen so far for one H.264 track.
#[derive(Debug, Default, Clone)]
pub struct ConfigState {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ConfigState {
    /// Feeds one (already-stripped-of-prefix) NAL unit. Returns true if this
    /// call made the track ready for the first time.
    pub fn observe_nal(&mut self, nal: &Bytes) -> bool {
        let was_ready = self.ready();
        match nal_type(nal) {
            Some(NAL_SPS) => self.sps = Some(nal.clone()),
            Some(NAL_PPS) => self.pps = Some(nal.clone()),
            _ => {}
        }
        !was_ready && self.ready()
    }

    pub fn ready(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Builds an `AVCDecoderConfigurationRecord` per ISO/IEC 14496-15, as
    /// the RTMP muxer needs for its config packet.
    pub fn avc_decoder_config(&self) -> Result<Bytes, Error> {
        let sps = self.sps.as_ref().ok_or_else(|| failure::format_err!("no SPS yet"))?;
        let pps = self.pps.as_ref().ok_or_else(|| failure::format_err!("no PPS yet"))?;
        if sps.len() < 4 {
            bail!("SPS too short ({} bytes)", sps.len());
        }
        let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
        buf.put_u8(1); // configurationVersion
        buf.put_u8(sps[1]); // AVCProfileIndication
        buf.put_u8(sps[2]); // profile_compatibility
        buf.put_u8(sps[3]); // AVCLevelIndication
        buf.put_u8(0xFF); // reserved(6)=1 + lengthSizeMinusOne=3 (4-byte lengths)
        buf.put_u8(0xE1); // reserved(3)=1 + numOfSequenceParameterSets=1
        buf.put_u16(sps.len() as u16);
        buf.put_slice(sps);
        buf.put_u8(1); // numOfPictureParameterSets
        buf.put_u16(pps.len() as u16);
        buf.put_slice(pps);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_nal_types() {
        assert_eq!(nal_type(&[0x67]), Some(NAL_SPS));
        assert_eq!(nal_type(&[0x68]), Some(NAL_PPS));
        assert_eq!(nal_type(&[0x65]), Some(NAL_IDR));
        assert!(is_config(NAL_SPS));
        assert!(!is_config(NAL_IDR));
        assert!(is_keyframe(NAL_IDR));
        assert!(is_vcl(NAL_NON_IDR));
        assert!(!is_vcl(NAL_SEI));
    }

    #[test]
    fn becomes_ready_only_once_both_present() {
        let mut cfg = ConfigState::default();
        assert!(!cfg.observe_nal(&Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e])));
        assert!(!cfg.ready());
        assert!(cfg.observe_nal(&Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])));
        assert!(cfg.ready());
    }

    #[test]
    fn avc_config_rejects_missing_pps() {
        let mut cfg = ConfigState::default();
        cfg.observe_nal(&Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e]));
        assert!(cfg.avc_decoder_config().is_err());
    }

    #[test]
    fn avc_config_embeds_sps_and_pps() {
        let mut cfg = ConfigState::default();
        let sps = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e, 0xaa, 0xbb]);
        let pps = Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]);
        cfg.observe_nal(&sps);
        cfg.observe_nal(&pps);
        let record = cfg.avc_decoder_config().unwrap();
        assert_eq!(record[0], 1);
        assert_eq!(record[1], 0x42);
        assert_eq!(record[3], 0x1e);
        let sps_len = u16::from_be_bytes([record[6], record[7]]) as usize;
        assert_eq!(sps_len, sps.len());
        assert_eq!(&record[8..8 + sps_len], &sps[..]);
    }
}
