//! Per-codec packetization contracts.
//!
//! H.264/H.265 RTP (de)packetization is explicitly external to this crate
//!; what lives here for those two codecs is NAL
//! classification and RTMP/MP4 config-record construction, both named
//! operations the muxers depend on directly.

pub mod aac;
pub mod g711;
pub mod generic_rtp;
pub mod h264;
pub mod h265;
