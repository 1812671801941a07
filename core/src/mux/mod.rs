//! Per-protocol muxer adapters: RTMP, RTSP, TS and fMP4. HLS
//! and MP4 recorders live in [`crate::recorder`] since they write to disk
//! rather than a live ring.
//!
//! Every muxer here is a concrete [`crate::sink::MediaSink`] that owns its
//! own [`crate::ring::Ring`] (one ring per muxer, collapsed onto the muxer
//! itself rather than threaded through a separate handle, since nothing
//! downstream of the muxer ever needs the two decoupled) and its own
//! [`crate::flush::PacketCache`] tuned per protocol.

pub mod fmp4;
pub mod rtmp;
pub mod rtsp;
pub mod ts;
