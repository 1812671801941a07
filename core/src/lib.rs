//! Stream registry and media muxing fan-out engine.
//!
//! This crate is the core of a streaming media relay: a process-wide
//! [`registry::Registry`] that indexes live streams by a four-level key
//! (schema/vhost/app/stream id), a codec-neutral [`frame::Frame`] model with
//! per-track stamp revision ([`stamp::StampReviser`]), a GOP-aware
//! multi-consumer [`ring::Ring`], a merge-write batching layer
//! ([`flush::PacketCache`]), and the [`fanout::MultiMediaSourceMuxer`] that
//! drives every enabled per-protocol muxer ([`mux`]) and recorder
//! ([`recorder`]) off one producer's frame sequence.
//!
//! Wire-level parsing/serialization (RTMP chunk stream, RTSP/SDP, RTP
//! packetization per codec beyond what's listed below, MPEG-PS/TS, MP4 box
//! writing), raw network I/O, the HTTP API, and the configuration *loader*
//! all stay external collaborators; this crate only depends on the trait
//! boundaries they implement ([`sink::MediaSink`], [`frame::FrameSink`],
//! the various `*Writer`/`*Muxer`/`*Packetizer` traits under [`mux`],
//! [`recorder`] and [`rtp_sender`]).

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod fanout;
pub mod flush;
pub mod frame;
pub mod mux;
pub mod recorder;
pub mod registry;
pub mod ring;
pub mod rtp_sender;
pub mod sink;
pub mod speed;
pub mod stamp;
pub mod track;
pub mod url;

pub use error::Error;
