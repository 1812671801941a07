//! Codec-neutral frame model.
//!
//! Collapses per-codec video/audio frame types into one concrete `Frame`
//! carrying a `Codec` tag, since the fan-out needs to treat audio and
//! video uniformly on the hot path rather than dispatch on a separate enum
//! per call.

use bytes::Bytes;

use crate::error::Error;

/// Elementary stream codec. `type = audio|video` is derived, not stored
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
    Opus,
    L16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Audio,
    Video,
}

impl Codec {
    pub fn track_type(&self) -> TrackType {
        match self {
            Codec::H264 | Codec::H265 => TrackType::Video,
            Codec::Aac | Codec::G711A | Codec::G711U | Codec::Opus | Codec::L16 => TrackType::Audio,
        }
    }

    pub fn is_video(&self) -> bool {
        self.track_type() == TrackType::Video
    }
}

/// Length, in bytes, of an ADTS header.
pub const ADTS_HEADER_LEN: usize = 7;

/// One coded access unit.
///
/// `data` holds `prefix_size` bytes of embedded framing (an Annex-B start
/// code, an ADTS header, ...) followed by the raw payload. `prefix_size` is
/// redundant with that framing's own self-description, but is kept
/// explicit so a muxer never has to re-parse bytes it didn't itself write.
#[derive(Debug, Clone)]
pub struct Frame {
    pub codec: Codec,
    /// Decode timestamp, milliseconds, 32-bit.
    pub dts: u32,
    /// Presentation timestamp, milliseconds; may equal `dts`.
    pub pts: u32,
    pub data: Bytes,
    pub prefix_size: u8,
    pub key_frame: bool,
    pub config_frame: bool,
    /// Whether storing this frame's pointer beyond the call is safe. A
    /// frame built straight from a borrowed network buffer is typically
    /// non-cacheable; [`Frame::get_cacheable`] returns an owned, cacheable
    /// copy.
    pub cacheable: bool,
}

impl Frame {
    pub fn new(codec: Codec, dts: u32, pts: u32, data: Bytes, prefix_size: u8, key_frame: bool, config_frame: bool) -> Self {
        Frame {
            codec,
            dts,
            pts,
            data,
            prefix_size,
            key_frame,
            config_frame,
            cacheable: true,
        }
    }

    /// Raw payload past the embedded prefix (e.g. past the Annex-B start
    /// code or the ADTS header).
    pub fn payload(&self) -> Bytes {
        self.data.slice(usize::from(self.prefix_size)..)
    }

    /// Returns a cacheable copy of this frame. `Bytes` is already
    /// refcounted so this only needs to flip the flag once the underlying
    /// storage is known to be owned (a `Bytes` built via `copy_from_slice`
    /// or `freeze()` rather than a zero-copy view over a reusable network
    /// buffer).
    pub fn get_cacheable(&self) -> Frame {
        if self.cacheable {
            self.clone()
        } else {
            let mut f = self.clone();
            f.data = Bytes::copy_from_slice(&self.data);
            f.cacheable = true;
            f
        }
    }

    /// The single hot-path entry point: hands this frame to a sink.
    pub fn input(&self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        sink.input_frame(self)
    }
}

/// A polymorphic consumer of [`Frame`]s. Implemented by [`crate::track::Track`],
/// by each per-protocol muxer, and by the fan-out.
pub trait FrameSink {
    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error>;
}
