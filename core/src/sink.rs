//! `MediaSink`: the contract every per-protocol muxer
//! adapter implements, and the shared "all tracks added" gating logic every
//! adapter needs.
//!
//! Wire-level packetization (RTMP chunking, RTP/RTCP, MPEG-TS/PS, MP4 box
//! writing) is explicitly out of scope: a `MediaSink` accepts
//! [`crate::frame::Frame`]s and tracks, and is free to delegate the actual
//! byte layout to an external collaborator trait, which is how
//! [`crate::mux::ts::TsMuxer`] and [`crate::mux::fmp4::Fmp4Muxer`] treat
//! their external writers.

use std::time::{Duration, Instant};

use crate::config::SINGLE_TRACK_GRACE;
use crate::error::Error;
use crate::frame::Frame;
use crate::track::{AudioInfo, VideoInfo};

/// Snapshot of one track's identity handed to `add_track`, distinct from
/// [`crate::track::Track`] (which is generic over its downstream sink and
/// owns live config state) — a muxer only needs the codec and whatever
/// shape info is already known at `add_track` time.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    pub codec: crate::frame::Codec,
    pub video: VideoInfo,
    pub audio: AudioInfo,
}

/// A protocol-specific frame consumer: `add_track`/`add_track_completed`
/// lifecycle plus the `input_frame` hot path.
pub trait MediaSink: Send {
    fn add_track(&mut self, track: &TrackMeta) -> Result<(), Error>;

    /// Arms the muxer: no more tracks are expected. Idempotent.
    fn add_track_completed(&mut self);

    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Drops whatever ring cache/pending state the muxer holds, e.g. when a
    /// protocol is demand-gated and its last reader just detached.
    fn reset_tracks(&mut self) {}
}

/// Tracks how many tracks a muxer is waiting on before it arms, and the
/// "single-track 3s grace" ceiling: a stream that never calls
/// `add_track_completed` explicitly still starts once the grace timer
/// fires with whatever tracks are present. A track add *after* arming is
/// rejected and logged rather than accepted.
#[derive(Debug)]
pub struct TrackGate {
    armed: bool,
    track_count: usize,
    first_track_at: Option<Instant>,
    grace: Duration,
}

impl Default for TrackGate {
    fn default() -> Self {
        TrackGate {
            armed: false,
            track_count: 0,
            first_track_at: None,
            grace: SINGLE_TRACK_GRACE,
        }
    }
}

impl TrackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(())` if `track` should be accepted, `Err` (logged by the
    /// caller) if the muxer already armed and this is a late add.
    pub fn observe_add(&mut self) -> Result<(), Error> {
        if self.armed {
            return Err(failure::format_err!("add_track after muxer armed; rejecting late track"));
        }
        if self.track_count == 0 {
            self.first_track_at = Some(Instant::now());
        }
        self.track_count += 1;
        Ok(())
    }

    /// Explicit `add_track_completed()`: cancels the grace timer and arms
    /// immediately.
    pub fn complete(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&mut self) -> bool {
        if !self.armed && self.track_count > 0 {
            if let Some(first) = self.first_track_at {
                if first.elapsed() >= self.grace {
                    self.armed = true;
                }
            }
        }
        self.armed
    }
}
