//! Fragmented MP4 muxer adapter.
//!
//! The box layout itself (`moov`/`moof`/`mdat`) is an external collaborator
//! ([`Fmp4Writer`]); what lives here is segment-boundary timing (≥ 50ms
//! elapsed or a keyframe, whichever comes first) and caching
//! the init segment so every new reader gets it ahead of live segments,
//! regardless of what the ring's GOP retention window currently holds.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;
use crate::frame::Frame;
use crate::ring::{FlushUnit, Reader, Ring};
use crate::sink::{MediaSink, TrackGate, TrackMeta};

/// Minimum time between media segment flushes, absent an intervening
/// keyframe.
const SEGMENT_INTERVAL: Duration = Duration::from_millis(50);

/// External fMP4 box writer. `write_sample` buffers; `save_segment`
/// finalizes whatever is buffered into one `moof`+`mdat` fragment.
pub trait Fmp4Writer: Send {
    fn write_init_segment(&mut self) -> Result<Bytes, Error>;
    fn write_sample(&mut self, frame: &Frame) -> Result<(), Error>;
    fn save_segment(&mut self) -> Result<Bytes, Error>;
}

pub struct Fmp4Muxer {
    gate: TrackGate,
    demand: bool,
    writer: Box<dyn Fmp4Writer>,
    init_segment: Arc<Mutex<Option<Bytes>>>,
    ring: Arc<Ring<Bytes>>,
    last_flush: Option<Instant>,
    pending_has_keyframe: bool,
    pending_empty: bool,
}

impl Fmp4Muxer {
    pub fn new(ring_capacity: usize, demand: bool, writer: Box<dyn Fmp4Writer>) -> Self {
        Fmp4Muxer {
            gate: TrackGate::new(),
            demand,
            writer,
            init_segment: Arc::new(Mutex::new(None)),
            ring: Arc::new(Ring::new(ring_capacity)),
            last_flush: None,
            pending_has_keyframe: false,
            pending_empty: true,
        }
    }

    pub fn ring(&self) -> Arc<Ring<Bytes>> {
        self.ring.clone()
    }

    pub fn is_enabled(&self) -> bool {
        !self.demand || self.ring.reader_count() > 0
    }

    /// Attaches a reader that is handed the cached init segment (if any)
    /// ahead of whatever the ring's own GOP-retention seed provides.
    pub fn attach(&self, on_detach: impl FnOnce() + Send + 'static) -> Fmp4Reader {
        Fmp4Reader {
            init: self.init_segment.lock().unwrap().clone(),
            inner: self.ring.attach(on_detach),
        }
    }

    fn flush_pending(&mut self) {
        if self.pending_empty {
            return;
        }
        if let Ok(segment) = self.writer.save_segment() {
            self.ring.push(FlushUnit { packets: vec![segment], is_key: self.pending_has_keyframe });
        }
        self.pending_empty = true;
        self.pending_has_keyframe = false;
        self.last_flush = Some(Instant::now());
    }
}

/// Reader for an fMP4 ring: yields the cached init segment exactly once,
/// then defers to the underlying [`Reader`].
pub struct Fmp4Reader {
    init: Option<Bytes>,
    inner: Reader<Bytes>,
}

impl Fmp4Reader {
    pub async fn next(&mut self) -> Result<Arc<FlushUnit<Bytes>>, crate::error::RingError> {
        if let Some(init) = self.init.take() {
            return Ok(Arc::new(FlushUnit { packets: vec![init], is_key: true }));
        }
        self.inner.next().await
    }
}

impl MediaSink for Fmp4Muxer {
    fn add_track(&mut self, _track: &TrackMeta) -> Result<(), Error> {
        self.gate.observe_add()
    }

    fn add_track_completed(&mut self) {
        self.gate.complete();
    }

    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if self.init_segment.lock().unwrap().is_none() {
            let init = self.writer.write_init_segment()?;
            *self.init_segment.lock().unwrap() = Some(init);
        }

        let elapsed_enough = self.last_flush.map(|t| t.elapsed() >= SEGMENT_INTERVAL).unwrap_or(false);
        let is_key = frame.codec.is_video() && frame.key_frame;
        if !self.pending_empty && (elapsed_enough || is_key) {
            self.flush_pending();
        }

        self.writer.write_sample(frame)?;
        self.pending_empty = false;
        if is_key {
            self.pending_has_keyframe = true;
        }
        if self.last_flush.is_none() {
            self.last_flush = Some(Instant::now());
        }
        Ok(())
    }

    fn reset_tracks(&mut self) {
        *self.init_segment.lock().unwrap() = None;
        self.pending_empty = true;
        self.pending_has_keyframe = false;
        self.last_flush = None;
    }
}
