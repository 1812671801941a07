//! `MediaSourceEvent` and the interceptor chain.
//!
//! A source never owns the state callers mutate: it holds a weak reference
//! to a listener answering a fixed set of queries, and an interceptor
//! implements the same trait while delegating to another listener
//! underneath — the same chain-of-responsibility shape seen in other
//! streaming-hub designs (e.g. `xiu`'s `TStreamHandler`), adapted here to
//! plain Rust trait objects rather than async channel plumbing, since the
//! hot frame path must have no suspension points.

use std::sync::{Arc, Mutex, Weak};

use crate::error::Error;
use crate::frame::Codec;

/// Kind of producer that created a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaOriginType {
    Unknown,
    RtmpPush,
    RtspPush,
    RtpPush,
    Pull,
    FfmpegPull,
    Mp4Vod,
    DeviceChn,
}

/// Minimal producer socket diagnostics.
#[derive(Debug, Clone)]
pub struct SockInfo {
    pub peer_addr: String,
    pub peer_port: u16,
    pub local_addr: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderType {
    Hls,
    Mp4,
}

/// Snapshot of one track's identity/readiness, returned by `get_tracks`.
/// [`crate::track::Track`] itself is generic over its downstream sink and
/// so isn't a trait-object-friendly return type; this is the stable summary
/// an event listener needs (e.g. to build an SDP or decide whether to start
/// recording).
#[derive(Debug, Clone)]
pub struct TrackSummary {
    pub codec: Codec,
    pub ready: bool,
}

/// Parameters for `start_send_rtp`.
#[derive(Debug, Clone)]
pub struct SendRtpRequest {
    pub dst_addr: String,
    pub dst_port: u16,
    pub ssrc: String,
    pub is_udp: bool,
    pub src_port: u16,
}

pub type SendRtpCallback = Box<dyn FnOnce(Result<u16, Error>) + Send>;

/// Answers queries a `MediaSource` cannot answer about itself: who produced
/// it, how many readers exist, whether to tear it down.
pub trait MediaSourceEvent: Send + Sync {
    fn get_origin_type(&self) -> MediaOriginType {
        MediaOriginType::Unknown
    }

    fn get_origin_url(&self) -> String {
        String::new()
    }

    fn get_origin_sock(&self) -> Option<SockInfo> {
        None
    }

    fn seek_to(&self, _stamp_ms: u32) -> bool {
        false
    }

    fn close(&self, _force: bool) -> bool {
        false
    }

    /// Readers across all schemas of this logical stream. No default: every
    /// listener must answer this (it drives `on_reader_changed` policy).
    fn total_reader_count(&self) -> usize;

    fn on_reader_changed(&self, _count: usize) {}

    fn on_regist(&self, _registered: bool) {}

    fn setup_record(&self, _kind: RecorderType, _start: bool, _custom_path: Option<&str>) -> bool {
        false
    }

    fn is_recording(&self, _kind: RecorderType) -> bool {
        false
    }

    fn get_tracks(&self, _ready_only: bool) -> Vec<TrackSummary> {
        Vec::new()
    }

    fn start_send_rtp(&self, _req: SendRtpRequest, cb: SendRtpCallback) {
        cb(Err(failure::format_err!("start_send_rtp not implemented")));
    }

    fn stop_send_rtp(&self, _ssrc: &str) -> bool {
        false
    }
}

/// Intercepts a `MediaSourceEvent`, delegating to another listener by
/// default but free to override any single method — the same role the
/// fan-out plays: it answers `total_reader_count` itself (summing
/// across protocols) while forwarding `close` down to the original
/// producer.
pub struct MediaSourceEventInterceptor {
    delegate: Mutex<Weak<dyn MediaSourceEvent>>,
}

impl MediaSourceEventInterceptor {
    pub fn new() -> Self {
        MediaSourceEventInterceptor {
            delegate: Mutex::new(Weak::new()),
        }
    }

    /// Installs `delegate` as this interceptor's listener. `self_arc` is the
    /// `Arc` this interceptor is itself wrapped in wherever it's used as a
    /// `MediaSourceEvent`; rejects the call if `delegate` would resolve back
    /// to the interceptor itself, forming a cycle.
    pub fn set_delegate(&self, delegate: Weak<dyn MediaSourceEvent>, self_arc: &Arc<dyn MediaSourceEvent>) -> Result<(), Error> {
        if let Some(strong) = delegate.upgrade() {
            if Arc::ptr_eq(&strong, self_arc) {
                return Err(failure::format_err!("interceptor cannot delegate to itself"));
            }
        }
        *self.delegate.lock().unwrap() = delegate;
        Ok(())
    }

    pub fn delegate(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        self.delegate.lock().unwrap().upgrade()
    }
}

impl Default for MediaSourceEventInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSourceEvent for MediaSourceEventInterceptor {
    fn get_origin_type(&self) -> MediaOriginType {
        self.delegate().map(|d| d.get_origin_type()).unwrap_or(MediaOriginType::Unknown)
    }

    fn get_origin_url(&self) -> String {
        self.delegate().map(|d| d.get_origin_url()).unwrap_or_default()
    }

    fn get_origin_sock(&self) -> Option<SockInfo> {
        self.delegate().and_then(|d| d.get_origin_sock())
    }

    fn seek_to(&self, stamp_ms: u32) -> bool {
        self.delegate().map(|d| d.seek_to(stamp_ms)).unwrap_or(false)
    }

    fn close(&self, force: bool) -> bool {
        self.delegate().map(|d| d.close(force)).unwrap_or(false)
    }

    fn total_reader_count(&self) -> usize {
        self.delegate().map(|d| d.total_reader_count()).unwrap_or(0)
    }

    fn on_reader_changed(&self, count: usize) {
        if let Some(d) = self.delegate() {
            d.on_reader_changed(count);
        }
    }

    fn on_regist(&self, registered: bool) {
        if let Some(d) = self.delegate() {
            d.on_regist(registered);
        }
    }

    fn setup_record(&self, kind: RecorderType, start: bool, custom_path: Option<&str>) -> bool {
        self.delegate().map(|d| d.setup_record(kind, start, custom_path)).unwrap_or(false)
    }

    fn is_recording(&self, kind: RecorderType) -> bool {
        self.delegate().map(|d| d.is_recording(kind)).unwrap_or(false)
    }

    fn get_tracks(&self, ready_only: bool) -> Vec<TrackSummary> {
        self.delegate().map(|d| d.get_tracks(ready_only)).unwrap_or_default()
    }

    fn start_send_rtp(&self, req: SendRtpRequest, cb: SendRtpCallback) {
        match self.delegate() {
            Some(d) => d.start_send_rtp(req, cb),
            None => cb(Err(failure::format_err!("no delegate installed"))),
        }
    }

    fn stop_send_rtp(&self, ssrc: &str) -> bool {
        self.delegate().map(|d| d.stop_send_rtp(ssrc)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf {
        reader_count: usize,
    }

    impl MediaSourceEvent for Leaf {
        fn total_reader_count(&self) -> usize {
            self.reader_count
        }

        fn get_origin_type(&self) -> MediaOriginType {
            MediaOriginType::RtmpPush
        }
    }

    #[test]
    fn interceptor_delegates_by_default() {
        let leaf: Arc<dyn MediaSourceEvent> = Arc::new(Leaf { reader_count: 3 });
        let interceptor = Arc::new(MediaSourceEventInterceptor::new());
        let self_dyn: Arc<dyn MediaSourceEvent> = interceptor.clone();
        interceptor.set_delegate(Arc::downgrade(&leaf), &self_dyn).unwrap();

        assert_eq!(interceptor.total_reader_count(), 3);
        assert_eq!(interceptor.get_origin_type(), MediaOriginType::RtmpPush);
    }

    #[test]
    fn interceptor_rejects_self_delegation() {
        let interceptor = Arc::new(MediaSourceEventInterceptor::new());
        let self_dyn: Arc<dyn MediaSourceEvent> = interceptor.clone();
        let self_weak = Arc::downgrade(&self_dyn);
        assert!(interceptor.set_delegate(self_weak, &self_dyn).is_err());
    }

    #[test]
    fn interceptor_with_no_delegate_returns_defaults() {
        let interceptor = MediaSourceEventInterceptor::new();
        assert_eq!(interceptor.total_reader_count(), 0);
        assert!(!interceptor.close(true));
    }
}
