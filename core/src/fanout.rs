//! `MultiMediaSourceMuxer` — the fan-out.
//!
//! Owns one instance each of the enabled per-protocol muxers plus optional
//! HLS/MP4 recorders, and is itself a [`MediaSourceEvent`]
//! interceptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::warn;
use once_cell::sync::OnceCell;
use parking_lot::Mutex as PMutex;

use crate::config::Config;
use crate::error::Error;
use crate::event::{
    MediaOriginType, MediaSourceEvent, MediaSourceEventInterceptor, RecorderType, SendRtpCallback, SendRtpRequest, SockInfo, TrackSummary,
};
use crate::frame::{Codec, Frame, FrameSink, TrackType};
use crate::mux::fmp4::{Fmp4Muxer, Fmp4Writer};
use crate::mux::rtmp::RtmpMuxer;
use crate::mux::rtsp::{H26xPacketizer, RtspMuxer};
use crate::mux::ts::{TsMuxer, TsWriter};
use crate::recorder::hls::{HlsRecorder, HlsWriter};
use crate::recorder::mp4::{Mp4FileWriter, Mp4Recorder};
use crate::registry::MediaSource;
use crate::rtp_sender::{RtpSenderTable, SenderFactory};
use crate::sink::{MediaSink, TrackMeta};
use crate::stamp::StampReviser;
use crate::track::Track;
use crate::url::StreamKey;

/// Downstream sink threaded into each codec's [`Track`]: collects whatever
/// frames the track's config-readiness gating and AAC AU-splitting decide
/// to let through, so `input_frame` can hand them to every owned muxer once
/// the track has had its say. Shared via `Arc` rather than owned directly by
/// `Track`, since the fan-out (not the track) drains it after each call.
#[derive(Clone)]
struct FrameCollector(Arc<PMutex<Vec<Frame>>>);

impl FrameSink for FrameCollector {
    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.0.lock().push(frame.clone());
        Ok(())
    }
}

/// Per-protocol ring capacity (flush units retained for broadcast to new
/// subscribers beyond the GOP-retention floor). Large enough to absorb a
/// brief subscriber-attach race without costing meaningful memory per
/// stream.
const RING_CAPACITY: usize = 256;

/// Writers/packetizers the caller supplies for each wire-format muxer this
/// fan-out owns, since those stay external collaborators.
pub struct MuxerWriters {
    pub ts: Box<dyn TsWriter>,
    pub fmp4: Box<dyn Fmp4Writer>,
    pub rtsp_h26x: Option<Box<dyn H26xPacketizer>>,
}

pub struct MultiMediaSourceMuxer {
    vhost: String,
    app: String,
    stream_id: String,
    want_hls: bool,
    want_mp4: bool,
    stream_none_reader_delay_ms: u64,
    modify_stamp: bool,

    rtmp: Option<PMutex<RtmpMuxer>>,
    rtsp: Option<PMutex<RtspMuxer>>,
    ts: PMutex<TsMuxer>,
    fmp4: Option<PMutex<Fmp4Muxer>>,

    hls: Arc<PMutex<Option<HlsRecorder>>>,
    hls_task: PMutex<Option<tokio::task::JoinHandle<()>>>,
    hls_writer_factory: Option<Box<dyn Fn() -> Box<dyn HlsWriter> + Send + Sync>>,
    mp4: PMutex<Option<Mp4Recorder>>,
    mp4_writer_factory: Option<Arc<dyn Fn() -> Box<dyn Mp4FileWriter> + Send + Sync>>,
    record_config: crate::config::RecordConfig,

    rtp_senders: RtpSenderTable,

    video_reviser: PMutex<StampReviser>,
    audio_reviser: PMutex<StampReviser>,
    audio_synced: AtomicBool,

    tracks: PMutex<Vec<TrackMeta>>,
    completed: AtomicBool,

    /// One [`Track`] per codec seen so far, sitting upstream of every muxer:
    /// `input_frame` always passes through here first, so AAC multi-AU
    /// splitting and H264/H265/AAC config-readiness gating happen exactly
    /// once regardless of how many protocols are enabled.
    tracks_gate: PMutex<HashMap<Codec, Track<FrameCollector>>>,
    gated_frames: Arc<PMutex<Vec<Frame>>>,

    enabled_cache: PMutex<Option<(bool, Instant)>>,

    interceptor: MediaSourceEventInterceptor,
    self_listener: OnceCell<Weak<dyn MediaSourceEvent>>,
    protocol_sources: PMutex<Vec<Arc<MediaSource>>>,
}

impl MultiMediaSourceMuxer {
    /// Construction: `(StreamKey-less-schema, duration,
    /// want_rtsp, want_rtmp, want_hls, want_mp4)`. `duration` governs vod
    /// playback elsewhere and has no effect on a live fan-out's own
    /// behavior, so it isn't retained as state here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vhost: impl Into<String>,
        app: impl Into<String>,
        stream_id: impl Into<String>,
        _duration: Option<Duration>,
        want_rtsp: bool,
        want_rtmp: bool,
        want_hls: bool,
        want_mp4: bool,
        config: &Config,
        writers: MuxerWriters,
        rtp_sender_factory: Box<SenderFactory>,
    ) -> Self {
        let merge_ms = config.general.merge_write_ms;
        let rtmp = want_rtmp.then(|| PMutex::new(RtmpMuxer::new(merge_ms, RING_CAPACITY, config.general.rtmp_demand)));
        let rtsp = want_rtsp.then(|| {
            let mut m = RtspMuxer::new(merge_ms, RING_CAPACITY, config.general.rtsp_demand, config.rtp.clone());
            if let Some(p) = writers.rtsp_h26x {
                m = m.with_h26x_packetizer(p);
            }
            PMutex::new(m)
        });
        let ts = PMutex::new(TsMuxer::new(merge_ms, RING_CAPACITY, config.general.ts_demand, writers.ts));
        let fmp4 = Some(PMutex::new(Fmp4Muxer::new(RING_CAPACITY, config.general.fmp4_demand, writers.fmp4)));

        MultiMediaSourceMuxer {
            vhost: vhost.into(),
            app: app.into(),
            stream_id: stream_id.into(),
            want_hls,
            want_mp4,
            stream_none_reader_delay_ms: config.general.stream_none_reader_delay_ms,
            modify_stamp: config.general.modify_stamp,
            rtmp,
            rtsp,
            ts,
            fmp4,
            hls: Arc::new(PMutex::new(None)),
            hls_task: PMutex::new(None),
            hls_writer_factory: None,
            mp4: PMutex::new(None),
            mp4_writer_factory: None,
            record_config: config.record.clone(),
            rtp_senders: RtpSenderTable::new(rtp_sender_factory),
            video_reviser: PMutex::new(StampReviser::new()),
            audio_reviser: PMutex::new(StampReviser::new()),
            audio_synced: AtomicBool::new(false),
            tracks: PMutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            tracks_gate: PMutex::new(HashMap::new()),
            gated_frames: Arc::new(PMutex::new(Vec::new())),
            enabled_cache: PMutex::new(None),
            interceptor: MediaSourceEventInterceptor::new(),
            self_listener: OnceCell::new(),
            protocol_sources: PMutex::new(Vec::new()),
        }
    }

    pub fn with_hls_writer_factory(mut self, factory: Box<dyn Fn() -> Box<dyn HlsWriter> + Send + Sync>) -> Self {
        self.hls_writer_factory = Some(factory);
        self
    }

    pub fn with_mp4_writer_factory(mut self, factory: Box<dyn Fn() -> Box<dyn Mp4FileWriter> + Send + Sync>) -> Self {
        self.mp4_writer_factory = Some(Arc::from(factory));
        self
    }

    fn key(&self, schema: crate::url::Schema) -> StreamKey {
        StreamKey::new(schema, self.vhost.clone(), self.app.clone(), self.stream_id.clone())
    }

    /// Registers the per-protocol `MediaSource`s that back this fan-out's
    /// muxers, so `on_all_tracks_ready` (triggered by the first
    /// `add_track_completed()`) can install itself as their listener.
    pub fn set_protocol_sources(&self, sources: Vec<Arc<MediaSource>>) {
        *self.protocol_sources.lock() = sources;
    }

    /// Installs the weak self-reference `on_all_tracks_ready` delegates to.
    /// Must be called once, after this muxer is wrapped in the `Arc` it will
    /// be shared as (the usual two-phase Arc-self-reference dance, since a
    /// constructor cannot hand out a weak reference to an `Arc` that does
    /// not exist yet).
    pub fn set_self_listener(&self, weak: Weak<dyn MediaSourceEvent>) {
        let _ = self.self_listener.set(weak);
    }

    /// Also lets an interceptor-style delegate (typically the original
    /// producer) receive `close`/`get_origin_*` queries this fan-out
    /// doesn't answer itself.
    pub fn set_origin_delegate(&self, delegate: Weak<dyn MediaSourceEvent>, self_arc: &Arc<dyn MediaSourceEvent>) -> Result<(), Error> {
        self.interceptor.set_delegate(delegate, self_arc)
    }

    fn on_all_tracks_ready(&self) {
        if let Some(weak) = self.self_listener.get() {
            for source in self.protocol_sources.lock().iter() {
                source.set_listener(weak.clone());
            }
        }
    }

    /// Installs the per-codec [`Track`] gate lazily, so a late-arriving
    /// codec (or a frame that outpaces its own `add_track` call in a racy
    /// producer) still gets gated rather than bypassing `Track` entirely.
    fn track_gate_for(&self, codec: Codec) {
        self.tracks_gate
            .lock()
            .entry(codec)
            .or_insert_with(|| Track::new(codec, FrameCollector(self.gated_frames.clone())));
    }

    /// `add_track(Track)`. L16 audio is rejected for every
    /// muxer but RTSP; a warning is emitted and the codec is dropped at the
    /// `input_frame` stage for everything else (checked per-frame there,
    /// since non-RTSP muxers never observe an `add_track` call for it).
    pub fn add_track(&self, meta: &TrackMeta) -> Result<(), Error> {
        self.track_gate_for(meta.codec);
        if meta.codec == Codec::L16 {
            warn!("fanout {}/{}/{}: L16 track rejected for all muxers but RTSP", self.vhost, self.app, self.stream_id);
            if let Some(rtsp) = &self.rtsp {
                rtsp.lock().add_track(meta)?;
            }
            self.tracks.lock().push(meta.clone());
            return Ok(());
        }

        let mut first_err = None;
        if let Some(rtmp) = &self.rtmp {
            if let Err(e) = rtmp.lock().add_track(meta) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(rtsp) = &self.rtsp {
            if let Err(e) = rtsp.lock().add_track(meta) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.ts.lock().add_track(meta) {
            first_err.get_or_insert(e);
        }
        if let Some(fmp4) = &self.fmp4 {
            if let Err(e) = fmp4.lock().add_track(meta) {
                first_err.get_or_insert(e);
            }
        }
        self.tracks.lock().push(meta.clone());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `add_track_completed()`. Idempotent:
    /// `on_all_tracks_ready` fires exactly once.
    pub fn add_track_completed(&self) {
        if let Some(rtmp) = &self.rtmp {
            rtmp.lock().add_track_completed();
        }
        if let Some(rtsp) = &self.rtsp {
            rtsp.lock().add_track_completed();
        }
        self.ts.lock().add_track_completed();
        if let Some(fmp4) = &self.fmp4 {
            fmp4.lock().add_track_completed();
        }
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.on_all_tracks_ready();
        }
    }

    fn revise(&self, frame: &Frame) -> Frame {
        if !self.modify_stamp {
            return frame.clone();
        }
        let mut out = frame.clone();
        match frame.codec.track_type() {
            TrackType::Video => {
                let mut vr = self.video_reviser.lock();
                let (d, p) = vr.revise(frame.dts, frame.pts);
                out.dts = d;
                out.pts = p;
            }
            TrackType::Audio => {
                if !self.audio_synced.load(Ordering::Relaxed) {
                    let vr = self.video_reviser.lock();
                    if vr.last_output().is_some() {
                        self.audio_reviser.lock().sync_to(&vr);
                        self.audio_synced.store(true, Ordering::Relaxed);
                    }
                }
                let mut ar = self.audio_reviser.lock();
                let (d, p) = ar.revise(frame.dts, frame.pts);
                out.dts = d;
                out.pts = p;
            }
        }
        out
    }

    /// `input_frame(Frame)`: stamp revision, then the frame's [`Track`]
    /// (AAC multi-AU splitting, H264/H265/AAC config-readiness gating)
    /// before anything reaches a muxer — `Track` may forward zero, one, or
    /// several frames per call (caching pre-config media, splitting
    /// concatenated ADTS access units), each of which is then dispatched in
    /// order to every owned muxer and active RTP sender.
    pub fn input_frame(&self, frame: &Frame) -> Result<(), Error> {
        let frame = self.revise(frame);
        {
            let mut gate = self.tracks_gate.lock();
            let track = gate
                .entry(frame.codec)
                .or_insert_with(|| Track::new(frame.codec, FrameCollector(self.gated_frames.clone())));
            track.input_frame(&frame)?;
        }

        let ready = std::mem::take(&mut *self.gated_frames.lock());
        let mut first_err = None;
        for f in &ready {
            if let Err(e) = self.dispatch_ready_frame(f) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hands one already config-gated, already AU-split frame to every
    /// owned muxer and active RTP sender, in order. One muxer's failure is
    /// logged and does not block delivery to the rest.
    fn dispatch_ready_frame(&self, frame: &Frame) -> Result<(), Error> {
        let is_l16 = frame.codec == Codec::L16;
        let mut first_err = None;

        if let Some(rtsp) = &self.rtsp {
            if let Err(e) = rtsp.lock().input_frame(frame) {
                first_err.get_or_insert(e);
            }
        }
        if is_l16 {
            return match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        if let Some(rtmp) = &self.rtmp {
            if let Err(e) = rtmp.lock().input_frame(frame) {
                warn!("fanout: rtmp muxer input_frame failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.ts.lock().input_frame(frame) {
            warn!("fanout: ts muxer input_frame failed: {}", e);
            first_err.get_or_insert(e);
        }
        if let Some(fmp4) = &self.fmp4 {
            if let Err(e) = fmp4.lock().input_frame(frame) {
                warn!("fanout: fmp4 muxer input_frame failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(mut mp4) = self.mp4.try_lock() {
            if let Some(rec) = mp4.as_mut() {
                if let Err(e) = rec.input_frame(frame) {
                    warn!("fanout: mp4 recorder input_frame failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.rtp_senders.input_frame(frame);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `total_reader_count`: sum of `readerCount()` across
    /// every owned `MediaSource`. Recorder output (HLS/MP4 files served over
    /// HTTP) has no reader count here since HTTP serving is out of scope —
    /// only the live muxer rings are summed.
    pub fn total_reader_count(&self) -> usize {
        let mut n = self.ts.lock().ring().reader_count();
        if let Some(rtmp) = &self.rtmp {
            n += rtmp.lock().ring().reader_count();
        }
        if let Some(rtsp) = &self.rtsp {
            n += rtsp.lock().ring().reader_count();
        }
        if let Some(fmp4) = &self.fmp4 {
            n += fmp4.lock().ring().reader_count();
        }
        n
    }

    /// `is_enabled`: true iff any owned muxer or active RTP
    /// sender is enabled; cached for `stream_none_reader_delay_ms` while
    /// true, re-evaluated every call while false.
    pub fn is_enabled(&self) -> bool {
        let now = Instant::now();
        {
            let cache = self.enabled_cache.lock();
            if let Some((true, at)) = *cache {
                if now.duration_since(at) < Duration::from_millis(self.stream_none_reader_delay_ms) {
                    return true;
                }
            }
        }
        let enabled = self.ts.lock().is_enabled()
            || self.rtmp.as_ref().map(|m| m.lock().is_enabled()).unwrap_or(false)
            || self.rtsp.as_ref().map(|m| m.lock().is_enabled()).unwrap_or(false)
            || self.fmp4.as_ref().map(|m| m.lock().is_enabled()).unwrap_or(false)
            || !self.rtp_senders.is_empty();
        *self.enabled_cache.lock() = Some((enabled, now));
        enabled
    }

    /// `reset_tracks`: propagates to every muxer. Recorders
    /// don't hold a live reference into muxer state to invalidate — they
    /// only ever see frames handed to them by `input_frame`, a value copy —
    /// so there is nothing further to reset here.
    pub fn reset_tracks(&self) {
        if let Some(rtmp) = &self.rtmp {
            rtmp.lock().reset_tracks();
        }
        if let Some(rtsp) = &self.rtsp {
            rtsp.lock().reset_tracks();
        }
        self.ts.lock().reset_tracks();
        if let Some(fmp4) = &self.fmp4 {
            fmp4.lock().reset_tracks();
        }
        self.tracks.lock().clear();
        self.tracks_gate.lock().clear();
        self.completed.store(false, Ordering::SeqCst);
        self.audio_synced.store(false, Ordering::Relaxed);
    }

    fn start_hls(&self) -> bool {
        let Some(factory) = &self.hls_writer_factory else {
            warn!("fanout: setup_record(Hls, true) with no HlsWriter factory configured");
            return false;
        };
        if self.hls.lock().is_some() {
            return true;
        }
        let writer = factory();
        let playlist_name = format!("{}.m3u8", self.stream_id);
        *self.hls.lock() = Some(HlsRecorder::new(writer, playlist_name));

        let ring = self.ts.lock().ring();
        let hls_state = self.hls.clone();
        let task = tokio::spawn(async move {
            let mut reader = ring.attach(|| {});
            loop {
                let unit = match reader.next().await {
                    Ok(u) => u,
                    Err(_) => break,
                };
                let mut guard = hls_state.lock();
                let Some(rec) = guard.as_mut() else { break };
                let mut buf = Vec::new();
                for seg in &unit.packets {
                    buf.extend_from_slice(seg);
                }
                if let Err(e) = rec.publish_segment(&buf) {
                    warn!("hls recorder: failed to publish segment: {}", e);
                }
            }
        });
        *self.hls_task.lock() = Some(task);
        true
    }

    fn stop_hls(&self) -> bool {
        let had = self.hls.lock().take().is_some();
        if let Some(task) = self.hls_task.lock().take() {
            task.abort();
        }
        had
    }

    fn start_mp4(&self, custom_path: Option<&str>) -> bool {
        let Some(factory) = &self.mp4_writer_factory else {
            warn!("fanout: setup_record(Mp4, true) with no Mp4FileWriter factory configured");
            return false;
        };
        let mut mp4 = self.mp4.lock();
        if mp4.is_some() {
            return true;
        }
        let mut record_config = self.record_config.clone();
        if let Some(path) = custom_path {
            record_config.record_path = path.to_string();
        }
        let key = self.key(crate::url::Schema::Rtmp);
        let factory = factory.clone();
        *mp4 = Some(Mp4Recorder::new(key, record_config, Box::new(move || factory())));
        true
    }

    fn stop_mp4(&self) -> bool {
        if let Some(mut rec) = self.mp4.lock().take() {
            rec.stop();
            true
        } else {
            false
        }
    }
}

impl MediaSourceEvent for MultiMediaSourceMuxer {
    fn get_origin_type(&self) -> MediaOriginType {
        self.interceptor.get_origin_type()
    }

    fn get_origin_url(&self) -> String {
        self.interceptor.get_origin_url()
    }

    fn get_origin_sock(&self) -> Option<SockInfo> {
        self.interceptor.get_origin_sock()
    }

    fn seek_to(&self, stamp_ms: u32) -> bool {
        self.interceptor.seek_to(stamp_ms)
    }

    fn close(&self, force: bool) -> bool {
        self.interceptor.close(force)
    }

    fn total_reader_count(&self) -> usize {
        MultiMediaSourceMuxer::total_reader_count(self)
    }

    /// Mirrors the original engine's `onReaderChanged`: delegates
    /// unconditionally, then, if readers just dropped to zero, waits out
    /// `stream_none_reader_delay_ms` before deciding what "nobody is
    /// watching" means for this source's origin. A VOD source has nothing
    /// left to serve and auto-closes; a live source only gets a
    /// stream-none-reader notice, leaving the decision to close to whatever
    /// is listening for it.
    fn on_reader_changed(&self, count: usize) {
        self.interceptor.on_reader_changed(count);
        if count > 0 || self.total_reader_count() > 0 {
            return;
        }
        let Some(weak) = self.self_listener.get().cloned() else { return };
        let delay = Duration::from_millis(self.stream_none_reader_delay_ms);
        let is_vod = self.get_origin_type() == MediaOriginType::Mp4Vod;
        let vhost = self.vhost.clone();
        let app = self.app.clone();
        let stream_id = self.stream_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(source) = weak.upgrade() else { return };
            if source.total_reader_count() > 0 {
                return;
            }
            if is_vod {
                warn!("{}/{}/{}: vod source has no readers, auto-closing", vhost, app, stream_id);
                source.close(false);
            } else {
                warn!("{}/{}/{}: stream-none-reader (no active readers)", vhost, app, stream_id);
            }
        });
    }

    fn on_regist(&self, registered: bool) {
        self.interceptor.on_regist(registered);
    }

    fn setup_record(&self, kind: RecorderType, start: bool, custom_path: Option<&str>) -> bool {
        match (kind, start) {
            (RecorderType::Hls, true) if self.want_hls => self.start_hls(),
            (RecorderType::Hls, true) => false,
            (RecorderType::Hls, false) => self.stop_hls(),
            (RecorderType::Mp4, true) if self.want_mp4 => self.start_mp4(custom_path),
            (RecorderType::Mp4, true) => false,
            (RecorderType::Mp4, false) => self.stop_mp4(),
        }
    }

    fn is_recording(&self, kind: RecorderType) -> bool {
        match kind {
            RecorderType::Hls => self.hls.lock().is_some(),
            RecorderType::Mp4 => self.mp4.lock().is_some(),
        }
    }

    fn get_tracks(&self, ready_only: bool) -> Vec<TrackSummary> {
        let armed = self.completed.load(Ordering::SeqCst);
        self.tracks
            .lock()
            .iter()
            .filter(|_| !ready_only || armed)
            .map(|t| TrackSummary { codec: t.codec, ready: armed })
            .collect()
    }

    fn start_send_rtp(&self, req: SendRtpRequest, cb: SendRtpCallback) {
        self.rtp_senders.start_send_rtp(req, cb)
    }

    fn stop_send_rtp(&self, ssrc: &str) -> bool {
        self.rtp_senders.stop_send_rtp(ssrc)
    }
}
