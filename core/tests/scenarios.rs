//! End-to-end scenarios exercising the registry and fan-out together,
//! through the public API only (no access to crate-internal items).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use relay_core::codec::aac::AudioSpecificConfig;
use relay_core::config::Config;
use relay_core::error::Error;
use relay_core::fanout::{MultiMediaSourceMuxer, MuxerWriters};
use relay_core::frame::{Codec, Frame, ADTS_HEADER_LEN};
use relay_core::mux::fmp4::Fmp4Writer;
use relay_core::mux::ts::TsWriter;
use relay_core::registry::{MediaSource, Registry};
use relay_core::sink::TrackMeta;
use relay_core::track::{AudioInfo, VideoInfo};
use relay_core::url::{MediaInfo, Schema};

struct NullTs;
impl TsWriter for NullTs {
    fn write_pat_pmt(&mut self) -> Result<Bytes, Error> {
        Ok(Bytes::from_static(b"patpmt"))
    }
    fn write_pes(&mut self, frame: &Frame) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(&frame.payload()))
    }
}

/// Counts every PES write so a test can observe, from outside the crate,
/// how many frames actually reached the wire-format writer.
struct CountingTs(Arc<AtomicUsize>);
impl TsWriter for CountingTs {
    fn write_pat_pmt(&mut self) -> Result<Bytes, Error> {
        Ok(Bytes::from_static(b"patpmt"))
    }
    fn write_pes(&mut self, frame: &Frame) -> Result<Bytes, Error> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::copy_from_slice(&frame.payload()))
    }
}

struct NullFmp4;
impl Fmp4Writer for NullFmp4 {
    fn write_init_segment(&mut self) -> Result<Bytes, Error> {
        Ok(Bytes::from_static(b"init"))
    }
    fn write_sample(&mut self, _frame: &Frame) -> Result<(), Error> {
        Ok(())
    }
    fn save_segment(&mut self) -> Result<Bytes, Error> {
        Ok(Bytes::from_static(b"seg"))
    }
}

fn h264_meta() -> TrackMeta {
    TrackMeta {
        codec: Codec::H264,
        video: VideoInfo { width: Some(1280), height: Some(720), fps: Some(30.0) },
        audio: AudioInfo::default(),
    }
}

/// Register & lookup: a source registered under one schema is findable by
/// exact schema, by `find_any` probing across schemas, and becomes
/// unreachable again once destroyed.
#[test]
fn register_and_look_up_a_stream() {
    let registry = Registry::new();
    let info = MediaInfo::parse("rtmp://example.com/live/cam").unwrap().normalize(true);
    let key = info.stream_key();
    assert_eq!(key.vhost, "example.com");

    let source = MediaSource::new(key.clone());
    registry.register(source.clone()).unwrap();

    let found = registry.find(Schema::Rtmp, &key.vhost, &key.app, &key.stream_id).unwrap();
    assert!(Arc::ptr_eq(&found, &source));
    let found_any = registry.find_any(&key.vhost, &key.app, &key.stream_id).unwrap();
    assert!(Arc::ptr_eq(&found_any, &source));

    registry.unregister(&source);
    assert!(registry.find(Schema::Rtmp, &key.vhost, &key.app, &key.stream_id).is_none());
    assert!(registry.find_any(&key.vhost, &key.app, &key.stream_id).is_none());
}

/// find_async race: a caller waiting on a stream that registers mid-wait
/// gets exactly one resolution with the source, not a timeout.
#[tokio::test]
async fn find_async_resolves_once_when_the_stream_registers_during_the_wait() {
    let registry = Arc::new(Registry::new());
    let info = MediaInfo::parse("rtmp://example.com/live/cam").unwrap().normalize(true);
    let key = info.stream_key();

    let waiter = {
        let registry = registry.clone();
        let info = info.clone();
        tokio::spawn(async move { registry.find_async(&info, Duration::from_millis(100), |_| {}).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let source = MediaSource::new(key);
    registry.register(source.clone()).unwrap();

    let resolved = waiter.await.unwrap();
    assert!(resolved.is_some());
    assert!(Arc::ptr_eq(&resolved.unwrap(), &source));
}

/// find_async timeout: with nothing ever registering, the wait resolves to
/// `None` once `max_wait` elapses, invoking the not-found callback exactly
/// once.
#[tokio::test]
async fn find_async_times_out_when_the_stream_never_registers() {
    let registry = Registry::new();
    let info = MediaInfo::parse("rtmp://example.com/live/nope").unwrap().normalize(true);

    let mut callback_count = 0;
    let start = std::time::Instant::now();
    let resolved = registry
        .find_async(&info, Duration::from_millis(100), |_| {
            callback_count += 1;
        })
        .await;
    let elapsed = start.elapsed();

    assert!(resolved.is_none());
    assert_eq!(callback_count, 1);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));
}

/// Fan-out on-demand gating: with every protocol demand-gated and zero
/// readers attached, the fan-out reports disabled and stays disabled as
/// frames are fed through it — attaching a reader is exercised against
/// the owning muxer directly in `fanout::tests::is_enabled_caches_true_result_briefly`,
/// since no protocol ring is reachable from outside the crate.
#[tokio::test]
async fn fan_out_stays_disabled_with_demand_gating_and_no_readers() {
    let mut config = Config::default();
    config.general.ts_demand = true;
    config.general.rtmp_demand = true;
    config.general.stream_none_reader_delay_ms = 0;

    let writers = MuxerWriters { ts: Box::new(NullTs), fmp4: Box::new(NullFmp4), rtsp_h26x: None };
    let muxer = MultiMediaSourceMuxer::new(
        "__defaultVhost__",
        "live",
        "cam",
        None,
        false,
        true,
        false,
        false,
        &config,
        writers,
        Box::new(|_req| Err(failure::format_err!("rtp egress not exercised by this scenario"))),
    );

    muxer.add_track(&h264_meta()).unwrap();
    muxer.add_track_completed();

    assert!(!muxer.is_enabled(), "no readers attached yet, both protocols demand-gated");
    muxer.input_frame(&Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0x65, 0, 0, 0]), 0, true, false)).unwrap();
    assert!(!muxer.is_enabled(), "feeding a frame alone must not enable the gate");
    assert_eq!(muxer.total_reader_count(), 0);
}

/// Codec-readiness gating happens once, upstream of every muxer: an H.264
/// keyframe fed before SPS/PPS is held back rather than reaching the TS
/// writer, and the same frame fed again once config has been observed goes
/// straight through.
#[tokio::test]
async fn input_frame_is_held_back_until_config_is_known() {
    let mut config = Config::default();
    config.general.ts_demand = false;

    let writes = Arc::new(AtomicUsize::new(0));
    let writers =
        MuxerWriters { ts: Box::new(CountingTs(writes.clone())), fmp4: Box::new(NullFmp4), rtsp_h26x: None };
    let muxer = MultiMediaSourceMuxer::new(
        "__defaultVhost__",
        "live",
        "gated",
        None,
        false,
        false,
        false,
        false,
        &config,
        writers,
        Box::new(|_req| Err(failure::format_err!("rtp egress not exercised by this scenario"))),
    );

    muxer.add_track(&h264_meta()).unwrap();
    muxer.add_track_completed();

    let idr = Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0x65, 1, 2, 3]), 0, true, false);
    muxer.input_frame(&idr).unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 0, "a keyframe ahead of SPS/PPS must not reach the wire");

    let sps = Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e]), 0, false, true);
    let pps = Frame::new(Codec::H264, 0, 0, Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]), 0, false, true);
    muxer.input_frame(&sps).unwrap();
    muxer.input_frame(&pps).unwrap();

    let idr2 = Frame::new(Codec::H264, 40, 40, Bytes::from_static(&[0x65, 4, 5, 6]), 0, true, false);
    muxer.input_frame(&idr2).unwrap();
    assert!(writes.load(Ordering::SeqCst) > 0, "a keyframe fed once config is known must reach the wire");
}

/// AAC frames carrying a concatenated run of ADTS access units arrive at the
/// wire as one write per access unit, not one write for the whole run:
/// splitting happens once, upstream of the muxer, regardless of how many
/// protocols are enabled.
#[tokio::test]
async fn concatenated_adts_frame_is_split_before_reaching_the_muxer() {
    let mut config = Config::default();
    config.general.ts_demand = false;

    let writes = Arc::new(AtomicUsize::new(0));
    let writers =
        MuxerWriters { ts: Box::new(CountingTs(writes.clone())), fmp4: Box::new(NullFmp4), rtsp_h26x: None };
    let muxer = MultiMediaSourceMuxer::new(
        "__defaultVhost__",
        "live",
        "split",
        None,
        false,
        false,
        false,
        false,
        &config,
        writers,
        Box::new(|_req| Err(failure::format_err!("rtp egress not exercised by this scenario"))),
    );

    muxer
        .add_track(&TrackMeta { codec: Codec::Aac, video: Default::default(), audio: AudioInfo::default() })
        .unwrap();
    muxer.add_track_completed();

    let cfg = AudioSpecificConfig { object_type: 2, sampling_frequency_index: 3, channel_config: 2 };
    let unit = relay_core::codec::aac::prepend_adts(&cfg, &[0xAA; 8]).unwrap();
    let mut concatenated = Vec::new();
    concatenated.extend_from_slice(&unit);
    concatenated.extend_from_slice(&unit);
    let frame =
        Frame::new(Codec::Aac, 0, 0, Bytes::from(concatenated), ADTS_HEADER_LEN as u8, false, false);

    muxer.input_frame(&frame).unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 2, "one concatenated frame must yield two wire writes");
}
