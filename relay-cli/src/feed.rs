//! `feed`: drives a [`MultiMediaSourceMuxer`] with synthetic H.264/AAC
//! frames (a fixed SPS/PPS pair, a repeating keyframe/inter-frame GOP
//! pattern, and a fixed-size AAC access unit), reporting muxer state as it
//! goes. Useful for exercising the fan-out, stamp revision, and per-protocol
//! gating without a real ingest connection.

use bytes::Bytes;
use failure::Error;
use log::info;
use relay_core::codec::aac::{prepend_adts, AudioSpecificConfig};
use relay_core::config::Config;
use relay_core::error::Error as CoreError;
use relay_core::fanout::{MultiMediaSourceMuxer, MuxerWriters};
use relay_core::frame::{Codec, Frame, ADTS_HEADER_LEN};
use relay_core::mux::fmp4::Fmp4Writer;
use relay_core::mux::ts::TsWriter;
use relay_core::sink::TrackMeta;
use relay_core::track::{AudioInfo, VideoInfo};
use std::time::Duration;

/// AAC LC, 48kHz, stereo — matches the [`AudioInfo`] this harness declares
/// for its synthetic audio track.
fn synthetic_aac_config() -> AudioSpecificConfig {
    AudioSpecificConfig {
        object_type: 2,
        sampling_frequency_index: 3,
        channel_config: 2,
    }
}

#[derive(structopt::StructOpt)]
pub(crate) struct Opts {
    /// Number of synthetic video frames to push through the muxer.
    #[structopt(long, default_value = "150")]
    frame_count: u32,

    /// GOP length in frames: frame 0 of every GOP is a keyframe.
    #[structopt(long, default_value = "30")]
    gop_size: u32,

    /// Nominal frame duration in milliseconds (drives synthetic dts/pts).
    #[structopt(long, default_value = "33")]
    frame_duration_ms: u32,

    /// Skip the AAC audio track and feed video-only.
    #[structopt(long)]
    video_only: bool,
}

/// Stub PES/TS writer: wraps each call in a short marker so output size is
/// observable without implementing real MPEG-TS framing.
struct NullTsWriter;

impl TsWriter for NullTsWriter {
    fn write_pat_pmt(&mut self) -> Result<Bytes, CoreError> {
        Ok(Bytes::from_static(b"PAT/PMT"))
    }

    fn write_pes(&mut self, frame: &Frame) -> Result<Bytes, CoreError> {
        Ok(Bytes::copy_from_slice(&frame.data[..frame.data.len().min(4)]))
    }
}

/// Stub fMP4 writer, analogous to [`NullTsWriter`].
struct NullFmp4Writer;

impl Fmp4Writer for NullFmp4Writer {
    fn write_init_segment(&mut self) -> Result<Bytes, CoreError> {
        Ok(Bytes::from_static(b"ftyp/moov"))
    }

    fn write_sample(&mut self, _frame: &Frame) -> Result<(), CoreError> {
        Ok(())
    }

    fn save_segment(&mut self) -> Result<Bytes, CoreError> {
        Ok(Bytes::from_static(b"moof/mdat"))
    }
}

fn sps_pps() -> (Bytes, Bytes) {
    // Minimal, structurally-valid-looking NAL payloads; the muxer only
    // inspects the NAL type byte and caches the rest verbatim.
    (Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e, 0xab]), Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]))
}

pub(crate) async fn run(opts: Opts) -> Result<(), Error> {
    let config = Config::default();
    let writers = MuxerWriters {
        ts: Box::new(NullTsWriter),
        fmp4: Box::new(NullFmp4Writer),
        rtsp_h26x: None,
    };
    let rtp_factory: Box<relay_core::rtp_sender::SenderFactory> =
        Box::new(|_req| Err(failure::format_err!("no rtp transport wired up in this harness")));

    let muxer = MultiMediaSourceMuxer::new(
        "__defaultVhost__",
        "live",
        "feed-demo",
        None,
        /* want_rtsp */ false,
        /* want_rtmp */ true,
        /* want_hls */ false,
        /* want_mp4 */ false,
        &config,
        writers,
        rtp_factory,
    );

    muxer.add_track(&TrackMeta {
        codec: Codec::H264,
        video: VideoInfo { width: Some(1920), height: Some(1080), fps: Some(30.0) },
        audio: AudioInfo::default(),
    })?;
    if !opts.video_only {
        muxer.add_track(&TrackMeta {
            codec: Codec::Aac,
            video: VideoInfo::default(),
            audio: AudioInfo { sample_rate: Some(48_000), channels: Some(2), sample_bits: Some(16) },
        })?;
    }
    muxer.add_track_completed();

    let (sps, pps) = sps_pps();
    let aac_config = synthetic_aac_config();
    let mut dts: u32 = 0;
    for i in 0..opts.frame_count {
        let is_key = i % opts.gop_size == 0;
        if is_key {
            muxer.input_frame(&Frame::new(Codec::H264, dts, dts, sps.clone(), 0, false, true))?;
            muxer.input_frame(&Frame::new(Codec::H264, dts, dts, pps.clone(), 0, false, true))?;
        }
        let nal_type = if is_key { 0x65 } else { 0x41 };
        let payload = Bytes::from(vec![nal_type, 0x00, 0x00, 0x00]);
        muxer.input_frame(&Frame::new(Codec::H264, dts, dts, payload, 0, is_key, false))?;

        if !opts.video_only && i % 2 == 0 {
            let adts_frame = prepend_adts(&aac_config, &[0xAA; 64])?;
            muxer.input_frame(&Frame::new(Codec::Aac, dts, dts, adts_frame, ADTS_HEADER_LEN as u8, false, false))?;
        }

        dts += opts.frame_duration_ms;
        if i % 30 == 0 {
            info!("frame {}/{}: total_reader_count={}", i, opts.frame_count, muxer.total_reader_count());
        }
        tokio::time::sleep(Duration::from_micros(200)).await;
    }

    info!("done: fed {} video frames ({}ms nominal duration)", opts.frame_count, dts);
    Ok(())
}
