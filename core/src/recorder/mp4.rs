//! MP4 recorder: contiguous on-disk MP4
//! files segmented by wall-clock duration, rotated at keyframes when video
//! is present (or at the duration mark for audio-only streams).
//!
//! Actual box writing is an external collaborator ([`Mp4FileWriter`]); this
//! module owns file lifecycle: temp-dotfile naming, atomic rename, deleting
//! runt files, backgrounding the moov fix-up so the hot frame path never
//! blocks on disk, and the `record-mp4` broadcast once a segment lands.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use log::{error, info, warn};
use tokio::sync::broadcast;

use crate::config::RecordConfig;
use crate::error::Error;
use crate::frame::{Codec, Frame};
use crate::url::StreamKey;

/// Below this size a closed segment is considered a runt (e.g. the
/// producer stopped moments after rotation) and is deleted rather than
/// published.
const MIN_SEGMENT_BYTES: u64 = 1024;

/// External MP4 box writer. `close` performs the moov index fix-up and is
/// always run on a background blocking task.
pub trait Mp4FileWriter: Send + 'static {
    fn write_sample(&mut self, frame: &Frame, is_video: bool) -> Result<(), Error>;
    /// Finalizes the file at `path` (already fully written) and returns
    /// its final byte size.
    fn close(&mut self, path: &std::path::Path) -> Result<u64, Error>;
}

/// Concatenates H.26x frames sharing a DTS into one sample (4-byte length
/// prefixes), mirroring [`crate::mux::rtmp::RtmpMuxer`]'s NAL grouping.
#[derive(Default)]
struct SampleGroup {
    dts: u32,
    is_video: bool,
    key_frame: bool,
    nals: Vec<Bytes>,
}

fn concat_nals(nals: &[Bytes]) -> Bytes {
    let len: usize = nals.iter().map(|n| 4 + n.len()).sum();
    let mut buf = BytesMut::with_capacity(len);
    for n in nals {
        buf.put_u32(n.len() as u32);
        buf.put_slice(n);
    }
    buf.freeze()
}

#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub key: StreamKey,
    pub filename: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub start_time: std::time::SystemTime,
    pub virtual_path: String,
}

pub struct Mp4Recorder {
    key: StreamKey,
    config: RecordConfig,
    writer_factory: Box<dyn Fn() -> Box<dyn Mp4FileWriter> + Send + Sync>,
    writer: Option<Box<dyn Mp4FileWriter>>,
    has_video: bool,
    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    virtual_path: Option<String>,
    segment_started: Option<Instant>,
    segment_wall_started: Option<std::time::SystemTime>,
    group: Option<SampleGroup>,
    events: broadcast::Sender<RecordInfo>,
}

impl Mp4Recorder {
    pub fn new(key: StreamKey, config: RecordConfig, writer_factory: Box<dyn Fn() -> Box<dyn Mp4FileWriter> + Send + Sync>) -> Self {
        let (events, _rx) = broadcast::channel(32);
        Mp4Recorder {
            key,
            config,
            writer_factory,
            writer: None,
            has_video: false,
            temp_path: None,
            final_path: None,
            virtual_path: None,
            segment_started: None,
            segment_wall_started: None,
            group: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordInfo> {
        self.events.subscribe()
    }

    fn path_for_now(&self, now: std::time::SystemTime) -> (PathBuf, PathBuf, String) {
        let tm = time::at(time::Timespec::new(
            now.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0),
            0,
        ));
        let date = tm.strftime("%Y-%m-%d").map(|f| f.to_string()).unwrap_or_else(|_| "unknown-date".to_string());
        let clock = tm.strftime("%H-%M-%S").map(|f| f.to_string()).unwrap_or_else(|_| "unknown-time".to_string());
        let dir = PathBuf::from(&self.config.record_path).join(&self.key.vhost).join(&self.key.app).join(&self.key.stream_id).join(&date);
        let filename = format!("{}.mp4", clock);
        let final_path = dir.join(&filename);
        let temp_path = dir.join(format!(".{}", filename));
        let virtual_path = format!("{}/{}/{}/{}/{}", self.key.vhost, self.key.app, self.key.stream_id, date, filename);
        (temp_path, final_path, virtual_path)
    }

    fn start_segment(&mut self) {
        let now = std::time::SystemTime::now();
        let (temp, final_path, vpath) = self.path_for_now(now);
        self.writer = Some((self.writer_factory)());
        self.temp_path = Some(temp);
        self.final_path = Some(final_path);
        self.virtual_path = Some(vpath);
        self.segment_started = Some(Instant::now());
        self.segment_wall_started = Some(now);
    }

    fn should_rotate(&self, frame: &Frame) -> bool {
        let Some(started) = self.segment_started else { return false };
        let elapsed = started.elapsed() >= Duration::from_secs(self.config.file_second);
        if self.has_video {
            elapsed && frame.codec.is_video() && frame.key_frame
        } else {
            elapsed
        }
    }

    /// Flushes any buffered same-DTS group to the writer.
    fn flush_group(&mut self) -> Result<(), Error> {
        let Some(group) = self.group.take() else { return Ok(()) };
        let sample = if group.nals.len() > 1 { concat_nals(&group.nals) } else { group.nals[0].clone() };
        let frame = Frame::new(Codec::H264, group.dts, group.dts, sample, 0, group.key_frame, false);
        if let Some(w) = &mut self.writer {
            w.write_sample(&frame, group.is_video)?;
        }
        Ok(())
    }

    pub fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if frame.codec.is_video() {
            self.has_video = true;
        }
        if self.writer.is_none() {
            self.start_segment();
        } else if self.should_rotate(frame) {
            self.flush_group()?;
            self.rotate();
        }

        match &mut self.group {
            Some(g) if g.dts == frame.dts && g.is_video == frame.codec.is_video() => {
                g.nals.push(frame.payload());
                g.key_frame = g.key_frame || frame.key_frame;
            }
            _ => {
                self.flush_group()?;
                self.group = Some(SampleGroup {
                    dts: frame.dts,
                    is_video: frame.codec.is_video(),
                    key_frame: frame.key_frame,
                    nals: vec![frame.payload()],
                });
            }
        }
        Ok(())
    }

    /// Closes the current segment and starts a fresh one, finalizing the
    /// old file on a background blocking task so the hot path never waits
    /// on disk I/O.
    fn rotate(&mut self) {
        self.close_current_segment();
        self.start_segment();
    }

    fn close_current_segment(&mut self) {
        let Some(mut writer) = self.writer.take() else { return };
        let Some(temp_path) = self.temp_path.take() else { return };
        let Some(final_path) = self.final_path.take() else { return };
        let vpath = self.virtual_path.take().unwrap_or_default();
        let duration_ms = self.segment_started.take().map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
        let start_time = self.segment_wall_started.take().unwrap_or_else(std::time::SystemTime::now);
        let key = self.key.clone();
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            let size = match writer.close(&temp_path) {
                Ok(s) => s,
                Err(e) => {
                    error!("mp4 recorder: failed to finalize {:?}: {}", temp_path, e);
                    let _ = std::fs::remove_file(&temp_path);
                    return;
                }
            };
            if size < MIN_SEGMENT_BYTES {
                warn!("mp4 recorder: discarding runt segment {:?} ({} bytes)", temp_path, size);
                let _ = std::fs::remove_file(&temp_path);
                return;
            }
            if let Err(e) = std::fs::rename(&temp_path, &final_path) {
                error!("mp4 recorder: failed to rename {:?} -> {:?}: {}", temp_path, final_path, e);
                return;
            }
            info!("mp4 recorder: closed {:?} ({} bytes, {} ms)", final_path, size, duration_ms);
            let _ = events.send(RecordInfo {
                key,
                filename: final_path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
                size_bytes: size,
                duration_ms,
                start_time,
                virtual_path: vpath,
            });
        });
    }

    /// Stops recording: finalizes whatever segment is open. Matches
    /// `setup_record(Mp4, false, ..)` on the fan-out.
    pub fn stop(&mut self) {
        let _ = self.flush_group();
        self.close_current_segment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Schema;
    use bytes::Bytes as B;
    use std::sync::{Arc, Mutex};

    struct FakeWriter {
        samples: Arc<Mutex<Vec<Bytes>>>,
    }
    impl Mp4FileWriter for FakeWriter {
        fn write_sample(&mut self, frame: &Frame, _is_video: bool) -> Result<(), Error> {
            self.samples.lock().unwrap().push(frame.data.clone());
            Ok(())
        }
        fn close(&mut self, _path: &std::path::Path) -> Result<u64, Error> {
            Ok(2048)
        }
    }

    fn recorder(dir: &std::path::Path) -> Mp4Recorder {
        let config = RecordConfig { record_path: dir.to_string_lossy().into_owned(), file_second: 3600, ..RecordConfig::default() };
        let key = StreamKey::new(Schema::Rtmp, "__defaultVhost__", "record", "cam1");
        Mp4Recorder::new(key, config, Box::new(|| Box::new(FakeWriter { samples: Arc::new(Mutex::new(Vec::new())) })))
    }

    #[test]
    fn first_frame_opens_a_segment() {
        let dir = tempdir();
        let mut rec = recorder(&dir);
        let frame = Frame::new(Codec::H264, 0, 0, B::from_static(&[1, 2, 3]), 0, true, false);
        rec.input_frame(&frame).unwrap();
        assert!(rec.writer.is_some());
        assert!(rec.temp_path.as_ref().unwrap().file_name().unwrap().to_string_lossy().starts_with('.'));
    }

    #[test]
    fn same_dts_frames_group_into_one_sample() {
        let dir = tempdir();
        let mut rec = recorder(&dir);
        let a = Frame::new(Codec::H264, 0, 0, B::from_static(&[1]), 0, false, true);
        let b = Frame::new(Codec::H264, 0, 0, B::from_static(&[2]), 0, true, false);
        rec.input_frame(&a).unwrap();
        rec.input_frame(&b).unwrap();
        assert_eq!(rec.group.as_ref().unwrap().nals.len(), 2);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mp4rec-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }
}
