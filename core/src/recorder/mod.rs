//! Segmented on-disk recorders.

pub mod hls;
pub mod mp4;

pub use hls::HlsRecorder;
pub use mp4::Mp4Recorder;
