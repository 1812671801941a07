//! Engine configuration.
//!
//! A streaming engine's configuration is naturally a hierarchical
//! key-value map (`general.mergeWriteMS`, `record.fileSecond`, ...).
//! Rather than carry stringly-typed lookups into Rust, this flattens the
//! keys relevant to the core into a `serde`-deserializable struct,
//! following the same `serde::Deserialize` pattern used elsewhere in this
//! workspace for JSON API types. A loader that reads `general.*`/
//! `record.*`/... from an on-disk ini/json file is outside the core's
//! scope; this struct is the seam such a loader would fill in.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// `general.enableVhost`. If false, all streams collapse onto
    /// `__defaultVhost__`.
    #[serde(rename = "enableVhost")]
    pub enable_vhost: bool,

    /// `general.mergeWriteMS`. <= 0 disables merge-write (flush per DTS
    /// change).
    #[serde(rename = "mergeWriteMS")]
    pub merge_write_ms: i64,

    /// `general.streamNoneReaderDelayMS`.
    #[serde(rename = "streamNoneReaderDelayMS")]
    pub stream_none_reader_delay_ms: u64,

    /// `general.maxStreamWaitTimeMS`.
    #[serde(rename = "maxStreamWaitTimeMS")]
    pub max_stream_wait_time_ms: u64,

    /// `general.modifyStamp`.
    #[serde(rename = "modifyStamp")]
    pub modify_stamp: bool,

    #[serde(rename = "tsDemand")]
    pub ts_demand: bool,
    #[serde(rename = "fmp4Demand")]
    pub fmp4_demand: bool,
    #[serde(rename = "hlsDemand")]
    pub hls_demand: bool,
    #[serde(rename = "rtspDemand")]
    pub rtsp_demand: bool,
    #[serde(rename = "rtmpDemand")]
    pub rtmp_demand: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            enable_vhost: true,
            merge_write_ms: 300,
            stream_none_reader_delay_ms: 20_000,
            max_stream_wait_time_ms: 15_000,
            modify_stamp: true,
            ts_demand: false,
            fmp4_demand: false,
            hls_demand: false,
            rtsp_demand: false,
            rtmp_demand: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// `record.appName`. App name reserved for vod/record sources.
    #[serde(rename = "appName")]
    pub app_name: String,

    /// `record.fileSecond`. MP4 rotation duration.
    #[serde(rename = "fileSecond")]
    pub file_second: u64,

    /// `record.fastStart`. MP4 moov-first flag.
    #[serde(rename = "fastStart")]
    pub fast_start: bool,

    /// Root directory recordings are written under, as
    /// `<record_path>/<vhost>/<app>/<stream>/<yyyy-mm-dd>/<hh-mm-ss>.mp4`.
    pub record_path: String,
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            app_name: "record".to_string(),
            file_second: 3600,
            fast_start: false,
            record_path: "./www/record".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtpConfig {
    /// `rtp.cycleMS`. RTP timestamp wrap modulus, ms.
    #[serde(rename = "cycleMS")]
    pub cycle_ms: u32,

    /// `rtp.videoMtuSize`. RTP MTU in bytes.
    #[serde(rename = "videoMtuSize")]
    pub video_mtu_size: usize,
}

impl Default for RtpConfig {
    fn default() -> Self {
        RtpConfig {
            cycle_ms: 0x7FFF_FFFF,
            video_mtu_size: 1400,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub record: RecordConfig,
    pub rtp: RtpConfig,
}

/// Default vhost name used whenever a stream key's vhost is empty,
/// unresolved, or vhost support is disabled system-wide.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Merge-write / flush bound shared by every [`crate::flush::PacketCache`]:
/// caps memory growth under timestamp anomalies and keeps a flush small
/// enough to fit a single scatter-gather write.
pub const MAX_CACHE_PACKETS: usize = 1024;

/// A stamp regression larger than this always forces a flush (seek/rebase).
pub const FLUSH_ON_REGRESSION_MS: i64 = 500;

/// Single-track streams without an explicit `add_track_completed` call start
/// after this grace period.
pub const SINGLE_TRACK_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.general.merge_write_ms, 300);
        assert_eq!(cfg.general.max_stream_wait_time_ms, 15_000);
        assert!(cfg.general.enable_vhost);
        assert!(!cfg.general.ts_demand);
    }

    #[test]
    fn deserializes_partial_json_using_camel_case_key_names() {
        let cfg: Config = serde_json::from_str(r#"{"general":{"mergeWriteMS":0}}"#).unwrap();
        assert_eq!(cfg.general.merge_write_ms, 0);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.general.max_stream_wait_time_ms, 15_000);
        assert!(cfg.general.enable_vhost);
    }
}
