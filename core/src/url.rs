//! Stream URL parsing and the stream key it yields.
//!
//! Reuses the `url` crate for parsing, since the ingest URL shapes handled
//! here are all ordinary `scheme://host[:port]/path[?query]` URLs.

use std::fmt;

use crate::config::DEFAULT_VHOST;
use crate::error::Error;
use failure::format_err;
use url::Url;

/// Push/pull protocol a stream is addressed under. One logical stream may be
/// registered under more than one schema at once (e.g. an RTMP push fans out
/// to an `Schema::Ts` and `Schema::Fmp4` registration via the same
/// [`crate::fanout::MultiMediaSourceMuxer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Schema {
    Rtmp,
    Rtsp,
    Hls,
    Ts,
    Fmp4,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Rtmp => "rtmp",
            Schema::Rtsp => "rtsp",
            Schema::Hls => "hls",
            Schema::Ts => "ts",
            Schema::Fmp4 => "fmp4",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "rtmp" => Schema::Rtmp,
            "rtsp" => Schema::Rtsp,
            "hls" => Schema::Hls,
            "ts" => Schema::Ts,
            "fmp4" => Schema::Fmp4,
            o => return Err(format_err!("unknown schema {:?}", o)),
        })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ordered 4-tuple that uniquely identifies one logical stream per
/// schema. Lookups and registrations are exact-match on all
/// four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub schema: Schema,
    pub vhost: String,
    pub app: String,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(schema: Schema, vhost: impl Into<String>, app: impl Into<String>, stream_id: impl Into<String>) -> Self {
        StreamKey {
            schema,
            vhost: vhost.into(),
            app: app.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Returns a copy of this key under a different schema, e.g. to look up
    /// the HLS registration of an RTMP-keyed source.
    pub fn with_schema(&self, schema: Schema) -> Self {
        StreamKey {
            schema,
            vhost: self.vhost.clone(),
            app: self.app.clone(),
            stream_id: self.stream_id.clone(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}/{}", self.schema, self.vhost, self.app, self.stream_id)
    }
}

/// Parsed ingest URL, before vhost normalization is applied against engine
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub schema: Schema,
    pub host: String,
    pub port: Option<u16>,
    pub vhost: String,
    pub app: String,
    pub stream_id: String,
    pub params: Vec<(String, String)>,
}

fn is_ip_or_localhost(host: &str) -> bool {
    host == "localhost" || host.parse::<std::net::IpAddr>().is_ok()
}

impl MediaInfo {
    /// Parses `<schema>://<host>[:<port>]/<app>/<stream>[/extra][?vhost=<name>&<kv>...]`.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw).map_err(|e| format_err!("invalid stream url {:?}: {}", raw, e))?;
        let schema = Schema::parse(url.scheme())?;
        let host = url.host_str().ok_or_else(|| format_err!("stream url {:?} has no host", raw))?.to_string();
        let port = url.port();

        let mut segments = url
            .path_segments()
            .ok_or_else(|| format_err!("stream url {:?} has no path", raw))?
            .filter(|s| !s.is_empty());
        let app = segments
            .next()
            .ok_or_else(|| format_err!("stream url {:?} missing app segment", raw))?
            .to_string();
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            return Err(format_err!("stream url {:?} missing stream id segment", raw));
        }
        // "stream_id absorbs any path suffix beyond the second segment,
        // joined by /."
        let stream_id = rest.join("/");

        let mut vhost_override = None;
        let mut params = Vec::new();
        for (k, v) in url.query_pairs() {
            if k == "vhost" {
                vhost_override = Some(v.into_owned());
            } else {
                params.push((k.into_owned(), v.into_owned()));
            }
        }

        let vhost = match vhost_override {
            Some(v) => v,
            None if is_ip_or_localhost(&host) => DEFAULT_VHOST.to_string(),
            None => host.clone(),
        };

        Ok(MediaInfo {
            schema,
            host,
            port,
            vhost,
            app,
            stream_id,
            params,
        })
    }

    /// Applies system-wide vhost normalization: when vhost support is
    /// disabled, *all* streams collapse onto `__defaultVhost__`.
    pub fn normalize(mut self, vhost_enabled: bool) -> Self {
        if !vhost_enabled {
            self.vhost = DEFAULT_VHOST.to_string();
        }
        self
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.schema, self.vhost.clone(), self.app.clone(), self.stream_id.clone())
    }

    /// Re-serializes canonically. `parse(url).compose() == canonical(url)`
    /// is the round-trip property this preserves: a URL carrying an
    /// explicit `?vhost=` will compose back with that vhost baked into the
    /// host position and no leftover `vhost=` param, since vhost is
    /// already-normalized state once parsed.
    pub fn compose(&self) -> String {
        let mut s = format!("{}://{}", self.schema, self.vhost);
        if let Some(p) = self.port {
            s.push(':');
            s.push_str(&p.to_string());
        }
        s.push('/');
        s.push_str(&self.app);
        s.push('/');
        s.push_str(&self.stream_id);
        if !self.params.is_empty() {
            s.push('?');
            for (i, (k, v)) in self.params.iter().enumerate() {
                if i > 0 {
                    s.push('&');
                }
                s.push_str(k);
                s.push('=');
                s.push_str(v);
            }
        }
        s
    }
}
