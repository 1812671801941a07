//! PS/RTP sender — optional GB28181 egress.
//!
//! Wire-exact PS muxing and RTP transport are external collaborators
//! ([`PsMuxer`], [`RtpTransport`]); this module owns per-SSRC sender
//! lifecycle, NAL merging hand-off, and the rate-limited retry policy on
//! send failure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::warn;

use crate::error::Error;
use crate::event::{SendRtpCallback, SendRtpRequest};
use crate::frame::Frame;

/// How long a failed sender waits before trying again, rather than retrying
/// (and re-invoking the caller's callback) on every subsequent frame.
const RETRY_BACKOFF: Duration = Duration::from_millis(1000);

/// External PS muxer: merges same-DTS H.26x NALs with `00 00 00 01`
/// separators and packs the result to PES at the GB28181 90 kHz clock
///.
pub trait PsMuxer: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<Option<Bytes>, Error>;
}

/// External RTP encoder: fragments one PS packet across one or more RTP
/// packets sharing a common SSRC.
pub trait RtpEncoder: Send {
    fn encode(&mut self, ssrc: &str, ps_packet: &Bytes) -> Result<Vec<Bytes>, Error>;
}

/// External transport: UDP or TCP-framed per GB28181, opened by
/// `start_send_rtp`. Raw socket I/O itself is out of scope;
/// this is the seam a caller's networking layer fills in.
pub trait RtpTransport: Send {
    fn send(&mut self, packet: &Bytes) -> Result<(), Error>;
}

struct Sender {
    ssrc: String,
    ps: Box<dyn PsMuxer>,
    rtp: Box<dyn RtpEncoder>,
    transport: Box<dyn RtpTransport>,
    last_failure: Option<Instant>,
}

impl Sender {
    fn input_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if let Some(last) = self.last_failure {
            if last.elapsed() < RETRY_BACKOFF {
                return Ok(());
            }
        }
        let result = (|| -> Result<(), Error> {
            let Some(ps_packet) = self.ps.write_frame(frame)? else { return Ok(()) };
            for rtp_packet in self.rtp.encode(&self.ssrc, &ps_packet)? {
                self.transport.send(&rtp_packet)?;
            }
            Ok(())
        })();
        match &result {
            Ok(()) => {
                self.last_failure = None;
            }
            Err(e) => {
                warn!("rtp sender {}: send failed: {}", self.ssrc, e);
                self.last_failure = Some(Instant::now());
            }
        }
        result
    }
}

/// Factory for one new sender's PS muxer / RTP encoder / transport, since
/// each depends on caller-owned wire-layer state this module has no
/// visibility into.
pub type SenderFactory = dyn Fn(&SendRtpRequest) -> Result<(Box<dyn PsMuxer>, Box<dyn RtpEncoder>, Box<dyn RtpTransport>), Error> + Send + Sync;

/// Per-SSRC sender table. Guarded by its own mutex, separate from the
/// registry, to avoid cross-contention with frame dispatch.
pub struct RtpSenderTable {
    senders: Mutex<HashMap<String, Sender>>,
    factory: Box<SenderFactory>,
}

impl RtpSenderTable {
    pub fn new(factory: Box<SenderFactory>) -> Self {
        RtpSenderTable {
            senders: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// `start_send_rtp`: opens the socket, adds current
    /// tracks, and begins consuming frames from the fan-out's `input_frame`
    /// path. `cb` is invoked with the allocated local port, or the open
    /// error if socket/muxer construction failed.
    pub fn start_send_rtp(&self, req: SendRtpRequest, cb: SendRtpCallback) {
        let ssrc = req.ssrc.clone();
        let src_port = req.src_port;
        match (self.factory)(&req) {
            Ok((ps, rtp, transport)) => {
                let sender = Sender {
                    ssrc: ssrc.clone(),
                    ps,
                    rtp,
                    transport,
                    last_failure: None,
                };
                self.senders.lock().unwrap().insert(ssrc, sender);
                cb(Ok(src_port));
            }
            Err(e) => cb(Err(e)),
        }
    }

    /// `stop_send_rtp(ssrc)`: empty `ssrc` removes every sender.
    pub fn stop_send_rtp(&self, ssrc: &str) -> bool {
        let mut senders = self.senders.lock().unwrap();
        if ssrc.is_empty() {
            let had_any = !senders.is_empty();
            senders.clear();
            return had_any;
        }
        senders.remove(ssrc).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().unwrap().is_empty()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Forwards `frame` to every active sender. A send failure's first
    /// occurrence per sender is surfaced only via logging here — the
    /// triggering callback already fired at `start_send_rtp` time, and
    /// subsequent failures are rate-limited retries rather than repeat
    /// callbacks.
    pub fn input_frame(&self, frame: &Frame) {
        let mut senders = self.senders.lock().unwrap();
        for sender in senders.values_mut() {
            let _ = sender.input_frame(frame);
        }
    }
}
