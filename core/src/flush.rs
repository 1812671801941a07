//! FlushPolicy & PacketCache.
//!
//! A generic merge-write batching layer: `PacketCache<T>` holds a pending
//! `Vec<T>` and a `key_pos` latch, and calls `on_flush` via a closure
//! rather than a virtual method, since there's no need for a trait object
//! on this hot path (each per-protocol muxer owns its own concrete
//! `PacketCache`).

use crate::config::{FLUSH_ON_REGRESSION_MS, MAX_CACHE_PACKETS};

/// Merge-write decision policy.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// `general.mergeWriteMS`. `<= 0` disables merge-write.
    pub merge_ms: i64,
}

#[derive(Debug, Default)]
struct LastStamp {
    video: Option<i64>,
    audio: Option<i64>,
}

impl FlushPolicy {
    pub fn new(merge_ms: i64) -> Self {
        FlushPolicy { merge_ms }
    }

    /// `flush_able(is_video, is_key_pos, stamp, size)`: decides whether the
    /// pending batch must flush before accepting the next packet.
    fn flush_able(&self, last: &LastStamp, is_video: bool, is_key_pos: bool, new_stamp: i64, cache_size: usize) -> bool {
        if is_video && is_key_pos {
            // A video keyframe always forces a flush before it, so the new
            // GOP begins at a ring boundary.
            return true;
        }
        let last_stamp = if is_video { last.video } else { last.audio };
        if let Some(last_stamp) = last_stamp {
            if new_stamp + FLUSH_ON_REGRESSION_MS < last_stamp {
                return true;
            }
            if self.merge_ms <= 0 {
                if new_stamp != last_stamp {
                    return true;
                }
            } else if new_stamp - last_stamp > self.merge_ms {
                return true;
            }
        }
        cache_size >= MAX_CACHE_PACKETS
    }
}

/// Accumulates packets for one muxer's merge-write flush cycle, mirroring
/// `PacketCache<T>`.
pub struct PacketCache<T> {
    policy: FlushPolicy,
    pending: Vec<T>,
    key_pos: bool,
    last_stamp: LastStamp,
}

impl<T> PacketCache<T> {
    pub fn new(policy: FlushPolicy) -> Self {
        PacketCache {
            policy,
            pending: Vec::new(),
            key_pos: false,
            last_stamp: LastStamp::default(),
        }
    }

    /// `input(stamp, is_video, pkt, is_key_pos)`: may trigger `on_flush`
    /// before appending `pkt`.
    pub fn input(&mut self, stamp: i64, is_video: bool, pkt: T, is_key_pos: bool, mut on_flush: impl FnMut(Vec<T>, bool)) {
        if self.policy.flush_able(&self.last_stamp, is_video, is_key_pos, stamp, self.pending.len()) {
            self.flush_all(&mut on_flush);
        }
        self.pending.push(pkt);
        if is_key_pos {
            self.key_pos = true;
        }
        if is_video {
            self.last_stamp.video = Some(stamp);
        } else {
            self.last_stamp.audio = Some(stamp);
        }
    }

    fn flush_all(&mut self, on_flush: &mut impl FnMut(Vec<T>, bool)) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let key_pos = self.key_pos;
        self.key_pos = false;
        on_flush(pending, key_pos);
    }

    /// Forces whatever is pending out immediately (e.g. at teardown).
    pub fn flush(&mut self, mut on_flush: impl FnMut(Vec<T>, bool)) {
        self.flush_all(&mut on_flush);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.key_pos = false;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
