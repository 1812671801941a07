//! GOP-aware, single-writer multi-reader ring buffer.
//!
//! Built on `tokio::sync::broadcast`, which gives a "fan out, let slow
//! subscribers fall behind and notice via an error" primitive for free. A
//! `broadcast::Receiver` that misses too many sends returns `Lagged`; this
//! crate treats that exactly like a slow-reader detach rather than trying
//! to catch it up, since a security-camera relay has no use for stale
//! video.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;

use crate::error::RingError;

/// A list of frames sharing one DTS, delimited by the keyframe flag
///. `T` is whatever packetized unit a given
/// per-protocol muxer rings (an FLV tag, an RTP packet, an MP4 sample...).
#[derive(Debug, Clone)]
pub struct FlushUnit<T> {
    pub packets: Vec<T>,
    pub is_key: bool,
}

struct DetachSlot {
    cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DetachSlot {
    fn fire(&self) {
        if let Some(cb) = self.cb.lock().unwrap().take() {
            cb();
        }
    }
}

/// Single-writer, multi-reader ring. Writes never block: `push` only ever
/// contends a short-lived `Mutex` guarding the GOP retention buffer, and the
/// broadcast send itself is non-blocking by construction.
pub struct Ring<T> {
    tx: broadcast::Sender<Arc<FlushUnit<T>>>,
    /// Retained flush units: the current open GOP if one exists (since the
    /// most recent keyframe), or — absent any keyframe yet, e.g. an
    /// audio-only track — the retention floor of "current plus one"
    ///.
    retained: Mutex<VecDeque<Arc<FlushUnit<T>>>>,
    readers: Mutex<Vec<Weak<DetachSlot>>>,
}

impl<T: Send + Sync + 'static> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Ring {
            tx,
            retained: Mutex::new(VecDeque::new()),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Publishes one flush unit, the only write path into the ring.
    pub fn push(&self, unit: FlushUnit<T>) {
        let unit = Arc::new(unit);
        {
            let mut retained = self.retained.lock().unwrap();
            if unit.is_key {
                retained.clear();
                retained.push_back(unit.clone());
            } else if retained.front().map(|u| u.is_key).unwrap_or(false) {
                // Inside an open GOP: retain everything since its keyframe.
                retained.push_back(unit.clone());
            } else {
                // No open GOP (key-less track, or first keyframe hasn't
                // arrived yet): retention floor is "current plus one".
                retained.push_back(unit.clone());
                while retained.len() > 2 {
                    retained.pop_front();
                }
            }
        }
        // No receivers is not an error here — a ring with no attached
        // reader yet is normal for on-demand muxing.
        let _ = self.tx.send(unit);
    }

    /// Attaches a new reader, seeded with the current retention window
    /// (most recent GOP, or retention floor) before it starts observing
    /// live pushes. `on_detach` fires exactly once: when the returned
    /// [`Reader`] is dropped, or when [`Ring::detach_all`] runs first.
    pub fn attach(&self, on_detach: impl FnOnce() + Send + 'static) -> Reader<T> {
        let seed: VecDeque<Arc<FlushUnit<T>>> = self.retained.lock().unwrap().clone();
        let rx = self.tx.subscribe();
        let detach = Arc::new(DetachSlot {
            cb: Mutex::new(Some(Box::new(on_detach))),
        });
        self.readers.lock().unwrap().push(Arc::downgrade(&detach));
        Reader { seed, rx, detach }
    }

    /// Forces every currently-attached reader's detach callback to fire,
    /// e.g. during source teardown.
    pub fn detach_all(&self) {
        let readers = std::mem::take(&mut *self.readers.lock().unwrap());
        for r in readers {
            if let Some(d) = r.upgrade() {
                d.fire();
            }
        }
    }

    pub fn reader_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view into a [`Ring`].
pub struct Reader<T> {
    seed: VecDeque<Arc<FlushUnit<T>>>,
    rx: broadcast::Receiver<Arc<FlushUnit<T>>>,
    detach: Arc<DetachSlot>,
}

impl<T: Clone + Send + Sync + 'static> Reader<T> {
    /// Returns the next flush unit: first draining the attach-time seed in
    /// order, then following live pushes. A lagged receiver (the writer
    /// outran this reader) surfaces as [`RingError::ReaderDetached`] — the
    /// caller's session should treat that as a detach, not retry.
    pub async fn next(&mut self) -> Result<Arc<FlushUnit<T>>, RingError> {
        if let Some(u) = self.seed.pop_front() {
            return Ok(u);
        }
        match self.rx.recv().await {
            Ok(u) => Ok(u),
            Err(broadcast::error::RecvError::Lagged(_)) => Err(RingError::ReaderDetached),
            Err(broadcast::error::RecvError::Closed) => Err(RingError::ReaderDetached),
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.detach.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn new_reader_is_seeded_with_current_gop_before_live_data() {
        let ring: Ring<u32> = Ring::new(16);
        ring.push(FlushUnit { packets: vec![1], is_key: true });
        ring.push(FlushUnit { packets: vec![2], is_key: false });

        let mut reader = ring.attach(|| {});
        let first = reader.next().await.unwrap();
        assert!(first.is_key);
        let second = reader.next().await.unwrap();
        assert_eq!(second.packets, vec![2]);

        ring.push(FlushUnit { packets: vec![3], is_key: false });
        let third = reader.next().await.unwrap();
        assert_eq!(third.packets, vec![3]);
    }

    #[tokio::test]
    async fn new_keyframe_resets_retention_to_its_own_gop() {
        let ring: Ring<u32> = Ring::new(16);
        ring.push(FlushUnit { packets: vec![1], is_key: true });
        ring.push(FlushUnit { packets: vec![2], is_key: false });
        ring.push(FlushUnit { packets: vec![3], is_key: true });

        let mut reader = ring.attach(|| {});
        let seeded = reader.next().await.unwrap();
        assert_eq!(seeded.packets, vec![3]);
        assert!(seeded.is_key);
    }

    #[tokio::test]
    async fn keyless_track_retains_only_current_plus_one() {
        let ring: Ring<u32> = Ring::new(16);
        ring.push(FlushUnit { packets: vec![1], is_key: false });
        ring.push(FlushUnit { packets: vec![2], is_key: false });
        ring.push(FlushUnit { packets: vec![3], is_key: false });

        let mut reader = ring.attach(|| {});
        let first = reader.next().await.unwrap();
        let second = reader.next().await.unwrap();
        assert_eq!(first.packets, vec![2]);
        assert_eq!(second.packets, vec![3]);
    }

    #[tokio::test]
    async fn detach_callback_fires_exactly_once_on_drop() {
        let ring: Ring<u32> = Ring::new(16);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let reader = ring.attach(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(reader);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn detach_all_fires_pending_callbacks_exactly_once() {
        let ring: Ring<u32> = Ring::new(16);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let reader = ring.attach(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        ring.detach_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(reader);
        // Dropping after detach_all must not fire a second time.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
