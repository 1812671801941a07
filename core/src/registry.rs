//! The global `MediaSource` registry.
//!
//! The registry's defining requirement — callbacks invoked from inside the
//! lock (a `register` triggered by an event handler that is itself running
//! under `for_each`) must not deadlock — is why this reaches for
//! `parking_lot::ReentrantMutex`, which `std::sync::Mutex` has no
//! equivalent for at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use tokio::sync::broadcast;

use crate::error::{Error, RegistryError};
use crate::event::MediaSourceEvent;
use crate::frame::TrackType;
use crate::speed::BytesSpeed;
use crate::url::{MediaInfo, Schema, StreamKey};

/// A registered, lookup-able handle for one logical stream under one
/// schema. Distinct from any per-protocol ring: this is what the registry
/// indexes and what `MediaSourceEvent` queries are asked about.
pub struct MediaSource {
    pub key: StreamKey,
    listener: parking_lot::Mutex<Weak<dyn MediaSourceEvent>>,
    speed: parking_lot::Mutex<[BytesSpeed; 2]>,
    create_stamp: Instant,
}

impl MediaSource {
    pub fn new(key: StreamKey) -> Arc<Self> {
        Arc::new(MediaSource {
            key,
            listener: parking_lot::Mutex::new(Weak::new()),
            speed: parking_lot::Mutex::new([BytesSpeed::new(), BytesSpeed::new()]),
            create_stamp: Instant::now(),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn MediaSourceEvent>) {
        *self.listener.lock() = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        self.listener.lock().upgrade()
    }

    pub fn add_bytes(&self, track_type: TrackType, n: u64) {
        self.speed.lock()[track_type as usize].add(n);
    }

    pub fn bytes_speed(&self, track_type: TrackType) -> f64 {
        self.speed.lock()[track_type as usize].get()
    }

    pub fn alive(&self) -> Duration {
        self.create_stamp.elapsed()
    }

    pub fn total_reader_count(&self) -> usize {
        self.listener().map(|l| l.total_reader_count()).unwrap_or(0)
    }

    pub fn close(&self, force: bool) -> bool {
        self.listener().map(|l| l.close(force)).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct MediaChanged {
    key: StreamKey,
    registered: bool,
}

type Leaf = HashMap<String, Weak<MediaSource>>;
type AppMap = HashMap<String, Leaf>;
type VhostMap = HashMap<String, AppMap>;
type SchemaVhostAppStreamMap = HashMap<Schema, VhostMap>;

/// Order `find_any` probes schemas in.
const FIND_ANY_ORDER: [Schema; 3] = [Schema::Rtmp, Schema::Rtsp, Schema::Hls];

pub type Mp4VodLoader = dyn Fn(&MediaInfo) -> Option<Arc<MediaSource>> + Send + Sync;

/// The 4-level schema/vhost/app/stream registry. One recursive mutex guards
/// the whole tree: `register`/`unregister` calls made from inside a
/// `for_each` callback (itself running with the lock already held by this
/// thread) re-enter safely instead of deadlocking.
pub struct Registry {
    tree: ReentrantMutex<RefCell<SchemaVhostAppStreamMap>>,
    changes: broadcast::Sender<MediaChanged>,
    mp4_vod_loader: Option<Box<Mp4VodLoader>>,
    session_ids: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(256);
        Registry {
            tree: ReentrantMutex::new(RefCell::new(HashMap::new())),
            changes,
            mp4_vod_loader: None,
            session_ids: AtomicU64::new(0),
        }
    }

    pub fn with_mp4_vod_loader(mut self, loader: Box<Mp4VodLoader>) -> Self {
        self.mp4_vod_loader = Some(loader);
        self
    }

    /// A fresh opaque id a caller can use to key a `find_async` wait, akin
    /// to keying a one-shot listener off a session pointer; unused once
    /// `find_async` is driven entirely by `tokio` primitives, but kept as
    /// a seam for callers that want to correlate logs across a wait.
    pub fn next_session_id(&self) -> u64 {
        self.session_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// `register(source)`. Returns
    /// [`RegistryError::AlreadyRegistered`] if a live source already
    /// occupies this key — a registration conflict is the caller's bug, not
    /// a silent replace.
    pub fn register(&self, source: Arc<MediaSource>) -> Result<(), Error> {
        let key = source.key.clone();
        {
            let guard = self.tree.lock();
            let mut tree = guard.borrow_mut();
            let leaf = tree
                .entry(key.schema)
                .or_default()
                .entry(key.vhost.clone())
                .or_default()
                .entry(key.app.clone())
                .or_default();
            if let Some(existing) = leaf.get(&key.stream_id) {
                if existing.strong_count() > 0 {
                    return Err(RegistryError::AlreadyRegistered(key).into());
                }
            }
            leaf.insert(key.stream_id.clone(), Arc::downgrade(&source));
        }
        let _ = self.changes.send(MediaChanged { key: key.clone(), registered: true });
        if let Some(listener) = source.listener() {
            listener.on_regist(true);
        }
        Ok(())
    }

    /// `unregister(source)`. No-op (not an error) if the stored weak no
    /// longer points at `source` — someone else already replaced or
    /// cleaned up this key.
    pub fn unregister(&self, source: &Arc<MediaSource>) {
        let key = source.key.clone();
        let removed = {
            let guard = self.tree.lock();
            let mut tree = guard.borrow_mut();
            let mut removed = false;
            if let Some(vhosts) = tree.get_mut(&key.schema) {
                if let Some(apps) = vhosts.get_mut(&key.vhost) {
                    if let Some(leaf) = apps.get_mut(&key.app) {
                        if let Some(existing) = leaf.get(&key.stream_id) {
                            if existing.upgrade().map(|e| Arc::ptr_eq(&e, source)).unwrap_or(true) {
                                leaf.remove(&key.stream_id);
                                removed = true;
                            }
                        }
                        if leaf.is_empty() {
                            apps.remove(&key.app);
                        }
                    }
                    if apps.is_empty() {
                        vhosts.remove(&key.vhost);
                    }
                }
                if vhosts.is_empty() {
                    tree.remove(&key.schema);
                }
            }
            removed
        };
        if removed {
            let _ = self.changes.send(MediaChanged { key, registered: false });
            if let Some(listener) = source.listener() {
                listener.on_regist(false);
            }
        }
    }

    /// `find(schema, key) -> source | ∅`. Purges the entry if its weak
    /// reference has expired.
    pub fn find(&self, schema: Schema, vhost: &str, app: &str, stream_id: &str) -> Option<Arc<MediaSource>> {
        let guard = self.tree.lock();
        let mut tree = guard.borrow_mut();
        let leaf = tree.get_mut(&schema)?.get_mut(vhost)?.get_mut(app)?;
        match leaf.get(stream_id) {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => {
                    leaf.remove(stream_id);
                    None
                }
            },
            None => None,
        }
    }

    /// `find_any(vhost, app, stream) -> source | ∅`: rtmp, then rtsp, then
    /// hls; first hit wins.
    pub fn find_any(&self, vhost: &str, app: &str, stream_id: &str) -> Option<Arc<MediaSource>> {
        FIND_ANY_ORDER.iter().find_map(|schema| self.find(*schema, vhost, app, stream_id))
    }

    /// Snapshots every live source under the lock, then invokes `f` on each
    /// outside it — so `f` may safely call back into `register`/
    /// `unregister` without deadlocking, and a slow `f` never holds up
    /// other registry operations.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<MediaSource>)) {
        let snapshot: Vec<Arc<MediaSource>> = {
            let guard = self.tree.lock();
            let tree = guard.borrow();
            tree.values()
                .flat_map(|v| v.values())
                .flat_map(|a| a.values())
                .flat_map(|l| l.values())
                .filter_map(|w| w.upgrade())
                .collect()
        };
        for source in &snapshot {
            f(source);
        }
    }

    /// `find_async`: waits for a stream matching `info` to
    /// register, up to `max_wait`, unless it's already present. Returns
    /// `None` if the wait times out and no MP4 vod fallback is configured
    /// (or the fallback also misses).
    pub async fn find_async(&self, info: &MediaInfo, max_wait: Duration, on_not_found: impl FnOnce(&MediaInfo)) -> Option<Arc<MediaSource>> {
        let key = info.stream_key();
        if let Some(src) = self.find(key.schema, &key.vhost, &key.app, &key.stream_id) {
            return Some(src);
        }
        on_not_found(info);

        let mut rx = self.changes.subscribe();
        let sleep = tokio::time::sleep(max_wait);
        tokio::pin!(sleep);
        let found = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                ev = rx.recv() => match ev {
                    Ok(ev) if ev.registered && ev.key == key => break true,
                    Ok(_) => continue,
                    Err(_) => break false,
                },
            }
        };
        if found {
            return self.find(key.schema, &key.vhost, &key.app, &key.stream_id);
        }
        if key.schema != Schema::Hls {
            if let Some(loader) = &self.mp4_vod_loader {
                return loader(info);
            }
        }
        None
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(schema: Schema, id: &str) -> StreamKey {
        StreamKey::new(schema, "__defaultVhost__", "live", id)
    }

    #[test]
    fn register_then_find_round_trips() {
        let registry = Registry::new();
        let source = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(source.clone()).unwrap();
        let found = registry.find(Schema::Rtmp, "__defaultVhost__", "live", "cam1").unwrap();
        assert!(Arc::ptr_eq(&found, &source));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        let a = MediaSource::new(key(Schema::Rtmp, "cam1"));
        let b = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(a).unwrap();
        assert!(registry.register(b).is_err());
    }

    #[test]
    fn unregister_removes_and_cleans_empty_branches() {
        let registry = Registry::new();
        let source = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(source.clone()).unwrap();
        registry.unregister(&source);
        assert!(registry.find(Schema::Rtmp, "__defaultVhost__", "live", "cam1").is_none());
    }

    #[test]
    fn find_any_prefers_rtmp_then_rtsp_then_hls() {
        let registry = Registry::new();
        let hls = MediaSource::new(key(Schema::Hls, "cam1"));
        registry.register(hls).unwrap();
        assert_eq!(registry.find_any("__defaultVhost__", "live", "cam1").unwrap().key.schema, Schema::Hls);

        let rtsp = MediaSource::new(key(Schema::Rtsp, "cam1"));
        registry.register(rtsp).unwrap();
        assert_eq!(registry.find_any("__defaultVhost__", "live", "cam1").unwrap().key.schema, Schema::Rtsp);

        let rtmp = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(rtmp).unwrap();
        assert_eq!(registry.find_any("__defaultVhost__", "live", "cam1").unwrap().key.schema, Schema::Rtmp);
    }

    #[test]
    fn for_each_sees_registered_sources_and_can_reenter_register() {
        let registry = Registry::new();
        let a = MediaSource::new(key(Schema::Rtmp, "a"));
        registry.register(a).unwrap();

        let mut seen = 0;
        registry.for_each(|_src| {
            seen += 1;
            // Re-entrant register from inside for_each must not deadlock.
            let b = MediaSource::new(key(Schema::Rtmp, "b"));
            let _ = registry.register(b);
        });
        assert_eq!(seen, 1);
        assert!(registry.find(Schema::Rtmp, "__defaultVhost__", "live", "b").is_some());
    }

    #[tokio::test]
    async fn find_async_returns_immediately_when_already_registered() {
        let registry = Registry::new();
        let source = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(source).unwrap();
        let info = MediaInfo::parse("rtmp://example.com/live/cam1").unwrap().normalize(false);
        let found = registry.find_async(&info, Duration::from_millis(100), |_| {}).await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn find_async_times_out_when_nothing_ever_registers() {
        let registry = Registry::new();
        let info = MediaInfo::parse("rtmp://example.com/live/nope").unwrap().normalize(false);
        let mut called = false;
        let found = registry
            .find_async(&info, Duration::from_millis(20), |_| {
                called = true;
            })
            .await;
        assert!(found.is_none());
        assert!(called);
    }

    #[tokio::test]
    async fn find_async_wakes_up_when_the_stream_registers() {
        let registry = Arc::new(Registry::new());
        let info = MediaInfo::parse("rtmp://example.com/live/cam1").unwrap().normalize(false);
        let r2 = registry.clone();
        let waiter = tokio::spawn(async move { r2.find_async(&info, Duration::from_secs(5), |_| {}).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let source = MediaSource::new(key(Schema::Rtmp, "cam1"));
        registry.register(source).unwrap();
        let found = waiter.await.unwrap();
        assert!(found.is_some());
    }
}
