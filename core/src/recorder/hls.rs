//! HLS recorder.
//!
//! Produces an m3u8 playlist plus `.ts` segments via an external
//! collaborator ([`HlsWriter`], TS segment bytes themselves come from
//! [`crate::mux::ts::TsMuxer`]/an external demuxer). HLS is lazily
//! generated, so a reader arriving before the first segment exists must be
//! pinned rather than served a 404 — [`FileWaiter`] is a small
//! broadcast-notified waiter doing callback-on-write instead of polling
//! the filesystem.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::error::Error;

/// External playlist/segment writer. Segment numbering, playlist window
/// size, and `#EXT-X-DISCONTINUITY` handling are all external; this
/// recorder drives it with ready frames and tracks which files exist for
/// `wait_for_file`.
pub trait HlsWriter: Send {
    fn write_segment(&mut self, index: u64, data: &[u8]) -> Result<String, Error>;
    fn write_playlist(&mut self) -> Result<Bytes, Error>;
}

/// Broadcast-notified waiter for a file that may not exist yet. One instance is shared by a recorder; callers await
/// `wait_for(name, timeout)` instead of polling.
pub struct FileWaiter {
    existing: Mutex<HashMap<String, ()>>,
    notify: broadcast::Sender<String>,
}

impl FileWaiter {
    pub fn new() -> Self {
        let (notify, _rx) = broadcast::channel(64);
        FileWaiter { existing: Mutex::new(HashMap::new()), notify }
    }

    pub fn mark_written(&self, name: &str) {
        self.existing.lock().unwrap().insert(name.to_string(), ());
        let _ = self.notify.send(name.to_string());
    }

    /// Resolves immediately if `name` already exists; otherwise waits (up
    /// to `max_wait`) for it to be written, returning `false` on timeout.
    pub async fn wait_for(&self, name: &str, max_wait: Duration) -> bool {
        if self.existing.lock().unwrap().contains_key(name) {
            return true;
        }
        let mut rx = self.notify.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(written) if written == name => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        };
        timeout(max_wait, wait).await.unwrap_or(false)
    }
}

impl Default for FileWaiter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HlsRecorder {
    writer: Box<dyn HlsWriter>,
    waiter: std::sync::Arc<FileWaiter>,
    next_index: u64,
    playlist_name: String,
}

impl HlsRecorder {
    pub fn new(writer: Box<dyn HlsWriter>, playlist_name: impl Into<String>) -> Self {
        HlsRecorder {
            writer,
            waiter: std::sync::Arc::new(FileWaiter::new()),
            next_index: 0,
            playlist_name: playlist_name.into(),
        }
    }

    pub fn waiter(&self) -> std::sync::Arc<FileWaiter> {
        self.waiter.clone()
    }

    /// Publishes one TS segment's bytes (already muxed by
    /// [`crate::mux::ts::TsMuxer`]) and regenerates the playlist.
    pub fn publish_segment(&mut self, data: &[u8]) -> Result<(), Error> {
        let name = self.writer.write_segment(self.next_index, data)?;
        self.next_index += 1;
        self.waiter.mark_written(&name);
        self.writer.write_playlist()?;
        self.waiter.mark_written(&self.playlist_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeWriter;
    impl HlsWriter for FakeWriter {
        fn write_segment(&mut self, index: u64, _data: &[u8]) -> Result<String, Error> {
            Ok(format!("seg{}.ts", index))
        }
        fn write_playlist(&mut self) -> Result<Bytes, Error> {
            Ok(Bytes::from_static(b"#EXTM3U"))
        }
    }

    #[tokio::test]
    async fn wait_for_file_resolves_once_playlist_is_published() {
        let mut rec = HlsRecorder::new(Box::new(FakeWriter), "stream.m3u8");
        let waiter = rec.waiter();

        let waiting = tokio::spawn(async move { waiter.wait_for("stream.m3u8", Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        rec.publish_segment(b"tsdata").unwrap();

        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_file_times_out_when_nothing_is_ever_written() {
        let rec = HlsRecorder::new(Box::new(FakeWriter), "stream.m3u8");
        let waiter = rec.waiter();
        let found = waiter.wait_for("stream.m3u8", Duration::from_millis(20)).await;
        assert!(!found);
    }

    #[tokio::test]
    async fn already_written_file_resolves_immediately() {
        let mut rec = HlsRecorder::new(Box::new(FakeWriter), "stream.m3u8");
        rec.publish_segment(b"tsdata").unwrap();
        let waiter = rec.waiter();
        let found = waiter.wait_for("stream.m3u8", Duration::from_millis(5)).await;
        assert!(found);
    }
}
