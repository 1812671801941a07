//! `register`: parses a stream URL, registers it against a fresh registry,
//! and reports the lookups a real ingest/playback handshake would perform.

use failure::Error;
use log::info;
use relay_core::registry::{MediaSource, Registry};
use relay_core::url::MediaInfo;
use std::time::Duration;

#[derive(structopt::StructOpt)]
pub(crate) struct Opts {
    /// Stream URL, e.g. `rtmp://example.com/live/cam1?vhost=site-a`.
    #[structopt(long, parse(try_from_str = MediaInfo::parse))]
    url: MediaInfo,

    /// Disables vhost support, collapsing every stream onto the default
    /// vhost regardless of host/`?vhost=`.
    #[structopt(long)]
    no_vhost: bool,

    /// How long a concurrent `find_async` caller should wait for this
    /// stream to show up before giving up, in milliseconds.
    #[structopt(long, default_value = "15000")]
    max_wait_ms: u64,
}

pub(crate) async fn run(opts: Opts) -> Result<(), Error> {
    let max_wait_ms = opts.max_wait_ms;
    let no_vhost = opts.no_vhost;
    let info = opts.url.normalize(!no_vhost);
    let key = info.stream_key();
    info!("parsed stream key: {}", key);
    info!("canonical url: {}", info.compose());

    let registry = Registry::new();

    // A waiter arriving before the producer does: this resolves once
    // `register` below runs, demonstrating the same wakeup path an RTSP
    // DESCRIBE or an HLS playlist request would block on.
    let waiter = {
        let registry = &registry;
        let info = info.clone();
        async move {
            registry
                .find_async(&info, Duration::from_millis(max_wait_ms), |info| {
                    info!("no stream yet for {}, waiting up to {}ms", info.stream_key(), max_wait_ms);
                })
                .await
        }
    };

    let source = MediaSource::new(key.clone());
    let register_task = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.register(source.clone())?;
        info!("registered {}", key);
        Ok::<_, Error>(())
    };

    let (found, registered) = tokio::join!(waiter, register_task);
    registered?;

    match found {
        Some(src) => info!("find_async resolved: alive for {:?}", src.alive()),
        None => info!("find_async timed out"),
    }

    if let Some(src) = registry.find(key.schema, &key.vhost, &key.app, &key.stream_id) {
        info!("direct find confirms registration; total_reader_count={}", src.total_reader_count());
    }

    if let Some(src) = registry.find_any(&key.vhost, &key.app, &key.stream_id) {
        info!("find_any located it via schema {:?}", src.key.schema);
    }

    registry.unregister(&source);
    info!("unregistered; find now returns {:?}", registry.find(key.schema, &key.vhost, &key.app, &key.stream_id).is_some());

    Ok(())
}
