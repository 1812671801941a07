//! Command-line harness for exercising the relay core against synthetic
//! input: no real network I/O, just enough of a driver to register
//! streams, watch the registry, and push frames through a fan-out.

mod feed;
mod register;

use failure::Error;
use log::{error, info};
use std::fmt::Write;
use std::str::FromStr;
use structopt::StructOpt;

#[derive(StructOpt)]
enum Cmd {
    Register(register::Opts),
    Feed(feed::Opts),
}

/// Returns a pretty-and-informative version of `e`.
pub fn prettify_failure(e: &failure::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    if e.backtrace().is_empty() {
        write!(&mut msg, "\n\n(set environment variable RUST_BACKTRACE=1 to see backtraces)").unwrap();
    } else {
        write!(&mut msg, "\n\nBacktrace:\n{}", e.backtrace()).unwrap();
    }
    msg
}

fn init_logging() -> mylog::Handle {
    let h = mylog::Builder::new()
        .set_format(
            std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    h.clone().install().unwrap();
    h
}

#[tokio::main]
async fn main() {
    let mut h = init_logging();
    if let Err(e) = {
        let _a = h.async_scope();
        main_inner().await
    } {
        error!("Fatal: {}", prettify_failure(&e));
        std::process::exit(1);
    }
    info!("Done");
}

async fn main_inner() -> Result<(), Error> {
    let cmd = Cmd::from_args();
    match cmd {
        Cmd::Register(opts) => register::run(opts).await,
        Cmd::Feed(opts) => feed::run(opts).await,
    }
}
