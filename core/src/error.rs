//! Crate-wide error handling.
//!
//! A single `failure::Error` for most fallible operations (`bail!`/
//! `format_err!`, with `.context(..)` added at call sites that know more
//! about what failed), plus a handful of typed variants via
//! [`failure_derive::Fail`] where callers need to match on the kind of
//! failure rather than just display it.

pub use failure::Error;

use failure_derive::Fail;

/// Failure reasons a caller of [`crate::registry::Registry`] may want to
/// distinguish from an opaque [`Error`].
#[derive(Debug, Fail)]
pub enum RegistryError {
    #[fail(display = "a live source is already registered at {}", _0)]
    AlreadyRegistered(crate::url::StreamKey),

    #[fail(display = "no source registered at {}", _0)]
    NotFound(crate::url::StreamKey),
}

/// Failure reasons surfaced from the ring buffer to a writer or reader.
#[derive(Debug, Fail)]
pub enum RingError {
    #[fail(display = "reader detached (backlog exceeded retention bound)")]
    ReaderDetached,

    #[fail(display = "ring has no keyframe yet; late-join seed unavailable")]
    NoKeyframeYet,
}
