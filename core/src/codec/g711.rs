//! G.711 (PCMA/PCMU): no config handshake — a track is ready as soon as the
//! codec is known, since there is one byte per sample and no side
//! information to derive (RFC 3551 §4.5.14).

/// G.711 is always ready: there is no config frame for this codec.
pub const READY_WITHOUT_CONFIG: bool = true;
