//! medialb Transport Layer
//!
//! This module provides the wire codec and the UDP helpers used to send and
//! receive encoded packets.
//!
//! # Components
//!
//! - **[`Codec`]**: frames `(code, value)` pairs, postcard by default, JSON optional
//! - **[`UdpTransport`]**: address resolution, endpoint setup, send/receive with timeout
//!
//! # Datagram Size
//!
//! Each packet travels in a single datagram, bounded by the buffer size of
//! the protocol it belongs to.

pub mod codec;
pub mod udp;

pub use codec::{Codec, JsonCodec, PostcardCodec};
pub use udp::UdpTransport;
