//! medialb Common Types and Transport
//!
//! This crate provides the protocol framework and UDP transport shared by every
//! medialb component: backends, the load balancer and their clients.
//!
//! # Overview
//!
//! Protocols are request/reply exchanges over UDP, one packet per datagram.
//! A protocol is composed from named *fragments*; each fragment contributes a
//! set of message codes and their decoders. Composition fails if two fragments
//! claim the same code, so extensions can be combined without agreeing on a
//! single flat enumeration.
//!
//! - **Protocol Layer**: codes, packets, fragments, the composed [`Protocol`]
//!   registry and the handler/responder contract used by servers
//! - **Transport Layer**: the wire [`Codec`](transport::Codec) and UDP helpers
//! - **Sync**: one-shot completion [`Signal`](sync::Signal)s
//!
//! # Wire Format
//!
//! `[code][value]` in one datagram. The code is decodable on its own, so a
//! receiver first reads the code and then hands the rest to that code's
//! decoder. Datagrams are bounded by the protocol's buffer size (512 bytes by
//! default).
//!
//! # Example
//!
//! ```
//! use medialb_common::protocol::{ping_fragment, Code, Control, Message, Protocol, Result};
//! use medialb_common::transport::Codec;
//!
//! #[derive(Debug)]
//! struct Ctl(Control);
//!
//! impl From<Control> for Ctl {
//!     fn from(c: Control) -> Self { Ctl(c) }
//! }
//!
//! impl Message for Ctl {
//!     fn code(&self) -> Code { self.0.code() }
//!     fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> { self.0.encode_value(codec) }
//!     fn as_control(&self) -> Option<&Control> { Some(&self.0) }
//! }
//!
//! let protocol = Protocol::<Ctl>::new("ctl", vec![ping_fragment()]).unwrap();
//! assert!(protocol.check_includes_fragment("ping").is_ok());
//! ```

pub mod protocol;
pub mod sync;
pub mod transport;

pub use protocol::*;
