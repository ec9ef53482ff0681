//! Packets and the message contract every protocol's value type implements.

use std::fmt;
use std::net::SocketAddr;

use super::control::Control;
use super::error::Result;
use crate::transport::Codec;

/// Message code. The code is always encoded ahead of the value so a receiver
/// can pick the decoder before looking at the payload.
pub type Code = u16;

/// The closed set of messages a protocol can carry.
///
/// Each composed protocol defines one enum covering the messages of all its
/// fragments. The enum must be able to carry the core control messages, which
/// is why `From<Control>` is required.
///
/// # Example
///
/// ```
/// use medialb_common::protocol::{Code, Control, Message, Result};
/// use medialb_common::transport::Codec;
///
/// #[derive(Debug)]
/// enum EchoMessage {
///     Control(Control),
///     Echo(String),
/// }
///
/// impl From<Control> for EchoMessage {
///     fn from(c: Control) -> Self {
///         EchoMessage::Control(c)
///     }
/// }
///
/// impl Message for EchoMessage {
///     fn code(&self) -> Code {
///         match self {
///             EchoMessage::Control(c) => c.code(),
///             EchoMessage::Echo(_) => 16,
///         }
///     }
///
///     fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> {
///         match self {
///             EchoMessage::Control(c) => c.encode_value(codec),
///             EchoMessage::Echo(s) => codec.encode_value(s),
///         }
///     }
///
///     fn as_control(&self) -> Option<&Control> {
///         match self {
///             EchoMessage::Control(c) => Some(c),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait Message: From<Control> + fmt::Debug + Send + Sync + Sized + 'static {
    /// Code identifying this message on the wire
    fn code(&self) -> Code;

    /// Encodes the value part only (the code is framed separately)
    fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>>;

    /// Returns the control message if this is one of the reserved messages
    fn as_control(&self) -> Option<&Control>;
}

/// A decoded message together with the address it came from.
#[derive(Debug)]
pub struct Packet<M> {
    pub value: M,
    pub source: Option<SocketAddr>,
}

impl<M: Message> Packet<M> {
    pub fn new(value: M) -> Self {
        Self {
            value,
            source: None,
        }
    }

    pub fn from_source(value: M, source: SocketAddr) -> Self {
        Self {
            value,
            source: Some(source),
        }
    }

    pub fn code(&self) -> Code {
        self.value.code()
    }

    /// The error text if this packet is an Error reply
    pub fn error_message(&self) -> Option<&str> {
        match self.value.as_control() {
            Some(Control::Error(msg)) => Some(msg),
            _ => None,
        }
    }
}
