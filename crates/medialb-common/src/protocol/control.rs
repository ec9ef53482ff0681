//! Core control messages available to every protocol.
//!
//! The `control` fragment (OK, Error) is part of every composed protocol.
//! The `ping` fragment (Ping, Pong) is opt-in and installs its own server
//! handler, so any server speaking a protocol with it answers pings.

use serde::{Deserialize, Serialize};

use super::error::Result;
use super::fragment::Fragment;
use super::handler::Request;
use super::packet::{Code, Message};
use crate::transport::Codec;

pub const CODE_OK: Code = 0;
pub const CODE_ERROR: Code = 1;
pub const CODE_PING: Code = 2;
pub const CODE_PONG: Code = 3;

/// Codes below this value are reserved for control traffic.
pub const FIRST_FRAGMENT_CODE: Code = 16;

pub const CONTROL_FRAGMENT: &str = "control";
pub const PING_FRAGMENT: &str = "ping";

/// Payload of Ping and Pong. A valid Pong carries the Ping value plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingValue {
    pub value: u64,
}

impl PingValue {
    pub fn new(value: u64) -> Self {
        Self { value }
    }

    /// The Pong answering this Ping
    pub fn pong(&self) -> PingValue {
        PingValue {
            value: self.value.wrapping_add(1),
        }
    }

    /// Whether `self`, read as a Pong, answers `ping`
    pub fn check(&self, ping: &PingValue) -> bool {
        self.value == ping.value.wrapping_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Ok,
    Error(String),
    Ping(PingValue),
    Pong(PingValue),
}

impl Control {
    pub fn code(&self) -> Code {
        match self {
            Control::Ok => CODE_OK,
            Control::Error(_) => CODE_ERROR,
            Control::Ping(_) => CODE_PING,
            Control::Pong(_) => CODE_PONG,
        }
    }

    pub fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> {
        match self {
            Control::Ok => codec.encode_value(&()),
            Control::Error(msg) => codec.encode_value(msg),
            Control::Ping(v) | Control::Pong(v) => codec.encode_value(v),
        }
    }
}

/// The fragment every protocol implicitly includes.
pub fn control_fragment<M: Message>() -> Fragment<M> {
    Fragment::new(CONTROL_FRAGMENT)
        .with_decoder(CODE_OK, |codec, raw| {
            codec.decode_value::<()>(raw)?;
            Ok(M::from(Control::Ok))
        })
        .with_decoder(CODE_ERROR, |codec, raw| {
            Ok(M::from(Control::Error(codec.decode_value(raw)?)))
        })
}

/// Ping/Pong connectivity checks. Servers answer `Ping{v}` with `Pong{v+1}`.
pub fn ping_fragment<M: Message>() -> Fragment<M> {
    Fragment::new(PING_FRAGMENT)
        .with_decoder(CODE_PING, |codec, raw| {
            Ok(M::from(Control::Ping(codec.decode_value(raw)?)))
        })
        .with_decoder(CODE_PONG, |codec, raw| {
            Ok(M::from(Control::Pong(codec.decode_value(raw)?)))
        })
        .with_handler(CODE_PING, |request: Request<M>| async move {
            match request.packet.value.as_control() {
                Some(Control::Ping(ping)) => {
                    let pong = ping.pong();
                    request.responder.reply(M::from(Control::Pong(pong))).await
                }
                _ => request.responder.reply_error("malformed ping").await,
            }
        })
}
