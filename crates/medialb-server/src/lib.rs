//! medialb Server
//!
//! A UDP server for medialb protocols: binds a local address, decodes each
//! datagram with the protocol's registry and dispatches it by code to the
//! registered handler.

pub mod server;

pub use server::{Server, ServerBuilder, ServerConfig};
