use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::control::{control_fragment, CONTROL_FRAGMENT, FIRST_FRAGMENT_CODE, PING_FRAGMENT};
use super::error::{MedialbError, Result};
use super::fragment::{DecodeFn, Fragment};
use super::handler::Handler;
use super::packet::{Code, Message, Packet};
use crate::transport::Codec;

/// Default datagram buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// A protocol composed from named fragments.
///
/// Composition merges every fragment's `code -> decoder` map and rejects any
/// code claimed twice. The `control` fragment (OK, Error) is always included
/// first.
///
/// Protocols are built once and shared as `Arc<Protocol<M>>` by every client
/// and server that speaks them.
pub struct Protocol<M> {
    name: String,
    fragments: Vec<String>,
    decoders: HashMap<Code, (usize, DecodeFn<M>)>,
    handlers: Vec<(Code, Arc<dyn Handler<M>>)>,
    codec: Codec,
    buffer_size: usize,
}

impl<M: Message> Protocol<M> {
    /// Composes a protocol from the given fragments.
    ///
    /// # Errors
    ///
    /// Returns `MedialbError::DuplicateCode` naming both fragments if two
    /// fragments claim the same code, and `MedialbError::ReservedCode` if a
    /// fragment other than `control` and `ping` claims a code below
    /// `FIRST_FRAGMENT_CODE`.
    pub fn new(name: impl Into<String>, fragments: Vec<Fragment<M>>) -> Result<Self> {
        let mut protocol = Self {
            name: name.into(),
            fragments: Vec::new(),
            decoders: HashMap::new(),
            handlers: Vec::new(),
            codec: Codec::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        };

        for fragment in std::iter::once(control_fragment()).chain(fragments) {
            protocol.add_fragment(fragment)?;
        }

        Ok(protocol)
    }

    fn add_fragment(&mut self, fragment: Fragment<M>) -> Result<()> {
        let (name, decoders, handlers) = fragment.into_parts();
        let index = self.fragments.len();

        for (code, decoder) in decoders {
            if let Some((owner, _)) = self.decoders.get(&code) {
                return Err(MedialbError::DuplicateCode {
                    code,
                    first: self.fragments[*owner].clone(),
                    second: name,
                });
            }
            if code < FIRST_FRAGMENT_CODE && name != CONTROL_FRAGMENT && name != PING_FRAGMENT {
                return Err(MedialbError::ReservedCode {
                    code,
                    fragment: name,
                });
            }
            self.decoders.insert(code, (index, decoder));
        }

        self.fragments.push(name);
        self.handlers.extend(handlers);
        Ok(())
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn fragment_names(&self) -> &[String] {
        &self.fragments
    }

    /// Name of the fragment that claims `code`
    pub fn owner(&self, code: Code) -> Option<&str> {
        self.decoders
            .get(&code)
            .map(|(index, _)| self.fragments[*index].as_str())
    }

    /// Handlers contributed by fragments, installed on every server
    pub fn fragment_handlers(&self) -> &[(Code, Arc<dyn Handler<M>>)] {
        &self.handlers
    }

    /// Fails unless a fragment called `fragment` is part of this protocol.
    ///
    /// Extensions call this at setup time so a missing fragment is reported
    /// immediately instead of messages being dropped at runtime.
    pub fn check_includes_fragment(&self, fragment: &str) -> Result<()> {
        if self.fragments.iter().any(|f| f == fragment) {
            Ok(())
        } else {
            Err(MedialbError::MissingFragment {
                protocol: self.name.clone(),
                fragment: fragment.to_string(),
            })
        }
    }

    pub fn decode_value(&self, code: Code, raw: &[u8]) -> Result<M> {
        let (_, decoder) = self
            .decoders
            .get(&code)
            .ok_or_else(|| MedialbError::UnregisteredCode {
                protocol: self.name.clone(),
                code,
            })?;
        decoder(&self.codec, raw)
    }

    /// Decodes one datagram: the code first, then the value for that code.
    pub fn decode_packet(&self, data: &[u8], source: Option<SocketAddr>) -> Result<Packet<M>> {
        let (code, raw) = self.codec.split_frame(data)?;
        let value = self.decode_value(code, raw)?;
        Ok(Packet { value, source })
    }

    pub fn encode_packet(&self, value: &M) -> Result<Vec<u8>> {
        let encoded = self
            .codec
            .encode_frame(value.code(), &value.encode_value(&self.codec)?)?;

        if encoded.len() > self.buffer_size {
            return Err(MedialbError::Transport(format!(
                "Packet too large: {} bytes (buffer size {} bytes)",
                encoded.len(),
                self.buffer_size
            )));
        }

        Ok(encoded)
    }
}

impl<M> std::fmt::Debug for Protocol<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("fragments", &self.fragments)
            .field("codec", &self.codec)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}
