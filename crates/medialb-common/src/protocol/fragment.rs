use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::Result;
use super::handler::Handler;
use super::packet::{Code, Message};
use crate::transport::Codec;

/// Decodes the raw value bytes of one code into the protocol's message type.
pub type DecodeFn<M> = fn(&Codec, &[u8]) -> Result<M>;

/// A named set of codes with their decoders, plus any server handlers the
/// fragment installs automatically.
pub struct Fragment<M> {
    name: String,
    decoders: BTreeMap<Code, DecodeFn<M>>,
    handlers: Vec<(Code, Arc<dyn Handler<M>>)>,
}

impl<M: Message> Fragment<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decoders: BTreeMap::new(),
            handlers: Vec::new(),
        }
    }

    pub fn with_decoder(mut self, code: Code, decoder: DecodeFn<M>) -> Self {
        self.decoders.insert(code, decoder);
        self
    }

    /// Registers a handler every server speaking this fragment gets by default
    pub fn with_handler(mut self, code: Code, handler: impl Handler<M>) -> Self {
        self.handlers.push((code, Arc::new(handler)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codes(&self) -> impl Iterator<Item = Code> + '_ {
        self.decoders.keys().copied()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        BTreeMap<Code, DecodeFn<M>>,
        Vec<(Code, Arc<dyn Handler<M>>)>,
    ) {
        (self.name, self.decoders, self.handlers)
    }
}
