use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::error::{MedialbError, Result};
use crate::protocol::Code;

/// Codec for encoding/decoding `(code, value)` frames.
///
/// Both formats put the code first so it can be read without knowing the
/// value's schema.
///
/// # Example
///
/// ```
/// use medialb_common::transport::Codec;
///
/// let codec = Codec::new();
/// let value = codec.encode_value(&"hello".to_string()).unwrap();
/// let frame = codec.encode_frame(17, &value).unwrap();
///
/// let (code, raw) = codec.split_frame(&frame).unwrap();
/// assert_eq!(code, 17);
/// assert_eq!(codec.decode_value::<String>(raw).unwrap(), "hello");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Compact binary encoding (the default)
    Postcard(PostcardCodec),
    /// JSON values behind a 2-byte code, handy when debugging with packet dumps
    Json(JsonCodec),
}

impl Codec {
    /// Create the default (postcard) codec
    pub fn new() -> Self {
        Codec::Postcard(PostcardCodec)
    }

    pub fn json() -> Self {
        Codec::Json(JsonCodec)
    }

    pub fn encode_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Postcard(_) => PostcardCodec::encode_value(value),
            Codec::Json(_) => JsonCodec::encode_value(value),
        }
    }

    pub fn decode_value<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<T> {
        match self {
            Codec::Postcard(_) => PostcardCodec::decode_value(raw),
            Codec::Json(_) => JsonCodec::decode_value(raw),
        }
    }

    /// Prefixes an encoded value with its code
    pub fn encode_frame(&self, code: Code, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Postcard(_) => PostcardCodec::encode_frame(code, value),
            Codec::Json(_) => Ok(JsonCodec::encode_frame(code, value)),
        }
    }

    /// Reads the code and returns it with the remaining value bytes
    pub fn split_frame<'a>(&self, data: &'a [u8]) -> Result<(Code, &'a [u8])> {
        match self {
            Codec::Postcard(_) => PostcardCodec::split_frame(data),
            Codec::Json(_) => JsonCodec::split_frame(data),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Postcard codec: varint code followed by the postcard-encoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostcardCodec;

impl PostcardCodec {
    pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(value)?)
    }

    pub fn decode_value<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
        Ok(postcard::from_bytes(raw)?)
    }

    pub fn encode_frame(code: Code, value: &[u8]) -> Result<Vec<u8>> {
        let mut frame = postcard::to_stdvec(&code)?;
        frame.extend_from_slice(value);
        Ok(frame)
    }

    pub fn split_frame(data: &[u8]) -> Result<(Code, &[u8])> {
        Ok(postcard::take_from_bytes::<Code>(data)?)
    }
}

/// JSON codec: 2-byte big-endian code followed by the JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode_value<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn encode_frame(code: Code, value: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + value.len());
        frame.extend_from_slice(&code.to_be_bytes());
        frame.extend_from_slice(value);
        frame
    }

    pub fn split_frame(data: &[u8]) -> Result<(Code, &[u8])> {
        if data.len() < 2 {
            return Err(MedialbError::Decode(format!(
                "Frame too short: {} bytes",
                data.len()
            )));
        }
        let code = Code::from_be_bytes([data[0], data[1]]);
        Ok((code, &data[2..]))
    }
}
