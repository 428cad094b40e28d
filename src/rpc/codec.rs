//! Wire format for shard RPCs.
//!
//! Frames are length-delimited (`LengthDelimitedCodec`, 4-byte big-endian
//! length). A frame body is `[u8 flags][payload]`, where the payload is a
//! bincode-encoded `Envelope<Request>` or `Envelope<Response>`. Bit 0 of
//! `flags` marks an LZ4-compressed payload.

use crate::core::{ElementType, Error, Gradient, Parameter, ParameterWithConfig, Result};
use bytes::Bytes;
use lz4_flex::{compress_prepend_size, decompress};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Payload is LZ4-compressed.
pub const FLAG_LZ4: u8 = 0b0000_0001;

/// Largest frame, and largest decompressed payload, accepted from a peer.
pub const MAX_FRAME_LEN: usize = 256 << 20;

/// A message tagged with the id of the call it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub message: T,
}

/// A call on a parameter server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    InitParam(ParameterWithConfig),
    FinishInitParams,
    SendGrads(Vec<Gradient>),
    GetParams(Vec<String>),
    IsReady,
}

impl Request {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Request::InitParam(_) => "InitParam",
            Request::FinishInitParams => "FinishInitParams",
            Request::SendGrads(_) => "SendGrads",
            Request::GetParams(_) => "GetParams",
            Request::IsReady => "IsReady",
        }
    }
}

/// Reply to a `Request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Params(Vec<Parameter>),
    Ready(bool),
    Failed(WireError),
}

/// Server-side error as carried over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    NotReady,
    AlreadyInitialized,
    UnknownParameter(String),
    InvalidGradient(String),
    UnsupportedElementType(ElementType),
    InvalidConfig(String),
    Other(String),
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotReady => WireError::NotReady,
            Error::AlreadyInitialized => WireError::AlreadyInitialized,
            Error::UnknownParameter(name) => WireError::UnknownParameter(name.clone()),
            Error::InvalidGradient(msg) => WireError::InvalidGradient(msg.clone()),
            Error::UnsupportedElementType(t) => WireError::UnsupportedElementType(*t),
            Error::InvalidConfig(msg) => WireError::InvalidConfig(msg.clone()),
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::NotReady => Error::NotReady,
            WireError::AlreadyInitialized => Error::AlreadyInitialized,
            WireError::UnknownParameter(name) => Error::UnknownParameter(name),
            WireError::InvalidGradient(msg) => Error::InvalidGradient(msg),
            WireError::UnsupportedElementType(t) => Error::UnsupportedElementType(t),
            WireError::InvalidConfig(msg) => Error::InvalidConfig(msg),
            WireError::Other(msg) => Error::Internal(msg),
        }
    }
}

/// Wrap a byte stream in the length-delimited frame codec.
pub fn framed<S: AsyncRead + AsyncWrite>(io: S) -> Framed<S, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(io)
}

/// Encode a message into a frame body.
pub fn encode_payload<T: Serialize>(msg: &T, compression_threshold: usize) -> Result<Bytes> {
    let payload = bincode::serialize(msg)?;
    let (flags, payload) = if payload.len() > compression_threshold {
        (FLAG_LZ4, compress_prepend_size(&payload))
    } else {
        (0, payload)
    };

    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut body = Vec::with_capacity(len);
    body.push(flags);
    body.extend_from_slice(&payload);
    Ok(Bytes::from(body))
}

/// Decode a frame body (flags byte plus payload).
pub fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let (flags, payload) = body
        .split_first()
        .ok_or_else(|| Error::Serialization("empty frame".into()))?;

    if flags & FLAG_LZ4 != 0 {
        let raw = decompress_bounded(payload)?;
        Ok(bincode::deserialize(&raw)?)
    } else {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Decompress a size-prefixed LZ4 block, refusing sizes above `MAX_FRAME_LEN`.
fn decompress_bounded(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 4 {
        return Err(Error::Serialization("truncated lz4 payload".into()));
    }
    let (prefix, block) = payload.split_at(4);
    let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if size > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "decompressed size {} exceeds limit",
            size
        )));
    }
    decompress(block, size).map_err(|e| Error::Serialization(format!("lz4: {}", e)))
}
