//! Text frame codec
//!
//! Every message travels as one bounded UTF-8 frame of the form `KIND` or
//! `KIND_PAYLOAD`. Only the first separator splits the frame, so payloads are
//! free to contain the separator themselves.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Capacity of a single frame in bytes
pub const MAX_FRAME_BYTES: usize = 4096;

/// Separator between the kind tag and the payload
pub const SEPARATOR: char = '_';

/// Per-connection state as sent back by the server: kind to last payload,
/// `LastUpdateTime` included
pub type Snapshot = BTreeMap<MessageKind, Option<String>>;

/// Tag identifying the semantic type of a message
///
/// Kind names must never contain [`SEPARATOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Maintained by the server on every receipt, never sent by clients
    LastUpdateTime,
    Ping,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::LastUpdateTime, MessageKind::Ping];

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::LastUpdateTime => "LastUpdateTime",
            MessageKind::Ping => "Ping",
        }
    }

    /// Reserved kinds carry core metadata and are rejected from the wire
    pub fn is_reserved(&self) -> bool {
        matches!(self, MessageKind::LastUpdateTime)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| CodecError::UnknownKind(s.to_string()))
    }
}

/// One bounded unit of text exchanged in a single send/receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    /// Wraps raw text, rejecting anything above [`MAX_FRAME_BYTES`]
    pub fn new(text: String) -> Result<Self, CodecError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge {
                len: text.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(Frame(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encodes a message as `KIND` or `KIND_PAYLOAD`
///
/// Fails closed when the result would exceed the frame capacity; no partial
/// frame is ever produced.
pub fn encode(kind: MessageKind, payload: Option<&str>) -> Result<Frame, CodecError> {
    let name = kind.name();
    let len = name.len() + payload.map_or(0, |p| p.len() + SEPARATOR.len_utf8());
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut text = String::with_capacity(len);
    text.push_str(name);
    if let Some(payload) = payload {
        text.push(SEPARATOR);
        text.push_str(payload);
    }
    Ok(Frame(text))
}

/// Splits a frame on its first separator and parses the kind tag
pub fn decode(frame: &str) -> Result<(MessageKind, Option<String>), CodecError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    match frame.split_once(SEPARATOR) {
        Some((tag, payload)) => Ok((tag.parse()?, Some(payload.to_string()))),
        None => Ok((frame.parse()?, None)),
    }
}
