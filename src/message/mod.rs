//! Messages and framed encodings over journal streams.

use std::any::Any;
use std::io::{self, BufRead};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fragment::Fragment;
use crate::journal::JournalSpec;

/// A decodable message. Applications produce a zeroed instance per
/// frame via `Application::new_message` and downcast consumed envelopes
/// back to their concrete type.
pub trait Message: Send + Any {
    /// Decode the message from an unpacked frame payload.
    fn decode(&mut self, frame: &[u8]) -> Result<(), MessageDecodeError>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Error)]
#[error("decoding message: {reason}")]
pub struct MessageDecodeError {
    pub reason: String,
}

impl MessageDecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A decoded message and its position within a source journal.
pub struct Envelope {
    pub journal_spec: Arc<JournalSpec>,
    /// Fragment the message was read from, when the reader knows it.
    pub fragment: Option<Fragment>,
    /// Offset one past the message's frame.
    pub next_offset: i64,
    pub message: Box<dyn Message>,
}

/// Which framing a journal carries, selected by its spec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingKind {
    /// Length-prefixed binary frames with a checksummed header.
    #[default]
    Fixed,
    /// Newline-delimited frames.
    Json,
}

/// A framed encoding: how message payloads are delimited on the wire.
pub trait Framing: Send + Sync {
    fn kind(&self) -> FramingKind;

    /// Enclose `payload` in a frame.
    fn pack(&self, payload: &[u8]) -> Vec<u8>;

    /// Read one frame from `r`, returning its payload.
    fn unpack(&self, r: &mut dyn BufRead) -> io::Result<Vec<u8>>;

    /// Decode an unpacked payload into `message`.
    fn unmarshal(
        &self,
        payload: &[u8],
        message: &mut dyn Message,
    ) -> Result<(), MessageDecodeError>;
}

/// Select the framing named by a journal spec.
pub fn journal_framing(spec: &JournalSpec) -> &'static dyn Framing {
    match spec.framing {
        FramingKind::Fixed => &FixedFraming,
        FramingKind::Json => &JsonFraming,
    }
}

const FRAME_MAGIC: u32 = 0x3693_3366;
const FRAME_HEADER_LEN: usize = 12;

/// Binary framing: a 12-byte header of magic word, payload length, and
/// crc32c of the payload.
pub struct FixedFraming;

impl Framing for FixedFraming {
    fn kind(&self) -> FramingKind {
        FramingKind::Fixed
    }

    fn pack(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn unpack(&self, r: &mut dyn BufRead) -> io::Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        r.read_exact(&mut header)?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        if magic != FRAME_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame magic {magic:#x}"),
            ));
        }

        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload)?;

        let actual_crc = crc32c::crc32c(&payload);
        if actual_crc != expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame crc mismatch (expected {expected_crc}, got {actual_crc})"),
            ));
        }
        Ok(payload)
    }

    fn unmarshal(
        &self,
        payload: &[u8],
        message: &mut dyn Message,
    ) -> Result<(), MessageDecodeError> {
        message.decode(payload)
    }
}

/// Newline-delimited framing, conventionally carrying JSON documents.
pub struct JsonFraming;

impl Framing for JsonFraming {
    fn kind(&self) -> FramingKind {
        FramingKind::Json
    }

    fn pack(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload);
        frame.push(b'\n');
        frame
    }

    fn unpack(&self, r: &mut dyn BufRead) -> io::Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = r.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "journal stream ended mid-frame",
            ));
        }
        Ok(line)
    }

    fn unmarshal(
        &self,
        payload: &[u8],
        message: &mut dyn Message,
    ) -> Result<(), MessageDecodeError> {
        let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
        message.decode(payload)
    }
}
