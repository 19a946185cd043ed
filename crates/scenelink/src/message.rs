//! Message protocol layer: framing for sync exchanges
//!
//! Four request/response variants framed as `[u32 type tag][u32 payload
//! size][payload bytes]`, payload being the variant's own wire encoding. The
//! tag space is a closed set here but trivially extensible; routing an
//! unknown tag to a handler is the external dispatcher's job, rejecting it is
//! ours. Correlation between a request and its response is also the
//! dispatcher's responsibility — this layer only carries the completion
//! signal a requester waits on.

use crate::codec::Wire;
use crate::mesh::RefineSettings;
use crate::scene::Scene;
use crate::signal::CompletionSignal;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

/// Default cap on a single message payload (256MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Message type tags. Wire values; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Get = 1,
    Set = 2,
    Delete = 3,
    Screenshot = 4,
}

impl MessageType {
    /// Convert from the wire tag.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Get),
            2 => Some(Self::Set),
            3 => Some(Self::Delete),
            4 => Some(Self::Screenshot),
            _ => None,
        }
    }
}

/// Protocol error types.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u32),

    #[error("Message too large: {size} bytes exceeds maximum {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Frame size mismatch: payload declares {declared} bytes but decoding consumed {consumed}")]
    FrameSizeMismatch { declared: usize, consumed: usize },
}

bitflags! {
    /// Which mesh buffers a Get request asks the responder to populate.
    ///
    /// Bit positions are wire format; do not reorder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetFlags: u32 {
        const GET_TRANSFORM    = 1 << 0;
        const GET_POINTS       = 1 << 1;
        const GET_NORMALS      = 1 << 2;
        const GET_TANGENTS     = 1 << 3;
        const GET_UV           = 1 << 4;
        const GET_INDICES      = 1 << 5;
        const GET_MATERIAL_IDS = 1 << 6;
        const GET_BONES        = 1 << 7;
        const APPLY_CULLING    = 1 << 8;
    }
}

/// Outbound request for scene content.
///
/// Carries the buffer selection and the refine settings the responder should
/// run before replying, keeping the heavy geometry work off the requester.
/// `wait` is shared with the fulfilling side and never serialized.
#[derive(Debug, Clone, Default)]
pub struct GetMessage {
    pub flags: GetFlags,
    pub refine_settings: RefineSettings,
    pub wait: CompletionSignal,
}

impl PartialEq for GetMessage {
    fn eq(&self, other: &Self) -> bool {
        // The completion signal is transport state, not message content.
        self.flags == other.flags && self.refine_settings == other.refine_settings
    }
}

impl Wire for GetMessage {
    fn size(&self) -> u32 {
        4 + self.refine_settings.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.flags.bits().encode(w)?;
        self.refine_settings.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            flags: GetFlags::from_bits_truncate(u32::decode(r)?),
            refine_settings: RefineSettings::decode(r)?,
            wait: CompletionSignal::new(),
        })
    }
}

/// Pushes a full scene snapshot. There are no partial updates: a delta is
/// expressed by resending the full mesh for each changed path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetMessage {
    pub scene: Scene,
}

impl Wire for SetMessage {
    fn size(&self) -> u32 {
        self.scene.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.scene.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            scene: Scene::decode(r)?,
        })
    }
}

/// A node targeted for deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifier {
    pub path: String,
    pub id: i32,
}

impl Wire for Identifier {
    fn size(&self) -> u32 {
        self.path.size() + 4
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.path.encode(w)?;
        self.id.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            path: String::decode(r)?,
            id: i32::decode(r)?,
        })
    }
}

/// Ordered deletion list. Deletion is set-semantics; the order affects only
/// deterministic logging on the receiver, not the outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteMessage {
    pub targets: Vec<Identifier>,
}

impl Wire for DeleteMessage {
    fn size(&self) -> u32 {
        self.targets.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.targets.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            targets: Vec::decode(r)?,
        })
    }
}

/// Side-effecting screenshot request. The image travels out-of-band; the
/// message itself carries no payload, only the shared completion signal.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotMessage {
    pub wait: CompletionSignal,
}

impl PartialEq for ScreenshotMessage {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Wire for ScreenshotMessage {
    fn size(&self) -> u32 {
        0
    }

    fn encode<W: Write>(&self, _w: &mut W) -> io::Result<()> {
        Ok(())
    }

    fn decode<R: Read>(_r: &mut R) -> io::Result<Self> {
        Ok(Self {
            wait: CompletionSignal::new(),
        })
    }
}

/// The closed set of protocol messages. Dispatch is a pattern match on the
/// variant rather than a virtual call on some shared base contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Get(GetMessage),
    Set(SetMessage),
    Delete(DeleteMessage),
    Screenshot(ScreenshotMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Get(_) => MessageType::Get,
            Message::Set(_) => MessageType::Set,
            Message::Delete(_) => MessageType::Delete,
            Message::Screenshot(_) => MessageType::Screenshot,
        }
    }

    /// Exact payload byte count, excluding the 8-byte frame header.
    pub fn payload_size(&self) -> u32 {
        match self {
            Message::Get(m) => m.size(),
            Message::Set(m) => m.size(),
            Message::Delete(m) => m.size(),
            Message::Screenshot(m) => m.size(),
        }
    }

    fn encode_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Message::Get(m) => m.encode(w),
            Message::Set(m) => m.encode(w),
            Message::Delete(m) => m.encode(w),
            Message::Screenshot(m) => m.encode(w),
        }
    }

    fn decode_payload<R: Read>(msg_type: MessageType, r: &mut R) -> io::Result<Self> {
        Ok(match msg_type {
            MessageType::Get => Message::Get(GetMessage::decode(r)?),
            MessageType::Set => Message::Set(SetMessage::decode(r)?),
            MessageType::Delete => Message::Delete(DeleteMessage::decode(r)?),
            MessageType::Screenshot => Message::Screenshot(ScreenshotMessage::decode(r)?),
        })
    }
}

/// Protocol handler for reading and writing framed messages.
pub struct Protocol {
    max_message_size: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum accepted payload size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Write one framed message to a stream.
    pub fn write_message<W: Write>(
        &self,
        writer: &mut W,
        message: &Message,
    ) -> Result<(), ProtocolError> {
        let payload_size = message.payload_size();
        tracing::debug!(
            msg_type = ?message.message_type(),
            payload_size,
            "writing message"
        );
        if payload_size as usize > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload_size as usize,
                max_size: self.max_message_size,
            });
        }

        writer.write_u32::<LittleEndian>(message.message_type() as u32)?;
        writer.write_u32::<LittleEndian>(payload_size)?;
        message.encode_payload(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one framed message from a stream.
    pub fn read_message<R: Read>(&self, reader: &mut R) -> Result<Message, ProtocolError> {
        let tag = reader.read_u32::<LittleEndian>()?;
        let msg_type =
            MessageType::from_u32(tag).ok_or(ProtocolError::InvalidMessageType(tag))?;

        let payload_size = reader.read_u32::<LittleEndian>()? as usize;
        tracing::debug!(?msg_type, payload_size, "reading message");
        if payload_size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload_size,
                max_size: self.max_message_size,
            });
        }

        let mut payload = vec![0u8; payload_size];
        reader.read_exact(&mut payload)?;
        let mut cursor = Cursor::new(payload);
        let message = Message::decode_payload(msg_type, &mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != payload_size {
            return Err(ProtocolError::FrameSizeMismatch {
                declared: payload_size,
                consumed,
            });
        }
        Ok(message)
    }
}
