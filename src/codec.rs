//! Wire framing for [`Message`].
//!
//! A frame is a 4-byte big-endian length followed by a bincode envelope
//! `{ command: i32, body: bytes }`. Frames with an unknown command tag are
//! logged and dropped inside the decoder, so callers only ever see known
//! commands.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::CodecError;

/// Largest serialized envelope accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_FIELD_LEN: usize = 4;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Verify = 1,
    Connect = 2,
    Content = 3,
    Close = 4,
    ErrInvalidHash = 5,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Verify,
        Command::Connect,
        Command::Content,
        Command::Close,
        Command::ErrInvalidHash,
    ];

    pub const fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Command {
    type Error = CodecError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Command::Verify),
            2 => Ok(Command::Connect),
            3 => Ok(Command::Content),
            4 => Ok(Command::Close),
            5 => Ok(Command::ErrInvalidHash),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One protocol message.
///
/// `peer` is filled in by the transport on receipt. On send it names the
/// destination of a datagram and is ignored by stream transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    body: Vec<u8>,
    peer: Option<SocketAddr>,
}

impl Message {
    pub fn new(command: Command, body: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            body: body.into(),
            peer: None,
        }
    }

    pub fn empty(command: Command) -> Self {
        Self::new(command, Vec::new())
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Serialize the envelope, without the length prefix.
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = EnvelopeRef {
            command: self.command.tag(),
            body: &self.body,
        };
        Ok(wire_options().serialize(&envelope)?)
    }

    /// Parse an envelope produced by [`Message::to_frame`].
    pub fn from_frame(frame: &[u8]) -> Result<Self, CodecError> {
        let envelope: Envelope = wire_options().deserialize(frame)?;
        Ok(Self::new(Command::try_from(envelope.command)?, envelope.body))
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    command: i32,
    body: &'a [u8],
}

#[derive(Deserialize)]
struct Envelope {
    command: i32,
    body: Vec<u8>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

/// [`Decoder`]/[`Encoder`] pair used by both the stream and datagram transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            if src.len() < LENGTH_FIELD_LEN {
                return Ok(None);
            }

            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > MAX_FRAME_SIZE {
                src.clear();
                return Err(CodecError::FrameTooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }

            let total = LENGTH_FIELD_LEN + size;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_FIELD_LEN);
            let frame = src.split_to(size);
            match Message::from_frame(&frame) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => debug!(size, %err, "dropping undecodable frame"),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let remaining = src.len();
        src.clear();
        Err(CodecError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("connection closed with {remaining} bytes of a partial frame"),
        )))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = item.to_frame()?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(LENGTH_FIELD_LEN + frame.len());
        dst.put_u32(frame.len() as u32);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
