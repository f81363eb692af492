/// Binary frame codec for the node <-> gateway transport
///
/// Frame layout:
/// - Byte 0: FIN bit (always set) + 4-bit opcode
/// - Byte 1: MASK bit + 7-bit length (126 = 16-bit extended, 127 = 64-bit extended)
/// - Extended length (0, 2 or 8 bytes, big-endian)
/// - Mask key (4 bytes, only when the MASK bit is set)
/// - Payload, XORed with `mask[i % 4]` when masked
///
/// Clients must mask every frame; the server never masks.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, TransportError};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const READ_CHUNK: usize = 4096;

/// Largest payload accepted from the wire.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x0 => Err(ProtocolError::Fragmented),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub masked: bool,
}

/// Outcome of decoding from the front of a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of buffer bytes it occupied.
    Frame(Frame, usize),
    NeedMoreData,
    ConnectionClosed,
}

/// Messages surfaced to the state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

pub fn encode_frame(opcode: Opcode, payload: &[u8], is_client: bool) -> Vec<u8> {
    let mask = if is_client {
        Some(rand::random::<[u8; 4]>())
    } else {
        None
    };
    encode_with_mask(opcode, payload, mask)
}

fn encode_with_mask(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);
    out.push(FIN_BIT | opcode as u8);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

pub fn decode_frame(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Decoded::NeedMoreData);
    }
    if buf[0] & FIN_BIT == 0 {
        return Err(ProtocolError::Fragmented);
    }
    let opcode = Opcode::from_bits(buf[0] & 0x0F)?;
    let masked = buf[1] & MASK_BIT != 0;

    let (payload_len, mut offset) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(Decoded::NeedMoreData);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Decoded::NeedMoreData);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (short as u64, 2),
    };
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge(payload_len));
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(Decoded::NeedMoreData);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + payload_len as usize;
    if buf.len() < end {
        return Ok(Decoded::NeedMoreData);
    }
    if opcode == Opcode::Close {
        return Ok(Decoded::ConnectionClosed);
    }

    let payload = match mask {
        Some(key) => buf[offset..end]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect(),
        None => buf[offset..end].to_vec(),
    };
    Ok(Decoded::Frame(
        Frame {
            opcode,
            payload,
            masked,
        },
        end,
    ))
}

/// Buffered frame reader over one half of a connection.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    require_mask: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `leftover` holds bytes read past the end of the handshake.
    /// `require_mask` is set on the server side.
    pub fn new(reader: R, leftover: Vec<u8>, require_mask: bool) -> Self {
        FrameReader {
            reader,
            buf: leftover,
            require_mask,
        }
    }

    /// Reads the next message. A close frame or a clean EOF between frames
    /// yields `TransportError::Closed`.
    pub async fn next_message(&mut self) -> Result<Message, TransportError> {
        loop {
            match decode_frame(&self.buf)? {
                Decoded::Frame(frame, consumed) => {
                    self.buf.drain(..consumed);
                    if self.require_mask && !frame.masked {
                        return Err(ProtocolError::UnmaskedClientFrame.into());
                    }
                    return into_message(frame).map_err(TransportError::from);
                }
                Decoded::ConnectionClosed => {
                    self.buf.clear();
                    return Err(TransportError::Closed);
                }
                Decoded::NeedMoreData => {}
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .reader
                .read(&mut chunk)
                .await
                .map_err(ProtocolError::from)?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Err(TransportError::Closed)
                } else {
                    Err(ProtocolError::Truncated.into())
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn into_message(frame: Frame) -> Result<Message, ProtocolError> {
    Ok(match frame.opcode {
        Opcode::Text => {
            Message::Text(String::from_utf8(frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?)
        }
        Opcode::Binary => Message::Binary(frame.payload),
        Opcode::Ping => Message::Ping(frame.payload),
        Opcode::Pong => Message::Pong(frame.payload),
        // decode_frame never yields a close frame
        Opcode::Close => return Err(ProtocolError::UnknownOpcode(Opcode::Close as u8)),
    })
}

/// Frame writer over the other half of a connection.
pub struct FrameWriter<W> {
    writer: W,
    is_client: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, is_client: bool) -> Self {
        FrameWriter { writer, is_client }
    }

    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(opcode, payload, self.is_client);
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    /// Sends a close frame and shuts the write half down.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.send(Opcode::Close, &[]).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
