//! Tunnel wire framing.
//!
//! Every frame is `[command: u8][length: u32 BE][payload]`. Client-scoped
//! commands start their payload with the 8-byte virtual-client id.
//!
//! Command `2` means RegisterRoute when sent by a satellite and
//! ConnectVirtualClient when sent by the primary, so the codec is built for
//! one side of the link.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 5;
const CLIENT_ID_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown tunnel command {0}")]
    UnknownCommand(u8),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame payload too short for a client id")]
    MissingClientId,

    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("tunnel io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Authenticate = 1,
    /// RegisterRoute (satellite → primary) or ConnectVirtualClient (primary → satellite).
    Route = 2,
    Data = 3,
    Disconnect = 4,
    Error = 255,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Command::Authenticate),
            2 => Ok(Command::Route),
            3 => Ok(Command::Data),
            4 => Ok(Command::Disconnect),
            255 => Ok(Command::Error),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Scheme the downstream client used to reach the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Http = 1,
    Https = 2,
}

impl HandlerKind {
    fn from_byte(b: u8) -> Self {
        if b == 2 {
            HandlerKind::Https
        } else {
            HandlerKind::Http
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Authenticate { secret: String },
    RegisterRoute { domain: String, path: String },
    Connect { client_id: u64, kind: HandlerKind, peer: String },
    /// An empty payload ends this direction of the client's stream.
    Data { client_id: u64, payload: Bytes },
    Disconnect { client_id: u64 },
    Error { message: String },
}

impl Frame {
    pub fn end_of_stream(client_id: u64) -> Self {
        Frame::Data {
            client_id,
            payload: Bytes::new(),
        }
    }

    fn command(&self) -> Command {
        match self {
            Frame::Authenticate { .. } => Command::Authenticate,
            Frame::RegisterRoute { .. } | Frame::Connect { .. } => Command::Route,
            Frame::Data { .. } => Command::Data,
            Frame::Disconnect { .. } => Command::Disconnect,
            Frame::Error { .. } => Command::Error,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Authenticate { secret } => secret.len(),
            Frame::RegisterRoute { domain, path } => domain.len() + 1 + path.len(),
            Frame::Connect { peer, .. } => CLIENT_ID_LEN + 1 + peer.len(),
            Frame::Data { payload, .. } => CLIENT_ID_LEN + payload.len(),
            Frame::Disconnect { .. } => CLIENT_ID_LEN,
            Frame::Error { message } => message.len(),
        }
    }
}

/// Which side of the tunnel the codec decodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Satellite,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitHeader,
    AwaitPayload { command: Command, len: usize },
}

#[derive(Debug)]
pub struct FrameCodec {
    side: Side,
    max_frame_size: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(side: Side, max_frame_size: usize) -> Self {
        Self {
            side,
            max_frame_size,
            state: DecodeState::AwaitHeader,
        }
    }

    /// Largest `Data` payload that fits in one frame.
    pub fn max_data_payload(max_frame_size: usize) -> usize {
        max_frame_size.saturating_sub(CLIENT_ID_LEN).max(1)
    }

    fn parse(&self, command: Command, mut payload: Bytes) -> Result<Frame, FrameError> {
        let frame = match command {
            Command::Authenticate => Frame::Authenticate {
                secret: utf8(payload)?,
            },
            Command::Route => match self.side {
                Side::Primary => {
                    let route = utf8(payload)?;
                    let (domain, path) = route.split_once('/').unwrap_or((route.as_str(), ""));
                    Frame::RegisterRoute {
                        domain: domain.to_string(),
                        path: path.to_string(),
                    }
                }
                Side::Satellite => {
                    let client_id = client_id(&mut payload)?;
                    let kind = if payload.has_remaining() {
                        HandlerKind::from_byte(payload.get_u8())
                    } else {
                        HandlerKind::Http
                    };
                    Frame::Connect {
                        client_id,
                        kind,
                        peer: utf8(payload)?,
                    }
                }
            },
            Command::Data => Frame::Data {
                client_id: client_id(&mut payload)?,
                payload,
            },
            Command::Disconnect => Frame::Disconnect {
                client_id: client_id(&mut payload)?,
            },
            Command::Error => Frame::Error {
                message: utf8(payload)?,
            },
        };
        Ok(frame)
    }
}

fn client_id(payload: &mut Bytes) -> Result<u64, FrameError> {
    if payload.len() < CLIENT_ID_LEN {
        return Err(FrameError::MissingClientId);
    }
    Ok(payload.get_u64())
}

fn utf8(payload: Bytes) -> Result<String, FrameError> {
    String::from_utf8(payload.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                DecodeState::AwaitHeader => {
                    if src.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let command = Command::try_from(src[0])?;
                    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
                    if len > self.max_frame_size {
                        return Err(FrameError::TooLarge {
                            len,
                            max: self.max_frame_size,
                        });
                    }
                    src.advance(HEADER_LEN);
                    src.reserve(len);
                    self.state = DecodeState::AwaitPayload { command, len };
                }
                DecodeState::AwaitPayload { command, len } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.state = DecodeState::AwaitHeader;
                    return self.parse(command, payload).map(Some);
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload_len();
        if len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.command() as u8);
        dst.put_u32(len as u32);
        match frame {
            Frame::Authenticate { secret } => dst.extend_from_slice(secret.as_bytes()),
            Frame::RegisterRoute { domain, path } => {
                dst.extend_from_slice(domain.as_bytes());
                dst.put_u8(b'/');
                dst.extend_from_slice(path.as_bytes());
            }
            Frame::Connect { client_id, kind, peer } => {
                dst.put_u64(client_id);
                dst.put_u8(kind as u8);
                dst.extend_from_slice(peer.as_bytes());
            }
            Frame::Data { client_id, payload } => {
                dst.put_u64(client_id);
                dst.extend_from_slice(&payload);
            }
            Frame::Disconnect { client_id } => dst.put_u64(client_id),
            Frame::Error { message } => dst.extend_from_slice(message.as_bytes()),
        }
        Ok(())
    }
}
