//! WebSocket upgrade and frame handling.
//!
//! # Responsibilities
//! - Answer the upgrade handshake (`101` + `Sec-WebSocket-Accept`)
//! - Parse client frames straight out of the connection's receive buffer
//! - Deliver text/binary messages to a callback and send its replies
//! - Echo ping as pong and close as close
//!
//! # Data Flow
//! ```text
//! Client ──frames──▶ receive buffer ──▶ WebSocketSession::on_data ──▶ callback
//!                                               │
//! Client ◀──────────── reply / pong / close ────┘
//! ```
//!
//! # Design Decisions
//! - Fragmented messages (FIN = 0 or continuation opcode) are not assembled;
//!   such frames are logged and dropped
//! - Server frames are never masked

use std::sync::Arc;

use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use sha1::{Digest, Sha1};

use crate::http::request::Request;
use crate::http::response::{Response, UpgradeHandler, UpgradeStatus};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Called for every complete message; a returned message is sent back.
pub type MessageCallback = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the `101` handshake response, or `400` if the request is not a
/// valid upgrade.
pub fn upgrade(request: &Request, callback: MessageCallback) -> Response {
    let key = match request.header("sec-websocket-key") {
        Some(key) if request.wants_websocket() => key,
        _ => return Response::text(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade"),
    };

    tracing::debug!(request_id = %request.request_id, path = %request.path, "WebSocket upgrade");
    Response::new(StatusCode::SWITCHING_PROTOCOLS)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", accept_key(key))
        .with_upgrade(Box::new(WebSocketSession::new(callback)))
}

/// Server side of one upgraded connection.
pub struct WebSocketSession {
    callback: MessageCallback,
}

impl WebSocketSession {
    pub fn new(callback: MessageCallback) -> Self {
        Self { callback }
    }

    fn reply(&self, message: Message, output: &mut Vec<u8>) {
        if let Some(reply) = (self.callback)(message) {
            match reply {
                Message::Text(text) => encode_frame(OP_TEXT, text.as_bytes(), output),
                Message::Binary(bytes) => encode_frame(OP_BINARY, &bytes, output),
            }
        }
    }
}

struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: u64,
}

fn parse_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < 2 {
        return None;
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0f;
    let masked = buf[1] & 0x80 != 0;
    let (payload_len, mut pos) = match buf[1] & 0x7f {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        n => (n as u64, 2),
    };
    let mask = if masked {
        if buf.len() < pos + 4 {
            return None;
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
        Some(key)
    } else {
        None
    };
    Some(FrameHeader {
        fin,
        opcode,
        mask,
        header_len: pos,
        payload_len,
    })
}

impl UpgradeHandler for WebSocketSession {
    fn on_data(&mut self, input: &mut BytesMut, output: &mut Vec<u8>) -> UpgradeStatus {
        let Some(header) = parse_header(input) else {
            return UpgradeStatus::NeedMore;
        };
        if header.payload_len > MAX_PAYLOAD {
            tracing::warn!(len = header.payload_len, "WebSocket frame too large, closing");
            encode_frame(OP_CLOSE, &1009u16.to_be_bytes(), output);
            return UpgradeStatus::Close;
        }
        let total = header.header_len + header.payload_len as usize;
        if input.len() < total {
            return UpgradeStatus::NeedMore;
        }

        input.advance(header.header_len);
        let mut payload = input.split_to(header.payload_len as usize);
        if let Some(key) = header.mask {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }

        if !header.fin || header.opcode == OP_CONTINUATION {
            tracing::warn!(opcode = header.opcode, "Fragmented WebSocket frames are not supported, dropping");
            return UpgradeStatus::Handled;
        }

        match header.opcode {
            OP_TEXT => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                self.reply(Message::Text(text), output);
            }
            OP_BINARY => self.reply(Message::Binary(payload.freeze()), output),
            OP_PING => encode_frame(OP_PONG, &payload, output),
            OP_PONG => {}
            OP_CLOSE => {
                encode_frame(OP_CLOSE, &payload, output);
                return UpgradeStatus::Close;
            }
            other => {
                tracing::warn!(opcode = other, "Unknown WebSocket opcode, closing");
                encode_frame(OP_CLOSE, &1002u16.to_be_bytes(), output);
                return UpgradeStatus::Close;
            }
        }
        UpgradeStatus::Handled
    }

    fn on_close(&mut self) {
        tracing::debug!("WebSocket session closed");
    }
}

/// Append an unmasked, final frame.
pub fn encode_frame(opcode: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(0x80 | opcode);
    match payload.len() {
        n if n < 126 => out.push(n as u8),
        n if n <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
}
