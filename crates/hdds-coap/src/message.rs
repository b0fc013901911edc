// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// CoAP (RFC 7252) message value and wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.

use crate::error::{CoapError, CoapResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fixed header size in bytes (version/type/TKL, code, message id).
pub const HEADER_SIZE: usize = 4;

/// Protocol version carried in every header.
pub const VERSION: u8 = 1;

/// Longest token allowed by the header's 4-bit TKL field.
pub const MAX_TOKEN_LEN: usize = 8;

/// Separates options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Message codes (class << 5 | detail).
pub mod code {
    pub const EMPTY: u8 = 0x00;
    pub const GET: u8 = 0x01;
    pub const POST: u8 = 0x02;
    pub const PUT: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    /// 2.05 Content
    pub const CONTENT: u8 = 0x45;
    /// 4.04 Not Found
    pub const NOT_FOUND: u8 = 0x84;

    /// Response class (the `c` of `c.dd`).
    pub fn class(code: u8) -> u8 {
        code >> 5
    }

    /// 2.xx response.
    pub fn is_success(code: u8) -> bool {
        class(code) == 2
    }
}

/// Option numbers used by the observe layer.
pub mod option {
    pub const OBSERVE: u16 = 6;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
}

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

/// The 2-bit message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    fn from_bits(v: u8) -> Self {
        match v & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded CoAP message.
///
/// `message_id` is the transaction id correlating a confirmable message with
/// its acknowledgement; the observe layer overwrites it on every delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, code: u8) -> Self {
        Self {
            kind,
            code,
            message_id: 0,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// A confirmable message: retransmitted until acknowledged.
    pub fn confirmable(code: u8) -> Self {
        Self::new(MessageType::Confirmable, code)
    }

    pub fn non_confirmable(code: u8) -> Self {
        Self::new(MessageType::NonConfirmable, code)
    }

    /// Empty ACK for `msg`, echoing its message id.
    pub fn ack_for(msg: &Message) -> Self {
        Self {
            message_id: msg.message_id,
            ..Self::new(MessageType::Acknowledgement, code::EMPTY)
        }
    }

    pub fn is_confirmable(&self) -> bool {
        self.kind == MessageType::Confirmable
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_option(mut self, number: u16, value: impl Into<Vec<u8>>) -> Self {
        self.options.push(CoapOption {
            number,
            value: value.into(),
        });
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Append one Uri-Path option per `/`-separated segment.
    pub fn with_uri_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self = self.with_option(option::URI_PATH, segment.as_bytes());
        }
        self
    }

    /// Observe value encoded as a minimal big-endian uint.
    pub fn with_observe(self, seq: u32) -> Self {
        let bytes = seq.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.with_option(option::OBSERVE, &bytes[skip..])
    }

    /// Values of every instance of `number`, in message order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Uri-Path segments joined with `/`.
    pub fn uri_path(&self) -> String {
        self.option_values(option::URI_PATH)
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Observe option value, if present.
    pub fn observe(&self) -> Option<u32> {
        let value = self.option_values(option::OBSERVE).next()?;
        if value.len() > 3 {
            return None;
        }
        Some(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    // -----------------------------------------------------------------------
    // Wire format
    // -----------------------------------------------------------------------

    /// Serialize into a datagram.
    pub fn encode(&self) -> CoapResult<Vec<u8>> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CoapError::malformed(format!(
                "token length {} exceeds {}",
                self.token.len(),
                MAX_TOKEN_LEN
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.token.len() + self.payload.len() + 16);
        buf.push((VERSION << 6) | ((self.kind as u8) << 4) | self.token.len() as u8);
        buf.push(self.code);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        // Options are delta-encoded and must be written in ascending order;
        // the stable sort keeps repeated options in insertion order.
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for opt in options {
            if opt.value.len() > u16::MAX as usize {
                return Err(CoapError::malformed(format!(
                    "option {} value too long",
                    opt.number
                )));
            }
            let delta = opt.number - previous;
            let (delta_nibble, delta_ext) = split_extended(delta);
            let (len_nibble, len_ext) = split_extended(opt.value.len() as u16);
            buf.push((delta_nibble << 4) | len_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&len_ext);
            buf.extend_from_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    /// Parse a datagram.
    pub fn decode(buf: &[u8]) -> CoapResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(CoapError::malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }

        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(CoapError::malformed(format!("unknown version {}", version)));
        }
        let kind = MessageType::from_bits(buf[0] >> 4);
        let token_len = (buf[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(CoapError::malformed(format!("token length {}", token_len)));
        }
        let code = buf[1];
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        if code == code::EMPTY && (token_len != 0 || buf.len() > HEADER_SIZE) {
            return Err(CoapError::malformed("empty message with content"));
        }

        let mut pos = HEADER_SIZE;
        let token = buf
            .get(pos..pos + token_len)
            .ok_or_else(|| CoapError::malformed("truncated token"))?
            .to_vec();
        pos += token_len;

        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut number = 0u16;

        while pos < buf.len() {
            let byte = buf[pos];
            pos += 1;

            if byte == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(CoapError::malformed("payload marker without payload"));
                }
                payload = buf[pos..].to_vec();
                break;
            }

            let delta = read_extended(byte >> 4, buf, &mut pos)?;
            let len = read_extended(byte & 0x0F, buf, &mut pos)? as usize;

            number = number
                .checked_add(delta)
                .ok_or_else(|| CoapError::malformed("option number overflow"))?;
            let value = buf
                .get(pos..pos + len)
                .ok_or_else(|| CoapError::malformed(format!("truncated option {}", number)))?
                .to_vec();
            pos += len;

            options.push(CoapOption { number, value });
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// Split a delta/length into its 4-bit nibble and extended bytes.
fn split_extended(value: u16) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, (value - 269).to_be_bytes().to_vec()),
    }
}

fn read_extended(nibble: u8, buf: &[u8], pos: &mut usize) -> CoapResult<u16> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| CoapError::malformed("truncated option header"))?;
            *pos += 1;
            Ok(u16::from(b) + 13)
        }
        14 => {
            let bytes = buf
                .get(*pos..*pos + 2)
                .ok_or_else(|| CoapError::malformed("truncated option header"))?;
            *pos += 2;
            u16::from_be_bytes([bytes[0], bytes[1]])
                .checked_add(269)
                .ok_or_else(|| CoapError::malformed("option field overflow"))
        }
        _ => Err(CoapError::malformed("reserved option nibble 15")),
    }
}
