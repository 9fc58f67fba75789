//! CoAP message format (RFC 7252 section 3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;
use tinyvec::ArrayVec;

use crate::Error;

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LEN: usize = 8;

/// Option numbers used here.
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn as_bits(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Empty,
    Get,
    Post,
    Put,
    Delete,
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
    Unknown(u8),
}

impl Code {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Code::Empty,
            0x01 => Code::Get,
            0x02 => Code::Post,
            0x03 => Code::Put,
            0x04 => Code::Delete,
            0x41 => Code::Created,
            0x42 => Code::Deleted,
            0x43 => Code::Valid,
            0x44 => Code::Changed,
            0x45 => Code::Content,
            0x80 => Code::BadRequest,
            0x84 => Code::NotFound,
            0x85 => Code::MethodNotAllowed,
            0xA0 => Code::InternalServerError,
            _ => Code::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Code::Empty => 0x00,
            Code::Get => 0x01,
            Code::Post => 0x02,
            Code::Put => 0x03,
            Code::Delete => 0x04,
            Code::Created => 0x41,
            Code::Deleted => 0x42,
            Code::Valid => 0x43,
            Code::Changed => 0x44,
            Code::Content => 0x45,
            Code::BadRequest => 0x80,
            Code::NotFound => 0x84,
            Code::MethodNotAllowed => 0x85,
            Code::InternalServerError => 0xA0,
            Code::Unknown(value) => *value,
        }
    }

    /// Class 0 codes other than Empty.
    pub fn is_request(&self) -> bool {
        let v = self.as_u8();
        v >> 5 == 0 && v != 0
    }

    /// Class 2 to 5.
    pub fn is_response(&self) -> bool {
        (2..=5).contains(&(self.as_u8() >> 5))
    }

    pub fn is_success(&self) -> bool {
        self.as_u8() >> 5 == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.as_u8();
        write!(f, "{}.{:02}", v >> 5, v & 0x1F)
    }
}

pub type Token = ArrayVec<[u8; MAX_TOKEN_LEN]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    /// Sorted by option number.
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, code: Code, message_id: u16, token: &[u8]) -> Result<Self, Error> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(Error::TooLarge {
                what: "token",
                len: token.len(),
                max: MAX_TOKEN_LEN,
            });
        }
        let mut t = Token::new();
        t.extend_from_slice(token);
        Ok(Message {
            msg_type,
            code,
            message_id,
            token: t,
            options: Vec::new(),
            payload: Vec::new(),
        })
    }

    /// Empty ACK or RST for `message_id`.
    pub fn empty(msg_type: MessageType, message_id: u16) -> Self {
        Message {
            msg_type,
            code: Code::Empty,
            message_id,
            token: Token::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    pub fn add_option(&mut self, number: u16, value: &[u8]) {
        // Keep insertion order among equal numbers, which matters for Uri-Path.
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(
            at,
            CoapOption {
                number,
                value: value.to_vec(),
            },
        );
    }

    /// Replace the Uri-Path with the segments of `path` ("c/cp").
    pub fn set_path(&mut self, path: &str) {
        self.options.retain(|o| o.number != option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option::URI_PATH, segment.as_bytes());
        }
    }

    /// Uri-Path segments joined with '/'.
    pub fn path(&self) -> String {
        let segments: Vec<_> = self
            .options
            .iter()
            .filter(|o| o.number == option::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value))
            .collect();
        segments.join("/")
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        self.payload = payload.to_vec();
    }

    pub fn is_empty_message(&self) -> bool {
        self.code == Code::Empty
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Message> {
        let (input, first) = be_u8(input)?;
        if first >> 6 != VERSION {
            return Err(nom_error(input, nom::error::ErrorKind::Verify));
        }
        let msg_type = MessageType::from_bits(first >> 4);
        let token_len = (first & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(nom_error(input, nom::error::ErrorKind::LengthValue));
        }

        let (input, code) = be_u8(input)?;
        let (input, message_id) = be_u16(input)?;
        let (mut input, token_bytes) = take(token_len)(input)?;

        let mut token = Token::new();
        token.extend_from_slice(token_bytes);

        let mut options = Vec::new();
        let mut number: u16 = 0;
        let mut payload = Vec::new();

        while !input.is_empty() {
            if input[0] == PAYLOAD_MARKER {
                let rest = &input[1..];
                // A marker followed by nothing is a format error.
                if rest.is_empty() {
                    return Err(nom_error(input, nom::error::ErrorKind::Eof));
                }
                payload = rest.to_vec();
                input = &[];
                break;
            }

            let (rest, byte) = be_u8(input)?;
            let (rest, delta) = parse_extended(rest, byte >> 4)?;
            let (rest, len) = parse_extended(rest, byte & 0x0F)?;
            let (rest, value) = take(len as usize)(rest)?;

            number = number
                .checked_add(delta)
                .ok_or_else(|| nom_error(input, nom::error::ErrorKind::TooLarge))?;
            options.push(CoapOption {
                number,
                value: value.to_vec(),
            });
            input = rest;
        }

        Ok((
            input,
            Message {
                msg_type,
                code: Code::from_u8(code),
                message_id,
                token,
                options,
                payload,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(VERSION << 6 | self.msg_type.as_bits() << 4 | self.token.len() as u8);
        output.push(self.code.as_u8());
        output.extend_from_slice(&self.message_id.to_be_bytes());
        output.extend_from_slice(&self.token);

        let mut last = 0;
        for o in &self.options {
            let delta = o.number - last;
            last = o.number;

            let (delta_nibble, delta_ext) = extended(delta);
            let (len_nibble, len_ext) = extended(o.value.len() as u16);
            output.push(delta_nibble << 4 | len_nibble);
            output.extend_from_slice(&delta_ext);
            output.extend_from_slice(&len_ext);
            output.extend_from_slice(&o.value);
        }

        if !self.payload.is_empty() {
            output.push(PAYLOAD_MARKER);
            output.extend_from_slice(&self.payload);
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        self.serialize(&mut out);
        out
    }
}

fn nom_error(input: &[u8], kind: nom::error::ErrorKind) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, kind))
}

fn parse_extended(input: &[u8], nibble: u8) -> IResult<&[u8], u16> {
    match nibble {
        0..=12 => Ok((input, nibble as u16)),
        13 => {
            let (input, v) = be_u8(input)?;
            Ok((input, v as u16 + 13))
        }
        14 => {
            let (input, v) = be_u16(input)?;
            let v = v
                .checked_add(269)
                .ok_or_else(|| nom_error(input, nom::error::ErrorKind::TooLarge))?;
            Ok((input, v))
        }
        _ => Err(nom_error(input, nom::error::ErrorKind::Verify)),
    }
}

fn extended(value: u16) -> (u8, ArrayVec<[u8; 2]>) {
    let mut ext = ArrayVec::new();
    if value < 13 {
        (value as u8, ext)
    } else if value < 269 {
        ext.push((value - 13) as u8);
        (13, ext)
    } else {
        ext.extend_from_slice(&(value - 269).to_be_bytes());
        (14, ext)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type)
            .field("code", &format_args!("{}", self.code))
            .field("id", &self.message_id)
            .field("token", &format_args!("{:02x?}", &self.token[..]))
            .field("path", &self.path())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
