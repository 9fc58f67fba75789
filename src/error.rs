use thiserror::Error;

use crate::dtls::message::AlertDescription;

/// Errors produced by the commissioning stack.
#[derive(Debug, Error)]
pub enum Error {
    /// Some wire format could not be parsed.
    #[error("parse error: {0:?}")]
    ParseError(nom::error::ErrorKind),

    /// Input ended before a complete structure was read.
    #[error("parse incomplete")]
    ParseIncomplete,

    /// The peer sent a message we did not expect in the current state.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Encryption, decryption or key derivation failed.
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// The peer failed to prove knowledge of the shared secret.
    #[error("security error: {0}")]
    SecurityError(String),

    /// ClientHello did not carry a valid cookie. Not fatal.
    #[error("hello verify required")]
    HelloVerifyRequired,

    /// The peer sent a fatal alert.
    #[error("received alert: {0:?}")]
    Alert(AlertDescription),

    /// The peer closed the connection with close_notify.
    #[error("peer closed")]
    PeerClosed,

    /// A timer expired.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Too many buffered incoming packets.
    #[error("receive queue full")]
    ReceiveQueueFull,

    /// Too many buffered outgoing packets.
    #[error("transmit queue full")]
    TransmitQueueFull,

    /// Input exceeded a fixed maximum. Nothing was changed.
    #[error("{what} too large: {len} > {max}")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// Argument out of the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A TLV did not fit its envelope.
    #[error("malformed tlv (type {0})")]
    Tlv(u8),

    /// Socket level failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::ParseError(e.code),
        }
    }
}

impl Error {
    /// Errors that end the conversation and warrant a fatal alert.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::HelloVerifyRequired | Error::ReceiveQueueFull | Error::TransmitQueueFull
        )
    }
}
