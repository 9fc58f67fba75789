//! Sans-IO DTLS 1.2 with `TLS_ECJPAKE_WITH_AES_128_CCM_8`.
//!
//! The endpoints never touch a socket. Datagrams go in through
//! [`Dtls::handle_packet`], time through [`Dtls::handle_timeout`], and
//! everything the endpoint wants done comes out of [`Dtls::poll_output`].
//!
//! ```text
//! loop {
//!     dtls.handle_timeout(now)?;
//!     loop {
//!         match dtls.poll_output(&mut buf) {
//!             Output::Packet(p) => socket.send(p),
//!             Output::Timeout(t) => break wait_until(t),
//!             ...
//!         }
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Instant;

mod cache;
mod client;
mod cookie;
mod crypto;
mod ecjpake;
mod engine;
pub mod message;
mod server;
mod window;

pub use cache::{ResumptionTicket, SessionCache};
pub use client::Client;
pub use cookie::{CookieJar, COOKIE_LEN};
pub use crypto::{Kek, MasterSecret};
pub use ecjpake::{EcJpake, Role, MAX_PASSWORD_LEN};
pub use server::{check_client_hello, is_client_hello, HelloCheck, Server};

use crate::{Config, Error};

/// Output from polling an endpoint.
#[derive(Debug)]
pub enum Output<'a> {
    /// A datagram to send to the peer.
    Packet(&'a [u8]),
    /// Call `handle_timeout` at this instant at the latest.
    Timeout(Instant),
    /// Handshake complete.
    Connected,
    /// Key encryption key of the completed handshake. Emitted once, right
    /// after `Connected`.
    KeyingMaterial(Kek),
    /// Decrypted application data.
    ApplicationData(&'a [u8]),
    /// The peer sent close_notify.
    PeerClosed,
    /// The next output needs a buffer of `needed` bytes. It stays queued
    /// until polled with a large enough buffer.
    BufferTooSmall { needed: usize },
}

/// Events queued by the state machines ahead of engine output.
#[derive(Debug)]
pub(crate) enum LocalEvent {
    Connected,
    KeyingMaterial(Kek),
}

impl LocalEvent {
    pub(crate) fn into_output<'a>(self) -> Output<'a> {
        match self {
            LocalEvent::Connected => Output::Connected,
            LocalEvent::KeyingMaterial(kek) => Output::KeyingMaterial(kek),
        }
    }
}

/// A DTLS endpoint in either role.
#[derive(Debug)]
pub enum Dtls {
    Client(Client),
    Server(Server),
}

impl Dtls {
    /// Client that authenticates with `psk`.
    pub fn new_client(config: Arc<Config>, psk: &[u8]) -> Result<Self, Error> {
        Ok(Dtls::Client(Client::new(config, psk)?))
    }

    /// Client offering `ticket` for an abbreviated handshake.
    pub fn resume_client(
        config: Arc<Config>,
        psk: &[u8],
        ticket: ResumptionTicket,
    ) -> Result<Self, Error> {
        Ok(Dtls::Client(Client::with_resumption(config, psk, ticket)?))
    }

    /// Server that authenticates with `psk`, resuming sessions from `cache`
    /// when one is given.
    pub fn new_server(
        config: Arc<Config>,
        psk: &[u8],
        cache: Option<Arc<Mutex<SessionCache>>>,
    ) -> Result<Self, Error> {
        Ok(Dtls::Server(Server::new(config, psk, cache)?))
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Dtls::Client(_))
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Dtls::Client(c) => c.is_connected(),
            Dtls::Server(s) => s.is_connected(),
        }
    }

    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        match self {
            Dtls::Client(c) => c.handle_packet(packet),
            Dtls::Server(s) => s.handle_packet(packet),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        match self {
            Dtls::Client(c) => c.handle_timeout(now),
            Dtls::Server(s) => s.handle_timeout(now),
        }
    }

    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        match self {
            Dtls::Client(c) => c.poll_output(buf),
            Dtls::Server(s) => s.poll_output(buf),
        }
    }

    /// Queue application data. Data sent before the handshake completes is
    /// held and flushed on connect.
    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Dtls::Client(c) => c.send_application_data(data),
            Dtls::Server(s) => s.send_application_data(data),
        }
    }

    /// Send close_notify. The endpoint accepts no more data afterwards.
    pub fn close(&mut self) -> Result<(), Error> {
        match self {
            Dtls::Client(c) => c.close(),
            Dtls::Server(s) => s.close(),
        }
    }

    /// Session id and master secret of a connected client, for a later
    /// abbreviated handshake.
    pub fn resumption_ticket(&self) -> Option<ResumptionTicket> {
        match self {
            Dtls::Client(c) => c.resumption_ticket(),
            Dtls::Server(_) => None,
        }
    }
}
