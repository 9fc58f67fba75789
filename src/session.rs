//! Secure Datagram Session: one DTLS conversation over UDP.
//!
//! A session wraps a sans-IO [`Dtls`] endpoint together with the socket it
//! talks through. Client sessions own a connected socket from the start.
//! Server sessions first receive through the listener (the [`Server`]
//! routes datagrams in with [`Session::receive`]) and switch to a dedicated
//! connected socket on their first outbound flight.
//!
//! [`Server`]: crate::server::Server

use std::fmt;
use std::io;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dtls::{is_client_hello, Dtls, HelloCheck, Kek, Output};
use crate::mainloop::{MainloopContext, Readiness};
use crate::net;
use crate::server::SessionFactory;
use crate::{Config, Error};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a send waits for a full socket buffer to drain.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a [`Session`].
///
/// `Handshaking -> Ready -> {Close, End, Error, Expired}`. A ClientHello
/// from the peer of a `Ready` server session puts it back in `Handshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    /// The peer sent close_notify. The owner should discard the session.
    Close,
    /// Closed locally.
    End,
    Error,
    Expired,
}

impl SessionState {
    /// Handshaking or Ready.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Ready)
    }
}

pub type DataHandler = Box<dyn FnMut(&[u8])>;

enum Transport {
    /// Client role, connected to the peer.
    Client(UdpSocket),
    /// Server role, nothing sent yet. `local` is where the peer reached us.
    Pending { local: SocketAddr },
    /// Server role, connected reply socket.
    Dedicated(UdpSocket),
}

pub struct Session {
    id: u64,
    state: SessionState,
    dtls: Dtls,
    transport: Transport,
    peer: SocketAddr,
    config: Arc<Config>,

    /// Present for server sessions. Used to vet a reconnecting ClientHello.
    factory: Option<Rc<SessionFactory>>,

    expiration: Instant,
    dtls_timeout: Option<Instant>,
    kek: Option<Kek>,
    data_handler: Option<DataHandler>,
    /// Datagrams read from the socket.
    rx_buf: Vec<u8>,
    /// Output polled from the endpoint.
    tx_buf: Vec<u8>,
}

impl Session {
    /// Client session towards `peer`. The ClientHello is sent right away.
    pub fn connect(config: Arc<Config>, psk: &[u8], peer: SocketAddr) -> Result<Session, Error> {
        let socket = net::connected_socket(peer)?;
        let dtls = Dtls::new_client(config.clone(), psk)?;

        let mut session = Session::new(config, dtls, Transport::Client(socket), peer, None);
        debug!(
            "Session {} connecting to {} fd={:?}",
            session.id,
            peer,
            session.fd()
        );
        session.drive(Instant::now());
        Ok(session)
    }

    /// Server session for a peer whose ClientHello passed the cookie check.
    pub(crate) fn accept(
        factory: Rc<SessionFactory>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Session, Error> {
        let dtls = factory.new_endpoint()?;
        let config = factory.config().clone();
        let session = Session::new(
            config,
            dtls,
            Transport::Pending { local },
            peer,
            Some(factory),
        );
        debug!("Session {} accepted from {} on {}", session.id, peer, local);
        Ok(session)
    }

    fn new(
        config: Arc<Config>,
        dtls: Dtls,
        transport: Transport,
        peer: SocketAddr,
        factory: Option<Rc<SessionFactory>>,
    ) -> Session {
        let rx_buf = vec![0; config.max_packet_size()];
        let tx_buf = vec![0; config.max_packet_size()];
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: SessionState::Handshaking,
            dtls,
            transport,
            peer,
            expiration: Instant::now() + config.session_timeout(),
            config,
            factory,
            dtls_timeout: None,
            kek: None,
            data_handler: None,
            rx_buf,
            tx_buf,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiration <= now
    }

    /// Socket to watch for readability. `None` while a server session
    /// still receives through the listener.
    pub fn fd(&self) -> Option<RawFd> {
        match &self.transport {
            Transport::Client(s) | Transport::Dedicated(s) => Some(s.as_raw_fd()),
            Transport::Pending { .. } => None,
        }
    }

    /// When the DTLS endpoint next needs [`Session::process`] regardless of
    /// socket readiness.
    pub fn dtls_timeout(&self) -> Option<Instant> {
        self.dtls_timeout
    }

    /// Key encryption key of the last completed handshake.
    pub fn kek(&self) -> Option<&Kek> {
        self.kek.as_ref()
    }

    /// Install the callback that receives decrypted data. Replaces any
    /// earlier handler.
    pub fn set_data_handler(&mut self, handler: impl FnMut(&[u8]) + 'static) {
        self.data_handler = Some(Box::new(handler));
    }

    /// Add this session's needs to `ctx`.
    pub fn update_fd_set(&self, ctx: &mut MainloopContext) {
        if !self.state.is_active() {
            return;
        }
        if let Some(fd) = self.fd() {
            ctx.add_read_fd(fd);
        }
        ctx.tighten_deadline(self.expiration);
        if let Some(t) = self.dtls_timeout {
            ctx.tighten_deadline(t);
        }
    }

    /// Read what the socket has, then run timers.
    ///
    /// The expiration is pushed to `now + session_timeout` on every call,
    /// whatever the outcome.
    pub fn process(&mut self, readiness: &Readiness, now: Instant) {
        self.expiration = now + self.config.session_timeout();

        if !self.state.is_active() {
            return;
        }

        if let Some(fd) = self.fd() {
            if readiness.is_readable(fd) {
                self.read_socket(now);
            }
        }

        self.drive(now);
    }

    /// Feed a datagram that arrived on the listener.
    pub(crate) fn receive(&mut self, datagram: &[u8], now: Instant) {
        self.expiration = now + self.config.session_timeout();
        self.input(datagram, now);
        self.drive(now);
    }

    /// Encrypt and send `data`. Fails once the session is no longer active,
    /// and any failure moves the session to `Error`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if !self.state.is_active() {
            return Err(Error::InvalidState("session is not open"));
        }

        let result = self
            .dtls
            .send_application_data(data)
            .and_then(|_| self.flush());

        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Send close_notify unless already terminal. Idempotent.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Error | SessionState::End) {
            return;
        }
        let result = self.dtls.close().and_then(|_| self.flush());
        if let Err(e) = result {
            debug!("Session {} close_notify not sent: {}", self.id, e);
        }
        self.set_state(SessionState::End);
    }

    /// Mark the session expired. The owner drops it afterwards.
    pub(crate) fn expire(&mut self) {
        self.set_state(SessionState::Expired);
    }

    fn read_socket(&mut self, now: Instant) {
        let mut buf = mem::take(&mut self.rx_buf);
        loop {
            let socket = match &self.transport {
                Transport::Client(s) | Transport::Dedicated(s) => s,
                Transport::Pending { .. } => break,
            };
            match socket.recv(&mut buf) {
                Ok(0) => trace!("Session {} drops empty datagram", self.id),
                Ok(n) => {
                    self.input(&buf[..n], now);
                    if !self.state.is_active() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    debug!("Session {} peer {} unreachable", self.id, self.peer);
                    break;
                }
                Err(e) => {
                    self.fail(&Error::Io(e));
                    break;
                }
            }
        }
        self.rx_buf = buf;
    }

    fn input(&mut self, datagram: &[u8], now: Instant) {
        match self.state {
            SessionState::Handshaking => {}
            SessionState::Ready if self.factory.is_some() && is_client_hello(datagram) => {
                self.reconnect(datagram, now);
                return;
            }
            SessionState::Ready => {}
            _ => {
                trace!("Session {} drops datagram in {:?}", self.id, self.state);
                return;
            }
        }

        if let Err(e) = self.dtls.handle_packet(datagram) {
            self.handle_error(e);
        }
    }

    /// A Ready server session got a ClientHello: the peer lost its state
    /// and starts over. It has to pass the cookie check like a new peer.
    fn reconnect(&mut self, datagram: &[u8], now: Instant) {
        let Some(factory) = self.factory.clone() else {
            return;
        };
        match factory.check_hello(self.peer, datagram, now) {
            HelloCheck::Verified => {
                info!("Session {} peer {} reconnects", self.id, self.peer);
                match factory.new_endpoint() {
                    Ok(dtls) => {
                        self.dtls = dtls;
                        self.kek = None;
                        self.dtls_timeout = None;
                        self.set_state(SessionState::Handshaking);
                        if let Err(e) = self.dtls.handle_packet(datagram) {
                            self.handle_error(e);
                        }
                    }
                    Err(e) => self.fail(&e),
                }
            }
            HelloCheck::HelloVerifyRequest(hvr) => {
                if let Err(e) = self.send_datagram(&hvr) {
                    self.fail(&e);
                }
            }
            HelloCheck::Drop => {
                trace!("Session {} drops unverifiable ClientHello", self.id);
            }
        }
    }

    /// Run timers and push out everything the endpoint produced.
    fn drive(&mut self, now: Instant) {
        if self.state.is_active() {
            if let Err(e) = self.dtls.handle_timeout(now) {
                self.handle_error(e);
            }
        }
        if let Err(e) = self.flush() {
            self.fail(&e);
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        let mut buf = mem::take(&mut self.tx_buf);
        let result = self.flush_with(&mut buf);
        self.tx_buf = buf;
        result
    }

    fn flush_with(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let max = buf.len();
        loop {
            match self.dtls.poll_output(buf) {
                Output::Packet(p) => self.send_datagram(p)?,
                Output::Timeout(t) => {
                    self.dtls_timeout = Some(t);
                    return Ok(());
                }
                Output::Connected => {
                    info!("Session {} connected to {}", self.id, self.peer);
                    self.set_state(SessionState::Ready);
                }
                Output::KeyingMaterial(kek) => {
                    trace!("Session {} key exported", self.id);
                    self.kek = Some(kek);
                }
                Output::ApplicationData(data) => {
                    trace!("Session {} received {} bytes", self.id, data.len());
                    match self.data_handler.as_mut() {
                        Some(handler) => handler(data),
                        None => debug!("Session {} has no data handler", self.id),
                    }
                }
                Output::PeerClosed => {
                    info!("Session {} closed by peer {}", self.id, self.peer);
                    self.set_state(SessionState::Close);
                }
                Output::BufferTooSmall { needed } => {
                    return Err(Error::TooLarge {
                        what: "datagram",
                        len: needed,
                        max,
                    });
                }
            }
        }
    }

    fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), Error> {
        if let Transport::Pending { local } = self.transport {
            let socket = net::reply_socket(local, self.peer)?;
            debug!(
                "Session {} dedicated socket fd={} {} -> {}",
                self.id,
                socket.as_raw_fd(),
                local,
                self.peer
            );
            self.transport = Transport::Dedicated(socket);
        }

        let socket = match &self.transport {
            Transport::Client(s) | Transport::Dedicated(s) => s,
            Transport::Pending { .. } => return Err(Error::InvalidState("no socket")),
        };

        let fd = socket.as_raw_fd();
        match net::send_retrying(fd, SEND_TIMEOUT, || socket.send(datagram)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("Session {} peer {} unreachable", self.id, self.peer);
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    && self.state == SessionState::Handshaking =>
            {
                // The flight is sent again on its retransmission timer.
                debug!("Session {} flight send timed out, dropped", self.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handle_error(&mut self, e: Error) {
        if e.is_fatal() {
            // The endpoint queued a fatal alert, get it out before failing.
            if let Err(send) = self.flush() {
                debug!("Session {} alert not sent: {}", self.id, send);
            }
            self.fail(&e);
        } else {
            trace!("Session {} ignores: {}", self.id, e);
        }
    }

    fn fail(&mut self, e: &Error) {
        if matches!(self.state, SessionState::Error | SessionState::End) {
            return;
        }
        warn!("Session {} peer {} failed: {}", self.id, self.peer, e);
        self.set_state(SessionState::Error);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session {} {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("fd", &self.fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::time::Duration;

    fn config() -> Arc<Config> {
        Arc::new(Config::builder().rng_seed(11).build().unwrap())
    }

    #[test]
    fn write_after_end_fails() {
        let peer: SocketAddr = (Ipv6Addr::LOCALHOST, 9).into();
        let mut session = Session::connect(config(), b"secret", peer).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.fd().is_some());

        session.close();
        assert_eq!(session.state(), SessionState::End);
        assert!(session.write(b"data").is_err());

        // Idempotent.
        session.close();
        assert_eq!(session.state(), SessionState::End);
    }

    #[test]
    fn process_refreshes_expiration() {
        let peer: SocketAddr = (Ipv6Addr::LOCALHOST, 9).into();
        let mut session = Session::connect(config(), b"secret", peer).unwrap();

        let later = Instant::now() + Duration::from_secs(30);
        session.process(&Readiness::none(), later);
        assert_eq!(session.expiration(), later + Duration::from_secs(60));
        assert!(!session.is_expired(later));
    }

    #[test]
    fn handshake_timeout_moves_to_error() {
        let config = Arc::new(
            Config::builder()
                .rng_seed(11)
                .handshake_timeout(Duration::from_secs(8))
                .build()
                .unwrap(),
        );
        let peer: SocketAddr = (Ipv6Addr::LOCALHOST, 9).into();
        let mut session = Session::connect(config, b"secret", peer).unwrap();

        // Walk the timers past the handshake timeout.
        let start = Instant::now();
        for i in 1..=20 {
            session.process(&Readiness::none(), start + Duration::from_secs(i));
        }
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.write(b"late").is_err());
    }
}
