//! Secure Datagram Server: one listening socket, many sessions.
//!
//! Datagrams from unknown peers must carry a valid cookie before a
//! [`Session`] is allocated. The cookie check itself keeps no state per
//! peer, so a flood of spoofed ClientHellos costs one HMAC each and nothing
//! else.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use zeroize::Zeroizing;

use crate::dtls::{check_client_hello, CookieJar, Dtls, HelloCheck, SessionCache, MAX_PASSWORD_LEN};
use crate::mainloop::{MainloopContext, Readiness};
use crate::net;
use crate::session::{Session, SessionState};
use crate::{Config, Error, SeededRng};

/// Longest accepted DRBG personalization string.
pub const MAX_SEED_LEN: usize = 32;

/// Called whenever a session changes state, after the change took effect.
/// `Expired` is reported right before the session is dropped.
pub type StateHandler = Box<dyn FnMut(&mut Session, SessionState)>;

/// What sessions need from the server that created them: new server
/// endpoints and the cookie check for peers that start over.
pub(crate) struct SessionFactory {
    config: Arc<Config>,
    psk: Zeroizing<Vec<u8>>,
    cache: Option<Arc<Mutex<SessionCache>>>,
    jar: RefCell<CookieJar>,
    rng: RefCell<SeededRng>,
}

impl SessionFactory {
    fn new(config: Arc<Config>, psk: &[u8], personalization: &[u8], now: Instant) -> Self {
        let mut rng = SeededRng::with_personalization(config.rng_seed(), personalization);
        let jar = CookieJar::new(config.cookie_lifetime(), now, &mut rng);
        let cache = (config.session_cache_capacity() > 0).then(|| {
            Arc::new(Mutex::new(SessionCache::new(
                config.session_cache_capacity(),
            )))
        });
        SessionFactory {
            config,
            psk: Zeroizing::new(psk.to_vec()),
            cache,
            jar: RefCell::new(jar),
            rng: RefCell::new(rng),
        }
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Stateless ClientHello check for `peer`.
    pub(crate) fn check_hello(&self, peer: SocketAddr, datagram: &[u8], now: Instant) -> HelloCheck {
        let mut jar = self.jar.borrow_mut();
        jar.rotate_if_due(now, &mut self.rng.borrow_mut());
        check_client_hello(&jar, &transport_id(peer), datagram)
    }

    pub(crate) fn new_endpoint(&self) -> Result<Dtls, Error> {
        Dtls::new_server(self.config.clone(), &self.psk, self.cache.clone())
    }
}

/// Peer address and port as bound into cookies.
fn transport_id(peer: SocketAddr) -> Vec<u8> {
    let mut id = match peer {
        SocketAddr::V4(a) => a.ip().octets().to_vec(),
        SocketAddr::V6(a) => a.ip().octets().to_vec(),
    };
    id.extend_from_slice(&peer.port().to_be_bytes());
    id
}

struct Entry {
    session: Session,
    reported: SessionState,
}

pub struct Server {
    config: Arc<Config>,
    port: u16,
    psk: Option<Zeroizing<Vec<u8>>>,
    seed: Vec<u8>,
    listener: Option<UdpSocket>,
    factory: Option<Rc<SessionFactory>>,
    sessions: Vec<Entry>,
    state_handler: Option<StateHandler>,
    buf: Vec<u8>,
}

impl Server {
    /// Server for `port`. Nothing is bound until [`Server::start`].
    pub fn new(config: Arc<Config>, port: u16) -> Server {
        let buf = vec![0; config.max_packet_size()];
        Server {
            config,
            port,
            psk: None,
            seed: b"Server".to_vec(),
            listener: None,
            factory: None,
            sessions: Vec::new(),
            state_handler: None,
            buf,
        }
    }

    /// Set the J-PAKE password. It is fixed by [`Server::start`], so this
    /// fails on a started server.
    pub fn set_psk(&mut self, psk: &[u8]) -> Result<(), Error> {
        if self.factory.is_some() {
            return Err(Error::InvalidState("server already started"));
        }
        if psk.len() > MAX_PASSWORD_LEN {
            return Err(Error::TooLarge {
                what: "psk",
                len: psk.len(),
                max: MAX_PASSWORD_LEN,
            });
        }
        if psk.is_empty() {
            return Err(Error::InvalidArgument("empty psk".into()));
        }
        self.psk = Some(Zeroizing::new(psk.to_vec()));
        Ok(())
    }

    /// Set the DRBG personalization used by [`Server::start`]. Fails on a
    /// started server.
    pub fn set_seed(&mut self, seed: &[u8]) -> Result<(), Error> {
        if self.factory.is_some() {
            return Err(Error::InvalidState("server already started"));
        }
        if seed.len() > MAX_SEED_LEN {
            return Err(Error::TooLarge {
                what: "seed",
                len: seed.len(),
                max: MAX_SEED_LEN,
            });
        }
        self.seed = seed.to_vec();
        Ok(())
    }

    pub fn set_state_handler(&mut self, handler: impl FnMut(&mut Session, SessionState) + 'static) {
        self.state_handler = Some(Box::new(handler));
    }

    /// Bind the listener and set up the cookie jar, DRBG and session cache.
    pub fn start(&mut self) -> Result<(), Error> {
        let psk = self
            .psk
            .as_ref()
            .ok_or(Error::InvalidState("psk not set"))?;
        let listener = net::bind_listener(self.port)?;
        self.port = listener.local_addr()?.port();

        let factory = SessionFactory::new(self.config.clone(), psk, &self.seed, Instant::now());
        self.factory = Some(Rc::new(factory));
        self.listener = Some(listener);
        info!("Server started on port {}", self.port);
        Ok(())
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().map(|e| &e.session)
    }

    /// The session talking to `peer`.
    pub fn session_mut(&mut self, peer: SocketAddr) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|e| e.session.peer() == peer)
            .map(|e| &mut e.session)
    }

    /// Evict dead sessions and register the live ones.
    ///
    /// The deadline in `ctx` is only ever moved earlier.
    pub fn update_fd_set(&mut self, ctx: &mut MainloopContext, now: Instant) {
        let mut handler = self.state_handler.take();

        self.sessions.retain_mut(|entry| {
            let session = &mut entry.session;
            if session.state().is_active() && session.is_expired(now) {
                debug!("Session {} expired", session.id());
                session.expire();
                if let Some(handler) = handler.as_mut() {
                    handler(session, SessionState::Expired);
                }
                return false;
            }
            if !session.state().is_active() {
                debug!("Session {} evicted in {:?}", session.id(), session.state());
                return false;
            }
            session.update_fd_set(ctx);
            true
        });

        self.state_handler = handler;

        if let Some(listener) = &self.listener {
            ctx.add_read_fd(listener.as_raw_fd());
        }
    }

    /// Service ready sessions first, then accept at most one new session.
    pub fn process(&mut self, readiness: &Readiness, now: Instant) {
        for entry in &mut self.sessions {
            let session = &mut entry.session;
            let readable = session.fd().is_some_and(|fd| readiness.is_readable(fd));
            let timer_due = session.dtls_timeout().is_some_and(|t| t <= now);
            if readable || timer_due {
                session.process(readiness, now);
            }
        }
        self.report_state_changes();

        let listener_ready = self
            .listener
            .as_ref()
            .is_some_and(|l| readiness.is_readable(l.as_raw_fd()));
        if listener_ready {
            self.accept(now);
            self.report_state_changes();
        }
    }

    fn accept(&mut self, now: Instant) {
        let Some(factory) = self.factory.clone() else {
            return;
        };
        let mut buf = mem::take(&mut self.buf);

        loop {
            let Some(listener) = &self.listener else {
                break;
            };

            let peeked = match net::peek_with_destination(listener, &mut buf) {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    warn!("Peek on listener failed: {}", e);
                    // Drop the datagram that caused it.
                    let _ = listener.recv_from(&mut buf);
                    break;
                }
            };

            let Some(local) = peeked.destination else {
                self.rebuild_listener();
                break;
            };

            let n = match listener.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Receive on listener failed: {}", e);
                    break;
                }
            };
            let datagram = &buf[..n];

            if let Some(entry) = self
                .sessions
                .iter_mut()
                .find(|e| e.session.peer() == peeked.source)
            {
                entry.session.receive(datagram, now);
                continue;
            }

            match factory.check_hello(peeked.source, datagram, now) {
                HelloCheck::Verified => {
                    match Session::accept(factory.clone(), local, peeked.source) {
                        Ok(mut session) => {
                            session.receive(datagram, now);
                            self.sessions.push(Entry {
                                session,
                                reported: SessionState::Handshaking,
                            });
                        }
                        Err(e) => warn!("Accept from {} failed: {}", peeked.source, e),
                    }
                    break;
                }
                HelloCheck::HelloVerifyRequest(hvr) => {
                    trace!("HelloVerifyRequest to {}", peeked.source);
                    if let Err(e) = listener.send_to(&hvr, peeked.source) {
                        debug!("HelloVerifyRequest to {} failed: {}", peeked.source, e);
                    }
                }
                HelloCheck::Drop => {
                    trace!("Dropped {} bytes from {}", n, peeked.source);
                }
            }
        }

        self.buf = buf;
    }

    /// The listener delivered a datagram without its destination. Such a
    /// socket cannot create reply sockets, so replace it. A server that
    /// cannot listen any more must not keep running.
    fn rebuild_listener(&mut self) {
        error!("No destination address on listener, rebuilding");
        self.listener = None;
        match net::bind_listener(self.port) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => {
                error!("Failed to rebuild listener on port {}: {}", self.port, e);
                std::process::abort();
            }
        }
    }

    fn report_state_changes(&mut self) {
        let Some(handler) = self.state_handler.as_mut() else {
            for entry in &mut self.sessions {
                entry.reported = entry.session.state();
            }
            return;
        };
        for entry in &mut self.sessions {
            let state = entry.session.state();
            if state != entry.reported {
                entry.reported = state;
                handler(&mut entry.session, state);
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
