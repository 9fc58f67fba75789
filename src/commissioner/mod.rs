//! Commissioner: petitions a Border Agent for the commissioner role and
//! relays joiner handshakes.
//!
//! ```text
//!   Invalid --dtls--> Connected --c/cp--> Accepted --c/cs--> Ready
//!                                    \--> Rejected (petition retried)
//! ```
//!
//! The Border Agent is reached over a DTLS client [`Session`] keyed with
//! the PSKc. CoAP runs on top of it. Joiner DTLS records arrive wrapped in
//! RELAY_RX, are handed to the [`JoinerSession`] through a local UDP socket,
//! and its answers go back wrapped in RELAY_TX.

use std::cell::RefCell;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

mod joiner_session;

pub use joiner_session::JoinerSession;

use crate::coap::{Agent, Code, Event, Message, MessageType};
use crate::mainloop::{MainloopContext, Readiness};
use crate::meshcop::{uri, TlvType, WireState, EUI64_LEN};
use crate::net;
use crate::pskc::{Pskc, Pskd};
use crate::session::{Session, SessionState};
use crate::steering::SteeringData;
use crate::tlv::{TlvView, TlvWriter};
use crate::{Config, Error, SeededRng};

/// The commissioner's own view of its role.
///
/// Distinct from [`WireState`], the value carried in State TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionerState {
    /// Not connected, or given up.
    Invalid,
    /// DTLS session to the Border Agent is up.
    Connected,
    /// Petition refused. Retried a bounded number of times.
    Rejected,
    /// Petition granted.
    Accepted,
    /// Steering data accepted by the Border Agent.
    Ready,
}

impl CommissionerState {
    /// State TLV value reporting this state in a keep-alive.
    pub fn to_wire(&self) -> WireState {
        match self {
            CommissionerState::Accepted | CommissionerState::Ready => WireState::Accepted,
            CommissionerState::Rejected => WireState::Rejected,
            CommissionerState::Invalid | CommissionerState::Connected => WireState::Pending,
        }
    }
}

/// Which exchange a CoAP response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Petition,
    Set,
    KeepAlive,
}

/// Joiner identity TLVs from the last RELAY_RX, echoed in RELAY_TX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPeer {
    pub udp_port: u16,
    pub iid: [u8; EUI64_LEN],
    pub router_locator: u16,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub petitions: usize,
    pub keep_alive_tx: usize,
    pub keep_alive_rx: usize,
    pub relay_rx: usize,
    pub relay_tx: usize,
    pub finalized_joiners: usize,
}

pub struct Commissioner {
    config: Arc<Config>,
    pskc: Pskc,
    state: CommissionerState,
    session: Option<Session>,
    agent: Rc<RefCell<Agent<Request>>>,

    session_id: Option<u16>,
    petition_retries: usize,
    petition_retry_at: Option<Instant>,
    last_keep_alive: Instant,

    joiner_session: Option<JoinerSession>,
    /// Exchanges raw joiner records with the joiner session.
    joiner_socket: Option<UdpSocket>,
    relay_peer: Option<RelayPeer>,

    stats: Stats,
    buf: Vec<u8>,
}

impl Commissioner {
    pub fn new(config: Arc<Config>, pskc: Pskc) -> Result<Commissioner, Error> {
        let mut rng = SeededRng::with_personalization(config.rng_seed(), b"Commissioner");
        let mut agent = Agent::new(&config, &mut rng);
        agent.add_resource(uri::RELAY_RX);

        let joiner_socket = match config.joiner_port() {
            0 => None,
            port => Some(joiner_socket(port)?),
        };

        let buf = vec![0; config.max_packet_size()];
        Ok(Commissioner {
            config,
            pskc,
            state: CommissionerState::Invalid,
            session: None,
            agent: Rc::new(RefCell::new(agent)),
            session_id: None,
            petition_retries: 0,
            petition_retry_at: None,
            last_keep_alive: Instant::now(),
            joiner_session: None,
            joiner_socket,
            relay_peer: None,
            stats: Stats::default(),
            buf,
        })
    }

    pub fn state(&self) -> CommissionerState {
        self.state
    }

    /// Not given up yet.
    pub fn is_valid(&self) -> bool {
        self.state != CommissionerState::Invalid
    }

    /// Petition granted, with or without steering data set.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self.state,
            CommissionerState::Accepted | CommissionerState::Ready
        )
    }

    pub fn session_id(&self) -> Option<u16> {
        self.session_id
    }

    pub fn relay_peer(&self) -> Option<RelayPeer> {
        self.relay_peer
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn joiner_session(&self) -> Option<&JoinerSession> {
        self.joiner_session.as_ref()
    }

    /// Set up the DTLS client towards the Border Agent at `host:port`.
    pub fn init_dtls(&mut self, host: &str, port: u16) -> Result<(), Error> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("cannot resolve {}", host)))?;
        info!("Connecting to Border Agent {}", addr);

        let mut session = Session::connect(self.config.clone(), self.pskc.as_bytes(), addr)?;
        let agent = self.agent.clone();
        session.set_data_handler(move |data| {
            if let Err(e) = agent.borrow_mut().handle_input(data) {
                debug!("CoAP input dropped: {}", e);
            }
        });
        self.session = Some(session);
        Ok(())
    }

    /// Advance the handshake without blocking.
    ///
    /// `Ok(true)` once connected, `Ok(false)` while in progress. A failed
    /// handshake moves the commissioner to Invalid.
    pub fn try_dtls_handshake(&mut self, now: Instant) -> Result<bool, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or(Error::InvalidState("dtls not initialized"))?;

        if session.state() == SessionState::Handshaking {
            let readiness = session
                .fd()
                .map(|fd| Readiness::all_readable(&[fd]))
                .unwrap_or_default();
            session.process(&readiness, now);
        }

        match session.state() {
            SessionState::Handshaking => Ok(false),
            SessionState::Ready => {
                if self.state == CommissionerState::Invalid {
                    self.set_state(CommissionerState::Connected);
                }
                Ok(true)
            }
            _ => {
                self.set_state(CommissionerState::Invalid);
                Err(Error::InvalidState("dtls handshake failed"))
            }
        }
    }

    /// COMM_PET.req with our commissioner id.
    pub fn petition(&mut self, now: Instant) -> Result<(), Error> {
        if !self.is_session_ready() {
            return Err(Error::InvalidState("not connected"));
        }
        info!("COMM_PET.req: start");

        let mut payload = TlvWriter::with_capacity(self.config.max_packet_size());
        payload.append(
            TlvType::CommissionerId.as_u8(),
            self.config.commissioner_id().as_bytes(),
        )?;

        self.stats.petitions += 1;
        self.petition_retry_at = None;
        self.send_request(Request::Petition, uri::PETITION, payload.as_slice(), now)?;
        info!("COMM_PET.req: sent");
        Ok(())
    }

    /// MGMT_COMMISSIONER_SET.req with our session id and `steering`.
    pub fn commissioner_set(&mut self, steering: &SteeringData, now: Instant) -> Result<(), Error> {
        let session_id = self
            .session_id
            .ok_or(Error::InvalidState("no commissioner session id"))?;
        info!("COMMISSIONER_SET.req: session-id={}", session_id);

        let mut payload = TlvWriter::with_capacity(self.config.max_packet_size());
        payload.append_u16(TlvType::CommissionerSessionId.as_u8(), session_id)?;
        payload.append(TlvType::SteeringData.as_u8(), steering.as_bytes())?;

        self.send_request(Request::Set, uri::COMMISSIONER_SET, payload.as_slice(), now)?;
        info!("COMMISSIONER_SET.req: sent");
        Ok(())
    }

    /// Replace the joiner session with one keyed by `pskd` and publish
    /// `steering` for it.
    pub fn set_joiner(
        &mut self,
        pskd: &Pskd,
        steering: &SteeringData,
        now: Instant,
    ) -> Result<(), Error> {
        // The old session must release the port first.
        self.joiner_session = None;
        let joiner_session = JoinerSession::new(self.config.clone(), pskd)?;
        self.joiner_socket = Some(joiner_socket(joiner_session.port())?);
        self.joiner_session = Some(joiner_session);

        self.commissioner_set(steering, now)
    }

    pub fn update_fd_set(&mut self, ctx: &mut MainloopContext, now: Instant) {
        if let Some(session) = &self.session {
            session.update_fd_set(ctx);
        }
        if let Some(socket) = &self.joiner_socket {
            ctx.add_read_fd(socket.as_raw_fd());
        }
        if let Some(joiner_session) = &mut self.joiner_session {
            joiner_session.update_fd_set(ctx, now);
        }
        if let Some(t) = self.agent.borrow().poll_timeout() {
            ctx.tighten_deadline(t);
        }
        if let Some(t) = self.petition_retry_at {
            ctx.tighten_deadline(t);
        }
        if let Some(t) = self.next_keep_alive() {
            ctx.tighten_deadline(t);
        }
    }

    pub fn process(&mut self, readiness: &Readiness, now: Instant) {
        if let Some(joiner_session) = &mut self.joiner_session {
            joiner_session.process(readiness, now);
        }

        if let Some(session) = &mut self.session {
            let readable = session.fd().is_some_and(|fd| readiness.is_readable(fd));
            let timer_due = session.dtls_timeout().is_some_and(|t| t <= now);
            if readable || timer_due {
                session.process(readiness, now);
            }
            if !session.state().is_active() && self.state != CommissionerState::Invalid {
                warn!("Border Agent session lost in {:?}", session.state());
                self.set_state(CommissionerState::Invalid);
            }
        }

        self.agent.borrow_mut().handle_timeout(now);
        self.handle_coap_events(now);

        let joiner_readable = self
            .joiner_socket
            .as_ref()
            .is_some_and(|s| readiness.is_readable(s.as_raw_fd()));
        if joiner_readable {
            self.read_joiner_socket(now);
        }

        if self.petition_retry_at.is_some_and(|t| t <= now) {
            if let Err(e) = self.petition(now) {
                warn!("COMM_PET.req: retry failed: {}", e);
            }
        }

        if self.next_keep_alive().is_some_and(|t| t <= now) {
            if let Err(e) = self.send_keep_alive(WireState::Accepted, now) {
                warn!("COMM_KA.req: {}", e);
            }
        }

        self.flush();
    }

    fn next_keep_alive(&self) -> Option<Instant> {
        let interval = self.config.keep_alive_interval();
        if interval.is_zero() || !self.is_accepted() {
            return None;
        }
        Some(self.last_keep_alive + interval)
    }

    /// Leave the commissioner role. Sends a keep-alive carrying Rejected
    /// when the petition had been granted.
    pub fn resign(&mut self, now: Instant) {
        if !self.is_accepted() {
            return;
        }
        info!("Resigning commissioner role");
        if let Err(e) = self.send_keep_alive(WireState::Rejected, now) {
            debug!("COMM_KA.req: resign not sent: {}", e);
        }
        self.flush();
    }

    fn send_keep_alive(&mut self, state: WireState, now: Instant) -> Result<(), Error> {
        let session_id = self
            .session_id
            .ok_or(Error::InvalidState("no commissioner session id"))?;

        let mut payload = TlvWriter::with_capacity(self.config.max_packet_size());
        payload.append_i8(TlvType::State.as_u8(), state.as_i8())?;
        payload.append_u16(TlvType::CommissionerSessionId.as_u8(), session_id)?;

        self.last_keep_alive = now;
        self.stats.keep_alive_tx += 1;
        info!("COMM_KA.req: send state={:?}", state);
        self.send_request(Request::KeepAlive, uri::KEEP_ALIVE, payload.as_slice(), now)
    }

    fn send_request(
        &mut self,
        request: Request,
        path: &str,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let mut agent = self.agent.borrow_mut();
        let message = agent.new_post(MessageType::Confirmable, path, payload);
        agent.send(message, Some(request), now);
        Ok(())
    }

    fn handle_coap_events(&mut self, now: Instant) {
        loop {
            let event = self.agent.borrow_mut().poll_event();
            let Some(event) = event else {
                break;
            };
            match event {
                Event::Response { tag, response } => match tag {
                    Request::Petition => self.handle_petition_response(&response, now),
                    Request::Set => self.handle_set_response(&response, now),
                    Request::KeepAlive => self.handle_keep_alive_response(&response, now),
                },
                Event::Failed { tag } => {
                    // State is left alone, the next exchange shows staleness.
                    warn!("{:?} got no response", tag);
                }
                Event::Request(request) => self.handle_request(&request),
            }
        }
    }

    fn handle_request(&mut self, request: &Message) {
        let result = match request.path().as_str() {
            uri::RELAY_RX => self.handle_relay_receive(&request.payload),
            other => {
                debug!("No handler for {}", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("RELAY_RX: {}", e);
        }
        // RELAY_RX is non-confirmable. Answer anything else that insists.
        if request.msg_type == MessageType::Confirmable {
            self.agent.borrow_mut().respond(request, Code::Changed, &[]);
        }
    }

    fn handle_petition_response(&mut self, response: &Message, now: Instant) {
        info!("COMM_PET.rsp: start");
        let parsed = parse_response("COMM_PET.rsp", response);

        let new_state = match (parsed.state, parsed.session_id) {
            (Some(WireState::Accepted), Some(id)) => {
                self.session_id = Some(id);
                CommissionerState::Accepted
            }
            (Some(WireState::Accepted), None) => {
                warn!("COMM_PET.rsp: accepted without session id");
                CommissionerState::Invalid
            }
            (Some(WireState::Rejected), id) => {
                if id.is_some() {
                    self.session_id = id;
                }
                CommissionerState::Rejected
            }
            _ => CommissionerState::Invalid,
        };
        self.set_state(new_state);
        if new_state == CommissionerState::Accepted {
            self.petition_retries = 0;
        }

        self.last_keep_alive = now;
        info!("COMM_PET.rsp: complete");
        self.response_next(now);
    }

    fn handle_set_response(&mut self, response: &Message, now: Instant) {
        info!("COMMISSIONER_SET.rsp: start");
        let parsed = parse_response("COMMISSIONER_SET.rsp", response);

        if let Some(id) = parsed.session_id {
            self.session_id = Some(id);
        }
        match parsed.state {
            Some(WireState::Accepted) if self.state == CommissionerState::Accepted => {
                self.set_state(CommissionerState::Ready);
            }
            Some(WireState::Accepted) => {}
            other => warn!("COMMISSIONER_SET.rsp: not accepted: {:?}", other),
        }
        info!("COMMISSIONER_SET.rsp: complete");
        self.response_next(now);
    }

    fn handle_keep_alive_response(&mut self, response: &Message, now: Instant) {
        info!("COMM_KA.rsp: start");
        self.stats.keep_alive_rx += 1;
        self.last_keep_alive = now;

        let parsed = parse_response("COMM_KA.rsp", response);
        let new_state = match parsed.state {
            Some(WireState::Accepted) if self.state == CommissionerState::Ready => {
                CommissionerState::Ready
            }
            Some(WireState::Accepted) => CommissionerState::Accepted,
            Some(WireState::Rejected) => CommissionerState::Rejected,
            _ => CommissionerState::Invalid,
        };
        self.set_state(new_state);
        info!("COMM_KA.rsp: complete");
        self.response_next(now);
    }

    /// Retry the petition after a rejection, up to `petition_max_retry`
    /// times, then give up.
    fn response_next(&mut self, now: Instant) {
        if !matches!(
            self.state,
            CommissionerState::Connected | CommissionerState::Rejected
        ) {
            return;
        }
        if self.petition_retries < self.config.petition_max_retry() {
            self.petition_retries += 1;
            let at = now + self.config.petition_retry_delay();
            info!(
                "COMM_PET.req: retry {} of {}",
                self.petition_retries,
                self.config.petition_max_retry()
            );
            self.petition_retry_at = Some(at);
        } else {
            warn!("COMM_PET.req: giving up");
            self.set_state(CommissionerState::Invalid);
            self.petition_retries = 0;
            self.petition_retry_at = None;
        }
    }

    /// RELAY_RX: forward the joiner's record to the joiner session and
    /// remember where it came from.
    pub fn handle_relay_receive(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.stats.relay_rx += 1;

        let mut encapsulated = None;
        let mut udp_port = None;
        let mut iid = None;
        let mut router_locator = None;

        for tlv in TlvView::new(payload) {
            let tlv = tlv?;
            match TlvType::from_u8(tlv.tlv_type()) {
                TlvType::JoinerDtlsEncapsulation => encapsulated = Some(tlv.value()),
                TlvType::JoinerUdpPort => {
                    let port = tlv.value_u16()?;
                    debug!("RELAY_RX: joiner port {}", port);
                    udp_port = Some(port);
                }
                TlvType::JoinerIid => {
                    let value: [u8; EUI64_LEN] = tlv
                        .value()
                        .try_into()
                        .map_err(|_| Error::Tlv(tlv.tlv_type()))?;
                    iid = Some(value);
                }
                TlvType::JoinerRouterLocator => {
                    let rloc = tlv.value_u16()?;
                    debug!("RELAY_RX: router locator {:#06x}", rloc);
                    router_locator = Some(rloc);
                }
                other => trace!("RELAY_RX: skip tlv {:?}", other),
            }
        }

        if let (Some(udp_port), Some(iid), Some(router_locator)) = (udp_port, iid, router_locator) {
            self.relay_peer = Some(RelayPeer {
                udp_port,
                iid,
                router_locator,
            });
        }

        if let Some(record) = encapsulated {
            let socket = self
                .joiner_socket
                .as_ref()
                .ok_or(Error::InvalidState("no joiner socket"))?;
            match socket.send(record) {
                Ok(n) => trace!("RELAY_RX: forwarded {} bytes", n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("RELAY_RX: joiner socket busy, dropped");
                }
                Err(e) => {
                    error!("RELAY_RX: send to joiner session failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn read_joiner_socket(&mut self, now: Instant) {
        let mut buf = std::mem::take(&mut self.buf);
        loop {
            let Some(socket) = &self.joiner_socket else {
                break;
            };
            match socket.recv(&mut buf) {
                Ok(n) => {
                    trace!("Relay {} bytes from joiner session", n);
                    if let Err(e) = self.send_relay_transmit(&buf[..n], now) {
                        warn!("RELAY_TX: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Joiner socket: {}", e);
                    break;
                }
            }
        }
        self.buf = buf;
    }

    /// RELAY_TX: wrap a record from the joiner session for the Border Agent.
    pub fn send_relay_transmit(&mut self, record: &[u8], now: Instant) -> Result<(), Error> {
        let payload = self.relay_transmit_payload(record)?;
        let mut agent = self.agent.borrow_mut();
        let message = agent.new_post(MessageType::NonConfirmable, uri::RELAY_TX, &payload);
        agent.send(message, None, now);
        self.stats.relay_tx += 1;
        info!("RELAY_TX.req: send");
        Ok(())
    }

    /// The KEK is attached to the first relay after JOIN_FIN and never again.
    fn relay_transmit_payload(&mut self, record: &[u8]) -> Result<Vec<u8>, Error> {
        let peer = self
            .relay_peer
            .ok_or(Error::InvalidState("no joiner to relay to"))?;

        let mut payload = TlvWriter::with_capacity(self.config.max_packet_size());
        payload.append(TlvType::JoinerDtlsEncapsulation.as_u8(), record)?;
        payload.append_u16(TlvType::JoinerUdpPort.as_u8(), peer.udp_port)?;
        payload.append(TlvType::JoinerIid.as_u8(), &peer.iid)?;
        payload.append_u16(TlvType::JoinerRouterLocator.as_u8(), peer.router_locator)?;

        if let Some(joiner_session) = &mut self.joiner_session {
            if joiner_session.need_append_kek() {
                let kek = joiner_session
                    .kek()
                    .ok_or(Error::InvalidState("joiner finalized without kek"))?;
                payload.append(TlvType::JoinerRouterKek.as_u8(), kek.as_bytes())?;
                joiner_session.mark_kek_sent();
                self.stats.finalized_joiners += 1;
                info!("RELAY_TX.req: KEK attached");
            }
        }

        Ok(payload.into_vec())
    }

    /// Push CoAP output into the Border Agent session.
    fn flush(&mut self) {
        loop {
            let datagram = self.agent.borrow_mut().poll_transmit();
            let Some(datagram) = datagram else {
                break;
            };
            let Some(session) = &mut self.session else {
                debug!("CoAP output without session, dropped");
                continue;
            };
            if let Err(e) = session.write(&datagram) {
                warn!("Border Agent session write failed: {}", e);
                self.set_state(CommissionerState::Invalid);
            }
        }
    }

    fn is_session_ready(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Ready)
    }

    fn set_state(&mut self, state: CommissionerState) {
        if self.state != state {
            debug!("{:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

impl Drop for Commissioner {
    fn drop(&mut self) {
        self.resign(Instant::now());
    }
}

impl std::fmt::Debug for Commissioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commissioner")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Local socket talking to the joiner session on loopback.
fn joiner_socket(port: u16) -> Result<UdpSocket, Error> {
    Ok(net::connected_socket(SocketAddr::from((
        Ipv6Addr::LOCALHOST,
        port,
    )))?)
}

#[derive(Debug, Default)]
struct ParsedResponse {
    state: Option<WireState>,
    session_id: Option<u16>,
}

/// Pull State and CommissionerSessionId out of a response payload.
fn parse_response(what: &str, response: &Message) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    if !response.code.is_success() {
        warn!("{}: code {}", what, response.code);
    }
    for tlv in TlvView::new(&response.payload) {
        let tlv = match tlv {
            Ok(tlv) => tlv,
            Err(e) => {
                warn!("{}: {}", what, e);
                break;
            }
        };
        match TlvType::from_u8(tlv.tlv_type()) {
            TlvType::State => match tlv.value_i8() {
                Ok(v) => {
                    parsed.state = WireState::from_i8(v);
                    info!("{}: state={:?}", what, parsed.state);
                }
                Err(e) => warn!("{}: {}", what, e),
            },
            TlvType::CommissionerSessionId => match tlv.value_u16() {
                Ok(id) => {
                    parsed.session_id = Some(id);
                    info!("{}: session-id={}", what, id);
                }
                Err(e) => warn!("{}: {}", what, e),
            },
            other => debug!("{}: ignore tlv {:?}", what, other),
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn commissioner() -> Commissioner {
        let config = Arc::new(Config::builder().rng_seed(9).joiner_port(0).build().unwrap());
        Commissioner::new(config, Pskc::new([0x11; 16])).unwrap()
    }

    fn response(code: Code, payload: &[u8]) -> Message {
        let mut m = Message::new(MessageType::Acknowledgement, code, 1, &[1]).unwrap();
        m.set_payload(payload);
        m
    }

    #[test]
    fn local_and_wire_state_are_mapped() {
        assert_eq!(CommissionerState::Ready.to_wire(), WireState::Accepted);
        assert_eq!(CommissionerState::Rejected.to_wire(), WireState::Rejected);
        assert_eq!(CommissionerState::Connected.to_wire(), WireState::Pending);
    }

    #[test]
    fn petition_accepted_caches_session_id() {
        let mut c = commissioner();
        c.state = CommissionerState::Connected;
        let now = Instant::now();

        // State=Accepted, CommissionerSessionId=7
        c.handle_petition_response(&response(Code::Changed, &[16, 1, 1, 11, 2, 0, 7]), now);
        assert_eq!(c.state(), CommissionerState::Accepted);
        assert_eq!(c.session_id(), Some(7));
        assert!(c.petition_retry_at.is_none());
    }

    #[test]
    fn petition_accepted_without_session_id_is_invalid() {
        let mut c = commissioner();
        c.state = CommissionerState::Connected;
        c.handle_petition_response(&response(Code::Changed, &[16, 1, 1]), Instant::now());
        assert_eq!(c.state(), CommissionerState::Invalid);
    }

    #[test]
    fn rejected_petition_schedules_retry_then_gives_up() {
        let mut c = commissioner();
        c.state = CommissionerState::Connected;
        let now = Instant::now();
        let rejected = response(Code::Changed, &[16, 1, 0xFF]);

        for attempt in 1..=2 {
            c.handle_petition_response(&rejected, now);
            assert_eq!(c.state(), CommissionerState::Rejected);
            assert_eq!(c.petition_retries, attempt);
            assert_eq!(c.petition_retry_at, Some(now + Duration::from_secs(5)));
        }

        c.handle_petition_response(&rejected, now);
        assert_eq!(c.state(), CommissionerState::Invalid);
        assert_eq!(c.petition_retries, 0);
        assert!(c.petition_retry_at.is_none());
    }

    #[test]
    fn set_response_moves_accepted_to_ready() {
        let mut c = commissioner();
        c.state = CommissionerState::Accepted;
        c.handle_set_response(&response(Code::Changed, &[16, 1, 1]), Instant::now());
        assert_eq!(c.state(), CommissionerState::Ready);

        // Keep-alive acceptance keeps Ready.
        c.handle_keep_alive_response(&response(Code::Changed, &[16, 1, 1]), Instant::now());
        assert_eq!(c.state(), CommissionerState::Ready);
        assert_eq!(c.stats().keep_alive_rx, 1);
    }

    #[test]
    fn keep_alive_rejection_is_retried_as_petition() {
        let mut c = commissioner();
        c.state = CommissionerState::Ready;
        let now = Instant::now();
        c.handle_keep_alive_response(&response(Code::Changed, &[16, 1, 0xFF]), now);
        assert_eq!(c.state(), CommissionerState::Rejected);
        assert!(c.petition_retry_at.is_some());
    }

    #[test]
    fn relay_receive_caches_identity() {
        let mut c = commissioner();
        let payload = [
            18, 2, 0x16, 0x33, // JoinerUdpPort 5683
            19, 8, 1, 2, 3, 4, 5, 6, 7, 8, // JoinerIid
            20, 2, 0x34, 0x00, // JoinerRouterLocator
        ];
        c.handle_relay_receive(&payload).unwrap();
        assert_eq!(
            c.relay_peer(),
            Some(RelayPeer {
                udp_port: 5683,
                iid: [1, 2, 3, 4, 5, 6, 7, 8],
                router_locator: 0x3400,
            })
        );
        assert_eq!(c.stats().relay_rx, 1);
    }

    #[test]
    fn relay_receive_forwards_encapsulated_record() {
        let joiner = UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).unwrap();
        let port = joiner.local_addr().unwrap().port();
        let config = Arc::new(
            Config::builder()
                .rng_seed(9)
                .joiner_port(port)
                .build()
                .unwrap(),
        );
        let mut c = Commissioner::new(config, Pskc::new([0x11; 16])).unwrap();

        let mut payload = vec![17, 17];
        payload.extend_from_slice(&[0xA5; 17]);
        payload.extend_from_slice(&[18, 2, 0x16, 0x33]);
        payload.extend_from_slice(&[19, 8, 1, 2, 3, 4, 5, 6, 7, 8]);
        payload.extend_from_slice(&[20, 2, 0x34, 0x00]);
        c.handle_relay_receive(&payload).unwrap();

        let mut buf = [0u8; 64];
        joiner
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let n = joiner.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xA5; 17]);

        let peer = c.relay_peer().unwrap();
        let relayed = c.relay_transmit_payload(&[0x5A; 3]).unwrap();
        let view = TlvView::new(&relayed);
        let find = |t: TlvType| view.find(t.as_u8()).unwrap().unwrap().value().to_vec();
        assert_eq!(find(TlvType::JoinerDtlsEncapsulation), vec![0x5A; 3]);
        assert_eq!(find(TlvType::JoinerUdpPort), peer.udp_port.to_be_bytes().to_vec());
        assert_eq!(find(TlvType::JoinerIid), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(find(TlvType::JoinerRouterLocator), vec![0x34, 0x00]);
    }

    #[test]
    fn relay_receive_rejects_short_iid() {
        let mut c = commissioner();
        let payload = [19, 3, 1, 2, 3];
        assert!(matches!(
            c.handle_relay_receive(&payload),
            Err(Error::Tlv(19))
        ));
    }

    #[test]
    fn relay_without_joiner_session_carries_no_kek() {
        let mut c = commissioner();
        c.relay_peer = Some(RelayPeer {
            udp_port: 1000,
            iid: [0; 8],
            router_locator: 0x0400,
        });

        let payload = c.relay_transmit_payload(&[0xAA; 4]).unwrap();
        assert!(TlvView::new(&payload)
            .find(TlvType::JoinerRouterKek.as_u8())
            .unwrap()
            .is_none());
        assert_eq!(c.stats().finalized_joiners, 0);
    }

    #[test]
    fn relay_without_peer_fails() {
        let mut c = commissioner();
        assert!(c.relay_transmit_payload(&[1]).is_err());
    }
}
