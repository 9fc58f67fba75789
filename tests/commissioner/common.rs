//! A fake Border Agent and a sans-IO joiner around a real commissioner.

#![allow(unused)]

use std::cell::RefCell;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcop::coap::{Agent, Code, Event, Message, MessageType};
use meshcop::mainloop::{Mainloop, MainloopContext};
use meshcop::meshcop::{uri, TlvType, WireState};
use meshcop::tlv::{TlvView, TlvWriter};
use meshcop::{Commissioner, Config, Dtls, Kek, Output, Pskc, SeededRng, Server, SessionState};

pub const SESSION_ID: u16 = 0x1234;
pub const PSKD: &str = "J01NME";
pub const JOINER_IID: [u8; 8] = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
pub const JOINER_PORT: u16 = 49153;
pub const ROUTER_LOCATOR: u16 = 0x0400;

/// Rounds of [`Harness::step`] before a test gives up waiting.
pub const MAX_ROUNDS: usize = 1500;

pub fn pskc() -> Pskc {
    Pskc::derive("123456", &[0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22, 0x22], "OpenThread").unwrap()
}

pub fn config() -> meshcop::ConfigBuilder {
    Config::builder()
        .rng_seed(21)
        .joiner_port(0)
        .keep_alive_interval(Duration::ZERO)
        .petition_retry_delay(Duration::from_millis(20))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Requests the Border Agent has seen.
#[derive(Debug, Default)]
pub struct Seen {
    pub petitions: usize,
    pub steering: Vec<Vec<u8>>,
    pub keep_alives: Vec<i8>,
    pub relayed: usize,
    pub keks: Vec<Vec<u8>>,
    /// Unwrapped RELAY_TX records not yet handed to the joiner.
    pub to_joiner: Vec<Vec<u8>>,
}

struct Shared {
    agent: Agent<()>,
    peer: Option<SocketAddr>,
}

pub struct BorderAgent {
    server: Server,
    shared: Rc<RefCell<Shared>>,
    pub verdict: Verdict,
    pub seen: Seen,
}

impl BorderAgent {
    pub fn new(config: Arc<Config>, pskc: &Pskc, verdict: Verdict) -> BorderAgent {
        let mut rng = SeededRng::new(Some(77));
        let mut agent = Agent::new(&config, &mut rng);
        for path in [
            uri::PETITION,
            uri::COMMISSIONER_SET,
            uri::KEEP_ALIVE,
            uri::RELAY_TX,
        ] {
            agent.add_resource(path);
        }
        let shared = Rc::new(RefCell::new(Shared { agent, peer: None }));

        let mut server = Server::new(config, 0);
        server.set_psk(pskc.as_bytes()).unwrap();
        server.set_seed(b"BorderAgent").unwrap();

        let handler_shared = shared.clone();
        server.set_state_handler(move |session, state| {
            if state == SessionState::Ready {
                handler_shared.borrow_mut().peer = Some(session.peer());
                let data_shared = handler_shared.clone();
                session.set_data_handler(move |data| {
                    let _ = data_shared.borrow_mut().agent.handle_input(data);
                });
            }
        });
        server.start().unwrap();

        BorderAgent {
            server,
            shared,
            verdict,
            seen: Seen::default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn update_fd_set(&mut self, ctx: &mut MainloopContext, now: Instant) {
        self.server.update_fd_set(ctx, now);
        if let Some(t) = self.shared.borrow().agent.poll_timeout() {
            ctx.tighten_deadline(t);
        }
    }

    pub fn process(&mut self, readiness: &meshcop::mainloop::Readiness, now: Instant) {
        self.server.process(readiness, now);
        self.shared.borrow_mut().agent.handle_timeout(now);
        loop {
            let event = self.shared.borrow_mut().agent.poll_event();
            let Some(event) = event else {
                break;
            };
            if let Event::Request(request) = event {
                self.handle_request(&request);
            }
        }
        self.flush();
    }

    /// Wrap a joiner record in RELAY_RX towards the commissioner.
    pub fn relay_rx(&mut self, record: &[u8], now: Instant) {
        let mut payload = TlvWriter::with_capacity(1500);
        payload
            .append(TlvType::JoinerDtlsEncapsulation.as_u8(), record)
            .unwrap();
        payload
            .append_u16(TlvType::JoinerUdpPort.as_u8(), JOINER_PORT)
            .unwrap();
        payload
            .append(TlvType::JoinerIid.as_u8(), &JOINER_IID)
            .unwrap();
        payload
            .append_u16(TlvType::JoinerRouterLocator.as_u8(), ROUTER_LOCATOR)
            .unwrap();

        let mut shared = self.shared.borrow_mut();
        let message =
            shared
                .agent
                .new_post(MessageType::NonConfirmable, uri::RELAY_RX, payload.as_slice());
        shared.agent.send(message, None, now);
        drop(shared);
        self.flush();
    }

    fn handle_request(&mut self, request: &Message) {
        let tlvs = TlvView::new(&request.payload);
        let mut reply = TlvWriter::with_capacity(64);

        match request.path().as_str() {
            uri::PETITION => {
                self.seen.petitions += 1;
                match self.verdict {
                    Verdict::Accept => {
                        reply
                            .append_i8(TlvType::State.as_u8(), WireState::Accepted.as_i8())
                            .unwrap();
                        reply
                            .append_u16(TlvType::CommissionerSessionId.as_u8(), SESSION_ID)
                            .unwrap();
                    }
                    Verdict::Reject => {
                        reply
                            .append_i8(TlvType::State.as_u8(), WireState::Rejected.as_i8())
                            .unwrap();
                    }
                }
            }
            uri::COMMISSIONER_SET => {
                if let Ok(Some(steering)) = tlvs.find(TlvType::SteeringData.as_u8()) {
                    self.seen.steering.push(steering.value().to_vec());
                }
                reply
                    .append_i8(TlvType::State.as_u8(), WireState::Accepted.as_i8())
                    .unwrap();
            }
            uri::KEEP_ALIVE => {
                let state = tlvs
                    .find(TlvType::State.as_u8())
                    .ok()
                    .flatten()
                    .and_then(|t| t.value_i8().ok())
                    .unwrap_or(0);
                self.seen.keep_alives.push(state);
                reply.append_i8(TlvType::State.as_u8(), state).unwrap();
            }
            uri::RELAY_TX => {
                self.seen.relayed += 1;
                if let Ok(Some(record)) = tlvs.find(TlvType::JoinerDtlsEncapsulation.as_u8()) {
                    self.seen.to_joiner.push(record.value().to_vec());
                }
                if let Ok(Some(kek)) = tlvs.find(TlvType::JoinerRouterKek.as_u8()) {
                    self.seen.keks.push(kek.value().to_vec());
                }
            }
            _ => {}
        }

        if request.msg_type == MessageType::Confirmable {
            self.shared
                .borrow_mut()
                .agent
                .respond(request, Code::Changed, reply.as_slice());
        }
    }

    fn flush(&mut self) {
        loop {
            let (peer, datagram) = {
                let mut shared = self.shared.borrow_mut();
                let Some(datagram) = shared.agent.poll_transmit() else {
                    return;
                };
                (shared.peer, datagram)
            };
            if let Some(session) = peer.and_then(|p| self.server.session_mut(p)) {
                session.write(&datagram).unwrap();
            }
        }
    }
}

/// Joiner driven without sockets: its records travel through the
/// Border Agent's relay.
pub struct Joiner {
    dtls: Dtls,
    agent: Agent<()>,
    buf: Vec<u8>,
    pub connected: bool,
    pub kek: Option<Kek>,
    pub finalized: Option<Vec<u8>>,
}

impl Joiner {
    pub fn new(pskd: &str) -> Joiner {
        let config = Arc::new(Config::builder().rng_seed(5).build().unwrap());
        let mut rng = SeededRng::new(Some(6));
        Joiner {
            dtls: Dtls::new_client(config.clone(), pskd.as_bytes()).unwrap(),
            agent: Agent::new(&config, &mut rng),
            buf: vec![0; 2048],
            connected: false,
            kek: None,
            finalized: None,
        }
    }

    /// Feed relayed records, advance timers, return records to relay.
    pub fn drive(&mut self, inbound: Vec<Vec<u8>>, now: Instant) -> Vec<Vec<u8>> {
        for record in &inbound {
            let _ = self.dtls.handle_packet(record);
        }
        let _ = self.dtls.handle_timeout(now);
        self.agent.handle_timeout(now);

        let mut out = Vec::new();
        let was_connected = self.connected;
        self.drain(&mut out);

        if self.connected && !was_connected {
            let mut payload = TlvWriter::with_capacity(8);
            payload
                .append_i8(TlvType::State.as_u8(), WireState::Accepted.as_i8())
                .unwrap();
            let message = self.agent.new_post(
                MessageType::Confirmable,
                uri::JOINER_FINALIZE,
                payload.as_slice(),
            );
            self.agent.send(message, Some(()), now);
        }

        while let Some(datagram) = self.agent.poll_transmit() {
            self.dtls.send_application_data(&datagram).unwrap();
        }
        self.drain(&mut out);

        while let Some(event) = self.agent.poll_event() {
            if let Event::Response { response, .. } = event {
                self.finalized = Some(response.payload.clone());
            }
        }
        out
    }

    fn drain(&mut self, out: &mut Vec<Vec<u8>>) {
        loop {
            match self.dtls.poll_output(&mut self.buf) {
                Output::Packet(p) => out.push(p.to_vec()),
                Output::Connected => self.connected = true,
                Output::KeyingMaterial(k) => self.kek = Some(k),
                Output::ApplicationData(d) => {
                    let _ = self.agent.handle_input(d);
                }
                Output::PeerClosed => {}
                Output::BufferTooSmall { needed } => panic!("joiner buffer too small for {}", needed),
                Output::Timeout(_) => break,
            }
        }
    }
}

pub struct Harness {
    pub mainloop: Mainloop,
    pub commissioner: Commissioner,
    pub ba: BorderAgent,
    pub joiner: Option<Joiner>,
    rounds: usize,
}

impl Harness {
    pub fn new(config: Config, verdict: Verdict) -> Harness {
        let _ = env_logger::try_init();
        let config = Arc::new(config);
        let ba = BorderAgent::new(config.clone(), &pskc(), verdict);
        let commissioner = Commissioner::new(config, pskc()).unwrap();
        Harness {
            mainloop: Mainloop::new().unwrap(),
            commissioner,
            ba,
            joiner: None,
            rounds: 0,
        }
    }

    /// DTLS to the Border Agent, then petition.
    pub fn connect_and_petition(&mut self) {
        let port = self.ba.port();
        self.commissioner.init_dtls("::1", port).unwrap();
        while !self.commissioner.try_dtls_handshake(Instant::now()).unwrap() {
            self.step();
        }
        self.commissioner.petition(Instant::now()).unwrap();
    }

    pub fn step(&mut self) {
        self.rounds += 1;
        assert!(self.rounds < MAX_ROUNDS, "gave up waiting");

        let now = Instant::now();
        let mut ctx = MainloopContext::new(now + Duration::from_millis(20));
        self.commissioner.update_fd_set(&mut ctx, now);
        self.ba.update_fd_set(&mut ctx, now);
        let readiness = self.mainloop.wait(&ctx).unwrap();

        let now = Instant::now();
        self.commissioner.process(&readiness, now);
        self.ba.process(&readiness, now);

        if let Some(joiner) = &mut self.joiner {
            let inbound = mem::take(&mut self.ba.seen.to_joiner);
            for record in joiner.drive(inbound, now) {
                self.ba.relay_rx(&record, now);
            }
        }
    }

    pub fn run_until(&mut self, mut done: impl FnMut(&Harness) -> bool) {
        while !done(self) {
            self.step();
        }
    }
}
