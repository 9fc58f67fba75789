//! DTLS server terminating a joiner's handshake on behalf of the
//! commissioner.
//!
//! Joiner records reach us relayed: the Border Agent wraps them in RELAY_RX,
//! the commissioner unwraps and sends them from a local socket to this
//! server, and replies travel back the same way. Once the joiner finishes
//! with JOIN_FIN the KEK of this session is handed to the Border Agent so
//! it can protect the network key it entrusts to the joiner.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::coap::{Agent, Code, Event, Message};
use crate::dtls::Kek;
use crate::mainloop::{MainloopContext, Readiness};
use crate::meshcop::{uri, TlvType, WireState};
use crate::pskc::Pskd;
use crate::server::Server;
use crate::session::SessionState;
use crate::tlv::{TlvView, TlvWriter};
use crate::{Config, Error, SeededRng};

struct Shared {
    agent: Agent<()>,
    /// Peer of the session that reached Ready.
    peer: Option<SocketAddr>,
    kek: Option<Kek>,
    need_append_kek: bool,
}

pub struct JoinerSession {
    server: Server,
    shared: Rc<RefCell<Shared>>,
}

impl JoinerSession {
    /// Start listening on the configured joiner port with `pskd` as the
    /// J-PAKE password.
    pub fn new(config: Arc<Config>, pskd: &Pskd) -> Result<JoinerSession, Error> {
        let mut rng = SeededRng::with_personalization(config.rng_seed(), b"JoinerCoap");
        let mut agent = Agent::new(&config, &mut rng);
        agent.add_resource(uri::JOINER_FINALIZE);

        let shared = Rc::new(RefCell::new(Shared {
            agent,
            peer: None,
            kek: None,
            need_append_kek: false,
        }));

        let mut server = Server::new(config.clone(), config.joiner_port());
        server.set_psk(pskd.as_bytes())?;
        server.set_seed(b"JoinerSession")?;

        let handler_shared = shared.clone();
        server.set_state_handler(move |session, state| {
            debug!("Joiner session {} {:?}", session.id(), state);
            match state {
                SessionState::Ready => {
                    let mut shared = handler_shared.borrow_mut();
                    shared.kek = session.kek().cloned();
                    shared.peer = Some(session.peer());
                    shared.need_append_kek = false;

                    let data_shared = handler_shared.clone();
                    session.set_data_handler(move |data| {
                        if let Err(e) = data_shared.borrow_mut().agent.handle_input(data) {
                            debug!("Joiner CoAP input dropped: {}", e);
                        }
                    });
                }
                SessionState::Handshaking => {}
                _ => {
                    let mut shared = handler_shared.borrow_mut();
                    if shared.peer == Some(session.peer()) {
                        shared.peer = None;
                    }
                }
            }
        });

        server.start()?;
        info!("Joiner session listening on port {}", server.port());

        Ok(JoinerSession { server, shared })
    }

    /// Port the joiner DTLS server is bound to.
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// A JOIN_FIN was answered and the KEK has not been relayed yet.
    pub fn need_append_kek(&self) -> bool {
        self.shared.borrow().need_append_kek
    }

    pub fn mark_kek_sent(&mut self) {
        self.shared.borrow_mut().need_append_kek = false;
    }

    /// KEK of the joiner's DTLS session, once it is Ready.
    pub fn kek(&self) -> Option<Kek> {
        self.shared.borrow().kek.clone()
    }

    pub fn update_fd_set(&mut self, ctx: &mut MainloopContext, now: Instant) {
        self.server.update_fd_set(ctx, now);
        if let Some(t) = self.shared.borrow().agent.poll_timeout() {
            ctx.tighten_deadline(t);
        }
    }

    pub fn process(&mut self, readiness: &Readiness, now: Instant) {
        self.server.process(readiness, now);

        self.shared.borrow_mut().agent.handle_timeout(now);
        loop {
            let event = self.shared.borrow_mut().agent.poll_event();
            let Some(event) = event else {
                break;
            };
            match event {
                Event::Request(request) => self.handle_request(&request),
                Event::Response { .. } | Event::Failed { .. } => {}
            }
        }

        self.flush();
    }

    fn handle_request(&mut self, request: &Message) {
        if request.path() != uri::JOINER_FINALIZE {
            return;
        }
        self.handle_joiner_finalize(request);
    }

    /// JOIN_FIN.req: accept the joiner and arm the KEK for the next relay.
    fn handle_joiner_finalize(&mut self, request: &Message) {
        info!("JOIN_FIN.req: received");
        for tlv in TlvView::new(&request.payload) {
            match tlv {
                Ok(tlv) if TlvType::from_u8(tlv.tlv_type()) == TlvType::State => {
                    debug!("JOIN_FIN.req: state={:?}", tlv.value_i8().ok());
                }
                Ok(tlv) => trace!("JOIN_FIN.req: tlv type {}", tlv.tlv_type()),
                Err(e) => {
                    debug!("JOIN_FIN.req: {}", e);
                    break;
                }
            }
        }

        let mut payload = TlvWriter::with_capacity(8);
        let appended = payload.append_i8(TlvType::State.as_u8(), WireState::Accepted.as_i8());

        let mut shared = self.shared.borrow_mut();
        match appended {
            Ok(()) => {
                shared.need_append_kek = true;
                shared
                    .agent
                    .respond(request, Code::Changed, payload.as_slice());
                info!("JOIN_FIN.rsp: accepted");
            }
            Err(e) => {
                warn!("JOIN_FIN.rsp: {}", e);
                shared.agent.respond(request, Code::InternalServerError, &[]);
            }
        }
    }

    /// Send CoAP output over the Ready session.
    fn flush(&mut self) {
        loop {
            let (peer, datagram) = {
                let mut shared = self.shared.borrow_mut();
                let Some(datagram) = shared.agent.poll_transmit() else {
                    return;
                };
                (shared.peer, datagram)
            };

            let Some(session) = peer.and_then(|p| self.server.session_mut(p)) else {
                debug!("Joiner CoAP output without session, dropped");
                continue;
            };
            if let Err(e) = session.write(&datagram) {
                warn!("Joiner session {} write failed: {}", session.id(), e);
            }
        }
    }
}

impl std::fmt::Debug for JoinerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinerSession")
            .field("port", &self.server.port())
            .field("need_append_kek", &self.need_append_kek())
            .finish()
    }
}
