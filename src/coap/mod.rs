//! CoAP transport adapter.
//!
//! [`Agent`] is sans-IO like the DTLS endpoints: datagrams go in through
//! [`Agent::handle_input`], time through [`Agent::handle_timeout`], and the
//! owner drains [`Agent::poll_transmit`] and [`Agent::poll_event`].
//!
//! Confirmable requests are retransmitted `coap_max_retransmit` times with
//! a fixed `coap_response_timeout` between attempts. Once the peer sends an
//! empty ACK the request waits up to `coap_exchange_lifetime` from its last
//! transmission for the separate response. Responses are matched
//! to requests by token. Each request carries a caller chosen tag that comes
//! back with its response, so the owner knows which exchange completed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

mod message;

pub use message::{option, Code, CoapOption, Message, MessageType, Token, MAX_TOKEN_LEN};

use crate::{Config, Error, SeededRng};

/// Requests we answered recently, replayed on duplicates.
const MAX_RECENT_RESPONSES: usize = 8;

/// Something the owner has to act on.
#[derive(Debug)]
pub enum Event<T> {
    /// Response to a request sent with [`Agent::send`].
    Response { tag: T, response: Message },
    /// No response after all retransmissions, or the peer reset.
    Failed { tag: T },
    /// Request for a registered resource. Answer with [`Agent::respond`].
    Request(Message),
}

#[derive(Debug)]
struct Pending<T> {
    tag: T,
    token: Token,
    message_id: u16,
    datagram: Vec<u8>,
    confirmable: bool,
    /// The peer acknowledged, the response will come separately.
    acked: bool,
    retransmits_left: usize,
    /// Last transmission.
    sent: Instant,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Agent<T> {
    response_timeout: Duration,
    max_retransmit: usize,
    exchange_lifetime: Duration,
    next_message_id: u16,
    next_token: u16,
    resources: Vec<String>,
    pending: Vec<Pending<T>>,
    recent: VecDeque<(u16, Vec<u8>)>,
    transmit: VecDeque<Vec<u8>>,
    events: VecDeque<Event<T>>,
}

impl<T> Agent<T> {
    pub fn new(config: &Config, rng: &mut SeededRng) -> Self {
        Agent {
            response_timeout: config.coap_response_timeout(),
            max_retransmit: config.coap_max_retransmit(),
            exchange_lifetime: config.coap_exchange_lifetime(),
            next_message_id: rng.random(),
            next_token: rng.random(),
            resources: Vec::new(),
            pending: Vec::new(),
            recent: VecDeque::new(),
            transmit: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Accept requests for `path`. Others are answered 4.04.
    pub fn add_resource(&mut self, path: &str) {
        if !self.resources.iter().any(|r| r == path) {
            self.resources.push(path.to_string());
        }
    }

    /// Message with a fresh message id and 2 byte token.
    pub fn new_message(&mut self, msg_type: MessageType, code: Code) -> Message {
        let message_id = self.next_message_id();
        self.next_token = self.next_token.wrapping_add(1);
        let mut m = Message::empty(msg_type, message_id);
        m.code = code;
        m.token.extend_from_slice(&self.next_token.to_be_bytes());
        m
    }

    /// POST to `path` with `payload`.
    pub fn new_post(&mut self, msg_type: MessageType, path: &str, payload: &[u8]) -> Message {
        let mut m = self.new_message(msg_type, Code::Post);
        m.set_path(path);
        m.set_payload(payload);
        m
    }

    fn next_message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }

    /// Queue `message`. With a tag, its response is reported as an
    /// [`Event`]. Confirmable messages are retransmitted until answered.
    pub fn send(&mut self, message: Message, tag: Option<T>, now: Instant) {
        let datagram = message.to_vec();
        trace!("CoAP send {:?}", message);
        self.transmit.push_back(datagram.clone());

        let confirmable = message.msg_type == MessageType::Confirmable;
        if let Some(tag) = tag {
            self.pending.push(Pending {
                tag,
                token: message.token,
                message_id: message.message_id,
                datagram,
                confirmable,
                acked: false,
                retransmits_left: if confirmable { self.max_retransmit } else { 0 },
                sent: now,
                deadline: now + self.response_timeout,
            });
        }
    }

    /// Answer `request`. A confirmable request gets a piggybacked ACK.
    pub fn respond(&mut self, request: &Message, code: Code, payload: &[u8]) {
        let (msg_type, message_id) = match request.msg_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.message_id),
            _ => (MessageType::NonConfirmable, self.next_message_id()),
        };
        let mut response = Message::empty(msg_type, message_id);
        response.code = code;
        response.token = request.token.clone();
        response.set_payload(payload);

        let datagram = response.to_vec();
        trace!("CoAP respond {:?}", response);
        if request.msg_type == MessageType::Confirmable {
            if self.recent.len() >= MAX_RECENT_RESPONSES {
                self.recent.pop_front();
            }
            self.recent.push_back((request.message_id, datagram.clone()));
        }
        self.transmit.push_back(datagram);
    }

    /// Parse and dispatch one datagram.
    pub fn handle_input(&mut self, datagram: &[u8]) -> Result<(), Error> {
        let (_, message) = Message::parse(datagram)?;
        trace!("CoAP input {:?}", message);

        match message.msg_type {
            MessageType::Reset => {
                if let Some(i) = self.pending.iter().position(|p| p.message_id == message.message_id) {
                    let p = self.pending.remove(i);
                    debug!("CoAP request {} reset by peer", p.message_id);
                    self.events.push_back(Event::Failed { tag: p.tag });
                }
            }
            MessageType::Acknowledgement if message.is_empty_message() => {
                if let Some(p) = self
                    .pending
                    .iter_mut()
                    .find(|p| p.message_id == message.message_id)
                {
                    p.acked = true;
                    p.deadline = p.sent + self.exchange_lifetime;
                    trace!("CoAP request {} acknowledged", p.message_id);
                }
            }
            _ if message.code.is_response() => self.handle_response(message),
            _ if message.code.is_request() => self.handle_request(message),
            _ => {
                if message.msg_type == MessageType::Confirmable {
                    // CoAP ping
                    self.reply_empty(MessageType::Reset, message.message_id);
                }
            }
        }
        Ok(())
    }

    fn handle_response(&mut self, message: Message) {
        let piggybacked = message.msg_type == MessageType::Acknowledgement;
        let position = self.pending.iter().position(|p| {
            p.token == message.token && (!piggybacked || p.message_id == message.message_id)
        });

        // Separate confirmable responses are ACKed if expected, reset if not.
        if message.msg_type == MessageType::Confirmable {
            let reply = if position.is_some() {
                MessageType::Acknowledgement
            } else {
                MessageType::Reset
            };
            self.reply_empty(reply, message.message_id);
        }

        match position {
            Some(i) => {
                let p = self.pending.remove(i);
                self.events.push_back(Event::Response {
                    tag: p.tag,
                    response: message,
                });
            }
            None => debug!(
                "CoAP response with unknown token {:02x?}",
                &message.token[..]
            ),
        }
    }

    fn handle_request(&mut self, message: Message) {
        if message.msg_type == MessageType::Confirmable {
            if let Some((_, datagram)) = self
                .recent
                .iter()
                .find(|(id, _)| *id == message.message_id)
            {
                trace!("CoAP duplicate request {}", message.message_id);
                self.transmit.push_back(datagram.clone());
                return;
            }
        }

        let path = message.path();
        if self.resources.iter().any(|r| *r == path) {
            self.events.push_back(Event::Request(message));
            return;
        }

        debug!("CoAP no resource for {:?}", path);
        if message.msg_type == MessageType::Confirmable {
            self.respond(&message, Code::NotFound, &[]);
        }
    }

    fn reply_empty(&mut self, msg_type: MessageType, message_id: u16) {
        self.transmit
            .push_back(Message::empty(msg_type, message_id).to_vec());
    }

    /// Retransmit or give up on requests whose deadline passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.pending.len() {
            let p = &mut self.pending[i];
            if p.deadline > now {
                i += 1;
                continue;
            }
            if p.confirmable && !p.acked && p.retransmits_left > 0 {
                p.retransmits_left -= 1;
                p.sent = now;
                p.deadline = now + self.response_timeout;
                debug!(
                    "CoAP retransmit {} ({} left)",
                    p.message_id, p.retransmits_left
                );
                self.transmit.push_back(p.datagram.clone());
                i += 1;
                continue;
            }
            let p = self.pending.remove(i);
            debug!("CoAP request {} got no response", p.message_id);
            self.events.push_back(Event::Failed { tag: p.tag });
        }
    }

    /// Earliest deadline of a pending request.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmit.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event<T>> {
        self.events.pop_front()
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
