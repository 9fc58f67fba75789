// DTLS 1.2 EC J-PAKE Client Handshake Flow:
//
// 1. Client sends ClientHello carrying its J-PAKE round one in the
//    ecjpake_key_kp_pair extension
// 2. Server may answer HelloVerifyRequest
//    - Client resends the same ClientHello with the cookie
// 3. Server sends ServerHello (its round one in the extension),
//    ServerKeyExchange (round two), ServerHelloDone
// 4. Client sends ClientKeyExchange (round two), ChangeCipherSpec, Finished
// 5. Server sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow
//
// Abbreviated handshake when the client offers a session id the server
// still knows:
//
// 1. Client sends ClientHello with the session id
// 2. Server sends ServerHello echoing it, ChangeCipherSpec, Finished
// 3. Client sends ChangeCipherSpec, Finished

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use subtle::ConstantTimeEq;
use tinyvec::ArrayVec;

use super::cache::ResumptionTicket;
use super::crypto::{Kek, MasterSecret};
use super::ecjpake::{EcJpake, Role};
use super::engine::Engine;
use super::message::{
    Alert, AlertDescription, CipherSuite, ClientHello, ClientKeyExchange, CompressionMethod,
    Cookie, Extension, ExtensionType, HelloVerifyRequest, KeyKp, MessageType, ProtocolVersion,
    Random, ServerHello, ServerKeyExchange, SessionId,
};
use super::{LocalEvent, Output};
use crate::buffer::Buf;
use crate::{Config, Error};

/// DTLS client
pub struct Client {
    /// Current client state.
    state: State,

    /// Engine in common between server and client.
    engine: Engine,

    jpake: EcJpake,

    /// Random unique data. Used for ClientHello.
    random: Option<Random>,

    /// Round one keys. Identical in both ClientHellos around a HelloVerifyRequest.
    round_one: Option<(KeyKp, KeyKp)>,

    /// Cookie from HelloVerifyRequest.
    cookie: Cookie,

    /// Session offered for resumption.
    offered: Option<ResumptionTicket>,

    server_random: Option<Random>,

    /// Session id assigned by the server.
    session_id: SessionId,

    master: Option<MasterSecret>,

    kek: Option<Kek>,

    /// The last now we seen
    last_now: Option<Instant>,

    /// Local events
    local_events: VecDeque<LocalEvent>,

    /// Data that is sent before we are connected.
    queued_data: Vec<Buf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendClientHello,
    AwaitServerHello,
    AwaitServerKeyExchange,
    AwaitServerHelloDone,
    SendClientKeyExchange,
    AwaitServerFinished,
    AwaitResumedFinished,
    Connected,
    Running,
    Closed,
    Failed,
}

impl Client {
    pub fn new(config: Arc<Config>, psk: &[u8]) -> Result<Client, Error> {
        let mut engine = Engine::new(config, true, b"Client");
        let jpake = EcJpake::new(Role::Client, psk, &mut engine.rng)?;

        Ok(Client {
            state: State::SendClientHello,
            engine,
            jpake,
            random: None,
            round_one: None,
            cookie: Cookie::empty(),
            offered: None,
            server_random: None,
            session_id: SessionId::empty(),
            master: None,
            kek: None,
            last_now: None,
            local_events: VecDeque::new(),
            queued_data: Vec::new(),
        })
    }

    /// Client that offers `ticket` for an abbreviated handshake. Falls back
    /// to a full handshake when the server no longer knows the session.
    pub fn with_resumption(
        config: Arc<Config>,
        psk: &[u8],
        ticket: ResumptionTicket,
    ) -> Result<Client, Error> {
        let mut client = Client::new(config, psk)?;
        client.offered = Some(ticket);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected | State::Running)
    }

    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        if matches!(self.state, State::Closed | State::Failed) {
            return Err(Error::InvalidState("client is closed"));
        }
        let result = self
            .engine
            .parse_packet(packet)
            .and_then(|_| self.make_progress());
        self.check_fatal(result)
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        if matches!(self.state, State::Closed | State::Failed) {
            return Ok(());
        }
        if self.random.is_none() {
            self.random = Some(Random::new(&mut self.engine.rng));
        }
        let result = self
            .engine
            .handle_timeout(now)
            .and_then(|_| self.make_progress());
        self.check_fatal(result)
    }

    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        let now = *self.last_now.get_or_insert_with(Instant::now);

        if let Some(event) = self.local_events.pop_front() {
            return event.into_output();
        }

        self.engine.poll_output(buf, now)
    }

    /// Send application data when the client is connected.
    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.state {
            State::Running | State::Connected => self.engine.send_application_data(data),
            State::Closed | State::Failed => Err(Error::InvalidState("client is closed")),
            _ => {
                if self.queued_data.len() >= self.engine.config().max_queue_tx() {
                    return Err(Error::TransmitQueueFull);
                }
                self.queued_data.push(Buf::from_slice(data));
                Ok(())
            }
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if matches!(self.state, State::Closed | State::Failed) {
            return Ok(());
        }
        self.engine.flight_stop_resend_timers();
        let result = self.engine.send_alert(Alert::close_notify());
        self.state = State::Closed;
        result
    }

    pub fn resumption_ticket(&self) -> Option<ResumptionTicket> {
        if !self.is_connected() || self.session_id.is_empty() {
            return None;
        }
        Some(ResumptionTicket {
            session_id: self.session_id,
            master: self.master.clone()?,
        })
    }

    /// A local failure ends the connection with a fatal alert.
    fn check_fatal(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        let Err(e) = result else {
            return Ok(());
        };
        if !e.is_fatal() {
            return Err(e);
        }
        debug!("Client failed in {:?}: {}", self.state, e);
        if !matches!(e, Error::Alert(_)) {
            let alert = Alert::fatal(AlertDescription::for_error(&e));
            if let Err(send) = self.engine.send_alert(alert) {
                debug!("Failed to send alert: {}", send);
            }
        }
        self.engine.flight_stop_resend_timers();
        self.state = State::Failed;
        Err(e)
    }

    fn make_progress(&mut self) -> Result<(), Error> {
        loop {
            let prev_state = self.state;

            let new_state = prev_state.make_progress(self)?;
            if prev_state != new_state {
                self.state = new_state;
                trace!("{:?} -> {:?}", prev_state, new_state);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn client_random(&self) -> Result<Random, Error> {
        self.random
            .ok_or(Error::InvalidState("handle_timeout not called"))
    }

    fn master(&self) -> Result<&MasterSecret, Error> {
        self.master
            .as_ref()
            .ok_or(Error::InvalidState("no master secret"))
    }

    fn install_keys(&mut self) -> Result<(), Error> {
        let client_random = self.client_random()?;
        let server_random = self
            .server_random
            .ok_or(Error::InvalidState("no server random"))?;
        let master = self
            .master
            .as_ref()
            .ok_or(Error::InvalidState("no master secret"))?;
        let kek = self
            .engine
            .install_keys(master, &client_random, &server_random)?;
        self.kek = Some(kek);
        Ok(())
    }

    /// Verify the server Finished against the transcript so far.
    fn read_server_finished(&mut self) -> Result<bool, Error> {
        if self.engine.peek_handshake() != Some(MessageType::Finished) {
            return Ok(false);
        }
        if !self.engine.has_peer_ccs() {
            return Err(Error::UnexpectedMessage(
                "Finished before ChangeCipherSpec".to_string(),
            ));
        }

        let expected = self
            .master()?
            .verify_data("server finished", self.engine.transcript())?;

        let Some(finished) = self.engine.next_handshake(MessageType::Finished)? else {
            return Ok(false);
        };

        let is_eq: bool = finished.ct_eq(&expected).into();
        if !is_eq {
            return Err(Error::SecurityError(
                "Server Finished verification failed".to_string(),
            ));
        }
        Ok(true)
    }

    fn send_finished(&mut self) -> Result<(), Error> {
        let verify_data = self
            .master()?
            .verify_data("client finished", self.engine.transcript())?;

        self.engine.send_change_cipher_spec()?;
        self.engine
            .create_handshake(MessageType::Finished, |body| {
                body.extend_from_slice(&verify_data)
            })
    }
}

impl State {
    fn make_progress(self, client: &mut Client) -> Result<Self, Error> {
        match self {
            State::SendClientHello => self.send_client_hello(client),
            State::AwaitServerHello => self.await_server_hello(client),
            State::AwaitServerKeyExchange => self.await_server_key_exchange(client),
            State::AwaitServerHelloDone => self.await_server_hello_done(client),
            State::SendClientKeyExchange => self.send_client_key_exchange(client),
            State::AwaitServerFinished => self.await_server_finished(client),
            State::AwaitResumedFinished => self.await_resumed_finished(client),
            State::Connected => self.connected(client),
            State::Running | State::Closed | State::Failed => Ok(self),
        }
    }

    fn send_client_hello(self, client: &mut Client) -> Result<Self, Error> {
        let random = client.client_random()?;

        let flight_no = if client.cookie.is_empty() { 1 } else { 3 };
        client.engine.flight_begin(flight_no);

        let round_one = match client.round_one {
            Some(r) => r,
            None => {
                let r = client.jpake.round_one(&mut client.engine.rng)?;
                client.round_one = Some(r);
                r
            }
        };

        let mut kp_pair = Vec::with_capacity(2 * 200);
        KeyKp::serialize_pair(&round_one, &mut kp_pair);

        let session_id = client
            .offered
            .as_ref()
            .map(|t| t.session_id)
            .unwrap_or_else(SessionId::empty);

        let mut extensions = ArrayVec::new();
        extensions.push(Extension::new(
            ExtensionType::SupportedGroups,
            Extension::SUPPORTED_GROUPS,
        ));
        extensions.push(Extension::new(
            ExtensionType::EcPointFormats,
            Extension::POINT_FORMATS,
        ));
        extensions.push(Extension::new(ExtensionType::EcjpakeKeyKpPair, &kp_pair));

        let mut cipher_suites = ArrayVec::new();
        cipher_suites.push(CipherSuite::ECJPAKE_AES128_CCM_8);
        let mut compression_methods = ArrayVec::new();
        compression_methods.push(CompressionMethod::Null);

        let hello = ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cookie: client.cookie,
            cipher_suites,
            compression_methods,
            extensions,
        };

        debug!("Send ClientHello (cookie: {})", !client.cookie.is_empty());
        client
            .engine
            .create_handshake(MessageType::ClientHello, |body| hello.serialize(body))?;

        Ok(Self::AwaitServerHello)
    }

    fn await_server_hello(self, client: &mut Client) -> Result<Self, Error> {
        match client.engine.peek_handshake() {
            None => return Ok(self),
            Some(MessageType::HelloVerifyRequest) => {
                let Some(body) = client.engine.next_handshake(MessageType::HelloVerifyRequest)?
                else {
                    return Ok(self);
                };
                let (_, hvr) = HelloVerifyRequest::parse(&body)?;

                if !client.cookie.is_empty() {
                    return Err(Error::UnexpectedMessage(
                        "Second HelloVerifyRequest".to_string(),
                    ));
                }
                if hvr.cookie.is_empty() {
                    return Err(Error::UnexpectedMessage(
                        "HelloVerifyRequest without cookie".to_string(),
                    ));
                }

                debug!("Received HelloVerifyRequest");
                client.cookie = hvr.cookie;
                client.engine.reset_for_hello_verify_request();
                return Ok(Self::SendClientHello);
            }
            Some(_) => {}
        }

        let Some(body) = client.engine.next_handshake(MessageType::ServerHello)? else {
            return Ok(self);
        };
        let (_, server_hello) = ServerHello::parse(&body)?;

        if server_hello.server_version != ProtocolVersion::DTLS1_2 {
            return Err(Error::SecurityError(format!(
                "Unsupported DTLS version from server: {:?}",
                server_hello.server_version
            )));
        }
        if server_hello.cipher_suite != CipherSuite::ECJPAKE_AES128_CCM_8 {
            return Err(Error::SecurityError(format!(
                "Server selected unknown cipher suite: {:?}",
                server_hello.cipher_suite
            )));
        }
        if server_hello.compression_method != CompressionMethod::Null {
            return Err(Error::SecurityError(
                "Server selected compression".to_string(),
            ));
        }

        client.server_random = Some(server_hello.random);
        client.session_id = server_hello.session_id;

        let resumed = client
            .offered
            .as_ref()
            .is_some_and(|t| t.session_id == server_hello.session_id);

        if resumed {
            debug!("Server resumed session {:?}", server_hello.session_id);
            client.master = client.offered.take().map(|t| t.master);
            client.install_keys()?;
            return Ok(Self::AwaitResumedFinished);
        }

        let Some(ext) = server_hello.extension(ExtensionType::EcjpakeKeyKpPair) else {
            return Err(Error::SecurityError(
                "ServerHello without ecjpake_key_kp_pair".to_string(),
            ));
        };
        let (_, pair) = KeyKp::parse_pair(ext.extension_data)?;
        client.jpake.read_round_one(&pair)?;

        Ok(Self::AwaitServerKeyExchange)
    }

    fn await_server_key_exchange(self, client: &mut Client) -> Result<Self, Error> {
        let Some(body) = client
            .engine
            .next_handshake(MessageType::ServerKeyExchange)?
        else {
            return Ok(self);
        };
        let (_, ske) = ServerKeyExchange::parse(&body)?;
        client.jpake.read_round_two(&ske.key_kp)?;

        Ok(Self::AwaitServerHelloDone)
    }

    fn await_server_hello_done(self, client: &mut Client) -> Result<Self, Error> {
        let Some(body) = client.engine.next_handshake(MessageType::ServerHelloDone)? else {
            return Ok(self);
        };
        if !body.is_empty() {
            return Err(Error::UnexpectedMessage(
                "ServerHelloDone with body".to_string(),
            ));
        }
        Ok(Self::SendClientKeyExchange)
    }

    fn send_client_key_exchange(self, client: &mut Client) -> Result<Self, Error> {
        client.engine.flight_begin(5);

        let key_kp = client.jpake.round_two(&mut client.engine.rng)?;
        let cke = ClientKeyExchange { key_kp };
        client
            .engine
            .create_handshake(MessageType::ClientKeyExchange, |body| cke.serialize(body))?;

        let premaster = client.jpake.premaster_secret()?;
        let server_random = client
            .server_random
            .ok_or(Error::InvalidState("no server random"))?;
        client.master = Some(MasterSecret::derive(
            &premaster,
            &client.client_random()?,
            &server_random,
        )?);
        client.install_keys()?;
        client.send_finished()?;

        Ok(Self::AwaitServerFinished)
    }

    fn await_server_finished(self, client: &mut Client) -> Result<Self, Error> {
        if !client.read_server_finished()? {
            return Ok(self);
        }
        Ok(Self::Connected)
    }

    fn await_resumed_finished(self, client: &mut Client) -> Result<Self, Error> {
        if !client.read_server_finished()? {
            return Ok(self);
        }
        client.engine.flight_begin(3);
        client.send_finished()?;
        Ok(Self::Connected)
    }

    fn connected(self, client: &mut Client) -> Result<Self, Error> {
        debug!("Client connected");
        client.engine.flight_stop_resend_timers();
        client.engine.release_application_data();

        client.local_events.push_back(LocalEvent::Connected);
        if let Some(kek) = client.kek.take() {
            client.local_events.push_back(LocalEvent::KeyingMaterial(kek));
        }

        for data in std::mem::take(&mut client.queued_data) {
            client.engine.send_application_data(&data)?;
        }

        Ok(Self::Running)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("engine", &self.engine)
            .finish()
    }
}
