// DTLS 1.2 EC J-PAKE Server Handshake Flow:
//
// 1. Client sends ClientHello (maybe without cookie)
// 2. If cookie missing/invalid, the socket layer answers HelloVerifyRequest
//    via `check_client_hello` without creating a Server
// 3. Server reads the client round one from ecjpake_key_kp_pair and sends
//    ServerHello (own round one), ServerKeyExchange (round two),
//    ServerHelloDone
// 4. Client sends ClientKeyExchange, ChangeCipherSpec, Finished
// 5. Server verifies Finished, then sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow
//
// When the ClientHello offers a session id found in the cache, the server
// skips J-PAKE and sends ServerHello, ChangeCipherSpec, Finished right away.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use subtle::ConstantTimeEq;
use tinyvec::ArrayVec;

use super::cache::SessionCache;
use super::cookie::CookieJar;
use super::crypto::{Kek, MasterSecret};
use super::ecjpake::{EcJpake, Role};
use super::engine::Engine;
use super::message::{
    Alert, AlertDescription, CipherSuite, ClientHello, ClientKeyExchange, CompressionMethod,
    ContentType, DtlsRecord, Extension, ExtensionType, Header, HelloVerifyRequest, KeyKp,
    MessageType, ProtocolVersion, Random, ServerHello, ServerKeyExchange, SessionId,
};
use super::{LocalEvent, Output};
use crate::buffer::Buf;
use crate::{Config, Error};

/// Length of the session ids the server hands out when resumption is on.
const SESSION_ID_LEN: usize = 32;

/// Outcome of the stateless ClientHello check.
#[derive(Debug, PartialEq, Eq)]
pub enum HelloCheck {
    /// The ClientHello carries a valid cookie. Go ahead and allocate.
    Verified,
    /// Send this HelloVerifyRequest datagram and forget the client.
    HelloVerifyRequest(Vec<u8>),
    /// Not a ClientHello we can answer.
    Drop,
}

/// Whether `datagram` starts with an epoch 0 ClientHello record.
pub fn is_client_hello(datagram: &[u8]) -> bool {
    let Ok((_, record)) = DtlsRecord::parse(datagram) else {
        return false;
    };
    if record.content_type != ContentType::Handshake || record.sequence.epoch != 0 {
        return false;
    }
    matches!(
        Header::parse_fragment(record.fragment),
        Ok((_, (header, _))) if header.msg_type == MessageType::ClientHello
    )
}

/// Decide what to do with a datagram from an unknown peer without keeping
/// any state for it (RFC 6347 4.2.1).
///
/// The HelloVerifyRequest echoes both the record sequence number and the
/// message_seq of the ClientHello.
pub fn check_client_hello(jar: &CookieJar, transport_id: &[u8], datagram: &[u8]) -> HelloCheck {
    let Ok((_, record)) = DtlsRecord::parse(datagram) else {
        return HelloCheck::Drop;
    };
    if record.content_type != ContentType::Handshake || record.sequence.epoch != 0 {
        return HelloCheck::Drop;
    }
    let Ok((_, (header, fragment))) = Header::parse_fragment(record.fragment) else {
        return HelloCheck::Drop;
    };
    if header.msg_type != MessageType::ClientHello || header.is_fragment() {
        return HelloCheck::Drop;
    }
    let Ok((_, hello)) = ClientHello::parse(fragment) else {
        return HelloCheck::Drop;
    };

    if jar.verify(transport_id, &hello.random, &hello.cookie) {
        return HelloCheck::Verified;
    }

    let cookie = match jar.generate(transport_id, &hello.random) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to mint cookie: {}", e);
            return HelloCheck::Drop;
        }
    };

    let hvr = HelloVerifyRequest {
        server_version: ProtocolVersion::DTLS1_0,
        cookie,
    };
    let mut body = Vec::with_capacity(3 + cookie.len());
    hvr.serialize(&mut body);

    let mut fragment = Vec::with_capacity(12 + body.len());
    Header::whole(MessageType::HelloVerifyRequest, body.len(), header.message_seq)
        .serialize(&mut fragment);
    fragment.extend_from_slice(&body);

    let mut out = Vec::with_capacity(DtlsRecord::HEADER_LEN + fragment.len());
    DtlsRecord {
        content_type: ContentType::Handshake,
        version: ProtocolVersion::DTLS1_0,
        sequence: record.sequence,
        fragment: &fragment,
    }
    .serialize(&mut out);

    trace!("HelloVerifyRequest for {:02x?}", transport_id);
    HelloCheck::HelloVerifyRequest(out)
}

/// DTLS server
pub struct Server {
    /// Current server state.
    state: State,

    /// Engine in common between server and client.
    engine: Engine,

    jpake: EcJpake,

    /// Random unique data. Used for ServerHello.
    random: Random,

    /// Client random. Set by ClientHello.
    client_random: Option<Random>,

    /// Session id we hand out (empty when resumption is off) or resume.
    session_id: SessionId,

    cache: Option<Arc<Mutex<SessionCache>>>,

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
    AwaitClientHello,
    SendServerHelloFlight,
    AwaitClientKeyExchange,
    AwaitClientFinished,
    SendResumedFlight,
    AwaitResumedFinished,
    Connected,
    Running,
    Closed,
    Failed,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        psk: &[u8],
        cache: Option<Arc<Mutex<SessionCache>>>,
    ) -> Result<Server, Error> {
        let mut engine = Engine::new(config, false, b"Server");
        let jpake = EcJpake::new(Role::Server, psk, &mut engine.rng)?;
        let random = Random::new(&mut engine.rng);

        Ok(Server {
            state: State::AwaitClientHello,
            engine,
            jpake,
            random,
            client_random: None,
            session_id: SessionId::empty(),
            cache,
            master: None,
            kek: None,
            last_now: None,
            local_events: VecDeque::new(),
            queued_data: Vec::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected | State::Running)
    }

    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        if matches!(self.state, State::Closed | State::Failed) {
            return Err(Error::InvalidState("server is closed"));
        }
        let result = self
            .engine
            .parse_packet(packet)
            .and_then(|_| self.make_progress());
        self.check_fatal(result)
    }

    /// The server is reactive, only the engine timers run here.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        if matches!(self.state, State::Closed | State::Failed) {
            return Ok(());
        }
        let result = self.engine.handle_timeout(now);
        self.check_fatal(result)
    }

    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        let now = *self.last_now.get_or_insert_with(Instant::now);

        if let Some(event) = self.local_events.pop_front() {
            return event.into_output();
        }

        self.engine.poll_output(buf, now)
    }

    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        match self.state {
            State::Running | State::Connected => self.engine.send_application_data(data),
            State::Closed | State::Failed => Err(Error::InvalidState("server is closed")),
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

    fn check_fatal(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        let Err(e) = result else {
            return Ok(());
        };
        if !e.is_fatal() {
            return Err(e);
        }
        debug!("Server failed in {:?}: {}", self.state, e);
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
        self.client_random
            .ok_or(Error::InvalidState("no client random"))
    }

    fn master(&self) -> Result<&MasterSecret, Error> {
        self.master
            .as_ref()
            .ok_or(Error::InvalidState("no master secret"))
    }

    fn install_keys(&mut self) -> Result<(), Error> {
        let client_random = self.client_random()?;
        let master = self
            .master
            .as_ref()
            .ok_or(Error::InvalidState("no master secret"))?;
        let kek = self
            .engine
            .install_keys(master, &client_random, &self.random)?;
        self.kek = Some(kek);
        Ok(())
    }

    fn lookup_session(&self, id: &SessionId) -> Result<Option<MasterSecret>, Error> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let cache = cache
            .lock()
            .map_err(|_| Error::InvalidState("session cache poisoned"))?;
        Ok(cache.get(id).cloned())
    }

    fn store_session(&self) -> Result<(), Error> {
        let (Some(cache), Some(master)) = (&self.cache, &self.master) else {
            return Ok(());
        };
        let mut cache = cache
            .lock()
            .map_err(|_| Error::InvalidState("session cache poisoned"))?;
        cache.insert(self.session_id, master.clone());
        Ok(())
    }

    fn send_server_hello(&mut self, kp_pair: Option<&[u8]>) -> Result<(), Error> {
        let mut extensions = ArrayVec::new();
        if let Some(kp_pair) = kp_pair {
            extensions.push(Extension::new(
                ExtensionType::EcPointFormats,
                Extension::POINT_FORMATS,
            ));
            extensions.push(Extension::new(ExtensionType::EcjpakeKeyKpPair, kp_pair));
        }

        let hello = ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random: self.random,
            session_id: self.session_id,
            cipher_suite: CipherSuite::ECJPAKE_AES128_CCM_8,
            compression_method: CompressionMethod::Null,
            extensions,
        };

        self.engine
            .create_handshake(MessageType::ServerHello, |body| hello.serialize(body))
    }

    fn send_finished(&mut self) -> Result<(), Error> {
        let verify_data = self
            .master()?
            .verify_data("server finished", self.engine.transcript())?;

        self.engine.send_change_cipher_spec()?;
        self.engine
            .create_handshake(MessageType::Finished, |body| {
                body.extend_from_slice(&verify_data)
            })
    }

    fn read_client_finished(&mut self) -> Result<bool, Error> {
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
            .verify_data("client finished", self.engine.transcript())?;

        let Some(finished) = self.engine.next_handshake(MessageType::Finished)? else {
            return Ok(false);
        };

        let is_eq: bool = finished.ct_eq(&expected).into();
        if !is_eq {
            return Err(Error::SecurityError(
                "Client Finished verification failed".to_string(),
            ));
        }
        Ok(true)
    }
}

impl State {
    fn make_progress(self, server: &mut Server) -> Result<Self, Error> {
        match self {
            State::AwaitClientHello => self.await_client_hello(server),
            State::SendServerHelloFlight => self.send_server_hello_flight(server),
            State::AwaitClientKeyExchange => self.await_client_key_exchange(server),
            State::AwaitClientFinished => self.await_client_finished(server),
            State::SendResumedFlight => self.send_resumed_flight(server),
            State::AwaitResumedFinished => self.await_resumed_finished(server),
            State::Connected => self.connected(server),
            State::Running | State::Closed | State::Failed => Ok(self),
        }
    }

    fn await_client_hello(self, server: &mut Server) -> Result<Self, Error> {
        let Some(body) = server.engine.next_handshake(MessageType::ClientHello)? else {
            return Ok(self);
        };
        let (_, hello) = ClientHello::parse(&body)?;

        if hello.client_version != ProtocolVersion::DTLS1_2 {
            return Err(Error::SecurityError(format!(
                "Unsupported DTLS version from client: {:?}",
                hello.client_version
            )));
        }
        if !hello.offers(CipherSuite::ECJPAKE_AES128_CCM_8) {
            return Err(Error::SecurityError(
                "Client did not offer TLS_ECJPAKE_WITH_AES_128_CCM_8".to_string(),
            ));
        }
        if !hello.compression_methods.contains(&CompressionMethod::Null) {
            return Err(Error::SecurityError(
                "Client did not offer Null compression".to_string(),
            ));
        }

        server.client_random = Some(hello.random);

        if let Some(master) = server.lookup_session(&hello.session_id)? {
            debug!("Resuming session {:?}", hello.session_id);
            server.session_id = hello.session_id;
            server.master = Some(master);
            return Ok(Self::SendResumedFlight);
        }

        let Some(ext) = hello.extension(ExtensionType::EcjpakeKeyKpPair) else {
            return Err(Error::SecurityError(
                "ClientHello without ecjpake_key_kp_pair".to_string(),
            ));
        };
        let (_, pair) = KeyKp::parse_pair(ext.extension_data)?;
        server.jpake.read_round_one(&pair)?;

        let resumable = server
            .cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.is_enabled()))
            .unwrap_or(false);
        if resumable {
            server.session_id = SessionId::random(SESSION_ID_LEN, &mut server.engine.rng);
        }

        Ok(Self::SendServerHelloFlight)
    }

    fn send_server_hello_flight(self, server: &mut Server) -> Result<Self, Error> {
        server.engine.flight_begin(4);

        let round_one = server.jpake.round_one(&mut server.engine.rng)?;
        let mut kp_pair = Vec::with_capacity(2 * 200);
        KeyKp::serialize_pair(&round_one, &mut kp_pair);
        server.send_server_hello(Some(&kp_pair))?;

        let key_kp = server.jpake.round_two(&mut server.engine.rng)?;
        let ske = ServerKeyExchange { key_kp };
        server
            .engine
            .create_handshake(MessageType::ServerKeyExchange, |body| ske.serialize(body))?;

        server
            .engine
            .create_handshake(MessageType::ServerHelloDone, |_| {})?;

        Ok(Self::AwaitClientKeyExchange)
    }

    fn await_client_key_exchange(self, server: &mut Server) -> Result<Self, Error> {
        let Some(body) = server
            .engine
            .next_handshake(MessageType::ClientKeyExchange)?
        else {
            return Ok(self);
        };
        let (_, cke) = ClientKeyExchange::parse(&body)?;
        server.jpake.read_round_two(&cke.key_kp)?;

        let premaster = server.jpake.premaster_secret()?;
        server.master = Some(MasterSecret::derive(
            &premaster,
            &server.client_random()?,
            &server.random,
        )?);
        server.install_keys()?;

        Ok(Self::AwaitClientFinished)
    }

    fn await_client_finished(self, server: &mut Server) -> Result<Self, Error> {
        if !server.read_client_finished()? {
            return Ok(self);
        }

        server.engine.flight_begin(6);
        server.send_finished()?;
        server.store_session()?;

        Ok(Self::Connected)
    }

    fn send_resumed_flight(self, server: &mut Server) -> Result<Self, Error> {
        server.engine.flight_begin(2);
        server.send_server_hello(None)?;
        server.install_keys()?;
        server.send_finished()?;
        Ok(Self::AwaitResumedFinished)
    }

    fn await_resumed_finished(self, server: &mut Server) -> Result<Self, Error> {
        if !server.read_client_finished()? {
            return Ok(self);
        }
        Ok(Self::Connected)
    }

    fn connected(self, server: &mut Server) -> Result<Self, Error> {
        debug!("Server connected");
        server.engine.flight_stop_resend_timers();
        server.engine.release_application_data();

        server.local_events.push_back(LocalEvent::Connected);
        if let Some(kek) = server.kek.take() {
            server.local_events.push_back(LocalEvent::KeyingMaterial(kek));
        }

        for data in std::mem::take(&mut server.queued_data) {
            server.engine.send_application_data(&data)?;
        }

        Ok(Self::Running)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("engine", &self.engine)
            .finish()
    }
}
