//! Loopback harness for DTLS sessions and servers.

#![allow(unused)]

use std::cell::RefCell;
use std::net::{Ipv6Addr, SocketAddr, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcop::mainloop::{Mainloop, MainloopContext, Readiness};
use meshcop::{Config, Dtls, Output, Server, Session, SessionState};

pub const PSK: &[u8] = b"J01NME";

/// Rounds of [`step`] before a test gives up waiting.
pub const MAX_ROUNDS: usize = 1000;

pub fn config() -> Arc<Config> {
    Arc::new(Config::builder().rng_seed(11).build().unwrap())
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv6Addr::LOCALHOST, port))
}

/// State changes reported by a server, and data received by its sessions.
#[derive(Debug, Default)]
pub struct Recorder {
    pub states: Vec<SessionState>,
    pub received: Vec<Vec<u8>>,
}

/// Server on an ephemeral port that records what happens to its sessions
/// and echoes data back.
pub fn server(config: Arc<Config>, psk: &[u8]) -> (Server, Rc<RefCell<Recorder>>) {
    let recorder = Rc::new(RefCell::new(Recorder::default()));

    let mut server = Server::new(config, 0);
    server.set_psk(psk).unwrap();

    let handler_recorder = recorder.clone();
    server.set_state_handler(move |session, state| {
        handler_recorder.borrow_mut().states.push(state);
        if state == SessionState::Ready {
            let data_recorder = handler_recorder.clone();
            session.set_data_handler(move |data| {
                data_recorder.borrow_mut().received.push(data.to_vec());
            });
        }
    });
    server.start().unwrap();

    (server, recorder)
}

/// One mainloop iteration over a server and its clients.
pub fn step(mainloop: &mut Mainloop, server: &mut Server, clients: &mut [&mut Session]) {
    let now = Instant::now();
    let mut ctx = MainloopContext::new(now + Duration::from_millis(20));
    server.update_fd_set(&mut ctx, now);
    for client in clients.iter() {
        client.update_fd_set(&mut ctx);
    }

    let readiness = mainloop.wait(&ctx).unwrap();
    let now = Instant::now();

    server.process(&readiness, now);
    for client in clients.iter_mut() {
        let readable = client.fd().is_some_and(|fd| readiness.is_readable(fd));
        let due = client.dtls_timeout().is_some_and(|t| t <= now);
        if readable || due {
            client.process(&readiness, now);
        }
    }
}

/// Sans-IO client endpoint on a plain socket, pumped by hand so a test can
/// look at every datagram.
pub struct RawClient {
    pub socket: UdpSocket,
    pub dtls: Dtls,
    pub connected: bool,
    buf: Vec<u8>,
}

impl RawClient {
    pub fn new(port: u16, dtls: Dtls) -> RawClient {
        let socket = UdpSocket::bind(loopback(0)).unwrap();
        socket.connect(loopback(port)).unwrap();
        socket.set_nonblocking(true).unwrap();
        RawClient {
            socket,
            dtls,
            connected: false,
            buf: vec![0; 2048],
        }
    }

    /// Start over with a fresh endpoint on the same socket.
    pub fn restart(&mut self, dtls: Dtls) {
        self.dtls = dtls;
        self.connected = false;
    }

    /// Datagrams waiting on the socket, not fed to the endpoint.
    pub fn recv_all(&mut self) -> Vec<Vec<u8>> {
        let mut out = vec![];
        while let Ok(n) = self.socket.recv(&mut self.buf) {
            out.push(self.buf[..n].to_vec());
        }
        out
    }

    /// Feed `datagrams` to the endpoint, run its timers and send what it
    /// produced. Returns the datagrams sent.
    pub fn feed(&mut self, datagrams: &[Vec<u8>], now: Instant) -> Vec<Vec<u8>> {
        for d in datagrams {
            let _ = self.dtls.handle_packet(d);
        }
        let _ = self.dtls.handle_timeout(now);

        let mut sent = vec![];
        loop {
            match self.dtls.poll_output(&mut self.buf) {
                Output::Packet(p) => {
                    self.socket.send(p).unwrap();
                    sent.push(p.to_vec());
                }
                Output::Connected => self.connected = true,
                Output::Timeout(_) => break,
                _ => {}
            }
        }
        sent
    }

    /// Receive and feed everything waiting on the socket.
    pub fn pump(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let received = self.recv_all();
        self.feed(&received, now)
    }
}

/// DTLS handshake message type of an epoch 0 datagram.
pub fn handshake_type(datagram: &[u8]) -> Option<u8> {
    const RECORD_HEADER_LEN: usize = 13;
    (datagram.len() > RECORD_HEADER_LEN && datagram[0] == 22).then(|| datagram[RECORD_HEADER_LEN])
}
