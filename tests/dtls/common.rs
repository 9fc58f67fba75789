//! Shared helpers for sans-IO DTLS tests.

#![allow(unused)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcop::{Config, Dtls, Error, Kek, Output};

/// Handshake message types (RFC 5246 / 6347).
pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const HELLO_VERIFY_REQUEST: u8 = 3;
pub const FINISHED: u8 = 20;

pub const PSK: &[u8] = b"J01NME";

pub fn config() -> Arc<Config> {
    Arc::new(Config::builder().rng_seed(42).build().unwrap())
}

/// Everything an endpoint produced until it asked for a timeout.
#[derive(Debug, Default)]
pub struct Drained {
    pub packets: Vec<Vec<u8>>,
    pub connected: bool,
    pub kek: Option<Kek>,
    pub app_data: Vec<Vec<u8>>,
    pub peer_closed: bool,
    pub timeout: Option<Instant>,
}

pub fn drain(dtls: &mut Dtls) -> Drained {
    let mut buf = vec![0; 2048];
    let mut out = Drained::default();
    loop {
        match dtls.poll_output(&mut buf) {
            Output::Packet(p) => out.packets.push(p.to_vec()),
            Output::Connected => out.connected = true,
            Output::KeyingMaterial(k) => out.kek = Some(k),
            Output::ApplicationData(d) => out.app_data.push(d.to_vec()),
            Output::PeerClosed => out.peer_closed = true,
            Output::BufferTooSmall { needed } => panic!("drain buffer too small for {}", needed),
            Output::Timeout(t) => {
                out.timeout = Some(t);
                return out;
            }
        }
    }
}

/// Handshake message types in a datagram (content type 22, epoch 0 only).
pub fn handshake_types(datagram: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        if ctype == 22 && epoch == 0 && i + 13 < datagram.len() {
            out.push(datagram[i + 13]);
        }
        i += 13 + len;
    }
    out
}

/// Record sequence numbers in a datagram.
pub fn record_seqs(datagram: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        out.push(u64::from_be_bytes(seq));
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        i += 13 + len;
    }
    out
}

/// Outcome of pumping two endpoints against each other.
#[derive(Debug, Default)]
pub struct Pumped {
    pub client_kek: Option<Kek>,
    pub server_kek: Option<Kek>,
    pub client_data: Vec<Vec<u8>>,
    pub server_data: Vec<Vec<u8>>,
}

/// Exchange datagrams until both sides are connected and quiet.
pub fn handshake(client: &mut Dtls, server: &mut Dtls, now: Instant) -> Result<Pumped, Error> {
    let mut pumped = Pumped::default();
    client.handle_timeout(now)?;

    for _ in 0..20 {
        let c = drain(client);
        pumped.client_kek = pumped.client_kek.take().or(c.kek);
        pumped.client_data.extend(c.app_data);
        for p in &c.packets {
            server.handle_packet(p)?;
        }
        server.handle_timeout(now)?;

        let s = drain(server);
        pumped.server_kek = pumped.server_kek.take().or(s.kek);
        pumped.server_data.extend(s.app_data);
        for p in &s.packets {
            client.handle_packet(p)?;
        }
        client.handle_timeout(now)?;

        if c.packets.is_empty() && s.packets.is_empty() {
            break;
        }
    }
    Ok(pumped)
}

/// Move pending datagrams from `from` into `to`, returning what `to`
/// produced in turn.
pub fn deliver(from: &mut Dtls, to: &mut Dtls) -> Drained {
    let out = drain(from);
    for p in &out.packets {
        let _ = to.handle_packet(p);
    }
    drain(to)
}
