//! Server sessions seen from a client on a plain socket.

use std::sync::Arc;
use std::time::Instant;

use meshcop::mainloop::Mainloop;
use meshcop::{Config, Dtls, Server, SessionState};

use crate::common::*;

const CLIENT_HELLO: u8 = 1;
const HELLO_VERIFY_REQUEST: u8 = 3;

/// Step the server until the client has something to read.
fn wait_for_reply(
    mainloop: &mut Mainloop,
    server: &mut Server,
    client: &mut RawClient,
) -> Vec<Vec<u8>> {
    for _ in 0..MAX_ROUNDS {
        step(mainloop, server, &mut []);
        let received = client.recv_all();
        if !received.is_empty() {
            return received;
        }
    }
    panic!("no reply from server");
}

fn run_until_connected(
    mainloop: &mut Mainloop,
    server: &mut Server,
    client: &mut RawClient,
    recorder_ready: impl Fn() -> bool,
) {
    let mut rounds = 0;
    while !client.connected || !recorder_ready() {
        step(mainloop, server, &mut []);
        client.pump(Instant::now());
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "handshake did not finish");
    }
}

#[test]
fn hello_without_cookie_allocates_no_session() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = RawClient::new(server.port(), Dtls::new_client(config(), PSK).unwrap());

    let sent = client.feed(&[], Instant::now());
    assert_eq!(sent.len(), 1);
    assert_eq!(handshake_type(&sent[0]), Some(CLIENT_HELLO));

    let reply = wait_for_reply(&mut mainloop, &mut server, &mut client);
    assert_eq!(reply.len(), 1);
    assert_eq!(handshake_type(&reply[0]), Some(HELLO_VERIFY_REQUEST));
    assert_eq!(server.session_count(), 0);
    assert!(recorder.borrow().states.is_empty());

    let sent = client.feed(&reply, Instant::now());
    assert_eq!(sent.len(), 1);
    assert_eq!(handshake_type(&sent[0]), Some(CLIENT_HELLO));

    let states = recorder.clone();
    run_until_connected(&mut mainloop, &mut server, &mut client, move || {
        !states.borrow().states.is_empty()
    });
    assert_eq!(server.session_count(), 1);
    assert_eq!(recorder.borrow().states, vec![SessionState::Ready]);
}

#[test]
fn ready_peer_may_start_over() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = RawClient::new(server.port(), Dtls::new_client(config(), PSK).unwrap());
    client.feed(&[], Instant::now());

    let states = recorder.clone();
    run_until_connected(&mut mainloop, &mut server, &mut client, move || {
        states.borrow().states.contains(&SessionState::Ready)
    });

    // Same address, fresh handshake state.
    let restarted = Arc::new(Config::builder().rng_seed(12).build().unwrap());
    client.restart(Dtls::new_client(restarted, PSK).unwrap());
    client.feed(&[], Instant::now());

    let states = recorder.clone();
    run_until_connected(&mut mainloop, &mut server, &mut client, move || {
        states.borrow().states.len() >= 3
    });
    assert_eq!(
        recorder.borrow().states,
        vec![SessionState::Ready, SessionState::Handshaking, SessionState::Ready]
    );
    assert_eq!(server.session_count(), 1);

    client.dtls.send_application_data(b"again").unwrap();
    client.feed(&[], Instant::now());
    for _ in 0..MAX_ROUNDS {
        if !recorder.borrow().received.is_empty() {
            break;
        }
        step(&mut mainloop, &mut server, &mut []);
    }
    assert_eq!(recorder.borrow().received, vec![b"again".to_vec()]);
}

#[test]
fn empty_datagram_keeps_session_ready() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = RawClient::new(server.port(), Dtls::new_client(config(), PSK).unwrap());
    client.feed(&[], Instant::now());

    let states = recorder.clone();
    run_until_connected(&mut mainloop, &mut server, &mut client, move || {
        states.borrow().states.contains(&SessionState::Ready)
    });

    client.socket.send(&[]).unwrap();
    for _ in 0..10 {
        step(&mut mainloop, &mut server, &mut []);
    }
    assert_eq!(recorder.borrow().states, vec![SessionState::Ready]);
    assert_eq!(server.session_count(), 1);

    client.dtls.send_application_data(b"still here").unwrap();
    client.feed(&[], Instant::now());
    for _ in 0..MAX_ROUNDS {
        if !recorder.borrow().received.is_empty() {
            break;
        }
        step(&mut mainloop, &mut server, &mut []);
    }
    assert_eq!(recorder.borrow().received, vec![b"still here".to_vec()]);
}
