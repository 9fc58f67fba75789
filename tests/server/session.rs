//! Sessions and servers over loopback UDP.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use meshcop::mainloop::Mainloop;
use meshcop::{Config, Session, SessionState};

use crate::common::*;

#[test]
fn client_connects_and_sends() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = Session::connect(config(), PSK, loopback(server.port())).unwrap();

    let mut rounds = 0;
    while client.state() == SessionState::Handshaking || recorder.borrow().states.is_empty() {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "handshake did not finish");
    }
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(recorder.borrow().states, vec![SessionState::Ready]);
    assert_eq!(server.session_count(), 1);

    let server_kek = server.sessions().next().and_then(|s| s.kek().cloned());
    assert!(server_kek.is_some());
    assert_eq!(client.kek().cloned(), server_kek);

    client.write(b"COMM_PET.req").unwrap();
    while recorder.borrow().received.is_empty() {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "data not delivered");
    }
    assert_eq!(recorder.borrow().received, vec![b"COMM_PET.req".to_vec()]);
}

#[test]
fn server_answers_client_data() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = Session::connect(config(), PSK, loopback(server.port())).unwrap();

    let replies = Rc::new(RefCell::new(Vec::new()));
    let client_replies = replies.clone();
    client.set_data_handler(move |data| client_replies.borrow_mut().push(data.to_vec()));

    let mut rounds = 0;
    while recorder.borrow().states.is_empty() {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS);
    }

    let peer = client_local_peer(&server);
    server.session_mut(peer).unwrap().write(b"COMM_PET.rsp").unwrap();
    while replies.borrow().is_empty() {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS);
    }
    assert_eq!(*replies.borrow(), vec![b"COMM_PET.rsp".to_vec()]);
}

fn client_local_peer(server: &meshcop::Server) -> std::net::SocketAddr {
    server.sessions().next().expect("one session").peer()
}

#[test]
fn wrong_password_fails_both_sides() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = Session::connect(config(), b"J01NMF", loopback(server.port())).unwrap();

    // The server rejects the Finished and its fatal alert puts the client
    // in Error, not Close.
    let mut rounds = 0;
    while client.state() == SessionState::Handshaking
        || !recorder.borrow().states.contains(&SessionState::Error)
    {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "handshake did not fail");
    }
    assert_eq!(client.state(), SessionState::Error);
    assert_eq!(recorder.borrow().states, vec![SessionState::Error]);
    assert!(client.write(b"nope").is_err());
}

#[test]
fn idle_session_expires() {
    let _ = env_logger::try_init();
    let config = Arc::new(
        Config::builder()
            .rng_seed(12)
            .session_timeout(Duration::from_millis(300))
            .build()
            .unwrap(),
    );
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config.clone(), PSK);
    let mut client = Session::connect(config, PSK, loopback(server.port())).unwrap();

    let mut rounds = 0;
    while !recorder.borrow().states.contains(&SessionState::Ready) {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS);
    }

    // The client stays quiet until the server gives up on it.
    while !recorder.borrow().states.contains(&SessionState::Expired) {
        step(&mut mainloop, &mut server, &mut []);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "session never expired");
    }
    assert_eq!(server.session_count(), 0);
}

#[test]
fn close_notify_ends_server_session() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut client = Session::connect(config(), PSK, loopback(server.port())).unwrap();

    let mut rounds = 0;
    while !recorder.borrow().states.contains(&SessionState::Ready) {
        step(&mut mainloop, &mut server, &mut [&mut client]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS);
    }

    client.close();
    assert_eq!(client.state(), SessionState::End);
    while !recorder.borrow().states.contains(&SessionState::Close) {
        step(&mut mainloop, &mut server, &mut []);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS, "close_notify not seen");
    }

    // Evicted on the next round.
    step(&mut mainloop, &mut server, &mut []);
    assert_eq!(server.session_count(), 0);
}

#[test]
fn two_clients_get_separate_sessions() {
    let _ = env_logger::try_init();
    let mut mainloop = Mainloop::new().unwrap();
    let (mut server, recorder) = server(config(), PSK);
    let mut a = Session::connect(config(), PSK, loopback(server.port())).unwrap();
    let mut b = Session::connect(config(), PSK, loopback(server.port())).unwrap();

    let mut rounds = 0;
    while recorder.borrow().states.len() < 2
        || a.state() == SessionState::Handshaking
        || b.state() == SessionState::Handshaking
    {
        step(&mut mainloop, &mut server, &mut [&mut a, &mut b]);
        rounds += 1;
        assert!(rounds < MAX_ROUNDS);
    }
    assert_eq!(a.state(), SessionState::Ready);
    assert_eq!(b.state(), SessionState::Ready);
    assert_eq!(server.session_count(), 2);
    assert_ne!(a.kek(), b.kek());
}
