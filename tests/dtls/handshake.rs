//! EC J-PAKE handshake tests: full, cookie exchange, wrong password, resumption.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshcop::dtls::{check_client_hello, CookieJar, HelloCheck, SessionCache};
use meshcop::{Config, Dtls, Error, SeededRng};

use crate::common::*;

#[test]
fn same_password_connects_with_equal_kek() {
    let _ = env_logger::try_init();
    let now = Instant::now();

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    let mut server = Dtls::new_server(config(), PSK, None).unwrap();

    let pumped = handshake(&mut client, &mut server, now).expect("handshake");

    assert!(client.is_connected());
    assert!(server.is_connected());
    let client_kek = pumped.client_kek.expect("client kek");
    let server_kek = pumped.server_kek.expect("server kek");
    assert_eq!(client_kek, server_kek);
}

#[test]
fn different_password_fails() {
    let _ = env_logger::try_init();
    let now = Instant::now();

    let mut client = Dtls::new_client(config(), b"J01NME").unwrap();
    let mut server = Dtls::new_server(config(), b"J01NMF", None).unwrap();

    let result = handshake(&mut client, &mut server, now);

    assert!(result.is_err(), "mismatched passwords must not connect");
    assert!(!client.is_connected());
    assert!(!server.is_connected());
}

#[test]
fn client_hello_is_first_flight() {
    let _ = env_logger::try_init();
    let now = Instant::now();

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.handle_timeout(now).unwrap();
    let out = drain(&mut client);

    assert_eq!(out.packets.len(), 1);
    assert_eq!(handshake_types(&out.packets[0]), vec![CLIENT_HELLO]);
    assert!(!out.connected);
}

#[test]
fn cookie_exchange_precedes_server_state() {
    let _ = env_logger::try_init();
    let now = Instant::now();
    let mut rng = SeededRng::new(Some(1));
    let jar = CookieJar::new(Duration::from_secs(60), now, &mut rng);

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.handle_timeout(now).unwrap();
    let first = drain(&mut client).packets.remove(0);

    // No cookie yet: the check answers without any server endpoint.
    let HelloCheck::HelloVerifyRequest(hvr) = check_client_hello(&jar, b"peer", &first) else {
        panic!("expected HelloVerifyRequest");
    };
    assert_eq!(handshake_types(&hvr), vec![HELLO_VERIFY_REQUEST]);

    client.handle_packet(&hvr).unwrap();
    client.handle_timeout(now).unwrap();
    let second = drain(&mut client).packets.remove(0);
    assert_eq!(handshake_types(&second), vec![CLIENT_HELLO]);
    assert_eq!(check_client_hello(&jar, b"peer", &second), HelloCheck::Verified);

    // Only now is a server endpoint allocated.
    let mut server = Dtls::new_server(config(), PSK, None).unwrap();
    server.handle_packet(&second).unwrap();
    server.handle_timeout(now).unwrap();
    let flight = drain(&mut server);
    assert!(flight
        .packets
        .iter()
        .flat_map(|p| handshake_types(p))
        .any(|t| t == SERVER_HELLO));

    for p in &flight.packets {
        client.handle_packet(p).unwrap();
    }
    handshake(&mut client, &mut server, now).expect("complete handshake");
    assert!(client.is_connected());
    assert!(server.is_connected());
}

#[test]
fn cached_session_is_resumed() {
    let _ = env_logger::try_init();
    let now = Instant::now();
    let cache = Arc::new(Mutex::new(SessionCache::new(4)));
    let server_config = Arc::new(
        Config::builder()
            .rng_seed(7)
            .session_cache_capacity(4)
            .build()
            .unwrap(),
    );

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    let mut server = Dtls::new_server(server_config.clone(), PSK, Some(cache.clone())).unwrap();
    let first = handshake(&mut client, &mut server, now).expect("full handshake");
    assert_eq!(cache.lock().unwrap().len(), 1);

    let ticket = client.resumption_ticket().expect("ticket");
    let mut client = Dtls::resume_client(config(), PSK, ticket).unwrap();
    let mut server = Dtls::new_server(server_config, PSK, Some(cache)).unwrap();

    client.handle_timeout(now).unwrap();
    let hello = drain(&mut client);
    for p in &hello.packets {
        server.handle_packet(p).unwrap();
    }
    server.handle_timeout(now).unwrap();
    let resumed = drain(&mut server);
    let types: Vec<u8> = resumed
        .packets
        .iter()
        .flat_map(|p| handshake_types(p))
        .collect();
    // ServerHello in the clear, no key exchange.
    assert_eq!(types, vec![SERVER_HELLO]);

    for p in &resumed.packets {
        client.handle_packet(p).unwrap();
    }
    let second = handshake(&mut client, &mut server, now).expect("abbreviated handshake");
    assert!(client.is_connected());
    assert!(server.is_connected());
    assert!(second.client_kek.is_some());
    assert!(first.client_kek.is_some());
}

#[test]
fn data_before_connect_needs_handshake() {
    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.send_application_data(b"early").unwrap();
    assert!(!client.is_connected());

    let mut server = Dtls::new_server(config(), PSK, None).unwrap();
    let pumped = handshake(&mut client, &mut server, Instant::now()).unwrap();
    assert_eq!(pumped.server_data, vec![b"early".to_vec()]);
}

#[test]
fn closed_endpoint_rejects_input() {
    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.close().unwrap();
    assert!(matches!(
        client.handle_packet(&[0x16, 0xFE, 0xFD]),
        Err(Error::InvalidState(_))
    ));
}
