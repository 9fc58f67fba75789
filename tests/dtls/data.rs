//! Application data, replay and close_notify after the handshake.

use std::time::Instant;

use meshcop::Dtls;

use crate::common::*;

fn connected() -> (Dtls, Dtls) {
    let mut client = Dtls::new_client(config(), PSK).unwrap();
    let mut server = Dtls::new_server(config(), PSK, None).unwrap();
    handshake(&mut client, &mut server, Instant::now()).expect("handshake");
    (client, server)
}

#[test]
fn application_data_both_ways() {
    let (mut client, mut server) = connected();

    client.send_application_data(b"COMM_PET.req").unwrap();
    let got = deliver(&mut client, &mut server);
    assert_eq!(got.app_data, vec![b"COMM_PET.req".to_vec()]);

    server.send_application_data(b"COMM_PET.rsp").unwrap();
    let got = deliver(&mut server, &mut client);
    assert_eq!(got.app_data, vec![b"COMM_PET.rsp".to_vec()]);
}

#[test]
fn replayed_record_is_dropped() {
    let (mut client, mut server) = connected();

    client.send_application_data(b"once").unwrap();
    let out = drain(&mut client);
    assert_eq!(out.packets.len(), 1);

    server.handle_packet(&out.packets[0]).unwrap();
    assert_eq!(drain(&mut server).app_data.len(), 1);

    // Same epoch and sequence number again.
    let _ = server.handle_packet(&out.packets[0]);
    assert!(drain(&mut server).app_data.is_empty());
}

#[test]
fn tampered_record_is_dropped_after_connect() {
    let (mut client, mut server) = connected();

    client.send_application_data(b"payload").unwrap();
    let mut out = drain(&mut client);
    let last = out.packets[0].len() - 1;
    out.packets[0][last] ^= 0x01;

    let _ = server.handle_packet(&out.packets[0]);
    let got = drain(&mut server);
    assert!(got.app_data.is_empty());
    assert!(server.is_connected());
}

#[test]
fn close_notify_reaches_peer() {
    let (mut client, mut server) = connected();

    client.close().unwrap();
    let got = deliver(&mut client, &mut server);
    assert!(got.peer_closed);
    assert!(client.send_application_data(b"late").is_err());
}
