//! Flight retransmission and handshake give-up.

use std::time::{Duration, Instant};

use meshcop::Dtls;

use crate::common::*;

#[test]
fn client_hello_is_resent_with_new_sequence() {
    let _ = env_logger::try_init();
    let mut now = Instant::now();

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.handle_timeout(now).unwrap();
    let first = drain(&mut client);
    assert_eq!(first.packets.len(), 1);

    // Arms the flight timer.
    client.handle_timeout(now).unwrap();
    let timeout = drain(&mut client).timeout.expect("timeout");
    assert!(timeout > now);

    now = timeout;
    client.handle_timeout(now).unwrap();
    let resend = drain(&mut client);
    assert_eq!(resend.packets.len(), 1);
    assert_eq!(handshake_types(&resend.packets[0]), vec![CLIENT_HELLO]);
    assert!(record_seqs(&resend.packets[0])[0] > record_seqs(&first.packets[0])[0]);
}

#[test]
fn lost_server_flight_is_resent_on_duplicate() {
    let _ = env_logger::try_init();
    let now = Instant::now();

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    let mut server = Dtls::new_server(config(), PSK, None).unwrap();

    client.handle_timeout(now).unwrap();
    let hello = drain(&mut client);
    server.handle_packet(&hello.packets[0]).unwrap();
    let lost = drain(&mut server);
    assert!(!lost.packets.is_empty());

    // The client never saw flight 4 and sends its ClientHello again.
    server.handle_packet(&hello.packets[0]).unwrap();
    let again = drain(&mut server);
    let types: Vec<u8> = again
        .packets
        .iter()
        .flat_map(|p| handshake_types(p))
        .collect();
    assert!(types.contains(&SERVER_HELLO));
}

#[test]
fn unanswered_handshake_gives_up() {
    let _ = env_logger::try_init();
    let mut now = Instant::now();

    let mut client = Dtls::new_client(config(), PSK).unwrap();
    client.handle_timeout(now).unwrap();

    let mut failed = false;
    for _ in 0..20 {
        now += Duration::from_secs(20);
        if client.handle_timeout(now).is_err() {
            failed = true;
            break;
        }
        drain(&mut client);
    }
    assert!(failed, "handshake must time out");
    assert!(!client.is_connected());
}
