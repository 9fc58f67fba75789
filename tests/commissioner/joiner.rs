//! A joiner handshake relayed through the Border Agent, ending with the KEK
//! handed over exactly once.

use std::time::Instant;

use meshcop::meshcop::TlvType;
use meshcop::steering::SteeringData;
use meshcop::{CommissionerState, Pskd};

use crate::common::*;

fn ready_harness() -> Harness {
    let mut h = Harness::new(config().build().unwrap(), Verdict::Accept);
    h.connect_and_petition();
    h.run_until(|h| h.commissioner.is_accepted());

    let pskd = Pskd::new(PSKD).unwrap();
    h.commissioner
        .set_joiner(&pskd, &SteeringData::allow_all(), Instant::now())
        .unwrap();
    h.run_until(|h| h.commissioner.state() == CommissionerState::Ready);
    h
}

#[test]
fn joiner_is_finalized_and_kek_relayed_once() {
    let mut h = ready_harness();
    h.joiner = Some(Joiner::new(PSKD));

    h.run_until(|h| h.joiner.as_ref().is_some_and(|j| j.finalized.is_some()));

    let joiner = h.joiner.as_ref().unwrap();
    assert!(joiner.connected);
    assert_eq!(
        joiner.finalized.as_deref(),
        Some(&[TlvType::State.as_u8(), 1, 1][..])
    );

    assert_eq!(h.ba.seen.keks.len(), 1);
    let kek = joiner.kek.as_ref().expect("joiner kek");
    assert_eq!(h.ba.seen.keks[0], kek.as_bytes().to_vec());
    assert_eq!(h.commissioner.stats().finalized_joiners, 1);

    let peer = h.commissioner.relay_peer().expect("relay peer");
    assert_eq!(peer.udp_port, JOINER_PORT);
    assert_eq!(peer.iid, JOINER_IID);
    assert_eq!(peer.router_locator, ROUTER_LOCATOR);

    // Anything relayed afterwards goes without the KEK.
    let relayed = h.ba.seen.relayed;
    h.commissioner
        .send_relay_transmit(&[0x17, 0xFE, 0xFD], Instant::now())
        .unwrap();
    h.run_until(|h| h.ba.seen.relayed > relayed);
    assert_eq!(h.ba.seen.keks.len(), 1);
}

#[test]
fn joiner_with_wrong_pskd_never_gets_kek() {
    let mut h = ready_harness();
    h.joiner = Some(Joiner::new("J01NMF"));

    // The joiner's Finished cannot be verified, so nothing is finalized.
    for _ in 0..100 {
        h.step();
    }
    let joiner = h.joiner.as_ref().unwrap();
    assert!(!joiner.connected);
    assert!(h.ba.seen.keks.is_empty());
    assert_eq!(h.commissioner.stats().finalized_joiners, 0);
}
