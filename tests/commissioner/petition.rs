//! Petition, steering data, keep-alive and resignation against a fake
//! Border Agent.

use std::time::{Duration, Instant};

use meshcop::steering::SteeringData;
use meshcop::CommissionerState;

use crate::common::*;

#[test]
fn accepted_petition_caches_session_id() {
    let mut h = Harness::new(config().build().unwrap(), Verdict::Accept);
    h.connect_and_petition();
    assert_eq!(h.commissioner.state(), CommissionerState::Connected);

    h.run_until(|h| h.commissioner.is_accepted());

    assert_eq!(h.commissioner.state(), CommissionerState::Accepted);
    assert_eq!(h.commissioner.session_id(), Some(SESSION_ID));
    assert_eq!(h.ba.seen.petitions, 1);
    assert_eq!(h.commissioner.stats().petitions, 1);
}

#[test]
fn rejected_petition_is_retried_then_abandoned() {
    let mut h = Harness::new(config().build().unwrap(), Verdict::Reject);
    h.connect_and_petition();

    h.run_until(|h| !h.commissioner.is_valid());

    // First attempt plus two retries.
    assert_eq!(h.ba.seen.petitions, 3);
    assert_eq!(h.commissioner.state(), CommissionerState::Invalid);
    assert!(!h.commissioner.is_accepted());
}

#[test]
fn steering_data_makes_commissioner_ready() {
    let mut h = Harness::new(config().build().unwrap(), Verdict::Accept);
    h.connect_and_petition();
    h.run_until(|h| h.commissioner.is_accepted());

    h.commissioner
        .commissioner_set(&SteeringData::allow_all(), Instant::now())
        .unwrap();
    h.run_until(|h| h.commissioner.state() == CommissionerState::Ready);

    assert_eq!(h.ba.seen.steering, vec![vec![0xFF]]);
    assert!(h.commissioner.is_accepted());
}

#[test]
fn set_before_acceptance_fails() {
    let mut h = Harness::new(config().build().unwrap(), Verdict::Accept);
    assert!(h
        .commissioner
        .commissioner_set(&SteeringData::allow_all(), Instant::now())
        .is_err());
    assert!(h.commissioner.petition(Instant::now()).is_err());
}

#[test]
fn keep_alive_is_periodic_and_resign_rejects() {
    let config = config()
        .keep_alive_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let mut h = Harness::new(config, Verdict::Accept);
    h.connect_and_petition();
    h.run_until(|h| h.commissioner.is_accepted());

    h.run_until(|h| h.commissioner.stats().keep_alive_rx >= 2);
    assert!(h.ba.seen.keep_alives.iter().all(|s| *s == 1));
    assert!(h.commissioner.is_accepted());

    h.commissioner.resign(Instant::now());
    h.run_until(|h| h.ba.seen.keep_alives.contains(&-1));
    // The agent echoes the rejection, which sends the commissioner back to
    // petitioning.
    h.run_until(|h| {
        h.commissioner.state() == CommissionerState::Rejected || h.ba.seen.petitions > 1
    });
}
