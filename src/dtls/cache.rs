use std::collections::VecDeque;

use super::crypto::MasterSecret;
use super::message::SessionId;

/// Server side resumption cache of `session id -> master secret`.
///
/// Bounded, oldest entry evicted first. A capacity of zero disables it.
#[derive(Debug, Default)]
pub struct SessionCache {
    capacity: usize,
    entries: VecDeque<(SessionId, MasterSecret)>,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        SessionCache {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn insert(&mut self, id: SessionId, master: MasterSecret) {
        if !self.is_enabled() || id.is_empty() {
            return;
        }
        self.entries.retain(|(k, _)| *k != id);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((id, master));
    }

    pub fn get(&self, id: &SessionId) -> Option<&MasterSecret> {
        if id.is_empty() {
            return None;
        }
        self.entries.iter().find(|(k, _)| k == id).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a client keeps to resume a session: the id the server assigned
/// and the master secret of the full handshake.
#[derive(Debug, Clone)]
pub struct ResumptionTicket {
    pub session_id: SessionId,
    pub master: MasterSecret,
}
