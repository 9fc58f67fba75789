use super::message::Sequence;

/// Records further behind the newest accepted one are dropped.
const WINDOW_SIZE: u64 = 64;

/// Anti-replay window over protected records (RFC 6347 4.1.2.6).
///
/// Tracks one epoch at a time. A record from a newer epoch restarts the
/// window; records from an older epoch are refused outright.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    epoch: u16,
    newest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the record is fresh. Marks it as seen.
    pub fn accept(&mut self, sequence: Sequence) -> bool {
        if sequence.epoch < self.epoch {
            return false;
        }
        if sequence.epoch > self.epoch {
            self.epoch = sequence.epoch;
            self.newest = None;
            self.bitmap = 0;
        }

        let seq = sequence.sequence_number;
        let Some(newest) = self.newest else {
            self.newest = Some(seq);
            self.bitmap = 1;
            return true;
        };

        if seq > newest {
            let shift = seq - newest;
            self.bitmap = if shift >= WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.newest = Some(seq);
            return true;
        }

        let offset = newest - seq;
        if offset >= WINDOW_SIZE {
            return false;
        }
        let mask = 1_u64 << offset;
        if self.bitmap & mask != 0 {
            return false;
        }
        self.bitmap |= mask;
        true
    }
}
