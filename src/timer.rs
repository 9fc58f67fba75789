use std::time::Duration;

use crate::SeededRng;

/// Upper bound on a single retransmission interval (RFC 6347 4.2.4.1).
const MAX_RTO: Duration = Duration::from_secs(60);

/// Flight retransmission schedule.
///
/// Starts at the configured RTO and doubles per attempt, capped at 60s,
/// with a random ±10% spread so peers that lost the same datagram do not
/// retransmit in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    start_rto: Duration,
    max_attempts: usize,
    attempts: usize,
    spread: f32,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, max_attempts: usize, rng: &mut SeededRng) -> Self {
        Self {
            start_rto,
            max_attempts,
            attempts: 0,
            spread: Self::spread(rng),
        }
    }

    pub fn reset(&mut self, rng: &mut SeededRng) {
        self.attempts = 0;
        self.spread = Self::spread(rng);
    }

    pub fn rto(&self) -> Duration {
        let base = self
            .start_rto
            .saturating_mul(1 << self.attempts.min(16))
            .min(MAX_RTO);
        base.mul_f32(self.spread).max(Duration::from_millis(50))
    }

    // 0.9..1.1
    fn spread(rng: &mut SeededRng) -> f32 {
        0.9 + rng.random::<f32>() * 0.2
    }

    pub fn attempt(&mut self, rng: &mut SeededRng) {
        if !self.can_retry() {
            return;
        }
        self.attempts += 1;
        self.spread = Self::spread(rng);
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn doubles_until_exhausted() {
        let mut rng = SeededRng::new(Some(42));
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), 3, &mut rng);

        let first = backoff.rto();
        assert!(first >= Duration::from_millis(900) && first <= Duration::from_millis(1100));

        let mut previous = first;
        for _ in 0..3 {
            assert!(backoff.can_retry());
            backoff.attempt(&mut rng);
            let next = backoff.rto();
            assert!(next > previous);
            previous = next;
        }

        assert!(!backoff.can_retry());
        backoff.attempt(&mut rng);
        assert_eq!(backoff.rto(), previous);
    }

    #[test]
    fn capped_at_sixty_seconds() {
        let mut rng = SeededRng::new(Some(7));
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(40), 5, &mut rng);
        backoff.attempt(&mut rng);
        assert!(backoff.rto() <= MAX_RTO.mul_f32(1.1));
    }
}
