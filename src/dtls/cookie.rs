//! Stateless HelloVerifyRequest cookies (RFC 6347 4.2.1).
//!
//! A cookie is `HMAC-SHA256(secret, transport_id || client_random)`. The
//! secret rotates every `cookie_lifetime`; cookies minted under the previous
//! secret stay valid for one more period so a rotation never strands a client
//! mid-exchange.

use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::message::{Cookie, Random};
use crate::{Error, SeededRng};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_LEN: usize = 32;

pub struct CookieJar {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
    rotate_at: Instant,
    lifetime: Duration,
}

impl CookieJar {
    pub fn new(lifetime: Duration, now: Instant, rng: &mut SeededRng) -> Self {
        let mut current = [0_u8; 32];
        rng.fill_bytes(&mut current);
        CookieJar {
            current,
            previous: None,
            rotate_at: now + lifetime,
            lifetime,
        }
    }

    pub fn rotate_if_due(&mut self, now: Instant, rng: &mut SeededRng) {
        if now < self.rotate_at {
            return;
        }
        trace!("Rotating cookie secret");
        self.previous = Some(self.current);
        rng.fill_bytes(&mut self.current);
        self.rotate_at = now + self.lifetime;
    }

    pub fn generate(&self, transport_id: &[u8], client_random: &Random) -> Result<Cookie, Error> {
        let tag = mac(&self.current, transport_id, client_random)?.finalize();
        Cookie::try_new(&tag.into_bytes())
    }

    pub fn verify(&self, transport_id: &[u8], client_random: &Random, cookie: &[u8]) -> bool {
        if cookie.len() != COOKIE_LEN {
            return false;
        }
        let secrets = std::iter::once(&self.current).chain(self.previous.as_ref());
        for secret in secrets {
            let Ok(mac) = mac(secret, transport_id, client_random) else {
                return false;
            };
            if mac.verify_slice(cookie).is_ok() {
                return true;
            }
        }
        false
    }
}

fn mac(
    secret: &[u8; 32],
    transport_id: &[u8],
    client_random: &Random,
) -> Result<HmacSha256, Error> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| Error::CryptoError("invalid cookie secret".into()))?;
    mac.update(transport_id);
    mac.update(&client_random.0);
    Ok(mac)
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("rotate_at", &self.rotate_at)
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &[u8] = b"[fe80::1]:49191";

    #[test]
    fn cookie_bound_to_peer_and_random() {
        let now = Instant::now();
        let mut rng = SeededRng::new(Some(3));
        let jar = CookieJar::new(Duration::from_secs(60), now, &mut rng);
        let random = Random([9; 32]);

        let cookie = jar.generate(PEER, &random).unwrap();
        assert_eq!(cookie.len(), COOKIE_LEN);
        assert!(jar.verify(PEER, &random, &cookie));
        assert!(!jar.verify(b"[fe80::2]:49191", &random, &cookie));
        assert!(!jar.verify(PEER, &Random([8; 32]), &cookie));
        assert!(!jar.verify(PEER, &random, &[]));
    }

    #[test]
    fn previous_secret_survives_one_rotation() {
        let now = Instant::now();
        let lifetime = Duration::from_secs(60);
        let mut rng = SeededRng::new(Some(3));
        let mut jar = CookieJar::new(lifetime, now, &mut rng);
        let random = Random([1; 32]);
        let cookie = jar.generate(PEER, &random).unwrap();

        jar.rotate_if_due(now + lifetime, &mut rng);
        assert!(jar.verify(PEER, &random, &cookie));

        jar.rotate_if_due(now + lifetime * 2, &mut rng);
        assert!(!jar.verify(PEER, &random, &cookie));
    }
}
