//! Elliptic Curve J-PAKE over P-256 as used by the TLS_ECJPAKE suite.
//!
//! Both sides hold a low entropy password `s`. Round one exchanges two
//! ephemeral public keys each (`X1`, `X2` from the client, `X3`, `X4` from the
//! server), round two one combined key each. Every public key travels with a
//! Schnorr proof of knowledge of its discrete log. The premaster secret is
//! `SHA-256(x(K))`, which only matches when both sides used the same `s`.

use p256::elliptic_curve::group::Group;
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::point::AffineCoordinates;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar, U256};
use sha2::{Digest, Sha256};
use tinyvec::ArrayVec;

use super::message::{EcPoint, KeyKp, SchnorrZkp};
use crate::{Error, SeededRng};

/// Longest accepted password. PSKc is 16 bytes, PSKd at most 32 characters.
pub const MAX_PASSWORD_LEN: usize = 32;

/// Which side of the exchange we are. Decides the ZKP identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn id(&self) -> &'static [u8] {
        match self {
            Role::Client => b"client",
            Role::Server => b"server",
        }
    }

    fn peer(&self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

pub struct EcJpake {
    role: Role,
    s: Scalar,
    x1: Scalar,
    x2: Scalar,
    big_x1: ProjectivePoint,
    big_x2: ProjectivePoint,
    /// Peer round one keys.
    peer_x1: Option<ProjectivePoint>,
    peer_x2: Option<ProjectivePoint>,
    /// Peer round two key.
    peer_xm: Option<ProjectivePoint>,
}

impl EcJpake {
    pub fn new(role: Role, password: &[u8], rng: &mut SeededRng) -> Result<Self, Error> {
        if password.is_empty() {
            return Err(Error::InvalidArgument("empty J-PAKE password".into()));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(Error::TooLarge {
                what: "J-PAKE password",
                len: password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        let mut bytes = FieldBytes::default();
        bytes[32 - password.len()..].copy_from_slice(password);
        let s = <Scalar as Reduce<U256>>::reduce_bytes(&bytes);

        let x1 = non_zero_scalar(rng);
        let x2 = non_zero_scalar(rng);

        Ok(EcJpake {
            role,
            s,
            x1,
            x2,
            big_x1: ProjectivePoint::GENERATOR * x1,
            big_x2: ProjectivePoint::GENERATOR * x2,
            peer_x1: None,
            peer_x2: None,
            peer_xm: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Our two round one keys with proofs.
    pub fn round_one(&self, rng: &mut SeededRng) -> Result<(KeyKp, KeyKp), Error> {
        let g = ProjectivePoint::GENERATOR;
        let first = prove(&g, &self.x1, &self.big_x1, self.role.id(), rng)?;
        let second = prove(&g, &self.x2, &self.big_x2, self.role.id(), rng)?;
        Ok((first, second))
    }

    pub fn read_round_one(&mut self, pair: &(KeyKp, KeyKp)) -> Result<(), Error> {
        let g = ProjectivePoint::GENERATOR;
        let peer_id = self.role.peer().id();
        let peer_x1 = verify(&g, &pair.0, peer_id)?;
        let peer_x2 = verify(&g, &pair.1, peer_id)?;
        self.peer_x1 = Some(peer_x1);
        self.peer_x2 = Some(peer_x2);
        Ok(())
    }

    /// Our round two key `(x2 * s) * (X1 + X3 + X4)` with its proof.
    pub fn round_two(&self, rng: &mut SeededRng) -> Result<KeyKp, Error> {
        let (peer_x1, peer_x2) = self.peer_keys()?;
        let g = self.big_x1 + peer_x1 + peer_x2;
        if bool::from(g.is_identity()) {
            return Err(Error::SecurityError("degenerate round two base".into()));
        }
        let xm = self.x2 * self.s;
        let big_xm = g * xm;
        prove(&g, &xm, &big_xm, self.role.id(), rng)
    }

    pub fn read_round_two(&mut self, key_kp: &KeyKp) -> Result<(), Error> {
        let (peer_x1, _) = self.peer_keys()?;
        let g = peer_x1 + self.big_x1 + self.big_x2;
        if bool::from(g.is_identity()) {
            return Err(Error::SecurityError("degenerate round two base".into()));
        }
        let peer_xm = verify(&g, key_kp, self.role.peer().id())?;
        self.peer_xm = Some(peer_xm);
        Ok(())
    }

    /// `SHA-256(x(K))` where `K = (Xp - X4 * (x2 * s)) * x2`.
    pub fn premaster_secret(&self) -> Result<[u8; 32], Error> {
        let (_, peer_x2) = self.peer_keys()?;
        let Some(peer_xm) = self.peer_xm else {
            return Err(Error::InvalidState("J-PAKE round two not read"));
        };

        let k = (peer_xm - peer_x2 * (self.x2 * self.s)) * self.x2;
        if bool::from(k.is_identity()) {
            return Err(Error::SecurityError("J-PAKE shared point is identity".into()));
        }

        let x = k.to_affine().x();
        Ok(Sha256::digest(x).into())
    }

    fn peer_keys(&self) -> Result<(ProjectivePoint, ProjectivePoint), Error> {
        match (self.peer_x1, self.peer_x2) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::InvalidState("J-PAKE round one not read")),
        }
    }
}

impl std::fmt::Debug for EcJpake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcJpake")
            .field("role", &self.role)
            .field("round_one_read", &self.peer_x1.is_some())
            .field("round_two_read", &self.peer_xm.is_some())
            .finish()
    }
}

fn non_zero_scalar(rng: &mut SeededRng) -> Scalar {
    loop {
        let k = Scalar::random(&mut *rng);
        if !bool::from(k.is_zero()) {
            return k;
        }
    }
}

fn encode(point: &ProjectivePoint) -> Result<EcPoint, Error> {
    let encoded = point.to_affine().to_encoded_point(false);
    let bytes = encoded.as_bytes();
    let mut out = [0_u8; 65];
    if bytes.len() != out.len() {
        return Err(Error::CryptoError("cannot encode identity point".into()));
    }
    out.copy_from_slice(bytes);
    Ok(EcPoint(out))
}

fn decode(point: &EcPoint) -> Result<ProjectivePoint, Error> {
    let encoded = EncodedPoint::from_bytes(point.0)
        .map_err(|_| Error::SecurityError("malformed curve point".into()))?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    let affine = affine.ok_or_else(|| Error::SecurityError("point not on curve".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// `SHA-256(len(G) G len(V) V len(X) X len(id) id) mod n`, lengths as u32.
fn zkp_hash(g: &EcPoint, v: &EcPoint, x: &EcPoint, id: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    for point in [g, v, x] {
        hasher.update((point.0.len() as u32).to_be_bytes());
        hasher.update(point.0);
    }
    hasher.update((id.len() as u32).to_be_bytes());
    hasher.update(id);
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

fn prove(
    g: &ProjectivePoint,
    x: &Scalar,
    big_x: &ProjectivePoint,
    id: &[u8],
    rng: &mut SeededRng,
) -> Result<KeyKp, Error> {
    let v = non_zero_scalar(rng);
    let big_v = *g * v;

    let g_enc = encode(g)?;
    let v_enc = encode(&big_v)?;
    let x_enc = encode(big_x)?;

    let h = zkp_hash(&g_enc, &v_enc, &x_enc, id);
    let r = v - *x * h;

    let r_bytes = r.to_repr();
    let first = r_bytes.iter().position(|b| *b != 0).unwrap_or(31);
    let mut r_out = ArrayVec::new();
    r_out.extend_from_slice(&r_bytes[first..]);

    Ok(KeyKp {
        x: x_enc,
        zkp: SchnorrZkp { v: v_enc, r: r_out },
    })
}

/// Check `V == r*G + h*X` and return the decoded `X`.
fn verify(g: &ProjectivePoint, key_kp: &KeyKp, id: &[u8]) -> Result<ProjectivePoint, Error> {
    let big_x = decode(&key_kp.x)?;
    let big_v = decode(&key_kp.zkp.v)?;

    let mut repr = FieldBytes::default();
    let r = &key_kp.zkp.r;
    repr[32 - r.len()..].copy_from_slice(r);
    let r: Option<Scalar> = Scalar::from_repr(repr).into();
    let r = r.ok_or_else(|| Error::SecurityError("ZKP r out of range".into()))?;

    let h = zkp_hash(&encode(g)?, &key_kp.zkp.v, &key_kp.x, id);

    if *g * r + big_x * h != big_v {
        return Err(Error::SecurityError("ZKP verification failed".into()));
    }

    Ok(big_x)
}
