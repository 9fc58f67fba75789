use nom::bytes::complete::{tag, take};
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};
use tinyvec::ArrayVec;

/// Uncompressed SEC1 encoding of a P-256 point.
pub const POINT_LEN: usize = 65;

/// curve_type named_curve(3), secp256r1(23).
const EC_PARAMETERS: &[u8] = &[0x03, 0x00, 0x17];

/// An uncompressed curve point, `opaque point<1..2^8-1>` on the wire.
///
/// Only the encoding is validated here. Whether the point is on the curve
/// is decided when the J-PAKE engine decodes it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcPoint(pub [u8; POINT_LEN]);

impl EcPoint {
    pub fn parse(input: &[u8]) -> IResult<&[u8], EcPoint> {
        let (input, len) = be_u8(input)?;
        if len as usize != POINT_LEN {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, data) = take(POINT_LEN)(input)?;
        if data[0] != 0x04 {
            return Err(Err::Failure(Error::new(input, ErrorKind::Verify)));
        }
        let mut point = [0_u8; POINT_LEN];
        point.copy_from_slice(data);
        Ok((input, EcPoint(point)))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(POINT_LEN as u8);
        output.extend_from_slice(&self.0);
    }
}

impl std::fmt::Debug for EcPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EcPoint({:02x?}..)", &self.0[1..5])
    }
}

/// Schnorr proof of knowledge of the discrete log of a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchnorrZkp {
    pub v: EcPoint,
    /// Big endian `r`, leading zeros stripped.
    pub r: ArrayVec<[u8; 32]>,
}

impl SchnorrZkp {
    pub fn parse(input: &[u8]) -> IResult<&[u8], SchnorrZkp> {
        let (input, v) = EcPoint::parse(input)?;
        let (input, len) = be_u8(input)?;
        if len == 0 || len > 32 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, data) = take(len as usize)(input)?;
        let mut r = ArrayVec::new();
        r.extend_from_slice(data);
        Ok((input, SchnorrZkp { v, r }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.v.serialize(output);
        output.push(self.r.len() as u8);
        output.extend_from_slice(&self.r);
    }
}

/// A public key `X` together with its proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyKp {
    pub x: EcPoint,
    pub zkp: SchnorrZkp,
}

impl KeyKp {
    pub fn parse(input: &[u8]) -> IResult<&[u8], KeyKp> {
        let (input, x) = EcPoint::parse(input)?;
        let (input, zkp) = SchnorrZkp::parse(input)?;
        Ok((input, KeyKp { x, zkp }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.x.serialize(output);
        self.zkp.serialize(output);
    }

    /// Round one payload: two consecutive KeyKPs, as carried in the
    /// `ecjpake_key_kp_pair` hello extension.
    pub fn parse_pair(input: &[u8]) -> IResult<&[u8], (KeyKp, KeyKp)> {
        let (input, first) = KeyKp::parse(input)?;
        let (input, second) = KeyKp::parse(input)?;
        Ok((input, (first, second)))
    }

    pub fn serialize_pair(pair: &(KeyKp, KeyKp), output: &mut Vec<u8>) {
        pair.0.serialize(output);
        pair.1.serialize(output);
    }
}

/// Server round two, prefixed by the curve it was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub key_kp: KeyKp,
}

impl ServerKeyExchange {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerKeyExchange> {
        let (input, _) = tag::<_, _, Error<&[u8]>>(EC_PARAMETERS)(input)?;
        let (input, key_kp) = KeyKp::parse(input)?;
        Ok((input, ServerKeyExchange { key_kp }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(EC_PARAMETERS);
        self.key_kp.serialize(output);
    }
}

/// Client round two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub key_kp: KeyKp,
}

impl ClientKeyExchange {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientKeyExchange> {
        let (input, key_kp) = KeyKp::parse(input)?;
        Ok((input, ClientKeyExchange { key_kp }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.key_kp.serialize(output);
    }
}
