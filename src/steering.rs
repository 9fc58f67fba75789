//! Steering data: the bloom filter telling mesh nodes which joiners may try.

use sha2::{Digest, Sha256};

use crate::meshcop::EUI64_LEN;
use crate::Error;

/// Longest steering data the Thread specification allows.
pub const MAX_STEERING_LEN: usize = 16;

/// Steering data length used for an EUI-64 filter when none is given.
pub const DEFAULT_STEERING_LEN: usize = 15;

const CRC16_CCITT: u16 = 0x1021;
const CRC16_ANSI: u16 = 0x8005;

/// Joiner identity derived from its EUI-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinerId([u8; EUI64_LEN]);

impl JoinerId {
    /// First 8 bytes of SHA-256(EUI-64) with the locally administered bit set.
    pub fn from_eui64(eui64: &[u8; EUI64_LEN]) -> Self {
        let digest = Sha256::digest(eui64);
        let mut id = [0_u8; EUI64_LEN];
        id.copy_from_slice(&digest[..EUI64_LEN]);
        id[0] |= 0x02;
        JoinerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; EUI64_LEN] {
        &self.0
    }
}

/// Bloom filter bit vector of 1 to 16 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SteeringData {
    bits: [u8; MAX_STEERING_LEN],
    len: usize,
}

impl SteeringData {
    /// An empty filter of `len` bytes.
    pub fn new(len: usize) -> Result<Self, Error> {
        if len == 0 || len > MAX_STEERING_LEN {
            return Err(Error::InvalidArgument(format!(
                "steering data length {} must be within 1..={}",
                len, MAX_STEERING_LEN
            )));
        }
        Ok(SteeringData {
            bits: [0; MAX_STEERING_LEN],
            len,
        })
    }

    /// Filter admitting every joiner: a single byte of all ones.
    pub fn allow_all() -> Self {
        let mut steering = SteeringData {
            bits: [0; MAX_STEERING_LEN],
            len: 1,
        };
        steering.set_all();
        steering
    }

    /// Set every bit, admitting any joiner.
    pub fn set_all(&mut self) {
        self.bits[..self.len].fill(0xFF);
    }

    /// Filter of `len` bytes (0 picks the default) admitting the given joiners.
    pub fn for_joiners<'a>(
        len: usize,
        eui64s: impl IntoIterator<Item = &'a [u8; EUI64_LEN]>,
    ) -> Result<Self, Error> {
        let len = if len == 0 { DEFAULT_STEERING_LEN } else { len };
        let mut steering = SteeringData::new(len)?;
        for eui64 in eui64s {
            steering.add_joiner(&JoinerId::from_eui64(eui64));
        }
        Ok(steering)
    }

    pub fn add_joiner(&mut self, joiner_id: &JoinerId) {
        let bits = self.num_bits();
        let ccitt = crc16(CRC16_CCITT, joiner_id.as_bytes());
        let ansi = crc16(CRC16_ANSI, joiner_id.as_bytes());
        self.set_bit(ccitt as usize % bits);
        self.set_bit(ansi as usize % bits);
    }

    pub fn contains(&self, joiner_id: &JoinerId) -> bool {
        let bits = self.num_bits();
        let ccitt = crc16(CRC16_CCITT, joiner_id.as_bytes());
        let ansi = crc16(CRC16_ANSI, joiner_id.as_bytes());
        self.get_bit(ccitt as usize % bits) && self.get_bit(ansi as usize % bits)
    }

    pub fn allows_any(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0xFF)
    }

    pub fn num_bits(&self) -> usize {
        self.len * 8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits[..self.len]
    }

    // Bit 0 is the least significant bit of the last byte.
    fn set_bit(&mut self, bit: usize) {
        self.bits[self.len - 1 - bit / 8] |= 1 << (bit % 8);
    }

    fn get_bit(&self, bit: usize) -> bool {
        self.bits[self.len - 1 - bit / 8] & (1 << (bit % 8)) != 0
    }
}

impl std::fmt::Debug for SteeringData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SteeringData(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// MSB first CRC-16 with zero initial value.
fn crc16(poly: u16, data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ poly
            } else {
                crc << 1
            };
        }
    }
    crc
}
