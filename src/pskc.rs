//! Commissioner and joiner credentials.

use aes::Aes128;
use cmac::{Cmac, Mac};
use zeroize::Zeroize;

use crate::meshcop::{PSKC_LEN, PSKD_MAX_LEN, PSKD_MIN_LEN};
use crate::Error;

const PBKDF2_ITERATIONS: u32 = 16384;
const SALT_PREFIX: &[u8] = b"Thread";
const MAX_NETWORK_NAME_LEN: usize = 16;

/// Pre-shared commissioner key.
#[derive(Clone, PartialEq, Eq)]
pub struct Pskc([u8; PSKC_LEN]);

impl Pskc {
    pub fn new(bytes: [u8; PSKC_LEN]) -> Self {
        Pskc(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; PSKC_LEN] = bytes.try_into().map_err(|_| Error::TooLarge {
            what: "pskc",
            len: bytes.len(),
            max: PSKC_LEN,
        })?;
        Ok(Pskc(array))
    }

    /// Derive the PSKc from the network passphrase.
    ///
    /// PBKDF2 with AES-CMAC-PRF-128, salted with "Thread", the extended PAN
    /// id and the network name.
    pub fn derive(passphrase: &str, xpanid: &[u8; 8], network_name: &str) -> Result<Self, Error> {
        if network_name.len() > MAX_NETWORK_NAME_LEN {
            return Err(Error::TooLarge {
                what: "network name",
                len: network_name.len(),
                max: MAX_NETWORK_NAME_LEN,
            });
        }

        let mut salt = Vec::with_capacity(SALT_PREFIX.len() + 8 + network_name.len() + 4);
        salt.extend_from_slice(SALT_PREFIX);
        salt.extend_from_slice(xpanid);
        salt.extend_from_slice(network_name.as_bytes());
        // Block index. A 16 byte key is a single block.
        salt.extend_from_slice(&1_u32.to_be_bytes());

        let mut key = cmac_prf_key(passphrase.as_bytes())?;

        let mut u = cmac(&key, &salt)?;
        let mut out = u;
        for _ in 1..PBKDF2_ITERATIONS {
            u = cmac(&key, &u)?;
            for (o, b) in out.iter_mut().zip(u.iter()) {
                *o ^= b;
            }
        }
        key.zeroize();

        Ok(Pskc(out))
    }

    pub fn as_bytes(&self) -> &[u8; PSKC_LEN] {
        &self.0
    }
}

impl Drop for Pskc {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Pskc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pskc").field(&"<redacted>").finish()
    }
}

/// AES-CMAC-PRF-128 (RFC 4615) key normalisation.
fn cmac_prf_key(password: &[u8]) -> Result<[u8; 16], Error> {
    if password.len() == 16 {
        let mut key = [0_u8; 16];
        key.copy_from_slice(password);
        Ok(key)
    } else {
        cmac(&[0_u8; 16], password)
    }
}

fn cmac(key: &[u8; 16], data: &[u8]) -> Result<[u8; 16], Error> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|e| Error::CryptoError(format!("cmac key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Joiner passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct Pskd(String);

impl Pskd {
    /// Validate a joiner passphrase.
    ///
    /// 6 to 32 uppercase alphanumerics, excluding I, O, Q and Z.
    pub fn new(pskd: &str) -> Result<Self, Error> {
        if pskd.len() < PSKD_MIN_LEN || pskd.len() > PSKD_MAX_LEN {
            return Err(Error::InvalidArgument(format!(
                "pskd length {} must be within {}..={}",
                pskd.len(),
                PSKD_MIN_LEN,
                PSKD_MAX_LEN
            )));
        }
        let valid = pskd.bytes().all(|c| {
            c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, b'I' | b'O' | b'Q' | b'Z'))
        });
        if !valid {
            return Err(Error::InvalidArgument(
                "pskd must be uppercase alphanumerics without I, O, Q, Z".into(),
            ));
        }
        Ok(Pskd(pskd.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Drop for Pskd {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Pskd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pskd").field(&"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pskc_known_vector() {
        let xpanid = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let pskc = Pskc::derive("12SECRETPASSWORD34", &xpanid, "Test Network").unwrap();
        assert_eq!(
            pskc.as_bytes(),
            &[
                0xc3, 0xf5, 0x93, 0x68, 0x44, 0x5a, 0x1b, 0x61, 0x06, 0xbe, 0x42, 0x0a, 0x70,
                0x6d, 0x4c, 0xc9
            ]
        );
    }

    #[test]
    fn pskc_from_slice_checks_length() {
        assert!(Pskc::from_slice(&[0; 15]).is_err());
        assert!(Pskc::from_slice(&[0; 16]).is_ok());
    }

    #[test]
    fn pskd_rules() {
        assert!(Pskd::new("J01NME").is_ok());
        assert!(Pskd::new("ABCDE").is_err());
        assert!(Pskd::new("J01NMEQ").is_err());
        assert!(Pskd::new("j01nme").is_err());
        assert!(Pskd::new(&"A".repeat(33)).is_err());
        assert!(Pskd::new(&"A".repeat(32)).is_ok());
    }
}
