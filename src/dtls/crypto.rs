//! Key schedule and record protection for TLS_ECJPAKE_WITH_AES_128_CCM_8.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::aead::consts::{U12, U8};
use ccm::Ccm;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::message::{ContentType, ProtocolVersion, Random, Sequence};
use crate::buffer::Buf;
use crate::Error;

type HmacSha256 = Hmac<Sha256>;
type Aes128Ccm8 = Ccm<Aes128, U8, U12>;

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;

const KEY_LEN: usize = 16;
const FIXED_IV_LEN: usize = 4;
const KEY_BLOCK_LEN: usize = 2 * KEY_LEN + 2 * FIXED_IV_LEN;

/// 8 byte explicit nonce in front of every protected fragment.
pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 8;
pub const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + TAG_LEN;

/// TLS 1.2 PRF with P_SHA256 (RFC 5246 5).
pub fn prf(secret: &[u8], label: &str, seed: &[&[u8]], out: &mut [u8]) -> Result<(), Error> {
    let mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|_| Error::CryptoError("invalid PRF secret".into()))?;

    let with_seed = |m: &mut HmacSha256| {
        m.update(label.as_bytes());
        for part in seed {
            m.update(part);
        }
    };

    // A(1) = HMAC(secret, label + seed)
    let mut a = {
        let mut m = mac.clone();
        with_seed(&mut m);
        m.finalize().into_bytes()
    };

    let mut written = 0;
    while written < out.len() {
        let mut m = mac.clone();
        m.update(&a);
        with_seed(&mut m);
        let block = m.finalize().into_bytes();

        let n = (out.len() - written).min(block.len());
        out[written..written + n].copy_from_slice(&block[..n]);
        written += n;

        let mut m = mac.clone();
        m.update(&a);
        a = m.finalize().into_bytes();
    }

    Ok(())
}

#[derive(Clone)]
pub struct MasterSecret(pub [u8; MASTER_SECRET_LEN]);

impl MasterSecret {
    pub fn derive(
        premaster: &[u8],
        client_random: &Random,
        server_random: &Random,
    ) -> Result<Self, Error> {
        let mut out = [0_u8; MASTER_SECRET_LEN];
        prf(
            premaster,
            "master secret",
            &[&client_random.0, &server_random.0],
            &mut out,
        )?;
        Ok(MasterSecret(out))
    }

    /// `PRF(master, label, SHA-256(handshake_messages))[..12]`.
    pub fn verify_data(
        &self,
        label: &str,
        transcript: &[u8],
    ) -> Result<[u8; VERIFY_DATA_LEN], Error> {
        let hash = Sha256::digest(transcript);
        let mut out = [0_u8; VERIFY_DATA_LEN];
        prf(&self.0, label, &[&hash], &mut out)?;
        Ok(out)
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Key encryption key exported by a completed handshake.
///
/// `SHA-256` over the key block (client/server MAC keys, which are empty for
/// CCM, write keys and fixed IVs).
#[derive(Clone, PartialEq, Eq)]
pub struct Kek([u8; 32]);

impl Kek {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for Kek {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Kek(..)")
    }
}

/// `PRF(master, "key expansion", server_random + client_random)`.
pub struct KeyBlock([u8; KEY_BLOCK_LEN]);

impl KeyBlock {
    pub fn derive(
        master: &MasterSecret,
        client_random: &Random,
        server_random: &Random,
    ) -> Result<Self, Error> {
        let mut out = [0_u8; KEY_BLOCK_LEN];
        prf(
            &master.0,
            "key expansion",
            &[&server_random.0, &client_random.0],
            &mut out,
        )?;
        Ok(KeyBlock(out))
    }

    fn client_write_key(&self) -> &[u8] {
        &self.0[..KEY_LEN]
    }

    fn server_write_key(&self) -> &[u8] {
        &self.0[KEY_LEN..2 * KEY_LEN]
    }

    fn client_iv(&self) -> [u8; FIXED_IV_LEN] {
        let mut iv = [0; FIXED_IV_LEN];
        iv.copy_from_slice(&self.0[2 * KEY_LEN..2 * KEY_LEN + FIXED_IV_LEN]);
        iv
    }

    fn server_iv(&self) -> [u8; FIXED_IV_LEN] {
        let mut iv = [0; FIXED_IV_LEN];
        iv.copy_from_slice(&self.0[2 * KEY_LEN + FIXED_IV_LEN..]);
        iv
    }

    pub fn kek(&self) -> Kek {
        Kek(Sha256::digest(self.0).into())
    }
}

impl Drop for KeyBlock {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// AES-128-CCM-8 for both directions of one connection.
pub struct RecordCipher {
    write: Aes128Ccm8,
    write_iv: [u8; FIXED_IV_LEN],
    read: Aes128Ccm8,
    read_iv: [u8; FIXED_IV_LEN],
}

impl RecordCipher {
    pub fn new(key_block: &KeyBlock, is_client: bool) -> Result<Self, Error> {
        let client = cipher(key_block.client_write_key())?;
        let server = cipher(key_block.server_write_key())?;
        let (write, write_iv, read, read_iv) = if is_client {
            (client, key_block.client_iv(), server, key_block.server_iv())
        } else {
            (server, key_block.server_iv(), client, key_block.client_iv())
        };
        Ok(RecordCipher {
            write,
            write_iv,
            read,
            read_iv,
        })
    }

    /// Append `explicit_nonce || ciphertext || tag` for `plaintext` to `out`.
    pub fn seal(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<(), Error> {
        let explicit = sequence.to_bytes();
        let nonce = nonce(&self.write_iv, &explicit);
        let aad = aad(content_type, sequence, plaintext.len());

        out.extend_from_slice(&explicit);
        let start = out.len();
        out.extend_from_slice(plaintext);
        let tag = self
            .write
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &aad, &mut out[start..])
            .map_err(|_| Error::CryptoError("CCM encryption failed".into()))?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Decrypt a protected fragment into `out` (cleared first).
    pub fn open(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        fragment: &[u8],
        out: &mut Buf,
    ) -> Result<(), Error> {
        if fragment.len() < AEAD_OVERHEAD {
            return Err(Error::CryptoError(format!(
                "protected fragment too short: {}",
                fragment.len()
            )));
        }
        let (explicit, body) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let nonce = nonce(&self.read_iv, explicit);
        let aad = aad(content_type, sequence, body.len() - TAG_LEN);

        out.clear();
        out.extend_from_slice(body);
        self.read
            .decrypt_in_place(GenericArray::from_slice(&nonce), &aad, out)
            .map_err(|_| Error::CryptoError("CCM authentication failed".into()))
    }
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecordCipher(AES-128-CCM-8)")
    }
}

fn cipher(key: &[u8]) -> Result<Aes128Ccm8, Error> {
    Aes128Ccm8::new_from_slice(key).map_err(|_| Error::CryptoError("invalid CCM key".into()))
}

fn nonce(fixed: &[u8; FIXED_IV_LEN], explicit: &[u8]) -> [u8; 12] {
    let mut nonce = [0_u8; 12];
    nonce[..FIXED_IV_LEN].copy_from_slice(fixed);
    nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
    nonce
}

/// seq_num(8) + type(1) + version(2) + length(2)
fn aad(content_type: ContentType, sequence: Sequence, len: usize) -> [u8; 13] {
    let mut aad = [0_u8; 13];
    aad[..8].copy_from_slice(&sequence.to_bytes());
    aad[8] = content_type.as_u8();
    aad[9..11].copy_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
    aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}
