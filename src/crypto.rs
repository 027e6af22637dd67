//! Cryptographic primitives for vtunnel
//!
//! Derives an AES-256 key pair and a header fingerprint from a pre-shared
//! passphrase, and encrypts datagram payloads with AES-256-CBC + PKCS#7.
//! Each ciphertext is prefixed with a fresh random IV.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::{Aes256Dec, Aes256Enc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256Enc>;
type Aes256CbcDec = cbc::Decryptor<Aes256Dec>;

/// AES block size / IV size
pub const BLOCK_SIZE: usize = 16;

/// Length of the passphrase fingerprint carried in every header
pub const FINGERPRINT_LEN: usize = 16;

/// Worst-case growth of a payload: one IV plus one full padding block
pub const MAX_OVERHEAD: usize = BLOCK_SIZE * 2;

/// Fingerprint used by both ends when encryption is turned off.
/// Public and documented, not a secret.
pub const PLAINTEXT_FINGERPRINT: Fingerprint = *b"vtunnel-cleartxt";

const KEY_CONTEXT: &[u8] = b"vtunnel-key\0";
const AUTH_CONTEXT: &[u8] = b"vtunnel-auth\0";

/// Passphrase fingerprint embedded in datagram headers
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Derive `(encrypt_key, decrypt_key, fingerprint)` from a passphrase.
///
/// Both key schedules come from the same 256-bit key. The fingerprint is
/// derived under a separate context so it never exposes key bytes.
pub fn derive_keys(passphrase: &str) -> (Aes256Enc, Aes256Dec, Fingerprint) {
    let key = Sha256::new()
        .chain_update(KEY_CONTEXT)
        .chain_update(passphrase.as_bytes())
        .finalize();
    let auth = Sha256::new()
        .chain_update(AUTH_CONTEXT)
        .chain_update(passphrase.as_bytes())
        .finalize();

    let mut fingerprint = [0u8; FINGERPRINT_LEN];
    fingerprint.copy_from_slice(&auth[..FINGERPRINT_LEN]);

    (Aes256Enc::new(&key), Aes256Dec::new(&key), fingerprint)
}

/// Encrypt `plaintext`, returning `IV || ciphertext`
pub fn encrypt(plaintext: &[u8], key: &Aes256Enc) -> Vec<u8> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::inner_iv_init(key.clone(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt `IV || ciphertext` and strip the padding.
///
/// Any structural problem (short input, misaligned length, bad padding)
/// is reported as [`Error::AuthOrPadding`] and no plaintext is returned.
pub fn decrypt(ciphertext: &[u8], key: &Aes256Dec) -> Result<Vec<u8>> {
    if ciphertext.len() < BLOCK_SIZE * 2 || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::AuthOrPadding);
    }
    let (iv, body) = ciphertext.split_at(BLOCK_SIZE);
    let mut iv_block = [0u8; BLOCK_SIZE];
    iv_block.copy_from_slice(iv);

    Aes256CbcDec::inner_iv_init(key.clone(), &iv_block.into())
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| Error::AuthOrPadding)
}

/// Compare two fingerprints without an early exit
pub fn fingerprints_match(a: &Fingerprint, b: &Fingerprint) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Key material derived once at startup and never mutated
#[derive(Clone)]
pub struct KeyMaterial {
    encrypt_key: Aes256Enc,
    decrypt_key: Aes256Dec,
    fingerprint: Fingerprint,
}

impl KeyMaterial {
    /// Derive key material from a passphrase
    pub fn derive(passphrase: &str) -> Self {
        let (encrypt_key, decrypt_key, fingerprint) = derive_keys(passphrase);
        debug!("Derived session keys (fingerprint {})", hex::encode(&fingerprint[..4]));
        Self {
            encrypt_key,
            decrypt_key,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &hex::encode(&self.fingerprint[..4]))
            .finish_non_exhaustive()
    }
}

/// Process-wide payload protection: either keyed or explicitly cleartext.
#[derive(Clone, Debug)]
pub enum Crypto {
    Encrypted(KeyMaterial),
    Plaintext,
}

impl Crypto {
    /// Build from an optional passphrase. `None` selects cleartext mode
    /// and says so in the log.
    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(p) => Crypto::Encrypted(KeyMaterial::derive(p)),
            None => {
                warn!("Encryption disabled: tunnel traffic will be sent in cleartext");
                Crypto::Plaintext
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Crypto::Encrypted(_))
    }

    /// Fingerprint placed in (and expected from) every header
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Crypto::Encrypted(keys) => keys.fingerprint(),
            Crypto::Plaintext => &PLAINTEXT_FINGERPRINT,
        }
    }

    /// Maximum number of bytes `encrypt` adds to a payload
    pub fn overhead(&self) -> usize {
        match self {
            Crypto::Encrypted(_) => MAX_OVERHEAD,
            Crypto::Plaintext => 0,
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            Crypto::Encrypted(keys) => encrypt(plaintext, &keys.encrypt_key),
            Crypto::Plaintext => plaintext.to_vec(),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Crypto::Encrypted(keys) => decrypt(ciphertext, &keys.decrypt_key),
            Crypto::Plaintext => Ok(ciphertext.to_vec()),
        }
    }
}
