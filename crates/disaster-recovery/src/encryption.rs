//! Backup encryption
//!
//! Wire format: `IV(16 bytes) || AES-256-CBC(ciphertext)`. The key is the
//! supplied secret right-padded with zero bytes (or truncated) to 32
//! bytes; the padding scheme is kept for compatibility with existing
//! backups, and `derive_key` is the single seam where a KDF would slot in.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{DrError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Right-pads/truncates the secret to exactly 32 key bytes.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    let bytes = secret.as_bytes();
    let len = bytes.len().min(32);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

/// Encrypts `plaintext`, prepending a random 16-byte IV.
pub fn encrypt(plaintext: &[u8], secret: &str) -> Vec<u8> {
    let key = derive_key(secret);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts an `IV || ciphertext` blob.
pub fn decrypt(blob: &[u8], secret: &str) -> Result<Vec<u8>> {
    if blob.len() <= IV_LEN {
        return Err(DrError::Encryption("blob shorter than IV".to_string()));
    }
    let key = derive_key(secret);
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().expect("split length");

    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|err| DrError::Encryption(format!("decryption failed: {err}")))
}
