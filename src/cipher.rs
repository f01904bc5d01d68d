//! Password-based symmetric cipher protecting wallet secrets at rest.
//!
//! Wire format: `base64(salt ‖ ciphertext)` with a fresh random 8-byte salt
//! per encryption. Key and IV come from the classic OpenSSL derive-until-full
//! loop (`digest = H(digest ‖ password ‖ salt)` concatenated until 48 bytes),
//! with SHA-256 as the digest, feeding AES-256-CBC with PKCS#7 padding.
//!
//! Decryption fails closed: malformed base64, a truncated blob, a padding
//! failure, or non-UTF-8 plaintext all collapse into [`Error::Decrypt`].
//! Callers must treat that as "no usable secret" and never retry with the
//! same password. Nothing in this module logs passwords or plaintext.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Derive a 32-byte key and 16-byte IV from a password and salt by chaining
/// digests until enough material is available.
fn key_and_iv(password: &str, salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut material = Vec::with_capacity(KEY_LEN + IV_LEN + Sha256::output_size());
    let mut block: Vec<u8> = Vec::new();
    while material.len() < KEY_LEN + IV_LEN {
        let mut hasher = Sha256::new();
        hasher.update(&block);
        hasher.update(password.as_bytes());
        hasher.update(salt);
        block = hasher.finalize().to_vec();
        material.extend_from_slice(&block);
    }
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}

/// Encrypt `plaintext` under `password`. Every call salts freshly, so equal
/// inputs produce distinct ciphertexts.
pub fn encrypt(plaintext: &str, password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let (key, iv) = key_and_iv(password, &salt);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut blob = Vec::with_capacity(SALT_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&ciphertext);
    BASE64.encode(blob)
}

/// Decrypt a blob produced by [`encrypt`]. Fails closed on any malformation.
pub fn decrypt(encrypted: &str, password: &str) -> Result<String> {
    let blob = BASE64.decode(encrypted.trim()).map_err(|_| Error::Decrypt)?;
    if blob.len() <= SALT_LEN || (blob.len() - SALT_LEN) % 16 != 0 {
        return Err(Error::Decrypt);
    }
    let (salt, ciphertext) = blob.split_at(SALT_LEN);
    let (key, iv) = key_and_iv(password, salt);

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| Error::Decrypt)
}

/// Fresh random per-wallet password, generated once at wallet creation and
/// never rotated.
pub fn generate_wallet_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}
