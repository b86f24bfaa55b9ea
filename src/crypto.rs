// MIT License - Copyright (c) 2026 Peter Wright

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use tracing::error;

use crate::error::{BridgeError, Result};

type HmacSha256 = Hmac<Sha256>;

/// AES block size; the basestation always speaks AES-128-CBC.
pub const BLOCK_SIZE: usize = 16;

/// MD5 of a string, as raw bytes.
///
/// Used both to derive the AES key from the phone secret and to derive
/// the per-request IV from the request timestamp.
pub fn md5_bytes(s: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    hasher.finalize().into()
}

/// Derive the AES-128 key from the phone secret.
pub fn derive_key(phone_secret: &str) -> Vec<u8> {
    md5_bytes(phone_secret).to_vec()
}

/// Derive the per-request IV from a millisecond timestamp.
///
/// The IV is the MD5 of the decimal ASCII rendering of the timestamp, so
/// signer and verifier agree as long as they agree on `t`.
pub fn derive_iv(t: i64) -> [u8; 16] {
    md5_bytes(&t.to_string())
}

fn new_block_cipher(key: &[u8]) -> Result<Aes128> {
    Aes128::new_from_slice(key)
        .map_err(|_| BridgeError::CryptoInit(format!("invalid AES key length: {}", key.len())))
}

/// Append PKCS#5 padding up to a whole block.
pub fn pkcs5_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padding = block_size - data.len() % block_size;
    let mut out = data.to_vec();
    out.extend(std::iter::repeat(padding as u8).take(padding));
    out
}

/// Strip PKCS#5 padding.
///
/// The basestation occasionally returns payloads whose final byte is not a
/// plausible pad length. Those buffers are returned unchanged rather than
/// failing the whole message; each occurrence is logged.
pub fn pkcs5_trim(mut data: Vec<u8>) -> Vec<u8> {
    let Some(&last) = data.last() else {
        return data;
    };
    let padding = last as usize;
    if padding == 0 || padding > data.len() {
        error!(padding, len = data.len(), "badly encoded CBC padding");
        return data;
    }
    data.truncate(data.len() - padding);
    data
}

/// AES-128-CBC encrypter with an IV derived from the request timestamp.
pub struct CbcEncrypter {
    cipher: Aes128,
    prev: [u8; BLOCK_SIZE],
}

impl CbcEncrypter {
    pub fn new(key: &[u8], t: i64) -> Result<Self> {
        Ok(Self {
            cipher: new_block_cipher(key)?,
            prev: derive_iv(t),
        })
    }

    /// Pad with PKCS#5, then encrypt in CBC mode.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        let mut data = pkcs5_pad(plain, BLOCK_SIZE);
        for block in data.chunks_mut(BLOCK_SIZE) {
            for (b, p) in block.iter_mut().zip(self.prev.iter()) {
                *b ^= p;
            }
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            self.prev.copy_from_slice(block);
        }
        data
    }
}

/// AES-128-CBC decrypter with an IV derived from the request timestamp.
pub struct CbcDecrypter {
    cipher: Aes128,
    prev: [u8; BLOCK_SIZE],
}

impl CbcDecrypter {
    pub fn new(key: &[u8], t: i64) -> Result<Self> {
        Ok(Self {
            cipher: new_block_cipher(key)?,
            prev: derive_iv(t),
        })
    }

    /// Decrypt in CBC mode, then strip padding (tolerantly, see
    /// [`pkcs5_trim`]).
    pub fn decrypt(&mut self, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() % BLOCK_SIZE != 0 {
            return Err(BridgeError::CryptoDecode(format!(
                "ciphertext length {} is not a multiple of the block size",
                src.len()
            )));
        }
        let mut data = src.to_vec();
        let mut saved = [0u8; BLOCK_SIZE];
        for block in data.chunks_mut(BLOCK_SIZE) {
            saved.copy_from_slice(block);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            for (b, p) in block.iter_mut().zip(self.prev.iter()) {
                *b ^= p;
            }
            self.prev = saved;
        }
        Ok(pkcs5_trim(data))
    }
}

/// HMAC-SHA-256 signer over `"{t}:{data}"`, base64-encoded.
///
/// Each request carries two of these: one keyed with the raw phone secret
/// and one keyed with the server-issued session secret. The signer is a
/// pure function of `(key, t, data)` — a fresh MAC is constructed per
/// call, so repeated invocations with the same inputs yield identical
/// output.
pub struct HubSignature {
    key: Vec<u8>,
}

impl HubSignature {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn sign(&self, t: i64, data: &str) -> String {
        // HMAC accepts keys of any length, so construction cannot fail.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).expect("hmac key");
        mac.update(format!("{}:{}", t, data).as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}
