//! Per-chunk payload encryption for portal streams.
//!
//! Every chunk is enciphered independently: a fresh nonce is generated,
//! prefixed to the ciphertext, and the combined wire size travels ahead of
//! the payload. The wire size therefore differs from the plaintext size;
//! byte-count bookkeeping always uses the plaintext length.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::status::Status;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Negotiated encryption parameters, carried alongside the shared secret.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptSpec {
    pub algorithm: String,
    pub key_size: usize,
    pub salt_size: usize,
    pub num_hash_rounds: usize,
}

impl Default for EncryptSpec {
    fn default() -> Self {
        EncryptSpec {
            algorithm: "AES-256-GCM".to_string(),
            key_size: KEY_LEN,
            salt_size: 8,
            num_hash_rounds: 16,
        }
    }
}

/// One stream's cipher state. Key material is derived once per task;
/// nonces are fresh per chunk.
pub struct PortalCipher {
    cipher: Aes256Gcm,
}

impl PortalCipher {
    pub fn new(spec: &EncryptSpec, shared_secret: &[u8]) -> Result<Self, Status> {
        if spec.algorithm != "AES-256-GCM" || spec.key_size != KEY_LEN {
            return Err(Status::DecryptErr);
        }
        if shared_secret.is_empty() || spec.num_hash_rounds == 0 {
            return Err(Status::DecryptErr);
        }
        let key = derive_key(shared_secret, spec.salt_size, spec.num_hash_rounds);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Ok(PortalCipher { cipher })
    }

    /// Bytes added to each chunk on the wire: nonce prefix plus auth tag.
    pub fn wire_overhead() -> usize {
        NONCE_LEN + TAG_LEN
    }

    /// Encipher one chunk; output is `nonce || ciphertext`.
    pub fn encrypt_chunk(&self, plain: &[u8]) -> Result<Vec<u8>, Status> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|_| Status::DecryptErr)?;
        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Split off the nonce prefix and decipher. Returns the plaintext,
    /// whose length is what byte accounting must advance by.
    pub fn decrypt_chunk(&self, wire: &[u8]) -> Result<Vec<u8>, Status> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(Status::DecryptErr);
        }
        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Status::DecryptErr)
    }
}

/// Iterated-hash key derivation from the shared secret. The salt is the
/// leading `salt_size` bytes of the secret's own digest, so both ends
/// derive identical keys from the secret alone.
fn derive_key(secret: &[u8], salt_size: usize, rounds: usize) -> [u8; KEY_LEN] {
    let salt_src: [u8; KEY_LEN] = Sha256::digest(secret).into();
    let salt = &salt_src[..salt_size.min(KEY_LEN)];

    let mut digest: [u8; KEY_LEN] = {
        let mut h = Sha256::new();
        h.update(salt);
        h.update(secret);
        h.finalize().into()
    };
    for _ in 1..rounds {
        let mut h = Sha256::new();
        h.update(digest);
        h.update(secret);
        digest = h.finalize().into();
    }
    digest
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(secret: &[u8]) -> PortalCipher {
        PortalCipher::new(&EncryptSpec::default(), secret).unwrap()
    }

    #[test]
    fn round_trip_reproduces_plaintext_exactly() {
        let c = cipher(b"shared-secret-for-this-session");
        let plain: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let wire = c.encrypt_chunk(&plain).unwrap();
        // wire size reflects the post-encryption size
        assert_eq!(wire.len(), plain.len() + PortalCipher::wire_overhead());

        let back = c.decrypt_chunk(&wire).unwrap();
        // bookkeeping length is the plaintext length, not the wire length
        assert_eq!(back.len(), plain.len());
        assert_eq!(back, plain);
    }

    #[test]
    fn fresh_nonce_per_chunk() {
        let c = cipher(b"secret");
        let a = c.encrypt_chunk(b"same bytes").unwrap();
        let b = c.encrypt_chunk(b"same bytes").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
    }

    #[test]
    fn both_ends_derive_the_same_key() {
        let spec = EncryptSpec::default();
        let tx = PortalCipher::new(&spec, b"negotiated").unwrap();
        let rx = PortalCipher::new(&spec, b"negotiated").unwrap();
        let wire = tx.encrypt_chunk(b"payload").unwrap();
        assert_eq!(rx.decrypt_chunk(&wire).unwrap(), b"payload");
    }

    #[test]
    fn wrong_secret_is_a_decrypt_error() {
        let tx = cipher(b"alpha");
        let rx = cipher(b"bravo");
        let wire = tx.encrypt_chunk(b"payload").unwrap();
        assert_eq!(rx.decrypt_chunk(&wire), Err(Status::DecryptErr));
    }

    #[test]
    fn truncated_wire_rejected() {
        let c = cipher(b"secret");
        assert_eq!(c.decrypt_chunk(&[0u8; 10]), Err(Status::DecryptErr));
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(decode_hex(&encode_hex(&bytes)).unwrap(), bytes);
        assert_eq!(decode_hex("zz"), None);
        assert_eq!(decode_hex("abc"), None);
    }
}
