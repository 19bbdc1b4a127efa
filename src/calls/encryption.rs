//! Fingerprint-MAC key material.
//!
//! Each side of a call generates a random 32-byte key, sends it to the peer
//! encrypted for the peer's address, and later MACs its DTLS fingerprint
//! with it so the peer can detect a man in the middle.

use aes_gcm::{Aes256Gcm, Nonce};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use async_trait::async_trait;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use jingle_core::stanza::Jid;
use rand::RngCore;
use sha2::Sha256;

use super::error::CallError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Fingerprint-MAC key for one side of a call.
#[derive(Clone, PartialEq, Eq)]
pub struct FprMacKey([u8; 32]);

impl FprMacKey {
    pub const LEN: usize = 32;

    pub fn generate() -> Self {
        let mut key = [0u8; Self::LEN];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CallError> {
        let key: [u8; Self::LEN] = data
            .try_into()
            .map_err(|_| CallError::Encryption(format!("key must be {} bytes", Self::LEN)))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex HMAC-SHA256 of a DTLS fingerprint under this key.
    pub fn sign_fingerprint(&self, fingerprint: &str) -> String {
        let mut mac = hmac_with(&self.0);
        mac.update(fingerprint.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify_fingerprint(&self, fingerprint: &str, mac_hex: &str) -> bool {
        let Ok(expected) = hex::decode(mac_hex) else {
            return false;
        };
        let mut mac = hmac_with(&self.0);
        mac.update(fingerprint.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for FprMacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FprMacKey(..)")
    }
}

fn hmac_with(key: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Key exchange and address scrambling used by the call engine.
#[async_trait]
pub trait CallCrypto: Send + Sync {
    fn generate_fpr_mac_key(&self) -> FprMacKey {
        FprMacKey::generate()
    }

    /// Make sure key material for `peer` is available before an invite goes out.
    async fn preload_keys(&self, _peer: &Jid) -> Result<(), CallError> {
        Ok(())
    }

    /// Encrypt `key` so only `recipient` (bare address) can read it. Hex output.
    fn encrypt_key_for(&self, key: &FprMacKey, recipient: &Jid) -> Result<String, CallError>;

    /// Decrypt a key that `sender` encrypted for us.
    fn decrypt_key_from(&self, ciphertext: &str, sender: &Jid) -> Result<FprMacKey, CallError>;

    /// Stable anonymous id for an address, used in statistics.
    fn scramble_jid(&self, jid: &Jid) -> String;
}

/// [`CallCrypto`] over a secret shared by all participants.
///
/// Keys are sealed with AES-256-GCM under an HKDF-SHA256 derived key, with
/// the recipient's bare address as associated data.
pub struct SharedSecretCrypto {
    own_bare: Jid,
    seal_key: [u8; 32],
    anon_key: [u8; 32],
}

impl SharedSecretCrypto {
    pub fn new(secret: &[u8], own_jid: &Jid) -> Result<Self, CallError> {
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut seal_key = [0u8; 32];
        let mut anon_key = [0u8; 32];
        hk.expand(b"jingle-calls fprmackey", &mut seal_key)
            .map_err(|e| CallError::Encryption(e.to_string()))?;
        hk.expand(b"jingle-calls anonid", &mut anon_key)
            .map_err(|e| CallError::Encryption(e.to_string()))?;
        Ok(Self {
            own_bare: own_jid.to_bare(),
            seal_key,
            anon_key,
        })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CallError> {
        <Aes256Gcm as KeyInit>::new_from_slice(&self.seal_key)
            .map_err(|e| CallError::Encryption(e.to_string()))
    }
}

#[async_trait]
impl CallCrypto for SharedSecretCrypto {
    fn encrypt_key_for(&self, key: &FprMacKey, recipient: &Jid) -> Result<String, CallError> {
        let aad = recipient.to_bare().to_string();
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: key.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CallError::Encryption("seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt_key_from(&self, ciphertext: &str, _sender: &Jid) -> Result<FprMacKey, CallError> {
        let data = hex::decode(ciphertext).map_err(|e| CallError::Encryption(e.to_string()))?;
        if data.len() <= NONCE_LEN {
            return Err(CallError::Encryption("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let aad = self.own_bare.to_string();
        let plain = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CallError::Encryption("open failed".to_string()))?;
        FprMacKey::from_bytes(&plain)
    }

    fn scramble_jid(&self, jid: &Jid) -> String {
        let mut mac = hmac_with(&self.anon_key);
        mac.update(jid.to_bare().to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(&digest[..8])
    }
}
