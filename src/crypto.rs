//! Signing, verification and the encryption boundary for direct messages.

use std::fmt;

use anyhow::{anyhow, Result};
use rand::RngCore;
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::event::{Event, Tag};

/// Rejected key material. Import fails with one of these instead of
/// substituting a fresh key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key must be 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("key is not valid hex")]
    InvalidHex,
    #[error("key is not a valid secp256k1 secret")]
    OutOfRange,
}

/// Failure at the direct message encryption boundary. Kept distinct from an
/// empty plaintext, which is a successful decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid peer key: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Event fields before the id and signature are computed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Produces signed events for the local identity.
pub trait Signer: Send + Sync {
    /// x-only public key, hex encoded.
    fn public_key(&self) -> String;
    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// Symmetric encryption between the local identity and a peer key.
pub trait DirectCipher: Send + Sync {
    fn encrypt(&self, recipient: &str, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, sender: &str, ciphertext: &str) -> Result<String, CryptoError>;
}

/// secp256k1 identity used to sign events.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
}

impl Keys {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        loop {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keypair) = Keypair::from_seckey_slice(&secp, &secret) {
                return Self { keypair };
            }
        }
    }

    /// Import a hex encoded secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let secret = secret.trim();
        if secret.len() != 64 {
            return Err(KeyError::InvalidLength(secret.len()));
        }
        let bytes = hex::decode(secret).map_err(|_| KeyError::InvalidHex)?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes).map_err(|_| KeyError::OutOfRange)?;
        Ok(Self { keypair })
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl Signer for Keys {
    fn public_key(&self) -> String {
        self.public_hex()
    }

    fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let hash = hash_fields(
            &unsigned.pubkey,
            unsigned.created_at,
            unsigned.kind,
            &unsigned.tags,
            &unsigned.content,
        )?;
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: unsigned.pubkey,
            kind: unsigned.kind,
            created_at: unsigned.created_at,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Recompute the NIP-01 event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    hash_fields(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)
}

fn hash_fields(pubkey: &str, created_at: u64, kind: u32, tags: &[Tag], content: &str) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(keys: &Keys) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: keys.public_hex(),
            created_at: 1_700_000_000,
            kind: 20000,
            tags: vec![Tag::new("g", "u4"), Tag::new("g", "u4p")],
            content: "hello".into(),
        }
    }

    #[test]
    fn signed_event_verifies() {
        let keys = Keys::generate();
        let ev = keys.sign(unsigned(&keys)).unwrap();
        assert_eq!(ev.id.len(), 64);
        assert_eq!(ev.sig.len(), 128);
        assert!(ev.validate().is_ok());
        verify_event(&ev).unwrap();
    }

    #[test]
    fn tampered_event_fails_verification() {
        let keys = Keys::generate();
        let mut ev = keys.sign(unsigned(&keys)).unwrap();
        ev.content = "changed".into();
        assert!(verify_event(&ev).is_err());

        let mut ev = keys.sign(unsigned(&keys)).unwrap();
        ev.sig = "00".repeat(64);
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn import_round_trips_and_derives_public_key() {
        let keys = Keys::from_secret_hex(&"01".repeat(32)).unwrap();
        let again = Keys::from_secret_hex(&keys.secret_hex()).unwrap();
        assert_eq!(keys.public_hex(), again.public_hex());
        assert_eq!(keys.secret_hex(), "01".repeat(32));
        assert!(!format!("{keys:?}").contains(&keys.secret_hex()));
    }

    #[test]
    fn import_rejects_bad_material_distinguishably() {
        assert_eq!(
            Keys::from_secret_hex("abcd").unwrap_err(),
            KeyError::InvalidLength(4)
        );
        assert_eq!(
            Keys::from_secret_hex(&"zz".repeat(32)).unwrap_err(),
            KeyError::InvalidHex
        );
        assert_eq!(
            Keys::from_secret_hex(&"00".repeat(32)).unwrap_err(),
            KeyError::OutOfRange
        );
        assert_eq!(
            Keys::from_secret_hex(&"ff".repeat(32)).unwrap_err(),
            KeyError::OutOfRange
        );
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(Keys::generate().public_hex(), Keys::generate().public_hex());
    }
}
