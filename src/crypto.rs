//! # Cryptographic Operations
//!
//! This module provides the narrow cryptographic capability PeerChat's
//! identity model depends on:
//! - Ed25519 key pairs for node identity and message signatures
//! - X25519 shared secrets derived from those same Ed25519 keys
//! - Peer ID derivation from a public key
//!
//! All primitives come from the dalek crates; nothing is implemented here.
//! The wire protocol itself is not encrypted, these helpers only exist for
//! callers that want to sign or seal payloads on their own.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Number of SHA-256 bytes kept in a peer ID.
const PEER_ID_BYTES: usize = 8;

/// Cryptographic identity for a PeerChat node.
///
/// Each node has a unique Ed25519 key pair. The peer ID is derived from a
/// hash of the public key, while the private key is used for signing and
/// key agreement.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut csprng = OsRng {};
        let signing_key = SigningKey::generate(&mut csprng);

        Ok(Self { signing_key })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate()?;
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let identity_file: IdentityFile = toml::from_str(&content)?;

        let signing_key = SigningKey::from_bytes(&identity_file.secret_key);

        Ok(Self { signing_key })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let identity_file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
        };

        let content = toml::to_string_pretty(&identity_file)?;
        std::fs::write(path, content)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn peer_id(&self) -> String {
        peer_id_from_pubkey(&self.public_key_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(data, signature).is_ok()
    }

    pub fn derive_shared_secret(&self, peer_public_key: &[u8]) -> Result<[u8; 32]> {
        derive_shared_secret(&self.private_key_bytes(), peer_public_key)
    }
}

/// Generate a fresh key pair, returned as `(public, private)` bytes.
pub fn generate_keypair() -> (Vec<u8>, Vec<u8>) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (
        signing_key.verifying_key().to_bytes().to_vec(),
        signing_key.to_bytes().to_vec(),
    )
}

/// Stable peer identifier: hex of the first 8 bytes of SHA-256(public key).
pub fn peer_id_from_pubkey(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..PEER_ID_BYTES])
}

pub fn sign(private_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let signing_key = signing_key_from(private_key)?;
    Ok(signing_key.sign(data).to_bytes().to_vec())
}

/// Check a signature. Malformed keys or signatures verify as `false`.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };

    verifying_key
        .verify(data, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// X25519 agreement between our Ed25519 private key and a peer's Ed25519 public key.
pub fn derive_shared_secret(private_key: &[u8], peer_public_key: &[u8]) -> Result<[u8; 32]> {
    let signing_key = signing_key_from(private_key)?;
    let key_bytes = <[u8; 32]>::try_from(peer_public_key)
        .map_err(|_| anyhow!("Invalid public key length: {}", peer_public_key.len()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| anyhow!("Invalid public key format"))?;

    let secret = x25519_dalek::StaticSecret::from(signing_key.to_scalar_bytes());
    let public = x25519_dalek::PublicKey::from(verifying_key.to_montgomery().to_bytes());

    Ok(secret.diffie_hellman(&public).to_bytes())
}

fn signing_key_from(private_key: &[u8]) -> Result<SigningKey> {
    let bytes = <[u8; 32]>::try_from(private_key)
        .map_err(|_| anyhow!("Invalid private key length: {}", private_key.len()))?;
    Ok(SigningKey::from_bytes(&bytes))
}
