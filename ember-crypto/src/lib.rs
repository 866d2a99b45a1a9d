use once_cell::sync::Lazy;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Uncompressed secp256k1 point: 0x04 prefix then X and Y, 32 bytes each.
pub const ADDRESS_LEN: usize = 65;
pub const PRIVATE_KEY_LEN: usize = 32;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),
}

/// A freshly generated keypair, both halves hex-encoded. The public key
/// doubles as the on-chain address.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub private_key: String,
    pub address: String,
}

pub fn generate_keypair() -> Keypair {
    let (secret, public) = SECP.generate_keypair(&mut rand::thread_rng());
    Keypair {
        private_key: hex::encode(secret.secret_bytes()),
        address: hex::encode(public.serialize_uncompressed()),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Derives the hex address (uncompressed public key) for a hex private key.
pub fn address_from_private_key(private_key_hex: &str) -> Result<String, CryptoError> {
    let secret = secret_key_from_hex(private_key_hex)?;
    let public = PublicKey::from_secret_key(&SECP, &secret);
    Ok(hex::encode(public.serialize_uncompressed()))
}

/// Signs a 32-byte digest, returning the DER-encoded signature as hex.
pub fn sign_digest(private_key_hex: &str, digest: &[u8; 32]) -> Result<String, CryptoError> {
    let secret = secret_key_from_hex(private_key_hex)?;
    let message = Message::from_digest_slice(digest)
        .map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))?;
    let signature = SECP.sign_ecdsa(&message, &secret);
    Ok(hex::encode(signature.serialize_der()))
}

/// Verifies a hex signature (DER or compact r||s) over a 32-byte digest
/// against the hex address that produced it.
pub fn verify_digest(
    address_hex: &str,
    digest: &[u8; 32],
    signature_hex: &str,
) -> Result<bool, CryptoError> {
    let public = public_key_from_address(address_hex)?;
    let raw = hex::decode(signature_hex)
        .map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))?;
    let signature = Signature::from_der(&raw)
        .or_else(|_| Signature::from_compact(&raw))
        .map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))?;
    let message = Message::from_digest_slice(digest)
        .map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))?;
    Ok(SECP.verify_ecdsa(&message, &signature, &public).is_ok())
}

fn secret_key_from_hex(private_key_hex: &str) -> Result<SecretKey, CryptoError> {
    let raw = hex::decode(private_key_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if raw.len() != PRIVATE_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "private key must be {PRIVATE_KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    SecretKey::from_slice(&raw).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn public_key_from_address(address_hex: &str) -> Result<PublicKey, CryptoError> {
    let raw = hex::decode(address_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if raw.len() != ADDRESS_LEN || raw[0] != 0x04 {
        return Err(CryptoError::InvalidKey(
            "address must be a 65-byte uncompressed public key".to_string(),
        ));
    }
    PublicKey::from_slice(&raw).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}
