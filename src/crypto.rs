//! Cryptographic primitives for RelayChain
//!
//! Signatures are consumed through the [`SignatureScheme`] trait so that the
//! consensus layer only ever sees `sign(data) -> signature` and
//! `verify(data, signature, publicKey) -> bool`. Keys and signatures travel as
//! hex strings inside blocks and payloads.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Name under which the default scheme is registered.
pub const DEFAULT_SCHEME: &str = "secp256k1";

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key as hex. This is the node's public identity on the chain.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Signs the SHA-256 digest of `message` and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact())
    }
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;
    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| ChainError::CryptoError(format!("Failed to create message: {}", e)))?;
    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// A named signing algorithm working on hex-encoded keys and signatures.
pub trait SignatureScheme: Send + Sync {
    fn name(&self) -> &'static str;
    fn sign(&self, data: &str, secret_hex: &str) -> Result<String, ChainError>;
    /// Never errors: malformed keys or signatures simply fail verification.
    fn verify(&self, data: &str, signature_hex: &str, public_key_hex: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Scheme;

impl SignatureScheme for Secp256k1Scheme {
    fn name(&self) -> &'static str {
        DEFAULT_SCHEME
    }

    fn sign(&self, data: &str, secret_hex: &str) -> Result<String, ChainError> {
        let keypair = KeyPair::from_secret_hex(secret_hex)?;
        Ok(hex::encode(keypair.sign(data.as_bytes())?))
    }

    fn verify(&self, data: &str, signature_hex: &str, public_key_hex: &str) -> bool {
        let (Ok(signature), Ok(public_key)) = (hex::decode(signature_hex), hex::decode(public_key_hex))
        else {
            return false;
        };
        verify_signature(&public_key, data.as_bytes(), &signature).is_ok()
    }
}

/// Looks up a signature scheme by algorithm name.
pub fn scheme_by_name(name: &str) -> Result<Arc<dyn SignatureScheme>, ChainError> {
    match name {
        DEFAULT_SCHEME => Ok(Arc::new(Secp256k1Scheme)),
        other => Err(ChainError::CryptoError(format!(
            "Unknown signature scheme: {}",
            other
        ))),
    }
}

/// The key this node signs blocks and payloads with.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: KeyPair,
    scheme: Arc<dyn SignatureScheme>,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &self.public_key_hex())
            .field("scheme", &self.scheme.name())
            .finish()
    }
}

impl NodeIdentity {
    pub fn new(keypair: KeyPair, scheme: Arc<dyn SignatureScheme>) -> Self {
        NodeIdentity { keypair, scheme }
    }

    /// Fresh secp256k1 identity.
    pub fn generate() -> Self {
        Self::new(KeyPair::generate(), Arc::new(Secp256k1Scheme))
    }

    /// Loads the hex secret stored at `path`, creating the file on first start.
    pub fn load_or_generate(path: &Path, scheme: Arc<dyn SignatureScheme>) -> Result<Self, ChainError> {
        if path.exists() {
            let secret = std::fs::read_to_string(path)?;
            return Ok(Self::new(KeyPair::from_secret_hex(&secret)?, scheme));
        }
        let keypair = KeyPair::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, keypair.secret_hex())?;
        info!("Generated node key {}", keypair.public_key_hex());
        Ok(Self::new(keypair, scheme))
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn scheme(&self) -> &Arc<dyn SignatureScheme> {
        &self.scheme
    }

    pub fn sign(&self, data: &str) -> Result<String, ChainError> {
        self.scheme.sign(data, &self.keypair.secret_hex())
    }

    pub fn verify(&self, data: &str, signature_hex: &str, public_key_hex: &str) -> bool {
        self.scheme.verify(data, signature_hex, public_key_hex)
    }
}
