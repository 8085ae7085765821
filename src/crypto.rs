//! ML-DSA-65 identities, signatures and digests.
//!
//! Servicers, applications and clients are all identified by ML-DSA-65 public
//! keys. Addresses are the first 20 bytes of the SHA-256 of the public key.
//! Every signature is made with a domain-separation context so a signature
//! over a token can never be replayed as a signature over a proof or response.

use crate::error::{Error, Result};
use saorsa_pqc::api::sig::{ml_dsa_65, MlDsaPublicKey, MlDsaSecretKey, MlDsaSignature, MlDsaVariant};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Signing context for entitlement tokens.
pub const TOKEN_CONTEXT: &[u8] = b"servicer-node-token-v1";

/// Signing context for per-relay client proofs.
pub const PROOF_CONTEXT: &[u8] = b"servicer-node-proof-v1";

/// Signing context for servicer relay responses.
pub const RESPONSE_CONTEXT: &[u8] = b"servicer-node-response-v1";

/// ML-DSA-65 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 3309;

/// ML-DSA-65 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1952;

/// Address length in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Secret key file name inside a key directory.
pub const SECRET_KEY_FILE: &str = "servicer.secret";

/// Public key file name inside a key directory.
pub const PUBLIC_KEY_FILE: &str = "servicer.pub";

/// SHA-256 over length-prefixed fields.
///
/// Each field is prefixed with its length as a big-endian `u64`, so the
/// encoding is injective and field boundaries cannot be shifted.
#[must_use]
pub fn hash_fields(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// An ML-DSA-65 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_vec")] Vec<u8>);

impl PublicKey {
    /// Wrap raw public key bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Address derived from this key.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Short hex form for log lines.
    #[must_use]
    pub fn short_hex(&self) -> String {
        let prefix = &self.0[..self.0.len().min(8)];
        format!("{}…", hex::encode(prefix))
    }

    /// Verify `signature` over `message` under `context`.
    ///
    /// Malformed keys or signatures verify as `false`.
    #[must_use]
    pub fn verify(&self, context: &[u8], message: &[u8], signature: &Signature) -> bool {
        if signature.0.len() != SIGNATURE_SIZE {
            debug!(
                "Rejecting signature of size {} (expected {SIGNATURE_SIZE})",
                signature.0.len()
            );
            return false;
        }

        let Ok(key) = MlDsaPublicKey::from_bytes(MlDsaVariant::MlDsa65, &self.0) else {
            debug!("Rejecting malformed public key {}", self.short_hex());
            return false;
        };
        let Ok(sig) = MlDsaSignature::from_bytes(MlDsaVariant::MlDsa65, &signature.0) else {
            debug!("Rejecting malformed signature");
            return false;
        };

        matches!(
            ml_dsa_65().verify_with_context(&key, message, &sig, context),
            Ok(true)
        )
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_hex())
    }
}

/// A 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(#[serde(with = "hex_array")] [u8; ADDRESS_SIZE]);

impl Address {
    /// Wrap raw address bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive the address of a public key.
    #[must_use]
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest[..ADDRESS_SIZE]);
        Self(bytes)
    }

    /// Raw address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A detached ML-DSA-65 signature.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_vec")] Vec<u8>);

impl Signature {
    /// Wrap raw signature bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the signature is empty (unsigned).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// An ML-DSA-65 key pair.
#[derive(Clone)]
pub struct Keypair {
    public_key: PublicKey,
    secret_key: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = ml_dsa_65()
            .generate_keypair()
            .map_err(|e| Error::Crypto(format!("Key generation failed: {e}")))?;

        Ok(Self {
            public_key: PublicKey(public_key.to_bytes().to_vec()),
            secret_key: secret_key.to_bytes().to_vec(),
        })
    }

    /// Rebuild a key pair from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if either key fails to parse.
    pub fn from_bytes(public_key: Vec<u8>, secret_key: Vec<u8>) -> Result<Self> {
        MlDsaPublicKey::from_bytes(MlDsaVariant::MlDsa65, &public_key)
            .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;
        MlDsaSecretKey::from_bytes(MlDsaVariant::MlDsa65, &secret_key)
            .map_err(|e| Error::Crypto(format!("Invalid secret key: {e}")))?;

        Ok(Self {
            public_key: PublicKey(public_key),
            secret_key,
        })
    }

    /// Load a key pair written by [`Keypair::save`] or `servicer-keygen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key files are missing or malformed.
    pub fn load(dir: &Path) -> Result<Self> {
        let public_key = fs::read(dir.join(PUBLIC_KEY_FILE)).map_err(|e| {
            Error::Crypto(format!("Failed to read public key in '{}': {e}", dir.display()))
        })?;
        let secret_key = fs::read(dir.join(SECRET_KEY_FILE)).map_err(|e| {
            Error::Crypto(format!("Failed to read secret key in '{}': {e}", dir.display()))
        })?;
        Self::from_bytes(public_key, secret_key)
    }

    /// Write the key pair into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(SECRET_KEY_FILE), &self.secret_key)?;
        fs::write(dir.join(PUBLIC_KEY_FILE), self.public_key.as_bytes())?;
        Ok(())
    }

    /// The public half.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Address of the public half.
    #[must_use]
    pub fn address(&self) -> Address {
        self.public_key.address()
    }

    /// Sign `message` under `context`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if the secret key is unusable.
    pub fn sign(&self, context: &[u8], message: &[u8]) -> Result<Signature> {
        let secret_key = MlDsaSecretKey::from_bytes(MlDsaVariant::MlDsa65, &self.secret_key)
            .map_err(|e| Error::Signing(format!("Invalid secret key: {e}")))?;
        let signature = ml_dsa_65()
            .sign_with_context(&secret_key, message, context)
            .map_err(|e| Error::Signing(format!("Signature creation failed: {e}")))?;
        Ok(Signature(signature.to_bytes().to_vec()))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}
