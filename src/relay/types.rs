//! Wire types for relays, proofs and responses.
//!
//! Every signed structure signs a length-prefixed SHA-256 digest of its
//! fields under a domain-separation context, so a signature produced for one
//! structure can never be replayed as another.

use crate::crypto::{
    hash_fields, Address, Keypair, PublicKey, Signature, PROOF_CONTEXT, RESPONSE_CONTEXT,
    TOKEN_CONTEXT,
};
use crate::error::{ProofError, Result, SessionError};
use crate::session::SessionHeader;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Credential authorizing a client to consume relays for one session.
///
/// Signed by the application's registered key. It carries no relay count;
/// consumption is tracked by the proof ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementToken {
    /// Application the relays are billed to.
    pub application_public_key: PublicKey,
    /// Key the client signs individual proofs with.
    pub client_public_key: PublicKey,
    /// Chain the token is valid for.
    pub chain: String,
    /// Session the token is valid for.
    pub session_block_height: u64,
    /// Last height at which the token may be used.
    pub expiration_height: u64,
    /// Application signature over the fields above.
    pub signature: Signature,
}

impl EntitlementToken {
    /// Issue a token signed by the application key.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(
        application: &Keypair,
        client_public_key: PublicKey,
        chain: impl Into<String>,
        session_block_height: u64,
        expiration_height: u64,
    ) -> Result<Self> {
        let mut token = Self {
            application_public_key: application.public_key().clone(),
            client_public_key,
            chain: chain.into(),
            session_block_height,
            expiration_height,
            signature: Signature::default(),
        };
        token.signature = application.sign(TOKEN_CONTEXT, &token.signable_bytes())?;
        Ok(token)
    }

    /// Digest the application signs.
    #[must_use]
    pub fn signable_bytes(&self) -> [u8; 32] {
        hash_fields(&[
            self.application_public_key.as_bytes(),
            self.client_public_key.as_bytes(),
            self.chain.as_bytes(),
            &self.session_block_height.to_be_bytes(),
            &self.expiration_height.to_be_bytes(),
        ])
    }

    /// Digest of the whole token, signature included.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        hash_fields(&[&self.signable_bytes(), self.signature.as_bytes()])
    }

    /// Whether the application signature verifies.
    #[must_use]
    pub fn verify_signature(&self) -> bool {
        self.application_public_key
            .verify(TOKEN_CONTEXT, &self.signable_bytes(), &self.signature)
    }

    /// Check that the token is bound to `header`.
    ///
    /// # Errors
    ///
    /// Returns [`ProofError::TokenMismatch`] on an application or height
    /// mismatch and [`SessionError::ChainMismatch`] on a chain mismatch.
    pub fn check_binding(&self, header: &SessionHeader) -> Result<()> {
        if self.application_public_key != header.application_public_key
            || self.session_block_height != header.session_block_height
        {
            return Err(ProofError::TokenMismatch.into());
        }
        if self.chain != header.chain {
            return Err(SessionError::ChainMismatch {
                expected: header.chain.clone(),
                actual: self.chain.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Check the token has not expired at `current_height`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TokenExpired`] past the expiration height.
    pub fn check_expiration(&self, current_height: u64) -> Result<()> {
        if current_height > self.expiration_height {
            return Err(SessionError::TokenExpired {
                expiration: self.expiration_height,
                current: current_height,
            }
            .into());
        }
        Ok(())
    }
}

/// Request forwarded to the hosted chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPayload {
    /// Request body.
    pub data: String,
    /// HTTP method; empty means POST.
    #[serde(default)]
    pub method: String,
    /// Path appended to the chain's base URL.
    #[serde(default)]
    pub path: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RelayPayload {
    /// JSON-RPC style payload posted to the chain root.
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Request hash bound into the proof.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        let mut fields: Vec<&[u8]> = vec![
            self.data.as_bytes(),
            self.method.as_bytes(),
            self.path.as_bytes(),
        ];
        for (name, value) in &self.headers {
            fields.push(name.as_bytes());
            fields.push(value.as_bytes());
        }
        hash_fields(&fields)
    }
}

/// Client-signed record of one unit of relay work.
///
/// This is both the proof header carried by a relay and the record the
/// ledger keeps per servicer per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProof {
    /// Servicer the relay is addressed to.
    pub servicer_public_key: PublicKey,
    /// Session the relay belongs to.
    pub header: SessionHeader,
    /// 1-based request index within the session.
    pub request_index: u64,
    /// Hash of the relayed payload.
    #[serde(with = "hex_hash")]
    pub request_hash: [u8; 32],
    /// Entitlement the relay is billed against.
    pub token: EntitlementToken,
    /// Client signature over the fields above.
    pub signature: Signature,
}

impl RelayProof {
    /// Build and sign a proof with the client key named in `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(
        client: &Keypair,
        servicer_public_key: PublicKey,
        header: SessionHeader,
        request_index: u64,
        payload: &RelayPayload,
        token: EntitlementToken,
    ) -> Result<Self> {
        let mut proof = Self {
            servicer_public_key,
            header,
            request_index,
            request_hash: payload.hash(),
            token,
            signature: Signature::default(),
        };
        proof.signature = client.sign(PROOF_CONTEXT, &proof.signable_bytes())?;
        Ok(proof)
    }

    /// Digest the client signs.
    #[must_use]
    pub fn signable_bytes(&self) -> [u8; 32] {
        hash_fields(&[
            self.servicer_public_key.as_bytes(),
            &self.header.digest(),
            &self.request_index.to_be_bytes(),
            &self.request_hash,
            &self.token.hash(),
        ])
    }

    /// Address of the servicer the proof names.
    #[must_use]
    pub fn servicer_address(&self) -> Address {
        self.servicer_public_key.address()
    }

    /// Whether the client signature verifies under the token's client key.
    #[must_use]
    pub fn verify_client_signature(&self) -> bool {
        self.token
            .client_public_key
            .verify(PROOF_CONTEXT, &self.signable_bytes(), &self.signature)
    }

    /// Stateless checks shared by relay handling and batch verification:
    /// token signature and binding, client signature, index range.
    ///
    /// # Errors
    ///
    /// Returns the first failing check.
    pub fn verify(&self, max_relays: u64) -> Result<()> {
        if !self.token.verify_signature() {
            return Err(ProofError::BadSignature("entitlement token").into());
        }
        self.token.check_binding(&self.header)?;
        if !self.verify_client_signature() {
            return Err(ProofError::BadSignature("client").into());
        }
        check_index(self.request_index, max_relays)
    }
}

/// Check `index` lies within `1..=max`.
///
/// # Errors
///
/// Returns [`ProofError::IndexOutOfRange`] otherwise.
pub fn check_index(index: u64, max: u64) -> Result<()> {
    if index == 0 || index > max {
        return Err(ProofError::IndexOutOfRange { index, max }.into());
    }
    Ok(())
}

/// Inbound relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Request forwarded to the hosted chain.
    pub payload: RelayPayload,
    /// Client-signed proof, carrying the entitlement token.
    pub proof: RelayProof,
}

/// Servicer-signed response to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    /// Response body from the hosted chain.
    pub payload: String,
    /// Proof of the relay this answers.
    pub proof: RelayProof,
    /// Servicer signature over the response hash.
    pub signature: Signature,
}

impl RelayResponse {
    /// Build and sign a response with the servicer key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Signing`] if the key cannot sign.
    pub fn sign(servicer: &Keypair, payload: String, proof: RelayProof) -> Result<Self> {
        let mut response = Self {
            payload,
            proof,
            signature: Signature::default(),
        };
        response.signature = servicer.sign(RESPONSE_CONTEXT, &response.hash())?;
        Ok(response)
    }

    /// Response hash the servicer signs.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        hash_fields(&[
            self.payload.as_bytes(),
            &self.proof.signable_bytes(),
            self.proof.signature.as_bytes(),
        ])
    }

    /// Address of the responding servicer.
    #[must_use]
    pub fn servicer_address(&self) -> Address {
        self.proof.servicer_address()
    }

    /// Whether the servicer signature verifies.
    #[must_use]
    pub fn verify_signature(&self) -> bool {
        self.proof
            .servicer_public_key
            .verify(RESPONSE_CONTEXT, &self.hash(), &self.signature)
    }
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
