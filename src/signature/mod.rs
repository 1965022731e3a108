//! Claim signatures: the student signs the decimal timestamp with an
//! Ethereum-style personal-message signature and the ledger recovers the
//! signer's address from it.
//!
//! Message encoding, bit for bit:
//!
//! 1. `h = keccak256(decimal_ascii(timestamp))`
//! 2. `digest = keccak256("\x19Ethereum Signed Message:\n32" || h)`
//! 3. `signature = r (32) || s (32) || v (1)` with `v` in `{27, 28}` or `{0, 1}`
//!
//! The signer address is the last 20 bytes of the Keccak-256 hash of the
//! uncompressed public key without its `0x04` tag.

use std::fmt;
use std::str::FromStr;

use libsecp256k1::{Message, PublicKey, RecoveryId, SecretKey, Signature};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use tracing::debug;

use crate::address::{decode_prefixed_hex, Address, ADDRESS_LEN};
use crate::error::SignatureError;

pub const SIGNATURE_LEN: usize = 65;

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

pub fn keccak_256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Canonical textual form of a claim timestamp.
pub fn timestamp_message(timestamp: u64) -> String {
    timestamp.to_string()
}

/// Keccak-256 of the decimal timestamp. This is the 32-byte value an external
/// wallet is asked to sign.
pub fn timestamp_hash(timestamp: u64) -> [u8; 32] {
    keccak_256(timestamp_message(timestamp).as_bytes())
}

/// Digest produced by `eth_sign` / `personal_sign` over a 32-byte payload.
pub fn personal_message_digest(payload: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX);
    hasher.update(payload);
    hasher.finalize().into()
}

pub fn claim_digest(timestamp: u64) -> [u8; 32] {
    personal_message_digest(&timestamp_hash(timestamp))
}

pub fn address_of(public: &PublicKey) -> Address {
    let serialized = public.serialize();
    let hash = keccak_256(&serialized[1..65]);
    let mut out = [0u8; ADDRESS_LEN];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

/// A 65-byte `r || s || v` recoverable signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClaimSignature(pub [u8; SIGNATURE_LEN]);

impl ClaimSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(SignatureError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    fn recovery_id(&self) -> Result<RecoveryId, SignatureError> {
        let v = self.0[64];
        let id = match v {
            0 | 1 => v,
            27 | 28 => v - 27,
            other => return Err(SignatureError::InvalidRecoveryId(other)),
        };
        RecoveryId::parse(id).map_err(|_| SignatureError::InvalidRecoveryId(v))
    }

    fn scalars(&self) -> Result<Signature, SignatureError> {
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&self.0[..64]);
        let signature = Signature::parse_standard(&rs).map_err(|_| SignatureError::Malformed)?;
        if signature.s.is_high() {
            return Err(SignatureError::HighS);
        }
        Ok(signature)
    }
}

impl fmt::Display for ClaimSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ClaimSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimSignature({self})")
    }
}

impl FromStr for ClaimSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = decode_prefixed_hex(s).map_err(|e| SignatureError::Hex(e.to_string()))?;
        Self::from_slice(&raw)
    }
}

impl Serialize for ClaimSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ClaimSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(serde::de::Error::custom)
    }
}

/// Stateless recovery of claim signers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Recovers the address that signed `timestamp`.
    ///
    /// Malformed input is an error; there is no fallback address.
    pub fn recover_signer(
        &self,
        timestamp: u64,
        signature: &ClaimSignature,
    ) -> Result<Address, SignatureError> {
        let recovery_id = signature.recovery_id()?;
        let scalars = signature.scalars()?;
        let message = Message::parse(&claim_digest(timestamp));
        let public = libsecp256k1::recover(&message, &scalars, &recovery_id)
            .map_err(|_| SignatureError::Recovery)?;
        let signer = address_of(&public);
        debug!(timestamp, %signer, "recovered claim signer");
        Ok(signer)
    }
}

/// A secp256k1 key able to produce claim signatures, used by students' tooling
/// and by tests.
#[derive(Clone)]
pub struct ClaimSigner {
    secret: SecretKey,
}

impl ClaimSigner {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            OsRng.fill_bytes(&mut bytes);
            if let Ok(secret) = SecretKey::parse(&bytes) {
                return Self { secret };
            }
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        let secret = SecretKey::parse(bytes).map_err(|_| SignatureError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SignatureError> {
        let raw = decode_prefixed_hex(encoded).map_err(|e| SignatureError::Hex(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidSecretKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.serialize())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&self.secret)
    }

    pub fn address(&self) -> Address {
        address_of(&self.public_key())
    }

    /// Signs `timestamp` the way `eth_sign(keccak256(decimal(timestamp)))` does.
    pub fn sign_timestamp(&self, timestamp: u64) -> ClaimSignature {
        let message = Message::parse(&claim_digest(timestamp));
        let (signature, recovery_id) = libsecp256k1::sign(&message, &self.secret);
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.serialize());
        out[64] = 27 + recovery_id.serialize();
        ClaimSignature(out)
    }
}

impl fmt::Debug for ClaimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
