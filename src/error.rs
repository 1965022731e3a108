use thiserror::Error;

use crate::address::Address;

/// Failure reasons reported by the reward ledger.
///
/// Every variant aborts the whole operation; no state is touched when one of
/// these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// A non-owner attempted an owner-only operation.
    #[error("access denied: {caller} is not the owner (operation `{operation}`)")]
    AccessDenied {
        caller: Address,
        operation: &'static str,
    },

    #[error("student {0} is already whitelisted")]
    AlreadyExists(Address),

    #[error("student {0} is not whitelisted")]
    NotFound(Address),

    /// The identifier recovered from the claim signature is not whitelisted.
    #[error("signer {0} is not a whitelisted student")]
    NotWhitelisted(Address),

    #[error("school {0} has no registered identity")]
    SchoolNotRegistered(Address),

    #[error("signature for timestamp {timestamp} expired (now {now})")]
    SignatureExpired { timestamp: u64, now: u64 },

    #[error("timestamp {timestamp} lies in the future (now {now})")]
    TimestampInFuture { timestamp: u64, now: u64 },

    #[error("student {student} claimed at {last_claim}; next claim allowed at {next_allowed}")]
    ClaimTooSoon {
        student: Address,
        last_claim: u64,
        next_allowed: u64,
    },

    #[error("insufficient funds: ledger holds {available}, needs {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("token transfer failed: {0}")]
    TransferFailed(#[from] TokenError),

    #[error("invalid claim signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("snapshot rejected: {0}")]
    Snapshot(String),
}

impl LedgerError {
    /// The same request may succeed later without any administrative action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ClaimTooSoon { .. }
                | LedgerError::SignatureExpired { .. }
                | LedgerError::TimestampInFuture { .. }
        )
    }

    /// The ledger needs a deposit before claims can be paid.
    pub fn is_underfunded(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds { .. })
    }
}

/// Errors reported by the fungible-token collaborator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("insufficient balance in account {account}: has {available}, needs {required}")]
    InsufficientBalance {
        account: Address,
        available: u64,
        required: u64,
    },

    #[error("allowance of {spender} over {owner} is {allowed}, needs {required}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        allowed: u64,
        required: u64,
    },

    #[error("balance overflow in account {0}")]
    Overflow(Address),

    #[error("only the token owner may mint")]
    NotMinter,
}

/// Errors reported by the identity registry collaborator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("access denied: {0} is not the registry owner")]
    AccessDenied(Address),
}

/// Signature decoding and recovery failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must be 65 bytes, got {0}")]
    InvalidLength(usize),

    #[error("unsupported recovery id {0}")]
    InvalidRecoveryId(u8),

    #[error("malformed signature scalars")]
    Malformed,

    #[error("signature s value is not in the lower half order")]
    HighS,

    #[error("public key recovery failed")]
    Recovery,

    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("invalid secret key")]
    InvalidSecretKey,
}
