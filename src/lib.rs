//! Signature-authorized incentive ledger.
//!
//! A school submits a student's signature over the current unix time; the
//! ledger recovers the student from the signature, checks eligibility and
//! pays a fixed incentive to both parties out of its token holdings.
//!
//! * [`signature`]: Ethereum-style personal-message hashing and secp256k1
//!   signer recovery.
//! * [`identity`]: the identity registry collaborator consulted for schools.
//! * [`token`]: the fungible token collaborator holding the ledger's funds.
//! * [`ledger`]: owner-guarded configuration, student whitelist and the
//!   claim protocol.
//! * [`shared`]: single-writer wrapper for hosting a ledger across threads.
//! * [`snapshot`]: persisted state with a state digest.

pub mod address;
pub mod clock;
pub mod config;
pub mod identity;
pub mod ledger;
pub mod shared;
pub mod signature;
pub mod snapshot;
pub mod token;

mod error;

pub use address::{Address, IdentityKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RewardConfig;
pub use error::{LedgerError, RegistryError, SignatureError, TokenError};
pub use identity::{IdentityRegistry, InMemoryIdentityRegistry};
pub use ledger::{ClaimReceipt, LedgerEvent, RewardLedger, StudentRecord};
pub use shared::SharedLedger;
pub use signature::{ClaimSignature, ClaimSigner, SignatureVerifier};
pub use snapshot::{LedgerSnapshot, World};
pub use token::{Amount, InMemoryToken, TokenAccount};
