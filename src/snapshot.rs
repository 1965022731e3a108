//! Persisted ledger state.
//!
//! A [`LedgerSnapshot`] captures configuration, the student table and the
//! event journal together with a SHA-256 digest over configuration and
//! students. [`World`] bundles a snapshot with the state of the in-memory
//! collaborators so a whole deployment can live in one JSON file.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::address::Address;
use crate::clock::Clock;
use crate::config::ClaimConfig;
use crate::error::LedgerError;
use crate::identity::{IdentityRegistry, InMemoryIdentityRegistry, RegistryState};
use crate::ledger::{LedgerEvent, LedgerSettings, RewardLedger, StudentRecord};
use crate::token::{Amount, InMemoryToken, TokenAccount, TokenState};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub address: Address,
    pub owner: Address,
    pub identity_provider: Address,
    pub payment_token: Address,
    pub student_incentive: Amount,
    pub school_incentive: Amount,
    pub policy: ClaimConfig,
    pub students: BTreeMap<Address, StudentRecord>,
    pub events: Vec<LedgerEvent>,
    pub state_digest: [u8; 32],
}

impl LedgerSnapshot {
    pub fn compute_digest(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(self.students.len() + 1);

        let mut hasher = Sha256::new();
        hasher.update(b"config");
        hasher.update(self.address.as_bytes());
        hasher.update(self.owner.as_bytes());
        hasher.update(self.identity_provider.as_bytes());
        hasher.update(self.payment_token.as_bytes());
        hasher.update(self.student_incentive.to_le_bytes());
        hasher.update(self.school_incentive.to_le_bytes());
        hasher.update(self.policy.freshness_window_secs.to_le_bytes());
        hasher.update(self.policy.claim_interval_secs.to_le_bytes());
        leaves.push(hasher.finalize().into());

        for (student, record) in &self.students {
            let mut hasher = Sha256::new();
            hasher.update(b"student");
            hasher.update(student.as_bytes());
            hasher.update([record.active as u8]);
            hasher.update((record.info.len() as u64).to_le_bytes());
            hasher.update(record.info.as_bytes());
            match record.last_claim {
                Some(at) => {
                    hasher.update([1u8]);
                    hasher.update(at.to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"reward-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

impl RewardLedger {
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot {
            address: self.address,
            owner: self.settings.owner,
            identity_provider: self.identity_provider(),
            payment_token: self.payment_token(),
            student_incentive: self.settings.student_incentive,
            school_incentive: self.settings.school_incentive,
            policy: self.policy,
            students: self.students.clone(),
            events: self.events.clone(),
            state_digest: [0u8; 32],
        };
        snapshot.state_digest = snapshot.compute_digest();
        snapshot
    }

    /// Rebuilds a ledger from `snapshot`. The supplied collaborators must be
    /// the ones the snapshot references and the digest must match.
    pub fn restore(
        snapshot: LedgerSnapshot,
        identity_provider: Arc<dyn IdentityRegistry>,
        payment_token: Arc<dyn TokenAccount>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        if snapshot.compute_digest() != snapshot.state_digest {
            return Err(LedgerError::Snapshot("state digest mismatch".into()));
        }
        if identity_provider.address() != snapshot.identity_provider {
            return Err(LedgerError::Snapshot(format!(
                "identity provider {} does not match snapshot {}",
                identity_provider.address(),
                snapshot.identity_provider
            )));
        }
        if payment_token.address() != snapshot.payment_token {
            return Err(LedgerError::Snapshot(format!(
                "payment token {} does not match snapshot {}",
                payment_token.address(),
                snapshot.payment_token
            )));
        }
        let settings = LedgerSettings {
            owner: snapshot.owner,
            identity_provider,
            payment_token,
            student_incentive: snapshot.student_incentive,
            school_incentive: snapshot.school_incentive,
        };
        info!(
            ledger = %snapshot.address,
            students = snapshot.students.len(),
            "ledger restored from snapshot"
        );
        Ok(RewardLedger::from_parts(
            snapshot.address,
            settings,
            snapshot.policy,
            snapshot.students,
            snapshot.events,
            clock,
        ))
    }
}

/// One ledger together with the in-memory token and registry it uses.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct World {
    pub token: TokenState,
    pub registry: RegistryState,
    pub ledger: LedgerSnapshot,
}

/// Live objects rebuilt from a [`World`].
pub struct LiveWorld {
    pub token: Arc<InMemoryToken>,
    pub registry: Arc<InMemoryIdentityRegistry>,
    pub ledger: RewardLedger,
}

impl World {
    pub fn capture(
        token: &InMemoryToken,
        registry: &InMemoryIdentityRegistry,
        ledger: &RewardLedger,
    ) -> Self {
        Self {
            token: token.state(),
            registry: registry.state(),
            ledger: ledger.snapshot(),
        }
    }

    pub fn into_live(self, clock: Arc<dyn Clock>) -> Result<LiveWorld, LedgerError> {
        let token = Arc::new(InMemoryToken::from_state(self.token));
        let registry = Arc::new(InMemoryIdentityRegistry::from_state(self.registry));
        let ledger = RewardLedger::restore(self.ledger, registry.clone(), token.clone(), clock)?;
        Ok(LiveWorld {
            token,
            registry,
            ledger,
        })
    }
}

impl LiveWorld {
    pub fn capture(&self) -> World {
        World::capture(&self.token, &self.registry, &self.ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::signature::ClaimSigner;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn live() -> LiveWorld {
        let owner = addr(1);
        let token = Arc::new(InMemoryToken::new(addr(0xDA), owner));
        let registry = Arc::new(InMemoryIdentityRegistry::new(addr(0xA0), owner));
        let ledger = RewardLedger::new(
            addr(0xC0),
            owner,
            registry.clone(),
            token.clone(),
            Arc::new(ManualClock::new(1_000_000)),
        );
        LiveWorld {
            token,
            registry,
            ledger,
        }
    }

    #[test]
    fn digest_is_deterministic_and_tracks_students() {
        let mut world = live();
        let a = world.ledger.snapshot().state_digest;
        assert_eq!(a, world.ledger.snapshot().state_digest);
        world
            .ledger
            .add_student(&addr(1), addr(3), "1,alice,a")
            .unwrap();
        assert_ne!(a, world.ledger.snapshot().state_digest);
    }

    #[test]
    fn world_survives_json_and_keeps_claim_history() {
        let mut world = live();
        let owner = addr(1);
        let school = addr(2);
        let student = ClaimSigner::generate();
        world.token.mint(&owner, &owner, 100).unwrap();
        world.token.approve(&owner, &world.ledger.address(), 100);
        world.ledger.deposit(&owner, 50).unwrap();
        world.registry.register(&school);
        world
            .ledger
            .add_student(&owner, student.address(), "2,bob,b")
            .unwrap();
        world
            .ledger
            .claim_reward(&school, 1_000_000, &student.sign_timestamp(1_000_000))
            .unwrap();

        let json = serde_json::to_string_pretty(&world.capture()).unwrap();
        let parsed: World = serde_json::from_str(&json).unwrap();
        let restored = parsed
            .into_live(Arc::new(ManualClock::new(1_000_100)))
            .unwrap();

        assert_eq!(restored.ledger.token_balance(), 48);
        assert_eq!(restored.token.balance_of(&school), 1);
        assert!(restored.ledger.is_whitelisted(&student.address()));
        assert_eq!(restored.ledger.last_claim(&student.address()), Some(1_000_000));
        assert_eq!(restored.ledger.events().len(), world.ledger.events().len());
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let mut world = live();
        world.ledger.add_student(&addr(1), addr(3), "x").unwrap();
        let mut snapshot = world.ledger.snapshot();
        snapshot.students.get_mut(&addr(3)).unwrap().last_claim = Some(5);
        let err = RewardLedger::restore(
            snapshot,
            world.registry.clone(),
            world.token.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap_err();
        assert_eq!(err, LedgerError::Snapshot("state digest mismatch".into()));
    }

    #[test]
    fn mismatched_collaborator_is_rejected() {
        let world = live();
        let other_token = Arc::new(InMemoryToken::new(addr(0xDB), addr(1)));
        let err = RewardLedger::restore(
            world.ledger.snapshot(),
            world.registry.clone(),
            other_token,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Snapshot(_)));
    }
}
