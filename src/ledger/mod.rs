//! The reward ledger: owner-guarded configuration, the student whitelist and
//! the signature-authorized claim protocol.
//!
//! A claim is submitted by a school with a student's signature over a unix
//! timestamp. The student is never named by the caller; it is whoever the
//! signature recovers to. All eligibility checks run before any funds move,
//! and the two incentive transfers are applied as one batch, so a failed
//! claim leaves balances, records and the event log untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::clock::Clock;
use crate::config::{ClaimConfig, IncentiveConfig};
use crate::error::LedgerError;
use crate::identity::IdentityRegistry;
use crate::signature::{ClaimSignature, SignatureVerifier};
use crate::token::{Amount, TokenAccount, TransferPlan};

/// Whitelist entry for a student. Removal clears `active` only; `info` and
/// `last_claim` are retained.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StudentRecord {
    pub active: bool,
    pub info: String,
    pub last_claim: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncentiveKind {
    Student,
    School,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    StudentAdded {
        student: Address,
        info: String,
    },
    StudentInfoUpdated {
        student: Address,
        info: String,
    },
    StudentRemoved {
        student: Address,
    },
    ClaimReset {
        student: Address,
    },
    IncentiveUpdated {
        kind: IncentiveKind,
        amount: Amount,
    },
    IdentityProviderUpdated {
        provider: Address,
    },
    PaymentTokenUpdated {
        token: Address,
    },
    Deposited {
        from: Address,
        amount: Amount,
    },
    Withdrawn {
        to: Address,
        amount: Amount,
    },
    RewardClaimed {
        student: Address,
        school: Address,
        student_amount: Amount,
        school_amount: Amount,
        signed_at: u64,
        claimed_at: u64,
    },
}

/// Result of a paid claim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub student: Address,
    pub school: Address,
    pub student_amount: Amount,
    pub school_amount: Amount,
    pub claimed_at: u64,
}

/// Administrative configuration. Only the owner-guarded setters on
/// [`RewardLedger`] change it.
#[derive(Clone)]
pub struct LedgerSettings {
    pub owner: Address,
    pub identity_provider: Arc<dyn IdentityRegistry>,
    pub payment_token: Arc<dyn TokenAccount>,
    pub student_incentive: Amount,
    pub school_incentive: Amount,
}

impl std::fmt::Debug for LedgerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSettings")
            .field("owner", &self.owner)
            .field("identity_provider", &self.identity_provider.address())
            .field("payment_token", &self.payment_token.address())
            .field("student_incentive", &self.student_incentive)
            .field("school_incentive", &self.school_incentive)
            .finish()
    }
}

pub struct RewardLedger {
    pub(crate) address: Address,
    pub(crate) settings: LedgerSettings,
    pub(crate) policy: ClaimConfig,
    pub(crate) students: BTreeMap<Address, StudentRecord>,
    pub(crate) events: Vec<LedgerEvent>,
    verifier: SignatureVerifier,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RewardLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardLedger")
            .field("address", &self.address)
            .field("settings", &self.settings)
            .field("policy", &self.policy)
            .field("students", &self.students.len())
            .finish_non_exhaustive()
    }
}

impl RewardLedger {
    /// Creates a ledger held by `address` (its account in the payment token)
    /// and administered by `owner`. Incentives start at 1 each.
    pub fn new(
        address: Address,
        owner: Address,
        identity_provider: Arc<dyn IdentityRegistry>,
        payment_token: Arc<dyn TokenAccount>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let incentives = IncentiveConfig::default();
        Self {
            address,
            settings: LedgerSettings {
                owner,
                identity_provider,
                payment_token,
                student_incentive: incentives.student,
                school_incentive: incentives.school,
            },
            policy: ClaimConfig::default(),
            students: BTreeMap::new(),
            events: Vec::new(),
            verifier: SignatureVerifier::new(),
            clock,
        }
    }

    pub fn with_policy(mut self, policy: ClaimConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_incentives(mut self, incentives: IncentiveConfig) -> Self {
        self.settings.student_incentive = incentives.student;
        self.settings.school_incentive = incentives.school;
        self
    }

    pub(crate) fn from_parts(
        address: Address,
        settings: LedgerSettings,
        policy: ClaimConfig,
        students: BTreeMap<Address, StudentRecord>,
        events: Vec<LedgerEvent>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            address,
            settings,
            policy,
            students,
            events,
            verifier: SignatureVerifier::new(),
            clock,
        }
    }

    // ---------------------------------------------------------------------
    // reads

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.settings.owner
    }

    pub fn identity_provider(&self) -> Address {
        self.settings.identity_provider.address()
    }

    pub fn payment_token(&self) -> Address {
        self.settings.payment_token.address()
    }

    pub fn student_incentive(&self) -> Amount {
        self.settings.student_incentive
    }

    pub fn school_incentive(&self) -> Amount {
        self.settings.school_incentive
    }

    pub fn policy(&self) -> ClaimConfig {
        self.policy
    }

    /// The ledger's holdings as reported by the payment token.
    pub fn token_balance(&self) -> Amount {
        self.settings.payment_token.balance_of(&self.address)
    }

    pub fn is_whitelisted(&self, student: &Address) -> bool {
        self.active_student(student).is_some()
    }

    pub fn student_info(&self, student: &Address) -> Option<&str> {
        self.active_student(student).map(|r| r.info.as_str())
    }

    /// Raw record, including soft-deleted students.
    pub fn student(&self, student: &Address) -> Option<&StudentRecord> {
        self.students.get(student)
    }

    pub fn last_claim(&self, student: &Address) -> Option<u64> {
        self.students.get(student).and_then(|r| r.last_claim)
    }

    /// Earliest time at which `student` may be paid again, if throttled.
    pub fn next_claim_at(&self, student: &Address) -> Option<u64> {
        self.last_claim(student)
            .map(|last| last.saturating_add(self.policy.claim_interval_secs))
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn recover_student_address(
        &self,
        timestamp: u64,
        signature: &ClaimSignature,
    ) -> Result<Address, LedgerError> {
        Ok(self.verifier.recover_signer(timestamp, signature)?)
    }

    fn active_student(&self, student: &Address) -> Option<&StudentRecord> {
        self.students.get(student).filter(|r| r.active)
    }

    // ---------------------------------------------------------------------
    // owner-only operations

    /// Runs `op` only when `caller` is the owner. Every administrative entry
    /// point goes through here.
    fn as_owner<T>(
        &mut self,
        caller: &Address,
        operation: &'static str,
        op: impl FnOnce(&mut Self) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        if *caller != self.settings.owner {
            warn!(%caller, operation, "access denied");
            return Err(LedgerError::AccessDenied {
                caller: *caller,
                operation,
            });
        }
        op(self)
    }

    pub fn set_identity_provider(
        &mut self,
        caller: &Address,
        provider: Arc<dyn IdentityRegistry>,
    ) -> Result<(), LedgerError> {
        self.as_owner(caller, "set_identity_provider", |ledger| {
            let address = provider.address();
            ledger.settings.identity_provider = provider;
            ledger
                .events
                .push(LedgerEvent::IdentityProviderUpdated { provider: address });
            info!(provider = %address, "identity provider replaced");
            Ok(())
        })
    }

    pub fn set_payment_token(
        &mut self,
        caller: &Address,
        token: Arc<dyn TokenAccount>,
    ) -> Result<(), LedgerError> {
        self.as_owner(caller, "set_payment_token", |ledger| {
            let address = token.address();
            ledger.settings.payment_token = token;
            ledger
                .events
                .push(LedgerEvent::PaymentTokenUpdated { token: address });
            info!(token = %address, "payment token replaced");
            Ok(())
        })
    }

    pub fn set_student_incentive(
        &mut self,
        caller: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.as_owner(caller, "set_student_incentive", |ledger| {
            ledger.settings.student_incentive = amount;
            ledger.events.push(LedgerEvent::IncentiveUpdated {
                kind: IncentiveKind::Student,
                amount,
            });
            info!(amount, "student incentive updated");
            Ok(())
        })
    }

    pub fn set_school_incentive(
        &mut self,
        caller: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.as_owner(caller, "set_school_incentive", |ledger| {
            ledger.settings.school_incentive = amount;
            ledger.events.push(LedgerEvent::IncentiveUpdated {
                kind: IncentiveKind::School,
                amount,
            });
            info!(amount, "school incentive updated");
            Ok(())
        })
    }

    pub fn add_student(
        &mut self,
        caller: &Address,
        student: Address,
        info: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let info = info.into();
        self.as_owner(caller, "add_student", |ledger| {
            let record = ledger.students.entry(student).or_default();
            if record.active {
                return Err(LedgerError::AlreadyExists(student));
            }
            record.active = true;
            record.info = info.clone();
            ledger
                .events
                .push(LedgerEvent::StudentAdded { student, info });
            info!(%student, "student whitelisted");
            Ok(())
        })
    }

    pub fn update_student_info(
        &mut self,
        caller: &Address,
        student: Address,
        info: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let info = info.into();
        self.as_owner(caller, "update_student_info", |ledger| {
            let record = ledger
                .students
                .get_mut(&student)
                .filter(|r| r.active)
                .ok_or(LedgerError::NotFound(student))?;
            record.info = info.clone();
            ledger
                .events
                .push(LedgerEvent::StudentInfoUpdated { student, info });
            info!(%student, "student info updated");
            Ok(())
        })
    }

    pub fn remove_student(
        &mut self,
        caller: &Address,
        student: Address,
    ) -> Result<(), LedgerError> {
        self.as_owner(caller, "remove_student", |ledger| {
            let record = ledger
                .students
                .get_mut(&student)
                .filter(|r| r.active)
                .ok_or(LedgerError::NotFound(student))?;
            record.active = false;
            ledger.events.push(LedgerEvent::StudentRemoved { student });
            info!(%student, "student removed from whitelist");
            Ok(())
        })
    }

    /// Clears the throttle for `student`, whitelisted or not.
    pub fn reset_claim(&mut self, caller: &Address, student: Address) -> Result<(), LedgerError> {
        self.as_owner(caller, "reset_claim", |ledger| {
            if let Some(record) = ledger.students.get_mut(&student) {
                record.last_claim = None;
            }
            ledger.events.push(LedgerEvent::ClaimReset { student });
            info!(%student, "claim throttle reset");
            Ok(())
        })
    }

    /// Pulls `amount` from the owner into the ledger. The owner must have
    /// approved the ledger's address on the payment token beforehand.
    pub fn deposit(&mut self, caller: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.as_owner(caller, "deposit", |ledger| {
            let owner = ledger.settings.owner;
            ledger.settings.payment_token.transfer_from(
                &ledger.address,
                &owner,
                &ledger.address,
                amount,
            )?;
            ledger.events.push(LedgerEvent::Deposited {
                from: owner,
                amount,
            });
            info!(amount, balance = ledger.token_balance(), "deposit received");
            Ok(())
        })
    }

    pub fn withdraw(&mut self, caller: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.as_owner(caller, "withdraw", |ledger| {
            let available = ledger.token_balance();
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    available,
                    required: amount,
                });
            }
            let owner = ledger.settings.owner;
            ledger
                .settings
                .payment_token
                .transfer(&ledger.address, &owner, amount)?;
            ledger.events.push(LedgerEvent::Withdrawn { to: owner, amount });
            info!(amount, balance = ledger.token_balance(), "withdrawal sent");
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // claim protocol

    /// Pays the student who signed `timestamp` and the calling school.
    ///
    /// The clock is read once; every window check uses that reading.
    pub fn claim_reward(
        &mut self,
        school: &Address,
        timestamp: u64,
        signature: &ClaimSignature,
    ) -> Result<ClaimReceipt, LedgerError> {
        let now = self.clock.now();
        match self.claim_at(school, timestamp, signature, now) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                warn!(%school, timestamp, now, error = %err, "claim rejected");
                Err(err)
            }
        }
    }

    fn claim_at(
        &mut self,
        school: &Address,
        timestamp: u64,
        signature: &ClaimSignature,
        now: u64,
    ) -> Result<ClaimReceipt, LedgerError> {
        let student = self.verifier.recover_signer(timestamp, signature)?;
        let (student_amount, school_amount) =
            self.check_eligibility(&student, school, timestamp, now)?;

        let plan = TransferPlan::new()
            .push(student, student_amount)
            .push(*school, school_amount);
        self.settings
            .payment_token
            .transfer_batch(&self.address, &plan)?;

        self.students.entry(student).or_default().last_claim = Some(now);
        self.events.push(LedgerEvent::RewardClaimed {
            student,
            school: *school,
            student_amount,
            school_amount,
            signed_at: timestamp,
            claimed_at: now,
        });
        info!(
            %student,
            %school,
            student_amount,
            school_amount,
            balance = self.token_balance(),
            "reward claimed"
        );
        Ok(ClaimReceipt {
            student,
            school: *school,
            student_amount,
            school_amount,
            claimed_at: now,
        })
    }

    /// Checks every precondition of a claim without touching state and
    /// returns the amounts to pay.
    fn check_eligibility(
        &self,
        student: &Address,
        school: &Address,
        timestamp: u64,
        now: u64,
    ) -> Result<(Amount, Amount), LedgerError> {
        let record = self
            .active_student(student)
            .ok_or(LedgerError::NotWhitelisted(*student))?;

        // the ledger never pays itself as a school
        if *school == self.address || !self.settings.identity_provider.is_registered(school) {
            return Err(LedgerError::SchoolNotRegistered(*school));
        }

        if timestamp <= now && now - timestamp > self.policy.freshness_window_secs {
            return Err(LedgerError::SignatureExpired { timestamp, now });
        }
        if timestamp > now {
            return Err(LedgerError::TimestampInFuture { timestamp, now });
        }

        if let Some(last_claim) = record.last_claim {
            if now.saturating_sub(last_claim) < self.policy.claim_interval_secs {
                return Err(LedgerError::ClaimTooSoon {
                    student: *student,
                    last_claim,
                    next_allowed: last_claim.saturating_add(self.policy.claim_interval_secs),
                });
            }
        }

        let student_amount = self.settings.student_incentive;
        let school_amount = self.settings.school_incentive;
        let available = self.token_balance();
        let required = student_amount.checked_add(school_amount);
        match required {
            Some(required) if available >= required => {}
            _ => {
                return Err(LedgerError::InsufficientFunds {
                    available,
                    required: required.unwrap_or(Amount::MAX),
                })
            }
        }
        debug!(%student, %school, timestamp, now, "claim eligible");
        Ok((student_amount, school_amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::error::TokenError;
    use crate::identity::InMemoryIdentityRegistry;
    use crate::signature::ClaimSigner;
    use crate::token::{InMemoryToken, TokenState};

    const T0: u64 = 1_700_000_000;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    struct Fixture {
        owner: Address,
        school: Address,
        student: ClaimSigner,
        registry: Arc<InMemoryIdentityRegistry>,
        token: Arc<InMemoryToken>,
        clock: Arc<ManualClock>,
        ledger: RewardLedger,
    }

    fn fixture() -> Fixture {
        let owner = addr(1);
        let school = addr(2);
        let registry = Arc::new(InMemoryIdentityRegistry::new(addr(0xA0), owner));
        let token = Arc::new(InMemoryToken::new(addr(0xDA), owner));
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = RewardLedger::new(
            addr(0xC0),
            owner,
            registry.clone(),
            token.clone(),
            clock.clone(),
        );
        token.mint(&owner, &owner, 100).unwrap();
        token.approve(&owner, &ledger.address(), 1_000);
        Fixture {
            owner,
            school,
            student: ClaimSigner::generate(),
            registry,
            token,
            clock,
            ledger,
        }
    }

    /// Funded ledger, registered school, whitelisted student.
    fn ready() -> Fixture {
        let mut f = fixture();
        f.ledger.deposit(&f.owner, 50).unwrap();
        f.registry.register(&f.school);
        f.ledger
            .add_student(&f.owner, f.student.address(), "2,bob,b")
            .unwrap();
        f
    }

    fn balances(f: &Fixture) -> (Amount, Amount, Amount) {
        (
            f.ledger.token_balance(),
            f.token.balance_of(&f.student.address()),
            f.token.balance_of(&f.school),
        )
    }

    #[test]
    fn defaults_after_construction() {
        let f = fixture();
        assert_eq!(f.ledger.owner(), f.owner);
        assert_eq!(f.ledger.identity_provider(), addr(0xA0));
        assert_eq!(f.ledger.payment_token(), addr(0xDA));
        assert_eq!(f.ledger.student_incentive(), 1);
        assert_eq!(f.ledger.school_incentive(), 1);
        assert_eq!(f.ledger.token_balance(), 0);
    }

    #[test]
    fn every_admin_operation_rejects_non_owner() {
        let mut f = fixture();
        let intruder = addr(9);
        let other_registry = Arc::new(InMemoryIdentityRegistry::new(addr(0xA1), intruder));
        let other_token = Arc::new(InMemoryToken::new(addr(0xDB), intruder));

        let results = vec![
            f.ledger.set_identity_provider(&intruder, other_registry),
            f.ledger.set_payment_token(&intruder, other_token),
            f.ledger.set_student_incentive(&intruder, 20),
            f.ledger.set_school_incentive(&intruder, 20),
            f.ledger.add_student(&intruder, addr(3), "x"),
            f.ledger.update_student_info(&intruder, addr(3), "x"),
            f.ledger.remove_student(&intruder, addr(3)),
            f.ledger.reset_claim(&intruder, addr(3)),
            f.ledger.deposit(&intruder, 1),
            f.ledger.withdraw(&intruder, 1),
        ];
        for result in results {
            assert!(matches!(
                result,
                Err(LedgerError::AccessDenied { caller, .. }) if caller == intruder
            ));
        }
        assert_eq!(f.ledger.identity_provider(), addr(0xA0));
        assert_eq!(f.ledger.payment_token(), addr(0xDA));
        assert_eq!(f.ledger.student_incentive(), 1);
        assert!(!f.ledger.is_whitelisted(&addr(3)));
        assert!(f.ledger.events().is_empty());
    }

    #[test]
    fn owner_swaps_collaborators() {
        let mut f = fixture();
        let other_registry = Arc::new(InMemoryIdentityRegistry::new(addr(0xA1), addr(3)));
        f.ledger
            .set_identity_provider(&f.owner, other_registry)
            .unwrap();
        assert_eq!(f.ledger.identity_provider(), addr(0xA1));

        let other_token = Arc::new(InMemoryToken::new(addr(0xDB), addr(3)));
        f.ledger.set_payment_token(&f.owner, other_token).unwrap();
        assert_eq!(f.ledger.payment_token(), addr(0xDB));
        assert_eq!(f.ledger.token_balance(), 0);
    }

    #[test]
    fn student_lifecycle() {
        let mut f = fixture();
        let alice = addr(3);
        f.ledger.add_student(&f.owner, alice, "1,alice,a").unwrap();
        assert!(f.ledger.is_whitelisted(&alice));
        assert_eq!(f.ledger.student_info(&alice), Some("1,alice,a"));

        assert_eq!(
            f.ledger.add_student(&f.owner, alice, "1,alice,a"),
            Err(LedgerError::AlreadyExists(alice))
        );

        f.ledger
            .update_student_info(&f.owner, alice, "aaa,bbb,ccc,ddd,eee")
            .unwrap();
        assert_eq!(f.ledger.student_info(&alice), Some("aaa,bbb,ccc,ddd,eee"));

        f.ledger.remove_student(&f.owner, alice).unwrap();
        assert!(!f.ledger.is_whitelisted(&alice));
        assert_eq!(f.ledger.student_info(&alice), None);
        // soft delete keeps the payload
        assert_eq!(f.ledger.student(&alice).unwrap().info, "aaa,bbb,ccc,ddd,eee");

        assert_eq!(
            f.ledger.remove_student(&f.owner, alice),
            Err(LedgerError::NotFound(alice))
        );
        assert_eq!(
            f.ledger.update_student_info(&f.owner, alice, "DASDASDASDASD"),
            Err(LedgerError::NotFound(alice))
        );

        f.ledger.add_student(&f.owner, alice, "again").unwrap();
        assert_eq!(f.ledger.student_info(&alice), Some("again"));
    }

    #[test]
    fn deposit_requires_allowance_and_balance() {
        let mut f = fixture();
        f.ledger.deposit(&f.owner, 50).unwrap();
        assert_eq!(f.ledger.token_balance(), 50);

        // owner only holds 50 more
        let err = f.ledger.deposit(&f.owner, 100).unwrap_err();
        assert!(matches!(err, LedgerError::TransferFailed(_)));
        assert_eq!(f.ledger.token_balance(), 50);

        f.token.mint(&f.owner, &f.owner, 10_000).unwrap();
        f.ledger.deposit(&f.owner, 100).unwrap();
        assert_eq!(f.ledger.token_balance(), 150);

        // remaining allowance is 850
        let err = f.ledger.deposit(&f.owner, 2_000).unwrap_err();
        assert!(matches!(err, LedgerError::TransferFailed(_)));
        f.token.approve(&f.owner, &f.ledger.address(), 5_000);
        f.ledger.deposit(&f.owner, 2_000).unwrap();
        assert_eq!(f.ledger.token_balance(), 2_150);
    }

    #[test]
    fn withdraw_is_bounded_by_balance() {
        let mut f = fixture();
        assert_eq!(
            f.ledger.withdraw(&f.owner, 1),
            Err(LedgerError::InsufficientFunds {
                available: 0,
                required: 1
            })
        );
        f.ledger.deposit(&f.owner, 50).unwrap();
        f.ledger.withdraw(&f.owner, 25).unwrap();
        assert_eq!(f.ledger.token_balance(), 25);
        assert!(f.ledger.withdraw(&f.owner, 30).is_err());
        f.ledger.withdraw(&f.owner, 25).unwrap();
        assert_eq!(f.ledger.token_balance(), 0);
        assert_eq!(f.token.balance_of(&f.owner), 100);
    }

    #[test]
    fn direct_transfers_show_up_in_balance() {
        let f = fixture();
        f.token.transfer(&f.owner, &f.ledger.address(), 30).unwrap();
        assert_eq!(f.ledger.token_balance(), 30);
    }

    #[test]
    fn successful_claim_pays_both_parties() {
        let mut f = ready();
        let sig = f.student.sign_timestamp(T0);
        let receipt = f.ledger.claim_reward(&f.school, T0, &sig).unwrap();
        assert_eq!(receipt.student, f.student.address());
        assert_eq!(receipt.claimed_at, T0);
        assert_eq!(balances(&f), (48, 1, 1));
        assert_eq!(f.ledger.last_claim(&f.student.address()), Some(T0));
        assert_eq!(f.ledger.next_claim_at(&f.student.address()), Some(T0 + 86_400));
        assert!(matches!(
            f.ledger.events().last(),
            Some(LedgerEvent::RewardClaimed { .. })
        ));
    }

    #[test]
    fn custom_incentives_are_paid() {
        let mut f = fixture();
        f.ledger.set_student_incentive(&f.owner, 17).unwrap();
        f.ledger.set_school_incentive(&f.owner, 8).unwrap();
        f.ledger.deposit(&f.owner, 50).unwrap();
        f.registry.register(&f.school);
        f.ledger
            .add_student(&f.owner, f.student.address(), "2,bob,b")
            .unwrap();
        let sig = f.student.sign_timestamp(T0);
        f.ledger.claim_reward(&f.school, T0, &sig).unwrap();
        assert_eq!(balances(&f), (25, 17, 8));
    }

    fn assert_rejected_without_effects(
        f: &mut Fixture,
        ts: u64,
        sig: &ClaimSignature,
        school: Address,
    ) -> LedgerError {
        let before = balances(f);
        let last = f.ledger.last_claim(&f.student.address());
        let events = f.ledger.events().len();
        let err = f.ledger.claim_reward(&school, ts, sig).unwrap_err();
        assert_eq!(balances(f), before);
        assert_eq!(f.ledger.last_claim(&f.student.address()), last);
        assert_eq!(f.ledger.events().len(), events);
        err
    }

    #[test]
    fn claim_for_unlisted_student_fails() {
        let mut f = ready();
        let stranger = ClaimSigner::generate();
        let sig = stranger.sign_timestamp(T0);
        let school = f.school;
        let err = assert_rejected_without_effects(&mut f, T0, &sig, school);
        assert_eq!(err, LedgerError::NotWhitelisted(stranger.address()));
    }

    #[test]
    fn claim_from_unregistered_school_fails() {
        let mut f = ready();
        let sig = f.student.sign_timestamp(T0);
        let err = assert_rejected_without_effects(&mut f, T0, &sig, addr(7));
        assert_eq!(err, LedgerError::SchoolNotRegistered(addr(7)));
    }

    #[test]
    fn student_cannot_claim_as_own_school() {
        let mut f = ready();
        let sig = f.student.sign_timestamp(T0);
        let student = f.student.address();
        let err = assert_rejected_without_effects(&mut f, T0, &sig, student);
        assert_eq!(err, LedgerError::SchoolNotRegistered(student));
    }

    #[test]
    fn freshness_window_is_inclusive() {
        let mut f = ready();
        let school = f.school;

        let ts = T0 - 601;
        let sig = f.student.sign_timestamp(ts);
        let err = assert_rejected_without_effects(&mut f, ts, &sig, school);
        assert_eq!(err, LedgerError::SignatureExpired { timestamp: ts, now: T0 });

        let ts = T0 + 1;
        let sig = f.student.sign_timestamp(ts);
        let err = assert_rejected_without_effects(&mut f, ts, &sig, school);
        assert_eq!(err, LedgerError::TimestampInFuture { timestamp: ts, now: T0 });
        assert!(err.is_retryable());

        let ts = T0 - 600;
        f.ledger
            .claim_reward(&school, ts, &f.student.sign_timestamp(ts))
            .unwrap();
    }

    #[test]
    fn throttle_window_is_inclusive() {
        let mut f = ready();
        let school = f.school;
        f.ledger
            .claim_reward(&school, T0, &f.student.sign_timestamp(T0))
            .unwrap();

        let now = f.clock.advance(3_599);
        let sig = f.student.sign_timestamp(now);
        let err = assert_rejected_without_effects(&mut f, now, &sig, school);
        assert!(matches!(err, LedgerError::ClaimTooSoon { last_claim: T0, .. }));

        let now = f.clock.set(T0 + 86_399);
        let sig = f.student.sign_timestamp(now);
        let err = assert_rejected_without_effects(&mut f, now, &sig, school);
        assert!(err.is_retryable());

        let now = f.clock.set(T0 + 86_400);
        f.ledger
            .claim_reward(&school, now, &f.student.sign_timestamp(now))
            .unwrap();
        assert_eq!(balances(&f), (46, 2, 2));
    }

    #[test]
    fn reset_claim_allows_replaying_the_same_signature() {
        let mut f = ready();
        let school = f.school;
        let sig = f.student.sign_timestamp(T0);
        f.ledger.claim_reward(&school, T0, &sig).unwrap();
        assert!(matches!(
            f.ledger.claim_reward(&school, T0, &sig),
            Err(LedgerError::ClaimTooSoon { .. })
        ));

        assert!(f.ledger.reset_claim(&school, f.student.address()).is_err());
        f.ledger.reset_claim(&f.owner, f.student.address()).unwrap();
        assert_eq!(f.ledger.last_claim(&f.student.address()), None);

        f.ledger.claim_reward(&school, T0, &sig).unwrap();
        assert_eq!(balances(&f), (46, 2, 2));
    }

    #[test]
    fn reset_claim_does_not_require_whitelisting() {
        let mut f = ready();
        let student = f.student.address();
        let school = f.school;
        f.ledger
            .claim_reward(&school, T0, &f.student.sign_timestamp(T0))
            .unwrap();
        f.ledger.remove_student(&f.owner, student).unwrap();
        f.ledger.reset_claim(&f.owner, student).unwrap();
        assert_eq!(f.ledger.last_claim(&student), None);
        f.ledger.reset_claim(&f.owner, addr(0x55)).unwrap();
    }

    #[test]
    fn removed_student_cannot_claim_and_keeps_last_claim() {
        let mut f = ready();
        let school = f.school;
        let student = f.student.address();
        f.ledger
            .claim_reward(&school, T0, &f.student.sign_timestamp(T0))
            .unwrap();
        f.ledger.remove_student(&f.owner, student).unwrap();
        assert_eq!(f.ledger.last_claim(&student), Some(T0));

        let now = f.clock.advance(86_400);
        let err = f
            .ledger
            .claim_reward(&school, now, &f.student.sign_timestamp(now))
            .unwrap_err();
        assert_eq!(err, LedgerError::NotWhitelisted(student));
    }

    #[test]
    fn underfunded_ledger_rejects_claim() {
        let mut f = fixture();
        f.registry.register(&f.school);
        f.ledger
            .add_student(&f.owner, f.student.address(), "2,bob,b")
            .unwrap();
        let school = f.school;
        let sig = f.student.sign_timestamp(T0);
        let err = assert_rejected_without_effects(&mut f, T0, &sig, school);
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                available: 0,
                required: 2
            }
        );
        assert!(err.is_underfunded());

        f.ledger.deposit(&f.owner, 1).unwrap();
        let err = f
            .ledger
            .claim_reward(&school, T0, &f.student.sign_timestamp(T0))
            .unwrap_err();
        assert!(err.is_underfunded());
    }

    #[test]
    fn overflowing_incentives_are_reported_as_underfunded() {
        let mut f = ready();
        f.ledger.set_student_incentive(&f.owner, Amount::MAX).unwrap();
        let school = f.school;
        let sig = f.student.sign_timestamp(T0);
        let err = assert_rejected_without_effects(&mut f, T0, &sig, school);
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                available: 50,
                required: Amount::MAX
            }
        );
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let mut f = ready();
        let mut sig = f.student.sign_timestamp(T0);
        sig.0[64] = 5;
        let school = f.school;
        let err = assert_rejected_without_effects(&mut f, T0, &sig, school);
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[test]
    fn recover_student_address_matches_signer() {
        let f = fixture();
        for ts in [20u64, 35, 999, 9_358_639_819_113] {
            let sig = f.student.sign_timestamp(ts);
            assert_eq!(
                f.ledger.recover_student_address(ts, &sig).unwrap(),
                f.student.address()
            );
        }
    }

    #[test]
    fn ledger_cannot_claim_as_school() {
        let mut f = ready();
        let ledger = f.ledger.address();
        f.registry.register(&ledger);
        let sig = f.student.sign_timestamp(T0);
        let err = assert_rejected_without_effects(&mut f, T0, &sig, ledger);
        assert_eq!(err, LedgerError::SchoolNotRegistered(ledger));
        assert_eq!(f.ledger.token_balance(), 50);
    }

    #[test]
    fn failed_payout_records_nothing() {
        let mut f = ready();
        let student = f.student.address();
        let ledger = f.ledger.address();
        let token = Arc::new(InMemoryToken::from_state(TokenState {
            address: addr(0xDB),
            minter: f.owner,
            total_supply: Amount::MAX,
            balances: BTreeMap::from([(ledger, 50), (student, Amount::MAX)]),
            allowances: BTreeMap::new(),
            events: Vec::new(),
        }));
        f.ledger.set_payment_token(&f.owner, token.clone()).unwrap();
        let events = f.ledger.events().len();

        let sig = f.student.sign_timestamp(T0);
        let err = f.ledger.claim_reward(&f.school, T0, &sig).unwrap_err();

        assert_eq!(err, LedgerError::TransferFailed(TokenError::Overflow(student)));
        assert_eq!(f.ledger.last_claim(&student), None);
        assert_eq!(f.ledger.events().len(), events);
        assert_eq!(f.ledger.token_balance(), 50);
        assert_eq!(token.balance_of(&student), Amount::MAX);
        assert_eq!(token.balance_of(&f.school), 0);
        assert!(token.events().is_empty());
    }

    #[test]
    fn signature_for_another_student_is_not_accepted() {
        let mut f = ready();
        let impostor = ClaimSigner::generate();
        f.registry.register(&impostor.address());
        let sig = impostor.sign_timestamp(T0);
        let school = f.school;
        let err = assert_rejected_without_effects(&mut f, T0, &sig, school);
        assert_eq!(err, LedgerError::NotWhitelisted(impostor.address()));
    }
}
