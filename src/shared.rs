use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::Address;
use crate::error::LedgerError;
use crate::ledger::{ClaimReceipt, RewardLedger};
use crate::signature::ClaimSignature;
use crate::token::Amount;

/// Handle for hosting one [`RewardLedger`] behind concurrent callers.
///
/// Every mutation runs under the write lock, so a claim's eligibility check
/// and payout are never interleaved with another mutation. Reads share the
/// read lock and always observe a completed operation.
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<RwLock<RewardLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: RewardLedger) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ledger)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&RewardLedger) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut RewardLedger) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn claim_reward(
        &self,
        school: &Address,
        timestamp: u64,
        signature: &ClaimSignature,
    ) -> Result<ClaimReceipt, LedgerError> {
        self.write(|ledger| ledger.claim_reward(school, timestamp, signature))
    }

    pub fn token_balance(&self) -> Amount {
        self.read(|ledger| ledger.token_balance())
    }

    pub fn is_whitelisted(&self, student: &Address) -> bool {
        self.read(|ledger| ledger.is_whitelisted(student))
    }

    pub fn last_claim(&self, student: &Address) -> Option<u64> {
        self.read(|ledger| ledger.last_claim(student))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::clock::ManualClock;
    use crate::identity::InMemoryIdentityRegistry;
    use crate::signature::ClaimSigner;
    use crate::token::{InMemoryToken, TokenAccount};

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn concurrent_claims_for_one_student_pay_once() {
        let owner = Address([1; 20]);
        let token = Arc::new(InMemoryToken::new(Address([0xDA; 20]), owner));
        let registry = Arc::new(InMemoryIdentityRegistry::new(Address([0xA0; 20]), owner));
        let mut ledger = RewardLedger::new(
            Address([0xC0; 20]),
            owner,
            registry.clone(),
            token.clone(),
            Arc::new(ManualClock::new(NOW)),
        );
        token.mint(&owner, &owner, 1_000).unwrap();
        token.approve(&owner, &ledger.address(), 1_000);
        ledger.deposit(&owner, 1_000).unwrap();

        let student = ClaimSigner::generate();
        ledger
            .add_student(&owner, student.address(), "2,bob,b")
            .unwrap();
        let schools: Vec<Address> = (10u8..18).map(|b| Address([b; 20])).collect();
        for school in &schools {
            registry.register(school);
        }

        let shared = SharedLedger::new(ledger);
        let signature = student.sign_timestamp(NOW);
        let handles: Vec<_> = schools
            .iter()
            .map(|school| {
                let shared = shared.clone();
                let school = *school;
                thread::spawn(move || shared.claim_reward(&school, NOW, &signature).is_ok())
            })
            .collect();
        let paid = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(paid, 1);
        assert_eq!(shared.token_balance(), 998);
        assert_eq!(token.balance_of(&student.address()), 1);
        assert_eq!(shared.last_claim(&student.address()), Some(NOW));
    }
}
