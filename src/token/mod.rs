//! Fungible token collaborator used to hold and pay out incentives.
//!
//! The ledger only moves funds through [`TokenAccount`]; every call either
//! applies completely or returns an error with balances untouched.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::Address;
use crate::error::TokenError;

pub type Amount = u64;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub to: Address,
    pub amount: Amount,
}

/// Set of transfers out of one account that must land together.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TransferPlan {
    pub transfers: Vec<PlannedTransfer>,
}

impl TransferPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, to: Address, amount: Amount) -> Self {
        self.transfers.push(PlannedTransfer { to, amount });
        self
    }

    /// `None` when the sum overflows.
    pub fn total_amount(&self) -> Option<Amount> {
        self.transfers
            .iter()
            .try_fold(0u64, |acc, t| acc.checked_add(t.amount))
    }
}

pub trait TokenAccount: Send + Sync {
    fn address(&self) -> Address;

    fn balance_of(&self, who: &Address) -> Amount;

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount;

    /// Sets the amount `spender` may pull from `owner`, replacing any previous value.
    fn approve(&self, owner: &Address, spender: &Address, amount: Amount);

    fn transfer(&self, caller: &Address, to: &Address, amount: Amount) -> Result<(), TokenError>;

    fn transfer_from(
        &self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TokenError>;

    /// Applies every transfer in `plan` out of `caller`'s balance, or none of them.
    fn transfer_batch(&self, caller: &Address, plan: &TransferPlan) -> Result<(), TokenError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    Mint {
        to: Address,
        amount: Amount,
    },
    Transfer {
        from: Address,
        to: Address,
        amount: Amount,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenState {
    pub address: Address,
    pub minter: Address,
    pub total_supply: Amount,
    pub balances: BTreeMap<Address, Amount>,
    pub allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
    pub events: Vec<TokenEvent>,
}

impl TokenState {
    fn balance(&self, who: &Address) -> Amount {
        self.balances.get(who).copied().unwrap_or(0)
    }

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|m| m.get(spender))
            .copied()
            .unwrap_or(0)
    }

    /// Stages all movements on a scratch copy of the touched balances and
    /// commits only if every debit and credit succeeds.
    fn apply_plan(&mut self, from: &Address, plan: &TransferPlan) -> Result<(), TokenError> {
        let mut staged: BTreeMap<Address, Amount> = BTreeMap::new();
        for transfer in &plan.transfers {
            let available = *staged.entry(*from).or_insert_with(|| self.balance(from));
            if available < transfer.amount {
                return Err(TokenError::InsufficientBalance {
                    account: *from,
                    available: self.balance(from),
                    required: plan.total_amount().unwrap_or(Amount::MAX),
                });
            }
            staged.insert(*from, available - transfer.amount);

            let current = *staged
                .entry(transfer.to)
                .or_insert_with(|| self.balance(&transfer.to));
            let credited = current
                .checked_add(transfer.amount)
                .ok_or(TokenError::Overflow(transfer.to))?;
            staged.insert(transfer.to, credited);
        }

        for (account, balance) in staged {
            self.balances.insert(account, balance);
        }
        for transfer in &plan.transfers {
            self.events.push(TokenEvent::Transfer {
                from: *from,
                to: transfer.to,
                amount: transfer.amount,
            });
        }
        Ok(())
    }
}

/// Token kept in process memory with a single designated minter.
#[derive(Debug)]
pub struct InMemoryToken {
    state: RwLock<TokenState>,
}

impl InMemoryToken {
    pub fn new(address: Address, minter: Address) -> Self {
        Self::from_state(TokenState {
            address,
            minter,
            total_supply: 0,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    pub fn from_state(state: TokenState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> TokenState {
        self.state.read().clone()
    }

    pub fn total_supply(&self) -> Amount {
        self.state.read().total_supply
    }

    pub fn events(&self) -> Vec<TokenEvent> {
        self.state.read().events.clone()
    }

    pub fn mint(&self, caller: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        let mut state = self.state.write();
        if *caller != state.minter {
            return Err(TokenError::NotMinter);
        }
        let supply = state
            .total_supply
            .checked_add(amount)
            .ok_or(TokenError::Overflow(*to))?;
        let balance = state
            .balance(to)
            .checked_add(amount)
            .ok_or(TokenError::Overflow(*to))?;
        state.total_supply = supply;
        state.balances.insert(*to, balance);
        state.events.push(TokenEvent::Mint { to: *to, amount });
        info!(%to, amount, "minted");
        Ok(())
    }
}

impl TokenAccount for InMemoryToken {
    fn address(&self) -> Address {
        self.state.read().address
    }

    fn balance_of(&self, who: &Address) -> Amount {
        self.state.read().balance(who)
    }

    fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.state.read().allowance(owner, spender)
    }

    fn approve(&self, owner: &Address, spender: &Address, amount: Amount) {
        let mut state = self.state.write();
        state
            .allowances
            .entry(*owner)
            .or_default()
            .insert(*spender, amount);
        state.events.push(TokenEvent::Approval {
            owner: *owner,
            spender: *spender,
            amount,
        });
        debug!(%owner, %spender, amount, "allowance set");
    }

    fn transfer(&self, caller: &Address, to: &Address, amount: Amount) -> Result<(), TokenError> {
        self.transfer_batch(caller, &TransferPlan::new().push(*to, amount))
    }

    fn transfer_from(
        &self,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), TokenError> {
        let mut state = self.state.write();
        let allowed = state.allowance(from, spender);
        if allowed < amount {
            return Err(TokenError::InsufficientAllowance {
                owner: *from,
                spender: *spender,
                allowed,
                required: amount,
            });
        }
        state.apply_plan(from, &TransferPlan::new().push(*to, amount))?;
        state
            .allowances
            .entry(*from)
            .or_default()
            .insert(*spender, allowed - amount);
        Ok(())
    }

    fn transfer_batch(&self, caller: &Address, plan: &TransferPlan) -> Result<(), TokenError> {
        self.state.write().apply_plan(caller, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn funded_token() -> InMemoryToken {
        let token = InMemoryToken::new(addr(0xDA), addr(1));
        token.mint(&addr(1), &addr(1), 100).unwrap();
        token
    }

    #[test]
    fn only_minter_can_mint() {
        let token = funded_token();
        assert_eq!(token.mint(&addr(2), &addr(2), 5), Err(TokenError::NotMinter));
        assert_eq!(token.total_supply(), 100);
        assert_eq!(token.balance_of(&addr(1)), 100);
    }

    #[test]
    fn transfer_moves_funds_and_records_event() {
        let token = funded_token();
        token.transfer(&addr(1), &addr(2), 30).unwrap();
        assert_eq!(token.balance_of(&addr(1)), 70);
        assert_eq!(token.balance_of(&addr(2)), 30);
        assert_eq!(
            token.events().last(),
            Some(&TokenEvent::Transfer {
                from: addr(1),
                to: addr(2),
                amount: 30
            })
        );
    }

    #[test]
    fn transfer_from_requires_allowance_and_consumes_it() {
        let token = funded_token();
        let err = token.transfer_from(&addr(9), &addr(1), &addr(9), 10).unwrap_err();
        assert!(matches!(err, TokenError::InsufficientAllowance { .. }));

        token.approve(&addr(1), &addr(9), 50);
        token.transfer_from(&addr(9), &addr(1), &addr(9), 40).unwrap();
        assert_eq!(token.allowance(&addr(1), &addr(9)), 10);
        assert_eq!(token.balance_of(&addr(9)), 40);
    }

    #[test]
    fn transfer_from_fails_on_balance_even_with_allowance() {
        let token = funded_token();
        token.approve(&addr(1), &addr(9), 1_000);
        let err = token.transfer_from(&addr(9), &addr(1), &addr(9), 200).unwrap_err();
        assert!(matches!(err, TokenError::InsufficientBalance { .. }));
        assert_eq!(token.allowance(&addr(1), &addr(9)), 1_000);
        assert_eq!(token.balance_of(&addr(1)), 100);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let token = funded_token();
        let plan = TransferPlan::new().push(addr(2), 60).push(addr(3), 60);
        assert_eq!(plan.total_amount(), Some(120));
        let err = token.transfer_batch(&addr(1), &plan).unwrap_err();
        assert_eq!(
            err,
            TokenError::InsufficientBalance {
                account: addr(1),
                available: 100,
                required: 120
            }
        );
        assert_eq!(token.balance_of(&addr(1)), 100);
        assert_eq!(token.balance_of(&addr(2)), 0);
        assert_eq!(token.balance_of(&addr(3)), 0);

        let plan = TransferPlan::new().push(addr(2), 60).push(addr(3), 40);
        token.transfer_batch(&addr(1), &plan).unwrap();
        assert_eq!(token.balance_of(&addr(1)), 0);
        assert_eq!(token.balance_of(&addr(2)), 60);
        assert_eq!(token.balance_of(&addr(3)), 40);
    }

    #[test]
    fn self_transfer_keeps_balance() {
        let token = funded_token();
        token.transfer(&addr(1), &addr(1), 100).unwrap();
        assert_eq!(token.balance_of(&addr(1)), 100);
    }
}
