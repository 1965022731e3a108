//! Identity registry collaborator.
//!
//! The ledger only asks whether a school holds a registered identity. The
//! registry itself keys participants by a normalized, fixed-width
//! [`IdentityKey`] and carries an owner-settable query price.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::address::{Address, IdentityKey};
use crate::error::RegistryError;

pub trait IdentityRegistry: Send + Sync {
    /// Address under which this registry is referenced by the ledger.
    fn address(&self) -> Address;

    fn normalize(&self, id: &Address) -> IdentityKey {
        IdentityKey::from_address(id)
    }

    fn is_registered(&self, id: &Address) -> bool;

    fn query_price(&self) -> u64;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryState {
    pub address: Address,
    pub owner: Address,
    pub identities: BTreeMap<IdentityKey, bool>,
    pub query_price: u64,
}

/// Registry kept in process memory. Participants register themselves.
#[derive(Debug)]
pub struct InMemoryIdentityRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryIdentityRegistry {
    pub fn new(address: Address, owner: Address) -> Self {
        Self::from_state(RegistryState {
            address,
            owner,
            identities: BTreeMap::new(),
            query_price: 0,
        })
    }

    pub fn from_state(state: RegistryState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state.read().clone()
    }

    pub fn owner(&self) -> Address {
        self.state.read().owner
    }

    /// Marks `caller` as holding an identity. Registering twice is a no-op.
    pub fn register(&self, caller: &Address) -> IdentityKey {
        let key = self.normalize(caller);
        let mut state = self.state.write();
        if state.identities.insert(key, true) != Some(true) {
            info!(participant = %caller, %key, "identity registered");
        }
        key
    }

    /// Raw lookup by normalized key.
    pub fn identity(&self, key: &IdentityKey) -> bool {
        self.state
            .read()
            .identities
            .get(key)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_query_price(&self, caller: &Address, price: u64) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if *caller != state.owner {
            warn!(%caller, "rejected query price change from non-owner");
            return Err(RegistryError::AccessDenied(*caller));
        }
        state.query_price = price;
        info!(price, "registry query price updated");
        Ok(())
    }
}

impl IdentityRegistry for InMemoryIdentityRegistry {
    fn address(&self) -> Address {
        self.state.read().address
    }

    fn is_registered(&self, id: &Address) -> bool {
        self.identity(&self.normalize(id))
    }

    fn query_price(&self) -> u64 {
        self.state.read().query_price
    }
}
