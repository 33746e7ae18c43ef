//! The account ledger.
//!
//! An account records the funds and inventory a user has on deposit with the
//! server. Accounts are created on first lookup of an unseen name and live
//! until the ledger itself is dropped; looking up the same name always
//! returns the same account.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use thiserror::Error;

/// The maximum number of accounts supported by the server.
pub const MAX_ACCOUNTS: usize = 64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account table is full")]
    Full,
}

/// An error from an account operation that would violate the account's
/// non-negativity invariant. The account is left unchanged.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AccountError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("insufficient inventory")]
    InsufficientInventory,
}

/// A consistent snapshot of an account at a single point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountStatus {
    pub balance: u32,
    pub inventory: u32,
}

#[derive(Debug, Default)]
struct AccountState {
    balance: u32,
    inventory: u32,
}

/// A single user's account. All operations are serialized by the account's
/// own lock; balance and inventory never go negative.
#[derive(Debug)]
pub struct Account {
    name: String,
    state: Mutex<AccountState>,
}

impl Account {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(AccountState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Credit funds. Saturates at `u32::MAX`.
    pub fn increase_balance(&self, amount: u32) {
        let mut state = self.state.lock();
        state.balance = state.balance.saturating_add(amount);
    }

    /// Debit funds. Fails without change if the balance is smaller than
    /// `amount`.
    pub fn decrease_balance(&self, amount: u32) -> Result<(), AccountError> {
        let mut state = self.state.lock();
        state.balance = state
            .balance
            .checked_sub(amount)
            .ok_or(AccountError::InsufficientFunds)?;
        Ok(())
    }

    /// Credit inventory units. Saturates at `u32::MAX`.
    pub fn increase_inventory(&self, quantity: u32) {
        let mut state = self.state.lock();
        state.inventory = state.inventory.saturating_add(quantity);
    }

    /// Debit inventory units. Fails without change if the inventory is
    /// smaller than `quantity`.
    pub fn decrease_inventory(&self, quantity: u32) -> Result<(), AccountError> {
        let mut state = self.state.lock();
        state.inventory = state
            .inventory
            .checked_sub(quantity)
            .ok_or(AccountError::InsufficientInventory)?;
        Ok(())
    }

    /// Read balance and inventory atomically.
    pub fn status(&self) -> AccountStatus {
        let state = self.state.lock();
        AccountStatus {
            balance: state.balance,
            inventory: state.inventory,
        }
    }
}

/// The bounded, name-indexed table of all accounts.
#[derive(Debug, Default)]
pub struct Ledger {
    accounts: Mutex<AHashMap<String, Arc<Account>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the account for `name`, creating it with zero balance and
    /// inventory on first use. Fails only when the table is full.
    pub fn lookup(&self, name: &str) -> Result<Arc<Account>, LedgerError> {
        let mut accounts = self.accounts.lock();
        if let Some(account) = accounts.get(name) {
            return Ok(Arc::clone(account));
        }
        if accounts.len() >= MAX_ACCOUNTS {
            return Err(LedgerError::Full);
        }
        let account = Arc::new(Account::new(name.to_owned()));
        accounts.insert(name.to_owned(), Arc::clone(&account));
        tracing::debug!(name, "account created");
        Ok(account)
    }

    /// Number of live accounts.
    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
