use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::Account;
use crate::settlement::{run_unit, DEFAULT_MAX_RETRIES};
use crate::store::{LedgerStore, StoreError};

/// Opens and looks up cash accounts.
pub struct AccountRegistry {
    store: Arc<dyn LedgerStore>,
    starting_balance: Decimal,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn LedgerStore>, starting_balance: Decimal) -> Self {
        Self {
            store,
            starting_balance,
        }
    }

    /// Open a new account funded with the starting balance.
    pub fn register(&self) -> Result<Account, LedgerError> {
        let account = run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            let account = Account::open(self.starting_balance, Utc::now());
            tx.insert_account(&account).map_err(|e| match e {
                // A v4 collision: draw again on the next attempt.
                StoreError::DuplicateAccount(id) => {
                    LedgerError::ConcurrencyConflict(id.to_string())
                }
                other => other.into(),
            })?;
            Ok(account)
        })?;
        tracing::info!("Registered account {} with {}", account.id, account.balance);
        Ok(account)
    }

    pub fn get(&self, id: Uuid) -> Result<Account, LedgerError> {
        run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            tx.find_account(id)?.ok_or(LedgerError::AccountNotFound(id))
        })
    }
}
