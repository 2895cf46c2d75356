//! Banking capability

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A bank account as seen by one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Identifier, unique within the backend
    pub id: String,
    /// Display label
    pub label: String,
    /// Balance in minor currency units (cents)
    pub balance: i64,
    /// ISO 4217 code
    pub currency: String,
}

/// A booked operation on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Identifier, unique within the account
    pub id: String,
    /// Booking date
    pub date: NaiveDate,
    /// Bank-provided label
    pub label: String,
    /// Signed amount in minor currency units
    pub amount: i64,
}

/// Backends that can list bank accounts
#[async_trait]
pub trait CapBank: Send {
    /// Lazily list every account
    fn iter_accounts(&mut self) -> BoxStream<'_, anyhow::Result<Account>>;

    /// Fetch one account by identifier
    ///
    /// # Errors
    ///
    /// Returns error if the site could not be queried
    async fn get_account(&mut self, id: &str) -> anyhow::Result<Option<Account>>;

    /// Lazily list the history of an account, most recent first
    fn iter_history<'a>(
        &'a mut self,
        account_id: &'a str,
    ) -> BoxStream<'a, anyhow::Result<Transaction>>;
}
