//! Store seam shared by repositories and backends.

pub mod memory;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;

use crate::account::{Account, Field};
use crate::id::Subtype;
use crate::oplog::SealedEntry;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "accounts";
pub const DEFAULT_POOL_SIZE: u32 = 10;

pub const PASSWORD_ACCOUNT_TABLE: &str = "auth_password_account";
pub const OIDC_ACCOUNT_TABLE: &str = "auth_oidc_account";

/// Table holding accounts of `subtype`.
pub fn table(subtype: Subtype) -> &'static str {
    match subtype {
        Subtype::Password => PASSWORD_ACCOUNT_TABLE,
        Subtype::Oidc => OIDC_ACCOUNT_TABLE,
    }
}

/// Primary key constraint name of `subtype` table.
pub fn pkey_constraint(subtype: Subtype) -> String {
    format!("{}_pkey", table(subtype))
}

/// Name uniqueness constraint of `subtype` table.
pub fn name_constraint(subtype: Subtype) -> String {
    format!("{}_name_uq", table(subtype))
}

/// Natural key constraint of `subtype` table.
pub fn natural_key_constraint(subtype: Subtype) -> String {
    match subtype {
        Subtype::Password => format!("{PASSWORD_ACCOUNT_TABLE}_login_name_uq"),
        Subtype::Oidc => format!("{OIDC_ACCOUNT_TABLE}_subject_uq"),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint {constraint:?} violated")]
    Unique { constraint: String },
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("transaction already closed")]
    Closed,
    #[error("corrupted row: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Failed(String),
}

impl StoreError {
    /// Serialization failures and deadlocks resolve on replay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.is_unique_violation() {
                return Self::Unique {
                    constraint: db.constraint().unwrap_or_default().to_owned(),
                };
            }
            if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
                return Self::Conflict(db.message().to_owned());
            }
        }

        Self::Database(err)
    }
}

/// Conditional update of one account.
///
/// Only the row whose `public_id` and `version` both match is written.
#[derive(Debug, Clone)]
pub struct UpdateRow {
    pub subtype: Subtype,
    pub public_id: String,
    pub expected_version: u32,
    pub set: Vec<(Field, String)>,
    pub null: Vec<Field>,
}

/// Read access and transaction entry point.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn Writer>, StoreError>;

    async fn lookup(
        &self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Accounts of `auth_method_id`, ordered by public id.
    async fn search(
        &self,
        subtype: Subtype,
        auth_method_id: &str,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError>;
}

/// Writes inside one open transaction.
///
/// Dropping a writer without committing rolls the transaction back.
#[async_trait]
pub trait Writer: Send {
    /// Insert `account`, returning the stored row.
    async fn create(&mut self, account: &Account) -> Result<Account, StoreError>;

    /// Every row affected by `row`, after the write.
    async fn update(&mut self, row: &UpdateRow) -> Result<Vec<Account>, StoreError>;

    /// Every row removed.
    async fn delete(
        &mut self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Vec<Account>, StoreError>;

    async fn write_oplog(&mut self, entry: &SealedEntry) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
