//! In-process store.
//!
//! Enforces the same primary key and uniqueness constraints as the
//! PostgreSQL schema. Transactions are serialized: a writer holds the state
//! lock and works on a copy that replaces the shared state on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    Store, StoreError, UpdateRow, Writer, name_constraint,
    natural_key_constraint, pkey_constraint,
};
use crate::account::Account;
use crate::auth_method::{AuthMethod, AuthMethodResolver};
use crate::id::Subtype;
use crate::oplog::SealedEntry;

#[derive(Debug, Default, Clone)]
struct State {
    accounts: BTreeMap<String, Account>,
    auth_methods: HashMap<String, AuthMethod>,
    oplog: Vec<SealedEntry>,
}

impl State {
    fn check_unique(&self, candidate: &Account) -> Result<(), StoreError> {
        let subtype = candidate.subtype();
        let base = candidate.base();

        for existing in self.accounts.values().filter(|existing| {
            existing.subtype() == subtype
                && existing.public_id() != base.public_id
                && existing.auth_method_id() == base.auth_method_id
        }) {
            if base.name.is_some() && existing.base().name == base.name {
                return Err(StoreError::Unique {
                    constraint: name_constraint(subtype),
                });
            }

            let same_natural_key = match (existing, candidate) {
                (Account::Password(a), Account::Password(b)) => {
                    a.login_name == b.login_name
                },
                (Account::Oidc(a), Account::Oidc(b)) => {
                    a.issuer == b.issuer && a.subject == b.subject
                },
                _ => false,
            };
            if same_natural_key {
                return Err(StoreError::Unique {
                    constraint: natural_key_constraint(subtype),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct Faults {
    commit_conflicts: AtomicUsize,
    oplog_failures: AtomicBool,
}

/// Store kept in memory, shared between clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parent auth method.
    pub async fn insert_auth_method(&self, auth_method: AuthMethod) {
        self.state
            .lock()
            .await
            .auth_methods
            .insert(auth_method.public_id.clone(), auth_method);
    }

    /// Committed audit entries, in write order.
    pub async fn oplog(&self) -> Vec<SealedEntry> {
        self.state.lock().await.oplog.clone()
    }

    /// Number of committed accounts.
    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Report a serialization conflict on the next `count` commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.faults.commit_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make every audit write fail until reset.
    pub fn fail_oplog_writes(&self, fail: bool) {
        self.faults.oplog_failures.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Writer>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();

        Ok(Box::new(MemoryWriter {
            guard: Some(guard),
            working,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn lookup(
        &self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .get(public_id)
            .filter(|account| account.subtype() == subtype)
            .cloned())
    }

    async fn search(
        &self,
        subtype: Subtype,
        auth_method_id: &str,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .filter(|account| {
                account.subtype() == subtype
                    && account.auth_method_id() == auth_method_id
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuthMethodResolver for MemoryStore {
    async fn lookup_auth_method(
        &self,
        public_id: &str,
    ) -> Result<Option<AuthMethod>, StoreError> {
        Ok(self.state.lock().await.auth_methods.get(public_id).cloned())
    }
}

struct MemoryWriter {
    guard: Option<OwnedMutexGuard<State>>,
    working: State,
    faults: Arc<Faults>,
}

impl MemoryWriter {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn create(&mut self, account: &Account) -> Result<Account, StoreError> {
        self.ensure_open()?;

        if self.working.accounts.contains_key(account.public_id()) {
            return Err(StoreError::Unique {
                constraint: pkey_constraint(account.subtype()),
            });
        }
        self.working.check_unique(account)?;

        let now = Utc::now();
        let mut stored = account.clone();
        let base = stored.base_mut();
        base.version = 1;
        base.create_time = Some(now);
        base.update_time = Some(now);

        self.working
            .accounts
            .insert(stored.public_id().to_owned(), stored.clone());
        Ok(stored)
    }

    async fn update(&mut self, row: &UpdateRow) -> Result<Vec<Account>, StoreError> {
        self.ensure_open()?;

        let Some(mut updated) = self
            .working
            .accounts
            .get(&row.public_id)
            .filter(|account| {
                account.subtype() == row.subtype
                    && account.version() == row.expected_version
            })
            .cloned()
        else {
            return Ok(Vec::new());
        };

        let base = updated.base_mut();
        for (field, value) in &row.set {
            field.apply(base, Some(value.clone()));
        }
        for field in &row.null {
            field.apply(base, None);
        }
        base.version += 1;
        base.update_time = Some(Utc::now());

        self.working.check_unique(&updated)?;
        self.working
            .accounts
            .insert(row.public_id.clone(), updated.clone());
        Ok(vec![updated])
    }

    async fn delete(
        &mut self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Vec<Account>, StoreError> {
        self.ensure_open()?;

        let matches = self
            .working
            .accounts
            .get(public_id)
            .is_some_and(|account| account.subtype() == subtype);
        if !matches {
            return Ok(Vec::new());
        }

        Ok(self.working.accounts.remove(public_id).into_iter().collect())
    }

    async fn write_oplog(&mut self, entry: &SealedEntry) -> Result<(), StoreError> {
        self.ensure_open()?;

        if self.faults.oplog_failures.load(Ordering::SeqCst) {
            return Err(StoreError::Failed("oplog write rejected".into()));
        }
        self.working.oplog.push(entry.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::Closed)?;

        let conflict = self
            .faults
            .commit_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(StoreError::Conflict(
                "could not serialize access due to concurrent update".into(),
            ));
        }

        *guard = std::mem::take(&mut self.working);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard = None;
        self.working = State::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountKind, Field, OidcAccount, PasswordAccount};

    fn password(public_id: &str, login_name: &str) -> Account {
        let mut account = PasswordAccount::new("ampw_1", login_name);
        account.base.public_id = public_id.to_owned();
        account.into_account()
    }

    async fn seed(store: &MemoryStore, accounts: &[Account]) {
        let mut writer = store.begin().await.unwrap();
        for account in accounts {
            writer.create(account).await.unwrap();
        }
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();

        {
            let mut writer = store.begin().await.unwrap();
            writer.create(&password("apw_1", "alice")).await.unwrap();
        }

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_constraints() {
        let store = MemoryStore::new();
        seed(&store, &[password("apw_1", "alice")]).await;

        let mut writer = store.begin().await.unwrap();
        let err = writer.create(&password("apw_2", "alice")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unique { constraint } if constraint == "auth_password_account_login_name_uq"
        ));

        // Same login name under another auth method is fine.
        let mut other = PasswordAccount::new("ampw_2", "alice");
        other.base.public_id = "apw_3".into();
        writer.create(&other.into_account()).await.unwrap();

        let mut oidc = OidcAccount::new("amoidc_1", "alice");
        oidc.base.public_id = "apw_1".into();
        let err = writer.create(&oidc.into_account()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unique { constraint } if constraint == "auth_oidc_account_pkey"
        ));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let store = MemoryStore::new();
        seed(&store, &[password("apw_1", "alice")]).await;

        let row = UpdateRow {
            subtype: Subtype::Password,
            public_id: "apw_1".into(),
            expected_version: 2,
            set: vec![(Field::Name, "Alice".into())],
            null: Vec::new(),
        };
        let mut writer = store.begin().await.unwrap();
        assert!(writer.update(&row).await.unwrap().is_empty());

        let row = UpdateRow {
            expected_version: 1,
            ..row
        };
        let updated = writer.update(&row).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].version(), 2);
        assert_eq!(updated[0].base().name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_search_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        seed(
            &store,
            &[
                password("apw_3", "carol"),
                password("apw_1", "alice"),
                password("apw_2", "bob"),
            ],
        )
        .await;

        let found = store.search(Subtype::Password, "ampw_1", 2).await.unwrap();
        let ids: Vec<_> = found.iter().map(Account::public_id).collect();
        assert_eq!(ids, ["apw_1", "apw_2"]);
        assert!(store.search(Subtype::Oidc, "ampw_1", 10).await.unwrap().is_empty());
    }
}
