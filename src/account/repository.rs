//! Account persistence, one repository per subtype.
//!
//! Every mutation runs through the transactional executor and writes its
//! audit entry in the same transaction. The scope wrapper is fetched before
//! the transaction opens.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Account, AccountKind, Field, OidcAccount, PasswordAccount};
use crate::auth_method::AuthMethodResolver;
use crate::database::retry::{RetryPolicy, TxExecutor, Work};
use crate::database::{Store, UpdateRow, Writer};
use crate::error::{Result, ServerError, StoreContext, UniqueAttribute};
use crate::id::{self, Subtype};
use crate::kms::{KeyPurpose, WrapperProvider, Wrapper};
use crate::oplog::{self, OpType};

/// Upper bound on listed accounts when the caller gives none.
pub const DEFAULT_LIMIT: usize = 10_000;

/// Attempts at drawing a free random password account id.
const MAX_ID_ATTEMPTS: usize = 3;

pub struct Repository<K> {
    store: Arc<dyn Store>,
    kms: Arc<dyn WrapperProvider>,
    auth_methods: Arc<dyn AuthMethodResolver>,
    executor: TxExecutor,
    default_limit: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Repository<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kms: Arc::clone(&self.kms),
            auth_methods: Arc::clone(&self.auth_methods),
            executor: self.executor.clone(),
            default_limit: self.default_limit,
            _kind: PhantomData,
        }
    }
}

impl<K: AccountKind> Repository<K> {
    /// Create a new [`Repository`].
    pub fn new(
        store: Arc<dyn Store>,
        kms: Arc<dyn WrapperProvider>,
        auth_methods: Arc<dyn AuthMethodResolver>,
    ) -> Self {
        Self {
            executor: TxExecutor::new(Arc::clone(&store), RetryPolicy::default()),
            store,
            kms,
            auth_methods,
            default_limit: DEFAULT_LIMIT,
            _kind: PhantomData,
        }
    }

    /// Default list bound. Zero keeps the current one.
    pub fn with_limit(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.default_limit = limit;
        }
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.executor = TxExecutor::new(Arc::clone(&self.store), policy);
        self
    }

    /// Find an account by public id. A missing account is `Ok(None)`.
    pub async fn lookup_account(&self, public_id: &str) -> Result<Option<K>> {
        const OP: &str = "account.repository.lookup";

        if public_id.is_empty() {
            return Err(ServerError::invalid_public_id(OP, "missing public id"));
        }

        let found = self
            .store
            .lookup(K::SUBTYPE, public_id)
            .await
            .context(OP, public_id)?;
        Ok(found.and_then(K::from_account))
    }

    /// Accounts of an auth method, ordered by public id.
    ///
    /// A positive `limit` overrides the repository default.
    pub async fn list_accounts(
        &self,
        auth_method_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<K>> {
        const OP: &str = "account.repository.list";

        if auth_method_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing auth method id"));
        }

        let limit = limit.filter(|l| *l > 0).unwrap_or(self.default_limit);
        let found = self
            .store
            .search(K::SUBTYPE, auth_method_id, limit)
            .await
            .context(OP, auth_method_id)?;

        Ok(found
            .into_iter()
            .filter_map(K::from_account)
            .take(limit)
            .collect())
    }

    /// Update the masked fields of `account` if its stored version is
    /// `version`.
    ///
    /// A masked field left empty on `account` is cleared. A stale version or
    /// a missing account is `(None, 0)`, not an error.
    pub async fn update_account(
        &self,
        scope_id: &str,
        account: &K,
        version: u32,
        field_mask: &[&str],
    ) -> Result<(Option<K>, usize)> {
        const OP: &str = "account.repository.update";

        let base = account.base();
        if base.public_id.is_empty() {
            return Err(ServerError::invalid_public_id(OP, "missing public id"));
        }
        if version == 0 {
            return Err(ServerError::invalid_parameter(OP, "missing version"));
        }
        if scope_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing scope id"));
        }

        let mut set: Vec<(Field, String)> = Vec::new();
        let mut null: Vec<Field> = Vec::new();
        for path in field_mask {
            let field: Field = path.parse().map_err(|_| {
                ServerError::InvalidFieldMask {
                    op: OP,
                    path: (*path).to_owned(),
                }
            })?;
            if set.iter().any(|(f, _)| *f == field) || null.contains(&field) {
                continue;
            }

            match field.value(base).filter(|v| !v.is_empty()) {
                Some(value) => set.push((field, value.to_owned())),
                None => null.push(field),
            }
        }
        if set.is_empty() && null.is_empty() {
            return Err(ServerError::EmptyFieldMask { op: OP });
        }

        let wrapper = self.wrapper(OP, scope_id).await?;
        let row = UpdateRow {
            subtype: K::SUBTYPE,
            public_id: base.public_id.clone(),
            expected_version: version,
            set,
            null,
        };
        let work = UpdateWork {
            row: &row,
            wrapper: &wrapper,
            scope_id,
        };

        let updated = self
            .executor
            .do_tx(OP, &work)
            .await
            .map_err(|err| not_unique(OP, &base.auth_method_id, err))?;

        let Some(updated) = updated else {
            return Ok((None, 0));
        };

        record(OP, "update", K::SUBTYPE, updated.public_id(), scope_id);
        let updated = K::from_account(updated)
            .ok_or_else(|| ServerError::internal("store returned another account type"))?;
        Ok((Some(updated), 1))
    }

    /// Delete an account, returning the number of removed rows.
    pub async fn delete_account(&self, scope_id: &str, public_id: &str) -> Result<usize> {
        const OP: &str = "account.repository.delete";

        if public_id.is_empty() {
            return Err(ServerError::invalid_public_id(OP, "missing public id"));
        }
        if scope_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing scope id"));
        }

        let wrapper = self.wrapper(OP, scope_id).await?;
        let work = DeleteWork {
            subtype: K::SUBTYPE,
            public_id,
            wrapper: &wrapper,
            scope_id,
        };

        let deleted = self.executor.do_tx(OP, &work).await?;
        if deleted > 0 {
            record(OP, "delete", K::SUBTYPE, public_id, scope_id);
        }
        Ok(deleted)
    }

    async fn wrapper(&self, op: &'static str, scope_id: &str) -> Result<Arc<Wrapper>> {
        self.kms
            .get_wrapper(scope_id, KeyPurpose::Oplog)
            .await
            .map_err(|err| ServerError::Encrypt {
                op,
                source: Box::new(err),
            })
    }

    async fn insert(
        &self,
        op: &'static str,
        scope_id: &str,
        wrapper: &Wrapper,
        mut candidate: K,
    ) -> Result<K> {
        // Empty means unset, so it never takes part in name uniqueness.
        let base = candidate.base_mut();
        base.name = base.name.take().filter(|name| !name.is_empty());
        base.description = base.description.take().filter(|d| !d.is_empty());

        let work = CreateWork {
            account: candidate.into_account(),
            wrapper,
            scope_id,
        };

        let created = self.executor.do_tx(op, &work).await?;
        record(op, "create", K::SUBTYPE, created.public_id(), scope_id);

        K::from_account(created)
            .ok_or_else(|| ServerError::internal("store returned another account type"))
    }
}

impl Repository<OidcAccount> {
    /// Create an OIDC account under its auth method.
    ///
    /// The issuer is taken from the auth method and the public id is derived
    /// from `(auth_method_id, issuer, subject)`, so creating the same subject
    /// twice fails with [`ServerError::NotUnique`].
    pub async fn create_account(
        &self,
        scope_id: &str,
        account: &OidcAccount,
    ) -> Result<OidcAccount> {
        const OP: &str = "account.repository.create";

        let auth_method_id = &account.base.auth_method_id;
        if !account.base.public_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "public id must be empty"));
        }
        if !account.issuer.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "issuer must be empty"));
        }
        if auth_method_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing auth method id"));
        }
        if account.subject.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing subject"));
        }
        if scope_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing scope id"));
        }

        let auth_method = self
            .auth_methods
            .lookup_auth_method(auth_method_id)
            .await
            .context(OP, auth_method_id)?
            .ok_or_else(|| {
                ServerError::invalid_parameter(
                    OP,
                    format!("auth method {auth_method_id} not found"),
                )
            })?;
        if auth_method.subtype() != Some(Subtype::Oidc) {
            return Err(ServerError::invalid_parameter(
                OP,
                format!("{auth_method_id} is not an oidc auth method"),
            ));
        }
        let issuer = auth_method
            .issuer
            .filter(|issuer| !issuer.is_empty())
            .ok_or_else(|| {
                ServerError::invalid_parameter(OP, "auth method has no issuer configured")
            })?;

        let mut candidate = account.clone();
        candidate.issuer = issuer;
        candidate.base.public_id =
            id::new_oidc_account_id(auth_method_id, &candidate.issuer, &candidate.subject)?;

        let wrapper = self.wrapper(OP, scope_id).await?;
        self.insert(OP, scope_id, &wrapper, candidate)
            .await
            .map_err(|err| match not_unique(OP, auth_method_id, err) {
                // The id is derived from the natural key.
                ServerError::NotUnique {
                    op,
                    attribute: UniqueAttribute::PublicId,
                    auth_method_id,
                } => ServerError::NotUnique {
                    op,
                    attribute: UniqueAttribute::Subject,
                    auth_method_id,
                },
                err => err,
            })
    }
}

impl Repository<PasswordAccount> {
    /// Create a password account with a random public id.
    pub async fn create_account(
        &self,
        scope_id: &str,
        account: &PasswordAccount,
    ) -> Result<PasswordAccount> {
        const OP: &str = "account.repository.create";

        let auth_method_id = &account.base.auth_method_id;
        if !account.base.public_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "public id must be empty"));
        }
        if auth_method_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing auth method id"));
        }
        if account.login_name.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing login name"));
        }
        if scope_id.is_empty() {
            return Err(ServerError::invalid_parameter(OP, "missing scope id"));
        }

        let auth_method = self
            .auth_methods
            .lookup_auth_method(auth_method_id)
            .await
            .context(OP, auth_method_id)?
            .ok_or_else(|| {
                ServerError::invalid_parameter(
                    OP,
                    format!("auth method {auth_method_id} not found"),
                )
            })?;
        if auth_method.subtype() != Some(Subtype::Password) {
            return Err(ServerError::invalid_parameter(
                OP,
                format!("{auth_method_id} is not a password auth method"),
            ));
        }

        let wrapper = self.wrapper(OP, scope_id).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut candidate = account.clone();
            candidate.base.public_id = id::new_password_account_id();

            match self.insert(OP, scope_id, &wrapper, candidate).await {
                Err(err)
                    if attempt < MAX_ID_ATTEMPTS
                        && err
                            .unique_constraint()
                            .is_some_and(|c| c.ends_with("_pkey")) =>
                {
                    tracing::warn!(%attempt, "password account id collision, regenerating");
                },
                result => {
                    return result.map_err(|err| not_unique(OP, auth_method_id, err));
                },
            }
        }
    }
}

/// Turn a store unique violation into [`ServerError::NotUnique`].
fn not_unique(op: &'static str, auth_method_id: &str, err: ServerError) -> ServerError {
    match err.unique_constraint().map(UniqueAttribute::from_constraint) {
        Some(attribute) => ServerError::NotUnique {
            op,
            attribute,
            auth_method_id: auth_method_id.to_owned(),
        },
        None => err,
    }
}

fn record(op: &'static str, kind: &'static str, subtype: Subtype, public_id: &str, scope_id: &str) {
    metrics::counter!("accounts_mutations_total", "op" => kind, "subtype" => subtype.as_str())
        .increment(1);
    tracing::info!(%op, %subtype, %public_id, %scope_id, "account {kind}d");
}

struct CreateWork<'a> {
    account: Account,
    wrapper: &'a Wrapper,
    scope_id: &'a str,
}

#[async_trait]
impl Work for CreateWork<'_> {
    type Output = Account;

    async fn run(&self, writer: &mut dyn Writer) -> Result<Account> {
        const OP: &str = "account.repository.create";

        let created = writer
            .create(&self.account)
            .await
            .context(OP, self.account.public_id())?;
        oplog::write(writer, self.wrapper, self.scope_id, OpType::Create, &created, OP)
            .await?;
        Ok(created)
    }
}

struct UpdateWork<'a> {
    row: &'a UpdateRow,
    wrapper: &'a Wrapper,
    scope_id: &'a str,
}

#[async_trait]
impl Work for UpdateWork<'_> {
    type Output = Option<Account>;

    async fn run(&self, writer: &mut dyn Writer) -> Result<Option<Account>> {
        const OP: &str = "account.repository.update";

        let mut rows = writer
            .update(self.row)
            .await
            .context(OP, &self.row.public_id)?;

        match rows.len() {
            0 => Ok(None),
            1 => {
                let updated = rows.remove(0);
                oplog::write(writer, self.wrapper, self.scope_id, OpType::Update, &updated, OP)
                    .await?;
                Ok(Some(updated))
            },
            n => Err(ServerError::MultipleRecords {
                op: OP,
                msg: format!("{n} rows would have been updated"),
            }),
        }
    }
}

struct DeleteWork<'a> {
    subtype: Subtype,
    public_id: &'a str,
    wrapper: &'a Wrapper,
    scope_id: &'a str,
}

#[async_trait]
impl Work for DeleteWork<'_> {
    type Output = usize;

    async fn run(&self, writer: &mut dyn Writer) -> Result<usize> {
        const OP: &str = "account.repository.delete";

        let rows = writer
            .delete(self.subtype, self.public_id)
            .await
            .context(OP, self.public_id)?;

        match rows.as_slice() {
            [] => Ok(0),
            [deleted] => {
                oplog::write(writer, self.wrapper, self.scope_id, OpType::Delete, deleted, OP)
                    .await?;
                Ok(1)
            },
            rows => Err(ServerError::MultipleRecords {
                op: OP,
                msg: format!("{} rows would have been deleted", rows.len()),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::auth_method::AuthMethod;
    use crate::database::StoreError;
    use crate::oplog::SealedEntry;
    use crate::crypto::{KEY_LENGTH, SymmetricKey};
    use crate::database::memory::MemoryStore;
    use crate::kms::{KmsError, LocalKms};

    pub const SCOPE: &str = "o_1234567890";
    pub const OIDC_AM: &str = "amoidc_1";
    pub const PASSWORD_AM: &str = "ampw_1";
    pub const ISSUER: &str = "https://idp.example.com";

    pub fn local_kms() -> Arc<LocalKms> {
        Arc::new(LocalKms::new(
            SymmetricKey::from_bytes(&[5u8; KEY_LENGTH]).unwrap(),
        ))
    }

    /// Memory store seeded with one auth method per subtype.
    pub async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_auth_method(AuthMethod {
                public_id: OIDC_AM.into(),
                scope_id: SCOPE.into(),
                name: None,
                issuer: Some(ISSUER.into()),
            })
            .await;
        store
            .insert_auth_method(AuthMethod {
                public_id: PASSWORD_AM.into(),
                scope_id: SCOPE.into(),
                name: None,
                issuer: None,
            })
            .await;
        store
    }

    pub fn repository<K: AccountKind>(store: &MemoryStore) -> Repository<K> {
        Repository::new(Arc::new(store.clone()), local_kms(), Arc::new(store.clone()))
            .with_retry(RetryPolicy {
                max_retries: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
    }

    struct UnavailableKms;

    #[async_trait]
    impl WrapperProvider for UnavailableKms {
        async fn get_wrapper(
            &self,
            _scope_id: &str,
            _purpose: KeyPurpose,
        ) -> std::result::Result<Arc<Wrapper>, KmsError> {
            Err(KmsError::Unavailable("connection refused".into()))
        }
    }

    /// Store whose writes always affect two rows.
    #[derive(Clone, Default)]
    struct DuplicatingStore {
        commits: Arc<AtomicUsize>,
        oplog_writes: Arc<AtomicUsize>,
    }

    struct DuplicatingWriter(DuplicatingStore);

    fn two_rows(public_id: &str) -> Vec<Account> {
        ["0000000001", "0000000002"]
            .into_iter()
            .map(|suffix| {
                let mut account = OidcAccount::new(OIDC_AM, suffix);
                account.base.public_id = format!("{public_id}{suffix}");
                account.base.version = 2;
                account.into_account()
            })
            .collect()
    }

    #[async_trait]
    impl Store for DuplicatingStore {
        async fn begin(&self) -> std::result::Result<Box<dyn Writer>, StoreError> {
            Ok(Box::new(DuplicatingWriter(self.clone())))
        }

        async fn lookup(
            &self,
            _subtype: Subtype,
            _public_id: &str,
        ) -> std::result::Result<Option<Account>, StoreError> {
            Ok(None)
        }

        async fn search(
            &self,
            _subtype: Subtype,
            _auth_method_id: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<Account>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Writer for DuplicatingWriter {
        async fn create(&mut self, account: &Account) -> std::result::Result<Account, StoreError> {
            Ok(account.clone())
        }

        async fn update(
            &mut self,
            row: &UpdateRow,
        ) -> std::result::Result<Vec<Account>, StoreError> {
            Ok(two_rows(&row.public_id))
        }

        async fn delete(
            &mut self,
            _subtype: Subtype,
            public_id: &str,
        ) -> std::result::Result<Vec<Account>, StoreError> {
            Ok(two_rows(public_id))
        }

        async fn write_oplog(
            &mut self,
            _entry: &SealedEntry,
        ) -> std::result::Result<(), StoreError> {
            self.0.oplog_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn commit(&mut self) -> std::result::Result<(), StoreError> {
            self.0.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&mut self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_multiple_rows_are_rejected() {
        let auth_methods = seeded_store().await;
        let store = DuplicatingStore::default();
        let repo = Repository::<OidcAccount>::new(
            Arc::new(store.clone()),
            local_kms(),
            Arc::new(auth_methods),
        );

        let mut account = OidcAccount::new(OIDC_AM, "alice");
        account.base.public_id = "acctoidc_".into();
        account.base.name = Some("Alice".into());

        let err = repo.update_account(SCOPE, &account, 1, &["name"]).await.unwrap_err();
        assert!(matches!(err, ServerError::MultipleRecords { .. }), "{err:?}");

        let err = repo.delete_account(SCOPE, "acctoidc_").await.unwrap_err();
        assert!(matches!(err, ServerError::MultipleRecords { .. }), "{err:?}");

        assert_eq!(store.commits.load(Ordering::SeqCst), 0);
        assert_eq!(store.oplog_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oidc_scenario() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);
        let candidate = OidcAccount::new(OIDC_AM, "alice");

        let created = repo.create_account(SCOPE, &candidate).await.unwrap();
        assert_eq!(
            created.base.public_id,
            id::new_oidc_account_id(OIDC_AM, ISSUER, "alice").unwrap()
        );
        assert_eq!(created.issuer, ISSUER);
        assert_eq!(created.base.version, 1);
        // The caller's candidate is left untouched.
        assert!(candidate.base.public_id.is_empty());
        assert!(candidate.issuer.is_empty());

        let err = repo.create_account(SCOPE, &candidate).await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::NotUnique { attribute: UniqueAttribute::Subject, .. }
        ));

        let mut patch = created.clone();
        patch.base.name = Some("Alice".into());
        let (updated, rows) = repo.update_account(SCOPE, &patch, 1, &["Name"]).await.unwrap();
        assert_eq!(rows, 1);
        let updated = updated.unwrap();
        assert_eq!(updated.base.version, 2);
        assert_eq!(updated.base.name.as_deref(), Some("Alice"));

        let deleted = repo.delete_account(SCOPE, &created.base.public_id).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.lookup_account(&created.base.public_id).await.unwrap().is_none());

        let ops: Vec<_> = store.oplog().await.iter().map(|e| e.op_type).collect();
        assert_eq!(ops, [OpType::Create, OpType::Update, OpType::Delete]);
    }

    #[tokio::test]
    async fn test_oidc_create_preconditions() {
        let store = seeded_store().await;
        store
            .insert_auth_method(AuthMethod {
                public_id: "amoidc_unconfigured".into(),
                scope_id: SCOPE.into(),
                name: None,
                issuer: None,
            })
            .await;
        let repo = repository::<OidcAccount>(&store);

        let mut spoofed = OidcAccount::new(OIDC_AM, "alice");
        spoofed.issuer = "https://evil.example.com".into();
        let mut with_id = OidcAccount::new(OIDC_AM, "alice");
        with_id.base.public_id = "acctoidc_1234567890".into();

        for (scope, candidate) in [
            (SCOPE, spoofed),
            (SCOPE, with_id),
            (SCOPE, OidcAccount::new(OIDC_AM, "")),
            (SCOPE, OidcAccount::new("", "alice")),
            ("", OidcAccount::new(OIDC_AM, "alice")),
            (SCOPE, OidcAccount::new("amoidc_missing", "alice")),
            (SCOPE, OidcAccount::new("amoidc_unconfigured", "alice")),
            (SCOPE, OidcAccount::new(PASSWORD_AM, "alice")),
        ] {
            let err = repo.create_account(scope, &candidate).await.unwrap_err();
            assert!(matches!(err, ServerError::InvalidParameter { .. }), "{err:?}");
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_not_unique() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);

        let mut first = OidcAccount::new(OIDC_AM, "alice");
        first.base.name = Some("shared".into());
        repo.create_account(SCOPE, &first).await.unwrap();

        let mut second = OidcAccount::new(OIDC_AM, "bob");
        second.base.name = Some("shared".into());
        let err = repo.create_account(SCOPE, &second).await.unwrap_err();

        assert!(matches!(
            err,
            ServerError::NotUnique { attribute: UniqueAttribute::Name, ref auth_method_id, .. }
                if auth_method_id == OIDC_AM
        ));
    }

    #[tokio::test]
    async fn test_empty_name_is_unset_on_create() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);

        for subject in ["alice", "bob"] {
            let mut candidate = OidcAccount::new(OIDC_AM, subject);
            candidate.base.name = Some(String::new());
            candidate.base.description = Some(String::new());

            let created = repo.create_account(SCOPE, &candidate).await.unwrap();
            assert_eq!(created.base.name, None);
            assert_eq!(created.base.description, None);
        }
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_password_create_preconditions() {
        let store = seeded_store().await;
        let repo = repository::<PasswordAccount>(&store);

        let mut with_id = PasswordAccount::new(PASSWORD_AM, "alice");
        with_id.base.public_id = "apw_1234567890".into();

        for (scope, candidate) in [
            (SCOPE, with_id),
            (SCOPE, PasswordAccount::new("", "alice")),
            (SCOPE, PasswordAccount::new(PASSWORD_AM, "")),
            ("", PasswordAccount::new(PASSWORD_AM, "alice")),
            (SCOPE, PasswordAccount::new("ampw_doesnotexist", "alice")),
            (SCOPE, PasswordAccount::new(OIDC_AM, "alice")),
        ] {
            let err = repo.create_account(scope, &candidate).await.unwrap_err();
            assert!(matches!(err, ServerError::InvalidParameter { .. }), "{err:?}");
        }
        assert!(store.is_empty().await);
        assert!(store.oplog().await.is_empty());
    }

    #[tokio::test]
    async fn test_password_create() {
        let store = seeded_store().await;
        let repo = repository::<PasswordAccount>(&store);

        let created = repo
            .create_account(SCOPE, &PasswordAccount::new(PASSWORD_AM, "alice"))
            .await
            .unwrap();
        assert!(id::is_account_id(&created.base.public_id));
        assert_eq!(Subtype::from_id(&created.base.public_id), Some(Subtype::Password));
        assert_eq!(created.base.version, 1);

        let err = repo
            .create_account(SCOPE, &PasswordAccount::new(PASSWORD_AM, "alice"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::NotUnique { attribute: UniqueAttribute::LoginName, .. }
        ));

        let err = repo
            .create_account(SCOPE, &PasswordAccount::new(PASSWORD_AM, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn test_update_duplicate_name_is_not_unique() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);

        let mut first = OidcAccount::new(OIDC_AM, "alice");
        first.base.name = Some("shared".into());
        repo.create_account(SCOPE, &first).await.unwrap();
        let second = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "bob"))
            .await
            .unwrap();

        let mut patch = second.clone();
        patch.base.name = Some("shared".into());
        let err = repo.update_account(SCOPE, &patch, 1, &["name"]).await.unwrap_err();

        assert!(matches!(
            err,
            ServerError::NotUnique { attribute: UniqueAttribute::Name, ref auth_method_id, .. }
                if auth_method_id == OIDC_AM
        ));
        let stored = repo.lookup_account(&second.base.public_id).await.unwrap().unwrap();
        assert_eq!(stored, second);
        assert_eq!(store.oplog().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_with_same_version() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);
        let created = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "alice"))
            .await
            .unwrap();

        let mut first = created.clone();
        first.base.name = Some("first".into());
        let mut second = created.clone();
        second.base.name = Some("second".into());

        let (a, b) = tokio::join!(
            repo.update_account(SCOPE, &first, 1, &["name"]),
            repo.update_account(SCOPE, &second, 1, &["name"]),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut rows = [a.1, b.1];
        rows.sort_unstable();
        assert_eq!(rows, [0, 1]);
        assert!(a.0.is_none() || b.0.is_none());

        let stored = repo.lookup_account(&created.base.public_id).await.unwrap().unwrap();
        assert_eq!(stored.base.version, 2);
        // One create and one update only.
        assert_eq!(store.oplog().await.len(), 2);
    }

    #[tokio::test]
    async fn test_null_out_via_mask() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);

        let mut candidate = OidcAccount::new(OIDC_AM, "alice");
        candidate.base.name = Some("Alice".into());
        candidate.base.description = Some("first account".into());
        let created = repo.create_account(SCOPE, &candidate).await.unwrap();

        // Description outside the mask is left untouched whatever its value.
        let mut patch = created.clone();
        patch.base.name = Some("Alicia".into());
        patch.base.description = Some(String::new());
        let (updated, _) = repo.update_account(SCOPE, &patch, 1, &["name"]).await.unwrap();
        let updated = updated.unwrap();
        assert_eq!(updated.base.name.as_deref(), Some("Alicia"));
        assert_eq!(updated.base.description.as_deref(), Some("first account"));

        let (updated, rows) = repo
            .update_account(SCOPE, &patch, 2, &["Description"])
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let updated = updated.unwrap();
        assert_eq!(updated.base.description, None);
        assert_eq!(updated.base.name.as_deref(), Some("Alicia"));
        assert_eq!(updated.base.version, 3);
    }

    #[tokio::test]
    async fn test_update_mask_errors() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);
        let created = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "alice"))
            .await
            .unwrap();

        let err = repo
            .update_account(SCOPE, &created, 1, &["name", "subject"])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidFieldMask { ref path, .. } if path == "subject"));

        let err = repo.update_account(SCOPE, &created, 1, &[]).await.unwrap_err();
        assert!(matches!(err, ServerError::EmptyFieldMask { .. }));

        let (updated, rows) = repo
            .update_account(SCOPE, &created, 7, &["name"])
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(rows, 0);

        let mut missing = created.clone();
        missing.base.public_id = "acctoidc_0000000000".into();
        let (_, rows) = repo.update_account(SCOPE, &missing, 1, &["name"]).await.unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_audit_atomicity() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);
        let created = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "alice"))
            .await
            .unwrap();

        store.fail_oplog_writes(true);

        assert!(repo.create_account(SCOPE, &OidcAccount::new(OIDC_AM, "bob")).await.is_err());

        let mut patch = created.clone();
        patch.base.name = Some("Alice".into());
        assert!(repo.update_account(SCOPE, &patch, 1, &["name"]).await.is_err());
        assert!(repo.delete_account(SCOPE, &created.base.public_id).await.is_err());

        store.fail_oplog_writes(false);

        assert_eq!(store.len().await, 1);
        let stored = repo.lookup_account(&created.base.public_id).await.unwrap().unwrap();
        assert_eq!(stored, created);
        assert_eq!(store.oplog().await.len(), 1);
    }

    #[tokio::test]
    async fn test_wrapper_failure_aborts_before_write() {
        let store = seeded_store().await;
        let repo = Repository::<OidcAccount>::new(
            Arc::new(store.clone()),
            Arc::new(UnavailableKms),
            Arc::new(store.clone()),
        );

        let err = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Encrypt { .. }));
        assert!(store.is_empty().await);
        assert!(store.oplog().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_bound() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store).with_limit(10);

        for i in 0..20 {
            repo.create_account(SCOPE, &OidcAccount::new(OIDC_AM, &format!("user-{i}")))
                .await
                .unwrap();
        }

        assert_eq!(repo.list_accounts(OIDC_AM, Some(5)).await.unwrap().len(), 5);
        assert_eq!(repo.list_accounts(OIDC_AM, None).await.unwrap().len(), 10);
        assert_eq!(repo.list_accounts(OIDC_AM, Some(0)).await.unwrap().len(), 10);
        assert_eq!(repo.list_accounts(OIDC_AM, Some(50)).await.unwrap().len(), 20);

        let listed = repo.list_accounts(OIDC_AM, Some(50)).await.unwrap();
        assert!(listed.windows(2).all(|w| w[0].base.public_id < w[1].base.public_id));
        assert!(repository::<PasswordAccount>(&store)
            .list_accounts(OIDC_AM, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_are_absorbed() {
        let store = seeded_store().await;
        let repo = repository::<OidcAccount>(&store);
        store.fail_next_commits(2);

        let created = repo
            .create_account(SCOPE, &OidcAccount::new(OIDC_AM, "alice"))
            .await
            .unwrap();

        assert_eq!(created.base.version, 1);
        assert_eq!(store.oplog().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_and_delete_missing() {
        let store = seeded_store().await;
        let repo = repository::<PasswordAccount>(&store);

        assert!(repo.lookup_account("apw_0000000000").await.unwrap().is_none());
        assert!(matches!(
            repo.lookup_account("").await,
            Err(ServerError::InvalidPublicId { .. })
        ));
        assert_eq!(repo.delete_account(SCOPE, "apw_0000000000").await.unwrap(), 0);
        assert!(store.oplog().await.is_empty());
    }
}
