//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, QueryBuilder, Transaction};

use super::{Store, StoreError, UpdateRow, Writer, table};
use crate::account::{
    Account, AccountBase, AccountKind, OidcAccount, PasswordAccount,
};
use crate::auth_method::{AuthMethod, AuthMethodResolver};
use crate::id::Subtype;
use crate::oplog::SealedEntry;

#[derive(FromRow)]
struct PasswordRow {
    public_id: String,
    auth_method_id: String,
    name: Option<String>,
    description: Option<String>,
    login_name: String,
    version: i32,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

#[derive(FromRow)]
struct OidcRow {
    public_id: String,
    auth_method_id: String,
    name: Option<String>,
    description: Option<String>,
    issuer: String,
    subject: String,
    full_name: Option<String>,
    email: Option<String>,
    version: i32,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

trait AccountRow: for<'r> FromRow<'r, PgRow> + Send + Unpin {
    fn into_account(self) -> Result<Account, StoreError>;
}

fn base(
    public_id: String,
    auth_method_id: String,
    name: Option<String>,
    description: Option<String>,
    version: i32,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
) -> Result<AccountBase, StoreError> {
    let version = u32::try_from(version).map_err(|_| {
        StoreError::Corrupted(format!("{public_id} has version {version}"))
    })?;

    Ok(AccountBase {
        public_id,
        auth_method_id,
        name,
        description,
        version,
        create_time: Some(create_time),
        update_time: Some(update_time),
    })
}

impl AccountRow for PasswordRow {
    fn into_account(self) -> Result<Account, StoreError> {
        Ok(PasswordAccount {
            base: base(
                self.public_id,
                self.auth_method_id,
                self.name,
                self.description,
                self.version,
                self.create_time,
                self.update_time,
            )?,
            login_name: self.login_name,
        }
        .into_account())
    }
}

impl AccountRow for OidcRow {
    fn into_account(self) -> Result<Account, StoreError> {
        Ok(OidcAccount {
            base: base(
                self.public_id,
                self.auth_method_id,
                self.name,
                self.description,
                self.version,
                self.create_time,
                self.update_time,
            )?,
            issuer: self.issuer,
            subject: self.subject,
            full_name: self.full_name,
            email: self.email,
        }
        .into_account())
    }
}

async fn fetch_rows<'c, R, E>(
    query: &mut QueryBuilder<'_, Postgres>,
    executor: E,
) -> Result<Vec<Account>, StoreError>
where
    R: AccountRow,
    E: PgExecutor<'c>,
{
    query
        .build_query_as::<R>()
        .fetch_all(executor)
        .await?
        .into_iter()
        .map(R::into_account)
        .collect()
}

async fn fetch<'c, E>(
    subtype: Subtype,
    query: &mut QueryBuilder<'_, Postgres>,
    executor: E,
) -> Result<Vec<Account>, StoreError>
where
    E: PgExecutor<'c>,
{
    match subtype {
        Subtype::Password => fetch_rows::<PasswordRow, _>(query, executor).await,
        Subtype::Oidc => fetch_rows::<OidcRow, _>(query, executor).await,
    }
}

/// Masked conditional update, returning every written row.
///
/// `None` when the expected version cannot be stored, so no row can match.
fn update_query(row: &UpdateRow) -> Option<QueryBuilder<'static, Postgres>> {
    let version = i32::try_from(row.expected_version).ok()?;
    let mut query =
        QueryBuilder::new(format!("UPDATE {} SET ", table(row.subtype)));

    {
        let mut columns = query.separated(", ");
        for (field, value) in &row.set {
            columns.push(format!("{} = ", field.column()));
            columns.push_bind_unseparated(value.clone());
        }
        for field in &row.null {
            columns.push(format!("{} = NULL", field.column()));
        }
        columns.push("version = version + 1");
        columns.push("update_time = now()");
    }

    query
        .push(" WHERE public_id = ")
        .push_bind(row.public_id.clone())
        .push(" AND version = ")
        .push_bind(version)
        .push(" RETURNING *");
    Some(query)
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    /// Init database connections.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> Result<Self, StoreError> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let pool = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Writer>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgWriter { tx: Some(tx) }))
    }

    async fn lookup(
        &self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let mut query = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE public_id = ",
            table(subtype)
        ));
        query.push_bind(public_id.to_owned());

        Ok(fetch(subtype, &mut query, &self.pool).await?.into_iter().next())
    }

    async fn search(
        &self,
        subtype: Subtype,
        auth_method_id: &str,
        limit: usize,
    ) -> Result<Vec<Account>, StoreError> {
        let mut query = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE auth_method_id = ",
            table(subtype)
        ));
        query
            .push_bind(auth_method_id.to_owned())
            .push(" ORDER BY public_id LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        fetch(subtype, &mut query, &self.pool).await
    }
}

#[async_trait]
impl AuthMethodResolver for PgStore {
    async fn lookup_auth_method(
        &self,
        public_id: &str,
    ) -> Result<Option<AuthMethod>, StoreError> {
        Ok(sqlx::query_as::<_, AuthMethod>(
            "SELECT public_id, scope_id, name, issuer FROM auth_method WHERE public_id = $1",
        )
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

/// Open transaction. Dropping it rolls back.
struct PgWriter {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgWriter {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl Writer for PgWriter {
    async fn create(&mut self, account: &Account) -> Result<Account, StoreError> {
        let tx = self.tx()?;

        match account {
            Account::Password(a) => sqlx::query_as::<_, PasswordRow>(
                r#"INSERT INTO auth_password_account (public_id, auth_method_id, name, description, login_name)
                    VALUES ($1, $2, $3, $4, $5) RETURNING *"#,
            )
            .bind(&a.base.public_id)
            .bind(&a.base.auth_method_id)
            .bind(&a.base.name)
            .bind(&a.base.description)
            .bind(&a.login_name)
            .fetch_one(&mut **tx)
            .await?
            .into_account(),
            Account::Oidc(a) => sqlx::query_as::<_, OidcRow>(
                r#"INSERT INTO auth_oidc_account (public_id, auth_method_id, name, description, issuer, subject, full_name, email)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *"#,
            )
            .bind(&a.base.public_id)
            .bind(&a.base.auth_method_id)
            .bind(&a.base.name)
            .bind(&a.base.description)
            .bind(&a.issuer)
            .bind(&a.subject)
            .bind(&a.full_name)
            .bind(&a.email)
            .fetch_one(&mut **tx)
            .await?
            .into_account(),
        }
    }

    async fn update(&mut self, row: &UpdateRow) -> Result<Vec<Account>, StoreError> {
        let tx = self.tx()?;
        let Some(mut query) = update_query(row) else {
            return Ok(Vec::new());
        };

        fetch(row.subtype, &mut query, &mut **tx).await
    }

    async fn delete(
        &mut self,
        subtype: Subtype,
        public_id: &str,
    ) -> Result<Vec<Account>, StoreError> {
        let tx = self.tx()?;
        let mut query = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE public_id = ",
            table(subtype)
        ));
        query.push_bind(public_id.to_owned()).push(" RETURNING *");

        fetch(subtype, &mut query, &mut **tx).await
    }

    async fn write_oplog(&mut self, entry: &SealedEntry) -> Result<(), StoreError> {
        let tx = self.tx()?;

        sqlx::query(
            r#"INSERT INTO oplog_entry (scope_id, op_type, resource_public_id, key_id, data)
                VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&entry.scope_id)
        .bind(entry.op_type.as_str())
        .bind(&entry.resource_public_id)
        .bind(&entry.key_id)
        .bind(&entry.data)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
