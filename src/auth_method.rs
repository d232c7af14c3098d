//! Parent auth methods of accounts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::database::StoreError;
use crate::id::Subtype;

/// Configured authentication mechanism owning a set of accounts.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct AuthMethod {
    pub public_id: String,
    pub scope_id: String,
    pub name: Option<String>,
    /// Discovery issuer, only set on OIDC auth methods.
    pub issuer: Option<String>,
}

impl AuthMethod {
    pub fn subtype(&self) -> Option<Subtype> {
        Subtype::from_id(&self.public_id)
    }
}

/// Resolve auth methods by public id.
#[async_trait]
pub trait AuthMethodResolver: Send + Sync {
    /// A missing auth method is `Ok(None)`.
    async fn lookup_auth_method(
        &self,
        public_id: &str,
    ) -> Result<Option<AuthMethod>, StoreError>;
}
