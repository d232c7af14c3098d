//! Subtype-agnostic account representation returned to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Account, OidcAccount, PasswordAccount};
use crate::authorization::{Action, ScopeInfo};
use crate::id::Subtype;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Attributes {
    Password {
        login_name: String,
    },
    Oidc {
        issuer: String,
        subject: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        full_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: Subtype,
    pub auth_method_id: String,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authorized_actions: Vec<Action>,
}

impl AccountView {
    /// Attach the authorization context of the caller.
    pub fn authorized(mut self, scope: &ScopeInfo, actions: Vec<Action>) -> Self {
        self.scope = Some(scope.clone());
        self.authorized_actions = actions;
        self
    }
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        let kind = account.subtype();
        let (base, attributes) = match account {
            Account::Password(PasswordAccount { base, login_name }) => {
                (base, Attributes::Password { login_name })
            },
            Account::Oidc(OidcAccount {
                base,
                issuer,
                subject,
                full_name,
                email,
            }) => (
                base,
                Attributes::Oidc {
                    issuer,
                    subject,
                    full_name,
                    email,
                },
            ),
        };

        Self {
            id: base.public_id,
            scope: None,
            // Empty means unset.
            name: base.name.filter(|n| !n.is_empty()),
            description: base.description.filter(|d| !d.is_empty()),
            created_time: base.create_time,
            updated_time: base.update_time,
            version: base.version,
            kind,
            auth_method_id: base.auth_method_id,
            attributes,
            authorized_actions: Vec::new(),
        }
    }
}

/// Response to a successful create.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedAccount {
    pub uri: String,
    pub item: AccountView,
}
