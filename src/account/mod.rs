//! Account domain types shared by both subtypes.

pub mod filter;
pub mod repository;
pub mod service;
pub mod view;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Subtype;

pub use repository::Repository;
pub use service::AccountService;

/// Fields shared by every account subtype.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBase {
    pub public_id: String,
    pub auth_method_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: u32,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

/// Account authenticated with a login name and password.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordAccount {
    #[serde(flatten)]
    pub base: AccountBase,
    pub login_name: String,
}

impl PasswordAccount {
    pub fn new(auth_method_id: &str, login_name: &str) -> Self {
        Self {
            base: AccountBase {
                auth_method_id: auth_method_id.to_owned(),
                ..Default::default()
            },
            login_name: login_name.to_owned(),
        }
    }
}

/// Account bound to an external OIDC subject.
///
/// `issuer` is copied from the auth method at creation and never written
/// by callers.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcAccount {
    #[serde(flatten)]
    pub base: AccountBase,
    pub issuer: String,
    pub subject: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

impl OidcAccount {
    pub fn new(auth_method_id: &str, subject: &str) -> Self {
        Self {
            base: AccountBase {
                auth_method_id: auth_method_id.to_owned(),
                ..Default::default()
            },
            subject: subject.to_owned(),
            ..Default::default()
        }
    }
}

/// Either account subtype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Account {
    Password(PasswordAccount),
    Oidc(OidcAccount),
}

impl Account {
    pub fn subtype(&self) -> Subtype {
        match self {
            Self::Password(_) => Subtype::Password,
            Self::Oidc(_) => Subtype::Oidc,
        }
    }

    pub fn base(&self) -> &AccountBase {
        match self {
            Self::Password(account) => &account.base,
            Self::Oidc(account) => &account.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut AccountBase {
        match self {
            Self::Password(account) => &mut account.base,
            Self::Oidc(account) => &mut account.base,
        }
    }

    pub fn public_id(&self) -> &str {
        &self.base().public_id
    }

    pub fn auth_method_id(&self) -> &str {
        &self.base().auth_method_id
    }

    pub fn version(&self) -> u32 {
        self.base().version
    }

    /// Resource type recorded in audit entries.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Self::Password(_) => "password account",
            Self::Oidc(_) => "oidc account",
        }
    }
}

/// Account fields a caller may write through an update mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Description,
}

impl Field {
    /// Store column.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Description => "description",
        }
    }

    /// Value of this field on `base`.
    pub fn value<'a>(&self, base: &'a AccountBase) -> Option<&'a str> {
        match self {
            Self::Name => base.name.as_deref(),
            Self::Description => base.description.as_deref(),
        }
    }

    /// Write `value` into `base`, `None` clears the field.
    pub fn apply(&self, base: &mut AccountBase, value: Option<String>) {
        match self {
            Self::Name => base.name = value,
            Self::Description => base.description = value,
        }
    }
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("name") {
            Ok(Self::Name)
        } else if s.eq_ignore_ascii_case("description") {
            Ok(Self::Description)
        } else {
            Err(())
        }
    }
}

/// Conversion between a concrete subtype and [`Account`].
pub trait AccountKind: Clone + Send + Sync + 'static {
    const SUBTYPE: Subtype;

    fn base(&self) -> &AccountBase;

    fn base_mut(&mut self) -> &mut AccountBase;

    fn into_account(self) -> Account;

    fn from_account(account: Account) -> Option<Self>;
}

impl AccountKind for PasswordAccount {
    const SUBTYPE: Subtype = Subtype::Password;

    fn base(&self) -> &AccountBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AccountBase {
        &mut self.base
    }

    fn into_account(self) -> Account {
        Account::Password(self)
    }

    fn from_account(account: Account) -> Option<Self> {
        match account {
            Account::Password(account) => Some(account),
            Account::Oidc(_) => None,
        }
    }
}

impl AccountKind for OidcAccount {
    const SUBTYPE: Subtype = Subtype::Oidc;

    fn base(&self) -> &AccountBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AccountBase {
        &mut self.base
    }

    fn into_account(self) -> Account {
        Account::Oidc(self)
    }

    fn from_account(account: Account) -> Option<Self> {
        match account {
            Account::Oidc(account) => Some(account),
            Account::Password(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_from_str() {
        assert_eq!("name".parse::<Field>(), Ok(Field::Name));
        assert_eq!("Description".parse::<Field>(), Ok(Field::Description));
        assert!("login_name".parse::<Field>().is_err());
    }

    #[test]
    fn test_account_snapshot_is_tagged() {
        let mut account = OidcAccount::new("amoidc_1", "alice");
        account.issuer = "https://idp.example.com".into();
        let value = serde_json::to_value(account.into_account()).unwrap();

        assert_eq!(value["type"], "oidc");
        assert_eq!(value["subject"], "alice");
        assert_eq!(value["auth_method_id"], "amoidc_1");
    }

    #[test]
    fn test_kind_conversion() {
        let account = PasswordAccount::new("ampw_1", "alice").into_account();

        assert_eq!(account.subtype(), Subtype::Password);
        assert!(OidcAccount::from_account(account.clone()).is_none());
        assert_eq!(
            PasswordAccount::from_account(account).map(|a| a.login_name),
            Some("alice".to_owned())
        );
    }
}
