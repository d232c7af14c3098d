//! Audit trail of account mutations.
//!
//! Each committed mutation is paired with one entry written in the same
//! transaction, sealed with the wrapper of the owning scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::crypto::CryptoError;
use crate::database::Writer;
use crate::error::{Result, ServerError, StoreContext};
use crate::kms::Wrapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Plaintext audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub scope_id: String,
    pub op_type: OpType,
    pub resource_type: String,
    pub resource_public_id: String,
    pub version: u32,
    /// Resource snapshot after the mutation.
    pub data: serde_json::Value,
    pub create_time: DateTime<Utc>,
}

impl Entry {
    pub fn new(scope_id: &str, op_type: OpType, account: &Account) -> Result<Self> {
        let data = serde_json::to_value(account).map_err(|err| {
            ServerError::Encrypt {
                op: "oplog.entry",
                source: Box::new(CryptoError::Json(err)),
            }
        })?;

        Ok(Self {
            scope_id: scope_id.to_owned(),
            op_type,
            resource_type: account.resource_type().to_owned(),
            resource_public_id: account.public_id().to_owned(),
            version: account.version(),
            data,
            create_time: Utc::now(),
        })
    }
}

/// Entry as persisted: metadata in clear, body sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEntry {
    pub scope_id: String,
    pub op_type: OpType,
    pub resource_public_id: String,
    pub key_id: String,
    pub data: Vec<u8>,
}

pub fn seal(wrapper: &Wrapper, entry: &Entry) -> std::result::Result<SealedEntry, CryptoError> {
    let plaintext = serde_json::to_vec(entry)?;

    Ok(SealedEntry {
        scope_id: entry.scope_id.clone(),
        op_type: entry.op_type,
        resource_public_id: entry.resource_public_id.clone(),
        key_id: wrapper.key_id().to_owned(),
        data: wrapper.encrypt(&plaintext)?,
    })
}

/// Decrypt a sealed entry with the wrapper that sealed it.
pub fn open(wrapper: &Wrapper, sealed: &SealedEntry) -> std::result::Result<Entry, CryptoError> {
    let plaintext = wrapper.decrypt(&sealed.data)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Seal and write the entry for `account` inside the open transaction.
pub async fn write(
    writer: &mut dyn Writer,
    wrapper: &Wrapper,
    scope_id: &str,
    op_type: OpType,
    account: &Account,
    op: &'static str,
) -> Result<()> {
    let entry = Entry::new(scope_id, op_type, account)?;
    let sealed = seal(wrapper, &entry).map_err(|err| ServerError::Encrypt {
        op,
        source: Box::new(err),
    })?;

    writer
        .write_oplog(&sealed)
        .await
        .context(op, account.public_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountKind, PasswordAccount};
    use crate::crypto::{KEY_LENGTH, SymmetricKey};

    fn wrapper(byte: u8) -> Wrapper {
        Wrapper::new(SymmetricKey::from_bytes(&[byte; KEY_LENGTH]).unwrap())
    }

    #[test]
    fn test_sealed_entry_hides_snapshot() {
        let mut account = PasswordAccount::new("ampw_1234567890", "alice");
        account.base.public_id = "apw_1234567890".into();
        account.base.version = 1;
        let account = account.into_account();

        let wrapper = wrapper(9);
        let entry = Entry::new("o_1234567890", OpType::Create, &account).unwrap();
        let sealed = seal(&wrapper, &entry).unwrap();

        assert_eq!(sealed.key_id, wrapper.key_id());
        assert_eq!(sealed.resource_public_id, "apw_1234567890");
        assert!(!String::from_utf8_lossy(&sealed.data).contains("alice"));

        let opened = open(&wrapper, &sealed).unwrap();
        assert_eq!(opened.data["login_name"], "alice");
        assert_eq!(opened.resource_type, "password account");
        assert!(open(&self::wrapper(10), &sealed).is_err());
    }
}
