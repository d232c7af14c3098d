//! Public identifiers.
//!
//! Every identifier carries a type tag as prefix (`apw_…`, `acctoidc_…`), so
//! callers can route a request to the right repository without any lookup.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Result, ServerError};

pub const PASSWORD_AUTH_METHOD_PREFIX: &str = "ampw";
pub const PASSWORD_ACCOUNT_PREFIX: &str = "apw";
pub const OIDC_AUTH_METHOD_PREFIX: &str = "amoidc";
pub const OIDC_ACCOUNT_PREFIX: &str = "acctoidc";

const ID_LENGTH: usize = 10;
const BASE62: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

static ACCOUNT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(apw|acctoidc)_[0-9A-Za-z]+$").expect("valid regex")
});
static AUTH_METHOD_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ampw|amoidc)_[0-9A-Za-z]+$").expect("valid regex")
});

/// Account subtype, encoded in every account and auth method identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Subtype {
    Password,
    Oidc,
}

impl Subtype {
    /// Read the subtype tag of an account or auth method identifier.
    pub fn from_id(id: &str) -> Option<Self> {
        let (prefix, suffix) = id.split_once('_')?;
        if suffix.is_empty() {
            return None;
        }

        match prefix {
            PASSWORD_AUTH_METHOD_PREFIX | PASSWORD_ACCOUNT_PREFIX => {
                Some(Self::Password)
            },
            OIDC_AUTH_METHOD_PREFIX | OIDC_ACCOUNT_PREFIX => Some(Self::Oidc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Oidc => "oidc",
        }
    }

    pub fn account_prefix(&self) -> &'static str {
        match self {
            Self::Password => PASSWORD_ACCOUNT_PREFIX,
            Self::Oidc => OIDC_ACCOUNT_PREFIX,
        }
    }
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subtype {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "password" => Ok(Self::Password),
            "oidc" => Ok(Self::Oidc),
            _ => Err(()),
        }
    }
}

/// Whether `id` is a well-formed account identifier.
pub fn is_account_id(id: &str) -> bool {
    ACCOUNT_ID.is_match(id)
}

/// Whether `id` is a well-formed auth method identifier.
pub fn is_auth_method_id(id: &str) -> bool {
    AUTH_METHOD_ID.is_match(id)
}

/// Random password account identifier.
///
/// Uniqueness is enforced by the store primary key, the repository
/// regenerates on collision.
pub fn new_password_account_id() -> String {
    format!(
        "{PASSWORD_ACCOUNT_PREFIX}_{}",
        Alphanumeric.sample_string(&mut OsRng, ID_LENGTH)
    )
}

/// Deterministic OIDC account identifier.
///
/// The same `(auth_method_id, issuer, subject)` always yields the same id, so
/// a duplicate subject surfaces as a primary key violation at insert time.
///
/// # Errors
///
/// Returns [`ServerError::InvalidParameter`] if any input is empty or the
/// issuer is not an absolute `http(s)` URL.
pub fn new_oidc_account_id(
    auth_method_id: &str,
    issuer: &str,
    subject: &str,
) -> Result<String> {
    const OP: &str = "id.new_oidc_account_id";

    if auth_method_id.is_empty() {
        return Err(ServerError::invalid_parameter(OP, "missing auth method id"));
    }
    if issuer.is_empty() {
        return Err(ServerError::invalid_parameter(OP, "missing issuer"));
    }
    if subject.is_empty() {
        return Err(ServerError::invalid_parameter(OP, "missing subject"));
    }
    parse_issuer(issuer).ok_or_else(|| {
        ServerError::invalid_parameter(OP, format!("{issuer:?} is not a valid issuer URL"))
    })?;

    let mut hasher = Sha256::new();
    for part in [auth_method_id, issuer, subject] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    Ok(format!("{OIDC_ACCOUNT_PREFIX}_{}", base62(&digest)))
}

/// Parse an issuer, accepting only absolute `http`/`https` URLs with a host.
pub fn parse_issuer(issuer: &str) -> Option<Url> {
    let url = Url::parse(issuer).ok()?;
    let scheme_ok = matches!(url.scheme(), "http" | "https");
    (scheme_ok && url.host_str().is_some_and(|h| !h.is_empty())).then_some(url)
}

fn base62(digest: &[u8]) -> String {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&digest[..16]);
    let mut n = u128::from_be_bytes(buf);

    (0..ID_LENGTH)
        .map(|_| {
            let c = BASE62[(n % 62) as usize] as char;
            n /= 62;
            c
        })
        .collect()
}
