//! Writer identities.
//!
//! An `Identity` is whoever placed a cell: an anonymous network-address token
//! or an authenticated account. The two are variants of one enum, so a cell or
//! ledger entry can never carry both (or neither).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;
use thiserror::Error;

/// An authenticated account identifier, issued by the account service.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

/// Which side of the identity variant a stored record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum IdentityKind {
    #[strum(serialize = "anonymous", serialize = "anon")]
    Anonymous,
    #[strum(serialize = "account", serialize = "acct")]
    Account,
}

impl IdentityKind {
    /// Parse from string (case-insensitive, accepts short aliases).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Anonymous => "anonymous",
            IdentityKind::Account => "account",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from rebuilding an identity out of its stored parts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown identity kind '{0}'")]
    UnknownKind(String),
    #[error("invalid account id '{0}'")]
    BadAccountId(String),
    #[error("anonymous identity token is empty")]
    EmptyToken,
}

/// The principal behind a placement.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Identity {
    /// Anonymous writer keyed by its network address token.
    Anonymous(String),
    /// Authenticated account.
    Account(AccountId),
}

impl Identity {
    pub fn anonymous(token: impl Into<String>) -> Self {
        Identity::Anonymous(token.into())
    }

    pub fn account(id: i64) -> Self {
        Identity::Account(AccountId::new(id))
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Identity::Anonymous(_) => IdentityKind::Anonymous,
            Identity::Account(_) => IdentityKind::Account,
        }
    }

    /// The per-kind key persisted next to [`IdentityKind::as_str`].
    pub fn key(&self) -> String {
        match self {
            Identity::Anonymous(token) => token.clone(),
            Identity::Account(id) => id.to_string(),
        }
    }

    /// Rebuild an identity from the `(kind, key)` column pair.
    pub fn from_parts(kind: &str, key: &str) -> Result<Self, IdentityError> {
        match IdentityKind::from_str(kind) {
            Some(IdentityKind::Anonymous) if key.is_empty() => Err(IdentityError::EmptyToken),
            Some(IdentityKind::Anonymous) => Ok(Identity::Anonymous(key.to_string())),
            Some(IdentityKind::Account) => key
                .parse::<i64>()
                .map(Identity::account)
                .map_err(|_| IdentityError::BadAccountId(key.to_string())),
            None => Err(IdentityError::UnknownKind(kind.to_string())),
        }
    }

    /// Public-facing form with anonymous addresses partially hidden.
    ///
    /// IPv4 addresses lose their last octet; anything else keeps its first
    /// eight characters.
    pub fn masked(&self) -> String {
        match self {
            Identity::Anonymous(token) => match token.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    let [a, b, c, _] = ip.octets();
                    format!("{a}.{b}.{c}.xxx")
                }
                Err(_) => {
                    let head: String = token.chars().take(8).collect();
                    format!("{head}xxx")
                }
            },
            Identity::Account(id) => format!("account:{id}"),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous(token) => write!(f, "anon:{token}"),
            Identity::Account(id) => write!(f, "account:{id}"),
        }
    }
}
