//! User identifier resolution
//!
//! Admin tools accept a numeric id, a username or a wallet address. All of
//! them resolve here to one canonical [`User`] before any reconciliation work.

use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::LedgerSource;
use crate::models::{User, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum UserIdentifier {
    Id(UserId),
    Username(String),
    Wallet(String),
}

impl UserIdentifier {
    /// Classify free-form input. `0x` + 40 hex chars is a wallet, all digits is
    /// an id, anything else a username.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if is_evm_address(s) {
            return UserIdentifier::Wallet(s.to_lowercase());
        }
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(id) = s.parse::<UserId>() {
                return UserIdentifier::Id(id);
            }
        }
        UserIdentifier::Username(s.to_string())
    }
}

impl std::fmt::Display for UserIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserIdentifier::Id(id) => write!(f, "id {}", id),
            UserIdentifier::Username(name) => write!(f, "username '{}'", name),
            UserIdentifier::Wallet(addr) => write!(f, "wallet {}", addr),
        }
    }
}

fn is_evm_address(s: &str) -> bool {
    s.len() == 42
        && (s.starts_with("0x") || s.starts_with("0X"))
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve to the canonical user or `NotFound`
pub fn resolve_user<S: LedgerSource + ?Sized>(
    src: &S,
    ident: &UserIdentifier,
) -> ReconcileResult<User> {
    let found = match ident {
        // Numeric usernames exist; fall back to a username lookup
        UserIdentifier::Id(id) => match src.get_user(*id)? {
            Some(user) => Some(user),
            None => src.find_user_by_username(&id.to_string())?,
        },
        UserIdentifier::Username(name) => src.find_user_by_username(name)?,
        UserIdentifier::Wallet(addr) => src.find_user_by_wallet(addr)?,
    };
    found.ok_or_else(|| ReconcileError::NotFound(format!("user with {}", ident)))
}
