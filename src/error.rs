//! Reconciliation error taxonomy
//!
//! Single-user operations return [`ReconcileError`]. Batch operations never fail
//! as a whole for one user's problem: those are reported per item as
//! [`ItemFailure`] next to the successes.

use crate::models::UserId;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("audit run {0} has already been rolled back")]
    AlreadyRolledBack(i64),

    #[error("audit run {id} is a '{actual}' run, only 'fix' runs can be rolled back")]
    WrongLogType { id: i64, actual: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for ReconcileError {
    fn from(err: rusqlite::Error) -> Self {
        ReconcileError::Persistence(err.to_string())
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Why a single user inside a batch was not written
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ItemFailure {
    /// Balance changed between the read and the conditional write
    StaleWrite,
    /// A position was opened before the write; needs manual review
    OpenPositionsPresent,
    NotFound,
    Persistence(String),
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemFailure::StaleWrite => write!(f, "balance changed since read"),
            ItemFailure::OpenPositionsPresent => write!(f, "user has open positions"),
            ItemFailure::NotFound => write!(f, "user not found"),
            ItemFailure::Persistence(msg) => write!(f, "persistence failure: {}", msg),
        }
    }
}

/// One failed user in a batch
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedItem {
    pub user_id: UserId,
    pub reason: ItemFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ReconcileError::WrongLogType {
            id: 7,
            actual: "full".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "audit run 7 is a 'full' run, only 'fix' runs can be rolled back"
        );
        assert_eq!(
            ReconcileError::AlreadyRolledBack(3).to_string(),
            "audit run 3 has already been rolled back"
        );
    }

    #[test]
    fn test_item_failure_serialization() {
        let json = serde_json::to_value(ItemFailure::StaleWrite).unwrap();
        assert_eq!(json["kind"], "stale_write");

        let json = serde_json::to_value(ItemFailure::Persistence("disk full".into())).unwrap();
        assert_eq!(json["kind"], "persistence");
        assert_eq!(json["detail"], "disk full");
    }
}
