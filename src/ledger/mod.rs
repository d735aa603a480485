//! Ledger storage and the read interface the reconciler consumes

pub mod db;
pub mod sources;

pub use db::{set_balance, set_balance_if, LedgerDb};
pub use sources::LedgerSource;
