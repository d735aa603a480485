//! Reconciliation configuration
//!
//! Loaded from an optional TOML file, then overridden by environment variables.
//! The starting grant lives here and nowhere else so the formula and any
//! display code read the same number.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::{debug, warn};

/// How corrected P&L is rounded to whole cents
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PnlRounding {
    /// Exact decimal sum across trades, rounded once at the end
    #[default]
    Aggregate,
    /// Each trade rounded to the cent before summing
    PerTrade,
}

impl PnlRounding {
    pub fn as_str(&self) -> &str {
        match self {
            PnlRounding::Aggregate => "aggregate",
            PnlRounding::PerTrade => "per_trade",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "aggregate" => Some(PnlRounding::Aggregate),
            "per_trade" | "per-trade" => Some(PnlRounding::PerTrade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Virtual currency every account starts with ($10,000)
    #[serde(default = "default_starting_grant_cents")]
    pub starting_grant_cents: i64,

    #[serde(default)]
    pub pnl_rounding: PnlRounding,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_history_limit")]
    pub history_default_limit: usize,

    #[serde(default = "default_history_max_limit")]
    pub history_max_limit: usize,
}

fn default_starting_grant_cents() -> i64 {
    1_000_000
}

fn default_db_path() -> String {
    "ledger.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_history_limit() -> usize {
    50
}

fn default_history_max_limit() -> usize {
    500
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            starting_grant_cents: default_starting_grant_cents(),
            pnl_rounding: PnlRounding::default(),
            db_path: default_db_path(),
            bind_addr: default_bind_addr(),
            history_default_limit: default_history_limit(),
            history_max_limit: default_history_max_limit(),
        }
    }
}

impl ReconcileConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// File (if present) plus env overrides
    pub fn from_env(path: Option<&str>) -> Self {
        let path = path
            .map(str::to_string)
            .or_else(|| env::var("RECONCILE_CONFIG_PATH").ok())
            .unwrap_or_else(|| "reconcile.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            debug!("Using default reconcile config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env::var("STARTING_GRANT_CENTS")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|&v| v >= 0)
        {
            self.starting_grant_cents = v;
        }

        if let Ok(v) = env::var("PNL_ROUNDING") {
            match PnlRounding::from_str(&v) {
                Some(mode) => self.pnl_rounding = mode,
                None => warn!(value = %v, "Ignoring unknown PNL_ROUNDING"),
            }
        }

        if let Some(v) = env::var("LEDGER_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            self.db_path = v;
        }

        if let Some(v) = env::var("BIND_ADDR").ok().filter(|v| !v.trim().is_empty()) {
            self.bind_addr = v;
        }

        if let Some(v) = env::var("HISTORY_DEFAULT_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
        {
            self.history_default_limit = v;
        }

        if let Some(v) = env::var("HISTORY_MAX_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
        {
            self.history_max_limit = v;
        }
    }

    /// Requested history page size, defaulted and clamped
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.history_default_limit)
            .clamp(1, self.history_max_limit.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcileConfig::default();
        assert_eq!(config.starting_grant_cents, 1_000_000);
        assert_eq!(config.pnl_rounding, PnlRounding::Aggregate);
        assert_eq!(config.history_default_limit, 50);
    }

    #[test]
    fn test_toml_partial_file() {
        let parsed: ReconcileConfig = toml::from_str(
            r#"
            starting_grant_cents = 500000
            pnl_rounding = "per_trade"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.starting_grant_cents, 500_000);
        assert_eq!(parsed.pnl_rounding, PnlRounding::PerTrade);
        assert_eq!(parsed.db_path, "ledger.db");
    }

    #[test]
    fn test_history_limit_clamp() {
        let config = ReconcileConfig::default();
        assert_eq!(config.history_limit(None), 50);
        assert_eq!(config.history_limit(Some(0)), 1);
        assert_eq!(config.history_limit(Some(10_000)), 500);
    }

    #[test]
    fn test_rounding_mode_parse() {
        assert_eq!(PnlRounding::from_str("per-trade"), Some(PnlRounding::PerTrade));
        assert_eq!(PnlRounding::from_str(" Aggregate "), Some(PnlRounding::Aggregate));
        assert_eq!(PnlRounding::from_str("banker"), None);
    }
}
