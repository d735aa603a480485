//! Audit history ledger
//!
//! Append-only log of audit, fix and rollback runs, plus the per-user fix
//! records a rollback replays. Rows are never updated except for the single
//! `rolled_back_at` transition on a fix run.

use crate::error::ReconcileResult;
use crate::models::{AuditRunLogEntry, AuditType, FixRecord, NewAuditRun};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

const RUN_COLUMNS: &str = "id, audit_type, run_at, total_users_checked, discrepancies_found, \
     fixes_applied, total_adjustment_cents, triggered_by, notes, rollback_of, rolled_back_at";

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRunLogEntry> {
    let type_str: String = row.get(1)?;
    let audit_type = AuditType::from_str(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown audit type '{}'", type_str).into(),
        )
    })?;
    let run_at: String = row.get(2)?;
    let rolled_back_at: Option<String> = row.get(10)?;

    Ok(AuditRunLogEntry {
        id: row.get(0)?,
        audit_type,
        run_at: parse_ts(2, &run_at)?,
        total_users_checked: row.get(3)?,
        discrepancies_found: row.get(4)?,
        fixes_applied: row.get(5)?,
        total_adjustment_cents: row.get(6)?,
        triggered_by: row.get(7)?,
        notes: row.get(8)?,
        rollback_of: row.get(9)?,
        rolled_back_at: rolled_back_at
            .as_deref()
            .map(|raw| parse_ts(10, raw))
            .transpose()?,
    })
}

/// Append a run entry stamped with the current time
pub fn insert_run(conn: &Connection, run: &NewAuditRun) -> ReconcileResult<AuditRunLogEntry> {
    let run_at = Utc::now();
    conn.execute(
        "INSERT INTO audit_runs
         (audit_type, run_at, total_users_checked, discrepancies_found, fixes_applied,
          total_adjustment_cents, triggered_by, notes, rollback_of)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            run.audit_type.as_str(),
            run_at.to_rfc3339(),
            run.total_users_checked,
            run.discrepancies_found,
            run.fixes_applied,
            run.total_adjustment_cents,
            run.triggered_by,
            run.notes,
            run.rollback_of,
        ],
    )?;

    Ok(AuditRunLogEntry {
        id: conn.last_insert_rowid(),
        audit_type: run.audit_type,
        run_at,
        total_users_checked: run.total_users_checked,
        discrepancies_found: run.discrepancies_found,
        fixes_applied: run.fixes_applied,
        total_adjustment_cents: run.total_adjustment_cents,
        triggered_by: run.triggered_by.clone(),
        notes: run.notes.clone(),
        rollback_of: run.rollback_of,
        rolled_back_at: None,
    })
}

pub fn get_run(conn: &Connection, id: i64) -> ReconcileResult<Option<AuditRunLogEntry>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {} FROM audit_runs WHERE id = ?1", RUN_COLUMNS))?;
    Ok(stmt.query_row([id], run_from_row).optional()?)
}

/// Most recent first
pub fn list_history(conn: &Connection, limit: usize) -> ReconcileResult<Vec<AuditRunLogEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM audit_runs ORDER BY id DESC LIMIT ?1",
        RUN_COLUMNS
    ))?;
    let runs = stmt
        .query_map([limit as i64], run_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}

/// Stamp `rolled_back_at` on a fix run. `false` if it was already stamped.
pub fn mark_rolled_back(
    conn: &Connection,
    id: i64,
    at: DateTime<Utc>,
) -> ReconcileResult<bool> {
    let rows = conn.execute(
        "UPDATE audit_runs SET rolled_back_at = ?1
         WHERE id = ?2 AND audit_type = 'fix' AND rolled_back_at IS NULL",
        params![at.to_rfc3339(), id],
    )?;
    Ok(rows == 1)
}

pub fn insert_fix_records(
    conn: &Connection,
    audit_run_id: i64,
    records: &[FixRecord],
) -> ReconcileResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO fix_records
         (audit_run_id, user_id, username, previous_balance_cents, new_balance_cents,
          adjustment_cents, had_open_positions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for rec in records {
        stmt.execute(params![
            audit_run_id,
            rec.user_id,
            rec.username,
            rec.previous_balance_cents,
            rec.new_balance_cents,
            rec.adjustment_cents,
            rec.had_open_positions as i64,
        ])?;
    }
    Ok(())
}

pub fn fix_records_for_run(conn: &Connection, audit_run_id: i64) -> ReconcileResult<Vec<FixRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, username, previous_balance_cents, new_balance_cents,
                adjustment_cents, had_open_positions
         FROM fix_records WHERE audit_run_id = ?1 ORDER BY id ASC",
    )?;
    let records = stmt
        .query_map([audit_run_id], |row| {
            Ok(FixRecord {
                user_id: row.get(0)?,
                username: row.get(1)?,
                previous_balance_cents: row.get(2)?,
                new_balance_cents: row.get(3)?,
                adjustment_cents: row.get(4)?,
                had_open_positions: row.get::<_, i64>(5)? == 1,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}
