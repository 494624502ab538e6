//! Custody chain CRUD operations
//!
//! Quantity updates are compare-and-swap on the `version` column so a
//! writer working from a stale read cannot overwrite a newer balance.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::models::{current_timestamp, ChainStatus, CustodyChain};
use crate::error::LineageError;

const CHAIN_COLUMNS: &str = "id, source_plot_id, source_facility_id, destination_facility_id,
    parent_chain_id, product_type, total_quantity, remaining_quantity, status, quality_grade,
    batch_number, harvest_date, expiry_date, version, created_at, updated_at";

// =============================================================================
// Types
// =============================================================================

/// Row values for a new chain; `remaining = total` and status `active`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCustodyChain {
    pub id: String,
    pub source_plot_id: Option<String>,
    pub source_facility_id: Option<String>,
    pub destination_facility_id: Option<String>,
    pub parent_chain_id: Option<String>,
    pub product_type: String,
    pub total_quantity: Decimal,
    pub quality_grade: Option<String>,
    pub batch_number: Option<String>,
    pub harvest_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
}

/// Query parameters for listing chains
#[derive(Debug, Clone, Deserialize)]
pub struct ChainQuery {
    pub status: Option<ChainStatus>,
    pub product_type: Option<String>,
    pub facility_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 { 100 }

impl Default for ChainQuery {
    fn default() -> Self {
        Self {
            status: None,
            product_type: None,
            facility_id: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

// =============================================================================
// Read Operations
// =============================================================================

/// Get a chain by ID
pub fn get_chain(conn: &Connection, id: &str) -> Result<Option<CustodyChain>, LineageError> {
    let sql = format!("SELECT {} FROM custody_chains WHERE id = ?", CHAIN_COLUMNS);
    Ok(conn.query_row(&sql, params![id], CustodyChain::from_row).optional()?)
}

/// Get a chain by ID, failing with `NotFound`
pub fn require_chain(conn: &Connection, id: &str) -> Result<CustodyChain, LineageError> {
    get_chain(conn, id)?.ok_or_else(|| LineageError::not_found("custody chain", id))
}

/// Chains whose lineage pointer names `parent_id`
pub fn list_children(conn: &Connection, parent_id: &str) -> Result<Vec<CustodyChain>, LineageError> {
    let sql = format!(
        "SELECT {} FROM custody_chains WHERE parent_chain_id = ? ORDER BY created_at, id",
        CHAIN_COLUMNS
    );
    collect(conn, &sql, params![parent_id])
}

/// Chains originating at a plot
pub fn list_by_source_plot(conn: &Connection, plot_id: &str) -> Result<Vec<CustodyChain>, LineageError> {
    let sql = format!(
        "SELECT {} FROM custody_chains WHERE source_plot_id = ? ORDER BY created_at, id",
        CHAIN_COLUMNS
    );
    collect(conn, &sql, params![plot_id])
}

/// Chains originating at a facility
pub fn list_by_source_facility(
    conn: &Connection,
    facility_id: &str,
) -> Result<Vec<CustodyChain>, LineageError> {
    let sql = format!(
        "SELECT {} FROM custody_chains WHERE source_facility_id = ? ORDER BY created_at, id",
        CHAIN_COLUMNS
    );
    collect(conn, &sql, params![facility_id])
}

/// List chains with filtering
pub fn list_chains(conn: &Connection, query: &ChainQuery) -> Result<Vec<CustodyChain>, LineageError> {
    let mut sql = format!("SELECT {} FROM custody_chains WHERE 1=1", CHAIN_COLUMNS);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = query.status {
        sql.push_str(" AND status = ?");
        params_vec.push(Box::new(status));
    }

    if let Some(product_type) = &query.product_type {
        sql.push_str(" AND product_type = ?");
        params_vec.push(Box::new(product_type.clone()));
    }

    if let Some(facility_id) = &query.facility_id {
        sql.push_str(" AND (source_facility_id = ? OR destination_facility_id = ?)");
        params_vec.push(Box::new(facility_id.clone()));
        params_vec.push(Box::new(facility_id.clone()));
    }

    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(query.limit));
    params_vec.push(Box::new(query.offset));

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    collect(conn, &sql, params_refs.as_slice())
}

fn collect<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<CustodyChain>, LineageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, CustodyChain::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Write Operations
// =============================================================================

/// Insert a new chain
pub fn insert_chain(conn: &Connection, chain: &NewCustodyChain) -> Result<CustodyChain, LineageError> {
    let now = current_timestamp();

    conn.execute(
        "INSERT INTO custody_chains (id, source_plot_id, source_facility_id, destination_facility_id,
         parent_chain_id, product_type, total_quantity, remaining_quantity, status, quality_grade,
         batch_number, harvest_date, expiry_date, version, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
            chain.id,
            chain.source_plot_id,
            chain.source_facility_id,
            chain.destination_facility_id,
            chain.parent_chain_id,
            chain.product_type,
            chain.total_quantity.to_string(),
            chain.total_quantity.to_string(),
            ChainStatus::for_remaining(chain.total_quantity),
            chain.quality_grade,
            chain.batch_number,
            chain.harvest_date,
            chain.expiry_date,
            now,
            now,
        ],
    )?;

    require_chain(conn, &chain.id)
}

/// Set a chain's remaining quantity if it is still at `expected_version`
///
/// Status follows the new balance. Fails with `ConcurrentModification`
/// when another writer got there first.
pub fn update_remaining(
    conn: &Connection,
    id: &str,
    expected_version: i64,
    remaining: Decimal,
) -> Result<CustodyChain, LineageError> {
    let rows = conn.execute(
        "UPDATE custody_chains
         SET remaining_quantity = ?, status = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
        params![
            remaining.to_string(),
            ChainStatus::for_remaining(remaining),
            current_timestamp(),
            id,
            expected_version,
        ],
    )?;

    if rows == 0 {
        return Err(match get_chain(conn, id)? {
            Some(_) => LineageError::ConcurrentModification {
                chain_id: id.to_string(),
                expected_version,
            },
            None => LineageError::not_found("custody chain", id),
        });
    }

    require_chain(conn, id)
}

/// Record where a chain is headed (transaction events)
pub fn update_destination(
    conn: &Connection,
    id: &str,
    destination_facility_id: &str,
) -> Result<bool, LineageError> {
    let rows = conn.execute(
        "UPDATE custody_chains SET destination_facility_id = ?, updated_at = ? WHERE id = ?",
        params![destination_facility_id, current_timestamp(), id],
    )?;
    Ok(rows > 0)
}
