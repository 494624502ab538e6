//! Mass-balance event storage
//!
//! Each event row carries the parent chain; child outputs and merge sources
//! live in `mass_balance_links` so they can be queried from either side.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::models::{format_timestamp, MassBalanceEvent, MassBalanceEventType};
use crate::error::LineageError;
use crate::ids;

const EVENT_COLUMNS: &str = "e.id, e.event_type, e.parent_chain_id, e.input_quantity,
    e.output_quantity, e.conversion_rate, e.waste_quantity, e.process_location_id,
    e.process_date, e.notes, e.metadata_json";

const ROLE_CHILD: &str = "child";
const ROLE_SOURCE: &str = "source";

// =============================================================================
// Types
// =============================================================================

/// Values for a new mass-balance event
#[derive(Debug, Clone)]
pub struct NewMassBalanceEvent {
    pub event_type: MassBalanceEventType,
    pub parent_chain_id: Option<String>,
    pub child_chain_ids: Vec<String>,
    pub source_chain_ids: Vec<String>,
    pub input_quantity: Decimal,
    pub output_quantity: Decimal,
    pub conversion_rate: Option<Decimal>,
    pub waste_quantity: Decimal,
    pub process_location_id: Option<String>,
    pub process_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub metadata: serde_json::Value,
}

/// Inclusive time window; either bound may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Query parameters for listing events
#[derive(Debug, Clone, Default)]
pub struct MassBalanceQuery {
    pub facility_id: Option<String>,
    pub event_type: Option<MassBalanceEventType>,
    pub range: TimeRange,
}

// =============================================================================
// Write Operations
// =============================================================================

/// Insert an event with its child and source links
pub fn insert_event(
    conn: &Connection,
    event: NewMassBalanceEvent,
) -> Result<MassBalanceEvent, LineageError> {
    let id = ids::event_id();

    conn.execute(
        "INSERT INTO mass_balance_events (id, event_type, parent_chain_id, input_quantity,
         output_quantity, conversion_rate, waste_quantity, process_location_id, process_date,
         notes, metadata_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            event.event_type,
            event.parent_chain_id,
            event.input_quantity.to_string(),
            event.output_quantity.to_string(),
            event.conversion_rate.map(|r| r.to_string()),
            event.waste_quantity.to_string(),
            event.process_location_id,
            format_timestamp(&event.process_date),
            event.notes,
            event.metadata,
        ],
    )?;

    insert_links(conn, &id, &event.child_chain_ids, ROLE_CHILD)?;
    insert_links(conn, &id, &event.source_chain_ids, ROLE_SOURCE)?;

    Ok(MassBalanceEvent {
        id,
        event_type: event.event_type,
        parent_chain_id: event.parent_chain_id,
        child_chain_ids: event.child_chain_ids,
        source_chain_ids: event.source_chain_ids,
        input_quantity: event.input_quantity,
        output_quantity: event.output_quantity,
        conversion_rate: event.conversion_rate,
        waste_quantity: event.waste_quantity,
        process_location_id: event.process_location_id,
        process_date: event.process_date,
        notes: event.notes,
        metadata: event.metadata,
    })
}

fn insert_links(
    conn: &Connection,
    event_id: &str,
    chain_ids: &[String],
    role: &str,
) -> Result<(), LineageError> {
    let mut stmt = conn.prepare(
        "INSERT INTO mass_balance_links (event_id, chain_id, role, position) VALUES (?, ?, ?, ?)",
    )?;
    for (position, chain_id) in chain_ids.iter().enumerate() {
        stmt.execute(params![event_id, chain_id, role, position as i64])?;
    }
    Ok(())
}

// =============================================================================
// Read Operations
// =============================================================================

/// Get an event by ID
pub fn get_event(conn: &Connection, id: &str) -> Result<Option<MassBalanceEvent>, LineageError> {
    let sql = format!("SELECT {} FROM mass_balance_events e WHERE e.id = ?", EVENT_COLUMNS);
    let event = conn
        .query_row(&sql, params![id], MassBalanceEvent::from_row)
        .optional()?;

    match event {
        Some(event) => Ok(attach_links(conn, vec![event])?.pop()),
        None => Ok(None),
    }
}

/// Every event in which the chain is parent, child or merge source
pub fn list_for_chain(conn: &Connection, chain_id: &str) -> Result<Vec<MassBalanceEvent>, LineageError> {
    let sql = format!(
        "SELECT {} FROM mass_balance_events e
         WHERE e.parent_chain_id = ?1
            OR e.id IN (SELECT event_id FROM mass_balance_links WHERE chain_id = ?1)
         ORDER BY e.process_date, e.rowid",
        EVENT_COLUMNS
    );
    load(conn, &sql, params![chain_id])
}

/// Events that consumed the chain (it is the parent or a merge source)
pub fn list_consuming(conn: &Connection, chain_id: &str) -> Result<Vec<MassBalanceEvent>, LineageError> {
    let sql = format!(
        "SELECT {} FROM mass_balance_events e
         WHERE e.parent_chain_id = ?1
            OR e.id IN (SELECT event_id FROM mass_balance_links WHERE chain_id = ?1 AND role = 'source')
         ORDER BY e.process_date, e.rowid",
        EVENT_COLUMNS
    );
    load(conn, &sql, params![chain_id])
}

/// Events that produced the chain
pub fn list_producing(conn: &Connection, chain_id: &str) -> Result<Vec<MassBalanceEvent>, LineageError> {
    let sql = format!(
        "SELECT {} FROM mass_balance_events e
         WHERE e.id IN (SELECT event_id FROM mass_balance_links WHERE chain_id = ?1 AND role = 'child')
         ORDER BY e.process_date, e.rowid",
        EVENT_COLUMNS
    );
    load(conn, &sql, params![chain_id])
}

/// Events filtered by facility, type and time window
pub fn list_events(conn: &Connection, query: &MassBalanceQuery) -> Result<Vec<MassBalanceEvent>, LineageError> {
    let mut sql = format!("SELECT {} FROM mass_balance_events e WHERE 1=1", EVENT_COLUMNS);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(facility_id) = &query.facility_id {
        sql.push_str(" AND e.process_location_id = ?");
        params_vec.push(Box::new(facility_id.clone()));
    }

    if let Some(event_type) = query.event_type {
        sql.push_str(" AND e.event_type = ?");
        params_vec.push(Box::new(event_type));
    }

    if let Some(start) = &query.range.start {
        sql.push_str(" AND e.process_date >= ?");
        params_vec.push(Box::new(format_timestamp(start)));
    }

    if let Some(end) = &query.range.end {
        sql.push_str(" AND e.process_date <= ?");
        params_vec.push(Box::new(format_timestamp(end)));
    }

    sql.push_str(" ORDER BY e.process_date, e.rowid");

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    load(conn, &sql, params_refs.as_slice())
}

fn load<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<MassBalanceEvent>, LineageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, MassBalanceEvent::from_row)?;
    let events = rows.collect::<Result<Vec<_>, _>>()?;
    attach_links(conn, events)
}

/// Fill child and source ids from the link table
fn attach_links(
    conn: &Connection,
    mut events: Vec<MassBalanceEvent>,
) -> Result<Vec<MassBalanceEvent>, LineageError> {
    if events.is_empty() {
        return Ok(events);
    }

    let mut stmt = conn.prepare(
        "SELECT chain_id, role FROM mass_balance_links WHERE event_id = ? ORDER BY role, position",
    )?;

    let mut links: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
    for event in &events {
        let rows = stmt.query_map(params![event.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let entry = links.entry(event.id.clone()).or_default();
        for row in rows {
            let (chain_id, role) = row?;
            if role == ROLE_SOURCE {
                entry.1.push(chain_id);
            } else {
                entry.0.push(chain_id);
            }
        }
    }

    for event in &mut events {
        if let Some((children, sources)) = links.remove(&event.id) {
            event.child_chain_ids = children;
            event.source_chain_ids = sources;
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SupplyChainDb;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn split_event(parent: &str, children: &[&str], at: DateTime<Utc>) -> NewMassBalanceEvent {
        NewMassBalanceEvent {
            event_type: MassBalanceEventType::Split,
            parent_chain_id: Some(parent.to_string()),
            child_chain_ids: children.iter().map(|c| c.to_string()).collect(),
            source_chain_ids: Vec::new(),
            input_quantity: dec!(100),
            output_quantity: dec!(100),
            conversion_rate: Some(Decimal::ONE),
            waste_quantity: Decimal::ZERO,
            process_location_id: Some("MILL-1".into()),
            process_date: at,
            notes: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_links_round_trip_in_order() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let created = insert_event(conn, split_event("CHAIN-A", &["S-2", "S-1", "S-3"], Utc::now()))?;
            let loaded = get_event(conn, &created.id)?.unwrap();
            assert_eq!(loaded.child_chain_ids, vec!["S-2", "S-1", "S-3"]);
            assert_eq!(loaded.conversion_rate, Some(Decimal::ONE));
            assert!(loaded.source_chain_ids.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_lookup_by_role() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_event(conn, split_event("CHAIN-A", &["S-1", "S-2"], Utc::now()))?;
            insert_event(conn, NewMassBalanceEvent {
                event_type: MassBalanceEventType::Merge,
                parent_chain_id: None,
                child_chain_ids: vec!["MERGE-1".into()],
                source_chain_ids: vec!["S-1".into(), "S-2".into()],
                ..split_event("unused", &[], Utc::now())
            })?;

            assert_eq!(list_for_chain(conn, "S-1")?.len(), 2);
            assert_eq!(list_producing(conn, "S-1")?.len(), 1);

            let consuming = list_consuming(conn, "S-1")?;
            assert_eq!(consuming.len(), 1);
            assert_eq!(consuming[0].event_type, MassBalanceEventType::Merge);
            assert_eq!(consuming[0].parent_chain_id, None);

            assert_eq!(list_consuming(conn, "CHAIN-A")?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_events_by_facility_and_window() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert_event(conn, split_event("A", &["A1"], now - Duration::days(10)))?;
            insert_event(conn, split_event("B", &["B1"], now - Duration::days(1)))?;
            let mut elsewhere = split_event("C", &["C1"], now);
            elsewhere.process_location_id = Some("MILL-2".into());
            insert_event(conn, elsewhere)?;

            let mill_one = list_events(conn, &MassBalanceQuery {
                facility_id: Some("MILL-1".into()),
                ..Default::default()
            })?;
            assert_eq!(mill_one.len(), 2);

            let recent = list_events(conn, &MassBalanceQuery {
                range: TimeRange::between(now - Duration::days(2), now),
                ..Default::default()
            })?;
            assert_eq!(recent.len(), 2);
            Ok(())
        })
        .unwrap();
    }
}
