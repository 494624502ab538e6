//! Custody event storage (append-only)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use super::models::{format_timestamp, BusinessStep, CustodyEvent, CustodyEventType};
use crate::error::LineageError;
use crate::ids;

/// Values for a new custody event
#[derive(Debug, Clone)]
pub struct NewCustodyEvent {
    pub chain_id: String,
    pub event_type: CustodyEventType,
    pub business_step: BusinessStep,
    pub disposition: String,
    pub source_ref: Option<String>,
    pub destination_ref: Option<String>,
    pub quantity: Decimal,
    pub location_id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Append an event
pub fn insert_event(conn: &Connection, event: NewCustodyEvent) -> Result<CustodyEvent, LineageError> {
    let id = ids::event_id();

    conn.execute(
        "INSERT INTO custody_events (id, chain_id, event_type, business_step, disposition,
         source_ref, destination_ref, quantity, location_id, event_time, metadata_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            event.chain_id,
            event.event_type,
            event.business_step,
            event.disposition,
            event.source_ref,
            event.destination_ref,
            event.quantity.to_string(),
            event.location_id,
            format_timestamp(&event.event_time),
            event.metadata,
        ],
    )?;

    Ok(CustodyEvent {
        id,
        chain_id: event.chain_id,
        event_type: event.event_type,
        business_step: event.business_step,
        disposition: event.disposition,
        source_ref: event.source_ref,
        destination_ref: event.destination_ref,
        quantity: event.quantity,
        location_id: event.location_id,
        event_time: event.event_time,
        metadata: event.metadata,
    })
}

/// Events for a chain in event-time order
pub fn list_for_chain(conn: &Connection, chain_id: &str) -> Result<Vec<CustodyEvent>, LineageError> {
    let mut stmt = conn.prepare(
        "SELECT id, chain_id, event_type, business_step, disposition, source_ref,
         destination_ref, quantity, location_id, event_time, metadata_json
         FROM custody_events WHERE chain_id = ? ORDER BY event_time, rowid",
    )?;
    let rows = stmt.query_map(params![chain_id], CustodyEvent::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SupplyChainDb;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn event(chain_id: &str, at: DateTime<Utc>, event_type: CustodyEventType) -> NewCustodyEvent {
        NewCustodyEvent {
            chain_id: chain_id.to_string(),
            event_type,
            business_step: BusinessStep::Processing,
            disposition: "active".into(),
            source_ref: None,
            destination_ref: None,
            quantity: dec!(12.5),
            location_id: Some("MILL-1".into()),
            event_time: at,
            metadata: serde_json::json!({ "operator": "shift-a" }),
        }
    }

    #[test]
    fn test_events_ordered_by_event_time() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        let now = Utc::now();

        db.with_conn(|conn| {
            insert_event(conn, event("CHAIN-A", now, CustodyEventType::Observation))?;
            insert_event(conn, event("CHAIN-A", now - Duration::hours(2), CustodyEventType::Creation))?;
            insert_event(conn, event("CHAIN-B", now, CustodyEventType::Creation))?;

            let events = list_for_chain(conn, "CHAIN-A")?;
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].event_type, CustodyEventType::Creation);
            assert_eq!(events[1].event_type, CustodyEventType::Observation);
            assert_eq!(events[1].quantity, dec!(12.5));
            assert_eq!(events[1].metadata["operator"], "shift-a");
            Ok(())
        })
        .unwrap();
    }
}
