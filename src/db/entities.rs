//! Supply-chain entity reads and seeding inserts
//!
//! Plots, suppliers, facilities, deliveries, production lots and shipments
//! are owned by the surrounding compliance application. The lineage engine
//! only needs point lookups and the foreign-key joins that link one stage
//! to the next; inserts exist for imports and fixtures.

use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::models::{
    get_decimal, get_opt_decimal, get_string_list, Delivery, Facility, Plot, ProductionLot,
    Shipment, Supplier,
};
use crate::error::LineageError;

/// An entity reached through an association table, with the linked quantity
pub type Linked<T> = (T, Option<Decimal>);

fn certifications_json(certifications: &[String]) -> Result<Option<String>, LineageError> {
    if certifications.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(certifications)?))
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn supplier_from_row(row: &Row<'_>) -> rusqlite::Result<Supplier> {
    Ok(Supplier {
        id: row.get(0)?,
        name: row.get(1)?,
        supplier_type: row.get(2)?,
        legality_status: row.get(3)?,
        risk_level: row.get(4)?,
        certifications: get_string_list(row, 5)?,
    })
}

fn facility_from_row(row: &Row<'_>) -> rusqlite::Result<Facility> {
    Ok(Facility {
        id: row.get(0)?,
        name: row.get(1)?,
        facility_type: row.get(2)?,
        supplier_id: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        legality_status: row.get(6)?,
        risk_level: row.get(7)?,
        certifications: get_string_list(row, 8)?,
    })
}

fn plot_from_row(row: &Row<'_>) -> rusqlite::Result<Plot> {
    Ok(Plot {
        id: row.get(0)?,
        name: row.get(1)?,
        supplier_id: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        area_hectares: get_opt_decimal(row, 5)?,
        deforestation_risk: row.get(6)?,
        legality_status: row.get(7)?,
        risk_level: row.get(8)?,
        certifications: get_string_list(row, 9)?,
    })
}

fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        id: row.get(0)?,
        plot_id: row.get(1)?,
        facility_id: row.get(2)?,
        quantity: get_decimal(row, 3)?,
        delivery_date: row.get(4)?,
    })
}

fn lot_from_row(row: &Row<'_>) -> rusqlite::Result<ProductionLot> {
    Ok(ProductionLot {
        id: row.get(0)?,
        facility_id: row.get(1)?,
        product_type: row.get(2)?,
        quantity: get_decimal(row, 3)?,
        production_date: row.get(4)?,
    })
}

fn shipment_from_row(row: &Row<'_>) -> rusqlite::Result<Shipment> {
    Ok(Shipment {
        id: row.get(0)?,
        origin_facility_id: row.get(1)?,
        destination: row.get(2)?,
        destination_country: row.get(3)?,
        quantity: get_decimal(row, 4)?,
        shipment_date: row.get(5)?,
        status: row.get(6)?,
    })
}

const SUPPLIER_COLUMNS: &str =
    "s.id, s.name, s.supplier_type, s.legality_status, s.risk_level, s.certifications_json";
const FACILITY_COLUMNS: &str = "f.id, f.name, f.facility_type, f.supplier_id, f.latitude,
    f.longitude, f.legality_status, f.risk_level, f.certifications_json";
const PLOT_COLUMNS: &str = "p.id, p.name, p.supplier_id, p.latitude, p.longitude,
    p.area_hectares, p.deforestation_risk, p.legality_status, p.risk_level, p.certifications_json";
const DELIVERY_COLUMNS: &str = "d.id, d.plot_id, d.facility_id, d.quantity, d.delivery_date";
const LOT_COLUMNS: &str = "l.id, l.facility_id, l.product_type, l.quantity, l.production_date";
const SHIPMENT_COLUMNS: &str = "sh.id, sh.origin_facility_id, sh.destination,
    sh.destination_country, sh.quantity, sh.shipment_date, sh.status";

// =============================================================================
// Point Lookups
// =============================================================================

pub fn get_supplier(conn: &Connection, id: &str) -> Result<Option<Supplier>, LineageError> {
    let sql = format!("SELECT {} FROM suppliers s WHERE s.id = ?", SUPPLIER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], supplier_from_row).optional()?)
}

pub fn get_facility(conn: &Connection, id: &str) -> Result<Option<Facility>, LineageError> {
    let sql = format!("SELECT {} FROM facilities f WHERE f.id = ?", FACILITY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], facility_from_row).optional()?)
}

pub fn get_plot(conn: &Connection, id: &str) -> Result<Option<Plot>, LineageError> {
    let sql = format!("SELECT {} FROM plots p WHERE p.id = ?", PLOT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], plot_from_row).optional()?)
}

pub fn get_delivery(conn: &Connection, id: &str) -> Result<Option<Delivery>, LineageError> {
    let sql = format!("SELECT {} FROM deliveries d WHERE d.id = ?", DELIVERY_COLUMNS);
    Ok(conn.query_row(&sql, params![id], delivery_from_row).optional()?)
}

pub fn get_production_lot(conn: &Connection, id: &str) -> Result<Option<ProductionLot>, LineageError> {
    let sql = format!("SELECT {} FROM production_lots l WHERE l.id = ?", LOT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], lot_from_row).optional()?)
}

pub fn get_shipment(conn: &Connection, id: &str) -> Result<Option<Shipment>, LineageError> {
    let sql = format!("SELECT {} FROM shipments sh WHERE sh.id = ?", SHIPMENT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], shipment_from_row).optional()?)
}

// =============================================================================
// Joins
// =============================================================================

pub fn plots_for_supplier(conn: &Connection, supplier_id: &str) -> Result<Vec<Plot>, LineageError> {
    let sql = format!("SELECT {} FROM plots p WHERE p.supplier_id = ? ORDER BY p.id", PLOT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![supplier_id], plot_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn facilities_for_supplier(conn: &Connection, supplier_id: &str) -> Result<Vec<Facility>, LineageError> {
    let sql = format!(
        "SELECT {} FROM facilities f WHERE f.supplier_id = ? ORDER BY f.id",
        FACILITY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![supplier_id], facility_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn deliveries_for_plot(conn: &Connection, plot_id: &str) -> Result<Vec<Delivery>, LineageError> {
    let sql = format!(
        "SELECT {} FROM deliveries d WHERE d.plot_id = ? ORDER BY d.delivery_date, d.id",
        DELIVERY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![plot_id], delivery_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Deliveries received at a facility
pub fn deliveries_to_facility(conn: &Connection, facility_id: &str) -> Result<Vec<Delivery>, LineageError> {
    let sql = format!(
        "SELECT {} FROM deliveries d WHERE d.facility_id = ? ORDER BY d.delivery_date, d.id",
        DELIVERY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![facility_id], delivery_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn lots_at_facility(conn: &Connection, facility_id: &str) -> Result<Vec<ProductionLot>, LineageError> {
    let sql = format!(
        "SELECT {} FROM production_lots l WHERE l.facility_id = ? ORDER BY l.production_date, l.id",
        LOT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![facility_id], lot_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Shipments that left from a facility
pub fn shipments_from_facility(conn: &Connection, facility_id: &str) -> Result<Vec<Shipment>, LineageError> {
    let sql = format!(
        "SELECT {} FROM shipments sh WHERE sh.origin_facility_id = ? ORDER BY sh.shipment_date, sh.id",
        SHIPMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![facility_id], shipment_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Production lots a delivery was milled into
pub fn lots_for_delivery(conn: &Connection, delivery_id: &str) -> Result<Vec<Linked<ProductionLot>>, LineageError> {
    let sql = format!(
        "SELECT {}, ld.quantity FROM lot_deliveries ld
         JOIN production_lots l ON l.id = ld.lot_id
         WHERE ld.delivery_id = ? ORDER BY l.production_date, l.id",
        LOT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![delivery_id], |row| {
        Ok((lot_from_row(row)?, get_opt_decimal(row, 5)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Deliveries that fed a production lot
pub fn deliveries_for_lot(conn: &Connection, lot_id: &str) -> Result<Vec<Linked<Delivery>>, LineageError> {
    let sql = format!(
        "SELECT {}, ld.quantity FROM lot_deliveries ld
         JOIN deliveries d ON d.id = ld.delivery_id
         WHERE ld.lot_id = ? ORDER BY d.delivery_date, d.id",
        DELIVERY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![lot_id], |row| {
        Ok((delivery_from_row(row)?, get_opt_decimal(row, 5)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Shipments a production lot was exported in
pub fn shipments_for_lot(conn: &Connection, lot_id: &str) -> Result<Vec<Linked<Shipment>>, LineageError> {
    let sql = format!(
        "SELECT {}, sl.quantity FROM shipment_lots sl
         JOIN shipments sh ON sh.id = sl.shipment_id
         WHERE sl.lot_id = ? ORDER BY sh.shipment_date, sh.id",
        SHIPMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![lot_id], |row| {
        Ok((shipment_from_row(row)?, get_opt_decimal(row, 7)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Production lots loaded onto a shipment
pub fn lots_for_shipment(conn: &Connection, shipment_id: &str) -> Result<Vec<Linked<ProductionLot>>, LineageError> {
    let sql = format!(
        "SELECT {}, sl.quantity FROM shipment_lots sl
         JOIN production_lots l ON l.id = sl.lot_id
         WHERE sl.shipment_id = ? ORDER BY l.production_date, l.id",
        LOT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![shipment_id], |row| {
        Ok((lot_from_row(row)?, get_opt_decimal(row, 5)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// =============================================================================
// Inserts (imports and fixtures)
// =============================================================================

pub fn insert_supplier(conn: &Connection, supplier: &Supplier) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO suppliers (id, name, supplier_type, legality_status, risk_level, certifications_json)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            supplier.id,
            supplier.name,
            supplier.supplier_type,
            supplier.legality_status,
            supplier.risk_level,
            certifications_json(&supplier.certifications)?,
        ],
    )?;
    Ok(())
}

pub fn insert_facility(conn: &Connection, facility: &Facility) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO facilities (id, name, facility_type, supplier_id, latitude, longitude,
         legality_status, risk_level, certifications_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            facility.id,
            facility.name,
            facility.facility_type,
            facility.supplier_id,
            facility.latitude,
            facility.longitude,
            facility.legality_status,
            facility.risk_level,
            certifications_json(&facility.certifications)?,
        ],
    )?;
    Ok(())
}

pub fn insert_plot(conn: &Connection, plot: &Plot) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO plots (id, name, supplier_id, latitude, longitude, area_hectares,
         deforestation_risk, legality_status, risk_level, certifications_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            plot.id,
            plot.name,
            plot.supplier_id,
            plot.latitude,
            plot.longitude,
            plot.area_hectares.map(|a| a.to_string()),
            plot.deforestation_risk,
            plot.legality_status,
            plot.risk_level,
            certifications_json(&plot.certifications)?,
        ],
    )?;
    Ok(())
}

pub fn insert_delivery(conn: &Connection, delivery: &Delivery) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO deliveries (id, plot_id, facility_id, quantity, delivery_date)
         VALUES (?, ?, ?, ?, ?)",
        params![
            delivery.id,
            delivery.plot_id,
            delivery.facility_id,
            delivery.quantity.to_string(),
            delivery.delivery_date,
        ],
    )?;
    Ok(())
}

pub fn insert_production_lot(conn: &Connection, lot: &ProductionLot) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO production_lots (id, facility_id, product_type, quantity, production_date)
         VALUES (?, ?, ?, ?, ?)",
        params![
            lot.id,
            lot.facility_id,
            lot.product_type,
            lot.quantity.to_string(),
            lot.production_date,
        ],
    )?;
    Ok(())
}

pub fn insert_shipment(conn: &Connection, shipment: &Shipment) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO shipments (id, origin_facility_id, destination, destination_country,
         quantity, shipment_date, status)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            shipment.id,
            shipment.origin_facility_id,
            shipment.destination,
            shipment.destination_country,
            shipment.quantity.to_string(),
            shipment.shipment_date,
            shipment.status,
        ],
    )?;
    Ok(())
}

pub fn link_lot_delivery(
    conn: &Connection,
    lot_id: &str,
    delivery_id: &str,
    quantity: Option<Decimal>,
) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO lot_deliveries (lot_id, delivery_id, quantity) VALUES (?, ?, ?)",
        params![lot_id, delivery_id, quantity.map(|q| q.to_string())],
    )?;
    Ok(())
}

pub fn link_shipment_lot(
    conn: &Connection,
    shipment_id: &str,
    lot_id: &str,
    quantity: Option<Decimal>,
) -> Result<(), LineageError> {
    conn.execute(
        "INSERT INTO shipment_lots (shipment_id, lot_id, quantity) VALUES (?, ?, ?)",
        params![shipment_id, lot_id, quantity.map(|q| q.to_string())],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SupplyChainDb;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_plot_to_shipment_joins() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        db.with_conn(|conn| {
            insert_plot(conn, &Plot {
                id: "PLOT-1".into(),
                name: "Blok A".into(),
                supplier_id: None,
                latitude: Some(-0.5),
                longitude: Some(101.4),
                area_hectares: Some(dec!(2.75)),
                deforestation_risk: "low".into(),
                legality_status: "verified".into(),
                risk_level: "low".into(),
                certifications: vec!["RSPO".into(), "ISPO".into()],
            })?;
            insert_delivery(conn, &Delivery {
                id: "DEL-1".into(),
                plot_id: "PLOT-1".into(),
                facility_id: "MILL-1".into(),
                quantity: dec!(5.2),
                delivery_date: day,
            })?;
            insert_production_lot(conn, &ProductionLot {
                id: "LOT-1".into(),
                facility_id: "MILL-1".into(),
                product_type: "CPO".into(),
                quantity: dec!(1.1),
                production_date: day,
            })?;
            link_lot_delivery(conn, "LOT-1", "DEL-1", Some(dec!(5.2)))?;
            insert_shipment(conn, &Shipment {
                id: "SHP-1".into(),
                origin_facility_id: "MILL-1".into(),
                destination: "Rotterdam".into(),
                destination_country: Some("NL".into()),
                quantity: dec!(1.1),
                shipment_date: day,
                status: "shipped".into(),
            })?;
            link_shipment_lot(conn, "SHP-1", "LOT-1", None)?;

            let plot = get_plot(conn, "PLOT-1")?.unwrap();
            assert_eq!(plot.certifications, vec!["RSPO", "ISPO"]);
            assert_eq!(plot.area_hectares, Some(dec!(2.75)));

            assert_eq!(deliveries_for_plot(conn, "PLOT-1")?.len(), 1);

            let lots = lots_for_delivery(conn, "DEL-1")?;
            assert_eq!(lots.len(), 1);
            assert_eq!(lots[0].1, Some(dec!(5.2)));
            assert_eq!(deliveries_for_lot(conn, "LOT-1")?[0].0.id, "DEL-1");

            let shipments = shipments_for_lot(conn, "LOT-1")?;
            assert_eq!(shipments[0].0.destination_country.as_deref(), Some("NL"));
            assert_eq!(shipments[0].1, None);
            assert_eq!(lots_for_shipment(conn, "SHP-1")?[0].0.id, "LOT-1");

            assert_eq!(deliveries_to_facility(conn, "MILL-1")?[0].id, "DEL-1");
            assert_eq!(lots_at_facility(conn, "MILL-1")?[0].id, "LOT-1");
            assert_eq!(shipments_from_facility(conn, "MILL-1")?[0].id, "SHP-1");
            assert!(shipments_from_facility(conn, "MILL-2")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
