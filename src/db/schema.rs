//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::LineageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LineageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LineageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LineageError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), LineageError> {
    conn.execute_batch(ENTITY_SCHEMA)
        .map_err(|e| LineageError::Internal(format!("Failed to create entity tables: {}", e)))?;

    conn.execute_batch(CUSTODY_SCHEMA)
        .map_err(|e| LineageError::Internal(format!("Failed to create custody tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LineageError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Supply-chain entities the lineage engine joins across
const ENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS suppliers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    supplier_type TEXT NOT NULL DEFAULT 'smallholder',
    legality_status TEXT NOT NULL DEFAULT 'verified',
    risk_level TEXT NOT NULL DEFAULT 'low',
    certifications_json TEXT
);

CREATE TABLE IF NOT EXISTS facilities (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    facility_type TEXT NOT NULL DEFAULT 'mill',
    supplier_id TEXT REFERENCES suppliers(id),
    latitude REAL,
    longitude REAL,
    legality_status TEXT NOT NULL DEFAULT 'verified',
    risk_level TEXT NOT NULL DEFAULT 'low',
    certifications_json TEXT
);

CREATE TABLE IF NOT EXISTS plots (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    supplier_id TEXT REFERENCES suppliers(id),
    latitude REAL,
    longitude REAL,
    area_hectares TEXT,
    deforestation_risk TEXT NOT NULL DEFAULT 'low',
    legality_status TEXT NOT NULL DEFAULT 'verified',
    risk_level TEXT NOT NULL DEFAULT 'low',
    certifications_json TEXT
);

CREATE TABLE IF NOT EXISTS deliveries (
    id TEXT PRIMARY KEY NOT NULL,
    plot_id TEXT NOT NULL REFERENCES plots(id),
    facility_id TEXT NOT NULL REFERENCES facilities(id),
    quantity TEXT NOT NULL,
    delivery_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS production_lots (
    id TEXT PRIMARY KEY NOT NULL,
    facility_id TEXT NOT NULL REFERENCES facilities(id),
    product_type TEXT NOT NULL,
    quantity TEXT NOT NULL,
    production_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lot_deliveries (
    lot_id TEXT NOT NULL REFERENCES production_lots(id),
    delivery_id TEXT NOT NULL REFERENCES deliveries(id),
    quantity TEXT,
    PRIMARY KEY (lot_id, delivery_id)
);

CREATE TABLE IF NOT EXISTS shipments (
    id TEXT PRIMARY KEY NOT NULL,
    origin_facility_id TEXT NOT NULL REFERENCES facilities(id),
    destination TEXT NOT NULL,
    destination_country TEXT,
    quantity TEXT NOT NULL,
    shipment_date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'planned'
);

CREATE TABLE IF NOT EXISTS shipment_lots (
    shipment_id TEXT NOT NULL REFERENCES shipments(id),
    lot_id TEXT NOT NULL REFERENCES production_lots(id),
    quantity TEXT,
    PRIMARY KEY (shipment_id, lot_id)
);
"#;

/// Custody chains, their events, and lineage reports
const CUSTODY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS custody_chains (
    id TEXT PRIMARY KEY NOT NULL,
    source_plot_id TEXT,
    source_facility_id TEXT,
    destination_facility_id TEXT,
    parent_chain_id TEXT REFERENCES custody_chains(id),
    product_type TEXT NOT NULL,
    total_quantity TEXT NOT NULL,
    remaining_quantity TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    quality_grade TEXT,
    batch_number TEXT,
    harvest_date TEXT,
    expiry_date TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS custody_events (
    id TEXT PRIMARY KEY NOT NULL,
    chain_id TEXT NOT NULL REFERENCES custody_chains(id),
    event_type TEXT NOT NULL,
    business_step TEXT NOT NULL,
    disposition TEXT NOT NULL,
    source_ref TEXT,
    destination_ref TEXT,
    quantity TEXT NOT NULL,
    location_id TEXT,
    event_time TEXT NOT NULL,
    metadata_json TEXT
);

CREATE TABLE IF NOT EXISTS mass_balance_events (
    id TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    parent_chain_id TEXT,
    input_quantity TEXT NOT NULL,
    output_quantity TEXT NOT NULL,
    conversion_rate TEXT,
    waste_quantity TEXT NOT NULL,
    process_location_id TEXT,
    process_date TEXT NOT NULL,
    notes TEXT,
    metadata_json TEXT
);

-- Chain roles within a mass-balance event: 'child' outputs and 'source' merge inputs
CREATE TABLE IF NOT EXISTS mass_balance_links (
    event_id TEXT NOT NULL REFERENCES mass_balance_events(id),
    chain_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('child', 'source')),
    position INTEGER NOT NULL,
    PRIMARY KEY (event_id, chain_id, role)
);

CREATE TABLE IF NOT EXISTS lineage_reports (
    id TEXT PRIMARY KEY NOT NULL,
    report_type TEXT NOT NULL,
    target_entity_id TEXT NOT NULL,
    target_entity_type TEXT NOT NULL,
    graph_data_json TEXT NOT NULL,
    parameters_json TEXT,
    node_count INTEGER NOT NULL,
    level_count INTEGER NOT NULL,
    export_format TEXT NOT NULL DEFAULT 'json',
    status TEXT NOT NULL DEFAULT 'completed',
    generated_by TEXT,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_plots_supplier ON plots(supplier_id);
CREATE INDEX IF NOT EXISTS idx_facilities_supplier ON facilities(supplier_id);
CREATE INDEX IF NOT EXISTS idx_deliveries_plot ON deliveries(plot_id);
CREATE INDEX IF NOT EXISTS idx_lot_deliveries_delivery ON lot_deliveries(delivery_id);
CREATE INDEX IF NOT EXISTS idx_shipment_lots_lot ON shipment_lots(lot_id);
CREATE INDEX IF NOT EXISTS idx_chains_parent ON custody_chains(parent_chain_id);
CREATE INDEX IF NOT EXISTS idx_chains_source_plot ON custody_chains(source_plot_id);
CREATE INDEX IF NOT EXISTS idx_chains_source_facility ON custody_chains(source_facility_id);
CREATE INDEX IF NOT EXISTS idx_custody_events_chain ON custody_events(chain_id, event_time);
CREATE INDEX IF NOT EXISTS idx_mb_parent ON mass_balance_events(parent_chain_id);
CREATE INDEX IF NOT EXISTS idx_mb_location ON mass_balance_events(process_location_id, process_date);
CREATE INDEX IF NOT EXISTS idx_mb_links_chain ON mass_balance_links(chain_id, role);
CREATE INDEX IF NOT EXISTS idx_reports_target ON lineage_reports(target_entity_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('custody_chains', 'custody_events', 'mass_balance_events', 'lineage_reports')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
