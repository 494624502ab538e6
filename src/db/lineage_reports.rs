//! Lineage report storage
//!
//! Reports are immutable snapshots; a re-trace inserts a new row.

use rusqlite::{params, Connection, OptionalExtension};

use super::models::{current_timestamp, LineageReport};
use crate::error::LineageError;

const REPORT_COLUMNS: &str = "id, report_type, target_entity_id, target_entity_type,
    graph_data_json, parameters_json, node_count, level_count, export_format, status,
    generated_by, created_at";

/// Values for a new report
#[derive(Debug, Clone)]
pub struct NewLineageReport {
    pub id: String,
    pub report_type: String,
    pub target_entity_id: String,
    pub target_entity_type: String,
    pub graph_data: serde_json::Value,
    pub parameters: serde_json::Value,
    pub node_count: i64,
    pub level_count: i64,
    pub export_format: String,
    pub generated_by: Option<String>,
}

/// Insert a completed report
pub fn insert_report(conn: &Connection, report: NewLineageReport) -> Result<LineageReport, LineageError> {
    conn.execute(
        "INSERT INTO lineage_reports (id, report_type, target_entity_id, target_entity_type,
         graph_data_json, parameters_json, node_count, level_count, export_format, status,
         generated_by, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?, ?)",
        params![
            report.id,
            report.report_type,
            report.target_entity_id,
            report.target_entity_type,
            report.graph_data,
            report.parameters,
            report.node_count,
            report.level_count,
            report.export_format,
            report.generated_by,
            current_timestamp(),
        ],
    )?;

    get_report(conn, &report.id)?
        .ok_or_else(|| LineageError::Internal("Failed to retrieve created report".to_string()))
}

/// Get a report by ID
pub fn get_report(conn: &Connection, id: &str) -> Result<Option<LineageReport>, LineageError> {
    let sql = format!("SELECT {} FROM lineage_reports WHERE id = ?", REPORT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], LineageReport::from_row).optional()?)
}

/// Reports newest first, optionally for one target entity
pub fn list_reports(
    conn: &Connection,
    target_entity_id: Option<&str>,
    limit: i64,
) -> Result<Vec<LineageReport>, LineageError> {
    let sql = format!(
        "SELECT {} FROM lineage_reports
         WHERE (?1 IS NULL OR target_entity_id = ?1)
         ORDER BY created_at DESC, id DESC LIMIT ?2",
        REPORT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![target_entity_id, limit], LineageReport::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SupplyChainDb;

    fn report(id: &str, target: &str) -> NewLineageReport {
        NewLineageReport {
            id: id.to_string(),
            report_type: "forward_trace".into(),
            target_entity_id: target.to_string(),
            target_entity_type: "plot".into(),
            graph_data: serde_json::json!({ "nodes": [], "edges": [] }),
            parameters: serde_json::json!({ "maxDepth": 8 }),
            node_count: 1,
            level_count: 1,
            export_format: "json".into(),
            generated_by: Some("auditor@mill".into()),
        }
    }

    #[test]
    fn test_insert_and_list_reports() {
        let db = SupplyChainDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let saved = insert_report(conn, report("LIN-1", "PLOT-1"))?;
            assert_eq!(saved.status, "completed");
            assert_eq!(saved.parameters["maxDepth"], 8);
            assert!(saved.export_url.is_none());

            insert_report(conn, report("LIN-2", "PLOT-2"))?;

            assert_eq!(list_reports(conn, None, 10)?.len(), 2);
            let for_plot = list_reports(conn, Some("PLOT-2"), 10)?;
            assert_eq!(for_plot.len(), 1);
            assert_eq!(for_plot[0].id, "LIN-2");
            Ok(())
        })
        .unwrap();
    }
}
