//! Integration tests for lineage traces over seeded supply-chain entities
//!
//! Fixture: supplier S1 owns plot P1 and operates MILL-1. Plot P1 delivers
//! DEL-1 to MILL-1, which goes into LOT-1, which is exported as SHP-1 from
//! MILL-1.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use custody_lineage::db::entities;
use custody_lineage::db::models::{Delivery, Facility, Plot, ProductionLot, Shipment, Supplier};
use custody_lineage::lineage::{EntityType, GenerateReportInput, LineageResult, RiskLevel};
use custody_lineage::{Config, LineageError, Services, SupplyChainDb};
use rust_decimal_macros::dec;

fn seed(services: &Services, deforestation_risk: &str) {
    let day = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
    services
        .db
        .with_transaction(|tx| {
            entities::insert_supplier(tx, &Supplier {
                id: "S1".into(),
                name: "Koperasi Tani Makmur".into(),
                supplier_type: "cooperative".into(),
                legality_status: "verified".into(),
                risk_level: "low".into(),
                certifications: vec!["RSPO".into()],
            })?;
            entities::insert_facility(tx, &Facility {
                id: "MILL-1".into(),
                name: "Pabrik Kelapa Sawit Riau".into(),
                facility_type: "mill".into(),
                supplier_id: Some("S1".into()),
                latitude: Some(0.51),
                longitude: Some(101.45),
                legality_status: "verified".into(),
                risk_level: "low".into(),
                certifications: Vec::new(),
            })?;
            entities::insert_plot(tx, &Plot {
                id: "P1".into(),
                name: "Blok A-12".into(),
                supplier_id: Some("S1".into()),
                latitude: Some(0.62),
                longitude: Some(101.3),
                area_hectares: Some(dec!(3.5)),
                deforestation_risk: deforestation_risk.to_string(),
                legality_status: "verified".into(),
                risk_level: "low".into(),
                certifications: Vec::new(),
            })?;
            entities::insert_delivery(tx, &Delivery {
                id: "DEL-1".into(),
                plot_id: "P1".into(),
                facility_id: "MILL-1".into(),
                quantity: dec!(12.4),
                delivery_date: day,
            })?;
            entities::insert_production_lot(tx, &ProductionLot {
                id: "LOT-1".into(),
                facility_id: "MILL-1".into(),
                product_type: "CPO".into(),
                quantity: dec!(2.6),
                production_date: day,
            })?;
            entities::link_lot_delivery(tx, "LOT-1", "DEL-1", Some(dec!(12.4)))?;
            entities::insert_shipment(tx, &Shipment {
                id: "SHP-1".into(),
                origin_facility_id: "MILL-1".into(),
                destination: "Rotterdam".into(),
                destination_country: Some("NL".into()),
                quantity: dec!(2.6),
                shipment_date: day,
                status: "shipped".into(),
            })?;
            entities::link_shipment_lot(tx, "SHP-1", "LOT-1", Some(dec!(2.6)))?;
            Ok(())
        })
        .unwrap();
}

fn node_keys(result: &LineageResult) -> BTreeSet<String> {
    result.nodes.iter().map(|n| n.key.clone()).collect()
}

fn edge_pairs(result: &LineageResult) -> BTreeSet<(String, String, String)> {
    result
        .edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone(), e.relationship_type.clone()))
        .collect()
}

fn pair(source: &str, target: &str, relationship: &str) -> (String, String, String) {
    (source.to_string(), target.to_string(), relationship.to_string())
}

#[tokio::test]
async fn test_forward_from_supplier_reaches_shipment() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let result = services.lineage.trace_forward("S1", EntityType::Supplier).await.unwrap();

    assert_eq!(result.total_nodes, 6);
    assert_eq!(result.edges.len(), 8);
    assert!(!result.truncated);
    assert_eq!(result.depth, 2);

    let edges = edge_pairs(&result);
    assert!(edges.contains(&pair("supplier:S1", "plot:P1", "supplies_plot")));
    assert!(edges.contains(&pair("supplier:S1", "facility:MILL-1", "operates_facility")));
    assert!(edges.contains(&pair("plot:P1", "delivery:DEL-1", "harvest_delivery")));
    assert!(edges.contains(&pair("delivery:DEL-1", "production_lot:LOT-1", "production_input")));
    assert!(edges.contains(&pair("production_lot:LOT-1", "shipment:SHP-1", "export_shipment")));
    assert!(edges.contains(&pair("delivery:DEL-1", "facility:MILL-1", "delivered_to")));
    assert!(edges.contains(&pair("facility:MILL-1", "production_lot:LOT-1", "produced_at")));
    assert!(edges.contains(&pair("facility:MILL-1", "shipment:SHP-1", "shipped_from")));

    // Shortest route runs through the mill
    let shipment = result.nodes.iter().find(|n| n.key == "shipment:SHP-1").unwrap();
    assert_eq!(shipment.level, 2);
    assert_eq!(shipment.entity_data["destinationCountry"], "NL");
}

#[tokio::test]
async fn test_backward_from_shipment_points_edges_downstream() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let result = services.lineage.trace_backward("SHP-1", EntityType::Shipment).await.unwrap();

    assert_eq!(result.total_nodes, 6);
    assert_eq!(result.depth, 3);

    let edges = edge_pairs(&result);
    assert_eq!(edges.len(), 8);
    assert!(edges.contains(&pair("production_lot:LOT-1", "shipment:SHP-1", "export_shipment")));
    assert!(edges.contains(&pair("facility:MILL-1", "shipment:SHP-1", "shipped_from")));
    assert!(edges.contains(&pair("facility:MILL-1", "production_lot:LOT-1", "produced_at")));
    assert!(edges.contains(&pair("delivery:DEL-1", "facility:MILL-1", "delivered_to")));
    // Reached twice: recorded, not re-expanded
    assert!(edges.contains(&pair("supplier:S1", "plot:P1", "supplies_plot")));
    assert!(edges.contains(&pair("supplier:S1", "facility:MILL-1", "operates_facility")));

    let lot_edge = result
        .edges
        .iter()
        .find(|e| e.relationship_type == "export_shipment")
        .unwrap();
    assert_eq!(lot_edge.quantity, Some(dec!(2.6)));
}

#[tokio::test]
async fn test_trace_is_repeatable() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let first = services.lineage.trace_forward("P1", EntityType::Plot).await.unwrap();
    let second = services.lineage.trace_forward("P1", EntityType::Plot).await.unwrap();

    assert_eq!(node_keys(&first), node_keys(&second));
    assert_eq!(edge_pairs(&first), edge_pairs(&second));
}

#[tokio::test]
async fn test_mill_traces_agree_in_both_directions() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let forward = services.lineage.trace_forward("MILL-1", EntityType::Facility).await.unwrap();
    let keys = node_keys(&forward);
    assert!(keys.contains("production_lot:LOT-1"));
    assert!(keys.contains("shipment:SHP-1"));

    // Every edge the backward walk from the lot saw between the mill and
    // its outputs is also found walking forward from the mill
    let backward = services
        .lineage
        .trace_backward("LOT-1", EntityType::ProductionLot)
        .await
        .unwrap();
    let forward_edges = edge_pairs(&forward);
    for edge in edge_pairs(&backward) {
        if edge.0 == "facility:MILL-1" {
            assert!(forward_edges.contains(&edge), "missing forward edge {:?}", edge);
        }
    }
    assert!(!edge_pairs(&backward)
        .iter()
        .any(|(source, target, _)| source == "facility:MILL-1" && target == "delivery:DEL-1"));
}

#[tokio::test]
async fn test_full_lineage_unions_both_directions() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let result = services
        .lineage
        .get_full_lineage("LOT-1", EntityType::ProductionLot)
        .await
        .unwrap();

    let keys = node_keys(&result);
    assert_eq!(keys.len(), 6);
    assert!(keys.contains("shipment:SHP-1"));
    assert!(keys.contains("supplier:S1"));
    assert_eq!(result.edges.len(), 7);
    assert_eq!(result.depth, 2);
}

#[tokio::test]
async fn test_risk_reflects_plot_deforestation() {
    let services = Services::in_memory().unwrap();
    seed(&services, "high");

    let result = services.lineage.trace_forward("S1", EntityType::Supplier).await.unwrap();
    let assessment = &result.risk_assessment;

    assert_eq!(assessment.overall_risk, RiskLevel::Low);
    assert!(!assessment.compliance.eudr_compliant);
    assert!(assessment.compliance.rspo_compliant);
    assert_eq!(assessment.risk_factors.len(), 1);
    assert_eq!(assessment.risk_factors[0].node_key, "plot:P1");
}

#[tokio::test]
async fn test_depth_limit_truncates() {
    let mut config = Config::default();
    config.lineage.max_depth = 1;
    let db = Arc::new(SupplyChainDb::open_in_memory().unwrap());
    let services = Services::new(db, &config);
    seed(&services, "low");

    let result = services.lineage.trace_forward("S1", EntityType::Supplier).await.unwrap();
    assert!(result.truncated);
    assert_eq!(result.total_nodes, 3);
    assert_eq!(result.depth, 1);
}

#[tokio::test]
async fn test_unknown_start_entity() {
    let services = Services::in_memory().unwrap();
    let err = services
        .lineage
        .trace_backward("SHP-404", EntityType::Shipment)
        .await
        .unwrap_err();
    assert!(matches!(err, LineageError::NotFound { .. }));
}

#[tokio::test]
async fn test_generate_and_fetch_report() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let report = services
        .lineage
        .generate_report(GenerateReportInput {
            report_type: "forward_trace".into(),
            target_entity_id: "P1".into(),
            target_entity_type: "plot".into(),
            export_format: "csv".into(),
            generated_by: Some("dds-officer".into()),
        })
        .await
        .unwrap();

    assert!(report.id.starts_with("LIN-"));
    assert_eq!(report.report_type, "forward_trace");
    assert_eq!(report.node_count, 5);
    assert_eq!(report.level_count, 4);
    assert_eq!(report.graph_data["nodes"].as_array().unwrap().len(), 5);
    assert_eq!(
        report.export_url.as_deref(),
        Some(format!("/api/lineage/reports/{}/export?format=csv", report.id).as_str())
    );

    let fetched = services.lineage.get_report(&report.id).await.unwrap().unwrap();
    assert_eq!(fetched.graph_data, report.graph_data);
    assert_eq!(fetched.export_url, report.export_url);

    let listed = services.lineage.list_reports(Some("P1"), 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(services.lineage.list_reports(Some("P2"), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_report_rejects_bad_types() {
    let services = Services::in_memory().unwrap();
    seed(&services, "low");

    let bad_report = services
        .lineage
        .generate_report(GenerateReportInput {
            report_type: "weekly_digest".into(),
            target_entity_id: "P1".into(),
            target_entity_type: "plot".into(),
            export_format: "json".into(),
            generated_by: None,
        })
        .await;
    assert!(matches!(bad_report, Err(LineageError::InvalidReportType(_))));

    let bad_entity = services
        .lineage
        .generate_report(GenerateReportInput {
            report_type: "full_lineage".into(),
            target_entity_id: "P1".into(),
            target_entity_type: "warehouse".into(),
            export_format: "json".into(),
            generated_by: None,
        })
        .await;
    assert!(matches!(bad_entity, Err(LineageError::InvalidInput(_))));

    assert_eq!(services.db.stats().unwrap().report_count, 0);
}
