//! Integration tests for custody operations and mass-balance validation
//!
//! Each test runs the services against a fresh database, in memory or in a
//! temporary directory.

use std::sync::Arc;

use chrono::NaiveDate;
use custody_lineage::db::custody_chains::{self, ChainQuery, NewCustodyChain};
use custody_lineage::db::entities;
use custody_lineage::db::models::Plot;
use custody_lineage::db::{ChainStatus, CustodyEventType, MassBalanceEventType};
use custody_lineage::lineage::EntityType;
use custody_lineage::services::custody_service::{
    CreateChainInput, MergeChainsInput, SplitChainInput, SplitPart, TransformChainInput,
};
use custody_lineage::services::CustodyNotification;
use custody_lineage::{Config, LineageError, Services, SupplyChainDb};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

fn seed_plot(services: &Services, id: &str) {
    services
        .db
        .with_conn(|conn| {
            entities::insert_plot(conn, &Plot {
                id: id.to_string(),
                name: "Blok C".into(),
                supplier_id: None,
                latitude: Some(1.25),
                longitude: Some(103.6),
                area_hectares: Some(dec!(4)),
                deforestation_risk: "low".into(),
                legality_status: "verified".into(),
                risk_level: "low".into(),
                certifications: vec!["RSPO".into()],
            })
        })
        .unwrap();
}

fn part(quantity: Decimal, destination: &str) -> SplitPart {
    SplitPart {
        quantity,
        destination_facility_id: Some(destination.to_string()),
        quality_grade: None,
    }
}

async fn harvest(services: &Services, plot: &str, quantity: Decimal) -> String {
    services
        .custody
        .create_chain(CreateChainInput {
            source_plot_id: Some(plot.to_string()),
            product_type: "FFB".into(),
            total_quantity: quantity,
            batch_number: Some("HV-2024-17".into()),
            harvest_date: NaiveDate::from_ymd_opt(2024, 6, 3),
            ..Default::default()
        })
        .await
        .unwrap()
        .id
}

/// FFB 1000 -> split 600/400 -> press 600 at 21% -> CPO 126
#[tokio::test]
async fn test_harvest_split_press_scenario() {
    let services = Services::in_memory().unwrap();
    seed_plot(&services, "PLOT-1");

    let c1 = harvest(&services, "PLOT-1", dec!(1000)).await;

    let split = services
        .custody
        .split_chain(SplitChainInput {
            parent_chain_id: c1.clone(),
            splits: vec![part(dec!(600), "MILL-2"), part(dec!(400), "MILL-3")],
            process_location_id: "COLLECT-1".into(),
            notes: None,
        })
        .await
        .unwrap();

    assert_eq!(split.parent_chain.remaining_quantity, Decimal::ZERO);
    assert_eq!(split.parent_chain.status, ChainStatus::Completed);
    let c2 = split.child_chains[0].id.clone();
    let c3 = split.child_chains[1].id.clone();
    assert_eq!(split.child_chains[0].total_quantity, dec!(600));
    assert_eq!(split.child_chains[1].total_quantity, dec!(400));

    let pressed = services
        .custody
        .transform_chain(TransformChainInput {
            source_chain_id: c2.clone(),
            input_quantity: dec!(600),
            conversion_rate: dec!(0.21),
            output_product_type: "CPO".into(),
            destination_facility_id: "REFINERY-1".into(),
            process_location_id: "MILL-2".into(),
            quality_grade: Some("FFA<5%".into()),
            notes: Some("first press".into()),
        })
        .await
        .unwrap();

    let c4 = pressed.transformed_chain.id.clone();
    assert_eq!(pressed.transformed_chain.total_quantity, dec!(126));
    assert_eq!(pressed.transformed_chain.product_type, "CPO");
    assert_eq!(pressed.mass_balance_event.waste_quantity, dec!(474));
    assert_eq!(pressed.source_chain.status, ChainStatus::Completed);

    // Every chain balances
    for chain_id in [&c1, &c2, &c3, &c4] {
        let validation = services.mass_balance.validate_chain(chain_id).await.unwrap();
        assert!(validation.is_valid, "{} should balance: {:?}", chain_id, validation);
    }

    let press_efficiency = services
        .mass_balance
        .get_facility_efficiency("MILL-2", Default::default())
        .await
        .unwrap();
    assert_eq!(press_efficiency.efficiency, Some(dec!(21)));

    // Lineage from the plot reaches the CPO
    let forward = services
        .lineage
        .trace_forward("PLOT-1", EntityType::Plot)
        .await
        .unwrap();
    let keys: Vec<&str> = forward.nodes.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(forward.total_nodes, 5);
    assert!(keys.contains(&format!("custody_chain:{}", c4).as_str()));
    assert!(forward.risk_assessment.compliance.eudr_compliant);
    assert!(forward.risk_assessment.compliance.rspo_compliant);

    let press_edge = forward
        .edges
        .iter()
        .find(|e| e.relationship_type == "transformation")
        .unwrap();
    assert_eq!(press_edge.source, format!("custody_chain:{}", c2));
    assert_eq!(press_edge.quantity, Some(dec!(126)));

    let backward = services
        .lineage
        .trace_backward(&c4, EntityType::CustodyChain)
        .await
        .unwrap();
    let keys: Vec<&str> = backward.nodes.iter().map(|n| n.key.as_str()).collect();
    assert_eq!(keys.len(), 4);
    assert!(keys.contains(&"plot:PLOT-1"));
    assert!(keys.contains(&format!("custody_chain:{}", c1).as_str()));
    assert!(!keys.contains(&format!("custody_chain:{}", c3).as_str()));
}

#[tokio::test]
async fn test_split_conserves_quantity() {
    let services = Services::in_memory().unwrap();
    let parent = harvest(&services, "PLOT-1", dec!(750.5)).await;

    let result = services
        .custody
        .split_chain(SplitChainInput {
            parent_chain_id: parent.clone(),
            splits: vec![
                part(dec!(100.25), "MILL-1"),
                part(dec!(200), "MILL-2"),
                part(dec!(50.25), "MILL-3"),
            ],
            process_location_id: "COLLECT-1".into(),
            notes: None,
        })
        .await
        .unwrap();

    let children: Decimal = result.child_chains.iter().map(|c| c.total_quantity).sum();
    assert_eq!(children + result.parent_chain.remaining_quantity, dec!(750.5));
    assert_eq!(result.mass_balance_event.input_quantity, children);
    assert_eq!(result.mass_balance_event.output_quantity, children);

    let listed = services.custody.list_child_chains(&parent).await.unwrap();
    assert_eq!(listed.len(), 3);

    let active = services
        .custody
        .list_chains(ChainQuery {
            status: Some(ChainStatus::Active),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 4);

    let at_mill = services
        .custody
        .list_chains(ChainQuery {
            facility_id: Some("MILL-2".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(at_mill.len(), 1);
    assert_eq!(at_mill[0].total_quantity, dec!(200));
}

#[tokio::test]
async fn test_merge_then_validate() {
    let services = Services::in_memory().unwrap();
    let a = harvest(&services, "PLOT-1", dec!(300)).await;
    let b = harvest(&services, "PLOT-2", dec!(200)).await;

    let mut notifications = services.events.subscribe();

    let merged = services
        .custody
        .merge_chains(MergeChainsInput {
            parent_chain_ids: vec![a.clone(), b.clone()],
            destination_facility_id: "MILL-1".into(),
            product_type: "FFB".into(),
            process_location_id: "RAMP-1".into(),
            quality_grade: None,
            notes: Some("consolidated at ramp".into()),
        })
        .await
        .unwrap();

    assert_eq!(merged.merged_chain.total_quantity, dec!(500));
    assert_eq!(merged.merged_chain.harvest_date, NaiveDate::from_ymd_opt(2024, 6, 3));
    assert_eq!(merged.mass_balance_event.event_type, MassBalanceEventType::Merge);

    match notifications.recv().await.unwrap() {
        CustodyNotification::ChainsMerged { merged_chain_id, quantity, .. } => {
            assert_eq!(merged_chain_id, merged.merged_chain.id);
            assert_eq!(quantity, dec!(500));
        }
        other => panic!("unexpected notification {:?}", other),
    }

    let history = services
        .custody
        .get_chain_history(&merged.merged_chain.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, CustodyEventType::Aggregation);

    let validation = services.mass_balance.validate_chain(&a).await.unwrap();
    assert!(validation.is_valid);
    assert_eq!(validation.total_input, dec!(500));

    // A completed parent cannot be merged again, and nothing is half-written
    let again = services
        .custody
        .merge_chains(MergeChainsInput {
            parent_chain_ids: vec![merged.merged_chain.id.clone(), a.clone()],
            destination_facility_id: "MILL-1".into(),
            product_type: "FFB".into(),
            process_location_id: "RAMP-1".into(),
            quality_grade: None,
            notes: None,
        })
        .await;
    assert!(matches!(again, Err(LineageError::InvalidInput(_))));
    let still_open = services.custody.get_chain(&merged.merged_chain.id).await.unwrap().unwrap();
    assert_eq!(still_open.remaining_quantity, dec!(500));
    assert_eq!(services.db.stats().unwrap().chain_count, 3);
}

#[tokio::test]
async fn test_transform_overdraw_leaves_source_untouched() {
    let services = Services::in_memory().unwrap();
    let source = harvest(&services, "PLOT-1", dec!(100)).await;

    let err = services
        .custody
        .transform_chain(TransformChainInput {
            source_chain_id: source.clone(),
            input_quantity: dec!(150),
            conversion_rate: dec!(0.2),
            output_product_type: "CPO".into(),
            destination_facility_id: "REFINERY-1".into(),
            process_location_id: "MILL-1".into(),
            quality_grade: None,
            notes: None,
        })
        .await
        .unwrap_err();

    match err {
        LineageError::InsufficientQuantity { requested, available, .. } => {
            assert_eq!(requested, dec!(150));
            assert_eq!(available, dec!(100));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let unchanged = services.custody.get_chain(&source).await.unwrap().unwrap();
    assert_eq!(unchanged.remaining_quantity, dec!(100));
    assert_eq!(services.db.stats().unwrap().mass_balance_event_count, 0);
}

#[test]
fn test_stale_version_is_rejected() {
    let db = SupplyChainDb::open_in_memory().unwrap();
    db.with_transaction(|tx| {
        let chain = custody_chains::insert_chain(tx, &NewCustodyChain {
            id: "CHAIN-CAS".into(),
            product_type: "FFB".into(),
            total_quantity: dec!(10),
            ..Default::default()
        })?;

        let updated = custody_chains::update_remaining(tx, &chain.id, chain.version, dec!(4))?;
        assert_eq!(updated.version, chain.version + 1);

        let stale = custody_chains::update_remaining(tx, &chain.id, chain.version, dec!(0));
        assert!(matches!(stale, Err(LineageError::ConcurrentModification { .. })));
        Ok(())
    })
    .unwrap();
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage_dir = temp.path().to_path_buf();

    let chain_id = {
        let db = Arc::new(SupplyChainDb::open(&config.database_path()).unwrap());
        let services = Services::new(db, &config);
        harvest(&services, "PLOT-9", dec!(42)).await
    };

    let db = Arc::new(SupplyChainDb::open(&config.database_path()).unwrap());
    let services = Services::new(db, &config);
    let chain = services.custody.get_chain(&chain_id).await.unwrap().unwrap();
    assert_eq!(chain.total_quantity, dec!(42));
    assert_eq!(chain.harvest_date, NaiveDate::from_ymd_opt(2024, 6, 3));
}
