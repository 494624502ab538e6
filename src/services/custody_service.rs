//! Chain-of-custody service - conservation-respecting chain lifecycle
//!
//! Every operation reads, checks and writes inside one SQLite transaction:
//! child chains, parent balance updates, custody events and the paired
//! mass-balance record either all land or none do. Parent balances are
//! updated with a version compare-and-swap.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::custody_chains::{self, ChainQuery, NewCustodyChain};
use crate::db::custody_events::{self, NewCustodyEvent};
use crate::db::mass_balance::{self, NewMassBalanceEvent};
use crate::db::models::dispositions;
use crate::db::{
    BusinessStep, CustodyChain, CustodyEvent, CustodyEventType, MassBalanceEvent,
    MassBalanceEventType, SupplyChainDb,
};
use crate::error::LineageError;
use crate::ids::IdGenerator;

use super::events::{CustodyNotification, EventBus};

// =============================================================================
// Inputs and Results
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChainInput {
    #[serde(default)]
    pub source_plot_id: Option<String>,
    #[serde(default)]
    pub source_facility_id: Option<String>,
    #[serde(default)]
    pub destination_facility_id: Option<String>,
    pub product_type: String,
    pub total_quantity: Decimal,
    #[serde(default)]
    pub quality_grade: Option<String>,
    #[serde(default)]
    pub batch_number: Option<String>,
    #[serde(default)]
    pub harvest_date: Option<NaiveDate>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
}

/// One output of a split
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPart {
    pub quantity: Decimal,
    #[serde(default)]
    pub destination_facility_id: Option<String>,
    /// Overrides the parent's grade when set
    #[serde(default)]
    pub quality_grade: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChainInput {
    pub parent_chain_id: String,
    pub splits: Vec<SplitPart>,
    pub process_location_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeChainsInput {
    pub parent_chain_ids: Vec<String>,
    pub destination_facility_id: String,
    pub product_type: String,
    pub process_location_id: String,
    #[serde(default)]
    pub quality_grade: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformChainInput {
    pub source_chain_id: String,
    pub input_quantity: Decimal,
    pub conversion_rate: Decimal,
    pub output_product_type: String,
    pub destination_facility_id: String,
    pub process_location_id: String,
    #[serde(default)]
    pub quality_grade: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Observation or hand-off recorded against an existing chain
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCustodyEventInput {
    pub chain_id: String,
    pub event_type: CustodyEventType,
    pub business_step: BusinessStep,
    pub disposition: String,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub destination_ref: Option<String>,
    /// Defaults to the chain's remaining quantity
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitResult {
    pub parent_chain: CustodyChain,
    pub child_chains: Vec<CustodyChain>,
    pub mass_balance_event: MassBalanceEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub parent_chains: Vec<CustodyChain>,
    pub merged_chain: CustodyChain,
    pub mass_balance_event: MassBalanceEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResult {
    pub source_chain: CustodyChain,
    pub transformed_chain: CustodyChain,
    pub mass_balance_event: MassBalanceEvent,
}

// =============================================================================
// Service
// =============================================================================

/// Chain-of-custody service
pub struct ChainOfCustodyService {
    db: Arc<SupplyChainDb>,
    ids: Arc<IdGenerator>,
    events: Arc<EventBus>,
}

impl ChainOfCustodyService {
    pub fn new(db: Arc<SupplyChainDb>, ids: Arc<IdGenerator>, events: Arc<EventBus>) -> Self {
        Self { db, ids, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub async fn get_chain(&self, chain_id: &str) -> Result<Option<CustodyChain>, LineageError> {
        let chain_id = chain_id.to_string();
        self.db
            .read(move |conn| custody_chains::get_chain(conn, &chain_id))
            .await
    }

    /// Custody events for a chain in event-time order
    pub async fn get_chain_history(&self, chain_id: &str) -> Result<Vec<CustodyEvent>, LineageError> {
        let chain_id = chain_id.to_string();
        self.db
            .read(move |conn| {
                custody_chains::require_chain(conn, &chain_id)?;
                custody_events::list_for_chain(conn, &chain_id)
            })
            .await
    }

    /// Chains split or transformed out of `chain_id`
    pub async fn list_child_chains(&self, chain_id: &str) -> Result<Vec<CustodyChain>, LineageError> {
        let chain_id = chain_id.to_string();
        self.db
            .read(move |conn| custody_chains::list_children(conn, &chain_id))
            .await
    }

    /// Chains filtered by status, product type or facility, newest first
    pub async fn list_chains(&self, query: ChainQuery) -> Result<Vec<CustodyChain>, LineageError> {
        self.db
            .read(move |conn| custody_chains::list_chains(conn, &query))
            .await
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create a chain at harvest or intake
    pub async fn create_chain(&self, input: CreateChainInput) -> Result<CustodyChain, LineageError> {
        validate_product_type(&input.product_type)?;
        validate_positive("totalQuantity", input.total_quantity)?;

        let ids = Arc::clone(&self.ids);
        let chain = self
            .db
            .write(move |tx| {
                let chain = custody_chains::insert_chain(tx, &NewCustodyChain {
                    id: ids.chain_id(),
                    source_plot_id: input.source_plot_id,
                    source_facility_id: input.source_facility_id,
                    destination_facility_id: input.destination_facility_id,
                    parent_chain_id: None,
                    product_type: input.product_type,
                    total_quantity: input.total_quantity,
                    quality_grade: input.quality_grade,
                    batch_number: input.batch_number,
                    harvest_date: input.harvest_date,
                    expiry_date: input.expiry_date,
                })?;

                custody_events::insert_event(tx, NewCustodyEvent {
                    chain_id: chain.id.clone(),
                    event_type: CustodyEventType::Creation,
                    business_step: BusinessStep::Harvesting,
                    disposition: dispositions::ACTIVE.to_string(),
                    source_ref: chain.source_plot_id.clone(),
                    destination_ref: chain.destination_facility_id.clone(),
                    quantity: chain.total_quantity,
                    location_id: chain
                        .source_facility_id
                        .clone()
                        .or_else(|| chain.source_plot_id.clone()),
                    event_time: Utc::now(),
                    metadata: serde_json::json!({ "batchNumber": chain.batch_number }),
                })?;

                Ok(chain)
            })
            .await?;

        info!(chain = %chain.id, product = %chain.product_type, quantity = %chain.total_quantity, "Created custody chain");

        self.events.emit(CustodyNotification::ChainCreated {
            chain_id: chain.id.clone(),
            product_type: chain.product_type.clone(),
            quantity: chain.total_quantity,
        });

        Ok(chain)
    }

    /// Split part or all of a chain into new child chains
    ///
    /// Splitting is modelled as lossless: the mass-balance record carries a
    /// conversion rate of 1 and zero waste.
    pub async fn split_chain(&self, input: SplitChainInput) -> Result<SplitResult, LineageError> {
        if input.splits.is_empty() {
            return Err(LineageError::InvalidInput("splits must not be empty".into()));
        }
        for (i, split) in input.splits.iter().enumerate() {
            validate_positive(&format!("splits[{}].quantity", i), split.quantity)?;
        }

        let ids = Arc::clone(&self.ids);
        let result = self.db.write(move |tx| split_in_tx(tx, &ids, input)).await?;

        info!(
            parent = %result.parent_chain.id,
            children = result.child_chains.len(),
            remaining = %result.parent_chain.remaining_quantity,
            "Split custody chain"
        );

        self.events.emit(CustodyNotification::ChainSplit {
            parent_chain_id: result.parent_chain.id.clone(),
            child_chain_ids: result.child_chains.iter().map(|c| c.id.clone()).collect(),
            quantity: result.mass_balance_event.input_quantity,
        });

        Ok(result)
    }

    /// Merge the full remaining quantity of several chains into one
    pub async fn merge_chains(&self, input: MergeChainsInput) -> Result<MergeResult, LineageError> {
        if input.parent_chain_ids.is_empty() {
            return Err(LineageError::InvalidInput("parentChainIds must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for id in &input.parent_chain_ids {
            if !seen.insert(id.as_str()) {
                return Err(LineageError::InvalidInput(format!(
                    "chain '{}' is listed more than once",
                    id
                )));
            }
        }
        validate_product_type(&input.product_type)?;

        let ids = Arc::clone(&self.ids);
        let result = self.db.write(move |tx| merge_in_tx(tx, &ids, input)).await?;

        info!(
            merged = %result.merged_chain.id,
            parents = result.parent_chains.len(),
            quantity = %result.merged_chain.total_quantity,
            "Merged custody chains"
        );

        self.events.emit(CustodyNotification::ChainsMerged {
            parent_chain_ids: result.parent_chains.iter().map(|c| c.id.clone()).collect(),
            merged_chain_id: result.merged_chain.id.clone(),
            quantity: result.merged_chain.total_quantity,
        });

        Ok(result)
    }

    /// Convert part of a chain into another product with a conversion loss
    pub async fn transform_chain(&self, input: TransformChainInput) -> Result<TransformResult, LineageError> {
        validate_positive("inputQuantity", input.input_quantity)?;
        if input.conversion_rate <= Decimal::ZERO || input.conversion_rate > Decimal::ONE {
            return Err(LineageError::InvalidInput(format!(
                "conversionRate must be in (0, 1], got {}",
                input.conversion_rate
            )));
        }
        validate_product_type(&input.output_product_type)?;

        let ids = Arc::clone(&self.ids);
        let result = self.db.write(move |tx| transform_in_tx(tx, &ids, input)).await?;

        info!(
            source = %result.source_chain.id,
            output = %result.transformed_chain.id,
            rate = ?result.mass_balance_event.conversion_rate,
            waste = %result.mass_balance_event.waste_quantity,
            "Transformed custody chain"
        );

        self.events.emit(CustodyNotification::ChainTransformed {
            source_chain_id: result.source_chain.id.clone(),
            output_chain_id: result.transformed_chain.id.clone(),
            input_quantity: result.mass_balance_event.input_quantity,
            output_quantity: result.mass_balance_event.output_quantity,
        });

        Ok(result)
    }

    /// Append an observation or transaction event to a chain
    pub async fn record_custody_event(&self, input: RecordCustodyEventInput) -> Result<CustodyEvent, LineageError> {
        // The other types are written by the operations that move quantity
        if !matches!(
            input.event_type,
            CustodyEventType::Observation | CustodyEventType::Transaction
        ) {
            return Err(LineageError::InvalidInput(format!(
                "{} events are recorded by their custody operation",
                input.event_type
            )));
        }
        if input.disposition.trim().is_empty() {
            return Err(LineageError::InvalidInput("disposition is required".into()));
        }

        let event = self
            .db
            .write(move |tx| {
                let chain = custody_chains::require_chain(tx, &input.chain_id)?;

                if input.event_type == CustodyEventType::Transaction {
                    if let Some(destination) = &input.destination_ref {
                        custody_chains::update_destination(tx, &chain.id, destination)?;
                    }
                }

                custody_events::insert_event(tx, NewCustodyEvent {
                    chain_id: chain.id,
                    event_type: input.event_type,
                    business_step: input.business_step,
                    disposition: input.disposition,
                    source_ref: input.source_ref,
                    destination_ref: input.destination_ref,
                    quantity: input.quantity.unwrap_or(chain.remaining_quantity),
                    location_id: input.location_id,
                    event_time: Utc::now(),
                    metadata: input.metadata,
                })
            })
            .await?;

        debug!(chain = %event.chain_id, event_type = %event.event_type, "Recorded custody event");

        self.events.emit(CustodyNotification::CustodyEventRecorded {
            chain_id: event.chain_id.clone(),
            event_id: event.id.clone(),
        });

        Ok(event)
    }
}

// =============================================================================
// Transaction Bodies
// =============================================================================

fn split_in_tx(tx: &Connection, ids: &IdGenerator, input: SplitChainInput) -> Result<SplitResult, LineageError> {
    let parent = custody_chains::require_chain(tx, &input.parent_chain_id)?;

    let total: Decimal = input.splits.iter().map(|s| s.quantity).sum();
    if total > parent.remaining_quantity {
        return Err(LineageError::InsufficientQuantity {
            chain_id: parent.id,
            requested: total,
            available: parent.remaining_quantity,
        });
    }

    let now = Utc::now();
    let mut child_chains = Vec::with_capacity(input.splits.len());

    for split in &input.splits {
        let child = custody_chains::insert_chain(tx, &NewCustodyChain {
            id: ids.split_id(),
            source_plot_id: None,
            source_facility_id: Some(input.process_location_id.clone()),
            destination_facility_id: split.destination_facility_id.clone(),
            parent_chain_id: Some(parent.id.clone()),
            product_type: parent.product_type.clone(),
            total_quantity: split.quantity,
            quality_grade: split.quality_grade.clone().or_else(|| parent.quality_grade.clone()),
            batch_number: parent.batch_number.clone(),
            harvest_date: parent.harvest_date,
            expiry_date: parent.expiry_date,
        })?;

        custody_events::insert_event(tx, NewCustodyEvent {
            chain_id: child.id.clone(),
            event_type: CustodyEventType::Aggregation,
            business_step: BusinessStep::Processing,
            disposition: dispositions::ACTIVE.to_string(),
            source_ref: Some(parent.id.clone()),
            destination_ref: child.destination_facility_id.clone(),
            quantity: child.total_quantity,
            location_id: Some(input.process_location_id.clone()),
            event_time: now,
            metadata: serde_json::json!({ "operation": "split" }),
        })?;

        child_chains.push(child);
    }

    let parent_chain = custody_chains::update_remaining(
        tx,
        &parent.id,
        parent.version,
        parent.remaining_quantity - total,
    )?;

    let mass_balance_event = mass_balance::insert_event(tx, NewMassBalanceEvent {
        event_type: MassBalanceEventType::Split,
        parent_chain_id: Some(parent_chain.id.clone()),
        child_chain_ids: child_chains.iter().map(|c| c.id.clone()).collect(),
        source_chain_ids: Vec::new(),
        input_quantity: total,
        output_quantity: total,
        conversion_rate: Some(Decimal::ONE),
        waste_quantity: Decimal::ZERO,
        process_location_id: Some(input.process_location_id),
        process_date: now,
        notes: input.notes,
        metadata: serde_json::json!({ "splitCount": child_chains.len() }),
    })?;

    Ok(SplitResult {
        parent_chain,
        child_chains,
        mass_balance_event,
    })
}

fn merge_in_tx(tx: &Connection, ids: &IdGenerator, input: MergeChainsInput) -> Result<MergeResult, LineageError> {
    let mut parents = Vec::with_capacity(input.parent_chain_ids.len());
    for id in &input.parent_chain_ids {
        let parent = custody_chains::require_chain(tx, id)?;
        if parent.is_completed() {
            return Err(LineageError::InvalidInput(format!(
                "chain '{}' is already completed and has nothing left to merge",
                parent.id
            )));
        }
        if parent.product_type != input.product_type {
            warn!(
                chain = %parent.id,
                chain_product = %parent.product_type,
                merged_product = %input.product_type,
                "Merging chain with a different product type"
            );
        }
        parents.push(parent);
    }

    let total: Decimal = parents.iter().map(|p| p.remaining_quantity).sum();
    let harvest_date = parents.iter().filter_map(|p| p.harvest_date).min();
    let (merged_id, batch_number) = ids.merge_ids();
    let now = Utc::now();

    let merged_chain = custody_chains::insert_chain(tx, &NewCustodyChain {
        id: merged_id,
        source_plot_id: None,
        source_facility_id: Some(input.process_location_id.clone()),
        destination_facility_id: Some(input.destination_facility_id.clone()),
        parent_chain_id: None,
        product_type: input.product_type.clone(),
        total_quantity: total,
        quality_grade: input.quality_grade.clone(),
        batch_number: Some(batch_number),
        harvest_date,
        expiry_date: None,
    })?;

    let mut parent_chains = Vec::with_capacity(parents.len());
    for parent in parents {
        parent_chains.push(custody_chains::update_remaining(
            tx,
            &parent.id,
            parent.version,
            Decimal::ZERO,
        )?);
    }

    let parent_ids: Vec<String> = parent_chains.iter().map(|p| p.id.clone()).collect();

    custody_events::insert_event(tx, NewCustodyEvent {
        chain_id: merged_chain.id.clone(),
        event_type: CustodyEventType::Aggregation,
        business_step: BusinessStep::Processing,
        disposition: dispositions::ACTIVE.to_string(),
        source_ref: None,
        destination_ref: merged_chain.destination_facility_id.clone(),
        quantity: total,
        location_id: Some(input.process_location_id.clone()),
        event_time: now,
        metadata: serde_json::json!({ "operation": "merge", "parentChainIds": parent_ids }),
    })?;

    let mass_balance_event = mass_balance::insert_event(tx, NewMassBalanceEvent {
        event_type: MassBalanceEventType::Merge,
        parent_chain_id: None,
        child_chain_ids: vec![merged_chain.id.clone()],
        source_chain_ids: parent_ids,
        input_quantity: total,
        output_quantity: total,
        conversion_rate: Some(Decimal::ONE),
        waste_quantity: Decimal::ZERO,
        process_location_id: Some(input.process_location_id),
        process_date: now,
        notes: input.notes,
        metadata: serde_json::Value::Null,
    })?;

    Ok(MergeResult {
        parent_chains,
        merged_chain,
        mass_balance_event,
    })
}

fn transform_in_tx(
    tx: &Connection,
    ids: &IdGenerator,
    input: TransformChainInput,
) -> Result<TransformResult, LineageError> {
    let source = custody_chains::require_chain(tx, &input.source_chain_id)?;

    if input.input_quantity > source.remaining_quantity {
        return Err(LineageError::InsufficientQuantity {
            chain_id: source.id,
            requested: input.input_quantity,
            available: source.remaining_quantity,
        });
    }

    let output_quantity = input.input_quantity * input.conversion_rate;
    let waste_quantity = input.input_quantity - output_quantity;
    let now = Utc::now();

    let transformed_chain = custody_chains::insert_chain(tx, &NewCustodyChain {
        id: ids.transform_id(),
        source_plot_id: None,
        source_facility_id: Some(input.process_location_id.clone()),
        destination_facility_id: Some(input.destination_facility_id.clone()),
        parent_chain_id: Some(source.id.clone()),
        product_type: input.output_product_type.clone(),
        total_quantity: output_quantity,
        quality_grade: input.quality_grade.clone(),
        batch_number: source.batch_number.clone(),
        harvest_date: source.harvest_date,
        expiry_date: None,
    })?;

    let source_chain = custody_chains::update_remaining(
        tx,
        &source.id,
        source.version,
        source.remaining_quantity - input.input_quantity,
    )?;

    custody_events::insert_event(tx, NewCustodyEvent {
        chain_id: transformed_chain.id.clone(),
        event_type: CustodyEventType::Transformation,
        business_step: BusinessStep::Processing,
        disposition: dispositions::ACTIVE.to_string(),
        source_ref: Some(source_chain.id.clone()),
        destination_ref: transformed_chain.destination_facility_id.clone(),
        quantity: output_quantity,
        location_id: Some(input.process_location_id.clone()),
        event_time: now,
        metadata: serde_json::json!({
            "inputProductType": source_chain.product_type,
            "inputQuantity": input.input_quantity,
            "conversionRate": input.conversion_rate,
        }),
    })?;

    let mass_balance_event = mass_balance::insert_event(tx, NewMassBalanceEvent {
        event_type: MassBalanceEventType::Transformation,
        parent_chain_id: Some(source_chain.id.clone()),
        child_chain_ids: vec![transformed_chain.id.clone()],
        source_chain_ids: Vec::new(),
        input_quantity: input.input_quantity,
        output_quantity,
        conversion_rate: Some(input.conversion_rate),
        waste_quantity,
        process_location_id: Some(input.process_location_id),
        process_date: now,
        notes: input.notes,
        metadata: serde_json::json!({
            "inputProductType": source_chain.product_type,
            "outputProductType": input.output_product_type,
        }),
    })?;

    Ok(TransformResult {
        source_chain,
        transformed_chain,
        mass_balance_event,
    })
}

// =============================================================================
// Validation
// =============================================================================

fn validate_positive(field: &str, value: Decimal) -> Result<(), LineageError> {
    if value <= Decimal::ZERO {
        return Err(LineageError::InvalidInput(format!(
            "{} must be greater than zero, got {}",
            field, value
        )));
    }
    Ok(())
}

fn validate_product_type(product_type: &str) -> Result<(), LineageError> {
    if product_type.trim().is_empty() {
        return Err(LineageError::InvalidInput("productType is required".into()));
    }
    Ok(())
}
