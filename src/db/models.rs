//! Row models for the custody database
//!
//! SQLite has no decimal type, so quantities are stored as TEXT and parsed
//! back into `Decimal`. Timestamps are fixed-width RFC 3339 strings so that
//! lexical comparison in SQL matches chronological order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Column Helpers
// ============================================================================

/// Render a timestamp for a TEXT column
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC timestamp for TEXT columns
pub fn current_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub(crate) fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Decimal::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

pub(crate) fn get_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn get_string_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(Vec::new()),
    }
}

/// Implements TEXT round-tripping for a string-backed enum
macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::from_str(text).map_err(|e| FromSqlError::Other(e.into()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle state of a custody chain
///
/// `Completed` is terminal and is reached exactly when the remaining
/// quantity hits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    Completed,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    /// Status implied by a remaining quantity
    pub fn for_remaining(remaining: Decimal) -> Self {
        if remaining.is_zero() {
            Self::Completed
        } else {
            Self::Active
        }
    }
}

impl FromStr for ChainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown chain status '{}'", other)),
        }
    }
}

text_enum_sql!(ChainStatus);

/// EPCIS event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodyEventType {
    Creation,
    Aggregation,
    Transformation,
    Observation,
    Transaction,
}

impl CustodyEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::Aggregation => "aggregation",
            Self::Transformation => "transformation",
            Self::Observation => "observation",
            Self::Transaction => "transaction",
        }
    }
}

impl FromStr for CustodyEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creation" => Ok(Self::Creation),
            "aggregation" => Ok(Self::Aggregation),
            "transformation" => Ok(Self::Transformation),
            "observation" => Ok(Self::Observation),
            "transaction" => Ok(Self::Transaction),
            other => Err(format!("unknown custody event type '{}'", other)),
        }
    }
}

text_enum_sql!(CustodyEventType);

/// EPCIS business step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStep {
    Harvesting,
    Processing,
    Shipping,
    Receiving,
}

impl BusinessStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Harvesting => "harvesting",
            Self::Processing => "processing",
            Self::Shipping => "shipping",
            Self::Receiving => "receiving",
        }
    }
}

impl FromStr for BusinessStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "harvesting" => Ok(Self::Harvesting),
            "processing" => Ok(Self::Processing),
            "shipping" => Ok(Self::Shipping),
            "receiving" => Ok(Self::Receiving),
            other => Err(format!("unknown business step '{}'", other)),
        }
    }
}

text_enum_sql!(BusinessStep);

/// Conservation-relevant operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MassBalanceEventType {
    Split,
    Merge,
    Transformation,
}

impl MassBalanceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Merge => "merge",
            Self::Transformation => "transformation",
        }
    }
}

impl FromStr for MassBalanceEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "split" => Ok(Self::Split),
            "merge" => Ok(Self::Merge),
            "transformation" => Ok(Self::Transformation),
            other => Err(format!("unknown mass balance event type '{}'", other)),
        }
    }
}

text_enum_sql!(MassBalanceEventType);

/// Dispositions recorded on custody events
pub mod dispositions {
    pub const ACTIVE: &str = "active";
    pub const IN_TRANSIT: &str = "in_transit";
}

// ============================================================================
// Custody Models
// ============================================================================

/// A traceable quantity of one product type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodyChain {
    pub id: String,
    pub source_plot_id: Option<String>,
    pub source_facility_id: Option<String>,
    pub destination_facility_id: Option<String>,
    pub parent_chain_id: Option<String>,
    pub product_type: String,
    pub total_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub status: ChainStatus,
    pub quality_grade: Option<String>,
    pub batch_number: Option<String>,
    pub harvest_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl CustodyChain {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_plot_id: row.get(1)?,
            source_facility_id: row.get(2)?,
            destination_facility_id: row.get(3)?,
            parent_chain_id: row.get(4)?,
            product_type: row.get(5)?,
            total_quantity: get_decimal(row, 6)?,
            remaining_quantity: get_decimal(row, 7)?,
            status: row.get(8)?,
            quality_grade: row.get(9)?,
            batch_number: row.get(10)?,
            harvest_date: row.get(11)?,
            expiry_date: row.get(12)?,
            version: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChainStatus::Completed
    }
}

/// Immutable EPCIS-style record of something happening to a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodyEvent {
    pub id: String,
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

impl CustodyEvent {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chain_id: row.get(1)?,
            event_type: row.get(2)?,
            business_step: row.get(3)?,
            disposition: row.get(4)?,
            source_ref: row.get(5)?,
            destination_ref: row.get(6)?,
            quantity: get_decimal(row, 7)?,
            location_id: row.get(8)?,
            event_time: get_timestamp(row, 9)?,
            metadata: row
                .get::<_, Option<serde_json::Value>>(10)?
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// One split, merge or transformation with its conserved quantities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MassBalanceEvent {
    pub id: String,
    pub event_type: MassBalanceEventType,
    /// Null for merges, which have several parents
    pub parent_chain_id: Option<String>,
    pub child_chain_ids: Vec<String>,
    /// Chains consumed by a merge
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

impl MassBalanceEvent {
    /// Columns: id, event_type, parent_chain_id, input, output, rate, waste,
    /// location, process_date, notes, metadata. Child and source ids are
    /// loaded separately from the link table.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            parent_chain_id: row.get(2)?,
            child_chain_ids: Vec::new(),
            source_chain_ids: Vec::new(),
            input_quantity: get_decimal(row, 3)?,
            output_quantity: get_decimal(row, 4)?,
            conversion_rate: get_opt_decimal(row, 5)?,
            waste_quantity: get_decimal(row, 6)?,
            process_location_id: row.get(7)?,
            process_date: get_timestamp(row, 8)?,
            notes: row.get(9)?,
            metadata: row
                .get::<_, Option<serde_json::Value>>(10)?
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Persisted snapshot of a lineage trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageReport {
    pub id: String,
    pub report_type: String,
    pub target_entity_id: String,
    pub target_entity_type: String,
    pub graph_data: serde_json::Value,
    pub parameters: serde_json::Value,
    pub node_count: i64,
    pub level_count: i64,
    pub export_format: String,
    pub status: String,
    pub generated_by: Option<String>,
    pub created_at: String,
    /// Derived on return, never stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_url: Option<String>,
}

impl LineageReport {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            report_type: row.get(1)?,
            target_entity_id: row.get(2)?,
            target_entity_type: row.get(3)?,
            graph_data: row.get(4)?,
            parameters: row
                .get::<_, Option<serde_json::Value>>(5)?
                .unwrap_or(serde_json::Value::Null),
            node_count: row.get(6)?,
            level_count: row.get(7)?,
            export_format: row.get(8)?,
            status: row.get(9)?,
            generated_by: row.get(10)?,
            created_at: row.get(11)?,
            export_url: None,
        })
    }
}

// ============================================================================
// Supply-Chain Entity Models (read by the lineage engine)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub id: String,
    pub name: String,
    pub supplier_type: String,
    pub legality_status: String,
    pub risk_level: String,
    #[serde(default)]
    pub certifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    pub id: String,
    pub name: String,
    pub facility_type: String,
    pub supplier_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub legality_status: String,
    pub risk_level: String,
    #[serde(default)]
    pub certifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plot {
    pub id: String,
    pub name: String,
    pub supplier_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub area_hectares: Option<Decimal>,
    pub deforestation_risk: String,
    pub legality_status: String,
    pub risk_level: String,
    #[serde(default)]
    pub certifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: String,
    pub plot_id: String,
    pub facility_id: String,
    pub quantity: Decimal,
    pub delivery_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionLot {
    pub id: String,
    pub facility_id: String,
    pub product_type: String,
    pub quantity: Decimal,
    pub production_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    pub id: String,
    pub origin_facility_id: String,
    pub destination: String,
    pub destination_country: Option<String>,
    pub quantity: Decimal,
    pub shipment_date: NaiveDate,
    pub status: String,
}
