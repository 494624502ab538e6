//! Mass-balance validation, efficiency and anomaly detection
//!
//! Nothing in here blocks an operation. Conservation problems come back as
//! `discrepancies` and statistical outliers as `anomalies` for a reviewer to
//! look at.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MassBalanceConfig;
use crate::db::custody_chains;
use crate::db::mass_balance::{self, MassBalanceQuery, NewMassBalanceEvent, TimeRange};
use crate::db::{MassBalanceEvent, MassBalanceEventType, SupplyChainDb};
use crate::error::LineageError;

use super::events::{CustodyNotification, EventBus};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    MassBalance,
    ConversionRate,
}

/// A conservation check that did not hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    #[serde(rename = "type")]
    pub discrepancy_type: DiscrepancyType,
    /// Set for per-event rate checks
    pub event_id: Option<String>,
    pub expected: Decimal,
    pub actual: Decimal,
    pub variance: Decimal,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub chain_id: String,
    pub is_valid: bool,
    pub total_input: Decimal,
    pub total_output: Decimal,
    pub total_waste: Decimal,
    /// Output as a percentage of input; `None` when nothing went in
    pub efficiency: Option<Decimal>,
    pub discrepancies: Vec<Discrepancy>,
}

/// Caller-supplied mass-balance record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMassBalanceInput {
    pub event_type: MassBalanceEventType,
    #[serde(default)]
    pub parent_chain_id: Option<String>,
    #[serde(default)]
    pub child_chain_ids: Vec<String>,
    #[serde(default)]
    pub source_chain_ids: Vec<String>,
    pub input_quantity: Decimal,
    pub output_quantity: Decimal,
    #[serde(default)]
    pub conversion_rate: Option<Decimal>,
    /// Defaults to `input - output`
    #[serde(default)]
    pub waste_quantity: Option<Decimal>,
    #[serde(default)]
    pub process_location_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyReport {
    /// Chain or facility id the report covers
    pub scope_id: String,
    pub total_input: Decimal,
    pub total_output: Decimal,
    pub total_waste: Decimal,
    /// Aggregate output over aggregate input, as a percentage
    pub efficiency: Option<Decimal>,
    /// Mean of per-event efficiencies, skipping zero-input events
    pub average_efficiency: Option<Decimal>,
    pub event_count: usize,
    pub events_by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    ConversionRateAnomaly,
    QuantityAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// Candidate for human review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub event_id: String,
    pub event_type: MassBalanceEventType,
    pub value: Decimal,
    /// Group mean for rates, overall average for quantities
    pub expected: Decimal,
    /// Standard score; only for rate anomalies
    pub z_score: Option<Decimal>,
    pub message: String,
}

// =============================================================================
// Service
// =============================================================================

pub struct MassBalanceService {
    db: Arc<SupplyChainDb>,
    events: Arc<EventBus>,
    config: MassBalanceConfig,
}

impl MassBalanceService {
    pub fn new(db: Arc<SupplyChainDb>, events: Arc<EventBus>, config: MassBalanceConfig) -> Self {
        Self { db, events, config }
    }

    /// Check conservation across every event the chain takes part in
    pub async fn validate_chain(&self, chain_id: &str) -> Result<ValidationResult, LineageError> {
        let id = chain_id.to_string();
        let events = self
            .db
            .read(move |conn| {
                custody_chains::require_chain(conn, &id)?;
                mass_balance::list_for_chain(conn, &id)
            })
            .await?;

        let result = validate_events(chain_id, &events, self.config.tolerance);

        if result.is_valid {
            debug!(chain = %chain_id, events = events.len(), "Mass balance holds");
        } else {
            info!(
                chain = %chain_id,
                discrepancies = result.discrepancies.len(),
                "Mass balance discrepancies found"
            );
        }

        Ok(result)
    }

    /// Store an externally reported mass-balance event
    ///
    /// A recorded output that disagrees with `input * rate` is logged, not
    /// rejected.
    pub async fn record_event(&self, input: RecordMassBalanceInput) -> Result<MassBalanceEvent, LineageError> {
        if input.input_quantity < Decimal::ZERO || input.output_quantity < Decimal::ZERO {
            return Err(LineageError::InvalidInput("quantities must not be negative".into()));
        }

        if let Some(rate) = input.conversion_rate {
            let expected = input.input_quantity.checked_mul(rate).ok_or_else(|| {
                LineageError::InvalidInput(format!(
                    "input {} x rate {} is out of range",
                    input.input_quantity, rate
                ))
            })?;
            let deviation = (input.output_quantity - expected).abs();
            if exceeds_tolerance(deviation, expected, self.config.tolerance) {
                warn!(
                    event_type = %input.event_type,
                    expected = %expected,
                    actual = %input.output_quantity,
                    "Recorded output deviates from conversion rate"
                );
            }
        }

        let waste_quantity = input
            .waste_quantity
            .unwrap_or(input.input_quantity - input.output_quantity);

        let event = self
            .db
            .write(move |tx| {
                mass_balance::insert_event(tx, NewMassBalanceEvent {
                    event_type: input.event_type,
                    parent_chain_id: input.parent_chain_id,
                    child_chain_ids: input.child_chain_ids,
                    source_chain_ids: input.source_chain_ids,
                    input_quantity: input.input_quantity,
                    output_quantity: input.output_quantity,
                    conversion_rate: input.conversion_rate,
                    waste_quantity,
                    process_location_id: input.process_location_id,
                    process_date: Utc::now(),
                    notes: input.notes,
                    metadata: input.metadata,
                })
            })
            .await?;

        self.events.emit(CustodyNotification::MassBalanceRecorded {
            event_id: event.id.clone(),
            event_type: event.event_type.as_str().to_string(),
        });

        Ok(event)
    }

    pub async fn get_chain_efficiency(
        &self,
        chain_id: &str,
        range: TimeRange,
    ) -> Result<EfficiencyReport, LineageError> {
        let id = chain_id.to_string();
        let events = self
            .db
            .read(move |conn| {
                custody_chains::require_chain(conn, &id)?;
                mass_balance::list_for_chain(conn, &id)
            })
            .await?;

        let in_range: Vec<MassBalanceEvent> = events
            .into_iter()
            .filter(|e| within(&range, e))
            .collect();

        Ok(efficiency_report(chain_id, &in_range))
    }

    pub async fn get_facility_efficiency(
        &self,
        facility_id: &str,
        range: TimeRange,
    ) -> Result<EfficiencyReport, LineageError> {
        let query = MassBalanceQuery {
            facility_id: Some(facility_id.to_string()),
            event_type: None,
            range,
        };
        let events = self
            .db
            .read(move |conn| mass_balance::list_events(conn, &query))
            .await?;

        Ok(efficiency_report(facility_id, &events))
    }

    /// Statistical outliers in conversion rate and input quantity
    pub async fn detect_anomalies(
        &self,
        facility_id: Option<&str>,
        range: TimeRange,
    ) -> Result<Vec<Anomaly>, LineageError> {
        let query = MassBalanceQuery {
            facility_id: facility_id.map(str::to_string),
            event_type: None,
            range,
        };
        let events = self
            .db
            .read(move |conn| mass_balance::list_events(conn, &query))
            .await?;

        let anomalies = find_anomalies(&events, &self.config);
        info!(
            facility = ?facility_id,
            events = events.len(),
            anomalies = anomalies.len(),
            "Anomaly scan complete"
        );
        Ok(anomalies)
    }
}

fn within(range: &TimeRange, event: &MassBalanceEvent) -> bool {
    range.start.map_or(true, |start| event.process_date >= start)
        && range.end.map_or(true, |end| event.process_date <= end)
}

// =============================================================================
// Analysis
// =============================================================================

/// `None` for zero input or a ratio outside the decimal range
fn efficiency_pct(output: Decimal, input: Decimal) -> Option<Decimal> {
    if input.is_zero() {
        return None;
    }
    output
        .checked_div(input)
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .map(|pct| pct.round_dp(4))
}

/// Sum that clamps at the decimal bounds instead of panicking
fn total<I: IntoIterator<Item = Decimal>>(values: I) -> Decimal {
    values
        .into_iter()
        .fold(Decimal::ZERO, |acc, value| acc.saturating_add(value))
}

fn exceeds_tolerance(deviation: Decimal, expected: Decimal, tolerance: Decimal) -> bool {
    expected
        .checked_mul(tolerance)
        .map_or(false, |allowed| deviation > allowed)
}

/// Totals and conservation checks over a set of events
pub fn validate_events(chain_id: &str, events: &[MassBalanceEvent], tolerance: Decimal) -> ValidationResult {
    let total_input = total(events.iter().map(|e| e.input_quantity));
    let total_output = total(events.iter().map(|e| e.output_quantity));
    let total_waste = total(events.iter().map(|e| e.waste_quantity));

    let mut discrepancies = Vec::new();

    let accounted = total_output.saturating_add(total_waste);
    let variance = total_input.saturating_sub(accounted).abs();
    let out_of_balance = if total_input.is_zero() {
        !accounted.is_zero()
    } else {
        variance.checked_div(total_input).map_or(true, |ratio| ratio > tolerance)
    };
    if out_of_balance {
        discrepancies.push(Discrepancy {
            discrepancy_type: DiscrepancyType::MassBalance,
            event_id: None,
            expected: total_input,
            actual: accounted,
            variance,
            message: format!(
                "input {} does not match output {} plus waste {}",
                total_input, total_output, total_waste
            ),
        });
    }

    for event in events {
        let Some(rate) = event.conversion_rate else {
            continue;
        };
        let Some(expected) = event.input_quantity.checked_mul(rate) else {
            discrepancies.push(Discrepancy {
                discrepancy_type: DiscrepancyType::ConversionRate,
                event_id: Some(event.id.clone()),
                expected: Decimal::MAX,
                actual: event.output_quantity,
                variance: Decimal::MAX,
                message: format!(
                    "{} event input {} x rate {} is out of range",
                    event.event_type, event.input_quantity, rate
                ),
            });
            continue;
        };
        let deviation = event.output_quantity.saturating_sub(expected).abs();
        if exceeds_tolerance(deviation, expected, tolerance) {
            discrepancies.push(Discrepancy {
                discrepancy_type: DiscrepancyType::ConversionRate,
                event_id: Some(event.id.clone()),
                expected,
                actual: event.output_quantity,
                variance: deviation,
                message: format!(
                    "{} event output {} differs from {} x {}",
                    event.event_type, event.output_quantity, event.input_quantity, rate
                ),
            });
        }
    }

    ValidationResult {
        chain_id: chain_id.to_string(),
        is_valid: discrepancies.is_empty(),
        total_input,
        total_output,
        total_waste,
        efficiency: efficiency_pct(total_output, total_input),
        discrepancies,
    }
}

pub fn efficiency_report(scope_id: &str, events: &[MassBalanceEvent]) -> EfficiencyReport {
    let total_input = total(events.iter().map(|e| e.input_quantity));
    let total_output = total(events.iter().map(|e| e.output_quantity));
    let total_waste = total(events.iter().map(|e| e.waste_quantity));

    let per_event: Vec<Decimal> = events
        .iter()
        .filter_map(|e| efficiency_pct(e.output_quantity, e.input_quantity))
        .collect();
    let average_efficiency = if per_event.is_empty() {
        None
    } else {
        let n = Decimal::from(per_event.len());
        Some(total(per_event.iter().map(|pct| pct / n)).round_dp(4))
    };

    let mut events_by_type = BTreeMap::new();
    for event in events {
        *events_by_type
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
    }

    EfficiencyReport {
        scope_id: scope_id.to_string(),
        total_input,
        total_output,
        total_waste,
        efficiency: efficiency_pct(total_output, total_input),
        average_efficiency,
        event_count: events.len(),
        events_by_type,
    }
}

/// Rate outliers per event type plus oversized inputs
pub fn find_anomalies(events: &[MassBalanceEvent], config: &MassBalanceConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let mut groups: BTreeMap<MassBalanceEventType, Vec<(&MassBalanceEvent, Decimal)>> = BTreeMap::new();
    for event in events {
        if let Some(rate) = event.conversion_rate {
            groups.entry(event.event_type).or_default().push((event, rate));
        }
    }

    for (event_type, members) in &groups {
        let n = Decimal::from(members.len());
        // Dividing first keeps the mean inside the decimal range
        let mean = total(members.iter().map(|(_, r)| *r / n));
        let squared = |rate: Decimal| rate.checked_sub(mean).and_then(|d| d.checked_mul(d));
        let variance = members.iter().try_fold(Decimal::ZERO, |acc, (_, r)| {
            squared(*r).and_then(|sq| acc.checked_add(sq / n))
        });

        let Some(variance) = variance else {
            // Spread too wide to measure: every rate that cannot be squared
            // against the mean is an outlier by any standard
            for (event, rate) in members {
                if squared(*rate).is_none() {
                    anomalies.push(Anomaly {
                        anomaly_type: AnomalyType::ConversionRateAnomaly,
                        severity: Severity::High,
                        event_id: event.id.clone(),
                        event_type: *event_type,
                        value: *rate,
                        expected: mean.round_dp(6),
                        z_score: None,
                        message: format!(
                            "conversion rate {} is beyond measurable range of the {} mean",
                            rate, event_type
                        ),
                    });
                }
            }
            continue;
        };

        let std_dev = match variance.sqrt() {
            Some(s) if !s.is_zero() => s,
            _ => continue,
        };

        for (event, rate) in members {
            let z = ((*rate - mean) / std_dev).abs();
            let severity = if z > config.high_sigma {
                Severity::High
            } else if z > config.medium_sigma {
                Severity::Medium
            } else {
                continue;
            };

            anomalies.push(Anomaly {
                anomaly_type: AnomalyType::ConversionRateAnomaly,
                severity,
                event_id: event.id.clone(),
                event_type: *event_type,
                value: *rate,
                expected: mean.round_dp(6),
                z_score: Some(z.round_dp(4)),
                message: format!(
                    "conversion rate {} is {} standard deviations from the {} mean",
                    rate,
                    z.round_dp(2),
                    event_type
                ),
            });
        }
    }

    if !events.is_empty() {
        let n = Decimal::from(events.len());
        let average = total(events.iter().map(|e| e.input_quantity / n));
        let threshold = average.checked_mul(config.quantity_factor).unwrap_or(Decimal::MAX);
        for event in events {
            if event.input_quantity > threshold {
                anomalies.push(Anomaly {
                    anomaly_type: AnomalyType::QuantityAnomaly,
                    severity: Severity::Medium,
                    event_id: event.id.clone(),
                    event_type: event.event_type,
                    value: event.input_quantity,
                    expected: average.round_dp(6),
                    z_score: None,
                    message: format!(
                        "input {} exceeds {} x the average input",
                        event.input_quantity, config.quantity_factor
                    ),
                });
            }
        }
    }

    anomalies
}
