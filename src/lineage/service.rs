//! Lineage service - traces, full lineage and persisted reports

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::resolvers::{EntityType, ResolverRegistry};
use super::risk::{assess_risk, RiskAssessment};
use super::traversal::{traverse, Direction, LineageEdge, LineageNode, TraceGraph, TraceOptions};
use crate::db::lineage_reports::{self, NewLineageReport};
use crate::db::{LineageReport, SupplyChainDb};
use crate::error::LineageError;
use crate::ids::IdGenerator;
use crate::services::events::{CustodyNotification, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDirection {
    Forward,
    Backward,
    Full,
}

/// A trace with its risk assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageResult {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub direction: TraceDirection,
    pub depth: u32,
    pub total_nodes: usize,
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
    pub truncated: bool,
    pub risk_assessment: RiskAssessment,
}

impl LineageResult {
    fn from_graph(entity_id: &str, entity_type: EntityType, direction: TraceDirection, graph: TraceGraph) -> Self {
        let risk_assessment = assess_risk(&graph.nodes);
        Self {
            entity_id: entity_id.to_string(),
            entity_type,
            direction,
            depth: graph.depth,
            total_nodes: graph.nodes.len(),
            nodes: graph.nodes,
            edges: graph.edges,
            truncated: graph.truncated,
            risk_assessment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    ForwardTrace,
    BackwardTrace,
    FullLineage,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForwardTrace => "forward_trace",
            Self::BackwardTrace => "backward_trace",
            Self::FullLineage => "full_lineage",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward_trace" => Ok(Self::ForwardTrace),
            "backward_trace" => Ok(Self::BackwardTrace),
            "full_lineage" => Ok(Self::FullLineage),
            other => Err(LineageError::InvalidReportType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReportInput {
    pub report_type: String,
    pub target_entity_id: String,
    pub target_entity_type: String,
    #[serde(default = "default_export_format")]
    pub export_format: String,
    #[serde(default)]
    pub generated_by: Option<String>,
}

fn default_export_format() -> String {
    "json".to_string()
}

pub struct LineageService {
    db: Arc<SupplyChainDb>,
    registry: Arc<ResolverRegistry>,
    ids: Arc<IdGenerator>,
    events: Arc<EventBus>,
    options: TraceOptions,
    export_base_url: String,
}

impl LineageService {
    pub fn new(
        db: Arc<SupplyChainDb>,
        registry: Arc<ResolverRegistry>,
        ids: Arc<IdGenerator>,
        events: Arc<EventBus>,
        options: TraceOptions,
        export_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            ids,
            events,
            options,
            export_base_url: export_base_url.into(),
        }
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    /// Everything downstream of an entity
    pub async fn trace_forward(&self, entity_id: &str, entity_type: EntityType) -> Result<LineageResult, LineageError> {
        self.trace(entity_id, entity_type, Direction::Forward).await
    }

    /// Everything upstream of an entity
    pub async fn trace_backward(&self, entity_id: &str, entity_type: EntityType) -> Result<LineageResult, LineageError> {
        self.trace(entity_id, entity_type, Direction::Backward).await
    }

    async fn trace(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        direction: Direction,
    ) -> Result<LineageResult, LineageError> {
        let registry = Arc::clone(&self.registry);
        let options = self.options;
        let id = entity_id.to_string();
        let graph = self
            .db
            .read(move |conn| traverse(conn, &registry, entity_type, &id, direction, &options))
            .await?;

        let trace_direction = match direction {
            Direction::Forward => TraceDirection::Forward,
            Direction::Backward => TraceDirection::Backward,
        };
        Ok(LineageResult::from_graph(entity_id, entity_type, trace_direction, graph))
    }

    /// Union of the forward and backward traces
    pub async fn get_full_lineage(&self, entity_id: &str, entity_type: EntityType) -> Result<LineageResult, LineageError> {
        let registry = Arc::clone(&self.registry);
        let options = self.options;
        let id = entity_id.to_string();
        let (forward, backward) = self
            .db
            .read(move |conn| {
                let forward = traverse(conn, &registry, entity_type, &id, Direction::Forward, &options)?;
                let backward = traverse(conn, &registry, entity_type, &id, Direction::Backward, &options)?;
                Ok((forward, backward))
            })
            .await?;

        let graph = merge_graphs(forward, backward);
        Ok(LineageResult::from_graph(entity_id, entity_type, TraceDirection::Full, graph))
    }

    /// Trace, persist and return a report
    pub async fn generate_report(&self, input: GenerateReportInput) -> Result<LineageReport, LineageError> {
        let report_type: ReportType = input.report_type.parse()?;
        let entity_type: EntityType = input.target_entity_type.parse()?;

        let result = match report_type {
            ReportType::ForwardTrace => self.trace_forward(&input.target_entity_id, entity_type).await?,
            ReportType::BackwardTrace => self.trace_backward(&input.target_entity_id, entity_type).await?,
            ReportType::FullLineage => self.get_full_lineage(&input.target_entity_id, entity_type).await?,
        };

        let new_report = NewLineageReport {
            id: self.ids.report_id(),
            report_type: report_type.as_str().to_string(),
            target_entity_id: input.target_entity_id,
            target_entity_type: entity_type.as_str().to_string(),
            graph_data: serde_json::json!({
                "nodes": result.nodes,
                "edges": result.edges,
                "riskAssessment": result.risk_assessment,
            }),
            parameters: serde_json::json!({
                "direction": result.direction,
                "maxDepth": self.options.max_depth,
                "maxNodes": self.options.max_nodes,
                "truncated": result.truncated,
            }),
            node_count: result.total_nodes as i64,
            level_count: i64::from(result.depth) + 1,
            export_format: input.export_format,
            generated_by: input.generated_by,
        };

        let report = self
            .db
            .write(move |tx| lineage_reports::insert_report(tx, new_report))
            .await?;
        let report = self.with_export_url(report);

        info!(
            report = %report.id,
            report_type = %report.report_type,
            target = %report.target_entity_id,
            nodes = report.node_count,
            "Generated lineage report"
        );

        self.events.emit(CustodyNotification::LineageReportGenerated {
            report_id: report.id.clone(),
            report_type: report.report_type.clone(),
            target_entity_id: report.target_entity_id.clone(),
        });

        Ok(report)
    }

    pub async fn get_report(&self, report_id: &str) -> Result<Option<LineageReport>, LineageError> {
        let id = report_id.to_string();
        let report = self
            .db
            .read(move |conn| lineage_reports::get_report(conn, &id))
            .await?;
        Ok(report.map(|r| self.with_export_url(r)))
    }

    /// Newest first
    pub async fn list_reports(
        &self,
        target_entity_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LineageReport>, LineageError> {
        let target = target_entity_id.map(str::to_string);
        let reports = self
            .db
            .read(move |conn| lineage_reports::list_reports(conn, target.as_deref(), limit))
            .await?;
        Ok(reports.into_iter().map(|r| self.with_export_url(r)).collect())
    }

    fn with_export_url(&self, mut report: LineageReport) -> LineageReport {
        report.export_url = Some(export_url(&self.export_base_url, &report.id, &report.export_format));
        report
    }
}

pub fn export_url(base: &str, report_id: &str, format: &str) -> String {
    format!("{}/{}/export?format={}", base.trim_end_matches('/'), report_id, format)
}

/// Union by node key and edge id; the second graph wins on collisions
fn merge_graphs(first: TraceGraph, second: TraceGraph) -> TraceGraph {
    let mut nodes: BTreeMap<String, LineageNode> = BTreeMap::new();
    let mut edges: BTreeMap<String, LineageEdge> = BTreeMap::new();

    for node in first.nodes.into_iter().chain(second.nodes) {
        nodes.insert(node.key.clone(), node);
    }
    for edge in first.edges.into_iter().chain(second.edges) {
        edges.insert(edge.id.clone(), edge);
    }

    TraceGraph {
        nodes: nodes.into_values().collect(),
        edges: edges.into_values().collect(),
        depth: first.depth.max(second.depth),
        truncated: first.truncated || second.truncated,
    }
}
