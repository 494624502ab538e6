//! Bounded breadth-first walk over the supply-chain graph

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::resolvers::{EntityType, Link, ResolverRegistry};
use crate::config::LineageConfig;
use crate::error::LineageError;

/// Which way to walk from the start entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward export
    Forward,
    /// Toward the plot
    Backward,
}

/// Limits for one traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceOptions {
    /// Nodes at this level are kept but not expanded
    pub max_depth: u32,
    pub max_nodes: usize,
    pub deadline: Option<Duration>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self::from(&LineageConfig::default())
    }
}

impl From<&LineageConfig> for TraceOptions {
    fn from(config: &LineageConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_nodes: config.max_nodes,
            deadline: config.deadline(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageNode {
    /// `type:id`
    pub key: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub name: Option<String>,
    /// Hops from the start entity
    pub level: u32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub risk_level: Option<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    pub deforestation_risk: Option<String>,
    pub legality_status: Option<String>,
    pub entity_data: serde_json::Value,
}

/// Directed edge, always from the upstream entity to the downstream one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    pub quantity: Option<Decimal>,
    pub date: Option<String>,
    pub metadata: serde_json::Value,
}

impl LineageEdge {
    fn between(source: String, target: String, link: &Link) -> Self {
        Self {
            id: format!("{}->{}:{}", source, target, link.relationship),
            source,
            target,
            relationship_type: link.relationship.clone(),
            quantity: link.quantity,
            date: link.date.clone(),
            metadata: link.metadata.clone(),
        }
    }
}

/// Nodes and edges found by one walk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceGraph {
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
    /// Deepest level reached
    pub depth: u32,
    /// A depth, node or time bound stopped the walk early
    pub truncated: bool,
}

/// Walk from `(start_type, start_id)` in `direction`
///
/// A node reached a second time gets its edge recorded but is not expanded
/// again, so cycles and diamonds terminate. Links to entities that no longer
/// resolve are skipped.
pub fn traverse(
    conn: &Connection,
    registry: &ResolverRegistry,
    start_type: EntityType,
    start_id: &str,
    direction: Direction,
    options: &TraceOptions,
) -> Result<TraceGraph, LineageError> {
    let started = Instant::now();

    let start = registry
        .get(start_type)?
        .resolve(conn, start_id)?
        .ok_or_else(|| LineageError::not_found(start_type.as_str(), start_id))?;

    let mut graph = TraceGraph::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut edge_ids: HashSet<String> = HashSet::new();
    let mut frontier: VecDeque<(EntityType, String, u32)> = VecDeque::new();

    let start_key = start_type.key(start_id);
    visited.insert(start_key.clone());
    graph.nodes.push(node(start_key, start_type, start_id, 0, start));
    frontier.push_back((start_type, start_id.to_string(), 0));

    while let Some((entity_type, entity_id, level)) = frontier.pop_front() {
        if let Some(deadline) = options.deadline {
            if started.elapsed() > deadline {
                warn!(start = %start_id, elapsed_ms = started.elapsed().as_millis() as u64, "Lineage trace hit its deadline");
                graph.truncated = true;
                break;
            }
        }

        let resolver = registry.get(entity_type)?;
        let links = match direction {
            Direction::Forward => resolver.downstream(conn, &entity_id)?,
            Direction::Backward => resolver.upstream(conn, &entity_id)?,
        };

        if level >= options.max_depth {
            if !links.is_empty() {
                graph.truncated = true;
            }
            continue;
        }

        let current_key = entity_type.key(&entity_id);

        for link in links {
            let neighbour_key = link.entity_type.key(&link.entity_id);

            if !visited.contains(&neighbour_key) {
                if graph.nodes.len() >= options.max_nodes {
                    graph.truncated = true;
                    continue;
                }

                let Some(resolved) = registry.get(link.entity_type)?.resolve(conn, &link.entity_id)? else {
                    debug!(key = %neighbour_key, "Skipping link to unresolved entity");
                    continue;
                };

                visited.insert(neighbour_key.clone());
                graph.nodes.push(node(
                    neighbour_key.clone(),
                    link.entity_type,
                    &link.entity_id,
                    level + 1,
                    resolved,
                ));
                graph.depth = graph.depth.max(level + 1);
                frontier.push_back((link.entity_type, link.entity_id.clone(), level + 1));
            }

            let edge = match direction {
                Direction::Forward => LineageEdge::between(current_key.clone(), neighbour_key, &link),
                Direction::Backward => LineageEdge::between(neighbour_key, current_key.clone(), &link),
            };
            if edge_ids.insert(edge.id.clone()) {
                graph.edges.push(edge);
            }
        }
    }

    debug!(
        start = %start_type.key(start_id),
        direction = ?direction,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        truncated = graph.truncated,
        "Lineage traversal finished"
    );

    Ok(graph)
}

fn node(
    key: String,
    entity_type: EntityType,
    entity_id: &str,
    level: u32,
    resolved: super::resolvers::ResolvedEntity,
) -> LineageNode {
    LineageNode {
        key,
        entity_id: entity_id.to_string(),
        entity_type,
        name: resolved.name,
        level,
        latitude: resolved.latitude,
        longitude: resolved.longitude,
        risk_level: resolved.risk_level,
        certifications: resolved.certifications,
        deforestation_risk: resolved.deforestation_risk,
        legality_status: resolved.legality_status,
        entity_data: resolved.data,
    }
}
