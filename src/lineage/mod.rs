//! Supply-chain lineage engine
//!
//! Walks plot → delivery → production lot → shipment and custody chain →
//! mass-balance event → child chain relationships in either direction, then
//! scores the nodes it found for deforestation and legality risk.
//!
//! - [`resolvers`] - one resolver per traceable entity type
//! - [`traversal`] - bounded breadth-first walk
//! - [`risk`] - pure risk and compliance assessment
//! - [`service`] - async traces and persisted reports

pub mod resolvers;
pub mod risk;
pub mod service;
pub mod traversal;

pub use resolvers::{EntityResolver, EntityType, Link, ResolvedEntity, ResolverRegistry};
pub use risk::{assess_risk, RiskAssessment, RiskFactor, RiskFactorType, RiskLevel};
pub use service::{GenerateReportInput, LineageResult, LineageService, ReportType, TraceDirection};
pub use traversal::{traverse, Direction, LineageEdge, LineageNode, TraceGraph, TraceOptions};
