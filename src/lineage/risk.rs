//! Aggregate risk and EUDR/RSPO compliance over a set of lineage nodes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::resolvers::EntityType;
use super::traversal::LineageNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactorType {
    DeforestationRisk,
    LegalityIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactor {
    #[serde(rename = "type")]
    pub factor_type: RiskFactorType,
    pub node_key: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceStatus {
    pub eudr_compliant: bool,
    pub rspo_compliant: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub risk_factors: Vec<RiskFactor>,
    pub compliance: ComplianceStatus,
}

const LEGALITY_ISSUES: &str = "issues";

/// Assess a node list
///
/// Only `high` and `critical` node levels raise the overall risk, and it
/// never comes back down, so node order does not matter. A legality issue
/// anywhere lifts the result to at least `high`.
pub fn assess_risk(nodes: &[LineageNode]) -> RiskAssessment {
    let mut overall = RiskLevel::Low;
    let mut risk_factors = Vec::new();
    let mut rspo_compliant = false;

    for node in nodes {
        if let Some(level) = node.risk_level.as_deref().and_then(|l| l.parse::<RiskLevel>().ok()) {
            if level >= RiskLevel::High {
                overall = overall.max(level);
            }
        }

        if node.entity_type == EntityType::Plot {
            if let Some(risk) = node.deforestation_risk.as_deref() {
                if !risk.eq_ignore_ascii_case("low") {
                    risk_factors.push(RiskFactor {
                        factor_type: RiskFactorType::DeforestationRisk,
                        node_key: node.key.clone(),
                        description: format!(
                            "Plot {} has {} deforestation risk",
                            node.entity_id, risk
                        ),
                    });
                }
            }
        }

        if node.legality_status.as_deref() == Some(LEGALITY_ISSUES) {
            overall = overall.max(RiskLevel::High);
            risk_factors.push(RiskFactor {
                factor_type: RiskFactorType::LegalityIssue,
                node_key: node.key.clone(),
                description: format!("{} {} has unresolved legality issues", node.entity_type, node.entity_id),
            });
        }

        if node
            .certifications
            .iter()
            .any(|c| c.to_ascii_uppercase().starts_with("RSPO"))
        {
            rspo_compliant = true;
        }
    }

    RiskAssessment {
        overall_risk: overall,
        compliance: ComplianceStatus {
            // Every factor type blocks EUDR compliance
            eudr_compliant: risk_factors.is_empty(),
            rspo_compliant,
            issues: risk_factors.iter().map(|f| f.description.clone()).collect(),
        },
        risk_factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(entity_type: EntityType, id: &str, risk: &str) -> LineageNode {
        LineageNode {
            key: entity_type.key(id),
            entity_id: id.to_string(),
            entity_type,
            name: None,
            level: 0,
            latitude: None,
            longitude: None,
            risk_level: Some(risk.to_string()),
            certifications: Vec::new(),
            deforestation_risk: None,
            legality_status: Some("verified".into()),
            entity_data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_empty_is_low_and_compliant() {
        let assessment = assess_risk(&[]);
        assert_eq!(assessment.overall_risk, RiskLevel::Low);
        assert!(assessment.compliance.eudr_compliant);
        assert!(!assessment.compliance.rspo_compliant);
    }

    #[test]
    fn test_critical_ratchet_is_order_independent() {
        let mut nodes: Vec<LineageNode> = (0..6)
            .map(|i| node(EntityType::Facility, &format!("F{}", i), "low"))
            .collect();
        nodes.insert(2, node(EntityType::Facility, "BAD", "critical"));
        nodes.push(node(EntityType::Facility, "H", "high"));

        assert_eq!(assess_risk(&nodes).overall_risk, RiskLevel::Critical);
        nodes.reverse();
        assert_eq!(assess_risk(&nodes).overall_risk, RiskLevel::Critical);
    }

    #[test]
    fn test_medium_does_not_escalate() {
        let nodes = vec![node(EntityType::Supplier, "S", "medium")];
        assert_eq!(assess_risk(&nodes).overall_risk, RiskLevel::Low);
    }

    #[test]
    fn test_plot_deforestation_blocks_eudr() {
        let mut plot = node(EntityType::Plot, "P1", "low");
        plot.deforestation_risk = Some("medium".into());
        plot.certifications = vec!["RSPO-MB".into()];

        let assessment = assess_risk(&[plot]);
        assert_eq!(assessment.overall_risk, RiskLevel::Low);
        assert_eq!(assessment.risk_factors.len(), 1);
        assert_eq!(assessment.risk_factors[0].factor_type, RiskFactorType::DeforestationRisk);
        assert!(!assessment.compliance.eudr_compliant);
        assert!(assessment.compliance.rspo_compliant);
        assert_eq!(assessment.compliance.issues.len(), 1);
    }

    #[test]
    fn test_legality_issue_forces_high() {
        let mut supplier = node(EntityType::Supplier, "S1", "low");
        supplier.legality_status = Some("issues".into());

        let assessment = assess_risk(&[supplier]);
        assert_eq!(assessment.overall_risk, RiskLevel::High);
        assert_eq!(assessment.risk_factors[0].factor_type, RiskFactorType::LegalityIssue);
        assert!(!assessment.compliance.eudr_compliant);
    }
}
