//! Capability and agent descriptor types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use super::message::MessageKind;

/// Named service an agent can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RiskAssessment,
    LiquidityManagement,
    CollectionsOptimization,
    InvestmentAnalysis,
    ComplianceCheck,
    PaymentPrioritization,
    CashForecasting,
    ScenarioAnalysis,
    Reconciliation,
    Reporting,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::RiskAssessment,
        Capability::LiquidityManagement,
        Capability::CollectionsOptimization,
        Capability::InvestmentAnalysis,
        Capability::ComplianceCheck,
        Capability::PaymentPrioritization,
        Capability::CashForecasting,
        Capability::ScenarioAnalysis,
        Capability::Reconciliation,
        Capability::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::RiskAssessment => "risk_assessment",
            Capability::LiquidityManagement => "liquidity_management",
            Capability::CollectionsOptimization => "collections_optimization",
            Capability::InvestmentAnalysis => "investment_analysis",
            Capability::ComplianceCheck => "compliance_check",
            Capability::PaymentPrioritization => "payment_prioritization",
            Capability::CashForecasting => "cash_forecasting",
            Capability::ScenarioAnalysis => "scenario_analysis",
            Capability::Reconciliation => "reconciliation",
            Capability::Reporting => "reporting",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown capability: {}", raw.trim()))
    }
}

/// What an agent declares about one of its capabilities
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityInfo {
    pub capability: Capability,
    /// 0..=1, how confident the agent is in this capability
    pub confidence_level: f64,
    pub processing_time_estimate: Duration,
}

impl CapabilityInfo {
    pub fn new(capability: Capability, confidence_level: f64) -> Self {
        Self {
            capability,
            confidence_level: confidence_level.clamp(0.0, 1.0),
            processing_time_estimate: Duration::from_secs(5),
        }
    }

    /// Default declaration used when an agent does not override it
    pub fn standard(capability: Capability) -> Self {
        Self::new(capability, 0.7)
    }

    pub fn with_processing_estimate(mut self, estimate: Duration) -> Self {
        self.processing_time_estimate = estimate;
        self
    }
}

/// Static description of an agent as seen by the hub
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: String,
    pub role: String,
    pub capabilities: Vec<CapabilityInfo>,
    pub subscriptions: HashSet<MessageKind>,
}

impl AgentDescriptor {
    pub fn new(id: &str, role: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            capabilities: Vec::new(),
            subscriptions: HashSet::new(),
        }
    }

    /// Add a capability with the standard confidence
    pub fn with_capability(self, capability: Capability) -> Self {
        self.with_capability_info(CapabilityInfo::standard(capability))
    }

    pub fn with_capability_info(mut self, info: CapabilityInfo) -> Self {
        self.capabilities.retain(|c| c.capability != info.capability);
        self.capabilities.push(info);
        self
    }

    pub fn subscribe(mut self, kind: MessageKind) -> Self {
        self.subscriptions.insert(kind);
        self
    }

    pub fn subscribe_all(mut self) -> Self {
        self.subscriptions.extend(MessageKind::ALL);
        self
    }

    pub fn capability_info(&self, capability: Capability) -> Option<&CapabilityInfo> {
        self.capabilities
            .iter()
            .find(|c| c.capability == capability)
    }

    pub fn can_handle(&self, capability: Capability) -> bool {
        self.capability_info(capability).is_some()
    }

    pub fn is_subscribed(&self, kind: MessageKind) -> bool {
        self.subscriptions.contains(&kind)
    }

    pub fn capability_set(&self) -> Vec<Capability> {
        self.capabilities.iter().map(|c| c.capability).collect()
    }
}

/// Structured recommendation returned by `Agent::make_decision`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub agent_id: String,
    pub decision_type: String,
    pub recommendation: String,
    /// 0..=1
    pub confidence_score: f64,
    pub supporting_data: serde_json::Value,
    #[serde(default)]
    pub risk_assessment: Option<String>,
    #[serde(default)]
    pub financial_impact: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!(
            " Risk_Assessment ".parse::<Capability>().unwrap(),
            Capability::RiskAssessment
        );
        assert!("teleportation".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_serde_is_snake_case() {
        let json = serde_json::to_string(&Capability::CashForecasting).unwrap();
        assert_eq!(json, "\"cash_forecasting\"");
    }

    #[test]
    fn test_descriptor_replaces_duplicate_capability() {
        let descriptor = AgentDescriptor::new("risk_001", "risk_manager")
            .with_capability(Capability::RiskAssessment)
            .with_capability_info(CapabilityInfo::new(Capability::RiskAssessment, 0.9));

        assert_eq!(descriptor.capabilities.len(), 1);
        assert_eq!(
            descriptor
                .capability_info(Capability::RiskAssessment)
                .unwrap()
                .confidence_level,
            0.9
        );
        assert!(!descriptor.can_handle(Capability::Reporting));
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(CapabilityInfo::new(Capability::Reporting, 1.7).confidence_level, 1.0);
        assert_eq!(CapabilityInfo::new(Capability::Reporting, -0.2).confidence_level, 0.0);
    }
}
