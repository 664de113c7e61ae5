//! Permission requests and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::BrokerEvent;

/// Broker-assigned request identifier. Strictly increasing, never reused
/// within one broker process.
pub type RequestId = u64;

/// Risk tier attached to a request when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// A prompt scraped from the agent, turned into something an observer can
/// answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: RequestId,
    pub action: String,
    pub target: String,
    pub risk: RiskLevel,
    /// Nominal cost announced to observers. Not derived from the agent's
    /// reported credit usage.
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl PermissionRequest {
    /// Wire event announcing this request to observers.
    pub fn to_event(&self) -> BrokerEvent {
        BrokerEvent::Permission {
            id: self.id,
            action: self.action.clone(),
            target: self.target.clone(),
            risk: self.risk,
            credits: self.estimated_cost,
            timestamp: self.created_at.timestamp_millis(),
        }
    }
}

/// An observer's answer, parsed from the `decision` field of a response.
///
/// `approve:<anything>` counts as approval; the suffix is kept only for
/// logging. Any other string that is not `approve` is a denial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve { note: Option<String> },
    Deny,
}

impl Decision {
    pub fn parse(raw: &str) -> Self {
        if raw == "approve" {
            return Decision::Approve { note: None };
        }
        match raw.strip_prefix("approve:") {
            Some(note) => Decision::Approve {
                note: Some(note.to_string()),
            },
            None => Decision::Deny,
        }
    }
}

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Approved { note: Option<String> },
    Denied,
    Expired,
}

impl Outcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Outcome::Approved { .. })
    }

    /// Line written back to the agent's stdin (without the newline).
    pub fn reply(&self) -> &'static str {
        if self.is_approved() {
            "y"
        } else {
            "n"
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            Outcome::Approved { .. } => RequestStatus::Approved,
            Outcome::Denied => RequestStatus::Denied,
            Outcome::Expired => RequestStatus::Expired,
        }
    }
}

impl From<Decision> for Outcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approve { note } => Outcome::Approved { note },
            Decision::Deny => Outcome::Denied,
        }
    }
}
