//! Messages exchanged with observers over the broker endpoint.

use serde::{Deserialize, Serialize};

use crate::request::{RequestId, RiskLevel};

/// Broker → observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrokerEvent {
    Permission {
        id: RequestId,
        action: String,
        target: String,
        risk: RiskLevel,
        credits: f64,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    Credits {
        total: f64,
        delta: f64,
    },
}

/// Observer → broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObserverMessage {
    Response { id: RequestId, decision: String },
}

impl ObserverMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credits_event_shape() {
        let event = BrokerEvent::Credits {
            total: 1.7,
            delta: 1.2,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "credits", "total": 1.7, "delta": 1.2})
        );
    }

    #[test]
    fn parses_response_messages() {
        let msg = ObserverMessage::parse(r#"{"type":"response","id":3,"decision":"approve:1h"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ObserverMessage::Response {
                id: 3,
                decision: "approve:1h".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(ObserverMessage::parse("not json").is_err());
        assert!(ObserverMessage::parse(r#"{"type":"response","decision":"approve"}"#).is_err());
        assert!(ObserverMessage::parse(r#"{"type":"ping"}"#).is_err());
        assert!(ObserverMessage::parse(r#"{"type":"response","id":-1,"decision":"deny"}"#).is_err());
    }
}
