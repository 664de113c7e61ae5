//! Running total of credits the agent reports spending.

use std::sync::Arc;

use nod_common::BrokerEvent;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditUpdate {
    pub total: f64,
    pub delta: f64,
}

impl CreditUpdate {
    pub fn to_event(&self) -> BrokerEvent {
        BrokerEvent::Credits {
            total: self.total,
            delta: self.delta,
        }
    }
}

/// Monotonically non-decreasing; no reset.
#[derive(Clone, Default)]
pub struct CreditLedger {
    total: Arc<Mutex<f64>>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a strictly positive, finite delta. Anything else would break
    /// monotonicity and is refused.
    pub async fn add(&self, delta: f64) -> Option<CreditUpdate> {
        if !delta.is_finite() || delta <= 0.0 {
            warn!(delta, "Ignoring invalid credit delta");
            return None;
        }
        let mut total = self.total.lock().await;
        *total += delta;
        Some(CreditUpdate {
            total: *total,
            delta,
        })
    }

    pub async fn total(&self) -> f64 {
        *self.total.lock().await
    }
}
