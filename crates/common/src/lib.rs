// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Types shared between the permission broker and its observers.

pub mod events;
pub mod request;

pub use events::{BrokerEvent, ObserverMessage};
pub use request::{Decision, Outcome, PermissionRequest, RequestId, RequestStatus, RiskLevel};
