//! Permission broker between a supervised command-line agent and remote
//! observers.
//!
//! The agent's approval prompts are scraped from its output, announced to
//! every connected observer, and answered on its stdin with whatever the
//! first observer decides, or with a denial when nobody decides in time.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod correlator;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod matcher;
pub mod registry;
pub mod risk;
pub mod server;

pub use bridge::{AgentBridge, AgentSession};
pub use broker::Broker;
pub use config::{load_file_config, resolve, AgentCommand, BrokerConfig, CliOverrides, FileConfig};
pub use correlator::{
    CorrelatorStats, DecisionHandle, Reply, ReplySender, RequestCorrelator, DEFAULT_DECISION_TIMEOUT,
};
pub use error::{BrokerError, Result};
pub use journal::{Journal, JournalEvent, JournalVerifier};
pub use ledger::{CreditLedger, CreditUpdate};
pub use matcher::{LineMatcher, PatternMatcher, Prompt};
pub use registry::{ObserverId, ObserverRegistry};
pub use risk::RiskClassifier;
pub use server::{ObserverServer, ServerState};
