use std::sync::Arc;

use tracing::info;

use crate::bridge::{AgentBridge, AgentSession};
use crate::config::BrokerConfig;
use crate::correlator::RequestCorrelator;
use crate::error::Result;
use crate::journal::Journal;
use crate::ledger::CreditLedger;
use crate::registry::ObserverRegistry;
use crate::server::{ObserverServer, ServerState};

/// Owns the shared broker state and wires the agent side to the observer
/// side.
pub struct Broker {
    config: BrokerConfig,
    correlator: RequestCorrelator,
    registry: ObserverRegistry,
    ledger: CreditLedger,
    bridge: AgentBridge,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;

        let journal = match &config.journal {
            Some(journal) => {
                let opened = Journal::open(&journal.path, journal.key.as_bytes())?;
                info!(path = %opened.path().display(), seq = opened.current_seq(), "Journal opened");
                Some(Arc::new(opened))
            }
            None => None,
        };

        let correlator = RequestCorrelator::new(config.decision_timeout);
        let registry = ObserverRegistry::new(config.observer_buffer);
        let ledger = CreditLedger::new();
        let bridge = AgentBridge::new(
            Arc::new(config.matcher()?),
            config.classifier(),
            correlator.clone(),
            registry.clone(),
            ledger.clone(),
            config.nominal_cost,
        )
        .with_journal(journal);

        Ok(Self {
            config,
            correlator,
            registry,
            ledger,
            bridge,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn bridge(&self) -> &AgentBridge {
        &self.bridge
    }

    pub fn server_state(&self) -> ServerState {
        ServerState {
            correlator: self.correlator.clone(),
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
        }
    }

    /// Binds the observer endpoint on the configured address.
    pub async fn bind(&self) -> Result<ObserverServer> {
        ObserverServer::bind(self.config.listen, self.server_state()).await
    }

    /// Launches the configured agent, if any.
    pub fn launch_agent(&self) -> Result<Option<AgentSession>> {
        self.config
            .agent
            .as_ref()
            .map(|agent| self.bridge.launch(agent))
            .transpose()
    }

    /// Denies everything still pending, then stops the agent.
    pub async fn shutdown(&self, agent: Option<AgentSession>) {
        let expired = self.correlator.expire_all().await;
        if expired > 0 {
            info!(expired, "Denied pending requests on shutdown");
        }
        if let Some(session) = agent {
            let code = session.shutdown().await;
            info!(exit_code = ?code, "Agent stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::journal::JournalVerifier;
    use nod_common::RiskLevel;
    use tempfile::tempdir;

    #[tokio::test]
    async fn shutdown_denies_pending_requests() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        let (_, handle) = broker
            .correlator()
            .allocate("delete", "build/", RiskLevel::High, 0.5)
            .await;

        broker.shutdown(None).await;

        assert!(!handle.wait().await.is_approved());
        assert_eq!(broker.correlator().stats().expired, 1);
    }

    #[tokio::test]
    async fn no_agent_configured_launches_nothing() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        assert!(broker.launch_agent().unwrap().is_none());
    }

    #[tokio::test]
    async fn opens_configured_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal").join("nod.jsonl");
        let config = BrokerConfig {
            journal: Some(JournalConfig {
                path: path.clone(),
                key: "k".to_string(),
            }),
            ..BrokerConfig::default()
        };

        let _broker = Broker::new(config).unwrap();
        assert!(path.exists());
        assert!(JournalVerifier::new(b"k").verify_file(&path).unwrap());
    }
}
