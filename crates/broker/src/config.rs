//! Broker configuration.
//!
//! Settings come from three layers, highest priority first: command line
//! (the daemon folds environment variables into this layer), the optional
//! `nod.toml` file, built-in defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::correlator::DEFAULT_DECISION_TIMEOUT;
use crate::error::{BrokerError, Result};
use crate::journal::DEFAULT_JOURNAL_KEY;
use crate::matcher::{PatternMatcher, DEFAULT_CREDIT_PATTERN, DEFAULT_PROMPT_PATTERNS};
use crate::registry::DEFAULT_OBSERVER_BUFFER;
use crate::risk::{RiskClassifier, DEFAULT_HIGH_RISK, DEFAULT_MEDIUM_RISK};

pub const DEFAULT_CONFIG_FILE: &str = "nod.toml";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8765";
pub const DEFAULT_AGENT_PROGRAM: &str = "kiro-cli";
pub const DEFAULT_NOMINAL_COST: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    pub path: PathBuf,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    pub decision_timeout: Duration,
    /// Cost announced with every permission event.
    pub nominal_cost: f64,
    pub observer_buffer: usize,
    /// `None` runs the broker without an agent.
    pub agent: Option<AgentCommand>,
    pub high_risk: Vec<String>,
    pub medium_risk: Vec<String>,
    pub prompt_patterns: Vec<String>,
    pub credit_pattern: String,
    pub journal: Option<JournalConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8765)),
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            nominal_cost: DEFAULT_NOMINAL_COST,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            agent: None,
            high_risk: to_strings(DEFAULT_HIGH_RISK),
            medium_risk: to_strings(DEFAULT_MEDIUM_RISK),
            prompt_patterns: to_strings(DEFAULT_PROMPT_PATTERNS),
            credit_pattern: DEFAULT_CREDIT_PATTERN.to_string(),
            journal: None,
        }
    }
}

impl BrokerConfig {
    pub fn matcher(&self) -> Result<PatternMatcher> {
        PatternMatcher::new(self.prompt_patterns.as_slice(), &self.credit_pattern)
    }

    pub fn classifier(&self) -> RiskClassifier {
        RiskClassifier::new(self.high_risk.clone(), self.medium_risk.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.decision_timeout.is_zero() {
            return Err(BrokerError::Config(
                "decision timeout must be greater than zero".to_string(),
            ));
        }
        if !self.nominal_cost.is_finite() || self.nominal_cost < 0.0 {
            return Err(BrokerError::Config(format!(
                "nominal cost must be a non-negative number, got {}",
                self.nominal_cost
            )));
        }
        if let Some(agent) = &self.agent {
            if agent.program.trim().is_empty() {
                return Err(BrokerError::Config("agent program is empty".to_string()));
            }
        }
        self.matcher().map(|_| ())
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub timeout_secs: Option<u64>,
    pub agent_program: Option<String>,
    pub agent_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub journal_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: RawBrokerSection,
    #[serde(default)]
    pub agent: RawAgentSection,
    #[serde(default)]
    pub risk: RawRiskSection,
    #[serde(default)]
    pub matcher: RawMatcherSection,
    #[serde(default)]
    pub journal: RawJournalSection,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBrokerSection {
    pub listen: Option<String>,
    pub decision_timeout_secs: Option<u64>,
    pub nominal_cost: Option<f64>,
    pub observer_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawAgentSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub autostart: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRiskSection {
    pub high: Option<Vec<String>>,
    pub medium: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawMatcherSection {
    pub prompts: Option<Vec<String>>,
    pub credit: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJournalSection {
    pub path: Option<String>,
    pub key: Option<String>,
}

impl FileConfig {
    pub fn parse(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut parsed: FileConfig =
            toml::from_str(contents).map_err(|e| BrokerError::Config(e.to_string()))?;
        parsed.base_dir = base_dir.to_path_buf();
        Ok(parsed)
    }

    // Relative paths in the file are relative to the file itself.
    fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        BrokerError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    FileConfig::parse(&contents, base_dir)
        .map(Some)
        .map_err(|e| match e {
            BrokerError::Config(msg) => BrokerError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
}

pub fn resolve(cli: &CliOverrides, file: Option<&FileConfig>) -> Result<BrokerConfig> {
    let defaults = BrokerConfig::default();
    let empty = FileConfig::default();
    let file = file.unwrap_or(&empty);

    let listen_raw = cli
        .listen
        .clone()
        .or_else(|| file.broker.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen: SocketAddr = listen_raw
        .parse()
        .map_err(|e| BrokerError::Config(format!("invalid listen address `{listen_raw}`: {e}")))?;

    let decision_timeout = cli
        .timeout_secs
        .or(file.broker.decision_timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(defaults.decision_timeout);

    let agent = resolve_agent(cli, file);

    let journal = cli
        .journal
        .clone()
        .or_else(|| file.journal.path.as_deref().map(|p| file.resolve_path(p)))
        .map(|path| {
            let key = cli
                .journal_key
                .clone()
                .or_else(|| file.journal.key.clone())
                .unwrap_or_else(|| {
                    warn!("Journal uses the default key; set NOD_JOURNAL_KEY for tamper evidence");
                    DEFAULT_JOURNAL_KEY.to_string()
                });
            JournalConfig { path, key }
        });

    let config = BrokerConfig {
        listen,
        decision_timeout,
        nominal_cost: file.broker.nominal_cost.unwrap_or(defaults.nominal_cost),
        observer_buffer: file
            .broker
            .observer_buffer
            .unwrap_or(defaults.observer_buffer),
        agent,
        high_risk: file.risk.high.clone().unwrap_or(defaults.high_risk),
        medium_risk: file.risk.medium.clone().unwrap_or(defaults.medium_risk),
        prompt_patterns: file
            .matcher
            .prompts
            .clone()
            .unwrap_or(defaults.prompt_patterns),
        credit_pattern: file
            .matcher
            .credit
            .clone()
            .unwrap_or(defaults.credit_pattern),
        journal,
    };

    config.validate()?;
    Ok(config)
}

fn resolve_agent(cli: &CliOverrides, file: &FileConfig) -> Option<AgentCommand> {
    let args = if cli.agent_args.is_empty() {
        file.agent.args.clone().unwrap_or_default()
    } else {
        cli.agent_args.clone()
    };
    let autostart = file.agent.autostart.unwrap_or(false);
    if args.is_empty() && !autostart && cli.agent_program.is_none() {
        return None;
    }

    let program = cli
        .agent_program
        .clone()
        .or_else(|| file.agent.program.clone())
        .unwrap_or_else(|| DEFAULT_AGENT_PROGRAM.to_string());
    let working_dir = cli.working_dir.clone().or_else(|| {
        file.agent
            .working_dir
            .as_deref()
            .map(|dir| file.resolve_path(dir))
    });

    Some(AgentCommand {
        program,
        args,
        working_dir,
    })
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
