//! Recognises approval prompts and credit usage in agent output.
//!
//! Prompt shapes are an ordered list of regular expressions; the first one
//! that matches a line wins. Capture convention for every pattern: with two
//! groups the first is the action verb and the second the target, with one
//! group the action is `execute` and the group is the target.

use regex::Regex;

use crate::error::{BrokerError, Result};

/// Built-in prompt shapes, in priority order.
pub const DEFAULT_PROMPT_PATTERNS: &[&str] = &[
    r"(?:Allow \S+|[Pp]ermission) to (edit|read|delete) \[(.+?)\]\?",
    r"(?:Allow \S+|[Pp]ermission) to run \[(.+?)\]\?",
    r"(?:Allow \S+|[Pp]ermission) to (create|modify|remove) (.+?)\?",
    r"[Pp]ermission required: (.+)",
];

pub const DEFAULT_CREDIT_PATTERN: &str = r"(?i)(\d+(?:\.\d+)?)\s*credits?";

/// Action used when a prompt shape carries no verb.
pub const FALLBACK_ACTION: &str = "execute";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub action: String,
    pub target: String,
    pub raw: String,
}

/// Seam for swapping the line recogniser. Both methods are pure.
pub trait LineMatcher: Send + Sync {
    fn prompt(&self, line: &str) -> Option<Prompt>;
    fn credit(&self, line: &str) -> Option<f64>;
}

#[derive(Debug, Clone)]
struct PromptPattern {
    regex: Regex,
}

impl PromptPattern {
    fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|err| BrokerError::Config(format!("prompt pattern `{pattern}`: {err}")))?;
        // captures_len counts the implicit whole-match group
        if regex.captures_len() < 2 {
            return Err(BrokerError::Config(format!(
                "prompt pattern `{pattern}` needs at least one capture group"
            )));
        }
        Ok(Self { regex })
    }

    fn extract(&self, line: &str) -> Option<Prompt> {
        let caps = self.regex.captures(line)?;
        let first = caps.get(1)?.as_str();
        let (action, target) = match caps.get(2) {
            Some(second) => (first, second.as_str()),
            None => (FALLBACK_ACTION, first),
        };
        Some(Prompt {
            action: action.to_string(),
            target: target.to_string(),
            raw: line.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PatternMatcher {
    prompts: Vec<PromptPattern>,
    credit: Regex,
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(prompts: &[S], credit: &str) -> Result<Self> {
        if prompts.is_empty() {
            return Err(BrokerError::Config(
                "at least one prompt pattern is required".to_string(),
            ));
        }
        let prompts = prompts
            .iter()
            .map(|pattern| PromptPattern::new(pattern.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let credit = Regex::new(credit)
            .map_err(|err| BrokerError::Config(format!("credit pattern `{credit}`: {err}")))?;
        Ok(Self { prompts, credit })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(DEFAULT_PROMPT_PATTERNS, DEFAULT_CREDIT_PATTERN)
    }
}

impl LineMatcher for PatternMatcher {
    fn prompt(&self, line: &str) -> Option<Prompt> {
        self.prompts.iter().find_map(|pattern| pattern.extract(line))
    }

    fn credit(&self, line: &str) -> Option<f64> {
        let caps = self.credit.captures(line)?;
        let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
        (amount.is_finite() && amount > 0.0).then_some(amount)
    }
}
