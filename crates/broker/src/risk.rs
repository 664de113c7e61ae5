//! Risk tiers for scraped prompts.
//!
//! Matching is plain case-sensitive substring search. High-risk terms are
//! checked against both the action and the target, medium-risk terms only
//! against the target.

use nod_common::RiskLevel;

pub const DEFAULT_HIGH_RISK: &[&str] = &["delete", "remove", "rm -rf"];
pub const DEFAULT_MEDIUM_RISK: &[&str] = &[".env", "config", "credentials"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskClassifier {
    high: Vec<String>,
    medium: Vec<String>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_HIGH_RISK.iter().map(|s| s.to_string()).collect(),
            DEFAULT_MEDIUM_RISK.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl RiskClassifier {
    pub fn new(high: Vec<String>, medium: Vec<String>) -> Self {
        // an empty term would match every string
        let keep = |terms: Vec<String>| -> Vec<String> {
            terms.into_iter().filter(|t| !t.is_empty()).collect()
        };
        Self {
            high: keep(high),
            medium: keep(medium),
        }
    }

    pub fn classify(&self, action: &str, target: &str) -> RiskLevel {
        if self
            .high
            .iter()
            .any(|term| action.contains(term.as_str()) || target.contains(term.as_str()))
        {
            return RiskLevel::High;
        }
        if self.medium.iter().any(|term| target.contains(term.as_str())) {
            return RiskLevel::Medium;
        }
        RiskLevel::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_is_high_even_on_sensitive_target() {
        let classifier = RiskClassifier::default();
        assert_eq!(classifier.classify("delete", ".env.backup"), RiskLevel::High);
    }

    #[test]
    fn high_terms_match_target_too() {
        let classifier = RiskClassifier::default();
        assert_eq!(classifier.classify("execute", "rm -rf build/"), RiskLevel::High);
        assert_eq!(classifier.classify("execute", "git remove-branch"), RiskLevel::High);
    }

    #[test]
    fn medium_terms_only_apply_to_target() {
        let classifier = RiskClassifier::default();
        assert_eq!(classifier.classify("edit", "src/config.js"), RiskLevel::Medium);
        assert_eq!(classifier.classify("config", "README.md"), RiskLevel::Low);
    }

    #[test]
    fn plain_edits_are_low() {
        let classifier = RiskClassifier::default();
        assert_eq!(classifier.classify("modify", "package.json"), RiskLevel::Low);
        assert_eq!(classifier.classify("execute", "npm install axios"), RiskLevel::Low);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let classifier = RiskClassifier::default();
        assert_eq!(classifier.classify("DELETE", "NOTES.md"), RiskLevel::Low);
        assert_eq!(classifier.classify("edit", "Config.toml"), RiskLevel::Low);
    }

    #[test]
    fn configured_vocabulary_replaces_defaults() {
        let classifier = RiskClassifier::new(
            vec!["sudo".into(), String::new()],
            vec!["secrets/".into()],
        );
        assert_eq!(classifier.classify("execute", "sudo reboot"), RiskLevel::High);
        assert_eq!(classifier.classify("read", "secrets/api.key"), RiskLevel::Medium);
        assert_eq!(classifier.classify("delete", "tmp.txt"), RiskLevel::Low);
    }
}
