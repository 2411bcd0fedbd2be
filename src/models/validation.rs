//! Validation annotations attached to extracted fields.

use serde::{Deserialize, Serialize};

/// A rule that a field value did not satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub message: String,
}

/// A rule that could not be evaluated (malformed template rule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRule {
    pub rule_id: String,
    pub reason: String,
}

/// Outcome of validating one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Index into the result's field list.
    pub field_index: usize,
    pub field_name: String,
    pub passed: bool,
    /// First violated rule in evaluation order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_rule: Option<String>,
    /// Every violated rule, in evaluation order.
    pub violations: Vec<RuleViolation>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped_rules: Vec<SkippedRule>,
    pub rules_checked: usize,
}

impl ValidationResult {
    /// Share of evaluated rules that passed; 1.0 when no rule applied.
    pub fn pass_ratio(&self) -> f32 {
        if self.rules_checked == 0 {
            return 1.0;
        }
        let passed = self.rules_checked.saturating_sub(self.violations.len());
        passed as f32 / self.rules_checked as f32
    }

    pub fn violated(&self, rule_id: &str) -> bool {
        self.violations.iter().any(|v| v.rule_id == rule_id)
    }
}

/// Document-level view: all field results plus counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub results: Vec<ValidationResult>,
    pub passed: usize,
    pub failed: usize,
    pub required_missing: usize,
}

impl ValidationSummary {
    pub fn from_results(results: Vec<ValidationResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        let required_missing = results
            .iter()
            .filter(|r| r.violated(super::template::REQUIRED_RULE_ID))
            .count();
        Self {
            results,
            passed,
            failed,
            required_missing,
        }
    }

    pub fn for_field(&self, field_index: usize) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.field_index == field_index)
    }
}
