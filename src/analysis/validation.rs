//! Field validation.
//!
//! Rules are evaluated in order: `required` (template fields only), the
//! built-in format implied by the field type, then the template's custom
//! rules. Every violation is collected and the first one is reported as
//! the failing rule. A custom rule that cannot be evaluated is skipped
//! and reported; it never fails the field. Values are never modified.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

use crate::models::{
    Field, FieldRule, FieldValue, FormatRule, RuleViolation, SkippedRule, Template,
    TemplateField, ValidationResult, ValidationSummary, REQUIRED_RULE_ID,
};

/// A template rule that cannot be evaluated.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("lower bound exceeds upper bound")]
    InvertedBounds,
    #[error("no bounds given")]
    MissingBounds,
    #[error("empty list of allowed values")]
    EmptyChoices,
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap()
});

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+?[0-9 ()./\-]+$").unwrap());

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%d-%m-%Y",
    "%m/%d/%y",
    "%d/%m/%y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

const TRUE_WORDS: &[&str] = &["yes", "y", "true", "x", "checked", "on", "1", "✓", "✔"];
const FALSE_WORDS: &[&str] = &["no", "n", "false", "unchecked", "off", "0", ""];

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

/// Parse a number, ignoring currency symbols, spaces and thousands separators.
/// Accounting negatives `(12.00)` are accepted.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let (negative, inner) = match trimmed.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let cleaned: String = inner
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(if negative { -value } else { value })
}

fn is_boolean_like(value: &FieldValue) -> bool {
    match value {
        FieldValue::Flag(_) => true,
        FieldValue::Text(text) => {
            let t = text.trim().to_lowercase();
            TRUE_WORDS.contains(&t.as_str()) || FALSE_WORDS.contains(&t.as_str())
        }
    }
}

fn check_format(format: FormatRule, value: &FieldValue) -> Result<(), String> {
    let text = value.as_text();
    let text = text.trim();
    let ok = match format {
        FormatRule::Date => parse_date(text).is_some(),
        FormatRule::Number => parse_number(text).is_some(),
        FormatRule::Boolean => is_boolean_like(value),
        FormatRule::Email => EMAIL_RE.is_match(text),
        FormatRule::Phone => {
            let digits = text.chars().filter(char::is_ascii_digit).count();
            PHONE_RE.is_match(text) && (7..=15).contains(&digits)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{:?} is not a valid {}", text, format_label(format)))
    }
}

fn format_label(format: FormatRule) -> &'static str {
    match format {
        FormatRule::Date => "date",
        FormatRule::Number => "number",
        FormatRule::Boolean => "checkbox value",
        FormatRule::Email => "email address",
        FormatRule::Phone => "phone number",
    }
}

/// A custom rule that passed its well-formedness checks.
enum PreparedRule<'r> {
    Format(FormatRule),
    Regex(Regex, &'r str),
    Range(Option<f64>, Option<f64>),
    Length(Option<usize>, Option<usize>),
    OneOf(&'r [String]),
}

fn check_bounds<T: PartialOrd>(min: Option<T>, max: Option<T>) -> Result<(), RuleError> {
    match (min, max) {
        (None, None) => Err(RuleError::MissingBounds),
        (Some(lo), Some(hi)) if lo > hi => Err(RuleError::InvertedBounds),
        _ => Ok(()),
    }
}

/// Compile a custom rule. Runs whether or not the field has a value, so a
/// malformed rule is reported even on empty fields.
fn prepare_rule(rule: &FieldRule) -> Result<PreparedRule<'_>, RuleError> {
    match rule {
        FieldRule::Format { format } => Ok(PreparedRule::Format(*format)),
        FieldRule::Regex { pattern } => Regex::new(pattern)
            .map(|re| PreparedRule::Regex(re, pattern.as_str()))
            .map_err(|source| RuleError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            }),
        FieldRule::Range { min, max } => {
            check_bounds(*min, *max)?;
            Ok(PreparedRule::Range(*min, *max))
        }
        FieldRule::Length { min, max } => {
            check_bounds(*min, *max)?;
            Ok(PreparedRule::Length(*min, *max))
        }
        FieldRule::OneOf { values } => {
            if values.is_empty() {
                return Err(RuleError::EmptyChoices);
            }
            Ok(PreparedRule::OneOf(values.as_slice()))
        }
    }
}

impl PreparedRule<'_> {
    fn check(&self, value: &FieldValue) -> Result<(), String> {
        let text = value.as_text();
        let text = text.trim();
        match self {
            PreparedRule::Format(format) => check_format(*format, value),
            PreparedRule::Regex(re, pattern) => {
                if re.is_match(text) {
                    Ok(())
                } else {
                    Err(format!("{:?} does not match {}", text, pattern))
                }
            }
            PreparedRule::Range(min, max) => match parse_number(text) {
                None => Err(format!("{:?} is not numeric", text)),
                Some(n) if min.is_some_and(|lo| n < lo) => {
                    Err(format!("{} is below {}", n, min.unwrap_or_default()))
                }
                Some(n) if max.is_some_and(|hi| n > hi) => {
                    Err(format!("{} is above {}", n, max.unwrap_or_default()))
                }
                Some(_) => Ok(()),
            },
            PreparedRule::Length(min, max) => {
                let len = text.chars().count();
                if min.is_some_and(|lo| len < lo) || max.is_some_and(|hi| len > hi) {
                    Err(format!("length {} outside {:?}..={:?}", len, min, max))
                } else {
                    Ok(())
                }
            }
            PreparedRule::OneOf(values) => {
                if values.iter().any(|v| v.trim().eq_ignore_ascii_case(text)) {
                    Ok(())
                } else {
                    Err(format!("{:?} is not one of {:?}", text, values))
                }
            }
        }
    }
}

/// Stateless rule evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidationEngine;

impl ValidationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Validate one field, optionally against its template definition.
    pub fn validate_field(
        &self,
        index: usize,
        field: &Field,
        expected: Option<&TemplateField>,
    ) -> ValidationResult {
        let mut violations = Vec::new();
        let mut skipped_rules = Vec::new();
        let mut rules_checked = 0;
        // An unticked mark counts as absent for `required`.
        let empty = match &field.value {
            FieldValue::Flag(set) => !set,
            FieldValue::Text(_) => field.value.is_empty(),
        };

        if expected.is_some_and(|e| e.required) {
            rules_checked += 1;
            if empty {
                violations.push(RuleViolation {
                    rule_id: REQUIRED_RULE_ID.to_string(),
                    message: format!("{} is required", field.name),
                });
            }
        }

        // Format and custom rules judge a value; an absent one is only
        // caught by `required`.
        let has_value = !field.value.is_empty();
        if has_value {
            if let Some(format) = FormatRule::for_field_type(field.field_type) {
                rules_checked += 1;
                if let Err(message) = check_format(format, &field.value) {
                    violations.push(RuleViolation {
                        rule_id: format.rule_id().to_string(),
                        message,
                    });
                }
            }
        }

        let rules = expected.map(|e| e.rules.as_slice()).unwrap_or_default();
        for (position, rule) in rules.iter().enumerate() {
            let rule_id = rule.rule_id(position);
            match prepare_rule(rule) {
                Ok(prepared) if has_value => {
                    rules_checked += 1;
                    if let Err(message) = prepared.check(&field.value) {
                        violations.push(RuleViolation { rule_id, message });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(field = %field.name, rule = %rule_id, "Skipping rule: {}", e);
                    skipped_rules.push(SkippedRule {
                        rule_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        ValidationResult {
            field_index: index,
            field_name: field.name.clone(),
            passed: violations.is_empty(),
            failed_rule: violations.first().map(|v| v.rule_id.clone()),
            violations,
            skipped_rules,
            rules_checked,
        }
    }

    /// Validate all fields. Template rules apply to fields that were
    /// located through that template.
    pub fn validate_all(&self, fields: &[Field], template: Option<&Template>) -> ValidationSummary {
        let results = fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                let expected = template.and_then(|t| {
                    field
                        .template_field_index()
                        .and_then(|i| t.fields.get(i))
                });
                self.validate_field(index, field, expected)
            })
            .collect();
        ValidationSummary::from_results(results)
    }
}
