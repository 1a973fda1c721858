//! PII scrubbing for extracted document data.
//!
//! Extraction is supposed to return salary numbers only, but the service
//! passes through whatever else it finds. String values are scrubbed before
//! they reach the session: emails, phone numbers, IBANs, passport numbers and
//! "Firstname Lastname" pairs become `[REDACTED_<LABEL>]`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::funnel::model::{MONTHLY_INCOME_KEY, SalaryExtraction};

/// Built-in rules, compiled on first use.
static DEFAULT_RULES: LazyLock<Vec<PiiRule>> = LazyLock::new(|| {
    vec![
        PiiRule {
            label: "EMAIL",
            regex: Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+").unwrap(),
        },
        PiiRule {
            label: "PHONE",
            regex: Regex::new(r"\b\d{9,15}\b").unwrap(),
        },
        PiiRule {
            label: "IBAN",
            regex: Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{11,30}\b").unwrap(),
        },
        PiiRule {
            label: "PASSPORT",
            regex: Regex::new(r"\b[A-Z]\d{7,8}\b").unwrap(),
        },
        PiiRule {
            label: "NAME",
            regex: Regex::new(r"\b[A-Z][a-z]+ [A-Z][a-z]+\b").unwrap(),
        },
    ]
});

/// A single redaction rule.
#[derive(Debug, Clone)]
pub struct PiiRule {
    /// Label used in the replacement marker.
    pub label: &'static str,
    pub regex: Regex,
}

/// Applies redaction rules in order.
#[derive(Debug, Clone)]
pub struct PiiScrubber {
    rules: Vec<PiiRule>,
}

impl PiiScrubber {
    /// Scrubber with the standard rule set.
    pub fn default_rules() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }

    /// Create a scrubber that changes nothing (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Redact PII in free text.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut sanitized = text.to_string();
        for rule in &self.rules {
            let marker = format!("[REDACTED_{}]", rule.label);
            sanitized = rule.regex.replace_all(&sanitized, marker.as_str()).into_owned();
        }
        sanitized
    }

    /// Redact every string inside a JSON value, recursively.
    pub fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.scrub_text(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.scrub_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.scrub_value(v)),
            _ => {}
        }
    }

    /// Scrub all passthrough fields; the income field is left as received.
    pub fn scrub_extraction(&self, extraction: SalaryExtraction) -> SalaryExtraction {
        let mut fields = extraction.into_fields();
        for (key, value) in fields.iter_mut() {
            if key != MONTHLY_INCOME_KEY {
                self.scrub_value(value);
            }
        }
        SalaryExtraction::from_fields(fields)
    }
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::default_rules()
    }
}
