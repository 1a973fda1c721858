//! Session data models — extraction, analysis, transcript and lead snapshot.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::{Facets, FunnelState, Intent};
use crate::config::AnalysisPolicy;

/// Key the extraction service uses for monthly income.
pub const MONTHLY_INCOME_KEY: &str = "monthly_income";

/// Structured result of document ingestion.
///
/// Only `monthly_income` is interpreted; every other field is passed
/// through untouched (after PII scrubbing).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalaryExtraction {
    #[serde(skip)]
    monthly_income: Option<Decimal>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl SalaryExtraction {
    /// Build an extraction from the service's JSON object.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        let monthly_income = fields.get(MONTHLY_INCOME_KEY).and_then(parse_amount);
        Self {
            monthly_income,
            fields,
        }
    }

    pub fn monthly_income(&self) -> Option<Decimal> {
        self.monthly_income
    }

    /// All extracted fields, including `monthly_income` as received.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// Parse a monetary amount given as a JSON number or a numeric string such
/// as `"30,000"` or `"AED 30 000.50"`.
fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

/// Inputs of the deterministic rent-vs-buy computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub monthly_income: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub annual_rent: Decimal,
}

impl AnalysisRequest {
    /// Merge the extracted income with the funnel's default policy.
    pub fn build(
        extraction: &SalaryExtraction,
        policy: &AnalysisPolicy,
        rent_override: Option<Decimal>,
    ) -> Self {
        Self {
            monthly_income: extraction
                .monthly_income()
                .unwrap_or(policy.default_monthly_income),
            annual_rent: rent_override.unwrap_or(policy.default_annual_rent),
        }
    }
}

/// Output of the analysis step: metric name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisResult(pub Map<String, Value>);

impl AnalysisResult {
    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The human-readable anchor sentence, if the service produced one.
    pub fn narrative(&self) -> Option<&str> {
        self.metric("narrative_anchor").and_then(Value::as_str)
    }
}

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Append-only conversation history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Snapshot of session data submitted at the soft close.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadCaptureRequest {
    pub session_id: Uuid,
    pub extraction: SalaryExtraction,
    pub analysis: AnalysisResult,
    pub captured_at: DateTime<Utc>,
}

/// Everything the presentation layer needs to render the current step.
#[derive(Debug, Clone, Serialize)]
pub struct FunnelView {
    pub session_id: Uuid,
    pub state: FunnelState,
    pub facets: Facets,
    /// Intents that are currently allowed; render only these as actions.
    pub allowed: Vec<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<SalaryExtraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    pub transcript: Vec<ChatMessage>,
    /// Step-specific failure from the most recent intent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FunnelView {
    pub fn allows(&self, intent: Intent) -> bool {
        self.allowed.contains(&intent)
    }
}
