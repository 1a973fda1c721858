//! Boundary to the remote vault service.
//!
//! Five operations, each one request in and one typed result or one typed
//! failure out. No retries, caching or batching happen at this layer.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::ServiceError;
use crate::funnel::model::{
    AnalysisRequest, AnalysisResult, ChatMessage, LeadCaptureRequest, SalaryExtraction,
};

pub use http::HttpServiceClient;

/// Operation names used in errors and logs.
pub mod operation {
    pub const PROBE: &str = "probe";
    pub const EXTRACT: &str = "extract";
    pub const ANALYZE: &str = "analyze";
    pub const CONVERSE: &str = "converse";
    pub const CAPTURE_LEAD: &str = "capture_lead";
}

/// Context sent with each conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverseRequest {
    pub analysis: AnalysisResult,
    /// Set once the user has seen the pre-approval offer, which lets the
    /// assistant steer toward it.
    #[serde(default)]
    pub convinced: bool,
}

/// Acknowledgement of a captured lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Uniform contract to the remote operations.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Liveness probe.
    async fn probe(&self) -> Result<(), ServiceError>;

    /// Extract salary data from a document.
    async fn extract(&self, document: &Document) -> Result<SalaryExtraction, ServiceError>;

    /// Run the deterministic rent-vs-buy computation.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ServiceError>;

    /// Produce one assistant message for the given analysis.
    async fn converse(&self, request: &ConverseRequest) -> Result<ChatMessage, ServiceError>;

    /// Submit the soft-close lead snapshot.
    async fn capture_lead(&self, request: &LeadCaptureRequest) -> Result<LeadAck, ServiceError>;
}
