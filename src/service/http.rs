//! HTTP implementation of [`ServiceClient`] over reqwest.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{ConverseRequest, LeadAck, ServiceClient, operation};
use crate::config::VaultConfig;
use crate::document::Document;
use crate::error::{ConfigError, ServiceError};
use crate::funnel::model::{
    AnalysisRequest, AnalysisResult, ChatMessage, LeadCaptureRequest, SalaryExtraction,
};

/// Longest slice of an error body kept in a `Rejected` reason.
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: String,
}

/// Talks to the vault service at a single base URL.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Build a client honouring the configured timeout, if any.
    pub fn from_config(config: &VaultConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ConfigError::InvalidValue {
            key: "http_client".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::with_client(client, &config.service_url))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Send a request; connection failures are `Unavailable`, non-success
    /// statuses are `Rejected`.
    async fn send(
        &self,
        op: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::unavailable(op, e.to_string()))?;

        let status = response.status();
        debug!(operation = op, status = status.as_u16(), "Service responded");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let reason: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        Err(ServiceError::rejected(op, status.as_u16(), reason))
    }

    /// Decode a success body; anything that doesn't fit `T` is `Rejected`.
    async fn decode<T: DeserializeOwned>(
        op: &str,
        response: reqwest::Response,
    ) -> Result<T, ServiceError> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::unavailable(op, e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ServiceError::rejected(op, status, format!("malformed response: {e}")))
    }
}

/// The extraction endpoint may return the object itself or the object
/// JSON-encoded inside a string.
fn extraction_from_value(value: Value, status: u16) -> Result<SalaryExtraction, ServiceError> {
    let value = match value {
        Value::String(inner) => serde_json::from_str(&inner).map_err(|e| {
            ServiceError::rejected(operation::EXTRACT, status, format!("malformed extraction: {e}"))
        })?,
        other => other,
    };
    match value {
        Value::Object(fields) => Ok(SalaryExtraction::from_fields(fields)),
        other => Err(ServiceError::rejected(
            operation::EXTRACT,
            status,
            format!("extraction is not an object: {other}"),
        )),
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn probe(&self) -> Result<(), ServiceError> {
        self.send(operation::PROBE, self.client.get(self.url("health")))
            .await
            .map(|_| ())
    }

    async fn extract(&self, document: &Document) -> Result<SalaryExtraction, ServiceError> {
        let form = Form::new().part("file", file_part(document));

        debug!(
            file = document.file_name(),
            mime = document.mime(),
            bytes = document.len(),
            "Uploading document for extraction"
        );
        let response = self
            .send(
                operation::EXTRACT,
                self.client.post(self.url("upload")).multipart(form),
            )
            .await?;
        let status = response.status().as_u16();
        let value: Value = Self::decode(operation::EXTRACT, response).await?;
        extraction_from_value(value, status)
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ServiceError> {
        let response = self
            .send(
                operation::ANALYZE,
                self.client.post(self.url("analyze")).json(request),
            )
            .await?;
        Self::decode(operation::ANALYZE, response).await
    }

    async fn converse(&self, request: &ConverseRequest) -> Result<ChatMessage, ServiceError> {
        let response = self
            .send(
                operation::CONVERSE,
                self.client.post(self.url("chat")).json(request),
            )
            .await?;
        let chat: ChatResponse = Self::decode(operation::CONVERSE, response).await?;
        Ok(ChatMessage::assistant(chat.message))
    }

    async fn capture_lead(&self, request: &LeadCaptureRequest) -> Result<LeadAck, ServiceError> {
        let response = self
            .send(
                operation::CAPTURE_LEAD,
                self.client.post(self.url("lead")).json(request),
            )
            .await?;
        // Any success status acknowledges; the body is informational.
        let bytes = response.bytes().await.unwrap_or_default();
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }
}

/// Multipart `file` field for an upload.
fn file_part(document: &Document) -> Part {
    Part::bytes(document.bytes().to_vec())
        .file_name(document.file_name().to_string())
        .mime_str(document.mime())
        .expect("document MIME types are static and valid")
}
