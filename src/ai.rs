//! Client for the AI planning/codegen/review service.
//!
//! The service takes an instruction plus optional file content and codebase
//! context, and answers with text that the calling phase parses into its
//! expected JSON shape (Plan, `Vec<CodeGenResult>`, or ReviewResult). The
//! trait seam exists so tests script responses without a network.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct AiRequest {
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AiRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            existing_content: None,
            context: None,
        }
    }

    pub fn with_existing_content(mut self, content: impl Into<String>) -> Self {
        self.existing_content = Some(content.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    content: String,
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, request: &AiRequest) -> Result<String>;
}

/// HTTP implementation of the AI service contract.
pub struct HttpAiClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpAiClient {
    pub fn new(url: &str, api_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            api_key: api_key.map(|k| k.to_string()),
        }
    }
}

#[async_trait]
impl AiClient for HttpAiClient {
    async fn complete(&self, request: &AiRequest) -> Result<String> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .context("Failed to reach AI service")?
            .error_for_status()
            .context("AI service returned error status")?
            .json::<AiResponse>()
            .await
            .context("Failed to parse AI service response envelope")?;
        Ok(response.content)
    }
}

/// Extract the outermost JSON object or array from service output that may be
/// wrapped in markdown fences or prose. Returns the input unchanged when no
/// JSON delimiters are found; the caller's parse then produces the real error.
pub fn extract_json(raw: &str) -> &str {
    let object = raw.find('{').and_then(|start| {
        raw.rfind('}')
            .filter(|&end| end >= start)
            .map(|end| (start, end))
    });
    let array = raw.find('[').and_then(|start| {
        raw.rfind(']')
            .filter(|&end| end >= start)
            .map(|end| (start, end))
    });

    // Prefer whichever delimiter opens first; an array response wrapped in a
    // prose sentence containing braces would otherwise be misread.
    let span = match (object, array) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                Some(a)
            } else {
                Some(o)
            }
        }
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };

    match span {
        Some((start, end)) => &raw[start..=end],
        None => raw,
    }
}
