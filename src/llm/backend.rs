use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BackendConfig, LlmConfig};
use crate::error::LlmError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the service for a JSON object response.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn system_content(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// The remote structured-completion call. Swapped for a scripted fake in tests.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Model identity that goes into every cache key.
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Chat-completions over HTTP, for either endpoint family.
pub struct HttpBackend {
    client: reqwest::Client,
    backend: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            backend: config.backend.clone(),
        })
    }

    /// Resolve the chat completions endpoint.
    fn endpoint(&self) -> String {
        match &self.backend {
            BackendConfig::OpenAiCompatible { base_url, .. } => {
                let base = base_url.trim_end_matches('/');
                if base.ends_with("/chat/completions") {
                    base.to_string()
                } else if base.ends_with("/v1") {
                    format!("{}/chat/completions", base)
                } else {
                    format!("{}/v1/chat/completions", base)
                }
            }
            BackendConfig::AzureDeployment {
                endpoint,
                deployment,
                api_version,
                ..
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn model(&self) -> &str {
        self.backend.model_identity()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut body = serde_json::json!({
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let mut req = self.client.post(self.endpoint());
        req = match &self.backend {
            BackendConfig::OpenAiCompatible { api_key, model, .. } => {
                body["model"] = serde_json::Value::String(model.clone());
                req.header("Authorization", format!("Bearer {}", api_key))
            }
            BackendConfig::AzureDeployment { api_key, .. } => req.header("api-key", api_key),
        };

        let resp = req.json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(LlmError::Transport {
                status: Some(status.as_u16()),
                message: text.chars().take(500).collect(),
            });
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| {
                LlmError::transport(format!("Failed to parse completion envelope: {}", e))
            })?;

        // choices[0].message.content may be null
        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or("")
            .to_string();

        let usage = json.get("usage").filter(|u| u.is_object()).map(|u| TokenUsage {
            input: u["prompt_tokens"].as_u64().unwrap_or(0),
            output: u["completion_tokens"].as_u64().unwrap_or(0),
            total: u["total_tokens"].as_u64().unwrap_or(0),
        });

        debug!(
            provider = self.backend.provider(),
            content_len = content.len(),
            total_tokens = usage.as_ref().map(|u| u.total),
            "completion received"
        );

        Ok(CompletionResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::retry::RetryPolicy;
    use std::time::Duration;

    fn config(backend: BackendConfig) -> LlmConfig {
        LlmConfig {
            backend,
            default_temperature: 0.3,
            max_tokens: 2000,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(1),
        }
    }

    #[test]
    fn test_openai_endpoint_resolution() {
        for (base, expected) in [
            ("https://api.openai.com/v1", "https://api.openai.com/v1/chat/completions"),
            ("http://localhost:1234/", "http://localhost:1234/v1/chat/completions"),
            (
                "https://proxy.example/v1/chat/completions",
                "https://proxy.example/v1/chat/completions",
            ),
        ] {
            let backend = HttpBackend::new(&config(BackendConfig::OpenAiCompatible {
                base_url: base.to_string(),
                api_key: "k".into(),
                model: "gpt-4.1".into(),
            }))
            .unwrap();
            assert_eq!(backend.endpoint(), expected);
            assert_eq!(backend.model(), "gpt-4.1");
        }
    }

    #[test]
    fn test_azure_endpoint_resolution() {
        let backend = HttpBackend::new(&config(BackendConfig::AzureDeployment {
            endpoint: "https://acme.openai.azure.com/".into(),
            api_key: "k".into(),
            deployment: "gpt-4-1".into(),
            api_version: "2024-02-15-preview".into(),
        }))
        .unwrap();
        assert_eq!(
            backend.endpoint(),
            "https://acme.openai.azure.com/openai/deployments/gpt-4-1/chat/completions?api-version=2024-02-15-preview"
        );
        assert_eq!(backend.model(), "gpt-4-1");
    }
}
