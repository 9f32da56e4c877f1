//! LLM providers for structured classification.
//! Both speak JSON-schema constrained generation against a local server.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::classifier::{extract_json_object, Classifier, ClassifyRequest};

/// OpenAI-compatible chat completions endpoint (vLLM, llama.cpp server, OpenAI).
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    guided_json: bool,
}

impl OpenAIProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            guided_json: false,
        }
    }

    /// Also send vLLM's `guided_json` extension; other servers reject unknown fields.
    pub fn with_guided_json(mut self, enabled: bool) -> Self {
        self.guided_json = enabled;
        self
    }

    fn request_body(&self, request: &ClassifyRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user }
            ],
            "temperature": 0.0,
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": request.task.replace('.', "_"), "schema": request.schema }
            }
        });
        if self.guided_json {
            body["guided_json"] = request.schema.clone();
        }
        body
    }

    async fn call_openai(&self, request: &ClassifyRequest) -> Result<String> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let response_json: OpenAIResponse = response.json().await?;

        response_json
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("Empty response from OpenAI"))
    }
}

#[async_trait]
impl Classifier for OpenAIProvider {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Value> {
        debug!("OpenAI classify {} with {}", request.task, self.model);
        let response = self.call_openai(request).await?;
        serde_json::from_str(extract_json_object(&response))
            .with_context(|| format!("Classifier returned non-JSON output for {}", request.task))
    }
}

/// Ollama `/api/generate` with a JSON schema `format`.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
        }
    }

    async fn call_ollama(&self, request: &ClassifyRequest) -> Result<String> {
        let request_body = json!({
            "model": self.model,
            "system": request.system,
            "prompt": request.user,
            "format": request.schema,
            "stream": false,
            "options": { "temperature": 0.0 }
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let response_json: OllamaResponse = response.json().await?;
        Ok(response_json.response)
    }
}

#[async_trait]
impl Classifier for OllamaProvider {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Value> {
        debug!("Ollama classify {} with {}", request.task, self.model);
        let response = self.call_ollama(request).await?;
        serde_json::from_str(extract_json_object(&response))
            .with_context(|| format!("Classifier returned non-JSON output for {}", request.task))
    }
}

// Response structures
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}
