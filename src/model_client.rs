//! Model Host Client
//!
//! Transport to the external LLM host. The host is opaque to the core: a
//! small HTTP surface for generation (`/api/generate`), model listing
//! (`/api/tags`) and model download (`/api/pull`). Every request carries a
//! cancellation token and a timeout; transport failures map to
//! `RemoteUnavailable` so the health monitor can react, while structured
//! host errors map to `RemoteError` and are not retried.
//!
//! Generated text is normalised here (trimmed, internal newlines collapsed
//! to single spaces) because every consumer of this client renders output
//! on a single line above the prompt.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::error::{DeltaError, Result};

/// Generation parameters recognised by the host
#[derive(Debug, Clone, Serialize)]
pub struct GenerateParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 128,
            stream: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: GenerateOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    #[allow(dead_code)]
    model: String,
    response: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    name: &'a str,
}

/// HTTP client for the model host
#[derive(Debug, Clone)]
pub struct ModelHostClient {
    http: reqwest::Client,
    config: Arc<ConfigStore>,
}

impl ModelHostClient {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Cheap liveness probe against the tags endpoint
    pub async fn available(&self) -> bool {
        let model = self.config.model();
        let url = format!("{}/api/tags", model.endpoint.trim_end_matches('/'));
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(model.probe_timeout_secs))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Names of the models the host currently serves
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let model = self.config.model();
        let url = format!("{}/api/tags", model.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(model.probe_timeout_secs))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let tags: TagsResponse = response.json().await.map_err(map_transport_error)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Single-shot generation. The returned text is normalised to one line.
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(DeltaError::InvalidInput("empty prompt".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(DeltaError::Cancelled);
        }
        let model = self.config.model();
        let url = format!("{}/api/generate", model.endpoint.trim_end_matches('/'));
        let body = GenerateRequest {
            model: &model.name,
            prompt,
            system,
            options: GenerateOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
            stream: params.stream,
        };

        let request = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(model.generate_timeout_secs))
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeltaError::Cancelled),
            result = request => result.map_err(map_transport_error)?,
        };
        let response = check_status(response).await?;

        let parsed: GenerateResponse = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeltaError::Cancelled),
            result = response.json::<GenerateResponse>() => result.map_err(map_transport_error)?,
        };
        Ok(normalize_response(&parsed.response))
    }

    /// Start a model download on the host. Progress lines, when the caller
    /// wants them, arrive on the provided sink.
    pub async fn pull(&self, name: &str, progress: Option<mpsc::Sender<String>>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(DeltaError::InvalidInput("empty model name".to_string()));
        }
        let model = self.config.model();
        let url = format!("{}/api/pull", model.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&PullRequest { name })
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await?;
        if let Some(sink) = progress {
            let _ = sink.send(format!("pull of {} accepted by host", name)).await;
        }
        log::info!("requested pull of model {}", name);
        Ok(())
    }
}

/// Collapse a host response onto a single trimmed line
pub fn normalize_response(text: &str) -> String {
    text.trim()
        .replace('\r', "\n")
        .split('\n')
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn map_transport_error(error: reqwest::Error) -> DeltaError {
    log::debug!("model host transport error: {}", error);
    DeltaError::RemoteUnavailable
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.as_u16() < 400 {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => format!("HTTP {}", status),
    };
    Err(DeltaError::RemoteError { message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_joins_lines() {
        assert_eq!(normalize_response("  hello  "), "hello");
        assert_eq!(normalize_response("a\nb"), "a b");
        assert_eq!(normalize_response("a\r\n\r\n  b  \nc"), "a b c");
        assert_eq!(normalize_response("\n\n"), "");
    }

    #[test]
    fn test_generate_request_wire_shape() {
        let body = GenerateRequest {
            model: "llama3.2:1b",
            prompt: "git status",
            system: Some("be brief"),
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 128,
            },
            stream: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "llama3.2:1b");
        assert_eq!(value["prompt"], "git status");
        assert_eq!(value["system"], "be brief");
        assert_eq!(value["options"]["temperature"], 0.1);
        assert_eq!(value["options"]["num_predict"], 128);
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn test_system_omitted_when_absent() {
        let body = GenerateRequest {
            model: "m",
            prompt: "p",
            system: None,
            options: GenerateOptions {
                temperature: 0.1,
                num_predict: 64,
            },
            stream: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("system").is_none());
    }

    #[test]
    fn test_response_parsing() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"model":"m","response":"try git diff","done":true}"#).unwrap();
        assert_eq!(parsed.response, "try git diff");

        let tags: TagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"llama3.2:1b"},{"name":"phi3"}]}"#).unwrap();
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["llama3.2:1b", "phi3"]);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let client = ModelHostClient::new(Arc::new(ConfigStore::default()));
        let cancel = CancellationToken::new();
        let result = client
            .generate("   ", None, &GenerateParams::default(), &cancel)
            .await;
        assert!(matches!(result, Err(DeltaError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let client = ModelHostClient::new(Arc::new(ConfigStore::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client
            .generate("hello", None, &GenerateParams::default(), &cancel)
            .await;
        assert!(matches!(result, Err(DeltaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unreachable_host_maps_to_remote_unavailable() {
        let store = ConfigStore::default();
        // A port nothing listens on
        store.set("model.endpoint", "http://127.0.0.1:1").unwrap();
        let client = ModelHostClient::new(Arc::new(store));
        let cancel = CancellationToken::new();
        let result = client
            .generate("hello", None, &GenerateParams::default(), &cancel)
            .await;
        assert!(matches!(result, Err(DeltaError::RemoteUnavailable)));
        assert!(!client.available().await);
    }
}
