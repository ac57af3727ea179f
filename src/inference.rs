//! Inference Coordination
//!
//! Owns generation parameters and routes each request either through the
//! speculative decoder or straight to the model host. Concurrency is
//! bounded with a semaphore: when every permit is taken the request is
//! dropped with a `Degraded` error instead of queueing behind the prompt.
//! A missing thought is cheaper than a stalled REPL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::error::{DeltaError, Result};
use crate::model_client::{GenerateParams, ModelHostClient};
use crate::speculative::{SpecMetrics, SpeculativeDecoder};

/// Ceiling on concurrent generate requests
const MAX_IN_FLIGHT: usize = 2;

/// System prompt used on the direct generation route
const THOUGHT_SYSTEM: &str =
    "You observe a user's shell session. Reply with one short, practical sentence \
     about what they might want to do next. No preamble, no quotes.";

/// Routes generation requests and applies back-pressure
pub struct InferenceCoordinator {
    config: Arc<ConfigStore>,
    client: Arc<ModelHostClient>,
    decoder: Arc<SpeculativeDecoder>,
    permits: Arc<Semaphore>,
    speculate: AtomicBool,
}

impl InferenceCoordinator {
    pub fn new(
        config: Arc<ConfigStore>,
        client: Arc<ModelHostClient>,
        decoder: Arc<SpeculativeDecoder>,
    ) -> Self {
        Self {
            config,
            client,
            decoder,
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            speculate: AtomicBool::new(true),
        }
    }

    /// Choose between speculative and direct generation for new requests
    pub fn set_speculation(&self, enabled: bool) {
        self.speculate.store(enabled, Ordering::SeqCst);
    }

    pub fn speculation_enabled(&self) -> bool {
        self.speculate.load(Ordering::SeqCst)
    }

    /// True when the decoder has auto-disabled speculation
    pub fn is_degraded(&self) -> bool {
        self.decoder.is_degraded()
    }

    pub fn decoder_metrics(&self) -> SpecMetrics {
        self.decoder.metrics()
    }

    /// Generation parameters for thought requests: configured temperature,
    /// token budget clamped to the thought window
    pub fn thought_params(&self) -> GenerateParams {
        let model = self.config.model();
        GenerateParams {
            temperature: model.temperature,
            max_tokens: model.max_tokens.clamp(64, 256),
            stream: false,
        }
    }

    /// Run one generation request through the configured route.
    ///
    /// Fails fast with `Degraded` when all in-flight permits are taken.
    pub async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        if prompt.trim().is_empty() {
            return Err(DeltaError::InvalidInput("empty prompt".to_string()));
        }
        let _permit = self
            .permits
            .try_acquire()
            .map_err(|_| DeltaError::Degraded("inference at capacity".to_string()))?;

        let params = self.thought_params();
        if self.speculate.load(Ordering::SeqCst) {
            let output = self.decoder.generate(prompt, &params, cancel, false).await?;
            Ok(output.text)
        } else {
            self.client
                .generate(prompt, Some(THOUGHT_SYSTEM), &params, cancel)
                .await
        }
    }
}
