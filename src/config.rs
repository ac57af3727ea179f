//! Configuration Store
//!
//! Passive, process-wide configuration for the cognition core. Components
//! receive an `Arc<ConfigStore>` at construction and pull the sections they
//! need; nothing in the store references a component back, which keeps the
//! dependency graph acyclic.
//!
//! The string-key surface (`set`/`get`) recognises the dotted option names
//! used by the shell's `:config` command. Unknown keys are rejected, and a
//! value that does not parse as the key's type is rejected as invalid input.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{DeltaError, Result};

/// ART-2 engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Art2Config {
    /// Resonance threshold; higher produces more, finer categories
    pub rho: f64,
    /// Learning rate for the weight update
    pub beta: f64,
    /// Choice parameter (denominator offset), strictly positive
    pub alpha: f64,
    /// Activity floor below which a category is ignored during selection
    pub theta: f64,
    /// Population cap; reaching it triggers eviction
    pub max_categories: usize,
    /// Per-day decay applied to dormant categories
    pub decay_rate: f64,
    /// Minimum activations before a category is eviction-protected
    pub min_activation: u64,
    /// Days without activation before a category goes dormant
    pub dormancy_days: i64,
    /// Eviction score weight for age decay
    pub evict_age_weight: f64,
    /// Eviction score weight for success rate
    pub evict_success_weight: f64,
    /// Eviction score weight for activation count
    pub evict_activation_weight: f64,
}

impl Default for Art2Config {
    fn default() -> Self {
        Self {
            rho: 0.85,
            beta: 0.3,
            alpha: 0.1,
            theta: 0.05,
            max_categories: 64,
            decay_rate: 0.05,
            min_activation: 3,
            dormancy_days: 14,
            evict_age_weight: 0.4,
            evict_success_weight: 0.4,
            evict_activation_weight: 0.2,
        }
    }
}

/// Feature extraction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Target length of the feature vector
    pub vector_size: usize,
    /// Weight of the token-count block in the concatenated vector
    pub token_weight: f64,
    /// Weight of the context-signal block in the concatenated vector
    pub context_weight: f64,
    /// Occurrences before an unknown token is promoted into the vocabulary
    pub vocab_promote_threshold: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            vector_size: 64,
            token_weight: 0.7,
            context_weight: 0.3,
            vocab_promote_threshold: 3,
        }
    }
}

/// Speculative decoder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecDecodeConfig {
    /// Maximum draft window size in tokens
    pub draft_tokens: usize,
    /// EMA acceptance floor before speculation auto-disables
    pub accept_threshold: f64,
    /// n-gram window for the fallback draft producer
    pub ngram_length: usize,
    /// LRU cache bound
    pub cache_size: usize,
    /// Cache entry freshness in seconds
    pub cache_ttl_secs: i64,
    /// Consecutive low-acceptance rounds tolerated before disabling
    pub disable_window: usize,
    /// Requests served direct before speculation is probed again
    pub backoff_requests: usize,
}

impl Default for SpecDecodeConfig {
    fn default() -> Self {
        Self {
            draft_tokens: 8,
            accept_threshold: 0.3,
            ngram_length: 3,
            cache_size: 128,
            cache_ttl_secs: 60,
            disable_window: 5,
            backoff_requests: 20,
        }
    }
}

/// Model host client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the model host
    pub endpoint: String,
    /// Model name passed on every generate request
    pub name: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Maximum tokens per generation
    pub max_tokens: u32,
    /// Timeout for generate requests, seconds
    pub generate_timeout_secs: u64,
    /// Timeout for availability probes, seconds
    pub probe_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            name: "llama3.2:1b".to_string(),
            temperature: 0.1,
            max_tokens: 128,
            generate_timeout_secs: 10,
            probe_timeout_secs: 2,
        }
    }
}

/// Health monitor cadence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Starting probe interval, seconds
    pub check_interval_secs: u64,
    /// Interval multiplier applied on consecutive failures
    pub backoff_factor: f64,
    /// Probe interval ceiling, seconds
    pub max_interval_secs: u64,
    /// Minimum spacing between re-availability notifications, seconds
    pub notify_throttle_secs: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            backoff_factor: 1.5,
            max_interval_secs: 300,
            notify_throttle_secs: 600,
        }
    }
}

/// Command memory retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Retention cap for in-memory entries
    pub max_entries: usize,
    /// Evict oldest entries when full instead of failing the append
    pub prune_when_full: bool,
    /// Environment variable names captured with each entry
    pub env_allowlist: Vec<String>,
    /// Directory for day-indexed command log files; in-memory only when unset
    pub persist_dir: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 2000,
            prune_when_full: true,
            env_allowlist: vec![
                "PWD".to_string(),
                "SHELL".to_string(),
                "TERM".to_string(),
                "LANG".to_string(),
                "USER".to_string(),
            ],
            persist_dir: None,
        }
    }
}

/// Training data accumulation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Pending-example count at which `ready()` flips true
    pub threshold: usize,
    /// Cap on synthetic examples as a fraction of the original batch
    pub max_augment_fraction: f64,
    /// Directory for exported batches; export disabled when unset
    pub export_dir: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            threshold: 50,
            max_augment_fraction: 0.25,
            export_dir: None,
        }
    }
}

/// Privacy filter settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Regex patterns; a command matching any of them is never stored
    pub patterns: Vec<String>,
}

/// Full configuration document as persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigData {
    #[serde(default)]
    pub art2: Art2Config,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default, rename = "spec")]
    pub spec_decode: SpecDecodeConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
}

/// Thread-safe configuration holder
///
/// Readers take section snapshots (cheap clones); writers go through
/// `set` or `replace`. Holding no references into the store means a
/// component never observes a torn update.
#[derive(Debug, Default)]
pub struct ConfigStore {
    data: RwLock<ConfigData>,
}

impl ConfigStore {
    pub fn new(data: ConfigData) -> Self {
        Self { data: RwLock::new(data) }
    }

    /// Load from a JSON file. Unknown keys in the file are tolerated;
    /// type mismatches are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let data: ConfigData = serde_json::from_str(&raw)
            .map_err(|e| DeltaError::InvalidInput(format!("config type mismatch: {}", e)))?;
        Ok(Self::new(data))
    }

    /// Write the current configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = self.snapshot();
        let raw = serde_json::to_string_pretty(&data)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Full copy of the current configuration.
    pub fn snapshot(&self) -> ConfigData {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn art2(&self) -> Art2Config {
        self.data.read().unwrap_or_else(|e| e.into_inner()).art2.clone()
    }

    pub fn features(&self) -> FeatureConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).features.clone()
    }

    pub fn spec_decode(&self) -> SpecDecodeConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).spec_decode.clone()
    }

    pub fn model(&self) -> ModelConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).model.clone()
    }

    pub fn health(&self) -> HealthConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).health.clone()
    }

    pub fn memory(&self) -> MemoryConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).memory.clone()
    }

    pub fn training(&self) -> TrainingConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).training.clone()
    }

    pub fn privacy(&self) -> PrivacyConfig {
        self.data.read().unwrap_or_else(|e| e.into_inner()).privacy.clone()
    }

    /// Replace the whole configuration atomically.
    pub fn replace(&self, data: ConfigData) {
        *self.data.write().unwrap_or_else(|e| e.into_inner()) = data;
    }

    /// Set a single option by its dotted key.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        match key {
            "art2.rho" => data.art2.rho = parse_unit(key, value)?,
            "art2.beta" => data.art2.beta = parse_unit(key, value)?,
            "art2.alpha" => {
                let v: f64 = value.parse()?;
                if v <= 0.0 {
                    return Err(DeltaError::InvalidInput(format!(
                        "{} must be positive, got {}",
                        key, v
                    )));
                }
                data.art2.alpha = v;
            }
            "art2.theta" => data.art2.theta = parse_unit(key, value)?,
            "art2.max_categories" => data.art2.max_categories = value.parse()?,
            "art2.decay_rate" => data.art2.decay_rate = parse_unit(key, value)?,
            "features.vector_size" => data.features.vector_size = value.parse()?,
            "spec.draft_tokens" => data.spec_decode.draft_tokens = value.parse()?,
            "spec.accept_threshold" => data.spec_decode.accept_threshold = parse_unit(key, value)?,
            "spec.ngram_length" => data.spec_decode.ngram_length = value.parse()?,
            "spec.cache_size" => data.spec_decode.cache_size = value.parse()?,
            "model.endpoint" => data.model.endpoint = value.to_string(),
            "model.name" => data.model.name = value.to_string(),
            "model.temperature" => data.model.temperature = value.parse()?,
            "model.max_tokens" => data.model.max_tokens = value.parse()?,
            "health.check_interval" => data.health.check_interval_secs = value.parse()?,
            "memory.max_entries" => data.memory.max_entries = value.parse()?,
            "training.threshold" => data.training.threshold = value.parse()?,
            "privacy.patterns" => {
                let patterns: Vec<String> = value
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                for p in &patterns {
                    regex::Regex::new(p)?;
                }
                data.privacy.patterns = patterns;
            }
            _ => {
                return Err(DeltaError::ConfigError(format!("unknown option: {}", key)));
            }
        }
        Ok(())
    }

    /// Read a single option by its dotted key.
    pub fn get(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let value = match key {
            "art2.rho" => data.art2.rho.to_string(),
            "art2.beta" => data.art2.beta.to_string(),
            "art2.alpha" => data.art2.alpha.to_string(),
            "art2.theta" => data.art2.theta.to_string(),
            "art2.max_categories" => data.art2.max_categories.to_string(),
            "art2.decay_rate" => data.art2.decay_rate.to_string(),
            "features.vector_size" => data.features.vector_size.to_string(),
            "spec.draft_tokens" => data.spec_decode.draft_tokens.to_string(),
            "spec.accept_threshold" => data.spec_decode.accept_threshold.to_string(),
            "spec.ngram_length" => data.spec_decode.ngram_length.to_string(),
            "spec.cache_size" => data.spec_decode.cache_size.to_string(),
            "model.endpoint" => data.model.endpoint.clone(),
            "model.name" => data.model.name.clone(),
            "model.temperature" => data.model.temperature.to_string(),
            "model.max_tokens" => data.model.max_tokens.to_string(),
            "health.check_interval" => data.health.check_interval_secs.to_string(),
            "memory.max_entries" => data.memory.max_entries.to_string(),
            "training.threshold" => data.training.threshold.to_string(),
            "privacy.patterns" => data.privacy.patterns.join(","),
            _ => return None,
        };
        Some(value)
    }
}

fn parse_unit(key: &str, value: &str) -> Result<f64> {
    let v: f64 = value.parse()?;
    if !(0.0..=1.0).contains(&v) {
        return Err(DeltaError::InvalidInput(format!(
            "{} must be in [0, 1], got {}",
            key, v
        )));
    }
    Ok(v)
}
