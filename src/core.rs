//! Core Wiring
//!
//! The process-wide `Core` value: owns every subsystem, constructed leaves
//! first (config, memory, features, learner, training, client, decoder,
//! health, thoughts) and passed by reference to the REPL front-end.
//!
//! The REPL-facing surface is deliberately small: ingest a command, poll
//! for a thought, attach feedback, toggle the AI flag, ask for an inline
//! prediction. Everything slow happens on background tasks; nothing here
//! blocks the prompt. Locks guard short critical sections only and are
//! never held across model-host I/O.

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::art2::{Art2Engine, Art2Input, Art2Stats, FeedbackSignal};
use crate::command_memory::{
    AppendOutcome, CommandMemory, CommandMemoryStats, CommandOutcome, FeedbackKind,
};
use crate::config::ConfigStore;
use crate::error::{DeltaError, Result};
use crate::features::{DirClass, FeatureContext, FeatureExtractor, FeatureExtractorStats};
use crate::health::{HealthMonitor, HealthNotification};
use crate::inference::InferenceCoordinator;
use crate::model_client::ModelHostClient;
use crate::speculative::{NGramProducer, SpecMetrics, SpeculativeDecoder};
use crate::thoughts::{Thought, ThoughtStream, ThoughtStreamStats};
use crate::training::{
    DrainOptions, ExampleSource, TrainingDataStore, TrainingExample, TrainingStats,
};

/// How many recent commands feed the n-gram draft producer
const NGRAM_WINDOW_COMMANDS: usize = 50;

/// How many recent commands appear in the thought prompt
const PROMPT_CONTEXT_COMMANDS: usize = 3;

/// Aggregated component statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStats {
    pub memory: CommandMemoryStats,
    pub features: FeatureExtractorStats,
    pub art2: Art2Stats,
    pub training: TrainingStats,
    pub thoughts: ThoughtStreamStats,
    pub speculative: SpecMetrics,
    pub host_available: bool,
    pub enabled: bool,
    pub degraded: bool,
}

/// The online cognition core
pub struct Core {
    config: Arc<ConfigStore>,
    memory: Arc<RwLock<CommandMemory>>,
    features: Arc<RwLock<FeatureExtractor>>,
    art2: Arc<RwLock<Art2Engine>>,
    training: Arc<RwLock<TrainingDataStore>>,
    client: Arc<ModelHostClient>,
    decoder: Arc<SpeculativeDecoder>,
    inference: Arc<InferenceCoordinator>,
    health: Arc<HealthMonitor>,
    thoughts: Arc<ThoughtStream>,
    enabled: AtomicBool,
    shutdown: CancellationToken,
    last_exit_code: AtomicI32,
    last_prediction: RwLock<Option<String>>,
}

impl Core {
    /// Construct the core and start its background work. Must be called
    /// inside a tokio runtime; the health monitor task starts immediately.
    pub fn new(config: Arc<ConfigStore>) -> Result<Self> {
        let shutdown = CancellationToken::new();

        let memory_cfg = config.memory();
        let memory = CommandMemory::new(
            memory_cfg.max_entries,
            memory_cfg.prune_when_full,
            memory_cfg.env_allowlist.clone(),
            &config.privacy().patterns,
            memory_cfg.persist_dir.as_ref().map(PathBuf::from),
        )?;

        let features = FeatureExtractor::new(config.features());
        let art2 = Art2Engine::new(config.art2(), config.features().vector_size)?;
        let training = TrainingDataStore::new(config.training());

        let client = Arc::new(ModelHostClient::new(config.clone()));
        let decoder = Arc::new(SpeculativeDecoder::new(
            config.spec_decode(),
            client.clone() as Arc<dyn crate::speculative::Verifier>,
        ));
        let inference = Arc::new(InferenceCoordinator::new(
            config.clone(),
            client.clone(),
            decoder.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health(),
            client.clone(),
            shutdown.child_token(),
        ));
        health.spawn();

        let thoughts = Arc::new(ThoughtStream::new(shutdown.child_token()));

        log::info!("cognition core initialised");
        Ok(Self {
            config,
            memory: Arc::new(RwLock::new(memory)),
            features: Arc::new(RwLock::new(features)),
            art2: Arc::new(RwLock::new(art2)),
            training: Arc::new(RwLock::new(training)),
            client,
            decoder,
            inference,
            health,
            thoughts,
            enabled: AtomicBool::new(true),
            shutdown,
            last_exit_code: AtomicI32::new(0),
            last_prediction: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn client(&self) -> &Arc<ModelHostClient> {
        &self.client
    }

    /// Ingest a freshly executed command: record it, learn its pattern,
    /// refresh the draft model and kick off a background thought.
    pub fn on_command(&self, command: &str, outcome: &CommandOutcome) -> Result<()> {
        let stored = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            memory.append(command, outcome)?
        };
        let entry_timestamp = match stored {
            AppendOutcome::Stored(_) => {
                let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
                memory.last().map(|e| e.timestamp)
            }
            // Privacy-filtered commands are not learned from either
            AppendOutcome::Skipped => return Ok(()),
        };

        let previous_error = self.last_exit_code.swap(outcome.exit_code, Ordering::SeqCst) != 0;
        let context = FeatureContext {
            hour_of_day: entry_timestamp.map(|t| t.hour()).unwrap_or(12),
            git_repo: Path::new(&outcome.working_dir).join(".git").exists(),
            file_count: count_files(&outcome.working_dir),
            previous_error,
        };

        let vector = {
            let mut features = self.features.write().unwrap_or_else(|e| e.into_inner());
            features.observe(command);
            features.extract(command, &context, &outcome.working_dir)?
        };

        let dir_tag = format!("{:?}", DirClass::classify(&outcome.working_dir)).to_lowercase();
        let art2_outcome = {
            let mut art2 = self.art2.write().unwrap_or_else(|e| e.into_inner());
            art2.process(Art2Input {
                vector: &vector,
                command,
                context_tag: Some(&dir_tag),
                feedback: None,
            })?
        };

        // Category-outcome correlation: a resonant command's exit status is
        // weak supervision for the category that claimed it
        if art2_outcome.resonated {
            let label = if outcome.exit_code == 0 { 1 } else { -1 };
            let example = TrainingExample::new(
                command,
                &outcome.working_dir,
                format!("category:{}", art2_outcome.category_id),
                label,
                art2_outcome.match_score.max(f64::EPSILON),
                ExampleSource::Art2,
            );
            let mut training = self.training.write().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = training.add(example) {
                log::warn!("failed to record art2 training example: {}", e);
            }
        }

        self.refresh_draft_producer();
        self.spawn_thought_producer(command, outcome);
        Ok(())
    }

    /// Non-blocking poll for the most recent thought
    pub fn next_thought(&self) -> Option<Thought> {
        if self.health.is_degraded() {
            // Degraded: stale thoughts are silently discarded
            while self.thoughts.next_thought().is_some() {}
            return None;
        }
        let thought = self.thoughts.next_thought();
        if let Some(t) = &thought {
            *self.last_prediction.write().unwrap_or_else(|e| e.into_inner()) =
                Some(t.text.clone());
        }
        thought
    }

    /// Apply feedback to the last command (or the latest matching one)
    pub fn feedback(&self, kind: FeedbackKind, correction: Option<String>) -> Result<()> {
        let (entry, changed) = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            memory.set_feedback(None, kind, correction.clone())?
        };
        if !changed {
            // Identical feedback twice is a no-op beyond the stored entry
            return Ok(());
        }

        let context = FeatureContext {
            hour_of_day: entry.timestamp.hour(),
            git_repo: Path::new(&entry.working_dir).join(".git").exists(),
            file_count: count_files(&entry.working_dir),
            previous_error: false,
        };
        let vector = {
            let mut features = self.features.write().unwrap_or_else(|e| e.into_inner());
            features.extract(&entry.command, &context, &entry.working_dir)?
        };

        let signal = match kind {
            FeedbackKind::Helpful => FeedbackSignal::Positive,
            FeedbackKind::Unhelpful => FeedbackSignal::Negative,
            FeedbackKind::Correction => FeedbackSignal::Correction(
                entry.correction.clone().unwrap_or_else(|| entry.command.clone()),
            ),
        };
        let outcome = {
            let mut art2 = self.art2.write().unwrap_or_else(|e| e.into_inner());
            art2.process(Art2Input {
                vector: &vector,
                command: &entry.command,
                context_tag: None,
                feedback: Some(signal),
            })?
        };

        let prediction = self
            .last_prediction
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();

        let mut training = self.training.write().unwrap_or_else(|e| e.into_inner());
        training.add(TrainingExample::new(
            &entry.command,
            &entry.working_dir,
            &prediction,
            kind.label(),
            1.0,
            ExampleSource::Feedback,
        ))?;
        if let Some(corrected) = outcome.synthetic_correction {
            training.add(TrainingExample::new(
                &entry.command,
                &entry.working_dir,
                corrected,
                1,
                1.0,
                ExampleSource::Synthetic,
            ))?;
        }
        Ok(())
    }

    /// Synchronous ART-2 prediction for inline hints. Works even while the
    /// model host is down; returns `None` when the core is disabled or no
    /// category resonates.
    pub fn predict_for(&self, command: &str) -> Option<(String, f64)> {
        if !self.is_enabled() {
            return None;
        }
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return None;
        }
        // Predict in the context the command would run in now: the current
        // hour and the directory of the latest recorded command
        let working_dir = {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            memory
                .last()
                .map(|e| e.working_dir.clone())
                .unwrap_or_else(|| ".".to_string())
        };
        let context = FeatureContext {
            hour_of_day: chrono::Utc::now().hour(),
            git_repo: Path::new(&working_dir).join(".git").exists(),
            file_count: count_files(&working_dir),
            previous_error: self.last_exit_code.load(Ordering::SeqCst) != 0,
        };
        let vector = {
            let mut features = self.features.write().unwrap_or_else(|e| e.into_inner());
            features.extract(trimmed, &context, &working_dir).ok()?
        };
        let art2 = self.art2.read().unwrap_or_else(|e| e.into_inner());
        art2.predict(&vector).ok().flatten()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            // Disabling cancels in-flight thoughts; the stream stays usable
            self.thoughts.cancel_inflight();
        }
        log::info!("ai features {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// True while the model host is unreachable or speculation is disabled
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded() || self.decoder.is_degraded()
    }

    pub fn host_available(&self) -> bool {
        self.health.is_available()
    }

    /// One-shot availability notification, if the monitor produced one
    pub fn take_health_notification(&self) -> Option<HealthNotification> {
        self.health.take_notification()
    }

    /// True when enough training examples are pending for a training run
    pub fn training_ready(&self) -> bool {
        self.training.read().unwrap_or_else(|e| e.into_inner()).ready()
    }

    /// Drain a training batch (see [`TrainingDataStore::drain_batch`])
    pub fn drain_training_batch(
        &self,
        options: &DrainOptions,
    ) -> Result<(Vec<TrainingExample>, Vec<TrainingExample>)> {
        self.training
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain_batch(options)
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            memory: self.memory.read().unwrap_or_else(|e| e.into_inner()).stats(),
            features: self.features.read().unwrap_or_else(|e| e.into_inner()).stats(),
            art2: self.art2.read().unwrap_or_else(|e| e.into_inner()).stats(),
            training: self.training.read().unwrap_or_else(|e| e.into_inner()).stats(),
            thoughts: self.thoughts.stats(),
            speculative: self.decoder.metrics(),
            host_available: self.health.is_available(),
            enabled: self.is_enabled(),
            degraded: self.is_degraded(),
        }
    }

    /// Persist learned state (vocabulary and category table) under `dir`
    pub fn save_state(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DeltaError::StorageError(format!("create {}: {}", dir.display(), e)))?;
        self.features
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .vocabulary()
            .save(&dir.join("vocabulary.json"))?;
        self.art2
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .save(&dir.join("categories.json"))?;
        Ok(())
    }

    /// Restore state persisted with [`Core::save_state`]. Missing files are
    /// not an error; whatever exists is loaded.
    pub fn load_state(&self, dir: &Path) -> Result<()> {
        let vocab_path = dir.join("vocabulary.json");
        if vocab_path.exists() {
            let vocabulary = crate::features::Vocabulary::load(&vocab_path)?;
            let mut features = self.features.write().unwrap_or_else(|e| e.into_inner());
            *features = FeatureExtractor::with_vocabulary(self.config.features(), vocabulary);
        }
        let categories_path = dir.join("categories.json");
        if categories_path.exists() {
            let mut art2 = self.art2.write().unwrap_or_else(|e| e.into_inner());
            art2.load(&categories_path)?;
        }
        Ok(())
    }

    /// Cancel all background work. In-flight host requests observe their
    /// tokens and abort before the process exits.
    pub fn shutdown(&self) {
        self.thoughts.cancel_all();
        self.shutdown.cancel();
        log::info!("cognition core shut down");
    }

    /// Rebuild the n-gram draft producer from the recent command window
    fn refresh_draft_producer(&self) {
        let tokens = {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            memory.recent_token_stream(NGRAM_WINDOW_COMMANDS)
        };
        let n = self.config.spec_decode().ngram_length;
        self.decoder.set_producer(Box::new(NGramProducer::from_tokens(&tokens, n)));
    }

    /// Spawn one background thought producer for an ingested command
    fn spawn_thought_producer(&self, command: &str, outcome: &CommandOutcome) {
        if !self.is_enabled() || self.health.is_degraded() {
            return;
        }

        let recent: Vec<String> = {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            memory
                .tail(PROMPT_CONTEXT_COMMANDS)
                .iter()
                .map(|e| e.command.clone())
                .collect()
        };
        let prompt = format!(
            "The user ran `{}` in {} (exit code {}). Recent commands: {}. \
             In one short sentence, what might they want to do next?",
            command,
            outcome.working_dir,
            outcome.exit_code,
            recent.join("; "),
        );

        let request = self.thoughts.begin();
        let inference = self.inference.clone();
        let thoughts = self.thoughts.clone();
        tokio::spawn(async move {
            match inference.generate(&prompt, &request.cancel).await {
                Ok(text) => thoughts.complete(request.id, &text),
                Err(DeltaError::Cancelled) => thoughts.abandon(request.id),
                Err(e) => {
                    // Background failures become state, never prompt noise
                    log::debug!("thought generation failed: {}", e);
                    thoughts.abandon(request.id);
                }
            }
        });
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Count directory entries, capped so huge directories stay cheap; the
/// extractor only buckets the value anyway.
fn count_files(dir: &str) -> Option<usize> {
    let entries = std::fs::read_dir(dir).ok()?;
    Some(entries.take(201).count())
}
