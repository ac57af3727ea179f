//! Delta - Online cognition core for a context-aware shell
//!
//! This crate implements the feedback-driven loop behind Delta's AI
//! features: command ingestion and memory, ART-2 adaptive pattern
//! learning, speculative draft-and-verify thought generation, and the
//! background plumbing (health probing, cancellation) that keeps all of
//! it off the REPL's critical path.

pub mod error;

pub mod config;

pub mod command_memory;
pub mod features;
pub mod art2;
pub mod training;

pub mod model_client;
pub mod speculative;
pub mod inference;

pub mod health;
pub mod thoughts;

pub mod core;

pub use error::{DeltaError, Result};

pub use config::{
    Art2Config, ConfigData, ConfigStore, FeatureConfig, HealthConfig, MemoryConfig,
    ModelConfig, PrivacyConfig, SpecDecodeConfig, TrainingConfig,
};

pub use command_memory::{
    AppendOutcome, CommandEntry, CommandMemory, CommandMemoryStats, CommandOutcome,
    FeedbackKind,
};
pub use features::{
    DirClass, FeatureContext, FeatureExtractor, FeatureExtractorStats, Vocabulary,
};
pub use art2::{
    Art2Engine, Art2Input, Art2Outcome, Art2Stats, Category, CategorySnapshot,
    CategoryState, FeedbackSignal,
};
pub use training::{
    DrainOptions, ExampleSource, TrainingDataStore, TrainingExample, TrainingStats,
};

pub use model_client::{GenerateParams, ModelHostClient};
pub use speculative::{
    DraftProducer, DraftToken, NGramProducer, SpecMetrics, SpecOutput,
    SpeculativeDecoder, Verifier,
};
pub use inference::InferenceCoordinator;

pub use health::{HealthMonitor, HealthNotification, HealthState, NotificationKind};
pub use thoughts::{Thought, ThoughtRequest, ThoughtStream, ThoughtStreamStats};

pub use crate::core::{Core, CoreStats};

/// Current version of the Delta core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
