//! Feature Extraction
//!
//! Deterministic transform from a command line plus execution context into a
//! fixed-length, unit-normalised feature vector. The same vocabulary state
//! and input always produce a bit-identical vector, which the ART-2 engine
//! and the embedding lookup both rely on.
//!
//! Tokenisation collapses special forms to canonical tokens (`<NUM>`,
//! `<PATH>`, `<URL>`, ...) so that `vim /etc/hosts` and `vim /tmp/notes`
//! land near each other. The token block is TF-weighted by per-token
//! importance (commands over flags over paths), concatenated with a small
//! dense block of context signals, resampled to the target size and
//! L2-normalised.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::FeatureConfig;
use crate::error::{DeltaError, Result};

pub const TOKEN_NUM: &str = "<NUM>";
pub const TOKEN_PATH: &str = "<PATH>";
pub const TOKEN_URL: &str = "<URL>";
pub const TOKEN_EMAIL: &str = "<EMAIL>";
pub const TOKEN_PIPE: &str = "<PIPE>";
pub const TOKEN_REDIRECT: &str = "<REDIRECT>";
pub const TOKEN_BACKGROUND: &str = "<BACKGROUND>";
pub const TOKEN_SUDO: &str = "<SUDO>";
pub const TOKEN_UNKNOWN: &str = "<UNKNOWN>";

const WEIGHT_COMMAND: f64 = 1.0;
const WEIGHT_FLAG: f64 = 0.8;
const WEIGHT_PATH: f64 = 0.6;
const WEIGHT_EXTENSION: f64 = 0.5;
const WEIGHT_WORD: f64 = 0.4;

/// Number of dense context signals appended to the token block
const CONTEXT_SIGNALS: usize = 10;

/// Directory classification used as a context signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirClass {
    Dev,
    Config,
    Docs,
    Test,
    Temp,
    System,
    Other,
}

impl DirClass {
    pub fn classify(path: &str) -> Self {
        let lower = path.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if has(&["/src", "/code", "/projects", "/dev", "/repos"]) {
            DirClass::Dev
        } else if has(&["/etc", "/.config", "/config"]) {
            DirClass::Config
        } else if has(&["/docs", "/doc", "/documents"]) {
            DirClass::Docs
        } else if has(&["/test", "/tests", "/spec"]) {
            DirClass::Test
        } else if has(&["/tmp", "/temp", "/cache"]) {
            DirClass::Temp
        } else if has(&["/usr", "/bin", "/sbin", "/var", "/lib", "/opt"]) {
            DirClass::System
        } else {
            DirClass::Other
        }
    }

    fn signal(self) -> f64 {
        match self {
            DirClass::Dev => 0.0,
            DirClass::Config => 1.0 / 6.0,
            DirClass::Docs => 2.0 / 6.0,
            DirClass::Test => 3.0 / 6.0,
            DirClass::Temp => 4.0 / 6.0,
            DirClass::System => 5.0 / 6.0,
            DirClass::Other => 1.0,
        }
    }
}

/// Execution context accompanying a command at extraction time. All fields
/// are inputs, never sampled inside the extractor, so extraction stays
/// deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContext {
    /// Hour of day, 0-23
    pub hour_of_day: u32,
    /// Whether the working directory is inside a git repository
    pub git_repo: bool,
    /// Number of files in the working directory, if known
    pub file_count: Option<usize>,
    /// Whether the previous command exited non-zero
    pub previous_error: bool,
}

impl Default for FeatureContext {
    fn default() -> Self {
        Self {
            hour_of_day: 12,
            git_repo: false,
            file_count: None,
            previous_error: false,
        }
    }
}

/// Persisted vocabulary document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VocabularyDoc {
    vocabulary: HashMap<String, usize>,
    weights: HashMap<String, f64>,
    size: usize,
}

/// Learned token vocabulary with per-token importance weights
#[derive(Debug, Clone)]
pub struct Vocabulary {
    token_to_idx: HashMap<String, usize>,
    weights: Vec<f64>,
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Seed vocabulary: canonical tokens plus common shell commands
    pub fn seeded() -> Self {
        let mut vocab = Self {
            token_to_idx: HashMap::new(),
            weights: Vec::new(),
            tokens: Vec::new(),
        };
        for special in [
            TOKEN_UNKNOWN,
            TOKEN_NUM,
            TOKEN_PATH,
            TOKEN_URL,
            TOKEN_EMAIL,
            TOKEN_PIPE,
            TOKEN_REDIRECT,
            TOKEN_BACKGROUND,
            TOKEN_SUDO,
        ] {
            vocab.insert(special, WEIGHT_WORD);
        }
        for command in [
            "git", "ls", "cd", "cat", "grep", "find", "make", "cargo", "docker",
            "npm", "python", "vim", "ssh", "curl", "rm", "cp", "mv", "mkdir",
            "echo", "tar", "kubectl", "go",
        ] {
            vocab.insert(command, WEIGHT_COMMAND);
        }
        vocab
    }

    fn insert(&mut self, token: &str, weight: f64) -> usize {
        if let Some(&idx) = self.token_to_idx.get(token) {
            return idx;
        }
        let idx = self.tokens.len();
        self.token_to_idx.insert(token.to_string(), idx);
        self.tokens.push(token.to_string());
        self.weights.push(weight);
        idx
    }

    pub fn lookup(&self, token: &str) -> Option<(usize, f64)> {
        self.token_to_idx.get(token).map(|&idx| (idx, self.weights[idx]))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.token_to_idx.contains_key(token)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = VocabularyDoc {
            vocabulary: self.token_to_idx.clone(),
            weights: self
                .tokens
                .iter()
                .cloned()
                .zip(self.weights.iter().copied())
                .collect(),
            size: self.tokens.len(),
        };
        let raw = serde_json::to_string_pretty(&doc)?;
        fs::write(path, raw).map_err(|e| DeltaError::StorageError(format!("vocabulary save: {}", e)))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DeltaError::StorageError(format!("vocabulary load: {}", e)))?;
        let doc: VocabularyDoc = serde_json::from_str(&raw)?;
        if doc.vocabulary.len() != doc.size {
            return Err(DeltaError::InvalidInput(format!(
                "vocabulary size {} does not match entry count {}",
                doc.size,
                doc.vocabulary.len()
            )));
        }
        let mut tokens = vec![String::new(); doc.size];
        for (token, idx) in &doc.vocabulary {
            if *idx >= doc.size {
                return Err(DeltaError::InvalidInput(format!(
                    "vocabulary index {} out of range",
                    idx
                )));
            }
            tokens[*idx] = token.clone();
        }
        let weights = tokens
            .iter()
            .map(|t| doc.weights.get(t).copied().unwrap_or(WEIGHT_WORD))
            .collect();
        let token_to_idx = doc.vocabulary;
        Ok(Self {
            token_to_idx,
            weights,
            tokens,
        })
    }
}

/// Extractor statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureExtractorStats {
    pub extractions: u64,
    pub vocabulary_size: usize,
    pub promoted_tokens: u64,
}

/// Deterministic feature extractor over a learned vocabulary
#[derive(Debug)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    vocabulary: Vocabulary,
    unknown_counts: HashMap<String, u32>,
    stats: FeatureExtractorStats,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            vocabulary: Vocabulary::seeded(),
            unknown_counts: HashMap::new(),
            stats: FeatureExtractorStats::default(),
        }
    }

    pub fn with_vocabulary(config: FeatureConfig, vocabulary: Vocabulary) -> Self {
        Self {
            config,
            vocabulary,
            unknown_counts: HashMap::new(),
            stats: FeatureExtractorStats::default(),
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn stats(&self) -> FeatureExtractorStats {
        let mut stats = self.stats.clone();
        stats.vocabulary_size = self.vocabulary.len();
        stats
    }

    /// Extract the unit feature vector for a command in its context.
    ///
    /// Does not mutate the vocabulary; call [`FeatureExtractor::observe`]
    /// afterwards to feed the promotion counters.
    pub fn extract(
        &mut self,
        command: &str,
        context: &FeatureContext,
        working_dir: &str,
    ) -> Result<DVector<f64>> {
        let canonical = Self::canonicalize(command);
        if canonical.is_empty() {
            return Err(DeltaError::InvalidInput("empty command".to_string()));
        }

        let token_block = self.token_vector(&canonical);
        let context_block = Self::context_vector(command, &canonical, context, working_dir);

        let mut combined =
            Vec::with_capacity(token_block.len() + context_block.len());
        combined.extend(token_block.iter().map(|v| v * self.config.token_weight));
        combined.extend(context_block.iter().map(|v| v * self.config.context_weight));

        let resampled = resample(&combined, self.config.vector_size);
        let mut vector = DVector::from_vec(resampled);

        let norm = vector.norm();
        if norm > f64::EPSILON {
            vector /= norm;
        } else {
            // A command with zero weight everywhere still needs a valid
            // direction; fall back to the unknown axis.
            vector[0] = 1.0;
        }

        self.stats.extractions += 1;
        Ok(vector)
    }

    /// Feed promotion counters with the tokens of an executed command.
    /// Unknown tokens recurring past the threshold join the vocabulary with
    /// a weight derived from their shape.
    pub fn observe(&mut self, command: &str) {
        let canonical = Self::canonicalize(command);
        for token in canonical {
            if self.vocabulary.contains(&token.text) {
                continue;
            }
            let count = self.unknown_counts.entry(token.text.clone()).or_insert(0);
            *count += 1;
            if *count >= self.config.vocab_promote_threshold {
                let weight = default_weight(&token.text);
                self.vocabulary.insert(&token.text, weight);
                self.unknown_counts.remove(&token.text);
                self.stats.promoted_tokens += 1;
                log::debug!("promoted token {:?} into vocabulary", token.text);
            }
        }
    }

    /// Canonical token stream for a command line
    fn canonicalize(command: &str) -> Vec<CanonicalToken> {
        let mut out = Vec::new();
        let mut first_word = true;
        for raw in command.split_whitespace() {
            let token = match raw {
                "|" => CanonicalToken::special(TOKEN_PIPE),
                ">" | ">>" | "<" | "2>" | "2>>" | "&>" => CanonicalToken::special(TOKEN_REDIRECT),
                "&" => CanonicalToken::special(TOKEN_BACKGROUND),
                "sudo" | "doas" if first_word => {
                    out.push(CanonicalToken::special(TOKEN_SUDO));
                    // The following word is the command being escalated
                    continue;
                }
                _ => Self::canonicalize_word(raw, first_word),
            };
            first_word = false;
            // A pipe starts a fresh command position
            if token.text == TOKEN_PIPE {
                first_word = true;
            }
            if let Some(ext) = token.extension.clone() {
                out.push(token);
                out.push(CanonicalToken::special(&ext));
            } else {
                out.push(token);
            }
        }
        out
    }

    fn canonicalize_word(raw: &str, is_command: bool) -> CanonicalToken {
        if raw.contains("://") {
            return CanonicalToken::special(TOKEN_URL);
        }
        if raw.contains('@') && raw.contains('.') && !raw.starts_with('-') {
            return CanonicalToken::special(TOKEN_EMAIL);
        }
        if raw.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') && raw.chars().any(|c| c.is_ascii_digit()) {
            return CanonicalToken::special(TOKEN_NUM);
        }
        if raw.contains('/') {
            let extension = Path::new(raw)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!("<EXT:{}>", e.to_lowercase()));
            return CanonicalToken {
                text: TOKEN_PATH.to_string(),
                class: TokenClass::Path,
                extension,
            };
        }
        let class = if raw.starts_with('-') {
            TokenClass::Flag
        } else if is_command {
            TokenClass::Command
        } else {
            TokenClass::Word
        };
        CanonicalToken {
            text: raw.to_string(),
            class,
            extension: None,
        }
    }

    /// TF-weighted count vector over the vocabulary
    fn token_vector(&self, tokens: &[CanonicalToken]) -> Vec<f64> {
        let mut counts = vec![0.0_f64; self.vocabulary.len()];
        for token in tokens {
            match self.vocabulary.lookup(&token.text) {
                Some((idx, vocab_weight)) => {
                    counts[idx] += vocab_weight.max(token.class.weight());
                }
                None => {
                    if let Some((idx, _)) = self.vocabulary.lookup(TOKEN_UNKNOWN) {
                        counts[idx] += WEIGHT_WORD;
                    }
                }
            }
        }
        // Term frequency: scale by token count so long pipelines do not
        // dominate on magnitude before normalisation
        let total = tokens.len() as f64;
        for value in &mut counts {
            *value /= total;
        }
        counts
    }

    /// Dense context signal block, all values in [0, 1]
    fn context_vector(
        raw: &str,
        tokens: &[CanonicalToken],
        context: &FeatureContext,
        working_dir: &str,
    ) -> Vec<f64> {
        let mut signals = Vec::with_capacity(CONTEXT_SIGNALS);

        // Command length, saturating at 120 characters
        signals.push((raw.len() as f64 / 120.0).min(1.0));
        signals.push(bool_signal(tokens.iter().any(|t| t.class == TokenClass::Flag)));
        signals.push(bool_signal(tokens.iter().any(|t| t.text == TOKEN_PIPE)));

        // Complexity: chaining, separators, command substitution
        let complexity = ["&&", ";", "$(", "`"]
            .iter()
            .filter(|m| raw.contains(**m))
            .count() as f64
            / 4.0;
        signals.push(complexity.min(1.0));

        signals.push(DirClass::classify(working_dir).signal());
        signals.push(bool_signal(context.git_repo));
        signals.push(file_count_bucket(context.file_count));
        signals.push(context.hour_of_day.min(23) as f64 / 23.0);
        signals.push(bool_signal(context.previous_error));
        signals.push(bool_signal(tokens.iter().any(|t| t.text == TOKEN_REDIRECT)));

        signals
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CanonicalToken {
    text: String,
    class: TokenClass,
    extension: Option<String>,
}

impl CanonicalToken {
    fn special(text: &str) -> Self {
        Self {
            text: text.to_string(),
            class: TokenClass::Word,
            extension: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Command,
    Flag,
    Path,
    Word,
}

impl TokenClass {
    fn weight(self) -> f64 {
        match self {
            TokenClass::Command => WEIGHT_COMMAND,
            TokenClass::Flag => WEIGHT_FLAG,
            TokenClass::Path => WEIGHT_PATH,
            TokenClass::Word => WEIGHT_WORD,
        }
    }
}

fn bool_signal(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn file_count_bucket(count: Option<usize>) -> f64 {
    match count {
        None => 0.0,
        Some(0) => 0.1,
        Some(1..=10) => 0.3,
        Some(11..=50) => 0.5,
        Some(51..=200) => 0.7,
        Some(_) => 1.0,
    }
}

fn default_weight(token: &str) -> f64 {
    if token.starts_with('-') {
        WEIGHT_FLAG
    } else if token.contains('/') {
        WEIGHT_PATH
    } else if token.starts_with("<EXT:") {
        WEIGHT_EXTENSION
    } else {
        WEIGHT_WORD
    }
}

/// Deterministic resampling: block averaging when shrinking, linear
/// interpolation when growing, identity otherwise.
fn resample(values: &[f64], target: usize) -> Vec<f64> {
    let len = values.len();
    if len == target || target == 0 {
        return values[..target.min(len)].to_vec();
    }
    if len > target {
        let mut out = Vec::with_capacity(target);
        for i in 0..target {
            let start = i * len / target;
            let end = ((i + 1) * len / target).max(start + 1);
            let block = &values[start..end];
            out.push(block.iter().sum::<f64>() / block.len() as f64);
        }
        out
    } else {
        let mut out = Vec::with_capacity(target);
        if len == 1 {
            out.resize(target, values[0]);
            return out;
        }
        for i in 0..target {
            let pos = i as f64 * (len - 1) as f64 / (target - 1) as f64;
            let low = pos.floor() as usize;
            let high = (low + 1).min(len - 1);
            let frac = pos - low as f64;
            out.push(values[low] * (1.0 - frac) + values[high] * frac);
        }
        out
    }
}
