//! ART-2 Adaptive Pattern Learner
//!
//! Online, unsupervised adaptive-resonance clustering over feature vectors.
//! Each learning step either resonates with an existing category (and pulls
//! its weight vector toward the input) or allocates a new category. The
//! population is bounded; at the cap the lowest-scoring category is evicted
//! deterministically.
//!
//! Categories live in a dense slab indexed by slot, with a free-list for
//! reuse after eviction. They reference each other only by id, which keeps
//! serialisation trivial and the table free of shared references: external
//! callers only ever see immutable snapshots.
//!
//! User feedback is folded into per-category success statistics. A
//! correction counts as a positive example for learning and additionally
//! yields a synthetic training example carrying the corrected text.

use chrono::{DateTime, Duration, Utc};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::Art2Config;
use crate::error::{DeltaError, Result};

const MAX_PATTERNS: usize = 8;
const MAX_TAGS: usize = 8;

/// Lifecycle of a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryState {
    Allocated,
    Active,
    Dormant,
}

/// Feedback signal accompanying a learning step
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackSignal {
    Positive,
    Negative,
    /// Treated as positive for learning; carries the corrected command text
    Correction(String),
}

/// A learned category: weight vector plus bookkeeping
#[derive(Debug, Clone)]
pub struct Category {
    pub id: u64,
    pub weights: DVector<f64>,
    pub activation_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activation: DateTime<Utc>,
    pub success_count: u64,
    pub failure_count: u64,
    pub patterns: Vec<String>,
    pub tags: Vec<String>,
    pub state: CategoryState,
}

impl Category {
    fn new(id: u64, weights: DVector<f64>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            weights,
            activation_count: 1,
            created_at: now,
            last_activation: now,
            success_count: 0,
            failure_count: 0,
            patterns: Vec::new(),
            tags: Vec::new(),
            state: CategoryState::Allocated,
        }
    }

    /// Success rate in [0, 1]; neutral 0.5 before any feedback
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Exponential age decay relative to the last activation
    fn age_decay(&self, now: DateTime<Utc>, decay_rate: f64) -> f64 {
        let hours = now.signed_duration_since(self.last_activation).num_hours().max(0) as f64;
        (-decay_rate * hours / 24.0).exp().clamp(0.0, 1.0)
    }

    fn record_pattern(&mut self, command: &str) {
        if self.patterns.iter().any(|p| p == command) {
            return;
        }
        if self.patterns.len() >= MAX_PATTERNS {
            self.patterns.remove(0);
        }
        self.patterns.push(command.to_string());
    }

    fn record_tag(&mut self, tag: &str) {
        if self.tags.iter().any(|t| t == tag) {
            return;
        }
        if self.tags.len() >= MAX_TAGS {
            self.tags.remove(0);
        }
        self.tags.push(tag.to_string());
    }
}

/// Immutable, serialisable view of a category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySnapshot {
    pub id: u64,
    pub weights: Vec<f64>,
    pub activations: u64,
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    pub last_activation: DateTime<Utc>,
    pub patterns: Vec<String>,
    pub tags: Vec<String>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

/// Input to a single learning step
#[derive(Debug, Clone)]
pub struct Art2Input<'a> {
    pub vector: &'a DVector<f64>,
    pub command: &'a str,
    pub context_tag: Option<&'a str>,
    pub feedback: Option<FeedbackSignal>,
}

/// Result of a learning step
#[derive(Debug, Clone)]
pub struct Art2Outcome {
    pub category_id: u64,
    pub resonated: bool,
    pub allocated: bool,
    pub evicted: Option<u64>,
    pub match_score: f64,
    /// Corrected command text to be turned into a synthetic training example
    pub synthetic_correction: Option<String>,
}

/// Engine statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Art2Stats {
    pub population: usize,
    pub total_processed: u64,
    pub total_resonances: u64,
    pub total_allocations: u64,
    pub total_evictions: u64,
    pub underflow_reinits: u64,
}

/// Online ART-2 clusterer
#[derive(Debug)]
pub struct Art2Engine {
    config: Art2Config,
    vector_size: usize,
    slots: Vec<Option<Category>>,
    free_slots: Vec<usize>,
    id_to_slot: HashMap<u64, usize>,
    next_id: u64,
    stats: Art2Stats,
}

impl Art2Engine {
    pub fn new(config: Art2Config, vector_size: usize) -> Result<Self> {
        if config.alpha <= 0.0 {
            return Err(DeltaError::ConfigError("art2.alpha must be positive".to_string()));
        }
        if config.max_categories == 0 {
            return Err(DeltaError::ConfigError("art2.max_categories must be at least 1".to_string()));
        }
        Ok(Self {
            config,
            vector_size,
            slots: Vec::new(),
            free_slots: Vec::new(),
            id_to_slot: HashMap::new(),
            next_id: 0,
            stats: Art2Stats::default(),
        })
    }

    pub fn population(&self) -> usize {
        self.id_to_slot.len()
    }

    pub fn stats(&self) -> Art2Stats {
        let mut stats = self.stats.clone();
        stats.population = self.population();
        stats
    }

    /// One activation/learning step. Serialised by the caller: at most one
    /// `process` runs at any time.
    pub fn process(&mut self, input: Art2Input<'_>) -> Result<Art2Outcome> {
        self.check_vector(input.vector)?;
        let now = Utc::now();
        self.refresh_states(now);
        self.stats.total_processed += 1;

        let winner = self.select_winner(input.vector);

        if let Some((id, match_score)) = winner {
            if match_score >= self.config.rho {
                return self.resonate(id, match_score, &input, now);
            }
        }

        // No resonance: allocate, evicting first when at the cap
        let mut evicted = None;
        if self.population() >= self.config.max_categories {
            let victim = self.eviction_victim(now);
            self.remove_category(victim);
            self.stats.total_evictions += 1;
            evicted = Some(victim);
            log::debug!("evicted category {} to make room", victim);
        }

        let id = self.allocate(input.vector.clone(), &input, now);
        Ok(Art2Outcome {
            category_id: id,
            resonated: false,
            allocated: true,
            evicted,
            match_score: winner.map(|(_, m)| m).unwrap_or(0.0),
            synthetic_correction: correction_text(&input.feedback),
        })
    }

    /// Prediction against the current table without learning. Runs the
    /// choice/selection steps only; resonance below vigilance yields `None`.
    /// Takes `&self` so predictions can run concurrently under a read lock.
    pub fn predict(&self, vector: &DVector<f64>) -> Result<Option<(String, f64)>> {
        self.check_vector(vector)?;
        let winner = self.select_winner(vector);
        match winner {
            Some((id, match_score)) if match_score >= self.config.rho => {
                let slot = self.id_to_slot[&id];
                let category = self.slots[slot].as_ref().ok_or_else(|| {
                    DeltaError::InvalidInput(format!("category {} missing from slab", id))
                })?;
                Ok(category
                    .patterns
                    .first()
                    .map(|pattern| (pattern.clone(), match_score)))
            }
            _ => Ok(None),
        }
    }

    /// Immutable snapshots of every live category, ordered by id
    pub fn snapshot(&self) -> Vec<CategorySnapshot> {
        let mut ids: Vec<u64> = self.id_to_slot.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| {
                let slot = self.id_to_slot[id];
                self.slots[slot].as_ref().map(|c| CategorySnapshot {
                    id: c.id,
                    weights: c.weights.iter().copied().collect(),
                    activations: c.activation_count,
                    success_rate: c.success_rate(),
                    created_at: c.created_at,
                    last_activation: c.last_activation,
                    patterns: c.patterns.clone(),
                    tags: c.tags.clone(),
                    success_count: c.success_count,
                    failure_count: c.failure_count,
                })
            })
            .collect()
    }

    /// Persist the category table as a JSON array
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, raw).map_err(|e| DeltaError::StorageError(format!("category save: {}", e)))?;
        Ok(())
    }

    /// Restore a category table persisted with [`Art2Engine::save`]
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DeltaError::StorageError(format!("category load: {}", e)))?;
        let snapshots: Vec<CategorySnapshot> = serde_json::from_str(&raw)?;
        self.slots.clear();
        self.free_slots.clear();
        self.id_to_slot.clear();
        for snap in snapshots {
            if snap.weights.len() != self.vector_size {
                return Err(DeltaError::InvalidInput(format!(
                    "category {} has vector size {}, expected {}",
                    snap.id,
                    snap.weights.len(),
                    self.vector_size
                )));
            }
            let category = Category {
                id: snap.id,
                weights: DVector::from_vec(snap.weights),
                activation_count: snap.activations,
                created_at: snap.created_at,
                last_activation: snap.last_activation,
                success_count: snap.success_count,
                failure_count: snap.failure_count,
                patterns: snap.patterns,
                tags: snap.tags,
                state: CategoryState::Active,
            };
            self.next_id = self.next_id.max(category.id + 1);
            let slot = self.slots.len();
            self.id_to_slot.insert(category.id, slot);
            self.slots.push(Some(category));
        }
        Ok(())
    }

    fn check_vector(&self, vector: &DVector<f64>) -> Result<()> {
        if vector.len() != self.vector_size {
            return Err(DeltaError::InvalidInput(format!(
                "feature vector has length {}, expected {}",
                vector.len(),
                self.vector_size
            )));
        }
        Ok(())
    }

    /// Choice + selection: best active category by choice score, lower id on
    /// ties. Returns the winner id with its match score.
    fn select_winner(&self, vector: &DVector<f64>) -> Option<(u64, f64)> {
        let mut ids: Vec<u64> = self.id_to_slot.keys().copied().collect();
        ids.sort_unstable();

        let mut best: Option<(f64, u64)> = None;
        for id in ids {
            let slot = self.id_to_slot[&id];
            let category = match self.slots[slot].as_ref() {
                Some(c) => c,
                None => continue,
            };
            let choice = vector.dot(&category.weights)
                / (self.config.alpha + category.weights.norm());
            if choice < self.config.theta {
                continue;
            }
            match best {
                // Strictly greater keeps the lowest id on exact ties
                Some((best_choice, _)) if choice <= best_choice => {}
                _ => best = Some((choice, id)),
            }
        }

        best.map(|(_, id)| {
            let slot = self.id_to_slot[&id];
            let category = self.slots[slot].as_ref().expect("winner slot occupied");
            let norm = vector.norm();
            let match_score = if norm > f64::EPSILON {
                vector.dot(&category.weights) / norm
            } else {
                0.0
            };
            (id, match_score)
        })
    }

    fn resonate(
        &mut self,
        id: u64,
        match_score: f64,
        input: &Art2Input<'_>,
        now: DateTime<Utc>,
    ) -> Result<Art2Outcome> {
        let slot = self.id_to_slot[&id];
        let category = self.slots[slot]
            .as_mut()
            .ok_or_else(|| DeltaError::InvalidInput(format!("category {} missing from slab", id)))?;

        let beta = self.config.beta;
        category.weights = &category.weights * (1.0 - beta) + input.vector * beta;
        let norm = category.weights.norm();
        if norm > f64::EPSILON {
            category.weights /= norm;
        } else {
            // Numerical underflow: reinitialise from the input. Observable in
            // diagnostics, not an error.
            category.weights = input.vector.clone();
            self.stats.underflow_reinits += 1;
            log::warn!("category {} weight underflow, reinitialised from input", id);
        }

        category.activation_count += 1;
        category.last_activation = now;
        category.state = CategoryState::Active;
        category.record_pattern(input.command);
        if let Some(tag) = input.context_tag {
            category.record_tag(tag);
        }

        match &input.feedback {
            Some(FeedbackSignal::Positive) | Some(FeedbackSignal::Correction(_)) => {
                category.success_count += 1;
            }
            Some(FeedbackSignal::Negative) => {
                category.failure_count += 1;
            }
            None => {}
        }

        self.stats.total_resonances += 1;
        Ok(Art2Outcome {
            category_id: id,
            resonated: true,
            allocated: false,
            evicted: None,
            match_score,
            synthetic_correction: correction_text(&input.feedback),
        })
    }

    fn allocate(&mut self, weights: DVector<f64>, input: &Art2Input<'_>, now: DateTime<Utc>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let mut category = Category::new(id, weights, now);
        category.record_pattern(input.command);
        if let Some(tag) = input.context_tag {
            category.record_tag(tag);
        }
        match &input.feedback {
            Some(FeedbackSignal::Positive) | Some(FeedbackSignal::Correction(_)) => {
                category.success_count += 1;
            }
            Some(FeedbackSignal::Negative) => {
                category.failure_count += 1;
            }
            None => {}
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(category);
                slot
            }
            None => {
                self.slots.push(Some(category));
                self.slots.len() - 1
            }
        };
        self.id_to_slot.insert(id, slot);
        self.stats.total_allocations += 1;
        id
    }

    fn remove_category(&mut self, id: u64) {
        if let Some(slot) = self.id_to_slot.remove(&id) {
            self.slots[slot] = None;
            self.free_slots.push(slot);
        }
    }

    /// Deterministic eviction choice: lowest composite of age decay, success
    /// rate and activation count; protected categories (enough activations,
    /// not dormant) go last; lower id breaks exact ties.
    fn eviction_victim(&self, now: DateTime<Utc>) -> u64 {
        let mut ids: Vec<u64> = self.id_to_slot.keys().copied().collect();
        ids.sort_unstable();

        let max_activations = ids
            .iter()
            .filter_map(|id| self.slots[self.id_to_slot[id]].as_ref())
            .map(|c| c.activation_count)
            .max()
            .unwrap_or(1)
            .max(1);

        let score = |c: &Category| {
            let decay = c.age_decay(now, self.config.decay_rate);
            let norm_act = c.activation_count as f64 / max_activations as f64;
            self.config.evict_age_weight * decay
                + self.config.evict_success_weight * c.success_rate()
                + self.config.evict_activation_weight * norm_act
        };

        let mut victim: Option<(bool, f64, u64)> = None;
        for id in ids {
            let category = match self.slots[self.id_to_slot[&id]].as_ref() {
                Some(c) => c,
                None => continue,
            };
            let protected = category.activation_count >= self.config.min_activation
                && category.state != CategoryState::Dormant;
            let s = score(category);
            let candidate = (protected, s, id);
            victim = Some(match victim {
                None => candidate,
                Some(current) => {
                    // Unprotected first, then lower score, then lower id
                    let (cur_prot, cur_score, cur_id) = current;
                    let better = (!candidate.0 && cur_prot)
                        || (candidate.0 == cur_prot
                            && (s < cur_score || (s == cur_score && id < cur_id)));
                    if better {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        victim.map(|(_, _, id)| id).expect("eviction requires a populated table")
    }

    /// Lazy time-based state transitions, applied on read
    fn refresh_states(&mut self, now: DateTime<Utc>) {
        let window = Duration::days(self.config.dormancy_days);
        for slot in self.slots.iter_mut().flatten() {
            if slot.state == CategoryState::Active
                && now.signed_duration_since(slot.last_activation) > window
            {
                slot.state = CategoryState::Dormant;
            }
        }
    }
}

fn correction_text(feedback: &Option<FeedbackSignal>) -> Option<String> {
    match feedback {
        Some(FeedbackSignal::Correction(text)) => Some(text.clone()),
        _ => None,
    }
}
