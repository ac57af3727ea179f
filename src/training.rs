//! Training Data Accumulation
//!
//! Collects `(command, context, prediction, label, weight)` examples from
//! user feedback and from ART-2 category outcomes, and hands them to the
//! training pipeline in batches once enough have accumulated. Batch draining
//! supports date filtering, class balancing, family-prefix augmentation and
//! a seeded train/validation split so a drain is reproducible run-to-run.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::config::TrainingConfig;
use crate::error::{DeltaError, Result};

/// Command families eligible for `a && b` augmentation pairing
const AUGMENT_FAMILIES: [&str; 5] = ["git", "docker", "make", "cargo", "npm"];

/// Where a training example came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExampleSource {
    Feedback,
    Synthetic,
    Art2,
}

/// A single labelled training example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub command: String,
    pub context: String,
    pub prediction: String,
    /// -1 unhelpful, 0 neutral/correction, +1 helpful
    pub label: i8,
    pub weight: f64,
    pub source: ExampleSource,
    pub timestamp: DateTime<Utc>,
}

impl TrainingExample {
    pub fn new(
        command: impl Into<String>,
        context: impl Into<String>,
        prediction: impl Into<String>,
        label: i8,
        weight: f64,
        source: ExampleSource,
    ) -> Self {
        Self {
            command: command.into(),
            context: context.into(),
            prediction: prediction.into(),
            label,
            weight,
            source,
            timestamp: Utc::now(),
        }
    }

    fn family(&self) -> Option<&'static str> {
        let first = self.command.split_whitespace().next()?;
        AUGMENT_FAMILIES.iter().copied().find(|f| *f == first)
    }
}

/// Options controlling a batch drain
#[derive(Debug, Clone)]
pub struct DrainOptions {
    /// Only drain examples inside this closed time range
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Downsample positive/negative classes to the smaller of the two
    pub balance: bool,
    /// Synthesise combined `a && b` examples from same-family pairs
    pub augment: bool,
    /// Fraction of the batch assigned to training, in (0, 1)
    pub split_ratio: f64,
    /// Hard cap on drained examples; the excess stays pending
    pub max_examples: Option<usize>,
    /// RNG seed for shuffling, balancing and the split
    pub seed: u64,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            date_range: None,
            balance: false,
            augment: false,
            split_ratio: 0.8,
            max_examples: None,
            seed: 42,
        }
    }
}

/// Counters by label and source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingStats {
    pub pending: usize,
    pub total_added: u64,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub by_source: HashMap<String, u64>,
    pub batches_drained: u64,
    pub synthesized: u64,
    pub exported_files: u64,
}

/// Accumulator for training examples
#[derive(Debug)]
pub struct TrainingDataStore {
    config: TrainingConfig,
    pending: Vec<TrainingExample>,
    stats: TrainingStats,
}

impl TrainingDataStore {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            stats: TrainingStats::default(),
        }
    }

    pub fn add(&mut self, example: TrainingExample) -> Result<()> {
        if !(-1..=1).contains(&example.label) {
            return Err(DeltaError::InvalidInput(format!(
                "label must be -1, 0 or +1, got {}",
                example.label
            )));
        }
        if example.weight <= 0.0 {
            return Err(DeltaError::InvalidInput(format!(
                "weight must be positive, got {}",
                example.weight
            )));
        }

        match example.label {
            1 => self.stats.positive += 1,
            -1 => self.stats.negative += 1,
            _ => self.stats.neutral += 1,
        }
        let source_key = match example.source {
            ExampleSource::Feedback => "feedback",
            ExampleSource::Synthetic => "synthetic",
            ExampleSource::Art2 => "art2",
        };
        *self.stats.by_source.entry(source_key.to_string()).or_insert(0) += 1;
        self.stats.total_added += 1;

        self.pending.push(example);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True once enough examples have accumulated for a training run
    pub fn ready(&self) -> bool {
        self.pending.len() >= self.config.threshold
    }

    pub fn stats(&self) -> TrainingStats {
        let mut stats = self.stats.clone();
        stats.pending = self.pending.len();
        stats
    }

    /// Drain a batch into `(train, validation)` partitions.
    ///
    /// The drained examples leave the pending buffer; examples excluded by
    /// the date range or the cap stay pending. If file export is configured
    /// and fails, the drained examples are restored to the buffer and the
    /// I/O error is surfaced; examples are never silently dropped.
    pub fn drain_batch(
        &mut self,
        options: &DrainOptions,
    ) -> Result<(Vec<TrainingExample>, Vec<TrainingExample>)> {
        if !(0.0..1.0).contains(&options.split_ratio) || options.split_ratio == 0.0 {
            return Err(DeltaError::InvalidInput(format!(
                "split ratio must be in (0, 1), got {}",
                options.split_ratio
            )));
        }

        let mut rng = StdRng::seed_from_u64(options.seed);

        // Partition pending into drained and retained
        let in_range = |e: &TrainingExample| match options.date_range {
            Some((from, to)) => e.timestamp >= from && e.timestamp <= to,
            None => true,
        };
        let mut drained = Vec::new();
        let mut retained = Vec::new();
        for example in self.pending.drain(..) {
            let cap_reached = options
                .max_examples
                .map(|cap| drained.len() >= cap)
                .unwrap_or(false);
            if !cap_reached && in_range(&example) {
                drained.push(example);
            } else {
                retained.push(example);
            }
        }
        self.pending = retained;

        if drained.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let original_len = drained.len();

        if options.balance {
            drained = balance_classes(drained, &mut rng);
        }

        if options.augment {
            let cap = (original_len as f64 * self.config.max_augment_fraction).floor() as usize;
            let synthetic = synthesize_pairs(&drained, cap);
            self.stats.synthesized += synthetic.len() as u64;
            drained.extend(synthetic);
        }

        drained.shuffle(&mut rng);
        let split_at = ((drained.len() as f64) * options.split_ratio).round() as usize;
        let split_at = split_at.clamp(1, drained.len());
        let val = drained.split_off(split_at);
        let train = drained;

        if let Some(dir) = self.config.export_dir.clone() {
            if let Err(e) = export_batch(&PathBuf::from(dir), &train, &val) {
                // Restore so nothing is lost; caller sees the storage error
                self.pending.extend(train);
                self.pending.extend(val);
                return Err(e);
            }
            self.stats.exported_files += 1;
        }

        self.stats.batches_drained += 1;
        Ok((train, val))
    }
}

/// Downsample positive and negative classes to the smaller one; neutral
/// examples are always retained.
fn balance_classes(examples: Vec<TrainingExample>, rng: &mut StdRng) -> Vec<TrainingExample> {
    let mut positive: Vec<TrainingExample> = Vec::new();
    let mut negative: Vec<TrainingExample> = Vec::new();
    let mut neutral: Vec<TrainingExample> = Vec::new();
    for example in examples {
        match example.label {
            1 => positive.push(example),
            -1 => negative.push(example),
            _ => neutral.push(example),
        }
    }
    let keep = positive.len().min(negative.len());
    positive.shuffle(rng);
    negative.shuffle(rng);
    positive.truncate(keep);
    negative.truncate(keep);

    let mut out = neutral;
    out.extend(positive);
    out.extend(negative);
    out
}

/// Pair same-label examples of the same command family into combined
/// `a && b` examples, up to `cap` synthetic results.
fn synthesize_pairs(examples: &[TrainingExample], cap: usize) -> Vec<TrainingExample> {
    let mut by_group: HashMap<(&'static str, i8), Vec<&TrainingExample>> = HashMap::new();
    for example in examples {
        if example.label == 0 {
            continue;
        }
        if let Some(family) = example.family() {
            by_group.entry((family, example.label)).or_default().push(example);
        }
    }

    let mut groups: Vec<((&'static str, i8), Vec<&TrainingExample>)> = by_group.into_iter().collect();
    groups.sort_by_key(|((family, label), _)| (*family, *label));

    let mut out = Vec::new();
    for (_, members) in groups {
        for pair in members.chunks(2) {
            if out.len() >= cap {
                return out;
            }
            if let [a, b] = pair {
                out.push(TrainingExample {
                    command: format!("{} && {}", a.command, b.command),
                    context: a.context.clone(),
                    prediction: format!("{} && {}", a.prediction, b.prediction),
                    label: a.label,
                    weight: (a.weight + b.weight) / 2.0,
                    source: ExampleSource::Synthetic,
                    timestamp: a.timestamp.max(b.timestamp),
                });
            }
        }
    }
    out
}

fn export_batch(
    dir: &PathBuf,
    train: &[TrainingExample],
    val: &[TrainingExample],
) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| DeltaError::StorageError(format!("create {}: {}", dir.display(), e)))?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let batch = serde_json::json!({
        "exported_at": Utc::now(),
        "train": train,
        "validation": val,
    });
    let path = dir.join(format!("training-{}.json", stamp));
    fs::write(&path, serde_json::to_string_pretty(&batch)?)
        .map_err(|e| DeltaError::StorageError(format!("write {}: {}", path.display(), e)))?;
    log::info!("exported training batch to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(command: &str, label: i8, source: ExampleSource) -> TrainingExample {
        TrainingExample::new(command, "ctx", "pred", label, 1.0, source)
    }

    fn store(threshold: usize) -> TrainingDataStore {
        TrainingDataStore::new(TrainingConfig {
            threshold,
            ..TrainingConfig::default()
        })
    }

    #[test]
    fn test_ready_flips_at_threshold() {
        let mut store = store(3);
        assert!(!store.ready());
        for i in 0..3 {
            store
                .add(example(&format!("cmd{}", i), 1, ExampleSource::Feedback))
                .unwrap();
        }
        assert!(store.ready());
        assert_eq!(store.pending_count(), 3);
    }

    #[test]
    fn test_invalid_examples_rejected() {
        let mut store = store(10);
        let mut bad = example("x", 2, ExampleSource::Feedback);
        assert!(store.add(bad.clone()).is_err());
        bad.label = 1;
        bad.weight = 0.0;
        assert!(store.add(bad).is_err());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_drain_clears_pending() {
        let mut store = store(2);
        store.add(example("a", 1, ExampleSource::Feedback)).unwrap();
        store.add(example("b", -1, ExampleSource::Feedback)).unwrap();

        let (train, val) = store.drain_batch(&DrainOptions::default()).unwrap();
        assert_eq!(train.len() + val.len(), 2);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_split_determinism() {
        let build = || {
            let mut store = store(10);
            for i in 0..20 {
                let label = if i % 2 == 0 { 1 } else { -1 };
                store
                    .add(example(&format!("cmd{}", i), label, ExampleSource::Feedback))
                    .unwrap();
            }
            store
        };
        let options = DrainOptions {
            seed: 7,
            ..DrainOptions::default()
        };

        let (train_a, val_a) = build().drain_batch(&options).unwrap();
        let (train_b, val_b) = build().drain_batch(&options).unwrap();

        let names = |v: &[TrainingExample]| v.iter().map(|e| e.command.clone()).collect::<Vec<_>>();
        assert_eq!(names(&train_a), names(&train_b));
        assert_eq!(names(&val_a), names(&val_b));
    }

    #[test]
    fn test_split_ratio_partitions() {
        let mut s = store(10);
        for i in 0..10 {
            s.add(example(&format!("cmd{}", i), 1, ExampleSource::Feedback)).unwrap();
        }
        let (train, val) = s
            .drain_batch(&DrainOptions {
                split_ratio: 0.8,
                ..DrainOptions::default()
            })
            .unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
    }

    #[test]
    fn test_invalid_split_ratio_rejected() {
        let mut s = store(10);
        s.add(example("a", 1, ExampleSource::Feedback)).unwrap();
        for ratio in [0.0, 1.0, 1.5] {
            let err = s.drain_batch(&DrainOptions {
                split_ratio: ratio,
                ..DrainOptions::default()
            });
            assert!(err.is_err(), "ratio {} accepted", ratio);
        }
    }

    #[test]
    fn test_balancing_downsamples_majority() {
        let mut s = store(10);
        for i in 0..8 {
            s.add(example(&format!("pos{}", i), 1, ExampleSource::Feedback)).unwrap();
        }
        for i in 0..2 {
            s.add(example(&format!("neg{}", i), -1, ExampleSource::Feedback)).unwrap();
        }
        s.add(example("neu", 0, ExampleSource::Art2)).unwrap();

        let (train, val) = s
            .drain_batch(&DrainOptions {
                balance: true,
                ..DrainOptions::default()
            })
            .unwrap();
        let all: Vec<TrainingExample> = train.into_iter().chain(val).collect();
        let pos = all.iter().filter(|e| e.label == 1).count();
        let neg = all.iter().filter(|e| e.label == -1).count();
        let neu = all.iter().filter(|e| e.label == 0).count();
        assert_eq!(pos, 2);
        assert_eq!(neg, 2);
        assert_eq!(neu, 1);
    }

    #[test]
    fn test_augmentation_synthesizes_family_pairs() {
        let mut s = TrainingDataStore::new(TrainingConfig {
            threshold: 10,
            max_augment_fraction: 0.5,
            export_dir: None,
        });
        s.add(example("git status", 1, ExampleSource::Feedback)).unwrap();
        s.add(example("git diff", 1, ExampleSource::Feedback)).unwrap();
        s.add(example("ls", 1, ExampleSource::Feedback)).unwrap();

        let (train, val) = s
            .drain_batch(&DrainOptions {
                augment: true,
                ..DrainOptions::default()
            })
            .unwrap();
        let all: Vec<TrainingExample> = train.into_iter().chain(val).collect();
        let synthetic: Vec<&TrainingExample> =
            all.iter().filter(|e| e.source == ExampleSource::Synthetic).collect();
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].command, "git status && git diff");
        assert_eq!(synthetic[0].label, 1);
        assert!((synthetic[0].weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_augmentation_respects_cap() {
        let mut s = TrainingDataStore::new(TrainingConfig {
            threshold: 10,
            max_augment_fraction: 0.1, // floor(6 * 0.1) = 0
            export_dir: None,
        });
        for i in 0..6 {
            s.add(example(&format!("git c{}", i), 1, ExampleSource::Feedback)).unwrap();
        }
        let (train, val) = s
            .drain_batch(&DrainOptions {
                augment: true,
                ..DrainOptions::default()
            })
            .unwrap();
        let all: Vec<TrainingExample> = train.into_iter().chain(val).collect();
        assert!(all.iter().all(|e| e.source != ExampleSource::Synthetic));
    }

    #[test]
    fn test_max_examples_leaves_excess_pending() {
        let mut s = store(10);
        for i in 0..5 {
            s.add(example(&format!("cmd{}", i), 1, ExampleSource::Feedback)).unwrap();
        }
        let (train, val) = s
            .drain_batch(&DrainOptions {
                max_examples: Some(3),
                ..DrainOptions::default()
            })
            .unwrap();
        assert_eq!(train.len() + val.len(), 3);
        assert_eq!(s.pending_count(), 2);
    }

    #[test]
    fn test_export_writes_batch_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = TrainingDataStore::new(TrainingConfig {
            threshold: 2,
            max_augment_fraction: 0.25,
            export_dir: Some(dir.path().to_string_lossy().to_string()),
        });
        s.add(example("a", 1, ExampleSource::Feedback)).unwrap();
        s.add(example("b", -1, ExampleSource::Feedback)).unwrap();

        s.drain_batch(&DrainOptions::default()).unwrap();
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(s.stats().exported_files, 1);
    }

    #[test]
    fn test_export_failure_retains_examples() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the export directory should be makes create_dir_all fail
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let mut s = TrainingDataStore::new(TrainingConfig {
            threshold: 2,
            max_augment_fraction: 0.25,
            export_dir: Some(blocker.to_string_lossy().to_string()),
        });
        s.add(example("a", 1, ExampleSource::Feedback)).unwrap();
        s.add(example("b", -1, ExampleSource::Feedback)).unwrap();

        let result = s.drain_batch(&DrainOptions::default());
        assert!(matches!(result, Err(DeltaError::StorageError(_))));
        assert_eq!(s.pending_count(), 2);
    }

    #[test]
    fn test_stats_by_label_and_source() {
        let mut s = store(10);
        s.add(example("a", 1, ExampleSource::Feedback)).unwrap();
        s.add(example("b", -1, ExampleSource::Feedback)).unwrap();
        s.add(example("c", 0, ExampleSource::Art2)).unwrap();

        let stats = s.stats();
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.negative, 1);
        assert_eq!(stats.neutral, 1);
        assert_eq!(stats.by_source.get("feedback"), Some(&2));
        assert_eq!(stats.by_source.get("art2"), Some(&1));
    }
}
