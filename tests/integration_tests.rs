//! Integration tests for the Delta cognition core
//!
//! Exercises the end-to-end scenarios: resonance and eviction in the
//! pattern learner, speculative accept/reject alignment, health
//! degradation, and the privacy filter, wired the way the REPL wires them.

use async_trait::async_trait;
use nalgebra::DVector;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use delta::{
    Art2Config, Art2Engine, Art2Input, CommandOutcome, ConfigStore, Core, DeltaError,
    DraftProducer, FeedbackKind, GenerateParams, HealthConfig, Result, SpecDecodeConfig,
    SpeculativeDecoder, Verifier,
};

const VECTOR_SIZE: usize = 16;

fn axis(i: usize) -> DVector<f64> {
    let mut v = DVector::zeros(VECTOR_SIZE);
    v[i] = 1.0;
    v
}

fn art2_input<'a>(v: &'a DVector<f64>, command: &'a str) -> Art2Input<'a> {
    Art2Input {
        vector: v,
        command,
        context_tag: None,
        feedback: None,
    }
}

#[test]
fn test_resonance_scenario() -> Result<()> {
    let config = Art2Config {
        rho: 0.9,
        ..Art2Config::default()
    };
    let mut engine = Art2Engine::new(config, VECTOR_SIZE)?;

    // First input allocates category 0 with the input as its weights
    let v1 = axis(0);
    let outcome = engine.process(art2_input(&v1, "git status"))?;
    assert_eq!(outcome.category_id, 0);
    assert_eq!(engine.population(), 1);
    let snap = engine.snapshot();
    assert_eq!(snap[0].weights, v1.iter().copied().collect::<Vec<_>>());

    // The same input resonates with category 0 and leaves weights in place
    let outcome = engine.process(art2_input(&v1, "git status"))?;
    assert!(outcome.resonated);
    assert_eq!(outcome.category_id, 0);
    let snap = engine.snapshot();
    assert_eq!(snap[0].activations, 2);
    for (w, v) in snap[0].weights.iter().zip(v1.iter()) {
        assert!((w - v).abs() < 1e-9);
    }

    println!("✓ Resonance scenario behaves");
    Ok(())
}

#[test]
fn test_new_category_scenario() -> Result<()> {
    let config = Art2Config {
        rho: 0.9,
        ..Art2Config::default()
    };
    let mut engine = Art2Engine::new(config, VECTOR_SIZE)?;
    engine.process(art2_input(&axis(0), "git status"))?;

    let outcome = engine.process(art2_input(&axis(1), "cargo test"))?;
    assert!(outcome.allocated);
    assert_eq!(outcome.category_id, 1);
    assert_eq!(engine.population(), 2);

    println!("✓ New category scenario behaves");
    Ok(())
}

#[test]
fn test_eviction_scenario() -> Result<()> {
    let config = Art2Config {
        rho: 0.9,
        max_categories: 2,
        ..Art2Config::default()
    };
    let mut engine = Art2Engine::new(config, VECTOR_SIZE)?;
    engine.process(art2_input(&axis(0), "git status"))?;
    engine.process(art2_input(&axis(1), "cargo test"))?;

    let outcome = engine.process(art2_input(&axis(2), "docker ps"))?;
    assert!(outcome.allocated);
    assert!(outcome.evicted.is_some());
    assert_eq!(outcome.category_id, 2, "fresh id continues past the evicted one");
    assert_eq!(engine.population(), 2);

    // Determinism: the same sequence evicts the same category
    let config = Art2Config {
        rho: 0.9,
        max_categories: 2,
        ..Art2Config::default()
    };
    let mut replay = Art2Engine::new(config, VECTOR_SIZE)?;
    replay.process(art2_input(&axis(0), "git status"))?;
    replay.process(art2_input(&axis(1), "cargo test"))?;
    let replayed = replay.process(art2_input(&axis(2), "docker ps"))?;
    assert_eq!(replayed.evicted, outcome.evicted);

    println!("✓ Eviction scenario behaves");
    Ok(())
}

/// Verifier scripted to a fixed authoritative continuation
struct ScriptedVerifier(String);

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn continuation(
        &self,
        _prompt: &str,
        _params: &GenerateParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(DeltaError::Cancelled);
        }
        Ok(self.0.clone())
    }
}

struct ScriptedProducer(Vec<String>);

impl DraftProducer for ScriptedProducer {
    fn draft(&self, _prompt_tokens: &[String], max_tokens: usize) -> Vec<String> {
        self.0.iter().take(max_tokens).cloned().collect()
    }
}

#[tokio::test]
async fn test_spec_decode_acceptance_scenario() -> Result<()> {
    let decoder = SpeculativeDecoder::new(
        SpecDecodeConfig::default(),
        Arc::new(ScriptedVerifier("git diff".to_string())),
    );
    decoder.set_producer(Box::new(ScriptedProducer(vec![
        "git".to_string(),
        "status".to_string(),
    ])));

    let cancel = CancellationToken::new();
    let out = decoder
        .generate("next command?", &GenerateParams::default(), &cancel, false)
        .await?;

    assert_eq!(out.text, "git diff");
    assert_eq!(out.accepted, 1);
    assert_eq!(out.rejected, 1);

    let metrics = decoder.metrics();
    assert_eq!(metrics.accepted_tokens, 1);
    assert_eq!(metrics.rejected_tokens, 1);

    println!("✓ Speculative acceptance scenario behaves");
    Ok(())
}

#[tokio::test]
async fn test_spec_decode_output_is_verifier_prefix() -> Result<()> {
    let authoritative = "try running the failing test alone";
    for draft in [
        vec!["try"],
        vec!["try", "running", "everything"],
        vec!["completely", "wrong"],
    ] {
        let decoder = SpeculativeDecoder::new(
            SpecDecodeConfig::default(),
            Arc::new(ScriptedVerifier(authoritative.to_string())),
        );
        decoder.set_producer(Box::new(ScriptedProducer(
            draft.iter().map(|t| t.to_string()).collect(),
        )));
        let cancel = CancellationToken::new();
        let out = decoder
            .generate("p", &GenerateParams::default(), &cancel, false)
            .await?;
        assert!(
            authoritative.starts_with(&out.text),
            "{:?} is not a prefix of {:?}",
            out.text,
            authoritative
        );
    }

    println!("✓ Speculative output stays a verifier prefix");
    Ok(())
}

#[tokio::test]
async fn test_health_degradation_scenario() -> Result<()> {
    // Default endpoint with nothing listening: probes fail
    let config = ConfigStore::default();
    config.set("model.endpoint", "http://127.0.0.1:1").unwrap();
    let core = Core::new(Arc::new(config))?;

    // Give the first probe a moment to fail
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    core.on_command("ls", &CommandOutcome::new(0, 5, "/tmp"))?;
    assert!(core.next_thought().is_none());
    assert!(core.is_degraded());

    core.shutdown();
    println!("✓ Health degradation scenario behaves");
    Ok(())
}

#[test]
fn test_recovery_notifies_exactly_once() {
    use chrono::Utc;
    let mut state = delta::HealthState::new(HealthConfig::default());
    let now = Utc::now();

    state.record_probe(true, now);
    for _ in 0..3 {
        state.record_probe(false, now);
    }
    assert!(state.is_degraded());

    let first = state.record_probe(true, now);
    assert!(first.is_some());
    let second = state.record_probe(true, now);
    assert!(second.is_none());

    println!("✓ Recovery notification fires exactly once");
}

#[tokio::test]
async fn test_privacy_reject_scenario() -> Result<()> {
    let config = ConfigStore::default();
    config.set("privacy.patterns", "(?i)password").unwrap();
    let core = Core::new(Arc::new(config))?;

    core.on_command("export API_PASSWORD=abc", &CommandOutcome::new(0, 5, "/tmp"))?;

    let stats = core.stats();
    assert_eq!(stats.memory.total_appended, 0);
    assert_eq!(stats.memory.privacy_skipped, 1);

    core.shutdown();
    println!("✓ Privacy reject scenario behaves");
    Ok(())
}

#[tokio::test]
async fn test_feedback_targets_latest_matching_entry() -> Result<()> {
    let core = Core::new(Arc::new(ConfigStore::default()))?;
    let outcome = CommandOutcome::new(0, 5, "/tmp");

    core.on_command("make test", &outcome)?;
    core.on_command("make build", &outcome)?;

    // Feedback lands on the latest command
    core.feedback(FeedbackKind::Helpful, None)?;
    let stats = core.stats();
    assert_eq!(stats.memory.feedback_count, 1);
    assert_eq!(stats.training.by_source.get("feedback"), Some(&1));

    core.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_full_command_flow_without_host() -> Result<()> {
    // The complete ingest path must hold up with no model host at all:
    // memory, learning and prediction are local concerns
    let config = ConfigStore::default();
    config.set("model.endpoint", "http://127.0.0.1:1").unwrap();
    let core = Core::new(Arc::new(config))?;
    let outcome = CommandOutcome::new(0, 5, "/tmp/project");

    for _ in 0..4 {
        core.on_command("git grep", &outcome)?;
    }
    core.on_command("git diff", &outcome)?;

    let stats = core.stats();
    assert_eq!(stats.memory.total_appended, 5);
    assert!(stats.art2.population >= 1);
    assert!(stats.art2.total_resonances >= 3);

    let (suggestion, confidence) = core
        .predict_for("git grep")
        .expect("well-reinforced pattern should predict");
    assert_eq!(suggestion, "git grep");
    assert!(confidence > 0.8);

    core.shutdown();
    println!("✓ Full command flow works host-free");
    Ok(())
}
