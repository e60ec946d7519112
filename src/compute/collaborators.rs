//! Interfaces to the external services the optimizer consumes.
//!
//! Generation, judging and patch proposal are black boxes. Their loosely
//! typed payloads are validated here, at the boundary, before anything reaches
//! the evaluator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{GateDecision, MutationPrompt, Subscores, Task};

/// Errors raised by collaborator calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Generation failed: {0}")]
    Generation(String),
    #[error("Generation timed out after {0}s")]
    Timeout(u64),
    #[error("Invalid output: {0}")]
    InvalidOutput(String),
    #[error("Scoring failed: {0}")]
    Scoring(String),
    #[error("Patch proposal failed: {0}")]
    Proposal(String),
}

/// Validated result of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Success { output: Value, raw_text: String },
    Failure { error: String },
}

impl GenerationOutcome {
    pub fn success(output: Value, raw_text: impl Into<String>) -> Self {
        GenerationOutcome::Success {
            output,
            raw_text: raw_text.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        GenerationOutcome::Failure {
            error: error.into(),
        }
    }

    /// Validate a loosely typed payload `{output, rawText?, error?}`.
    ///
    /// A non-empty `error` string selects the failure variant. Otherwise
    /// `output` must be present and non-null. Anything else is rejected.
    pub fn from_payload(payload: Value) -> Result<Self, CollaboratorError> {
        let Value::Object(mut map) = payload else {
            return Err(CollaboratorError::InvalidOutput(
                "payload is not an object".to_string(),
            ));
        };

        if let Some(error) = map.get("error").and_then(Value::as_str)
            && !error.trim().is_empty()
        {
            return Ok(GenerationOutcome::failure(error));
        }

        let output = match map.remove("output") {
            Some(Value::Null) | None => {
                return Err(CollaboratorError::InvalidOutput(
                    "payload has no output".to_string(),
                ));
            }
            Some(output) => output,
        };

        let raw_text = match map.remove("rawText").or_else(|| map.remove("raw_text")) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => match &output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Some(_) => {
                return Err(CollaboratorError::InvalidOutput(
                    "rawText must be a string".to_string(),
                ));
            }
        };

        Ok(GenerationOutcome::Success { output, raw_text })
    }
}

/// Judge verdict for one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub score: f64,
    pub pass: bool,
    #[serde(default)]
    pub gate_decision: Option<GateDecision>,
    #[serde(default)]
    pub subscores: Option<Subscores>,
}

impl ScoreResult {
    pub fn new(score: f64, pass: bool) -> Self {
        Self {
            score,
            pass,
            gate_decision: None,
            subscores: None,
        }
    }

    /// Clamp the score into [0, 1]; NaN becomes 0.
    pub fn normalized(mut self) -> Self {
        self.score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };
        self
    }
}

/// Produces one output for a prompt and task.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        task: &Task,
        seed: u64,
    ) -> Result<GenerationOutcome, CollaboratorError>;
}

/// Scores one output against its task.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, task: &Task, output: &Value) -> Result<ScoreResult, CollaboratorError>;
}

/// Inputs for one patch proposal call.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    pub base_prompt: String,
    pub current_patch: String,
    /// Rendered contrastive pairs; the only optimization context.
    pub pairs_context: String,
    pub count: usize,
    /// Instruction of the mutation operator steering this call, if any.
    pub operator: Option<MutationPrompt>,
}

/// Proposes additive patches to the champion prompt.
#[async_trait]
pub trait PatchProposer: Send + Sync {
    /// Return up to `request.count` patch texts. Each patch replaces the
    /// current patch section, building on it rather than rewriting the base.
    async fn propose(&self, request: PatchRequest) -> Result<Vec<String>, CollaboratorError>;

    /// Rewrite `target` using the hypermutation operator `hyper`.
    ///
    /// `Ok(None)` means the proposer does not support operator rewriting.
    async fn rewrite_operator(
        &self,
        _hyper: &MutationPrompt,
        _target: &MutationPrompt,
    ) -> Result<Option<String>, CollaboratorError> {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators for tests.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Echoes a structured output whose score is looked up by prompt.
    ///
    /// The output carries the prompt marker and seed so the scorer can
    /// recover them. With `yields` set, every call yields to the runtime
    /// first so concurrent calls interleave.
    pub struct ScriptedGenerator {
        pub fail_seeds: Vec<u64>,
        pub yields: bool,
        pub calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn new() -> Self {
            Self {
                fail_seeds: Vec::new(),
                yields: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            prompt: &str,
            task: &Task,
            seed: u64,
        ) -> Result<GenerationOutcome, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.yields {
                tokio::task::yield_now().await;
            }
            if self.fail_seeds.contains(&seed) {
                return Err(CollaboratorError::Generation("scripted failure".into()));
            }
            let output = serde_json::json!({
                "prompt": prompt,
                "seed": seed,
                "items": [
                    {"title": format!("{} story alpha", task.spec), "narrative": "As a shopper I want checkout", "acceptanceCriteria": ["payment accepted", "receipt emailed"]},
                    {"title": format!("{} story beta", task.spec), "narrative": "As a shopper I want refunds", "acceptanceCriteria": ["refund issued"]},
                    {"title": format!("{} story gamma", task.spec), "narrative": "As an admin I want reports", "acceptanceCriteria": ["report exported"]}
                ]
            });
            let raw = output.to_string();
            Ok(GenerationOutcome::success(output, raw))
        }
    }

    /// Scores by looking for known markers in the prompt echoed in the output.
    ///
    /// `by_marker` maps a prompt substring to the scores handed out in seed
    /// order (cycling). Prompts matching no marker get `default`.
    pub struct MarkerScorer {
        pub by_marker: Vec<(String, Vec<f64>)>,
        pub default: Vec<f64>,
        pub pass_threshold: f64,
        pub seed_base: u64,
    }

    #[async_trait]
    impl Scorer for MarkerScorer {
        async fn score(
            &self,
            _task: &Task,
            output: &Value,
        ) -> Result<ScoreResult, CollaboratorError> {
            let prompt = output["prompt"].as_str().unwrap_or_default();
            let seed = output["seed"].as_u64().unwrap_or(self.seed_base);
            let scores = self
                .by_marker
                .iter()
                .rev()
                .find(|(marker, _)| prompt.contains(marker.as_str()))
                .map(|(_, s)| s)
                .unwrap_or(&self.default);
            let idx = (seed.saturating_sub(self.seed_base) as usize) % scores.len();
            let score = scores[idx];
            Ok(ScoreResult::new(score, score >= self.pass_threshold))
        }
    }

    /// Returns fixed patches and records every request.
    pub struct FixedProposer {
        pub patches: Vec<String>,
        pub requests: Arc<Mutex<Vec<PatchRequest>>>,
        pub rewrites: HashMap<String, String>,
        pub fail: bool,
    }

    impl FixedProposer {
        pub fn new(patches: Vec<&str>) -> Self {
            Self {
                patches: patches.into_iter().map(String::from).collect(),
                requests: Arc::new(Mutex::new(Vec::new())),
                rewrites: HashMap::new(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PatchProposer for FixedProposer {
        async fn propose(&self, request: PatchRequest) -> Result<Vec<String>, CollaboratorError> {
            let count = request.count;
            self.requests.lock().push(request);
            if self.fail {
                return Err(CollaboratorError::Proposal("scripted failure".into()));
            }
            Ok(self.patches.iter().take(count).cloned().collect())
        }

        async fn rewrite_operator(
            &self,
            _hyper: &MutationPrompt,
            target: &MutationPrompt,
        ) -> Result<Option<String>, CollaboratorError> {
            Ok(Some(
                self.rewrites
                    .get(&target.id)
                    .cloned()
                    .unwrap_or_else(|| format!("{} (evolved)", target.text)),
            ))
        }
    }
}
