//! Run a probe suite through a model and print what it says.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use nanoalign_core::EvalConfig;
use nanoalign_train::data::TextTokenizer;
use nanoalign_train::generation::{generate, GenerationConfig};
use nanoalign_train::model::CausalLm;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::probes::{ProbeSuite, SuiteKind};

/// One prompt and the model's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub prompt: String,
    /// Prompt and continuation decoded together.
    pub response: String,
    pub completion: String,
    pub n_tokens: usize,
    pub mean_log_prob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub suite: SuiteKind,
    pub results: Vec<ProbeResult>,
}

impl EvalReport {
    /// Console format: one block per prompt, each followed by a blank line.
    pub fn render(&self) -> String {
        let label = self.suite.label();
        let mut out = String::new();
        for r in &self.results {
            let _ = writeln!(out, "{}: {}", label, r.prompt);
            let _ = writeln!(out, "Response: {}", r.response);
            let _ = writeln!(out);
        }
        out
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

pub struct Evaluator {
    generation: GenerationConfig,
    device: Device,
    seed: u64,
    show_progress: bool,
}

impl Evaluator {
    pub fn new(config: &EvalConfig, device: Device, seed: u64) -> Self {
        Self {
            generation: GenerationConfig {
                max_new_tokens: config.max_new_tokens,
                temperature: config.temperature,
                top_k: config.top_k,
            },
            device,
            seed,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Generate a response for every probe. Nothing is scored.
    pub fn run(
        &self,
        model: &CausalLm,
        tokenizer: &TextTokenizer,
        suite: &ProbeSuite,
    ) -> Result<EvalReport> {
        let pb = if self.show_progress {
            ProgressBar::new(suite.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .context("progress bar template")?
                .progress_chars("=>-"),
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut results = Vec::with_capacity(suite.len());
        for probe in &suite.probes {
            pb.set_message(format!("{} probe", suite.kind.name()));
            let generation = generate(
                model,
                tokenizer,
                &probe.prompt,
                &self.generation,
                &mut rng,
                &self.device,
            )
            .with_context(|| format!("generating for {:?}", probe.prompt))?;

            let n_tokens = generation.completion_tokens.len();
            let mean_log_prob = if n_tokens > 0 {
                generation.log_prob / n_tokens as f64
            } else {
                0.0
            };
            debug!(prompt = %probe.prompt, n_tokens, mean_log_prob, "Probe done");
            results.push(ProbeResult {
                prompt: probe.prompt.clone(),
                response: generation.text,
                completion: generation.completion,
                n_tokens,
                mean_log_prob,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(EvalReport {
            suite: suite.kind,
            results,
        })
    }
}
