//! Prompt suites run against a trained model.

use nanoalign_core::EvalConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteKind {
    Evaluation,
    Adversarial,
}

impl SuiteKind {
    /// Heading printed before each prompt.
    pub fn label(&self) -> &'static str {
        match self {
            SuiteKind::Evaluation => "Prompt",
            SuiteKind::Adversarial => "Test Case",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SuiteKind::Evaluation => "evaluation",
            SuiteKind::Adversarial => "adversarial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub prompt: String,
}

impl Probe {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSuite {
    pub kind: SuiteKind,
    pub probes: Vec<Probe>,
}

impl ProbeSuite {
    pub fn new<I, S>(kind: SuiteKind, prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            probes: prompts.into_iter().map(Probe::new).collect(),
        }
    }

    /// Next-word and summarization probes.
    pub fn evaluation() -> Self {
        Self::new(SuiteKind::Evaluation, EvalConfig::default().prompts)
    }

    /// Prompts a well-behaved model should decline.
    pub fn adversarial() -> Self {
        Self::new(SuiteKind::Adversarial, EvalConfig::default().adversarial_prompts)
    }

    /// Both suites from config: (evaluation, adversarial).
    pub fn from_config(config: &EvalConfig) -> (Self, Self) {
        (
            Self::new(SuiteKind::Evaluation, config.prompts.iter().cloned()),
            Self::new(SuiteKind::Adversarial, config.adversarial_prompts.iter().cloned()),
        )
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}
