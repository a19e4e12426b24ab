//! Autoregressive text generation (full recompute, no KV cache).

use std::cmp::Ordering;

use candle_core::{Device, Tensor};
use nanoalign_core::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::TextTokenizer;
use crate::model::CausalLm;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// <= 0 selects greedy decoding.
    pub temperature: f64,
    /// 0 = no top-k truncation.
    pub top_k: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            temperature: 0.0,
            top_k: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledToken {
    pub id: u32,
    /// Log-probability under the (temperature/top-k adjusted) sampling distribution.
    pub log_prob: f64,
    pub entropy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub prompt_tokens: Vec<u32>,
    /// Generated ids, including a trailing eos when one was produced.
    pub completion_tokens: Vec<u32>,
    /// Prompt and completion decoded together, special tokens skipped.
    pub text: String,
    pub completion: String,
    /// Sum of sampled-token log-probs.
    pub log_prob: f64,
}

impl Generation {
    pub fn full_tokens(&self) -> Vec<u32> {
        let mut all = self.prompt_tokens.clone();
        all.extend_from_slice(&self.completion_tokens);
        all
    }
}

/// Pick one token from a logits row.
pub fn sample_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f64,
    top_k: usize,
    rng: &mut R,
) -> SampledToken {
    if logits.is_empty() {
        return SampledToken {
            id: 0,
            log_prob: 0.0,
            entropy: 0.0,
        };
    }
    let greedy = temperature <= 0.0;
    let temp = if greedy { 1.0 } else { temperature };

    let mut probs: Vec<f64> = logits.iter().map(|&v| v as f64 / temp).collect();
    let max_logit = probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for p in &mut probs {
        *p = (*p - max_logit).exp();
    }

    if top_k > 0 && top_k < probs.len() {
        let mut idx: Vec<usize> = (0..probs.len()).collect();
        idx.sort_by(|a, b| probs[*b].partial_cmp(&probs[*a]).unwrap_or(Ordering::Equal));
        for &i in &idx[top_k..] {
            probs[i] = 0.0;
        }
    }

    let mass: f64 = probs.iter().sum();
    if !(mass > 0.0) {
        return SampledToken {
            id: 0,
            log_prob: 0.0,
            entropy: 0.0,
        };
    }
    for p in &mut probs {
        *p /= mass;
    }

    let entropy = -probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| p * p.ln())
        .sum::<f64>();

    let selected = if greedy {
        probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    } else {
        let r = rng.gen::<f64>();
        let mut cumulative = 0.0;
        let mut selected = probs.len() - 1;
        for (i, p) in probs.iter().enumerate() {
            cumulative += *p;
            if *p > 0.0 && r <= cumulative {
                selected = i;
                break;
            }
        }
        selected
    };

    SampledToken {
        id: selected as u32,
        log_prob: probs[selected].max(1e-12).ln(),
        entropy,
    }
}

/// Continue `prompt` until eos, `max_new_tokens`, or the context limit.
pub fn generate<R: Rng + ?Sized>(
    model: &CausalLm,
    tokenizer: &TextTokenizer,
    prompt: &str,
    config: &GenerationConfig,
    rng: &mut R,
    device: &Device,
) -> Result<Generation> {
    let mut prompt_tokens = tokenizer.encode(prompt)?;
    if prompt_tokens.is_empty() {
        prompt_tokens.push(tokenizer.eos_id());
    }
    let max_ctx = model.max_seq_len();
    if prompt_tokens.len() >= max_ctx {
        let keep = max_ctx.saturating_sub(1).max(1);
        prompt_tokens = prompt_tokens[prompt_tokens.len() - keep..].to_vec();
    }

    let mut tokens = prompt_tokens.clone();
    let mut completion_tokens = Vec::new();
    let mut log_prob = 0.0;

    for _ in 0..config.max_new_tokens {
        if tokens.len() >= max_ctx {
            break;
        }
        let input = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        let logits = model.forward(&input)?;
        let last = logits
            .squeeze(0)?
            .get(tokens.len() - 1)?
            .to_vec1::<f32>()?;

        let sampled = sample_token(&last, config.temperature, config.top_k, rng);
        tokens.push(sampled.id);
        completion_tokens.push(sampled.id);
        log_prob += sampled.log_prob;
        if sampled.id == tokenizer.eos_id() {
            break;
        }
    }

    Ok(Generation {
        text: tokenizer.decode(&tokens, true)?,
        completion: tokenizer.decode(&completion_tokens, true)?,
        prompt_tokens,
        completion_tokens,
        log_prob,
    })
}
