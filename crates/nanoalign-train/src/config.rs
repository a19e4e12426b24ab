//! Model architecture configuration and named presets.

use serde::{Deserialize, Serialize};

/// Vocabulary of the built-in byte-level tokenizer: 256 bytes + `<|endoftext|>`.
pub const BYTE_VOCAB_SIZE: usize = 257;

/// GPT-2 BPE vocabulary size.
pub const GPT2_VOCAB_SIZE: usize = 50257;

/// Causal LM architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub ffn_mult: f32,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub weight_tied: bool,
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_norm_eps() -> f64 {
    1e-6
}

impl ModelConfig {
    /// Look up a preset by name (`-` and `_` are interchangeable).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "tiny" => Some(Self::tiny()),
            "small" => Some(Self::small()),
            "nano-125m" | "nano_125m" => Some(Self::nano_125m()),
            _ => None,
        }
    }

    /// Names accepted by [`ModelConfig::preset`].
    pub fn preset_names() -> &'static [&'static str] {
        &["tiny", "small", "nano-125m"]
    }

    /// ~100K params, byte vocabulary. Runs the whole pipeline on CPU in seconds.
    pub fn tiny() -> Self {
        Self {
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 4,
            ffn_mult: 2.0,
            vocab_size: BYTE_VOCAB_SIZE,
            max_seq_len: 64,
            weight_tied: true,
            rope_theta: 10000.0,
            norm_eps: 1e-6,
        }
    }

    /// ~3M params, byte vocabulary.
    pub fn small() -> Self {
        Self {
            dim: 256,
            n_layers: 4,
            n_heads: 8,
            n_kv_heads: 4,
            ffn_mult: 2.6875,
            vocab_size: BYTE_VOCAB_SIZE,
            max_seq_len: 256,
            weight_tied: true,
            rope_theta: 10000.0,
            norm_eps: 1e-6,
        }
    }

    /// GPT-2 small scale, GPT-2 vocabulary (needs a `tokenizer.json`).
    pub fn nano_125m() -> Self {
        Self {
            dim: 768,
            n_layers: 12,
            n_heads: 12,
            n_kv_heads: 12,
            ffn_mult: 2.6875,
            vocab_size: GPT2_VOCAB_SIZE,
            max_seq_len: 1024,
            weight_tied: true,
            rope_theta: 10000.0,
            norm_eps: 1e-6,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// SwiGLU hidden dimension, rounded up to a multiple of 8.
    pub fn ffn_dim(&self) -> usize {
        let raw = (self.dim as f32 * self.ffn_mult) as usize;
        raw.div_ceil(8) * 8
    }

    /// Validate configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.dim == 0 {
            errors.push("dim must be > 0".to_string());
        }
        if self.n_layers == 0 {
            errors.push("n_layers must be > 0".to_string());
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            errors.push(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            ));
        } else if self.head_dim() % 2 != 0 {
            errors.push(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            ));
        }
        if self.n_kv_heads == 0 || self.n_heads % self.n_kv_heads != 0 {
            errors.push(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            ));
        }
        if self.ffn_mult <= 0.0 {
            errors.push("ffn_mult must be > 0".to_string());
        }
        if self.vocab_size < 2 {
            errors.push("vocab_size must be >= 2".to_string());
        }
        if self.max_seq_len < 2 {
            errors.push("max_seq_len must be >= 2".to_string());
        }
        if self.rope_theta <= 0.0 {
            errors.push("rope_theta must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Estimate total parameter count.
    pub fn param_count_estimate(&self) -> usize {
        let d = self.dim;
        let kv = self.n_kv_heads * self.head_dim();
        let attn = 2 * d * d + 2 * d * kv;
        let ffn = 3 * d * self.ffn_dim();
        let per_layer = attn + ffn + 2 * d;
        let lm_head = if self.weight_tied { 0 } else { d * self.vocab_size };
        self.vocab_size * d + self.n_layers * per_layer + d + lm_head
    }
}
