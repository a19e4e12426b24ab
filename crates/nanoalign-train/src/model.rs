//! Causal language model: embedding -> blocks -> final norm -> LM head.

#[cfg(test)]
use candle_core::DType;
use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use crate::attention::precompute_rope_freqs;
use crate::block::TransformerBlockTrain;
use crate::config::ModelConfig;
use crate::layers::RMSNormTrain;

/// Decoder-only transformer trained with candle autograd.
pub struct CausalLm {
    pub config: ModelConfig,
    pub tok_embed: candle_nn::Embedding,
    pub blocks: Vec<TransformerBlockTrain>,
    pub norm_final: RMSNormTrain,
    pub lm_head_weight: Option<Tensor>, // None if weight-tied
    freqs_cos: Tensor,
    freqs_sin: Tensor,
}

impl CausalLm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        // candle_nn::embedding defaults to stdev 1.0, far too large with a tied head.
        let embed_weights = vb.pp("tok_embed").get_with_hints(
            (config.vocab_size, config.dim),
            "weight",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let tok_embed = candle_nn::Embedding::new(embed_weights, config.dim);

        let blocks = (0..config.n_layers)
            .map(|i| TransformerBlockTrain::new(config, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let norm_final = RMSNormTrain::new(config.dim, config.norm_eps, vb.pp("norm_final"))?;

        let lm_head_weight = if config.weight_tied {
            None
        } else {
            Some(vb.get_with_hints(
                (config.vocab_size, config.dim),
                "lm_head.weight",
                candle_nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?)
        };

        let (freqs_cos, freqs_sin) = precompute_rope_freqs(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;

        Ok(Self {
            config: config.clone(),
            tok_embed,
            blocks,
            norm_final,
            lm_head_weight,
            freqs_cos,
            freqs_sin,
        })
    }

    /// token_ids [batch, seq] -> logits [batch, seq, vocab]
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (logits, _hidden) = self.forward_with_hidden(token_ids)?;
        Ok(logits)
    }

    /// Last hidden state after the final norm, [batch, seq, dim].
    pub fn forward_hidden(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = token_ids.dims2()?;
        if seq_len == 0 || seq_len > self.config.max_seq_len {
            candle_core::bail!(
                "sequence length {} outside 1..={}",
                seq_len,
                self.config.max_seq_len
            );
        }

        let mut x = self.tok_embed.forward(token_ids)?;
        let cos = self.freqs_cos.narrow(0, 0, seq_len)?;
        let sin = self.freqs_sin.narrow(0, 0, seq_len)?;
        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin)?;
        }
        self.norm_final.forward(&x)
    }

    /// Project hidden states to logits. Accepts `[batch, seq, dim]` or `[n, dim]`.
    pub fn project_hidden_to_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let lm_w = match &self.lm_head_weight {
            Some(w) => w.t()?,
            None => self.tok_embed.embeddings().t()?,
        };
        let x_dims = hidden.dims().to_vec();
        if x_dims.len() == 3 {
            let (b, m, k) = (x_dims[0], x_dims[1], x_dims[2]);
            hidden.reshape((b * m, k))?.matmul(&lm_w)?.reshape((b, m, ()))
        } else {
            hidden.matmul(&lm_w)
        }
    }

    pub fn forward_with_hidden(&self, token_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let hidden = self.forward_hidden(token_ids)?;
        let logits = self.project_hidden_to_logits(&hidden)?;
        Ok((logits, hidden))
    }

    /// Mean cross-entropy over positions where `loss_mask` is 1.
    ///
    /// input_ids, target_ids: u32 [batch, seq]; loss_mask: f32 [batch, seq].
    pub fn masked_lm_loss(
        &self,
        input_ids: &Tensor,
        target_ids: &Tensor,
        loss_mask: &Tensor,
    ) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        let nll = gathered_log_probs(&logits, target_ids)?.neg()?;
        let mask = loss_mask.to_dtype(nll.dtype())?;
        let total = (nll * &mask)?.sum_all()?;
        let count = mask.sum_all()?.maximum(1.0)?;
        total / count
    }

    /// Log-probability of each next token: ids [batch, seq] -> [batch, seq - 1].
    pub fn token_log_probs(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = token_ids.dims2()?;
        if seq_len < 2 {
            candle_core::bail!("need at least 2 tokens for next-token log-probs");
        }
        let logits = self.forward(token_ids)?.narrow(1, 0, seq_len - 1)?;
        let targets = token_ids.narrow(1, 1, seq_len - 1)?;
        gathered_log_probs(&logits, &targets)
    }

    pub fn hidden_size(&self) -> usize {
        self.config.dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// Every trainable tensor, tied weights counted once.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.tok_embed.embeddings().clone()];
        for block in &self.blocks {
            let attn = &block.attention;
            let ffn = &block.ffn;
            params.extend(
                [
                    block.norm_attn.weight(),
                    attn.wq.weight(),
                    attn.wk.weight(),
                    attn.wv.weight(),
                    attn.wo.weight(),
                    block.norm_ffn.weight(),
                    ffn.w_gate.weight(),
                    ffn.w_up.weight(),
                    ffn.w_down.weight(),
                ]
                .into_iter()
                .cloned(),
            );
        }
        params.push(self.norm_final.weight().clone());
        if let Some(w) = &self.lm_head_weight {
            params.push(w.clone());
        }
        params
    }

    pub fn param_count(&self) -> usize {
        self.parameters().iter().map(|t| t.elem_count()).sum()
    }
}

/// log_softmax(logits) gathered at `targets`: [b, t, V] x [b, t] -> [b, t].
pub fn gathered_log_probs(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    log_probs
        .gather(&targets.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)
}
