//! Reward model: frozen language-model backbone plus a scalar head.
//!
//! The head reads the hidden state of the last real token of each row, so
//! right-padding never changes a score. Backbone activations are detached;
//! only the head is trainable.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Linear, Module, Optimizer, VarBuilder, VarMap};
use nanoalign_core::{AlignError, RewardConfig};
use nanoalign_train::checkpoint::PretrainedModel;
use nanoalign_train::data::{PreferencePair, TextTokenizer};
use nanoalign_train::logging::{log_divergence, log_training_step, TrainingMetrics};
use nanoalign_train::model::CausalLm;
use nanoalign_train::optim::{adamw, clip_grad_norm};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const HEAD_FILE: &str = "reward_head.safetensors";
const STAGE: &str = "reward";

pub struct RewardModel {
    backbone: CausalLm,
    _backbone_varmap: VarMap,
    head: Linear,
    head_varmap: VarMap,
    tokenizer: TextTokenizer,
    device: Device,
}

impl RewardModel {
    /// Wrap a loaded model; the head is freshly initialized.
    pub fn new(pretrained: PretrainedModel, device: &Device) -> Result<Self> {
        let head_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&head_varmap, DType::F32, device);
        let head = candle_nn::linear(pretrained.model.hidden_size(), 1, vb.pp("reward_head"))?;
        Ok(Self {
            backbone: pretrained.model,
            _backbone_varmap: pretrained.varmap,
            head,
            head_varmap,
            tokenizer: pretrained.tokenizer,
            device: device.clone(),
        })
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn head_varmap(&self) -> &VarMap {
        &self.head_varmap
    }

    pub fn max_seq_len(&self) -> usize {
        self.backbone.max_seq_len()
    }

    /// ids, attention_mask: u32 [batch, seq] (right-padded) -> scores [batch].
    pub fn score(&self, ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.backbone.forward_hidden(ids)?.detach();
        let lengths: Vec<u32> = attention_mask
            .to_dtype(DType::U32)?
            .sum(D::Minus1)?
            .to_vec1::<u32>()?;

        let rows = lengths
            .iter()
            .enumerate()
            .map(|(b, &len)| hidden.get(b)?.get(len.saturating_sub(1) as usize))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let last = Tensor::stack(&rows, 0)?;
        self.head.forward(&last)?.squeeze(D::Minus1)
    }

    /// Score one unpadded token sequence.
    pub fn score_tokens(&self, tokens: &[u32]) -> Result<f64> {
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let mask = Tensor::ones((1, tokens.len()), DType::U32, &self.device)?;
        let score = self.score(&ids, &mask)?.squeeze(0)?.to_scalar::<f32>()?;
        Ok(score as f64)
    }

    /// Score `prompt ++ response ++ eos`.
    pub fn score_text(&self, prompt: &str, response: &str) -> Result<f64> {
        let (ids, mask) = self.encode_rows(&[(prompt, response)])?;
        let score = self.score(&ids, &mask)?.squeeze(0)?.to_scalar::<f32>()?;
        Ok(score as f64)
    }

    /// Encode pairs, trimmed to the longest real row.
    fn encode_rows(&self, rows: &[(&str, &str)]) -> Result<(Tensor, Tensor)> {
        let encodings = rows
            .iter()
            .map(|(p, r)| self.tokenizer.encode_pair(p, r, self.max_seq_len()))
            .collect::<nanoalign_core::Result<Vec<_>>>()?;
        let width = encodings.iter().map(|e| e.len()).max().unwrap_or(1).max(1);

        let mut ids = Vec::with_capacity(rows.len() * width);
        let mut mask = Vec::with_capacity(rows.len() * width);
        for enc in &encodings {
            ids.extend_from_slice(&enc.input_ids[..width]);
            mask.extend_from_slice(&enc.attention_mask[..width]);
        }
        Ok((
            Tensor::from_vec(ids, (rows.len(), width), &self.device)?,
            Tensor::from_vec(mask, (rows.len(), width), &self.device)?,
        ))
    }

    pub fn save_head(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(HEAD_FILE);
        self.head_varmap
            .save(&path)
            .with_context(|| format!("saving reward head to {}", path.display()))?;
        Ok(())
    }

    pub fn load_head(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(HEAD_FILE);
        self.head_varmap
            .load(&path)
            .map_err(|e| AlignError::CheckpointLoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardTrainStats {
    pub steps: usize,
    /// Mean pairwise loss of the last epoch.
    pub loss: f64,
    /// Fraction of pairs where chosen outscores rejected, after training.
    pub accuracy: f64,
    pub mean_margin: f64,
}

/// Bradley-Terry training of the reward head on preference pairs.
pub struct RewardTrainer {
    optimizer: AdamW,
    config: RewardConfig,
    step: usize,
}

impl RewardTrainer {
    pub fn new(model: &RewardModel, config: RewardConfig) -> Result<Self> {
        let optimizer = adamw(
            model.head_varmap.all_vars(),
            config.learning_rate,
            config.weight_decay,
        )?;
        Ok(Self {
            optimizer,
            config,
            step: 0,
        })
    }

    /// -log sigmoid(r_chosen - r_rejected), averaged over the batch.
    pub fn pairwise_loss(chosen: &Tensor, rejected: &Tensor) -> candle_core::Result<Tensor> {
        // softplus(-(c - r)) = relu(x) + log(1 + exp(-|x|)) with x = r - c
        let x = (rejected - chosen)?;
        let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
        (x.relu()? + tail)?.mean_all()
    }

    fn score_pairs(model: &RewardModel, pairs: &[PreferencePair]) -> Result<(Tensor, Tensor)> {
        let chosen: Vec<(&str, &str)> = pairs
            .iter()
            .map(|p| (p.prompt.as_str(), p.chosen.as_str()))
            .collect();
        let rejected: Vec<(&str, &str)> = pairs
            .iter()
            .map(|p| (p.prompt.as_str(), p.rejected.as_str()))
            .collect();
        let (c_ids, c_mask) = model.encode_rows(&chosen)?;
        let (r_ids, r_mask) = model.encode_rows(&rejected)?;
        Ok((model.score(&c_ids, &c_mask)?, model.score(&r_ids, &r_mask)?))
    }

    pub fn train(
        &mut self,
        model: &RewardModel,
        pairs: &[PreferencePair],
    ) -> Result<RewardTrainStats> {
        if pairs.is_empty() {
            return Err(AlignError::EmptyDataset("preference pairs".into()).into());
        }
        let vars = model.head_varmap.all_vars();
        let mut last_epoch_loss = 0.0;

        for _epoch in 0..self.config.train_epochs {
            let mut epoch_loss = 0.0;
            let mut n_batches = 0usize;
            for chunk in pairs.chunks(self.config.batch_size.max(1)) {
                let (chosen, rejected) = Self::score_pairs(model, chunk)?;
                let loss = Self::pairwise_loss(&chosen, &rejected)?;
                let loss_val = loss.to_scalar::<f32>()? as f64;
                if !loss_val.is_finite() {
                    log_divergence(STAGE, self.step, loss_val);
                    return Err(AlignError::TrainingDiverged {
                        stage: STAGE.into(),
                        step: self.step,
                        loss: loss_val,
                    }
                    .into());
                }

                let mut grads = loss.backward()?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
                self.optimizer.step(&grads)?;
                self.step += 1;
                log_training_step(
                    STAGE,
                    self.step,
                    &TrainingMetrics::new(loss_val, self.optimizer.learning_rate(), grad_norm, 0.0),
                );

                epoch_loss += loss_val;
                n_batches += 1;
            }
            last_epoch_loss = epoch_loss / n_batches.max(1) as f64;
        }

        let (accuracy, mean_margin) = Self::accuracy(model, pairs)?;
        info!(
            steps = self.step,
            loss = last_epoch_loss,
            accuracy,
            "Reward head trained"
        );
        Ok(RewardTrainStats {
            steps: self.step,
            loss: last_epoch_loss,
            accuracy,
            mean_margin,
        })
    }

    /// (fraction with chosen > rejected, mean margin).
    pub fn accuracy(model: &RewardModel, pairs: &[PreferencePair]) -> Result<(f64, f64)> {
        if pairs.is_empty() {
            return Ok((0.0, 0.0));
        }
        let (chosen, rejected) = Self::score_pairs(model, pairs)?;
        let margins = (chosen - rejected)?.to_vec1::<f32>()?;
        let wins = margins.iter().filter(|&&m| m > 0.0).count();
        let mean = margins.iter().map(|&m| m as f64).sum::<f64>() / margins.len() as f64;
        Ok((wins as f64 / margins.len() as f64, mean))
    }
}
