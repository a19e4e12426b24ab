//! Supervised fine-tuning loop.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, VarMap};
use nanoalign_core::{AlignError, IntervalStrategy, Result, SftConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::{cleanup_old_checkpoints, save_pretrained, CheckpointMeta};
use crate::data::{Batch, DataLoader, Dataset, TextTokenizer};
use crate::logging::{log_divergence, log_evaluation, log_training_step, TrainingMetrics};
use crate::model::CausalLm;
use crate::optim::{adamw, clip_grad_norm, linear_warmup_decay};

pub const STAGE: &str = "sft";

/// Training step statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStats {
    pub loss: f64,
    /// Norm before clipping.
    pub grad_norm: f64,
    pub lr: f64,
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalStats {
    pub epoch: usize,
    pub loss: f64,
    pub perplexity: f64,
}

/// Summary of a full `train` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over every step.
    pub train_loss: f64,
    pub epoch_losses: Vec<f64>,
    pub eval_history: Vec<EvalStats>,
    /// Checkpoint directories still on disk after rotation.
    pub checkpoints: Vec<PathBuf>,
}

pub struct SftTrainer {
    pub model: CausalLm,
    pub varmap: VarMap,
    optimizer: AdamW,
    config: SftConfig,
    device: Device,
    seed: u64,
    global_step: usize,
    /// 0 = constant learning rate.
    total_steps: usize,
}

impl SftTrainer {
    pub fn new(
        model: CausalLm,
        varmap: VarMap,
        config: SftConfig,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        let optimizer = adamw(varmap.all_vars(), config.learning_rate, config.weight_decay)?;
        Ok(Self {
            model,
            varmap,
            optimizer,
            config,
            device,
            seed,
            global_step: 0,
            total_steps: 0,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn config(&self) -> &SftConfig {
        &self.config
    }

    pub fn set_total_steps(&mut self, total_steps: usize) {
        self.total_steps = total_steps;
    }

    fn current_lr(&self) -> f64 {
        if self.total_steps == 0 {
            return self.config.learning_rate;
        }
        self.config.learning_rate
            * linear_warmup_decay(self.global_step, self.config.warmup_steps, self.total_steps)
    }

    /// Masked LM loss, backward, clip, AdamW step.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let step_start = Instant::now();

        let loss = self
            .model
            .masked_lm_loss(&batch.input_ids, &batch.target_ids, &batch.loss_mask)?;
        let loss_val = loss.to_scalar::<f32>()? as f64;
        if !loss_val.is_finite() {
            log_divergence(STAGE, self.global_step, loss_val);
            return Err(AlignError::TrainingDiverged {
                stage: STAGE.to_string(),
                step: self.global_step,
                loss: loss_val,
            });
        }

        let mut grads = loss.backward()?;
        let vars = self.varmap.all_vars();
        let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.max_grad_norm)?;

        let lr = self.current_lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let elapsed = step_start.elapsed().as_secs_f64();
        let tokens_per_sec = if elapsed > 0.0 {
            batch.n_tokens as f64 / elapsed
        } else {
            0.0
        };

        Ok(StepStats {
            loss: loss_val,
            grad_norm,
            lr,
            tokens_per_sec,
        })
    }

    /// Token-weighted mean loss over `dataset`, no parameter updates.
    pub fn evaluate(&self, dataset: &dyn Dataset) -> Result<EvalStats> {
        if dataset.is_empty() {
            return Err(AlignError::EmptyDataset("evaluation set".into()));
        }
        let loader = DataLoader::new(
            dataset,
            self.config.per_device_train_batch_size,
            false,
            0,
            &self.device,
        );

        let mut weighted = 0.0;
        let mut tokens = 0usize;
        for batch in loader {
            let batch = batch?;
            let loss = self
                .model
                .masked_lm_loss(&batch.input_ids, &batch.target_ids, &batch.loss_mask)?
                .to_scalar::<f32>()? as f64;
            weighted += loss * batch.n_tokens as f64;
            tokens += batch.n_tokens;
        }
        let loss = if tokens > 0 { weighted / tokens as f64 } else { 0.0 };
        Ok(EvalStats {
            epoch: 0,
            loss,
            perplexity: loss.exp(),
        })
    }

    /// Run `num_train_epochs`, evaluating and checkpointing per the configured strategies.
    ///
    /// Without an eval set the training set is evaluated.
    pub fn train(
        &mut self,
        train: &dyn Dataset,
        eval: Option<&dyn Dataset>,
        tokenizer: &TextTokenizer,
    ) -> Result<TrainOutput> {
        if train.is_empty() {
            return Err(AlignError::EmptyDataset("training set".into()));
        }
        let batch_size = self.config.per_device_train_batch_size;
        let steps_per_epoch = train.len().div_ceil(batch_size.max(1));
        self.set_total_steps(self.global_step + steps_per_epoch * self.config.num_train_epochs);

        info!(
            examples = train.len(),
            epochs = self.config.num_train_epochs,
            steps_per_epoch,
            params = self.model.param_count(),
            "Starting supervised fine-tuning"
        );

        let mut output = TrainOutput::default();
        let mut loss_sum = 0.0;
        let mut n_steps = 0usize;

        for epoch in 0..self.config.num_train_epochs {
            let loader = DataLoader::new(
                train,
                batch_size,
                true,
                self.seed.wrapping_add(epoch as u64 * 1000),
                &self.device,
            );

            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;
            for batch in loader {
                let batch = batch?;
                let stats = self.train_step(&batch)?;
                epoch_loss += stats.loss;
                epoch_steps += 1;

                let logging_steps = self.config.logging_steps.max(1);
                if self.global_step == 1 || self.global_step % logging_steps == 0 {
                    log_training_step(
                        STAGE,
                        self.global_step,
                        &TrainingMetrics::new(
                            stats.loss,
                            stats.lr,
                            stats.grad_norm,
                            stats.tokens_per_sec,
                        ),
                    );
                }
            }

            let mean = epoch_loss / epoch_steps.max(1) as f64;
            loss_sum += epoch_loss;
            n_steps += epoch_steps;
            output.epoch_losses.push(mean);
            info!(epoch = epoch + 1, loss = mean, "Epoch finished");

            if self.config.evaluation_strategy == IntervalStrategy::Epoch {
                let mut stats = self.evaluate(eval.unwrap_or(train))?;
                stats.epoch = epoch + 1;
                log_evaluation(stats.epoch, stats.loss, stats.perplexity);
                output.eval_history.push(stats);
            }

            if self.config.save_strategy == IntervalStrategy::Epoch {
                self.save_step_checkpoint(tokenizer, mean)?;
            }
        }

        output.global_step = self.global_step;
        output.train_loss = loss_sum / n_steps.max(1) as f64;
        output.checkpoints = crate::checkpoint::list_step_checkpoints(Path::new(
            &self.config.output_dir,
        ))?
        .into_iter()
        .map(|(path, _)| path)
        .collect();
        Ok(output)
    }

    fn save_step_checkpoint(&self, tokenizer: &TextTokenizer, loss: f64) -> Result<()> {
        let root = Path::new(&self.config.output_dir);
        let dir = root.join(format!("step_{}", self.global_step));
        let meta = CheckpointMeta::new(&self.model.config, STAGE, self.global_step, loss);
        save_pretrained(&dir, &self.varmap, tokenizer, &meta)?;
        if let Some(limit) = self.config.save_total_limit {
            cleanup_old_checkpoints(root, limit)?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (CausalLm, VarMap) {
        (self.model, self.varmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::from_pretrained;
    use crate::data::{InstructionDataset, TokenizedDataset};

    fn trainer(config: SftConfig) -> (SftTrainer, TextTokenizer) {
        let pm = from_pretrained("tiny", &Device::Cpu).unwrap();
        let trainer = SftTrainer::new(pm.model, pm.varmap, config, Device::Cpu, 0).unwrap();
        (trainer, pm.tokenizer)
    }

    #[test]
    fn test_train_step_loss_finite() -> Result<()> {
        let (mut trainer, tok) = trainer(SftConfig::default());
        let ds = TokenizedDataset::map(&InstructionDataset::demo(), &tok, 32)?;
        let batch = Batch::from_examples(&[ds.get_item(0)], &Device::Cpu)?;
        let stats = trainer.train_step(&batch)?;
        assert!(stats.loss.is_finite() && stats.loss > 0.0);
        assert!(stats.grad_norm > 0.0);
        assert_eq!(trainer.global_step(), 1);
        Ok(())
    }

    #[test]
    fn test_loss_decreases_on_repeated_batch() -> Result<()> {
        let config = SftConfig {
            learning_rate: 3e-3,
            ..Default::default()
        };
        let (mut trainer, tok) = trainer(config);
        let ds = TokenizedDataset::map(&InstructionDataset::demo(), &tok, 32)?;
        let batch = Batch::from_examples(&[ds.get_item(0)], &Device::Cpu)?;

        let first = trainer.train_step(&batch)?.loss;
        let mut last = first;
        for _ in 0..20 {
            last = trainer.train_step(&batch)?.loss;
        }
        assert!(last < first, "loss did not decrease: {} -> {}", first, last);
        Ok(())
    }

    #[test]
    fn test_evaluate_does_not_update() -> Result<()> {
        let (trainer, tok) = trainer(SftConfig::default());
        let ds = TokenizedDataset::map(&InstructionDataset::demo(), &tok, 32)?;
        let a = trainer.evaluate(&ds)?;
        let b = trainer.evaluate(&ds)?;
        assert_eq!(a.loss, b.loss);
        assert!((a.perplexity - a.loss.exp()).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_train_keeps_save_total_limit() -> Result<()> {
        let out_dir = tempfile::tempdir().unwrap();
        let config = SftConfig {
            output_dir: out_dir.path().display().to_string(),
            num_train_epochs: 3,
            save_total_limit: Some(1),
            ..Default::default()
        };
        let (mut trainer, tok) = trainer(config);
        let ds = TokenizedDataset::map(&InstructionDataset::demo(), &tok, 32)?;

        let output = trainer.train(&ds, None, &tok)?;
        assert_eq!(output.global_step, 3);
        assert_eq!(output.epoch_losses.len(), 3);
        assert_eq!(output.eval_history.len(), 3);
        assert_eq!(output.checkpoints.len(), 1);
        assert!(output.checkpoints[0].ends_with("step_3"));
        Ok(())
    }
}
