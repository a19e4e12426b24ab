//! PPO trainer: rollouts from the policy, reward-model scoring, and clipped
//! policy/value updates against a frozen reference model.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Linear, Module, Optimizer, VarBuilder, VarMap};
use nanoalign_core::{AlignError, PpoConfig};
use nanoalign_train::checkpoint::{save_pretrained, CheckpointMeta, PretrainedModel};
use nanoalign_train::data::{InstructionDataset, TextTokenizer};
use nanoalign_train::generation::{generate, GenerationConfig};
use nanoalign_train::logging::log_divergence;
use nanoalign_train::model::{gathered_log_probs, CausalLm};
use nanoalign_train::optim::{adamw, clip_grad_norm};
use nanoalign_train::ModelConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::metrics::MetricsLogger;
use crate::ppo::{
    clipped_policy_loss, clipped_value_loss, mean_std, KlController, PpoBatch, PpoStats, Rollout,
};
use crate::reward::RewardModel;

pub const STAGE: &str = "ppo";
pub const VALUE_HEAD_FILE: &str = "value_head.safetensors";

struct UpdateStats {
    policy_loss: f64,
    value_loss: f64,
    total_loss: f64,
    clip_frac: f64,
    grad_norm: f64,
}

pub struct PpoTrainer {
    policy: CausalLm,
    policy_varmap: VarMap,
    config_model: ModelConfig,
    value_head: Linear,
    value_varmap: VarMap,
    reference: CausalLm,
    _reference_varmap: VarMap,
    reward: RewardModel,
    tokenizer: TextTokenizer,
    optimizer: AdamW,
    kl_ctl: KlController,
    config: PpoConfig,
    rng: StdRng,
    device: Device,
    iteration: usize,
    last_loss: f64,
    metrics: Option<MetricsLogger>,
}

impl PpoTrainer {
    /// `policy` is trained; `reference` stays frozen and anchors the KL penalty.
    pub fn new(
        policy: PretrainedModel,
        reference: PretrainedModel,
        reward: RewardModel,
        config: PpoConfig,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        let value_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&value_varmap, DType::F32, &device);
        let value_head = candle_nn::linear(policy.model.hidden_size(), 1, vb.pp("value_head"))?;

        let mut vars = policy.varmap.all_vars();
        vars.extend(value_varmap.all_vars());
        let optimizer = adamw(vars, config.learning_rate, 0.0)?;

        let kl_ctl = KlController::new(
            config.init_kl_coef,
            config.adap_kl_ctrl,
            config.target_kl,
            config.horizon,
        );
        let metrics = match config.log_with {
            Some(format) => Some(MetricsLogger::create(Path::new(&config.log_dir), format)?),
            None => None,
        };

        Ok(Self {
            policy: policy.model,
            policy_varmap: policy.varmap,
            config_model: policy.config,
            value_head,
            value_varmap,
            reference: reference.model,
            _reference_varmap: reference.varmap,
            reward,
            tokenizer: policy.tokenizer,
            optimizer,
            kl_ctl,
            config,
            rng: StdRng::seed_from_u64(seed),
            device,
            iteration: 0,
            last_loss: 0.0,
            metrics,
        })
    }

    pub fn policy(&self) -> &CausalLm {
        &self.policy
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn kl_coef(&self) -> f64 {
        self.kl_ctl.value()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn metrics_path(&self) -> Option<&Path> {
        self.metrics.as_ref().map(|m| m.path())
    }

    /// Response-token log-probs and values for one sequence, graph attached.
    fn policy_outputs(
        &self,
        tokens: &[u32],
        prompt_len: usize,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let n = tokens.len() - prompt_len;
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let (logits, hidden) = self.policy.forward_with_hidden(&ids)?;

        let seq = tokens.len();
        let logits = logits.narrow(1, 0, seq - 1)?;
        let targets = ids.narrow(1, 1, seq - 1)?;
        let logprobs = gathered_log_probs(&logits, &targets)?
            .squeeze(0)?
            .narrow(0, prompt_len - 1, n)?;

        // Value of the state before each response token.
        let values = self
            .value_head
            .forward(&hidden.narrow(1, prompt_len - 1, n)?)?
            .squeeze(D::Minus1)?
            .squeeze(0)?;
        Ok((logprobs, values))
    }

    fn reference_logprobs(
        &self,
        tokens: &[u32],
        prompt_len: usize,
    ) -> candle_core::Result<Vec<f64>> {
        let n = tokens.len() - prompt_len;
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let lp = self
            .reference
            .token_log_probs(&ids)?
            .squeeze(0)?
            .narrow(0, prompt_len - 1, n)?;
        to_f64(&lp)
    }

    /// Sample one response per prompt and record everything the update needs.
    pub fn collect_rollouts(&mut self, prompts: &[String]) -> Result<PpoBatch> {
        let gen_cfg = GenerationConfig {
            max_new_tokens: self.config.max_new_tokens,
            temperature: self.config.temperature,
            top_k: self.config.top_k,
        };
        let mut batch = PpoBatch::default();
        for prompt in prompts {
            let generation = generate(
                &self.policy,
                &self.tokenizer,
                prompt,
                &gen_cfg,
                &mut self.rng,
                &self.device,
            )
            .with_context(|| format!("sampling a response for {:?}", prompt))?;
            if generation.completion_tokens.is_empty() {
                warn!(prompt = %prompt, "No room left in context, skipping rollout");
                continue;
            }

            let full_tokens = generation.full_tokens();
            let prompt_len = generation.prompt_tokens.len();
            let (logprobs, values) = self.policy_outputs(&full_tokens, prompt_len)?;
            let ref_logprobs = self.reference_logprobs(&full_tokens, prompt_len)?;
            let score = self.reward.score_tokens(&full_tokens)?;

            batch.rollouts.push(Rollout {
                prompt: prompt.clone(),
                response: generation.completion,
                full_tokens,
                prompt_len,
                score,
                logprobs: to_f64(&logprobs.detach())?,
                ref_logprobs,
                values: to_f64(&values.detach())?,
                rewards: Vec::new(),
                advantages: Vec::new(),
                returns: Vec::new(),
            });
        }
        Ok(batch)
    }

    /// Optimize the clipped objective over `ppo_epochs` shuffled passes.
    fn update(&mut self, batch: &PpoBatch) -> Result<UpdateStats> {
        let mut vars = self.policy_varmap.all_vars();
        vars.extend(self.value_varmap.all_vars());

        let mut order: Vec<usize> = (0..batch.len()).collect();
        let mut sums = [0.0f64; 5];
        let mut n_updates = 0usize;

        for _epoch in 0..self.config.ppo_epochs {
            order.shuffle(&mut self.rng);
            for chunk in order.chunks(self.config.mini_batch_size.max(1)) {
                let mut new_lp = Vec::with_capacity(chunk.len());
                let mut new_v = Vec::with_capacity(chunk.len());
                let (mut old_lp, mut old_v, mut adv, mut ret) =
                    (Vec::new(), Vec::new(), Vec::new(), Vec::new());
                for &i in chunk {
                    let r = &batch.rollouts[i];
                    let (lp, v) = self.policy_outputs(&r.full_tokens, r.prompt_len)?;
                    new_lp.push(lp);
                    new_v.push(v);
                    old_lp.extend(r.logprobs.iter().map(|&x| x as f32));
                    old_v.extend(r.values.iter().map(|&x| x as f32));
                    adv.extend(r.advantages.iter().map(|&x| x as f32));
                    ret.extend(r.returns.iter().map(|&x| x as f32));
                }

                let new_lp = Tensor::cat(&new_lp, 0)?;
                let new_v = Tensor::cat(&new_v, 0)?;
                let old_lp = Tensor::new(old_lp.as_slice(), &self.device)?;
                let old_v = Tensor::new(old_v.as_slice(), &self.device)?;
                let adv = Tensor::new(adv.as_slice(), &self.device)?;
                let ret = Tensor::new(ret.as_slice(), &self.device)?;

                let (pg_loss, clip_frac) =
                    clipped_policy_loss(&new_lp, &old_lp, &adv, self.config.clip_range)?;
                let vf_loss =
                    clipped_value_loss(&new_v, &old_v, &ret, self.config.clip_range_value)?;
                let loss = (&pg_loss + (&vf_loss * self.config.vf_coef)?)?;

                let loss_val = loss.to_scalar::<f32>()? as f64;
                if !loss_val.is_finite() {
                    log_divergence(STAGE, self.iteration, loss_val);
                    return Err(AlignError::TrainingDiverged {
                        stage: STAGE.into(),
                        step: self.iteration,
                        loss: loss_val,
                    }
                    .into());
                }

                let mut grads = loss.backward()?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.max_grad_norm)?;
                self.optimizer.step(&grads)?;

                sums[0] += pg_loss.to_scalar::<f32>()? as f64;
                sums[1] += vf_loss.to_scalar::<f32>()? as f64;
                sums[2] += loss_val;
                sums[3] += clip_frac;
                sums[4] += grad_norm;
                n_updates += 1;
            }
        }

        let n = n_updates.max(1) as f64;
        Ok(UpdateStats {
            policy_loss: sums[0] / n,
            value_loss: sums[1] / n,
            total_loss: sums[2] / n,
            clip_frac: sums[3] / n,
            grad_norm: sums[4] / n,
        })
    }

    /// One PPO iteration over `prompts`.
    pub fn step(&mut self, prompts: &[String]) -> Result<PpoStats> {
        let mut batch = self.collect_rollouts(prompts)?;
        if batch.is_empty() {
            return Err(AlignError::EmptyDataset("no rollouts could be sampled".into()).into());
        }

        let kl_coef = self.kl_ctl.value();
        batch.finalize(
            kl_coef,
            self.config.gamma,
            self.config.lam,
            self.config.score_clip,
            self.config.whiten_advantages,
        );
        let update = self.update(&batch)?;

        let (mean_score, score_std) = mean_std(&batch.scores());
        let kls: Vec<f64> = batch.rollouts.iter().map(Rollout::kl).collect();
        let (mean_kl, _) = mean_std(&kls);
        let lens: Vec<f64> = batch
            .rollouts
            .iter()
            .map(|r| r.response_len() as f64)
            .collect();
        let returns: Vec<f64> = batch
            .rollouts
            .iter()
            .filter_map(|r| r.returns.first().copied())
            .collect();

        self.kl_ctl.update(mean_kl, batch.len());
        self.iteration += 1;
        self.last_loss = update.total_loss;

        let stats = PpoStats {
            iteration: self.iteration,
            mean_score,
            score_std,
            mean_kl,
            kl_coef,
            policy_loss: update.policy_loss,
            value_loss: update.value_loss,
            total_loss: update.total_loss,
            clip_frac: update.clip_frac,
            grad_norm: update.grad_norm,
            mean_response_len: mean_std(&lens).0,
            mean_return: mean_std(&returns).0,
            n_rollouts: batch.len(),
        };
        info!(
            iteration = stats.iteration,
            mean_score = format!("{:.4}", stats.mean_score),
            mean_kl = format!("{:.4}", stats.mean_kl),
            kl_coef = format!("{:.4}", stats.kl_coef),
            loss = format!("{:.4}", stats.total_loss),
            clip_frac = format!("{:.3}", stats.clip_frac),
            "PPO iteration"
        );
        if let Some(logger) = self.metrics.as_mut() {
            logger.log(&stats)?;
        }
        Ok(stats)
    }

    /// Run `steps` iterations, cycling the dataset's instructions to fill each batch.
    pub fn train(&mut self, dataset: &InstructionDataset) -> Result<Vec<PpoStats>> {
        if dataset.is_empty() {
            return Err(AlignError::EmptyDataset("no prompts for PPO".into()).into());
        }
        let instructions: Vec<String> = dataset.rows().map(|(p, _)| p.to_string()).collect();
        let batch_size = self.config.batch_size.max(1);

        let mut history = Vec::with_capacity(self.config.steps);
        for _ in 0..self.config.steps {
            let start = self.iteration * batch_size;
            let prompts: Vec<String> = (0..batch_size)
                .map(|i| instructions[(start + i) % instructions.len()].clone())
                .collect();
            history.push(self.step(&prompts)?);
        }
        Ok(history)
    }

    /// Save the policy as a checkpoint directory, with the value head beside it.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let meta = CheckpointMeta::new(&self.config_model, STAGE, self.iteration, self.last_loss);
        save_pretrained(dir, &self.policy_varmap, &self.tokenizer, &meta)
            .with_context(|| format!("saving PPO policy to {}", dir.display()))?;
        let path = dir.join(VALUE_HEAD_FILE);
        self.value_varmap
            .save(&path)
            .with_context(|| format!("saving value head to {}", path.display()))?;
        Ok(())
    }

    pub fn into_parts(self) -> (CausalLm, VarMap, TextTokenizer) {
        (self.policy, self.policy_varmap, self.tokenizer)
    }
}

fn to_f64(t: &Tensor) -> candle_core::Result<Vec<f64>> {
    Ok(t.to_vec1::<f32>()?.into_iter().map(f64::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanoalign_train::checkpoint::from_pretrained;

    fn trainer(config: PpoConfig) -> PpoTrainer {
        let device = Device::Cpu;
        let policy = from_pretrained("tiny", &device).unwrap();
        let reference = from_pretrained("tiny", &device).unwrap();
        let reward = RewardModel::new(from_pretrained("tiny", &device).unwrap(), &device).unwrap();
        PpoTrainer::new(policy, reference, reward, config, device, 0).unwrap()
    }

    fn quiet_config() -> PpoConfig {
        PpoConfig {
            log_with: None,
            max_new_tokens: 4,
            ppo_epochs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_rollout_shapes() -> Result<()> {
        let mut t = trainer(quiet_config());
        let batch = t.collect_rollouts(&["Hello".to_string(), "Good".to_string()])?;
        assert_eq!(batch.len(), 2);
        for r in &batch.rollouts {
            let n = r.response_len();
            assert!(n >= 1 && n <= 4);
            assert_eq!(r.logprobs.len(), n);
            assert_eq!(r.ref_logprobs.len(), n);
            assert_eq!(r.values.len(), n);
            assert!(r.score.is_finite());
        }
        Ok(())
    }

    #[test]
    fn test_step_counts_iterations_and_rollouts() -> Result<()> {
        let mut t = trainer(quiet_config());
        let prompts = vec!["Hi".to_string(); 4];
        let stats = t.step(&prompts)?;
        assert_eq!(stats.iteration, 1);
        assert_eq!(stats.n_rollouts, 4);
        assert!(stats.total_loss.is_finite());
        assert_eq!(stats.kl_coef, 0.2);
        assert_eq!(t.iteration(), 1);
        Ok(())
    }

    #[test]
    fn test_first_iteration_kl_is_zero_for_identical_reference() -> Result<()> {
        // Policy and reference are distinct random inits, so seed the policy
        // from the reference checkpoint to get an exact copy.
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let base = from_pretrained("tiny", &device)?;
        let meta = CheckpointMeta::new(&base.config, "sft", 0, 0.0);
        save_pretrained(dir.path(), &base.varmap, &base.tokenizer, &meta)?;
        let path = dir.path().to_str().unwrap_or_default();

        let policy = from_pretrained(path, &device)?;
        let reference = from_pretrained(path, &device)?;
        let reward = RewardModel::new(from_pretrained(path, &device)?, &device)?;
        let mut t = PpoTrainer::new(policy, reference, reward, quiet_config(), device, 3)?;

        let batch = t.collect_rollouts(&["Hello, how are".to_string()])?;
        assert!(batch.rollouts[0].kl().abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_save_writes_policy_and_value_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer(quiet_config());
        t.step(&["Hi".to_string()])?;
        t.save(dir.path())?;
        assert!(dir.path().join("model.safetensors").exists());
        assert!(dir.path().join(VALUE_HEAD_FILE).exists());

        let reloaded = from_pretrained(dir.path().to_str().unwrap_or_default(), &Device::Cpu)?;
        let meta = reloaded.meta.expect("checkpoint metadata");
        assert_eq!(meta.stage, "ppo");
        assert_eq!(meta.step, 1);
        Ok(())
    }
}
