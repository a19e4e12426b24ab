//! The staged alignment pipeline.
//!
//! Stages run in a fixed order, each handing the next a checkpoint directory:
//! 1. Load the base model (checkpoint dir or preset), pad = eos
//! 2. Tokenize the instruction data and fine-tune (SFT)
//! 3. Save to `output.fine_tuned_dir`
//! 4. Reward model over the fine-tuned backbone, head trained on preference pairs
//! 5. PPO against a frozen copy of the fine-tuned model, saved to `output.final_dir`
//! 6. Evaluation prompts, then adversarial test cases, printed to stdout

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use nanoalign_core::{resolve_device, PipelineConfig};
use nanoalign_eval::{EvalReport, Evaluator, ProbeSuite, SuiteKind};
use nanoalign_rl::{PpoStats, PpoTrainer, RewardModel, RewardTrainStats, RewardTrainer};
use nanoalign_train::checkpoint::{from_pretrained, save_pretrained, CheckpointMeta};
use nanoalign_train::data::{Dataset, InstructionDataset, PreferencePair, TokenizedDataset};
use nanoalign_train::sft::{SftTrainer, STAGE as SFT_STAGE};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftSummary {
    pub global_step: usize,
    pub train_loss: f64,
    pub epoch_losses: Vec<f64>,
    /// Loss of the last per-epoch evaluation, if any ran.
    pub eval_loss: Option<f64>,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpoSummary {
    /// None when the reward head was left untrained.
    pub reward: Option<RewardTrainStats>,
    pub iterations: Vec<PpoStats>,
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub sft: SftSummary,
    pub ppo: PpoSummary,
    pub evaluation: EvalReport,
    pub adversarial: EvalReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    device: Device,
    show_progress: bool,
}

impl Pipeline {
    /// Validate the config and resolve the compute device.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let device = resolve_device(&config.model.device)?;
        Ok(Self {
            config,
            device,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage in order.
    pub fn run(&self) -> Result<PipelineSummary> {
        let sft = self.sft()?;
        let ppo = self.ppo()?;
        let final_dir = self.config.output.final_dir.clone();
        let evaluation = self.evaluate(SuiteKind::Evaluation, &final_dir)?;
        let adversarial = self.evaluate(SuiteKind::Adversarial, &final_dir)?;
        Ok(PipelineSummary {
            sft,
            ppo,
            evaluation,
            adversarial,
        })
    }

    /// Fine-tune `model.name` on the demo instructions and save to `output.fine_tuned_dir`.
    pub fn sft(&self) -> Result<SftSummary> {
        let cfg = &self.config;
        let mut base = from_pretrained(&cfg.model.name, &self.device)
            .with_context(|| format!("loading base model '{}'", cfg.model.name))?;
        let eos = base.tokenizer.eos_id();
        base.tokenizer.set_pad_id(eos);

        let max_length = cfg.sft.max_length.unwrap_or(base.config.max_seq_len);
        let data = TokenizedDataset::map(&InstructionDataset::demo(), &base.tokenizer, max_length)?
            .with_prompt_masking(cfg.sft.mask_prompt);
        info!(
            rows = data.len(),
            max_length = data.max_length(),
            mask_prompt = cfg.sft.mask_prompt,
            "Tokenized instruction data"
        );

        let mut trainer = SftTrainer::new(
            base.model,
            base.varmap,
            cfg.sft.clone(),
            self.device.clone(),
            cfg.model.seed,
        )?;
        let output = trainer.train(&data, None, &base.tokenizer)?;

        let out_dir = Path::new(&cfg.output.fine_tuned_dir);
        let meta = CheckpointMeta::new(
            &base.config,
            SFT_STAGE,
            output.global_step,
            output.train_loss,
        );
        save_pretrained(out_dir, &trainer.varmap, &base.tokenizer, &meta)
            .with_context(|| format!("saving fine-tuned model to {}", out_dir.display()))?;
        info!(dir = %out_dir.display(), loss = output.train_loss, "Fine-tuned model saved");

        Ok(SftSummary {
            global_step: output.global_step,
            train_loss: output.train_loss,
            epoch_losses: output.epoch_losses,
            eval_loss: output.eval_history.last().map(|e| e.loss),
            output_dir: cfg.output.fine_tuned_dir.clone(),
        })
    }

    /// Reward head and PPO from `output.fine_tuned_dir`; saves to `output.final_dir`.
    pub fn ppo(&self) -> Result<PpoSummary> {
        let cfg = &self.config;
        let source = cfg.output.fine_tuned_dir.as_str();
        let load = || {
            from_pretrained(source, &self.device)
                .with_context(|| format!("loading fine-tuned model from {}", source))
        };

        let reward_model = RewardModel::new(load()?, &self.device)?;
        let reward = if cfg.reward.train_epochs > 0 {
            let mut trainer = RewardTrainer::new(&reward_model, cfg.reward.clone())?;
            Some(trainer.train(&reward_model, &[PreferencePair::demo()])?)
        } else {
            None
        };

        let mut policy = load()?;
        let eos = policy.tokenizer.eos_id();
        policy.tokenizer.set_pad_id(eos);
        let mut trainer = PpoTrainer::new(
            policy,
            load()?,
            reward_model,
            cfg.ppo.clone(),
            self.device.clone(),
            cfg.model.seed.wrapping_add(1),
        )?;
        if let Some(path) = trainer.metrics_path() {
            info!(path = %path.display(), "Writing PPO metrics");
        }
        let iterations = trainer.train(&InstructionDataset::demo())?;

        let out_dir = Path::new(&cfg.output.final_dir);
        trainer.save(out_dir)?;
        info!(dir = %out_dir.display(), iterations = iterations.len(), "Final model saved");

        Ok(PpoSummary {
            reward,
            iterations,
            output_dir: cfg.output.final_dir.clone(),
        })
    }

    /// Run one probe suite against the model in `model_dir` and print the result.
    pub fn evaluate(&self, kind: SuiteKind, model_dir: &str) -> Result<EvalReport> {
        let cfg = &self.config;
        let pm = from_pretrained(model_dir, &self.device)
            .with_context(|| format!("loading model for {} from {}", kind.name(), model_dir))?;
        let (evaluation, adversarial) = ProbeSuite::from_config(&cfg.eval);
        let suite = match kind {
            SuiteKind::Evaluation => evaluation,
            SuiteKind::Adversarial => adversarial,
        };

        let report = Evaluator::new(&cfg.eval, self.device.clone(), cfg.model.seed)
            .with_progress(self.show_progress)
            .run(&pm.model, &pm.tokenizer, &suite)?;
        print!("{}", report.render());

        if let Some(dir) = &cfg.eval.report_dir {
            let path = Path::new(dir).join(format!("{}.json", kind.name()));
            report.save_json(&path)?;
        }
        Ok(report)
    }
}
