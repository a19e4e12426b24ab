//! # nanoalign training library
//!
//! A small decoder-only transformer on candle, a byte-level or GPT-2 style
//! tokenizer, instruction datasets, checkpoint directories, and the
//! supervised fine-tuning loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use nanoalign_core::SftConfig;
//! use nanoalign_train::{checkpoint::from_pretrained, data::*, sft::SftTrainer};
//!
//! # fn main() -> nanoalign_core::Result<()> {
//! let pm = from_pretrained("tiny", &Device::Cpu)?;
//! let data = TokenizedDataset::map(&InstructionDataset::demo(), &pm.tokenizer, 64)?;
//! let mut trainer = SftTrainer::new(pm.model, pm.varmap, SftConfig::default(), Device::Cpu, 42)?;
//! let output = trainer.train(&data, None, &pm.tokenizer)?;
//! println!("final loss {:.4}", output.train_loss);
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ffn;
pub mod generation;
pub mod layers;
pub mod logging;
pub mod model;
pub mod optim;
pub mod sft;

pub use checkpoint::{from_pretrained, save_pretrained, CheckpointMeta, PretrainedModel};
pub use config::ModelConfig;
pub use generation::{generate, sample_token, Generation, GenerationConfig, SampledToken};
pub use model::CausalLm;
pub use sft::{EvalStats, SftTrainer, StepStats, TrainOutput};
