//! Pretrained-model directories: save, load, and rotation.
//!
//! A checkpoint directory holds:
//!   - `model.safetensors`: weights
//!   - `config.json`: [`CheckpointMeta`] (architecture + stage/step/loss)
//!   - `tokenizer.json`, `tokenizer_config.json`

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use nanoalign_core::error::{load_error, save_error};
use nanoalign_core::{AlignError, IoResultExt, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ModelConfig, BYTE_VOCAB_SIZE};
use crate::data::TextTokenizer;
use crate::logging::log_checkpoint_save;
use crate::model::CausalLm;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// Tokenizer used for presets whose vocabulary is not the byte-level one.
pub const TOKENIZER_ENV: &str = "NANOALIGN_TOKENIZER";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model: ModelConfig,
    /// Pipeline stage that produced the weights ("sft", "ppo", ...).
    pub stage: String,
    pub step: usize,
    pub loss: f64,
}

impl CheckpointMeta {
    pub fn new(model: &ModelConfig, stage: &str, step: usize, loss: f64) -> Self {
        Self {
            model: model.clone(),
            stage: stage.to_string(),
            step,
            loss,
        }
    }
}

/// A model ready for training or generation.
pub struct PretrainedModel {
    pub varmap: VarMap,
    pub model: CausalLm,
    pub tokenizer: TextTokenizer,
    pub config: ModelConfig,
    /// None when built from a preset.
    pub meta: Option<CheckpointMeta>,
}

/// Write weights, metadata and tokenizer into `dir`, replacing what is there.
pub fn save_pretrained(
    dir: &Path,
    varmap: &VarMap,
    tokenizer: &TextTokenizer,
    meta: &CheckpointMeta,
) -> Result<()> {
    fs::create_dir_all(dir).with_path(dir)?;

    let weights = dir.join(WEIGHTS_FILE);
    varmap.save(&weights).map_err(|e| save_error(e, &weights))?;

    let config_path = dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(meta)?;
    fs::write(&config_path, json).with_path(&config_path)?;

    tokenizer.save(dir)?;
    log_checkpoint_save(meta.step, &dir.display().to_string(), meta.loss);
    Ok(())
}

/// Load a checkpoint directory, or build a randomly initialized preset.
pub fn from_pretrained(name_or_path: &str, device: &Device) -> Result<PretrainedModel> {
    let path = Path::new(name_or_path);
    if path.is_dir() {
        return load_dir(path, device);
    }

    let Some(config) = ModelConfig::preset(name_or_path) else {
        return Err(AlignError::ModelNotFound(name_or_path.to_string()));
    };
    let tokenizer = preset_tokenizer(&config)?;
    let (varmap, model) = build_model(&config, device)?;
    info!(
        preset = name_or_path,
        params = model.param_count(),
        "Initialized model from preset"
    );
    Ok(PretrainedModel {
        varmap,
        model,
        tokenizer,
        config,
        meta: None,
    })
}

/// Build the architecture, then fill its variables from `dir`.
fn load_dir(dir: &Path, device: &Device) -> Result<PretrainedModel> {
    let config_path = dir.join(CONFIG_FILE);
    let weights = dir.join(WEIGHTS_FILE);
    if !config_path.is_file() || !weights.is_file() {
        return Err(load_error(
            format!("expected {} and {}", CONFIG_FILE, WEIGHTS_FILE),
            dir,
        ));
    }

    let text = fs::read_to_string(&config_path).with_path(&config_path)?;
    let meta: CheckpointMeta =
        serde_json::from_str(&text).map_err(|e| load_error(e, &config_path))?;
    meta.model
        .validate()
        .map_err(|errs| load_error(errs.join("; "), &config_path))?;

    let tokenizer = TextTokenizer::from_dir(dir)?;
    check_vocab(&meta.model, &tokenizer)?;

    let (mut varmap, model) = build_model(&meta.model, device)?;
    load_into(&mut varmap, dir)?;
    info!(
        path = %dir.display(),
        stage = %meta.stage,
        step = meta.step,
        "Loaded checkpoint"
    );

    Ok(PretrainedModel {
        varmap,
        model,
        tokenizer,
        config: meta.model.clone(),
        meta: Some(meta),
    })
}

/// Load `dir/model.safetensors` into variables that already exist in `varmap`.
pub fn load_into(varmap: &mut VarMap, dir: &Path) -> Result<()> {
    let weights = dir.join(WEIGHTS_FILE);
    varmap.load(&weights).map_err(|e| load_error(e, &weights))
}

pub fn build_model(config: &ModelConfig, device: &Device) -> Result<(VarMap, CausalLm)> {
    config
        .validate()
        .map_err(|errs| AlignError::InvalidConfig(errs.join("; ")))?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = CausalLm::new(config, vb)?;
    Ok((varmap, model))
}

fn preset_tokenizer(config: &ModelConfig) -> Result<TextTokenizer> {
    let tokenizer = if config.vocab_size == BYTE_VOCAB_SIZE {
        TextTokenizer::byte_level()?
    } else {
        let path = std::env::var(TOKENIZER_ENV).map_err(|_| AlignError::TokenizerUnavailable {
            path: TOKENIZER_ENV.to_string(),
            reason: format!(
                "vocab_size {} needs a tokenizer.json; set {}",
                config.vocab_size, TOKENIZER_ENV
            ),
        })?;
        TextTokenizer::from_file(Path::new(&path))?
    };
    check_vocab(config, &tokenizer)?;
    Ok(tokenizer)
}

fn check_vocab(config: &ModelConfig, tokenizer: &TextTokenizer) -> Result<()> {
    if tokenizer.vocab_size > config.vocab_size {
        return Err(AlignError::InvalidConfig(format!(
            "tokenizer has {} tokens but the model embeds only {}",
            tokenizer.vocab_size, config.vocab_size
        )));
    }
    Ok(())
}

/// `step_N` subdirectories of `dir`, oldest first.
pub fn list_step_checkpoints(dir: &Path) -> Result<Vec<(PathBuf, usize)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(dir).with_path(dir)? {
        let path = entry.with_path(dir)?.path();
        if !path.is_dir() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("step_"))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((path, step));
        }
    }
    checkpoints.sort_by_key(|(_, step)| *step);
    Ok(checkpoints)
}

/// Delete the oldest `step_N` directories so at most `keep_last` remain.
pub fn cleanup_old_checkpoints(dir: &Path, keep_last: usize) -> Result<usize> {
    let checkpoints = list_step_checkpoints(dir)?;
    let to_remove = checkpoints.len().saturating_sub(keep_last);
    for (path, step) in checkpoints.iter().take(to_remove) {
        debug!(step = step, path = %path.display(), "Removing old checkpoint");
        fs::remove_dir_all(path).with_path(path)?;
    }
    Ok(to_remove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    #[test]
    fn test_unknown_name_is_model_not_found() {
        match from_pretrained("gpt-3.5", &Device::Cpu) {
            Err(AlignError::ModelNotFound(name)) => assert_eq!(name, "gpt-3.5"),
            Err(e) => panic!("expected ModelNotFound, got {}", e),
            Ok(_) => panic!("expected ModelNotFound"),
        }
    }

    #[test]
    fn test_save_then_load_reproduces_logits() -> Result<()> {
        let device = Device::Cpu;
        let saved = from_pretrained("tiny", &device)?;
        let dir = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta::new(&saved.config, "sft", 3, 1.25);
        save_pretrained(dir.path(), &saved.varmap, &saved.tokenizer, &meta)?;

        for file in [WEIGHTS_FILE, CONFIG_FILE, "tokenizer.json", "tokenizer_config.json"] {
            assert!(dir.path().join(file).is_file(), "missing {}", file);
        }

        let loaded = from_pretrained(dir.path().to_str().unwrap(), &device)?;
        let loaded_meta = loaded.meta.as_ref().unwrap();
        assert_eq!(loaded_meta.stage, "sft");
        assert_eq!(loaded_meta.step, 3);

        let ids = Tensor::new(&[[10u32, 20, 30, 40]], &device)?;
        let a = saved.model.forward(&ids)?;
        let b = loaded.model.forward(&ids)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "logits differ by {}", diff);
        Ok(())
    }

    #[test]
    fn test_incomplete_dir_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = from_pretrained(dir.path().to_str().unwrap(), &Device::Cpu);
        assert!(matches!(result, Err(AlignError::CheckpointLoadFailed { .. })));
    }

    #[test]
    fn test_cleanup_keeps_newest() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        for step in [1, 2, 10] {
            fs::create_dir_all(dir.path().join(format!("step_{}", step))).unwrap();
        }
        fs::create_dir_all(dir.path().join("runs")).unwrap();

        let removed = cleanup_old_checkpoints(dir.path(), 1)?;
        assert_eq!(removed, 2);
        let left = list_step_checkpoints(dir.path())?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].1, 10);
        assert!(dir.path().join("runs").exists());
        Ok(())
    }

    #[test]
    fn test_cleanup_missing_dir_is_noop() -> Result<()> {
        assert_eq!(cleanup_old_checkpoints(Path::new("/nonexistent/ckpts"), 1)?, 0);
        Ok(())
    }
}
