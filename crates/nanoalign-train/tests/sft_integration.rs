//! Fine-tune a preset, save it, reload it, and keep going.

use candle_core::{Device, Tensor};
use nanoalign_core::SftConfig;
use nanoalign_train::checkpoint::{from_pretrained, save_pretrained, CheckpointMeta};
use nanoalign_train::data::{Dataset, InstructionDataset, TokenizedDataset};
use nanoalign_train::sft::SftTrainer;

fn demo_rows() -> InstructionDataset {
    InstructionDataset::from_columns(
        vec![
            "Predict the following English: 'Hello, how are'".into(),
            "Complete: 'Good'".into(),
            "Complete: 'Thank'".into(),
        ],
        vec!["you'".into(), " morning".into(), " you".into()],
    )
    .expect("columns match")
}

#[test]
fn test_sft_loss_decreases_over_epochs() {
    let device = Device::Cpu;
    let out_dir = tempfile::tempdir().unwrap();
    let pm = from_pretrained("tiny", &device).unwrap();
    let data = TokenizedDataset::map(&demo_rows(), &pm.tokenizer, 64).unwrap();

    let config = SftConfig {
        output_dir: out_dir.path().display().to_string(),
        learning_rate: 3e-3,
        num_train_epochs: 8,
        ..Default::default()
    };
    let mut trainer = SftTrainer::new(pm.model, pm.varmap, config, device, 7).unwrap();
    let output = trainer.train(&data, None, &pm.tokenizer).unwrap();

    let first = output.epoch_losses[0];
    let last = *output.epoch_losses.last().unwrap();
    assert!(last < first, "epoch loss {} -> {}", first, last);
    assert_eq!(output.global_step, 8 * 2);
    assert_eq!(output.checkpoints.len(), 1);
}

#[test]
fn test_fine_tuned_checkpoint_roundtrip() {
    let device = Device::Cpu;
    let out_dir = tempfile::tempdir().unwrap();
    let save_dir = tempfile::tempdir().unwrap();

    let pm = from_pretrained("tiny", &device).unwrap();
    let data = TokenizedDataset::map(&InstructionDataset::demo(), &pm.tokenizer, 32).unwrap();
    let config = SftConfig {
        output_dir: out_dir.path().display().to_string(),
        num_train_epochs: 1,
        ..Default::default()
    };
    let mut trainer =
        SftTrainer::new(pm.model, pm.varmap, config.clone(), device.clone(), 0).unwrap();
    let output = trainer.train(&data, None, &pm.tokenizer).unwrap();

    let meta = CheckpointMeta::new(
        &trainer.model.config,
        "sft",
        output.global_step,
        output.train_loss,
    );
    save_pretrained(save_dir.path(), &trainer.varmap, &pm.tokenizer, &meta).unwrap();

    let reloaded = from_pretrained(save_dir.path().to_str().unwrap(), &device).unwrap();
    let ex = data.get_item(0);
    let ids = Tensor::new(ex.input_ids.as_slice(), &device).unwrap().unsqueeze(0).unwrap();
    let a = trainer.model.forward(&ids).unwrap();
    let b = reloaded.model.forward(&ids).unwrap();
    let diff = (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-6);

    // Reloaded weights plug straight back into a trainer.
    let resumed =
        SftTrainer::new(reloaded.model, reloaded.varmap, config, device, 1).unwrap();
    let stats = resumed.evaluate(&data).unwrap();
    assert!(stats.loss.is_finite());
}
