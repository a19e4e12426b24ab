//! Command-line driver for the alignment pipeline.
//!
//! Provides subcommands:
//! - run: every stage, base model to adversarial test cases
//! - sft / ppo: a single training stage
//! - eval / adversarial: probe a saved model
//! - init-config: write the default TOML config

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use colored::Colorize;
use nanoalign_cli::{Pipeline, PipelineSummary};
use nanoalign_core::{AlignError, PipelineConfig};
use nanoalign_eval::SuiteKind;
use nanoalign_train::logging::{init_console_logging, init_logging};

#[derive(Parser)]
#[command(name = "nanoalign")]
#[command(about = "Supervised fine-tuning and RLHF for small causal language models", long_about = None)]
#[command(version)]
struct Cli {
    /// Pipeline config (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override model.device (cpu, cuda, cuda:N, metal)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Override model.name (checkpoint directory or preset)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Emit structured JSON logs instead of console output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage in order
    Run {
        /// Also write the summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Supervised fine-tuning only
    Sft,

    /// Reward head + PPO from the fine-tuned checkpoint
    Ppo,

    /// Evaluation prompts against a saved model
    Eval {
        /// Model directory (defaults to output.final_dir)
        #[arg(long)]
        model_dir: Option<String>,
    },

    /// Adversarial test cases against a saved model
    Adversarial {
        /// Model directory (defaults to output.final_dir)
        #[arg(long)]
        model_dir: Option<String>,
    },

    /// Write the default configuration
    InitConfig {
        #[arg(short, long, default_value = "nanoalign.toml")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let result = run(cli);
    if let Err(err) = &result {
        print_hint(err);
    }
    result
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::InitConfig { output } = &cli.command {
        return init_config(output);
    }

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(device) = cli.device {
        config.model.device = device;
    }
    if let Some(model) = cli.model {
        config.model.name = model;
    }

    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    if cli.json_logs {
        init_logging(&level);
    } else {
        init_console_logging(&level);
    }

    let pipeline = Pipeline::new(config)?;
    let start = Instant::now();

    match cli.command {
        Commands::Run { summary } => {
            banner("Full pipeline");
            let result = pipeline.run()?;
            print_summary(&result);
            if let Some(path) = summary {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                println!("{} Summary written to {}", "✓".green(), path.display());
            }
        }
        Commands::Sft => {
            banner("Supervised fine-tuning");
            let sft = pipeline.sft()?;
            println!(
                "{} {} steps, loss {:.4} -> {}",
                "✓".green(),
                sft.global_step,
                sft.train_loss,
                sft.output_dir
            );
        }
        Commands::Ppo => {
            banner("Reward model + PPO");
            let ppo = pipeline.ppo()?;
            if let Some(last) = ppo.iterations.last() {
                println!(
                    "{} {} iterations, mean score {:.4}, KL {:.4} -> {}",
                    "✓".green(),
                    ppo.iterations.len(),
                    last.mean_score,
                    last.mean_kl,
                    ppo.output_dir
                );
            }
        }
        Commands::Eval { model_dir } => {
            banner("Evaluation");
            let dir = model_dir.unwrap_or_else(|| pipeline.config().output.final_dir.clone());
            pipeline.evaluate(SuiteKind::Evaluation, &dir)?;
        }
        Commands::Adversarial { model_dir } => {
            banner("Adversarial testing");
            let dir = model_dir.unwrap_or_else(|| pipeline.config().output.final_dir.clone());
            pipeline.evaluate(SuiteKind::Adversarial, &dir)?;
        }
        Commands::InitConfig { .. } => {}
    }

    println!(
        "{}",
        format!("Done in {:.1}s", start.elapsed().as_secs_f32()).dimmed()
    );
    Ok(())
}

/// One-line advice for pipeline errors that have a known remedy.
fn print_hint(err: &anyhow::Error) {
    let Some(align) = err.chain().find_map(|e| e.downcast_ref::<AlignError>()) else {
        return;
    };
    if align.should_stop_training() {
        eprintln!(
            "{} training diverged; try a lower learning rate or max_grad_norm",
            "hint:".yellow()
        );
    } else if align.is_recoverable() {
        let at = align.path().map(|p| format!(" ({})", p)).unwrap_or_default();
        eprintln!("{} filesystem error{}; the run can be retried", "hint:".yellow(), at);
    }
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    PipelineConfig::default().save(output)?;
    println!("{} Wrote {}", "✓".green(), output.display());
    Ok(())
}

fn banner(title: &str) {
    println!("{}", "═══════════════════════════════════════════════".cyan());
    println!("  {}", title.bold());
    println!("{}", "═══════════════════════════════════════════════".cyan());
}

fn print_summary(summary: &PipelineSummary) {
    println!();
    println!("{}", "Summary".bold().cyan());
    println!(
        "  {} {} steps, train loss {:.4}",
        "SFT:".cyan(),
        summary.sft.global_step,
        summary.sft.train_loss
    );
    if let Some(reward) = &summary.ppo.reward {
        println!(
            "  {} loss {:.4}, pairwise accuracy {:.2}",
            "Reward:".cyan(),
            reward.loss,
            reward.accuracy
        );
    }
    if let Some(last) = summary.ppo.iterations.last() {
        println!(
            "  {} {} iterations, mean score {:.4}, KL {:.4}, kl_coef {:.4}",
            "PPO:".cyan(),
            summary.ppo.iterations.len(),
            last.mean_score,
            last.mean_kl,
            last.kl_coef
        );
    }
}
