//! Structured logging with tracing.
//!
//! Two subscriber flavours: JSON lines for unattended runs and compact console
//! output for interactive ones. Both write to stderr, leaving stdout to the
//! printed responses, and both honour `RUST_LOG`.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Gradient norm above which a step is flagged.
pub const GRAD_NORM_WARN: f64 = 10.0;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "warn,nanoalign_core={lvl},nanoalign_train={lvl},nanoalign_rl={lvl},nanoalign_eval={lvl},nanoalign_cli={lvl}",
            lvl = default_level
        )
        .into()
    })
}

/// JSON-formatted logs on stderr. A second call is a no-op.
pub fn init_logging(default_level: &str) {
    let installed = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok();
    if installed {
        info!("Structured logging initialized");
    }
}

/// Human-readable console logs on stderr. A second call is a no-op.
pub fn init_console_logging(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Per-step training metrics.
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub learning_rate: f64,
    /// L2 norm before clipping.
    pub grad_norm: f64,
    pub tokens_per_sec: f64,
}

impl TrainingMetrics {
    pub fn new(loss: f64, learning_rate: f64, grad_norm: f64, tokens_per_sec: f64) -> Self {
        Self {
            loss,
            learning_rate,
            grad_norm,
            tokens_per_sec,
        }
    }
}

/// Log one optimizer step for `stage` (e.g. "sft", "reward").
pub fn log_training_step(stage: &str, step: usize, metrics: &TrainingMetrics) {
    let span = span!(Level::INFO, "training_step", stage = stage, step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        log_divergence(stage, step, metrics.loss);
        return;
    }

    info!(
        loss = metrics.loss,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        tokens_per_sec = metrics.tokens_per_sec,
        "Training step completed"
    );

    if metrics.grad_norm > GRAD_NORM_WARN {
        warn!(
            grad_norm = metrics.grad_norm,
            threshold = GRAD_NORM_WARN,
            "High gradient norm detected - consider a lower learning rate"
        );
    }

    debug!(loss = format!("{:.6}", metrics.loss), "Training diagnostics");
}

pub fn log_divergence(stage: &str, step: usize, loss: f64) {
    error!(
        stage = stage,
        step = step,
        loss = loss,
        event = "divergence",
        "Training diverged! NaN or infinite loss detected"
    );
}

pub fn log_checkpoint_save(step: usize, path: &str, loss: f64) {
    info!(
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved"
    );
}

pub fn log_evaluation(epoch: usize, eval_loss: f64, eval_ppl: f64) {
    info!(
        epoch = epoch,
        eval_loss = eval_loss,
        eval_perplexity = eval_ppl,
        event = "evaluation",
        "Evaluation completed"
    );
}
