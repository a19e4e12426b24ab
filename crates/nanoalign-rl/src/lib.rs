//! nanoalign-rl: preference reward modeling and PPO
//!
//! ## Architecture
//!
//! 1. **Reward model**: a frozen language-model backbone with a scalar head,
//!    read at the last real token of each sequence
//! 2. **Reward head training**: Bradley-Terry loss on chosen/rejected pairs
//! 3. **PPO**: sampled rollouts, per-token KL penalty toward a frozen
//!    reference, GAE, clipped policy and value losses, adaptive KL coefficient
//! 4. **Metrics log**: one JSON line or CSV row per PPO iteration

pub mod metrics;
pub mod ppo;
pub mod reward;
pub mod trainer;

pub use metrics::MetricsLogger;
pub use ppo::{compute_gae, whiten, KlController, PpoBatch, PpoStats, Rollout};
pub use reward::{RewardModel, RewardTrainStats, RewardTrainer};
pub use trainer::PpoTrainer;
