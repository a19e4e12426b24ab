//! PPO building blocks
//!
//! Per-token rewards with a KL penalty toward a frozen reference policy,
//! generalized advantage estimation, clipped surrogate losses, and the KL
//! coefficient controller.
//!
//! Algorithm, per iteration:
//! 1. Sample a response per prompt from the current policy
//! 2. Score each full sequence with the reward model
//! 3. reward_t = -beta * (logp_t - ref_logp_t), plus the score on the last token
//! 4. GAE over the response tokens, then whiten advantages across the batch
//! 5. Several epochs of clipped policy + value updates on minibatches
//! 6. Adapt beta toward the target KL

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// Generalized advantage estimation over one response.
///
/// `values[t]` is the value of the state before token t; the value after the
/// last token is 0. Returns `(advantages, returns)` with `returns = advantages + values`.
pub fn compute_gae(rewards: &[f64], values: &[f64], gamma: f64, lam: f64) -> (Vec<f64>, Vec<f64>) {
    let n = rewards.len().min(values.len());
    let mut advantages = vec![0.0; n];
    let mut last_gae = 0.0;
    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] } else { 0.0 };
        let delta = rewards[t] + gamma * next_value - values[t];
        last_gae = delta + gamma * lam * last_gae;
        advantages[t] = last_gae;
    }
    let returns = advantages.iter().zip(values).map(|(a, v)| a + v).collect();
    (advantages, returns)
}

/// Standardize to unit variance; keep the mean when `shift_mean` is false.
pub fn whiten(values: &[f64], shift_mean: bool) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let inv_std = 1.0 / (var + 1e-8).sqrt();
    values
        .iter()
        .map(|v| {
            let w = (v - mean) * inv_std;
            if shift_mean {
                w
            } else {
                w + mean
            }
        })
        .collect()
}

/// KL-penalized per-token rewards with the sequence score added on the last token.
pub fn token_rewards(
    score: f64,
    logprobs: &[f64],
    ref_logprobs: &[f64],
    kl_coef: f64,
    score_clip: Option<f64>,
) -> Vec<f64> {
    let score = match score_clip {
        Some(c) => score.clamp(-c, c),
        None => score,
    };
    let mut rewards: Vec<f64> = logprobs
        .iter()
        .zip(ref_logprobs)
        .map(|(lp, rlp)| -kl_coef * (lp - rlp))
        .collect();
    if let Some(last) = rewards.last_mut() {
        *last += score;
    }
    rewards
}

/// KL penalty coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KlController {
    Fixed(f64),
    /// Proportional controller: err = clip(kl / target - 1, ±0.2),
    /// value *= 1 + err * n_steps / horizon.
    Adaptive { value: f64, target: f64, horizon: f64 },
}

impl KlController {
    pub fn new(init_kl_coef: f64, adaptive: bool, target: f64, horizon: f64) -> Self {
        if adaptive {
            KlController::Adaptive {
                value: init_kl_coef,
                target,
                horizon,
            }
        } else {
            KlController::Fixed(init_kl_coef)
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            KlController::Fixed(v) => *v,
            KlController::Adaptive { value, .. } => *value,
        }
    }

    pub fn update(&mut self, current_kl: f64, n_steps: usize) {
        if let KlController::Adaptive {
            value,
            target,
            horizon,
        } = self
        {
            let proportional_error = (current_kl / *target - 1.0).clamp(-0.2, 0.2);
            let mult = 1.0 + proportional_error * n_steps as f64 / *horizon;
            *value *= mult;
        }
    }
}

/// Clipped surrogate objective, as a loss to minimize.
///
/// All inputs have the same shape. Returns `(loss, clip_fraction)`.
pub fn clipped_policy_loss(
    logprobs: &Tensor,
    old_logprobs: &Tensor,
    advantages: &Tensor,
    clip_range: f64,
) -> Result<(Tensor, f64)> {
    let ratio = (logprobs - old_logprobs)?.exp()?;
    let unclipped = (advantages.neg()? * &ratio)?;
    let clipped_ratio = ratio.clamp(1.0 - clip_range, 1.0 + clip_range)?;
    let clipped = (advantages.neg()? * clipped_ratio)?;
    let loss = unclipped.maximum(&clipped)?.mean_all()?;

    let clip_frac = clipped
        .gt(&unclipped)?
        .to_dtype(candle_core::DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()? as f64;
    Ok((loss, clip_frac))
}

/// Value loss with the new prediction clipped around the rollout value.
pub fn clipped_value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    clip_range_value: f64,
) -> Result<Tensor> {
    let delta = (values - old_values)?.clamp(-clip_range_value, clip_range_value)?;
    let values_clipped = (old_values + delta)?;
    let loss_unclipped = (values - returns)?.sqr()?;
    let loss_clipped = (values_clipped - returns)?.sqr()?;
    loss_unclipped.maximum(&loss_clipped)?.mean_all()? * 0.5
}

/// One sampled response with everything the update phase needs.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub prompt: String,
    pub response: String,
    /// Prompt + response ids.
    pub full_tokens: Vec<u32>,
    pub prompt_len: usize,
    pub score: f64,
    /// Per response token, under the policy at sampling time.
    pub logprobs: Vec<f64>,
    pub ref_logprobs: Vec<f64>,
    pub values: Vec<f64>,
    pub rewards: Vec<f64>,
    pub advantages: Vec<f64>,
    pub returns: Vec<f64>,
}

impl Rollout {
    pub fn response_len(&self) -> usize {
        self.full_tokens.len() - self.prompt_len
    }

    /// Sum over response tokens of logp - ref_logp.
    pub fn kl(&self) -> f64 {
        self.logprobs
            .iter()
            .zip(&self.ref_logprobs)
            .map(|(a, b)| a - b)
            .sum()
    }
}

/// Rollouts collected in one iteration.
#[derive(Debug, Clone, Default)]
pub struct PpoBatch {
    pub rollouts: Vec<Rollout>,
}

impl PpoBatch {
    pub fn len(&self) -> usize {
        self.rollouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rollouts.is_empty()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.rollouts.iter().map(|r| r.score).collect()
    }

    /// Compute rewards and GAE for every rollout, then whiten advantages batch-wide.
    pub fn finalize(
        &mut self,
        kl_coef: f64,
        gamma: f64,
        lam: f64,
        score_clip: Option<f64>,
        whiten_adv: bool,
    ) {
        for r in &mut self.rollouts {
            r.rewards = token_rewards(r.score, &r.logprobs, &r.ref_logprobs, kl_coef, score_clip);
            let (adv, ret) = compute_gae(&r.rewards, &r.values, gamma, lam);
            r.advantages = adv;
            r.returns = ret;
        }
        if !whiten_adv {
            return;
        }
        let flat: Vec<f64> = self
            .rollouts
            .iter()
            .flat_map(|r| r.advantages.iter().copied())
            .collect();
        let white = whiten(&flat, true);
        let mut offset = 0;
        for r in &mut self.rollouts {
            let n = r.advantages.len();
            r.advantages.copy_from_slice(&white[offset..offset + n]);
            offset += n;
        }
    }
}

/// Training statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PpoStats {
    pub iteration: usize,
    pub mean_score: f64,
    pub score_std: f64,
    /// Mean sequence KL to the reference policy at sampling time.
    pub mean_kl: f64,
    /// Coefficient used for this iteration's rewards.
    pub kl_coef: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub total_loss: f64,
    pub clip_frac: f64,
    pub grad_norm: f64,
    pub mean_response_len: f64,
    pub mean_return: f64,
    pub n_rollouts: usize,
}

impl PpoStats {
    pub const CSV_HEADER: &'static str = "iteration,mean_score,score_std,mean_kl,kl_coef,policy_loss,value_loss,total_loss,clip_frac,grad_norm,mean_response_len,mean_return,n_rollouts";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.4},{:.6},{:.2},{:.6},{}",
            self.iteration,
            self.mean_score,
            self.score_std,
            self.mean_kl,
            self.kl_coef,
            self.policy_loss,
            self.value_loss,
            self.total_loss,
            self.clip_frac,
            self.grad_norm,
            self.mean_response_len,
            self.mean_return,
            self.n_rollouts,
        )
    }
}

pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    #[test]
    fn test_gae_lambda_one_is_reward_to_go_minus_value() {
        let rewards = [0.5, -1.0, 2.0];
        let values = [0.1, 0.2, 0.3];
        let (adv, ret) = compute_gae(&rewards, &values, 1.0, 1.0);
        let to_go = [1.5, 1.0, 2.0];
        for t in 0..3 {
            assert!((adv[t] - (to_go[t] - values[t])).abs() < 1e-12);
            assert!((ret[t] - to_go[t]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gae_lambda_zero_is_td_error() {
        let (adv, _) = compute_gae(&[1.0, 1.0], &[0.5, 0.25], 0.9, 0.0);
        assert!((adv[0] - (1.0 + 0.9 * 0.25 - 0.5)).abs() < 1e-12);
        assert!((adv[1] - (1.0 - 0.25)).abs() < 1e-12);
    }

    #[test]
    fn test_token_rewards_place_score_last() {
        let r = token_rewards(3.0, &[-1.0, -2.0], &[-1.5, -2.0], 0.2, None);
        assert!((r[0] - (-0.2 * 0.5)).abs() < 1e-12);
        assert!((r[1] - 3.0).abs() < 1e-12);

        let clipped = token_rewards(10.0, &[0.0], &[0.0], 0.2, Some(1.0));
        assert_eq!(clipped, vec![1.0]);
    }

    #[test]
    fn test_fixed_kl_does_not_move() {
        let mut ctl = KlController::new(0.2, false, 6.0, 10000.0);
        ctl.update(100.0, 4);
        assert_eq!(ctl.value(), 0.2);
    }

    #[test]
    fn test_policy_loss_unclipped_at_ratio_one() -> Result<()> {
        let device = Device::Cpu;
        let lp = Tensor::new(&[-1.0f32, -2.0, -0.5], &device)?;
        let adv = Tensor::new(&[1.0f32, -0.5, 2.0], &device)?;
        let (loss, clip_frac) = clipped_policy_loss(&lp, &lp, &adv, 0.2)?;
        let expected = -(1.0 - 0.5 + 2.0) / 3.0;
        assert!((loss.to_scalar::<f32>()? as f64 - expected).abs() < 1e-6);
        assert_eq!(clip_frac, 0.0);
        Ok(())
    }

    #[test]
    fn test_policy_loss_clips_large_ratio() -> Result<()> {
        let device = Device::Cpu;
        let old = Tensor::new(&[-2.0f32], &device)?;
        let new = Tensor::new(&[-1.0f32], &device)?; // ratio e
        let adv = Tensor::new(&[1.0f32], &device)?;
        let (loss, clip_frac) = clipped_policy_loss(&new, &old, &adv, 0.2)?;
        assert!((loss.to_scalar::<f32>()? + 1.2).abs() < 1e-5);
        assert_eq!(clip_frac, 1.0);
        Ok(())
    }

    #[test]
    fn test_value_loss_takes_pessimistic_branch() -> Result<()> {
        let device = Device::Cpu;
        let old = Tensor::new(&[0.0f32], &device)?;
        let new = Tensor::new(&[1.0f32], &device)?;
        let ret = Tensor::new(&[1.0f32], &device)?;
        // clipped value 0.2 -> (0.2 - 1)^2 = 0.64 beats 0
        let loss = clipped_value_loss(&new, &old, &ret, 0.2)?.to_scalar::<f32>()?;
        assert!((loss - 0.32).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_batch_finalize_whitens_across_rollouts() {
        let rollout = |score: f64| Rollout {
            prompt: String::new(),
            response: String::new(),
            full_tokens: vec![1, 2, 3, 4],
            prompt_len: 2,
            score,
            logprobs: vec![-1.0, -1.0],
            ref_logprobs: vec![-1.0, -1.0],
            values: vec![0.0, 0.0],
            rewards: vec![],
            advantages: vec![],
            returns: vec![],
        };
        let mut batch = PpoBatch {
            rollouts: vec![rollout(1.0), rollout(-1.0)],
        };
        batch.finalize(0.2, 1.0, 0.95, None, true);
        let all: Vec<f64> = batch.rollouts.iter().flat_map(|r| r.advantages.clone()).collect();
        let (mean, std) = mean_std(&all);
        assert!(mean.abs() < 1e-9);
        assert!((std - 1.0).abs() < 1e-3);
        assert_eq!(batch.rollouts[0].response_len(), 2);
    }

    proptest! {
        #[test]
        fn prop_gae_returns_are_advantage_plus_value(
            pairs in prop::collection::vec((-5.0f64..5.0, -5.0f64..5.0), 1..20),
            gamma in 0.0f64..=1.0,
            lam in 0.0f64..=1.0,
        ) {
            let (rewards, values): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
            let (adv, ret) = compute_gae(&rewards, &values, gamma, lam);
            prop_assert_eq!(adv.len(), rewards.len());
            for t in 0..adv.len() {
                prop_assert!((ret[t] - (adv[t] + values[t])).abs() < 1e-9);
            }
        }

        #[test]
        fn prop_whitened_has_zero_mean(values in prop::collection::vec(-100.0f64..100.0, 2..50)) {
            let w = whiten(&values, true);
            let (mean, std) = mean_std(&w);
            prop_assert!(mean.abs() < 1e-6);
            prop_assert!(std <= 1.0 + 1e-6);
        }

        #[test]
        fn prop_whiten_keeps_mean_when_not_shifting(values in prop::collection::vec(-10.0f64..10.0, 2..30)) {
            let (m0, _) = mean_std(&values);
            let (m1, _) = mean_std(&whiten(&values, false));
            prop_assert!((m0 - m1).abs() < 1e-6);
        }

        #[test]
        fn prop_adaptive_kl_moves_toward_target(
            init in 0.01f64..1.0,
            target in 0.5f64..10.0,
            factor in 1.05f64..5.0,
            n_steps in 1usize..64,
        ) {
            let mut above = KlController::new(init, true, target, 100.0);
            above.update(target * factor, n_steps);
            prop_assert!(above.value() > init);

            let mut below = KlController::new(init, true, target, 100.0);
            below.update(target / factor, n_steps);
            prop_assert!(below.value() < init);

            let mut exact = KlController::new(init, true, target, 100.0);
            exact.update(target, n_steps);
            prop_assert!((exact.value() - init).abs() < 1e-12);
        }
    }
}
