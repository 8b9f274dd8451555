//! Token selection.
//!
//! A [`Sampler`] turns the logits of the last decoded position into a token id.
//! Greedy and stochastic sampling are the same type with different
//! [`SamplerParams`], so the session never needs to know which one is active.
//!
//! The pipeline runs in a fixed order:
//! penalties, then (greedy: argmax) top-k, temperature softmax, top-p, min-p and
//! finally a weighted draw from a seeded RNG.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::TokenId;
use crate::error::{Error, Result};

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    /// Softmax temperature, `<= 0` selects greedy sampling
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens (0 disables)
    pub top_k: usize,
    /// Keep the smallest set of tokens whose probability mass reaches `top_p` (1.0 disables)
    pub top_p: f32,
    /// Drop tokens less likely than `min_p` times the most likely one (0 disables)
    pub min_p: f32,
    /// Penalty for tokens seen in the last `repeat_last_n` tokens (1.0 disables)
    pub repeat_penalty: f32,
    /// Size of the penalty window
    pub repeat_last_n: usize,
    /// Subtracted once per occurrence inside the penalty window
    pub frequency_penalty: f32,
    /// Subtracted once for any token present in the penalty window
    pub presence_penalty: f32,
    /// RNG seed (default: 1234)
    pub seed: u64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: 1234,
        }
    }
}

impl SamplerParams {
    /// Always pick the most likely token.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    fn penalties_enabled(&self) -> bool {
        (self.repeat_penalty - 1.0).abs() > f32::EPSILON
            || self.frequency_penalty != 0.0
            || self.presence_penalty != 0.0
    }
}

/// A stateful token selection policy.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplerParams,
    history: VecDeque<TokenId>,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplerParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            history: VecDeque::new(),
            rng,
        }
    }

    pub fn greedy() -> Self {
        Self::new(SamplerParams::greedy())
    }

    pub fn params(&self) -> &SamplerParams {
        &self.params
    }

    /// Tokens accepted so far, oldest first, limited to the penalty window.
    pub fn history(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.history.iter().copied()
    }

    /// Choose the next token from one row of logits.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId> {
        if logits.is_empty() {
            return Err(Error::Sampling("empty logits".into()));
        }

        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| (id as TokenId, logit))
            .collect();
        self.apply_penalties(&mut candidates);
        candidates.retain(|(_, logit)| !logit.is_nan() && *logit != f32::NEG_INFINITY);

        if candidates.is_empty() {
            return Err(Error::Sampling("no finite logits to sample from".into()));
        }

        // an infinite logit takes all the mass, lowest id first
        if let Some(&(token, _)) = candidates.iter().find(|(_, logit)| *logit == f32::INFINITY) {
            return Ok(token);
        }

        if self.params.is_greedy() {
            return Ok(argmax(&candidates));
        }

        // most likely first, lower ids first among equals
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if self.params.top_k > 0 {
            candidates.truncate(self.params.top_k);
        }

        let mut probs = softmax(&candidates, self.params.temperature);

        if self.params.top_p < 1.0 {
            let mut mass = 0.0;
            let keep = probs
                .iter()
                .position(|&p| {
                    mass += p;
                    mass >= self.params.top_p
                })
                .map_or(probs.len(), |i| i + 1);
            probs.truncate(keep);
        }

        if self.params.min_p > 0.0 {
            let threshold = probs[0] * self.params.min_p;
            let keep = probs.iter().take_while(|&&p| p >= threshold).count();
            probs.truncate(keep.max(1));
        }

        let total: f32 = probs.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(Error::Sampling(format!(
                "invalid probability mass {}",
                total
            )));
        }
        let mut draw = self.rng.r#gen::<f32>() * total;
        for (i, p) in probs.iter().enumerate() {
            draw -= p;
            if draw <= 0.0 {
                return Ok(candidates[i].0);
            }
        }
        Ok(candidates[probs.len() - 1].0)
    }

    /// Record a token that became part of the output.
    pub fn accept(&mut self, token: TokenId) {
        if self.params.repeat_last_n == 0 {
            return;
        }
        if self.history.len() == self.params.repeat_last_n {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Forget all history and restart the RNG from the seed.
    pub fn reset(&mut self) {
        self.history.clear();
        self.rng = StdRng::seed_from_u64(self.params.seed);
    }

    fn apply_penalties(&self, candidates: &mut [(TokenId, f32)]) {
        if !self.params.penalties_enabled() || self.history.is_empty() {
            return;
        }

        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &token in &self.history {
            *counts.entry(token).or_insert(0) += 1;
        }

        for (token, count) in counts {
            let Ok(index) = usize::try_from(token) else {
                continue;
            };
            let Some((_, logit)) = candidates.get_mut(index) else {
                continue;
            };
            *logit = if *logit > 0.0 {
                *logit / self.params.repeat_penalty
            } else {
                *logit * self.params.repeat_penalty
            };
            *logit -= self.params.frequency_penalty * count as f32 + self.params.presence_penalty;
        }
    }
}

fn argmax(candidates: &[(TokenId, f32)]) -> TokenId {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.1 > best.1 {
            best = candidate;
        }
    }
    best.0
}

fn softmax(candidates: &[(TokenId, f32)], temperature: f32) -> Vec<f32> {
    let max = candidates[0].1;
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|(_, logit)| ((logit - max) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&[0.1, 3.0, -1.0, 2.9]).unwrap(), 1);
    }

    #[test]
    fn greedy_ties_resolve_to_lowest_id() {
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&[1.0, 5.0, 5.0]).unwrap(), 1);
    }

    #[test]
    fn empty_or_masked_logits_fail() {
        let mut sampler = Sampler::greedy();
        assert!(matches!(sampler.sample(&[]), Err(Error::Sampling(_))));
        assert!(matches!(
            sampler.sample(&[f32::NAN, f32::NEG_INFINITY]),
            Err(Error::Sampling(_))
        ));
    }

    #[test]
    fn masked_tokens_are_never_chosen() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            ..Default::default()
        });
        for _ in 0..50 {
            let token = sampler.sample(&[f32::NEG_INFINITY, 0.0, 0.0]).unwrap();
            assert_ne!(token, 0);
        }
    }

    #[test]
    fn top_k_one_is_deterministic() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 2.0,
            top_k: 1,
            ..Default::default()
        });
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.5, 0.4, 0.7, 0.1]).unwrap(), 2);
        }
    }

    #[test]
    fn same_seed_same_tokens_after_reset() {
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 1.5,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            seed: 7,
            ..Default::default()
        });

        let first: Vec<_> = (0..16).map(|_| sampler.sample(&logits).unwrap()).collect();
        sampler.reset();
        let second: Vec<_> = (0..16).map(|_| sampler.sample(&logits).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn repeat_penalty_steers_away_from_history() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            repeat_penalty: 2.0,
            ..Default::default()
        });
        let logits = [0.0, 3.0, 2.0];
        assert_eq!(sampler.sample(&logits).unwrap(), 1);

        sampler.accept(1);
        // 3.0 / 2.0 = 1.5 < 2.0
        assert_eq!(sampler.sample(&logits).unwrap(), 2);

        sampler.reset();
        assert_eq!(sampler.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn frequency_penalty_scales_with_count() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            frequency_penalty: 0.4,
            ..Default::default()
        });
        let logits = [0.0, 3.0, 2.5];
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits).unwrap(), 1);
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits).unwrap(), 2);
    }

    #[test]
    fn history_is_bounded_by_window() {
        let mut sampler = Sampler::new(SamplerParams {
            repeat_last_n: 3,
            ..Default::default()
        });
        for token in 0..5 {
            sampler.accept(token);
        }
        assert_eq!(sampler.history().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn top_p_keeps_the_dominant_token() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.5,
            min_p: 0.0,
            ..Default::default()
        });
        for _ in 0..20 {
            assert_eq!(sampler.sample(&[0.0, 10.0, 0.0, 0.0]).unwrap(), 1);
        }
    }

    #[test]
    fn infinite_logit_always_wins() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            ..Default::default()
        });
        for _ in 0..5 {
            assert_eq!(sampler.sample(&[f32::INFINITY, 0.0, -1.0]).unwrap(), 0);
        }
        assert_eq!(
            sampler.sample(&[0.0, f32::INFINITY, f32::INFINITY]).unwrap(),
            1
        );

        let mut greedy = Sampler::greedy();
        assert_eq!(greedy.sample(&[0.0, 1.0, f32::INFINITY]).unwrap(), 2);
    }

    #[test]
    fn min_p_drops_unlikely_tokens() {
        // probabilities are roughly 0.57, 0.35 and 0.08
        let logits = [2.0, 1.5, 0.0];
        let params = SamplerParams {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.5,
            ..Default::default()
        };

        let mut sampler = Sampler::new(params.clone());
        let picks: Vec<_> = (0..200).map(|_| sampler.sample(&logits).unwrap()).collect();
        assert!(!picks.contains(&2));
        assert!(picks.contains(&0));
        assert!(picks.contains(&1));

        let mut sampler = Sampler::new(SamplerParams {
            min_p: 0.9,
            ..params
        });
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits).unwrap(), 0);
        }
    }

    #[test]
    fn presence_penalty_is_flat_per_token() {
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            presence_penalty: 1.0,
            ..Default::default()
        });
        // 3.0 - 1.0 = 2.0 > 1.5, however often token 1 occurred
        let logits = [0.0, 3.0, 1.5];
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits).unwrap(), 1);
        sampler.accept(1);
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits).unwrap(), 1);

        // a penalty that outweighs the gap moves the pick
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            presence_penalty: 2.0,
            ..Default::default()
        });
        sampler.accept(1);
        assert_eq!(sampler.sample(&logits).unwrap(), 2);
    }
}
