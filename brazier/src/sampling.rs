//! Sampling configuration: batch form with per-slot extraction.
//!
//! Every knob is either absent (the decoder uses its default) or a vector
//! with one-or-many semantics: a length-1 vector broadcasts to every slot,
//! otherwise the slot indexes it directly. Beam-search diversity rate and
//! length penalty are always batch-wide.

use serde::{Deserialize, Serialize};

/// Per-request sampling knobs in batch form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of beams; 1 selects top-k/top-p sampling, >1 beam search.
    pub beam_width: usize,
    pub temperature: Option<Vec<f32>>,
    pub repetition_penalty: Option<Vec<f32>>,
    pub presence_penalty: Option<Vec<f32>>,
    /// Steps during which the end token is masked out.
    pub min_length: Option<Vec<usize>>,
    /// 0 means no top-k truncation.
    pub top_k: Option<Vec<usize>>,
    pub top_p: Option<Vec<f32>>,
    pub top_p_decay: Option<Vec<f32>>,
    pub top_p_min: Option<Vec<f32>>,
    /// Sampling this token restores top-p to its initial value.
    pub top_p_reset_ids: Option<Vec<i32>>,
    pub random_seed: Option<Vec<u64>>,
    /// Batch-wide; beam search only.
    pub beam_search_diversity_rate: Option<f32>,
    /// Batch-wide; beam search only.
    pub length_penalty: Option<f32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

fn extract_optional<T: Copy>(batch: &Option<Vec<T>>, batch_idx: usize) -> Option<Vec<T>> {
    batch.as_ref().map(|v| {
        let idx = if v.len() > 1 { batch_idx } else { 0 };
        vec![v[idx]]
    })
}

impl SamplingConfig {
    /// Config with the given beam width and every knob absent.
    #[must_use]
    pub fn new(beam_width: usize) -> Self {
        Self {
            beam_width,
            temperature: None,
            repetition_penalty: None,
            presence_penalty: None,
            min_length: None,
            top_k: None,
            top_p: None,
            top_p_decay: None,
            top_p_min: None,
            top_p_reset_ids: None,
            random_seed: None,
            beam_search_diversity_rate: None,
            length_penalty: None,
        }
    }

    /// Extract the slot-local config for `batch_idx` by broadcast-of-1.
    /// Absent knobs remain absent; batch-wide knobs pass through.
    #[must_use]
    pub fn extract(&self, batch_idx: usize) -> Self {
        Self {
            beam_width: self.beam_width,
            temperature: extract_optional(&self.temperature, batch_idx),
            repetition_penalty: extract_optional(&self.repetition_penalty, batch_idx),
            presence_penalty: extract_optional(&self.presence_penalty, batch_idx),
            min_length: extract_optional(&self.min_length, batch_idx),
            top_k: extract_optional(&self.top_k, batch_idx),
            top_p: extract_optional(&self.top_p, batch_idx),
            top_p_decay: extract_optional(&self.top_p_decay, batch_idx),
            top_p_min: extract_optional(&self.top_p_min, batch_idx),
            top_p_reset_ids: extract_optional(&self.top_p_reset_ids, batch_idx),
            random_seed: extract_optional(&self.random_seed, batch_idx),
            beam_search_diversity_rate: self.beam_search_diversity_rate,
            length_penalty: self.length_penalty,
        }
    }

    fn first<T: Copy>(knob: &Option<Vec<T>>, default: T) -> T {
        knob.as_ref().and_then(|v| v.first().copied()).unwrap_or(default)
    }

    /// Effective temperature (default 1.0).
    #[must_use]
    pub fn temperature_value(&self) -> f32 {
        Self::first(&self.temperature, 1.0)
    }

    /// Effective repetition penalty (default 1.0, disabled).
    #[must_use]
    pub fn repetition_penalty_value(&self) -> f32 {
        Self::first(&self.repetition_penalty, 1.0)
    }

    /// Effective presence penalty (default 0.0, disabled).
    #[must_use]
    pub fn presence_penalty_value(&self) -> f32 {
        Self::first(&self.presence_penalty, 0.0)
    }

    /// Effective minimum generation length (default 0).
    #[must_use]
    pub fn min_length_value(&self) -> usize {
        Self::first(&self.min_length, 0)
    }

    /// Effective top-k (default 0: no truncation).
    #[must_use]
    pub fn top_k_value(&self) -> usize {
        Self::first(&self.top_k, 0)
    }

    /// Effective top-p (default 1.0: full distribution).
    #[must_use]
    pub fn top_p_value(&self) -> f32 {
        Self::first(&self.top_p, 1.0)
    }

    /// Effective top-p decay factor (default 1.0: no decay).
    #[must_use]
    pub fn top_p_decay_value(&self) -> f32 {
        Self::first(&self.top_p_decay, 1.0)
    }

    /// Effective top-p floor (default 1e-6).
    #[must_use]
    pub fn top_p_min_value(&self) -> f32 {
        Self::first(&self.top_p_min, 1.0e-6)
    }

    /// Effective top-p reset token (default -1: never).
    #[must_use]
    pub fn top_p_reset_id_value(&self) -> i32 {
        Self::first(&self.top_p_reset_ids, -1)
    }

    /// Effective RNG seed (default 0).
    #[must_use]
    pub fn random_seed_value(&self) -> u64 {
        Self::first(&self.random_seed, 0)
    }

    /// Effective diversity rate (default 0.0, disabled).
    #[must_use]
    pub fn diversity_rate_value(&self) -> f32 {
        self.beam_search_diversity_rate.unwrap_or(0.0)
    }

    /// Effective length penalty (default 0.0: no normalisation).
    #[must_use]
    pub fn length_penalty_value(&self) -> f32 {
        self.length_penalty.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_broadcasts_length_one() {
        let mut config = SamplingConfig::new(1);
        config.temperature = Some(vec![0.7]);
        config.top_k = Some(vec![1, 2, 3, 4]);

        let slot2 = config.extract(2);
        assert_eq!(slot2.temperature, Some(vec![0.7])); // broadcast
        assert_eq!(slot2.top_k, Some(vec![3])); // indexed
        assert_eq!(slot2.beam_width, 1);
    }

    #[test]
    fn extract_keeps_absent_knobs_absent() {
        let config = SamplingConfig::new(2);
        let slot = config.extract(0);
        assert!(slot.temperature.is_none());
        assert!(slot.random_seed.is_none());
        assert_eq!(slot.temperature_value(), 1.0);
        assert_eq!(slot.top_p_value(), 1.0);
    }

    #[test]
    fn batch_wide_knobs_pass_through() {
        let mut config = SamplingConfig::new(4);
        config.beam_search_diversity_rate = Some(0.3);
        config.length_penalty = Some(1.0);

        let slot = config.extract(3);
        assert_eq!(slot.diversity_rate_value(), 0.3);
        assert_eq!(slot.length_penalty_value(), 1.0);
    }

    #[test]
    fn seed_defaults_to_zero() {
        let config = SamplingConfig::new(1);
        assert_eq!(config.random_seed_value(), 0);

        let mut config = SamplingConfig::new(1);
        config.random_seed = Some(vec![7, 8]);
        assert_eq!(config.extract(1).random_seed_value(), 8);
    }
}
