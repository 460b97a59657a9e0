//! Token sampling strategies over a logits vector
//!
//! All functions are pure apart from the random source, so they are safe to
//! call from any number of threads. The plain variants draw from
//! `rand::thread_rng()`; the `_with` variants take the generator explicitly
//! for callers that need reproducible draws.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::InferenceParams;

/// Temperature-scaled softmax. Non-positive temperatures are treated as 1.0.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let temperature = if temperature > 0.0 { temperature } else { 1.0 };

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();

    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest logit; the first one wins ties.
pub fn sample_greedy(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = i;
        }
    }
    best
}

pub fn sample_top_k(logits: &[f32], k: usize, temperature: f32) -> usize {
    sample_top_k_with(&mut rand::thread_rng(), logits, k, temperature)
}

pub fn sample_top_k_with<R: Rng + ?Sized>(
    rng: &mut R,
    logits: &[f32],
    k: usize,
    temperature: f32,
) -> usize {
    if logits.is_empty() {
        return 0;
    }
    if temperature <= 0.0 || k <= 1 {
        return sample_greedy(logits);
    }

    let mut indices = sorted_indices(logits);
    indices.truncate(k);

    let kept: Vec<f32> = indices.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&kept, temperature);

    indices[sample_categorical(rng, &probs)]
}

pub fn sample_top_p(logits: &[f32], p: f32, temperature: f32) -> usize {
    sample_top_p_with(&mut rand::thread_rng(), logits, p, temperature)
}

pub fn sample_top_p_with<R: Rng + ?Sized>(
    rng: &mut R,
    logits: &[f32],
    p: f32,
    temperature: f32,
) -> usize {
    if logits.is_empty() {
        return 0;
    }
    if temperature <= 0.0 {
        return sample_greedy(logits);
    }

    let indices = sorted_indices(logits);
    let sorted: Vec<f32> = indices.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&sorted, temperature);

    // Smallest prefix whose mass reaches p; rounding may leave it at the full set.
    let mut cumulative = 0.0f32;
    let mut cutoff = probs.len();
    for (i, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            cutoff = i + 1;
            break;
        }
    }

    let nucleus = &probs[..cutoff];
    let mass: f32 = nucleus.iter().sum();
    let renormalized: Vec<f32> = nucleus.iter().map(|prob| prob / mass).collect();

    indices[sample_categorical(rng, &renormalized)]
}

/// Indices ordered by logit, descending
fn sorted_indices(logits: &[f32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    indices
}

fn sample_categorical<R: Rng + ?Sized>(rng: &mut R, probs: &[f32]) -> usize {
    let total: f32 = probs.iter().sum();
    let target = rng.gen::<f32>() * total;

    let mut cumulative = 0.0f32;
    for (i, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if target < cumulative {
            return i;
        }
    }
    // Rounding can leave target just past the final bucket.
    probs.iter().rposition(|&prob| prob > 0.0).unwrap_or(0)
}

/// A sampling strategy with its parameters bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SamplingStrategy {
    Greedy,
    TopK { k: usize, temperature: f32 },
    TopP { p: f32, temperature: f32 },
}

impl SamplingStrategy {
    /// Zero temperature means greedy; a restrictive top-p selects nucleus
    /// sampling; everything else samples from the top-k.
    pub fn from_params(params: &InferenceParams) -> Self {
        if params.temperature <= 0.0 {
            SamplingStrategy::Greedy
        } else if params.top_p < 1.0 {
            SamplingStrategy::TopP {
                p: params.top_p,
                temperature: params.temperature,
            }
        } else {
            SamplingStrategy::TopK {
                k: params.top_k,
                temperature: params.temperature,
            }
        }
    }

    pub fn sample(&self, logits: &[f32]) -> usize {
        self.sample_with(&mut rand::thread_rng(), logits)
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R, logits: &[f32]) -> usize {
        match *self {
            SamplingStrategy::Greedy => sample_greedy(logits),
            SamplingStrategy::TopK { k, temperature } => {
                sample_top_k_with(rng, logits, k, temperature)
            }
            SamplingStrategy::TopP { p, temperature } => {
                sample_top_p_with(rng, logits, p, temperature)
            }
        }
    }
}
