//! Next-token selection: temperature scaling followed by a nucleus cut.

use std::cmp::Ordering;

use rand::Rng;

use crate::{error::ServiceError, model::GenerationRequest};

/// Validated sampling parameters for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    /// `0.0` selects greedy argmax decoding.
    pub temperature: f64,
    pub top_p: f64,
}

impl SamplingParams {
    pub fn from_request(
        request: &GenerationRequest,
        max_new_tokens_limit: usize,
    ) -> Result<Self, ServiceError> {
        if request.max_new_tokens == 0 {
            return Err(ServiceError::InvalidSampling(
                "max_new_tokens must be at least 1".into(),
            ));
        }
        if request.max_new_tokens > max_new_tokens_limit {
            return Err(ServiceError::InvalidSampling(format!(
                "max_new_tokens {} exceeds the limit of {max_new_tokens_limit}",
                request.max_new_tokens
            )));
        }
        if !request.temperature.is_finite() || request.temperature < 0.0 {
            return Err(ServiceError::InvalidSampling(format!(
                "temperature must be a finite value >= 0, got {}",
                request.temperature
            )));
        }
        if !request.top_p.is_finite() || request.top_p <= 0.0 || request.top_p > 1.0 {
            return Err(ServiceError::InvalidSampling(format!(
                "top_p must be in (0, 1], got {}",
                request.top_p
            )));
        }

        Ok(Self {
            max_new_tokens: request.max_new_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        })
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

/// Picks the next token id from raw logits.
pub fn sample_next<R: Rng + ?Sized>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<u32, ServiceError> {
    if logits.iter().any(|l| l.is_nan()) {
        return Err(ServiceError::Inference("model produced NaN logits".into()));
    }
    if params.is_greedy() {
        return argmax(logits);
    }

    let probs = softmax(logits, params.temperature)?;
    let candidates = nucleus(&probs, params.top_p);

    let draw: f64 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0;
    for &(id, prob) in &candidates {
        cumulative += prob;
        if draw < cumulative {
            return Ok(id);
        }
    }
    // Rounding can leave the cumulative sum a hair below 1.0.
    candidates
        .last()
        .map(|&(id, _)| id)
        .ok_or_else(|| ServiceError::Inference("empty candidate set".into()))
}

pub fn argmax(logits: &[f32]) -> Result<u32, ServiceError> {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0)))
        .map(|(idx, _)| idx as u32)
        .ok_or_else(|| ServiceError::Inference("empty logits".into()))
}

/// Softmax of `logits / temperature`, computed in f64.
pub fn softmax(logits: &[f32], temperature: f64) -> Result<Vec<f64>, ServiceError> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(ServiceError::Inference(
            "logits contain no finite values".into(),
        ));
    }

    let max = f64::from(max);
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((f64::from(l) - max) / temperature).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

/// Smallest set of most probable tokens whose mass reaches `top_p`,
/// renormalized and ordered by descending probability.
pub fn nucleus(probs: &[f64], top_p: f64) -> Vec<(u32, f64)> {
    let mut ranked: Vec<(u32, f64)> = probs
        .iter()
        .enumerate()
        .map(|(id, &p)| (id as u32, p))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

    let mut cumulative = 0.0;
    let mut keep = 0;
    for &(_, p) in &ranked {
        if p <= 0.0 && keep > 0 {
            break;
        }
        cumulative += p;
        keep += 1;
        if cumulative >= top_p {
            break;
        }
    }
    ranked.truncate(keep.max(1));

    let mass: f64 = ranked.iter().map(|&(_, p)| p).sum();
    if mass > 0.0 {
        for entry in &mut ranked {
            entry.1 /= mass;
        }
    }
    ranked
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn params_with(max_new_tokens: usize, temperature: f64, top_p: f64) -> SamplingParams {
        SamplingParams {
            max_new_tokens,
            temperature,
            top_p,
        }
    }

    fn params(temperature: f64, top_p: f64) -> SamplingParams {
        params_with(16, temperature, top_p)
    }

    fn request(max_new_tokens: usize, temperature: f64, top_p: f64) -> GenerationRequest {
        GenerationRequest {
            prompt: String::new(),
            max_new_tokens,
            temperature,
            top_p,
        }
    }

    #[test]
    fn validation_accepts_defaults_and_greedy() {
        let defaults = SamplingParams::from_request(&GenerationRequest::new("x"), 2048).unwrap();
        assert_eq!(defaults, params_with(256, 0.7, 0.9));

        let greedy = SamplingParams::from_request(&request(4, 0.0, 1.0), 2048).unwrap();
        assert!(greedy.is_greedy());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let cases = [
            request(0, 0.7, 0.9),
            request(4096, 0.7, 0.9),
            request(8, -0.1, 0.9),
            request(8, f64::NAN, 0.9),
            request(8, f64::INFINITY, 0.9),
            request(8, 0.7, 0.0),
            request(8, 0.7, 1.5),
            request(8, 0.7, f64::NAN),
        ];
        for case in cases {
            let err = SamplingParams::from_request(&case, 2048).unwrap_err();
            assert!(matches!(err, ServiceError::InvalidSampling(_)), "{case:?}");
        }
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let mut rng = StdRng::seed_from_u64(7);
        let logits = [0.1, 3.0, 2.9, -1.0];
        for _ in 0..50 {
            assert_eq!(sample_next(&logits, &params(0.0, 0.9), &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn tiny_top_p_restricts_to_most_probable_token() {
        let mut rng = StdRng::seed_from_u64(11);
        let logits = [1.0, 1.5, 1.4, 0.2, 1.45];
        for _ in 0..200 {
            assert_eq!(sample_next(&logits, &params(1.0, 1e-6), &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn full_top_p_matches_softmax_frequencies() {
        let mut rng = StdRng::seed_from_u64(1234);
        let logits = [1.0f32, 2.0, 3.0];
        let expected = softmax(&logits, 1.0).unwrap();

        let draws = 40_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            counts[sample_next(&logits, &params(1.0, 1.0), &mut rng).unwrap() as usize] += 1;
        }
        for (count, p) in counts.iter().zip(expected) {
            let observed = *count as f64 / draws as f64;
            assert!((observed - p).abs() < 0.015, "observed {observed} expected {p}");
        }
    }

    #[test]
    fn high_temperature_flattens_towards_uniform() {
        let probs = softmax(&[0.0, 4.0, 8.0, 2.0], 1000.0).unwrap();
        let kept = nucleus(&probs, 1.0);
        assert_eq!(kept.len(), 4);
        for (_, p) in kept {
            assert!((p - 0.25).abs() < 0.01);
        }
    }

    #[test]
    fn nucleus_keeps_smallest_prefix_reaching_threshold() {
        let probs = [0.1, 0.5, 0.3, 0.1];
        let kept = nucleus(&probs, 0.75);
        let ids: Vec<u32> = kept.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2]);
        let mass: f64 = kept.iter().map(|&(_, p)| p).sum();
        assert!((mass - 1.0).abs() < 1e-12);
        assert!((kept[0].1 - 0.625).abs() < 1e-12);
    }

    #[test]
    fn lower_temperature_sharpens() {
        let sharp = softmax(&[1.0, 2.0], 0.25).unwrap();
        let flat = softmax(&[1.0, 2.0], 4.0).unwrap();
        assert!(sharp[1] > flat[1]);
    }

    #[test]
    fn masked_logits_are_never_sampled() {
        let mut rng = StdRng::seed_from_u64(3);
        let logits = [f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY, 0.0];
        for _ in 0..100 {
            let id = sample_next(&logits, &params(1.0, 1.0), &mut rng).unwrap();
            assert!(id == 1 || id == 3);
        }
    }

    #[test]
    fn nan_logits_are_an_inference_error() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = sample_next(&[0.0, f32::NAN], &params(0.7, 0.9), &mut rng).unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }
}
