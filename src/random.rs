//! Seeded Gaussian random sources for initial noise and VAE sampling.
//!
//! Two algorithms are available. `NumPy` reproduces the legacy
//! `numpy.random.seed(s); numpy.random.randn(...)` stream bit for bit, so
//! latents match those produced by Python pipelines for the same seed.
//! `ChaCha` uses the `rand` ecosystem and is portable across platforms.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// Random number generator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RngAlgorithm {
    /// Mersenne Twister with NumPy's legacy Gaussian sampler.
    #[default]
    NumPy,
    /// ChaCha8 stream cipher with the ziggurat normal sampler.
    ChaCha,
}

impl RngAlgorithm {
    /// Parses an algorithm name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "numpy" | "mt19937" => Some(RngAlgorithm::NumPy),
            "chacha" | "chacha8" => Some(RngAlgorithm::ChaCha),
            _ => None,
        }
    }

    /// Returns the string name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            RngAlgorithm::NumPy => "numpy",
            RngAlgorithm::ChaCha => "chacha",
        }
    }
}

impl std::fmt::Display for RngAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reproducible source of normally distributed values.
pub trait RandomSource {
    /// Draws one sample from `N(mean, stdev²)`.
    fn next_gaussian(&mut self, mean: f64, stdev: f64) -> f64;

    /// Fills a tensor of `shape` with samples in row-major order.
    fn normal_tensor(&mut self, shape: &[usize], mean: f64, stdev: f64) -> Tensor {
        let mut tensor = Tensor::zeros(shape);
        for value in tensor.iter_mut() {
            *value = self.next_gaussian(mean, stdev) as f32;
        }
        tensor
    }
}

/// Creates the random source for `algorithm` seeded with `seed`.
pub fn random_source(algorithm: RngAlgorithm, seed: u32) -> Box<dyn RandomSource> {
    match algorithm {
        RngAlgorithm::NumPy => Box::new(NumPyRandomSource::new(seed)),
        RngAlgorithm::ChaCha => Box::new(ChaChaRandomSource::new(seed as u64)),
    }
}

const MT_N: usize = 624;
const MT_M: usize = 397;
const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// MT19937 generator with NumPy's legacy double and Gaussian samplers.
#[derive(Clone)]
pub struct NumPyRandomSource {
    state: [u32; MT_N],
    pos: usize,
    cached_gaussian: Option<f64>,
}

impl NumPyRandomSource {
    /// Seeds the generator like `numpy.random.seed(seed)`.
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; MT_N];
        state[0] = seed;
        for i in 1..MT_N {
            let prev = state[i - 1];
            state[i] = 1_812_433_253u32
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        Self {
            state,
            pos: MT_N,
            cached_gaussian: None,
        }
    }

    fn twist(&mut self) {
        for i in 0..MT_N {
            let y = (self.state[i] & UPPER_MASK) | (self.state[(i + 1) % MT_N] & LOWER_MASK);
            let mag = if y & 1 == 1 { MATRIX_A } else { 0 };
            self.state[i] = self.state[(i + MT_M) % MT_N] ^ (y >> 1) ^ mag;
        }
        self.pos = 0;
    }

    /// Next tempered 32-bit output.
    pub fn next_u32(&mut self) -> u32 {
        if self.pos >= MT_N {
            self.twist();
        }
        let mut y = self.state[self.pos];
        self.pos += 1;

        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        y
    }

    /// Uniform double in `[0, 1)` with 53 bits of randomness.
    pub fn next_double(&mut self) -> f64 {
        let a = (self.next_u32() >> 5) as f64;
        let b = (self.next_u32() >> 6) as f64;
        (a * 67_108_864.0 + b) / 9_007_199_254_740_992.0
    }

    /// Standard normal sample via the polar Box-Muller method.
    fn next_standard_gaussian(&mut self) -> f64 {
        if let Some(cached) = self.cached_gaussian.take() {
            return cached;
        }
        loop {
            let x1 = 2.0 * self.next_double() - 1.0;
            let x2 = 2.0 * self.next_double() - 1.0;
            let r2 = x1 * x1 + x2 * x2;
            if r2 < 1.0 && r2 != 0.0 {
                let f = (-2.0 * r2.ln() / r2).sqrt();
                self.cached_gaussian = Some(f * x1);
                return f * x2;
            }
        }
    }
}

impl RandomSource for NumPyRandomSource {
    fn next_gaussian(&mut self, mean: f64, stdev: f64) -> f64 {
        mean + stdev * self.next_standard_gaussian()
    }
}

/// ChaCha8-backed Gaussian source.
#[derive(Clone)]
pub struct ChaChaRandomSource {
    rng: ChaCha8Rng,
}

impl ChaChaRandomSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for ChaChaRandomSource {
    fn next_gaussian(&mut self, mean: f64, stdev: f64) -> f64 {
        let z: f64 = StandardNormal.sample(&mut self.rng);
        mean + stdev * z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_parsing() {
        assert_eq!(RngAlgorithm::parse("numpy"), Some(RngAlgorithm::NumPy));
        assert_eq!(RngAlgorithm::parse("ChaCha"), Some(RngAlgorithm::ChaCha));
        assert_eq!(RngAlgorithm::parse("torch"), None);
        assert_eq!(RngAlgorithm::default().as_str(), "numpy");
    }

    #[test]
    fn mt19937_reference_output() {
        // Reference value from the MT19937 paper's default seed.
        let mut rng = NumPyRandomSource::new(5489);
        assert_eq!(rng.next_u32(), 3_499_211_612);
    }

    #[test]
    fn numpy_randn_seed_zero() {
        let mut rng = NumPyRandomSource::new(0);
        let first = rng.next_gaussian(0.0, 1.0);
        let second = rng.next_gaussian(0.0, 1.0);
        let third = rng.next_gaussian(0.0, 1.0);
        assert!((first - 1.764052345967664).abs() < 1e-12);
        assert!((second - 0.4001572083672233).abs() < 1e-12);
        assert!((third - 0.9787379841057392).abs() < 1e-12);
    }

    #[test]
    fn gaussian_mean_and_stdev_are_applied() {
        let mut plain = NumPyRandomSource::new(42);
        let mut shifted = NumPyRandomSource::new(42);
        for _ in 0..10 {
            let z = plain.next_gaussian(0.0, 1.0);
            let x = shifted.next_gaussian(3.0, 2.0);
            assert!((x - (3.0 + 2.0 * z)).abs() < 1e-12);
        }
    }

    #[test]
    fn normal_tensor_follows_stream_order() {
        let tensor = NumPyRandomSource::new(0).normal_tensor(&[1, 2, 2], 0.0, 1.0);
        let mut rng = NumPyRandomSource::new(0);
        for value in tensor.iter() {
            assert_eq!(*value, rng.next_gaussian(0.0, 1.0) as f32);
        }
    }

    #[test]
    fn chacha_is_deterministic_per_seed() {
        let a = random_source(RngAlgorithm::ChaCha, 7).normal_tensor(&[64], 0.0, 1.0);
        let b = random_source(RngAlgorithm::ChaCha, 7).normal_tensor(&[64], 0.0, 1.0);
        let c = random_source(RngAlgorithm::ChaCha, 8).normal_tensor(&[64], 0.0, 1.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn samples_are_roughly_standard_normal() {
        for algorithm in [RngAlgorithm::NumPy, RngAlgorithm::ChaCha] {
            let samples = random_source(algorithm, 1).normal_tensor(&[20_000], 0.0, 1.0);
            let n = samples.len() as f64;
            let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = samples.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 0.05, "{}: mean {}", algorithm, mean);
            assert!((var - 1.0).abs() < 0.05, "{}: variance {}", algorithm, var);
        }
    }
}
