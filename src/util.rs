//! Log densities, joint state enumeration and the random draws shared by the Gibbs samplers.
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::{Binomial, Gamma};
use statrs::function::gamma::ln_gamma;

use crate::error::{HaploError, Result};

/// Number of nucleotide symbols (A, C, G, T)
pub const NUM_BASES: usize = 4;

pub const BASES: [char; NUM_BASES] = ['A', 'C', 'G', 'T'];

/// Index of a nucleotide letter, case-insensitive
pub fn base_index(base: char) -> Option<usize> {
    match base.to_ascii_uppercase() {
        'A' => Some(0),
        'C' => Some(1),
        'G' => Some(2),
        'T' => Some(3),
        _ => None,
    }
}

// ============================================================================
// Log densities
// ============================================================================

/// Log probability of a count vector under a multinomial with probabilities `probs`.
/// Zero counts contribute nothing, so zero probabilities at unobserved symbols are allowed.
pub fn log_multinomial_pdf(counts: &[u32], probs: &[f64]) -> f64 {
    let total: u32 = counts.iter().sum();
    let mut log_p = ln_gamma(total as f64 + 1.0);
    for (&x, &p) in counts.iter().zip(probs) {
        if x > 0 {
            log_p += x as f64 * p.ln() - ln_gamma(x as f64 + 1.0);
        }
    }
    log_p
}

/// Log density of a simplex point `x` under Dirichlet(`alpha`)
pub fn log_dirichlet_pdf(x: &[f64], alpha: &[f64]) -> f64 {
    let alpha_sum: f64 = alpha.iter().sum();
    let mut log_p = ln_gamma(alpha_sum);
    for (&xi, &ai) in x.iter().zip(alpha) {
        log_p += (ai - 1.0) * xi.max(f64::MIN_POSITIVE).ln() - ln_gamma(ai);
    }
    log_p
}

/// Numerically stable log of the arithmetic mean of `exp(values)`
pub fn log_mean_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_log = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !max_log.is_finite() {
        return max_log;
    }
    let sum: f64 = values.iter().map(|&v| (v - max_log).exp()).sum();
    max_log + sum.ln() - (values.len() as f64).ln()
}

/// Normalise log weights so that their exponentials sum to one
pub fn normalise_log_prob(log_probs: &[f64]) -> Vec<f64> {
    let max_log = log_probs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let shifted: Vec<f64> = log_probs.iter().map(|&lp| lp - max_log).collect();
    let log_total = shifted.iter().map(|lp| lp.exp()).sum::<f64>().ln();
    shifted.iter().map(|lp| lp - log_total).collect()
}

/// Exponentiate log weights after subtracting their maximum and renormalise
pub fn softmax(log_probs: &[f64]) -> Vec<f64> {
    let max_log = log_probs.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if !max_log.is_finite() {
        return vec![1.0 / log_probs.len() as f64; log_probs.len()];
    }
    let weights: Vec<f64> = log_probs.iter().map(|&lp| (lp - max_log).exp()).collect();
    let total: f64 = weights.iter().sum();
    weights.iter().map(|w| w / total).collect()
}

// ============================================================================
// Joint state enumeration
// ============================================================================

/// All `NUM_BASES^genomes` assignments of a base to each genome.
/// Row `t` holds the base-4 digits of `t`, most significant digit first.
pub fn cartesian(genomes: usize) -> Vec<Vec<usize>> {
    let n_states = NUM_BASES.pow(genomes as u32);
    (0..n_states)
        .map(|t| {
            let mut digits = vec![0; genomes];
            let mut rest = t;
            for g in (0..genomes).rev() {
                digits[g] = rest % NUM_BASES;
                rest /= NUM_BASES;
            }
            digits
        })
        .collect()
}

// ============================================================================
// Random draws
// ============================================================================

/// Draw an index from unnormalised log weights
pub fn sample_log_prob<R: Rng + ?Sized>(log_probs: &[f64], rng: &mut R) -> Result<usize> {
    let weights = softmax(log_probs);
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| HaploError::distribution(format!("categorical weights {:?}: {}", weights, e)))?;
    Ok(dist.sample(rng))
}

/// Dirichlet draw built from normalised Gamma variates; also valid for a single component
pub fn sample_dirichlet<R: Rng + ?Sized>(alpha: &[f64], rng: &mut R) -> Result<Vec<f64>> {
    let mut draws = Vec::with_capacity(alpha.len());
    for &a in alpha {
        let gamma = Gamma::new(a, 1.0)
            .map_err(|e| HaploError::distribution(format!("gamma shape {}: {}", a, e)))?;
        draws.push(gamma.sample(rng));
    }
    let total: f64 = draws.iter().sum();
    if total > 0.0 && total.is_finite() {
        Ok(draws.iter().map(|d| d / total).collect())
    } else {
        // every variate underflowed; fall back to the prior mean
        let alpha_sum: f64 = alpha.iter().sum();
        Ok(alpha.iter().map(|a| a / alpha_sum).collect())
    }
}

/// Split `n` trials across categories with weights `probs` (need not be normalised),
/// using sequential conditional binomial draws. Categories with zero weight never
/// receive a trial.
pub fn sample_multinomial<R: Rng + ?Sized>(n: u32, probs: &[f64], rng: &mut R) -> Result<Vec<u32>> {
    let k = probs.len();
    let mut counts = vec![0u32; k];
    if n == 0 || k == 0 {
        return Ok(counts);
    }
    let last = probs
        .iter()
        .rposition(|&p| p > 0.0)
        .ok_or_else(|| HaploError::distribution(format!("{} trials over zero weights {:?}", n, probs)))?;
    let mut remaining = n;
    for i in 0..last {
        if remaining == 0 {
            break;
        }
        if probs[i] <= 0.0 {
            continue;
        }
        // mass of this and every later category, summed afresh to avoid drift
        let mass_left: f64 = probs[i..=last].iter().filter(|&&p| p > 0.0).sum();
        let p = (probs[i] / mass_left).clamp(0.0, 1.0);
        let binomial = Binomial::new(remaining as u64, p)
            .map_err(|e| HaploError::distribution(format!("binomial p {}: {}", p, e)))?;
        let draw = binomial.sample(rng) as u32;
        counts[i] = draw;
        remaining -= draw;
    }
    counts[last] += remaining;
    Ok(counts)
}
