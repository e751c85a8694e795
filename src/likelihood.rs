//! Data log-likelihood and log-posterior of a (gamma, tau, eta) triple.
use ndarray::{Array2, ArrayView2, ArrayView3, Axis};

use crate::error::Result;
use crate::state::{ModelState, TauTable};
use crate::util::{log_dirichlet_pdf, log_multinomial_pdf, softmax, NUM_BASES};

/// Predicted symbol probabilities at one site for every sample, S x 4.
/// `tau_site` is G x 4 and may hold fractional weights (posterior means).
pub fn base_probability<T: Copy + Into<f64>>(
    tau_site: ArrayView2<T>,
    gamma: ArrayView2<f64>,
    eta: ArrayView2<f64>,
) -> Array2<f64> {
    let n_samples = gamma.nrows();
    let n_genomes = gamma.ncols();
    let mut prob = Array2::<f64>::zeros((n_samples, NUM_BASES));
    for g in 0..n_genomes {
        for b in 0..NUM_BASES {
            let weight: f64 = tau_site[[g, b]].into();
            if weight == 0.0 {
                continue;
            }
            for s in 0..n_samples {
                let mass = weight * gamma[[s, g]];
                for a in 0..NUM_BASES {
                    prob[[s, a]] += mass * eta[[b, a]];
                }
            }
        }
    }
    prob
}

/// Log multinomial probability of every (variant, sample) count vector
pub fn log_likelihood<T: Copy + Into<f64>>(
    variants: ArrayView3<u32>,
    gamma: ArrayView2<f64>,
    tau: ArrayView3<T>,
    eta: ArrayView2<f64>,
) -> f64 {
    let mut log_ll = 0.0;
    for (v, site_counts) in variants.outer_iter().enumerate() {
        let prob = base_probability(tau.index_axis(Axis(0), v), gamma, eta);
        for (counts, p) in site_counts.outer_iter().zip(prob.outer_iter()) {
            let counts: Vec<u32> = counts.to_vec();
            let p: Vec<f64> = p.to_vec();
            log_ll += log_multinomial_pdf(&counts, &p);
        }
    }
    log_ll
}

/// Dirichlet priors on gamma and eta rows plus the uniform tau prior
pub fn log_prior(
    gamma: ArrayView2<f64>,
    eta: ArrayView2<f64>,
    alpha: &[f64],
    delta: &[f64],
    n_variants: usize,
) -> f64 {
    let n_genomes = gamma.ncols();
    let gamma_prior: f64 = gamma
        .outer_iter()
        .map(|row| log_dirichlet_pdf(&row.to_vec(), alpha))
        .sum();
    let eta_prior: f64 = eta
        .outer_iter()
        .map(|row| log_dirichlet_pdf(&row.to_vec(), delta))
        .sum();
    let tau_prior = (n_variants * n_genomes) as f64 * (1.0f64 / NUM_BASES as f64).ln();
    gamma_prior + eta_prior + tau_prior
}

impl ModelState {
    pub fn log_likelihood<T: Copy + Into<f64>>(
        &self,
        gamma: ArrayView2<f64>,
        tau: ArrayView3<T>,
        eta: ArrayView2<f64>,
    ) -> f64 {
        log_likelihood(self.variants.view(), gamma, tau, eta)
    }

    pub fn log_prior(&self, gamma: ArrayView2<f64>, eta: ArrayView2<f64>) -> f64 {
        log_prior(gamma, eta, &self.alpha, &self.delta, self.n_variants)
    }

    pub fn log_posterior<T: Copy + Into<f64>>(
        &self,
        gamma: ArrayView2<f64>,
        tau: ArrayView3<T>,
        eta: ArrayView2<f64>,
    ) -> f64 {
        self.log_likelihood(gamma, tau, eta) + self.log_prior(gamma, eta)
    }

    /// Likelihood and posterior of the current parameters, stored on the state
    pub fn refresh_scores(&mut self) {
        self.ll = self.log_likelihood(self.gamma.view(), self.tau.view(), self.eta.view());
        self.lp = self.ll + self.log_prior(self.gamma.view(), self.eta.view());
    }

    /// Sum over variants of the log conditional probability of the star joint
    /// state, evaluated exactly over all 4^G joint states at (gamma, eta)
    pub fn log_tau_prob(&self, gamma: ArrayView2<f64>, eta: ArrayView2<f64>) -> Result<f64> {
        let table = self.require_table()?;
        let site_log_prob = state_log_probabilities(table, gamma, eta);

        let mut total = 0.0;
        let mut state_log_prob = vec![0.0; table.n_states()];
        for (v, counts) in self.variants.outer_iter().enumerate() {
            for (t, log_p) in site_log_prob.iter().enumerate() {
                state_log_prob[t] = weighted_log_sum(counts, log_p.view());
            }
            let prob = softmax(&state_log_prob);
            total += prob[self.star.tau_indices[v]].ln();
        }
        Ok(total)
    }
}

/// Log predicted symbol probabilities (S x 4) under every joint state of `table`
pub fn state_log_probabilities(
    table: &TauTable,
    gamma: ArrayView2<f64>,
    eta: ArrayView2<f64>,
) -> Vec<Array2<f64>> {
    table
        .states
        .outer_iter()
        .map(|state| base_probability(state, gamma, eta).mapv(|p| p.max(f64::MIN_POSITIVE).ln()))
        .collect()
}

/// `sum_{s,a} counts[s][a] * log_p[s][a]`, skipping zero counts
pub fn weighted_log_sum(counts: ArrayView2<u32>, log_p: ArrayView2<f64>) -> f64 {
    counts
        .iter()
        .zip(log_p.iter())
        .filter(|(c, _)| **c > 0)
        .map(|(&c, &lp)| c as f64 * lp)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerConfig;
    use crate::state::{initial_eta, tau_from_bases};
    use approx::assert_relative_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn base_probability_mixes_genomes_through_eta() {
        // genome 0 carries A, genome 1 carries G
        let tau = tau_from_bases(&array![[0usize, 2]]);
        let gamma = array![[0.25, 0.75]];
        let eta = Array2::<f64>::eye(4);
        let p = base_probability(tau.index_axis(Axis(0), 0), gamma.view(), eta.view());
        assert_relative_eq!(p[[0, 0]], 0.25);
        assert_relative_eq!(p[[0, 2]], 0.75);
        assert_relative_eq!(p.row(0).sum(), 1.0);
    }

    #[test]
    fn fractional_tau_is_accepted() {
        let tau = array![[[0.5, 0.5, 0.0, 0.0]]];
        let gamma = array![[1.0]];
        let eta = initial_eta();
        let p = base_probability(tau.index_axis(Axis(0), 0), gamma.view(), eta.view());
        assert_relative_eq!(p.row(0).sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(p[[0, 0]], 0.5 * 0.97 + 0.5 * 0.01, epsilon = 1e-12);
    }

    #[test]
    fn likelihood_is_higher_for_the_generating_haplotype() {
        let mut variants = Array3::<u32>::zeros((2, 1, 4));
        variants[[0, 0, 1]] = 40;
        variants[[1, 0, 3]] = 40;
        let gamma = array![[1.0]];
        let eta = initial_eta();
        let right = tau_from_bases(&array![[1usize], [3]]);
        let wrong = tau_from_bases(&array![[0usize], [3]]);
        let ll_right = log_likelihood(variants.view(), gamma.view(), right.view(), eta.view());
        let ll_wrong = log_likelihood(variants.view(), gamma.view(), wrong.view(), eta.view());
        assert!(ll_right > ll_wrong);
        assert_relative_eq!(ll_right, 2.0 * 40.0 * 0.97f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn posterior_adds_uniform_tau_prior() {
        let mut rng = StdRng::seed_from_u64(9);
        let variants = Array3::<u32>::from_elem((3, 2, 4), 2);
        let state = ModelState::new(variants, SamplerConfig::with_genomes(2), None, &mut rng).unwrap();
        let ll = state.log_likelihood(state.gamma.view(), state.tau.view(), state.eta.view());
        let lp = state.log_posterior(state.gamma.view(), state.tau.view(), state.eta.view());
        let mut expected = ll + 6.0 * 0.25f64.ln();
        for row in state.gamma.outer_iter() {
            expected += log_dirichlet_pdf(&row.to_vec(), &state.alpha);
        }
        for row in state.eta.outer_iter() {
            expected += log_dirichlet_pdf(&row.to_vec(), &state.delta);
        }
        assert_relative_eq!(lp, expected, epsilon = 1e-9);
    }

    #[test]
    fn exhaustive_tau_probability_is_a_log_probability() {
        let mut rng = StdRng::seed_from_u64(4);
        let variants = Array3::<u32>::from_elem((4, 2, 4), 3);
        let mut state = ModelState::new(variants, SamplerConfig::with_genomes(2), None, &mut rng).unwrap();
        state.store_star(0);
        let lt = state.log_tau_prob(state.gamma.view(), state.eta.view()).unwrap();
        assert!(lt.is_finite());
        assert!(lt <= 0.0);
    }
}
