//! Chib estimates of the model evidence from the star state.
use log::{debug, info};
use ndarray::{Array2, Array4, Axis};
use rand::Rng;
use serde::Serialize;

use crate::error::{HaploError, Result};
use crate::sampler::sample_origin;
use crate::state::{tau_one, ModelState};
use crate::util::{log_dirichlet_pdf, log_mean_exp, NUM_BASES};

/// Which posterior-ordinate scheme to use. Both return the same quantity; they
/// differ in which trace is reused and which ordinates get fresh sweeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MarginalEstimator {
    /// tau ordinate from the first `tau_comp_iter` recorded iterations, evaluated
    /// exactly over all 4^G joint states; gamma and eta ordinates from fresh
    /// sweeps with tau at its star value
    StoredTrace,
    /// eta ordinate from the recorded latent counts; gamma ordinate from sweeps
    /// with tau and eta at their star values; tau ordinate genome by genome
    AuxiliarySweeps,
}

/// Components of a marginal likelihood estimate, all in log space
#[derive(Clone, Debug, Serialize)]
pub struct MarginalEstimate {
    pub estimator: MarginalEstimator,
    pub log_likelihood: f64,
    pub log_gamma_prior: f64,
    pub log_eta_prior: f64,
    pub log_tau_prior: f64,
    pub log_gamma_ordinate: f64,
    pub log_eta_ordinate: f64,
    pub log_tau_ordinate: f64,
    pub log_evidence: f64,
}

/// Chain tensors perturbed by the auxiliary sweeps
struct SavedChain {
    gamma: Array2<f64>,
    eta: Array2<f64>,
    e: Array4<u32>,
    mu: Array4<u32>,
}

impl ModelState {
    fn save_chain(&self) -> SavedChain {
        SavedChain {
            gamma: self.gamma.clone(),
            eta: self.eta.clone(),
            e: self.e.clone(),
            mu: self.mu.clone(),
        }
    }

    fn restore_chain(&mut self, saved: SavedChain) {
        self.gamma = saved.gamma;
        self.eta = saved.eta;
        self.e = saved.e;
        self.mu = saved.mu;
    }

    /// Sum over samples of the Dirichlet density of the star gamma given the current `mu`
    fn gamma_star_ordinate(&self) -> f64 {
        let totals = self.mu_sample_totals();
        (0..self.n_samples)
            .map(|s| {
                let concentration: Vec<f64> = self
                    .alpha
                    .iter()
                    .zip(totals.row(s))
                    .map(|(a, t)| a + t)
                    .collect();
                log_dirichlet_pdf(&self.star.gamma.row(s).to_vec(), &concentration)
            })
            .sum()
    }

    /// Sum over true bases of the Dirichlet density of the star eta given origin totals
    fn eta_star_ordinate(&self, e_totals: &Array2<f64>) -> f64 {
        (0..NUM_BASES)
            .map(|b| {
                let concentration: Vec<f64> = self
                    .delta
                    .iter()
                    .zip(e_totals.column(b))
                    .map(|(d, t)| d + t)
                    .collect();
                log_dirichlet_pdf(&self.star.eta.row(b).to_vec(), &concentration)
            })
            .sum()
    }

    /// Chib's marginal log-likelihood. The chain's current gamma, eta and latent
    /// counts are restored afterwards; the generator is advanced.
    pub fn marginal_log_likelihood<R: Rng + ?Sized>(
        &mut self,
        estimator: MarginalEstimator,
        rng: &mut R,
    ) -> Result<MarginalEstimate> {
        if self.trace.completed == 0 {
            return Err(HaploError::config(
                "marginal likelihood needs a recorded sampling trace",
            ));
        }
        let saved = self.save_chain();
        let ordinates = match estimator {
            MarginalEstimator::StoredTrace => self.stored_trace_ordinates(rng),
            MarginalEstimator::AuxiliarySweeps => self.auxiliary_sweep_ordinates(rng),
        };
        self.restore_chain(saved);
        let (log_gamma_ordinate, log_eta_ordinate, log_tau_ordinate) = ordinates?;

        let star = &self.star;
        let log_likelihood = self.log_likelihood(star.gamma.view(), star.tau.view(), star.eta.view());
        let log_gamma_prior: f64 = star
            .gamma
            .outer_iter()
            .map(|row| log_dirichlet_pdf(&row.to_vec(), &self.alpha))
            .sum();
        let log_eta_prior: f64 = star
            .eta
            .outer_iter()
            .map(|row| log_dirichlet_pdf(&row.to_vec(), &self.delta))
            .sum();
        let log_tau_prior =
            (self.n_variants * self.n_genomes) as f64 * (1.0f64 / NUM_BASES as f64).ln();

        let log_evidence = log_likelihood + log_gamma_prior + log_eta_prior + log_tau_prior
            - log_gamma_ordinate
            - log_eta_ordinate
            - log_tau_ordinate;
        info!(
            "Marginal log-likelihood ({:?}): {:.4} (ll {:.4}, gamma {:.4}, eta {:.4}, tau {:.4})",
            estimator, log_evidence, log_likelihood, log_gamma_ordinate, log_eta_ordinate, log_tau_ordinate
        );

        Ok(MarginalEstimate {
            estimator,
            log_likelihood,
            log_gamma_prior,
            log_eta_prior,
            log_tau_prior,
            log_gamma_ordinate,
            log_eta_ordinate,
            log_tau_ordinate,
            log_evidence,
        })
    }

    fn stored_trace_ordinates<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(f64, f64, f64)> {
        let n_aux = self.config.max_iter.max(1);

        // tau from the earliest recorded iterations
        let n_tau = self.config.tau_comp_iter.min(self.trace.completed).max(1);
        let mut store_tau = Vec::with_capacity(n_tau);
        for i in 0..n_tau {
            let gamma = self.trace.gamma.index_axis(Axis(0), i);
            let eta = self.trace.eta.index_axis(Axis(0), i);
            store_tau.push(self.log_tau_prob(gamma, eta)?);
        }
        let log_tau_hat = log_mean_exp(&store_tau);

        // gamma with tau at the star value
        let mut store_gamma = Vec::with_capacity(n_aux);
        for i in 0..n_aux {
            sample_origin(
                self.variants.view(),
                self.star.tau.view(),
                self.gamma.view(),
                self.eta.view(),
                &mut self.e,
                &mut self.mu,
                rng,
            )?;
            self.sample_gamma(rng)?;
            self.sample_eta(rng)?;
            let ordinate = self.gamma_star_ordinate();
            debug!("{},GC,{}", i, ordinate);
            store_gamma.push(ordinate);
        }
        let log_gamma_hat = log_mean_exp(&store_gamma);

        // eta with tau and gamma at their star values
        let mut store_eta = Vec::with_capacity(n_aux);
        for i in 0..n_aux {
            sample_origin(
                self.variants.view(),
                self.star.tau.view(),
                self.star.gamma.view(),
                self.eta.view(),
                &mut self.e,
                &mut self.mu,
                rng,
            )?;
            self.sample_eta(rng)?;
            let ordinate = self.eta_star_ordinate(&self.e_totals());
            debug!("{},EC,{}", i, ordinate);
            store_eta.push(ordinate);
        }
        let log_eta_hat = log_mean_exp(&store_eta);

        Ok((log_gamma_hat, log_eta_hat, log_tau_hat))
    }

    fn auxiliary_sweep_ordinates<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(f64, f64, f64)> {
        let n_aux = self.config.max_iter.max(1);

        // eta from every recorded set of origin counts
        let store_eta: Vec<f64> = (0..self.trace.completed)
            .map(|i| {
                let totals = self
                    .trace
                    .e
                    .index_axis(Axis(0), i)
                    .sum_axis(Axis(1))
                    .sum_axis(Axis(0))
                    .mapv(|x| x as f64);
                self.eta_star_ordinate(&totals)
            })
            .collect();
        let log_eta_hat = log_mean_exp(&store_eta);

        // gamma with tau and eta at their star values
        let mut store_gamma = Vec::with_capacity(n_aux);
        for i in 0..n_aux {
            sample_origin(
                self.variants.view(),
                self.star.tau.view(),
                self.gamma.view(),
                self.star.eta.view(),
                &mut self.e,
                &mut self.mu,
                rng,
            )?;
            self.sample_gamma(rng)?;
            let ordinate = self.gamma_star_ordinate();
            debug!("{},GC,{}", i, ordinate);
            store_gamma.push(ordinate);
        }
        let log_gamma_hat = log_mean_exp(&store_gamma);

        // tau genome by genome: genomes below h stay at the star assignment
        let mut log_tau_hat = 0.0;
        for h in 0..self.n_genomes {
            let mut working = self.star.tau.clone();
            let mut store_tau = Vec::with_capacity(n_aux);
            for i in 0..n_aux {
                let log_prob = self.sample_tau_from(
                    &mut working,
                    h,
                    self.star.gamma.view(),
                    self.star.eta.view(),
                    rng,
                )?;
                let total: f64 = (0..self.n_variants)
                    .map(|v| {
                        let star_base = tau_one(self.star.tau.slice(ndarray::s![v, h, ..]));
                        log_prob[[v, star_base]]
                    })
                    .sum();
                debug!("{},GT,{},{}", i, h, total);
                store_tau.push(total);
            }
            log_tau_hat += log_mean_exp(&store_tau);
        }

        Ok((log_gamma_hat, log_eta_hat, log_tau_hat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::GibbsSampler;
    use crate::config::SamplerConfig;
    use crate::state::initial_eta;
    use approx::assert_relative_eq;
    use ndarray::{array, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::function::gamma::ln_gamma;

    fn fitted(seed: u64) -> (ModelState, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut variants = Array3::<u32>::zeros((6, 2, 4));
        for v in 0..6 {
            variants[[v, 0, v % 4]] = 25;
            variants[[v, 0, (v + 1) % 4]] = 15;
            variants[[v, 1, v % 4]] = 10;
            variants[[v, 1, (v + 1) % 4]] = 30;
        }
        let config = SamplerConfig {
            genomes: 2,
            burn_iter: 10,
            max_iter: 20,
            tau_comp_iter: 5,
            ..Default::default()
        };
        let state = ModelState::new(variants, config, None, &mut rng).unwrap();
        let mut chain = GibbsSampler::new(state);
        chain.run(&mut rng).unwrap();
        (chain.into_state(), rng)
    }

    #[test]
    fn both_estimators_give_finite_evidence() {
        let (mut state, mut rng) = fitted(1);
        for estimator in [MarginalEstimator::StoredTrace, MarginalEstimator::AuxiliarySweeps] {
            let estimate = state.marginal_log_likelihood(estimator, &mut rng).unwrap();
            assert!(estimate.log_evidence.is_finite(), "{:?}", estimate);
            assert_eq!(estimate.estimator, estimator);
            assert!(estimate.log_tau_ordinate <= 1e-9);
        }
    }

    #[test]
    fn estimation_restores_chain_tensors() {
        let (mut state, mut rng) = fitted(2);
        let gamma = state.gamma.clone();
        let eta = state.eta.clone();
        state
            .marginal_log_likelihood(MarginalEstimator::AuxiliarySweeps, &mut rng)
            .unwrap();
        assert_eq!(state.gamma, gamma);
        assert_eq!(state.eta, eta);
    }

    #[test]
    fn evidence_requires_a_trace() {
        let mut rng = StdRng::seed_from_u64(3);
        let variants = Array3::<u32>::from_elem((3, 2, 4), 4);
        let mut state = ModelState::new(variants, SamplerConfig::default(), None, &mut rng).unwrap();
        assert!(state
            .marginal_log_likelihood(MarginalEstimator::StoredTrace, &mut rng)
            .is_err());
    }

    #[test]
    fn stored_trace_estimator_is_gated_by_max_genomes() {
        let (mut state, mut rng) = fitted(4);
        state.tau_table = None;
        assert!(state
            .marginal_log_likelihood(MarginalEstimator::StoredTrace, &mut rng)
            .is_err());
        assert!(state
            .marginal_log_likelihood(MarginalEstimator::AuxiliarySweeps, &mut rng)
            .is_ok());
    }

    /// One genome; every site carries base `v % 4` under overwhelming counts
    fn pinned_single_genome() -> Array3<u32> {
        let mut variants = Array3::<u32>::zeros((8, 2, NUM_BASES));
        for v in 0..8 {
            let b = v % NUM_BASES;
            variants[[v, 0, b]] = 40;
            variants[[v, 1, b]] = 30;
            if v < 4 {
                variants[[v, 1, (b + 1) % NUM_BASES]] = 1;
            }
        }
        variants
    }

    fn log_beta(x: &[f64]) -> f64 {
        x.iter().map(|&xi| ln_gamma(xi)).sum::<f64>() - ln_gamma(x.iter().sum())
    }

    /// With G = 1, gamma is fixed at one and eta integrates out against its
    /// Dirichlet prior, so the evidence given the site bases is closed form
    fn single_genome_evidence(variants: &Array3<u32>, bases: &[usize], delta: &[f64]) -> f64 {
        let mut log_coefficient = 0.0;
        let mut origin = Array2::<f64>::zeros((NUM_BASES, NUM_BASES));
        for (v, site) in variants.outer_iter().enumerate() {
            for counts in site.outer_iter() {
                log_coefficient += ln_gamma(counts.sum() as f64 + 1.0);
                for (a, &n) in counts.iter().enumerate() {
                    log_coefficient -= ln_gamma(n as f64 + 1.0);
                    origin[[bases[v], a]] += n as f64;
                }
            }
        }
        let log_eta: f64 = origin
            .outer_iter()
            .map(|row| {
                let posterior: Vec<f64> = delta.iter().zip(row).map(|(d, n)| d + n).collect();
                log_beta(&posterior) - log_beta(delta)
            })
            .sum();
        log_coefficient + log_eta + bases.len() as f64 * 0.25f64.ln()
    }

    #[test]
    fn single_genome_evidence_matches_closed_form() {
        let variants = pinned_single_genome();
        let truth: Vec<usize> = (0..8).map(|v| v % NUM_BASES).collect();
        let config = SamplerConfig {
            genomes: 1,
            burn_iter: 20,
            max_iter: 30,
            tau_comp_iter: 5,
            ..Default::default()
        };
        for estimator in [MarginalEstimator::StoredTrace, MarginalEstimator::AuxiliarySweeps] {
            let mut rng = StdRng::seed_from_u64(17);
            let state = ModelState::new(variants.clone(), config.clone(), None, &mut rng).unwrap();
            let mut chain = GibbsSampler::new(state);
            chain.run(&mut rng).unwrap();
            let mut state = chain.into_state();

            let bases: Vec<usize> = (0..8)
                .map(|v| tau_one(state.star.tau.slice(ndarray::s![v, 0, ..])))
                .collect();
            assert_eq!(bases, truth);
            let expected = single_genome_evidence(&variants, &bases, &state.delta);

            let estimate = state.marginal_log_likelihood(estimator, &mut rng).unwrap();
            assert_relative_eq!(estimate.log_gamma_prior, 0.0, epsilon = 1e-12);
            assert_relative_eq!(estimate.log_gamma_ordinate, 0.0, epsilon = 1e-12);
            assert_relative_eq!(estimate.log_tau_ordinate, 0.0, epsilon = 1e-9);
            assert_relative_eq!(estimate.log_evidence, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn star_ordinates_use_posterior_concentrations() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut variants = Array3::<u32>::zeros((1, 1, NUM_BASES));
        variants[[0, 0, 0]] = 40;
        let mut state = ModelState::new(variants, SamplerConfig::default(), None, &mut rng).unwrap();

        state.mu.fill(0);
        state.mu[[0, 0, 0, 0]] = 30;
        state.mu[[0, 0, 0, 1]] = 10;
        state.star.gamma = array![[0.75, 0.25]];
        let expected = ln_gamma(40.2) - ln_gamma(30.1) - ln_gamma(10.1)
            + 29.1 * 0.75f64.ln()
            + 9.1 * 0.25f64.ln();
        assert_relative_eq!(state.gamma_star_ordinate(), expected, epsilon = 1e-9);

        // reads observed as a from true base b live in column b
        let mut e_totals = Array2::<f64>::zeros((NUM_BASES, NUM_BASES));
        e_totals[[0, 0]] = 20.0;
        e_totals[[1, 0]] = 1.0;
        state.star.eta = initial_eta();
        let row_zero = ln_gamma(21.4) - ln_gamma(20.1) - ln_gamma(1.1) - 2.0 * ln_gamma(0.1)
            + 19.1 * 0.97f64.ln()
            + 0.1 * 0.01f64.ln()
            - 2.0 * 0.9 * 0.01f64.ln();
        let flat_row = ln_gamma(0.4) - 4.0 * ln_gamma(0.1) - 0.9 * 0.97f64.ln() - 2.7 * 0.01f64.ln();
        assert_relative_eq!(
            state.eta_star_ordinate(&e_totals),
            row_zero + 3.0 * flat_row,
            epsilon = 1e-9
        );
    }
}
