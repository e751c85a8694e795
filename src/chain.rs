//! Markov chain driver: burn-in, sampling, fixed-tau and tau-only phases.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;
use log::{debug, info};
use ndarray::Axis;
use rand::Rng;

use crate::error::{HaploError, Result};
use crate::sampler::TauResampler;
use crate::state::{ModelState, StarState};

/// Shared sweep allowance. It only ever decreases, so a shutdown request
/// (`cancel`) takes effect at the next sweep boundary.
#[derive(Clone, Debug)]
pub struct IterationBudget {
    remaining: Arc<AtomicUsize>,
}

impl IterationBudget {
    pub fn new(sweeps: usize) -> Self {
        IterationBudget {
            remaining: Arc::new(AtomicUsize::new(sweeps)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Consume one sweep; false once the budget is exhausted
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn cancel(&self) {
        self.remaining.store(0, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainPhase {
    BurnIn,
    Sampling,
    FixedTauSampling,
    TauSampling,
    Done,
}

/// Drives one chain over a `ModelState`
pub struct GibbsSampler {
    pub state: ModelState,
    resampler: Box<dyn TauResampler>,
    budget: IterationBudget,
    phase: ChainPhase,
    show_progress: bool,
}

impl GibbsSampler {
    /// Chain with the haplotype update chosen by `config.tau_update`
    pub fn new(state: ModelState) -> Self {
        let resampler = state.config.tau_update.resampler(state.config.max_genomes);
        GibbsSampler {
            state,
            resampler,
            budget: IterationBudget::unlimited(),
            phase: ChainPhase::BurnIn,
            show_progress: false,
        }
    }

    /// Substitute the haplotype update
    pub fn with_resampler(mut self, resampler: Box<dyn TauResampler>) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn with_budget(mut self, budget: IterationBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn budget(&self) -> &IterationBudget {
        &self.budget
    }

    pub fn star(&self) -> &StarState {
        &self.state.star
    }

    pub fn into_state(self) -> ModelState {
        self.state
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if self.show_progress {
            ProgressBar::new(len as u64)
        } else {
            ProgressBar::hidden()
        }
    }

    /// One full sweep in the fixed order mu, gamma, tau, eta
    fn sweep<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.state.sample_mu(rng)?;
        self.state.sample_gamma(rng)?;
        let changed = self.state.sample_tau(self.resampler.as_ref(), rng)?;
        self.state.sample_eta(rng)?;
        Ok(changed)
    }

    fn record(&mut self, iter: usize) {
        let state = &mut self.state;
        let trace = &mut state.trace;
        trace.gamma.index_axis_mut(Axis(0), iter).assign(&state.gamma);
        trace.tau.index_axis_mut(Axis(0), iter).assign(&state.tau);
        trace.eta.index_axis_mut(Axis(0), iter).assign(&state.eta);
        trace.e.index_axis_mut(Axis(0), iter).assign(&state.e);
        trace.mu.index_axis_mut(Axis(0), iter).assign(&state.mu);
        trace.ll[iter] = state.ll;
        trace.lp[iter] = state.lp;
        trace.star_lp[iter] = state.star.lp;
        trace.completed = iter + 1;
    }

    /// Burn-in followed by sampling
    pub fn run<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.burn(rng)?;
        self.update(rng)
    }

    /// Haplotype-only sweeps at the current gamma and eta. From a fresh state
    /// this aligns the random tau with the starting error matrix before the
    /// first latent split.
    pub fn warm_tau<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.phase = ChainPhase::BurnIn;
        let n_iter = self.state.config.init_tau_iter;
        let mut done = 0;
        while done < n_iter && self.budget.try_take() {
            let changed = self.state.sample_tau(self.resampler.as_ref(), rng)?;
            debug!("Tau warm-up iter {}, no. changed = {}", done, changed);
            done += 1;
        }
        self.state.update_tau_indices();
        self.state.refresh_scores();
        Ok(done)
    }

    /// Haplotype warm-up, then full sweeps without recording, to move away from
    /// the random start
    pub fn burn<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.warm_tau(rng)?;
        self.phase = ChainPhase::BurnIn;
        let n_iter = self.state.config.burn_iter;
        let progress = self.progress_bar(n_iter);
        let mut done = 0;
        while done < n_iter && self.budget.try_take() {
            let changed = self.sweep(rng)?;
            self.state.refresh_scores();
            debug!(
                "Burn iter {}, no. changed = {}, ll = {:.4}, lp = {:.4}",
                done, changed, self.state.ll, self.state.lp
            );
            progress.inc(1);
            done += 1;
        }
        progress.finish_and_clear();
        Ok(done)
    }

    /// Recorded sweeps; tracks the star state. Returns the number of valid iterations.
    pub fn update<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.phase = ChainPhase::Sampling;
        self.sample_phase(rng, true)
    }

    /// Recorded sweeps with tau held at its current value
    pub fn update_fixed_tau<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.phase = ChainPhase::FixedTauSampling;
        self.sample_phase(rng, false)
    }

    fn sample_phase<R: Rng>(&mut self, rng: &mut R, sample_tau: bool) -> Result<usize> {
        let n_iter = self.state.trace.capacity();
        self.state.trace.completed = 0;
        self.state.refresh_scores();
        self.state.store_star(0);

        let progress = self.progress_bar(n_iter);
        let mut iter = 0;
        while iter < n_iter && self.budget.try_take() {
            let changed = if sample_tau {
                self.sweep(rng)?
            } else {
                self.state.sample_mu(rng)?;
                self.state.sample_gamma(rng)?;
                self.state.sample_eta(rng)?;
                0
            };
            self.state.refresh_scores();
            if self.state.lp > self.state.star.lp {
                self.state.store_star(iter);
            }
            self.record(iter);

            if iter % 10 == 0 {
                info!(
                    "Gibbs Iter {}, no. changed = {}, nlp = {:.4}",
                    iter, changed, self.state.lp
                );
            }
            progress.inc(1);
            iter += 1;
        }
        progress.finish_and_clear();
        self.state.update_tau_indices();
        self.phase = ChainPhase::Done;
        Ok(iter)
    }

    /// Haplotype-only sweeps at the star gamma and eta
    pub fn burn_tau<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        self.phase = ChainPhase::BurnIn;
        let n_iter = self.state.config.burn_iter;
        let mut done = 0;
        while done < n_iter && self.budget.try_take() {
            let state = &mut self.state;
            let changed = self.resampler.resample(
                &mut state.tau,
                state.star.gamma.view(),
                state.star.eta.view(),
                state.variants.view(),
                rng,
            )?;
            let ll = state.log_likelihood(state.star.gamma.view(), state.tau.view(), state.star.eta.view());
            let lp = ll + state.log_prior(state.star.gamma.view(), state.star.eta.view());
            state.ll = ll;
            state.lp = lp;
            debug!("Tau burn iter {}, no. changed = {}, lp = {:.4}", done, changed, lp);
            done += 1;
        }
        Ok(done)
    }

    /// Replay the haplotype sampler against the recorded gamma and eta trace,
    /// keeping the best tau by log-posterior
    pub fn update_tau<R: Rng>(&mut self, rng: &mut R) -> Result<usize> {
        let n_iter = self.state.trace.completed;
        if n_iter == 0 {
            return Err(HaploError::config(
                "tau-only sampling needs a recorded gamma/eta trace",
            ));
        }
        self.phase = ChainPhase::TauSampling;
        {
            let state = &mut self.state;
            let gamma0 = state.trace.gamma.index_axis(Axis(0), 0).to_owned();
            let eta0 = state.trace.eta.index_axis(Axis(0), 0).to_owned();
            state.lp = state.log_posterior(gamma0.view(), state.tau.view(), eta0.view());
            state.update_tau_indices();
            state.star = StarState {
                gamma: gamma0,
                tau: state.tau.clone(),
                tau_indices: state.tau_indices.clone(),
                eta: eta0,
                lp: state.lp,
                iter: 0,
            };
        }

        let mut iter = 0;
        while iter < n_iter && self.budget.try_take() {
            let state = &mut self.state;
            let gamma = state.trace.gamma.index_axis(Axis(0), iter).to_owned();
            let eta = state.trace.eta.index_axis(Axis(0), iter).to_owned();
            let changed = self.resampler.resample(
                &mut state.tau,
                gamma.view(),
                eta.view(),
                state.variants.view(),
                rng,
            )?;
            state.ll = state.log_likelihood(gamma.view(), state.tau.view(), eta.view());
            state.lp = state.ll + state.log_prior(gamma.view(), eta.view());
            if state.lp > state.star.lp {
                state.update_tau_indices();
                state.star = StarState {
                    gamma,
                    tau: state.tau.clone(),
                    tau_indices: state.tau_indices.clone(),
                    eta,
                    lp: state.lp,
                    iter,
                };
            }
            state.trace.tau.index_axis_mut(Axis(0), iter).assign(&state.tau);
            state.trace.ll[iter] = state.ll;
            state.trace.lp[iter] = state.lp;
            state.trace.star_lp[iter] = state.star.lp;

            if iter % 10 == 0 {
                info!("Gibbs Iter {}, no. changed = {}, nll = {:.4}", iter, changed, state.lp);
            }
            iter += 1;
        }
        self.state.trace.completed = iter;
        self.state.update_tau_indices();
        self.phase = ChainPhase::Done;
        Ok(iter)
    }
}
