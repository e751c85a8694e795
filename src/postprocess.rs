//! Posterior summaries, genome distances and degenerate-genome collapse.
use log::info;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::Rng;

use crate::error::{HaploError, Result};
use crate::likelihood::{state_log_probabilities, weighted_log_sum};
use crate::state::{tau_bases, tau_one, ModelState};
use crate::util::{sample_log_prob, softmax, NUM_BASES};

// ============================================================================
// Distances between haplotypes
// ============================================================================

/// Number of genomes whose base differs between two G x 4 site assignments
pub fn tau_dist(site1: ArrayView2<u8>, site2: ArrayView2<u8>) -> usize {
    site1
        .outer_iter()
        .zip(site2.outer_iter())
        .filter(|(a, b)| tau_one(a.view()) != tau_one(b.view()))
        .count()
}

/// Pairwise single-nucleotide differences between the genomes of one assignment
pub fn calculate_snd(tau: &Array3<u8>) -> Array2<usize> {
    let bases = tau_bases(tau);
    let n_genomes = bases.ncols();
    let mut snd = Array2::<usize>::zeros((n_genomes, n_genomes));
    for g in 0..n_genomes {
        for h in 0..g {
            let diff = bases
                .column(g)
                .iter()
                .zip(bases.column(h))
                .filter(|(a, b)| a != b)
                .count();
            snd[[g, h]] = diff;
            snd[[h, g]] = diff;
        }
    }
    snd
}

/// Single-nucleotide differences between every genome of `tau1` and every genome of `tau2`
pub fn comp_snd(tau1: &Array3<u8>, tau2: &Array3<u8>) -> Result<Array2<usize>> {
    if tau1.len_of(Axis(0)) != tau2.len_of(Axis(0)) {
        return Err(HaploError::shape(format!(
            "haplotype sets cover {} and {} variants",
            tau1.len_of(Axis(0)),
            tau2.len_of(Axis(0))
        )));
    }
    let bases1 = tau_bases(tau1);
    let bases2 = tau_bases(tau2);
    let snd = Array2::from_shape_fn((bases1.ncols(), bases2.ncols()), |(g, h)| {
        bases1
            .column(g)
            .iter()
            .zip(bases2.column(h))
            .filter(|(a, b)| a != b)
            .count()
    });
    Ok(snd)
}

/// Variants at which at least one genome differs from genome 0
pub fn variable_tau(tau: &Array3<u8>) -> Vec<bool> {
    let bases = tau_bases(tau);
    bases
        .outer_iter()
        .map(|row| row.iter().any(|&b| b != row[0]))
        .collect()
}

// ============================================================================
// Posterior summaries
// ============================================================================

impl ModelState {
    fn valid_iterations(&self) -> Result<usize> {
        match self.trace.completed {
            0 => Err(HaploError::config("no sampling iterations recorded")),
            n => Ok(n),
        }
    }

    /// Free parameters: one base per (variant, genome) plus G - 1 frequencies per sample
    pub fn calc_k(&self) -> usize {
        self.n_variants * self.n_genomes + self.n_samples * (self.n_genomes - 1)
    }

    pub fn mean_deviance(&self) -> Result<f64> {
        let n = self.valid_iterations()?;
        let mean_ll = self.trace.ll.slice(s![..n]).sum() / n as f64;
        Ok(-2.0 * mean_ll)
    }

    pub fn gamma_mean(&self) -> Result<Array2<f64>> {
        let n = self.valid_iterations()?;
        Ok(self.trace.gamma.slice(s![..n, .., ..]).sum_axis(Axis(0)) / n as f64)
    }

    pub fn eta_mean(&self) -> Result<Array2<f64>> {
        let n = self.valid_iterations()?;
        Ok(self.trace.eta.slice(s![..n, .., ..]).sum_axis(Axis(0)) / n as f64)
    }

    /// Fraction of valid iterations in which each (variant, genome) carried each base
    pub fn probabilistic_tau(&self) -> Result<Array3<f64>> {
        let n = self.valid_iterations()?;
        let sum = self
            .trace
            .tau
            .slice(s![..n, .., .., ..])
            .mapv(f64::from)
            .sum_axis(Axis(0));
        Ok(sum / n as f64)
    }

    /// Elementwise posterior mean of tau; identical to `probabilistic_tau`
    pub fn tau_mean(&self) -> Result<Array3<f64>> {
        self.probabilistic_tau()
    }

    /// Mean deviance plus twice the log-likelihood at the posterior means
    pub fn dic(&self) -> Result<f64> {
        let gamma_mean = self.gamma_mean()?;
        let eta_mean = self.eta_mean()?;
        let tau_mean = self.tau_mean()?;
        let ll_mean = self.log_likelihood(gamma_mean.view(), tau_mean.view(), eta_mean.view());
        Ok(self.mean_deviance()? + 2.0 * ll_mean)
    }

    /// Assign genome bases to new variants observed in the same samples, using
    /// the star gamma and eta. Returns the sampled haplotypes and, per variant,
    /// the probability of the most likely joint state.
    pub fn assign_tau<R: Rng + ?Sized>(
        &self,
        new_variants: ArrayView3<u32>,
        rng: &mut R,
    ) -> Result<(Array3<u8>, Vec<f64>)> {
        let (n_new, n_samples, n_bases) = new_variants.dim();
        if n_samples != self.n_samples || n_bases != NUM_BASES {
            return Err(HaploError::shape(format!(
                "new variants have shape ({}, {}, {}), expected (N, {}, {})",
                n_new, n_samples, n_bases, self.n_samples, NUM_BASES
            )));
        }
        let table = self.require_table()?;
        let site_log_prob = state_log_probabilities(table, self.star.gamma.view(), self.star.eta.view());

        let mut assigned = Array3::<u8>::zeros((n_new, self.n_genomes, NUM_BASES));
        let mut confidence = Vec::with_capacity(n_new);
        let mut state_log_prob = vec![0.0; table.n_states()];
        for (n, counts) in new_variants.outer_iter().enumerate() {
            for (t, log_p) in site_log_prob.iter().enumerate() {
                state_log_prob[t] = weighted_log_sum(counts, log_p.view());
            }
            let t = sample_log_prob(&state_log_prob, rng)?;
            let prob = softmax(&state_log_prob);
            confidence.push(prob.iter().cloned().fold(0.0, f64::max));
            assigned
                .index_axis_mut(Axis(0), n)
                .assign(&table.states.index_axis(Axis(0), t));
        }
        Ok((assigned, confidence))
    }

    /// Merge every genome identical at all variants to an earlier genome into it:
    /// frequencies are summed, the duplicate haplotype is dropped and all genome-sized
    /// structures are rebuilt. Returns the number of genomes removed.
    pub fn remove_degenerate(&mut self) -> Result<usize> {
        let snd = calculate_snd(&self.tau);
        let n_genomes = self.n_genomes;
        let mut deleted = vec![false; n_genomes];
        let mut merged: Vec<Vec<usize>> = vec![Vec::new(); n_genomes];
        for g in 0..n_genomes {
            if deleted[g] {
                continue;
            }
            for h in (g + 1)..n_genomes {
                if !deleted[h] && snd[[g, h]] == 0 {
                    deleted[h] = true;
                    merged[g].push(h);
                }
            }
        }
        let removed = deleted.iter().filter(|&&d| d).count();
        if removed == 0 {
            return Ok(0);
        }

        let kept: Vec<usize> = (0..n_genomes).filter(|&g| !deleted[g]).collect();
        let mut gamma = Array2::<f64>::zeros((self.n_samples, kept.len()));
        let mut tau = Array3::<u8>::zeros((self.n_variants, kept.len(), NUM_BASES));
        for (new_g, &g) in kept.iter().enumerate() {
            tau.index_axis_mut(Axis(1), new_g)
                .assign(&self.tau.index_axis(Axis(1), g));
            let mut column = gamma.column_mut(new_g);
            column.assign(&self.gamma.column(g));
            for &h in &merged[g] {
                column += &self.gamma.column(h);
            }
        }
        info!(
            "Collapsed {} degenerate genomes, {} remain",
            removed,
            kept.len()
        );
        self.rebuild(gamma, tau)?;
        Ok(removed)
    }
}
