//! Gibbs conditional updates for gamma, eta, the latent origin counts and tau.
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayViewMut2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

use crate::config::TauUpdate;
use crate::error::Result;
use crate::likelihood::{state_log_probabilities, weighted_log_sum};
use crate::postprocess::tau_dist;
use crate::state::{tau_one, ModelState, TauTable};
use crate::util::{normalise_log_prob, sample_dirichlet, sample_log_prob, sample_multinomial, NUM_BASES};

// ============================================================================
// Haplotype resampling
// ============================================================================

/// Outcome of resampling the genomes of one variant
#[derive(Clone, Debug)]
pub struct SiteDraw {
    /// genomes whose base changed
    pub changed: usize,
    /// normalised log probabilities of the four bases for the first resampled genome
    pub first_log_prob: [f64; NUM_BASES],
}

/// Resample genomes `first..G` at one site in order, each conditional on the
/// current bases of all other genomes.
pub fn resample_site<R: Rng + ?Sized>(
    site: &mut ArrayViewMut2<u8>,
    counts: ArrayView2<u32>,
    gamma: ArrayView2<f64>,
    eta: ArrayView2<f64>,
    first: usize,
    rng: &mut R,
) -> Result<SiteDraw> {
    let n_samples = gamma.nrows();
    let n_genomes = gamma.ncols();

    // current predicted symbol probabilities, S x 4
    let mut mix = Array2::<f64>::zeros((n_samples, NUM_BASES));
    let bases: Vec<usize> = (0..n_genomes).map(|g| tau_one(site.row(g))).collect();
    for (g, &b) in bases.iter().enumerate() {
        for s in 0..n_samples {
            for a in 0..NUM_BASES {
                mix[[s, a]] += gamma[[s, g]] * eta[[b, a]];
            }
        }
    }

    let mut changed = 0;
    let mut first_log_prob = [0.0; NUM_BASES];
    for g in first..n_genomes {
        let current = bases[g];
        let mut state_log_prob = [0.0; NUM_BASES];
        for (k, lp) in state_log_prob.iter_mut().enumerate() {
            let mut total = 0.0;
            for s in 0..n_samples {
                for a in 0..NUM_BASES {
                    let c = counts[[s, a]];
                    if c == 0 {
                        continue;
                    }
                    let p = mix[[s, a]] - gamma[[s, g]] * eta[[current, a]] + gamma[[s, g]] * eta[[k, a]];
                    total += c as f64 * p.max(f64::MIN_POSITIVE).ln();
                }
            }
            *lp = total;
        }
        if g == first {
            let norm = normalise_log_prob(&state_log_prob);
            first_log_prob.copy_from_slice(&norm);
        }

        let chosen = sample_log_prob(&state_log_prob, rng)?;
        if chosen != current {
            changed += 1;
            site.row_mut(g).fill(0);
            site[[g, chosen]] = 1;
            for s in 0..n_samples {
                for a in 0..NUM_BASES {
                    mix[[s, a]] += gamma[[s, g]] * (eta[[chosen, a]] - eta[[current, a]]);
                }
            }
        }
    }
    Ok(SiteDraw {
        changed,
        first_log_prob,
    })
}

/// Replaceable haplotype update: resample every (variant, genome) of `tau` in
/// place and return how many assignments changed.
pub trait TauResampler: Send + Sync {
    fn resample(
        &self,
        tau: &mut Array3<u8>,
        gamma: ArrayView2<f64>,
        eta: ArrayView2<f64>,
        variants: ArrayView3<u32>,
        rng: &mut dyn RngCore,
    ) -> Result<usize>;
}

/// Single-threaded resampler drawing from the caller's generator in variant order
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialTauResampler;

impl TauResampler for SequentialTauResampler {
    fn resample(
        &self,
        tau: &mut Array3<u8>,
        gamma: ArrayView2<f64>,
        eta: ArrayView2<f64>,
        variants: ArrayView3<u32>,
        rng: &mut dyn RngCore,
    ) -> Result<usize> {
        let mut changed = 0;
        for (mut site, counts) in tau.outer_iter_mut().zip(variants.outer_iter()) {
            changed += resample_site(&mut site, counts, gamma, eta, 0, rng)?.changed;
        }
        Ok(changed)
    }
}

/// Resamples variants on the rayon pool. One seed per variant is drawn from the
/// caller's generator up front, so the result does not depend on scheduling.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelTauResampler;

impl TauResampler for ParallelTauResampler {
    fn resample(
        &self,
        tau: &mut Array3<u8>,
        gamma: ArrayView2<f64>,
        eta: ArrayView2<f64>,
        variants: ArrayView3<u32>,
        rng: &mut dyn RngCore,
    ) -> Result<usize> {
        let n_variants = tau.len_of(Axis(0));
        let seeds: Vec<u64> = (0..n_variants).map(|_| rng.next_u64()).collect();
        let snapshot = tau.view();

        let sites: Vec<(Array2<u8>, usize)> = (0..n_variants)
            .into_par_iter()
            .map(|v| {
                let mut site = snapshot.index_axis(Axis(0), v).to_owned();
                let mut local = StdRng::seed_from_u64(seeds[v]);
                let draw = resample_site(
                    &mut site.view_mut(),
                    variants.index_axis(Axis(0), v),
                    gamma,
                    eta,
                    0,
                    &mut local,
                )?;
                Ok((site, draw.changed))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut changed = 0;
        for (v, (site, n)) in sites.into_iter().enumerate() {
            tau.index_axis_mut(Axis(0), v).assign(&site);
            changed += n;
        }
        Ok(changed)
    }
}

/// Draw the joint assignment of every genome at one site from the `4^G` states,
/// given the per-state log symbol probabilities. Returns the genomes whose base changed.
pub fn resample_site_joint<R: Rng + ?Sized>(
    site: &mut ArrayViewMut2<u8>,
    counts: ArrayView2<u32>,
    table: &TauTable,
    state_log_prob: &[Array2<f64>],
    rng: &mut R,
) -> Result<usize> {
    let log_prob: Vec<f64> = state_log_prob
        .iter()
        .map(|log_p| weighted_log_sum(counts, log_p.view()))
        .collect();
    let t = sample_log_prob(&log_prob, rng)?;
    let chosen = table.states.index_axis(Axis(0), t);
    let changed = tau_dist(site.view(), chosen);
    site.assign(&chosen);
    Ok(changed)
}

/// Resamples each variant's genomes jointly from the exhaustive state table, so
/// a site can move between any two assignments in one draw. Above `max_genomes`
/// the table is not built and genomes are resampled one at a time.
#[derive(Clone, Copy, Debug)]
pub struct JointTauResampler {
    pub max_genomes: usize,
}

impl TauResampler for JointTauResampler {
    fn resample(
        &self,
        tau: &mut Array3<u8>,
        gamma: ArrayView2<f64>,
        eta: ArrayView2<f64>,
        variants: ArrayView3<u32>,
        rng: &mut dyn RngCore,
    ) -> Result<usize> {
        let n_genomes = gamma.ncols();
        if n_genomes > self.max_genomes {
            return SequentialTauResampler.resample(tau, gamma, eta, variants, rng);
        }
        let table = TauTable::new(n_genomes);
        let state_log_prob = state_log_probabilities(&table, gamma, eta);
        let mut changed = 0;
        for (mut site, counts) in tau.outer_iter_mut().zip(variants.outer_iter()) {
            changed += resample_site_joint(&mut site, counts, &table, &state_log_prob, rng)?;
        }
        Ok(changed)
    }
}

impl TauUpdate {
    pub fn resampler(self, max_genomes: usize) -> Box<dyn TauResampler> {
        match self {
            TauUpdate::Site => Box::new(JointTauResampler { max_genomes }),
            TauUpdate::Genome => Box::new(SequentialTauResampler),
            TauUpdate::ParallelGenome => Box::new(ParallelTauResampler),
        }
    }
}

// ============================================================================
// Latent origin counts
// ============================================================================

/// Two-stage multinomial split of the observed counts: first across true bases
/// (into `e`), then each true-base share across genomes (summed into `mu`).
pub fn sample_origin<R: Rng + ?Sized>(
    variants: ArrayView3<u32>,
    tau: ArrayView3<u8>,
    gamma: ArrayView2<f64>,
    eta: ArrayView2<f64>,
    e: &mut Array4<u32>,
    mu: &mut Array4<u32>,
    rng: &mut R,
) -> Result<()> {
    let (n_variants, n_samples, _) = variants.dim();
    let n_genomes = gamma.ncols();
    // [observed a][true b][genome g]
    let mut tge = Array3::<f64>::zeros((NUM_BASES, NUM_BASES, n_genomes));
    let mut trans = vec![0.0; NUM_BASES];

    for v in 0..n_variants {
        let bases: Vec<usize> = (0..n_genomes)
            .map(|g| tau_one(tau.slice(ndarray::s![v, g, ..])))
            .collect();
        for s in 0..n_samples {
            tge.fill(0.0);
            for (g, &b) in bases.iter().enumerate() {
                for a in 0..NUM_BASES {
                    tge[[a, b, g]] = gamma[[s, g]] * eta[[b, a]];
                }
            }
            for a in 0..NUM_BASES {
                for (b, t) in trans.iter_mut().enumerate() {
                    *t = tge.slice(ndarray::s![a, b, ..]).sum();
                }
                let split = sample_multinomial(variants[[v, s, a]], &trans, rng)?;
                let mut genome_counts = vec![0u32; n_genomes];
                for (b, &n) in split.iter().enumerate() {
                    e[[v, s, a, b]] = n;
                    if n > 0 {
                        let weights = tge.slice(ndarray::s![a, b, ..]).to_vec();
                        let draw = sample_multinomial(n, &weights, rng)?;
                        for (acc, d) in genome_counts.iter_mut().zip(draw) {
                            *acc += d;
                        }
                    }
                }
                for (g, n) in genome_counts.into_iter().enumerate() {
                    mu[[v, s, a, g]] = n;
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Conditional updates on the model state
// ============================================================================

impl ModelState {
    /// Resample `mu` and `e` at the current tau, gamma and eta
    pub fn sample_mu<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        sample_origin(
            self.variants.view(),
            self.tau.view(),
            self.gamma.view(),
            self.eta.view(),
            &mut self.e,
            &mut self.mu,
            rng,
        )
    }

    /// Genome reads per sample, S x G, summed from `mu` over variants and symbols
    pub fn mu_sample_totals(&self) -> Array2<f64> {
        self.mu
            .sum_axis(Axis(2))
            .sum_axis(Axis(0))
            .mapv(|x| x as f64)
    }

    /// Reads observed as `a` from true base `b`, summed over variants and samples
    pub fn e_totals(&self) -> Array2<f64> {
        self.e.sum_axis(Axis(1)).sum_axis(Axis(0)).mapv(|x| x as f64)
    }

    /// Draw every gamma row from Dirichlet(alpha + genome counts), then floor at
    /// epsilon and renormalise
    pub fn sample_gamma<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let totals = self.mu_sample_totals();
        for s in 0..self.n_samples {
            let concentration: Vec<f64> = self
                .alpha
                .iter()
                .zip(totals.row(s))
                .map(|(a, t)| a + t)
                .collect();
            let draw = sample_dirichlet(&concentration, rng)?;
            self.gamma.row_mut(s).assign(&Array1::from(draw));
        }
        floor_and_normalise(&mut self.gamma, self.config.epsilon);
        Ok(())
    }

    /// Draw every eta row (true base `b`) from Dirichlet(delta + reads from `b`)
    pub fn sample_eta<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let totals = self.e_totals();
        for b in 0..NUM_BASES {
            let concentration: Vec<f64> = self
                .delta
                .iter()
                .zip(totals.column(b))
                .map(|(d, t)| d + t)
                .collect();
            let draw = sample_dirichlet(&concentration, rng)?;
            self.eta.row_mut(b).assign(&Array1::from(draw));
        }
        Ok(())
    }

    /// Resample tau at the current gamma and eta
    pub fn sample_tau(&mut self, resampler: &dyn TauResampler, rng: &mut dyn RngCore) -> Result<usize> {
        resampler.resample(
            &mut self.tau,
            self.gamma.view(),
            self.eta.view(),
            self.variants.view(),
            rng,
        )
    }

    /// Resample genomes `h..G` of `working` at every variant, holding genomes
    /// below `h` fixed. Returns the V x 4 normalised log probabilities of genome `h`.
    pub fn sample_tau_from<R: Rng + ?Sized>(
        &self,
        working: &mut Array3<u8>,
        h: usize,
        gamma: ArrayView2<f64>,
        eta: ArrayView2<f64>,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let mut log_prob = Array2::<f64>::zeros((self.n_variants, NUM_BASES));
        for (v, (mut site, counts)) in working
            .outer_iter_mut()
            .zip(self.variants.outer_iter())
            .enumerate()
        {
            let draw = resample_site(&mut site, counts, gamma, eta, h, rng)?;
            log_prob.row_mut(v).assign(&Array1::from(draw.first_log_prob.to_vec()));
        }
        Ok(log_prob)
    }
}

fn floor_and_normalise(gamma: &mut Array2<f64>, epsilon: f64) {
    gamma.mapv_inplace(|x| x.max(epsilon));
    for mut row in gamma.rows_mut() {
        let total = row.sum();
        row.mapv_inplace(|x| x / total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerConfig;
    use crate::state::tau_from_bases;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn small_state(seed: u64) -> (ModelState, StdRng) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut variants = Array3::<u32>::zeros((6, 3, 4));
        for v in 0..6 {
            for s in 0..3 {
                variants[[v, s, v % 4]] = 20 + s as u32;
                variants[[v, s, (v + 1) % 4]] = 5;
            }
        }
        let state = ModelState::new(variants, SamplerConfig::with_genomes(2), None, &mut rng).unwrap();
        (state, rng)
    }

    #[test]
    fn origin_split_conserves_counts() {
        let (mut state, mut rng) = small_state(1);
        state.sample_mu(&mut rng).unwrap();
        for v in 0..state.n_variants {
            for s in 0..state.n_samples {
                let mut site_total = 0;
                for a in 0..NUM_BASES {
                    let e_sum: u32 = (0..NUM_BASES).map(|b| state.e[[v, s, a, b]]).sum();
                    let mu_sum: u32 = (0..state.n_genomes).map(|g| state.mu[[v, s, a, g]]).sum();
                    assert_eq!(e_sum, state.variants[[v, s, a]]);
                    assert_eq!(mu_sum, state.variants[[v, s, a]]);
                    site_total += mu_sum;
                }
                let observed: u32 = (0..NUM_BASES).map(|a| state.variants[[v, s, a]]).sum();
                assert_eq!(site_total, observed);
            }
        }
    }

    #[test]
    fn gamma_and_eta_rows_stay_on_simplex() {
        let (mut state, mut rng) = small_state(2);
        for _ in 0..5 {
            state.sample_mu(&mut rng).unwrap();
            state.sample_gamma(&mut rng).unwrap();
            state.sample_eta(&mut rng).unwrap();
            for row in state.gamma.rows() {
                assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
                assert!(row.iter().all(|&x| x > 0.0));
            }
            for row in state.eta.rows() {
                assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn epsilon_floor_lifts_vanishing_frequencies() {
        let mut gamma = array![[1.0, 0.0, 0.0]];
        floor_and_normalise(&mut gamma, 1.0e-3);
        assert!(gamma[[0, 1]] > 0.0);
        assert_relative_eq!(gamma.row(0).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn tau_stays_one_hot_under_both_resamplers() {
        let (mut state, mut rng) = small_state(3);
        state.sample_tau(&SequentialTauResampler, &mut rng).unwrap();
        for lane in state.tau.lanes(Axis(2)) {
            assert_eq!(lane.iter().map(|&x| x as u32).sum::<u32>(), 1);
        }
        state.sample_tau(&ParallelTauResampler, &mut rng).unwrap();
        for lane in state.tau.lanes(Axis(2)) {
            assert_eq!(lane.iter().map(|&x| x as u32).sum::<u32>(), 1);
        }
    }

    #[test]
    fn parallel_resampler_is_reproducible() {
        let (state, _) = small_state(4);
        let mut first = state.clone();
        let mut second = state.clone();
        let mut rng_a = StdRng::seed_from_u64(77);
        let mut rng_b = StdRng::seed_from_u64(77);
        let n_a = first.sample_tau(&ParallelTauResampler, &mut rng_a).unwrap();
        let n_b = second.sample_tau(&ParallelTauResampler, &mut rng_b).unwrap();
        assert_eq!(n_a, n_b);
        assert_eq!(first.tau, second.tau);
    }

    #[test]
    fn strong_signal_pins_single_genome() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut site = tau_from_bases(&array![[0usize]]);
        let counts = array![[0u32, 0, 100, 0]];
        let gamma = array![[1.0]];
        let eta = crate::state::initial_eta();
        for _ in 0..10 {
            let mut view = site.index_axis_mut(Axis(0), 0);
            let draw = resample_site(&mut view, counts.view(), gamma.view(), eta.view(), 0, &mut rng).unwrap();
            assert_relative_eq!(draw.first_log_prob.iter().map(|x| x.exp()).sum::<f64>(), 1.0, epsilon = 1e-9);
        }
        assert_eq!(site[[0, 0, 2]], 1);
    }

    #[test]
    fn joint_draw_swaps_both_genomes_at_once() {
        let mut rng = StdRng::seed_from_u64(8);
        // genome 0 dominates sample 0 and carries G, genome 1 dominates sample 1 and carries T
        let gamma = array![[0.8, 0.2], [0.2, 0.8]];
        let eta = crate::state::initial_eta();
        let mut variants = Array3::<u32>::zeros((1, 2, 4));
        variants[[0, 0, 2]] = 80;
        variants[[0, 0, 3]] = 20;
        variants[[0, 1, 2]] = 20;
        variants[[0, 1, 3]] = 80;
        let mut tau = tau_from_bases(&array![[3usize, 2]]);

        let resampler = JointTauResampler { max_genomes: 6 };
        let changed = resampler
            .resample(&mut tau, gamma.view(), eta.view(), variants.view(), &mut rng)
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(tau, tau_from_bases(&array![[2usize, 3]]));
    }

    #[test]
    fn joint_resampler_falls_back_above_table_limit() {
        let (state, _) = small_state(9);
        let mut joint = state.clone();
        let mut single = state.clone();
        let mut rng_a = StdRng::seed_from_u64(21);
        let mut rng_b = StdRng::seed_from_u64(21);
        joint
            .sample_tau(&JointTauResampler { max_genomes: 1 }, &mut rng_a)
            .unwrap();
        single.sample_tau(&SequentialTauResampler, &mut rng_b).unwrap();
        assert_eq!(joint.tau, single.tau);
    }

    #[test]
    fn joint_resampler_keeps_tau_one_hot() {
        let (mut state, mut rng) = small_state(10);
        let resampler = TauUpdate::Site.resampler(state.config.max_genomes);
        for _ in 0..3 {
            resampler
                .resample(
                    &mut state.tau,
                    state.gamma.view(),
                    state.eta.view(),
                    state.variants.view(),
                    &mut rng,
                )
                .unwrap();
            for lane in state.tau.lanes(Axis(2)) {
                assert_eq!(lane.iter().map(|&x| x as u32).sum::<u32>(), 1);
            }
        }
    }

    #[test]
    fn fixed_prefix_genomes_are_untouched() {
        let (state, mut rng) = small_state(6);
        let mut working = state.tau.clone();
        let before = working.index_axis(Axis(1), 0).to_owned();
        let log_prob = state
            .sample_tau_from(&mut working, 1, state.gamma.view(), state.eta.view(), &mut rng)
            .unwrap();
        assert_eq!(working.index_axis(Axis(1), 0), before);
        assert_eq!(log_prob.dim(), (state.n_variants, NUM_BASES));
    }
}
