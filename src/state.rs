//! Latent and parameter tensors of one Gibbs chain, with their trace buffers.
use ndarray::{Array1, Array2, Array3, Array4, Array5, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::config::SamplerConfig;
use crate::error::{HaploError, Result};
use crate::util::{cartesian, sample_dirichlet, NUM_BASES};

/// Index of the set entry of a one-hot base row
pub fn tau_one(row: ArrayView1<u8>) -> usize {
    row.iter().position(|&x| x == 1).unwrap_or(0)
}

/// Base assigned to every (variant, genome) pair
pub fn tau_bases(tau: &Array3<u8>) -> Array2<usize> {
    let (n_variants, n_genomes, _) = tau.dim();
    Array2::from_shape_fn((n_variants, n_genomes), |(v, g)| {
        tau_one(tau.slice(ndarray::s![v, g, ..]))
    })
}

/// One-hot tau from a (variant, genome) matrix of base indices
pub fn tau_from_bases(bases: &Array2<usize>) -> Array3<u8> {
    let (n_variants, n_genomes) = bases.dim();
    let mut tau = Array3::<u8>::zeros((n_variants, n_genomes, NUM_BASES));
    for ((v, g), &b) in bases.indexed_iter() {
        tau[[v, g, b]] = 1;
    }
    tau
}

// ============================================================================
// Joint state table
// ============================================================================

/// Exhaustive table of the `4^G` joint base assignments at one site.
/// Only built for G up to `SamplerConfig::max_genomes`.
#[derive(Clone, Debug)]
pub struct TauTable {
    /// n_states x G x 4 one-hot rows
    pub states: Array3<u8>,
    /// G x 4 place values, `map[g][a] = a * 4^(G-g-1)`
    pub map: Array2<usize>,
}

impl TauTable {
    pub fn new(genomes: usize) -> Self {
        let digits = cartesian(genomes);
        let mut states = Array3::<u8>::zeros((digits.len(), genomes, NUM_BASES));
        for (t, row) in digits.iter().enumerate() {
            for (g, &a) in row.iter().enumerate() {
                states[[t, g, a]] = 1;
            }
        }
        let map = Array2::from_shape_fn((genomes, NUM_BASES), |(g, a)| {
            a * NUM_BASES.pow((genomes - g - 1) as u32)
        });
        TauTable { states, map }
    }

    pub fn n_states(&self) -> usize {
        self.states.len_of(Axis(0))
    }

    /// Joint index of one site's G x 4 one-hot rows
    pub fn map_state(&self, site: ArrayView2<u8>) -> usize {
        self.map
            .iter()
            .zip(site.iter())
            .map(|(&m, &t)| m * t as usize)
            .sum()
    }
}

// ============================================================================
// Trace buffers and star snapshot
// ============================================================================

/// Per-iteration snapshots, pre-sized to the sampling iteration count
#[derive(Clone, Debug)]
pub struct TraceStore {
    pub gamma: Array3<f64>,
    pub tau: Array4<u8>,
    pub eta: Array3<f64>,
    pub e: Array5<u32>,
    pub mu: Array5<u32>,
    pub ll: Array1<f64>,
    pub lp: Array1<f64>,
    /// star log-posterior after each iteration
    pub star_lp: Array1<f64>,
    /// number of fully written iterations
    pub completed: usize,
}

impl TraceStore {
    pub fn new(max_iter: usize, n_variants: usize, n_samples: usize, n_genomes: usize) -> Self {
        TraceStore {
            gamma: Array3::zeros((max_iter, n_samples, n_genomes)),
            tau: Array4::zeros((max_iter, n_variants, n_genomes, NUM_BASES)),
            eta: Array3::zeros((max_iter, NUM_BASES, NUM_BASES)),
            e: Array5::zeros((max_iter, n_variants, n_samples, NUM_BASES, NUM_BASES)),
            mu: Array5::zeros((max_iter, n_variants, n_samples, NUM_BASES, n_genomes)),
            ll: Array1::zeros(max_iter),
            lp: Array1::zeros(max_iter),
            star_lp: Array1::from_elem(max_iter, f64::NEG_INFINITY),
            completed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ll.len()
    }
}

/// Highest log-posterior configuration seen so far, copied as one value
#[derive(Clone, Debug)]
pub struct StarState {
    pub gamma: Array2<f64>,
    pub tau: Array3<u8>,
    pub tau_indices: Array1<usize>,
    pub eta: Array2<f64>,
    pub lp: f64,
    pub iter: usize,
}

// ============================================================================
// Model state
// ============================================================================

/// All tensors of one chain. Samplers own the invariants of the tensors they write.
#[derive(Clone, Debug)]
pub struct ModelState {
    pub config: SamplerConfig,
    pub n_variants: usize,
    pub n_samples: usize,
    pub n_genomes: usize,
    /// V x S x 4 observed counts
    pub variants: Array3<u32>,
    pub alpha: Vec<f64>,
    pub delta: Vec<f64>,
    /// S x G genome frequencies
    pub gamma: Array2<f64>,
    /// V x G x 4 one-hot haplotypes
    pub tau: Array3<u8>,
    pub tau_indices: Array1<usize>,
    /// 4 x 4 error matrix, `[true base][observed base]`
    pub eta: Array2<f64>,
    /// V x S x 4 x 4 reads observed as `a` attributed to true base `b`
    pub e: Array4<u32>,
    /// V x S x 4 x G reads observed as `a` attributed to genome `g`
    pub mu: Array4<u32>,
    pub tau_table: Option<TauTable>,
    pub trace: TraceStore,
    pub star: StarState,
    pub ll: f64,
    pub lp: f64,
}

impl ModelState {
    /// Build a chain over a V x S x 4 count tensor. Gamma rows are drawn from
    /// Dirichlet(alpha); tau is drawn uniformly unless `fixed_tau` is given.
    pub fn new<R: Rng + ?Sized>(
        variants: Array3<u32>,
        config: SamplerConfig,
        fixed_tau: Option<Array3<u8>>,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let (n_variants, n_samples, n_bases) = variants.dim();
        if n_bases != NUM_BASES {
            return Err(HaploError::shape(format!(
                "count tensor must have {} symbol columns, got {}",
                NUM_BASES, n_bases
            )));
        }
        if n_variants == 0 || n_samples == 0 {
            return Err(HaploError::shape(format!(
                "count tensor is empty ({} variants x {} samples)",
                n_variants, n_samples
            )));
        }
        let n_genomes = config.genomes;

        let alpha = vec![config.alpha_constant; n_genomes];
        let delta = vec![config.delta_constant; NUM_BASES];

        let mut gamma = Array2::<f64>::zeros((n_samples, n_genomes));
        for mut row in gamma.rows_mut() {
            let draw = sample_dirichlet(&alpha, rng)?;
            row.assign(&Array1::from(draw));
        }

        let tau = match fixed_tau {
            Some(tau) => {
                check_tau(&tau, n_variants, n_genomes)?;
                tau
            }
            None => {
                let bases = Array2::from_shape_fn((n_variants, n_genomes), |_| {
                    rng.gen_range(0..NUM_BASES)
                });
                tau_from_bases(&bases)
            }
        };

        let eta = initial_eta();
        let tau_table = config.enumerable().then(|| TauTable::new(n_genomes));
        let trace = TraceStore::new(config.max_iter, n_variants, n_samples, n_genomes);
        let star = StarState {
            gamma: gamma.clone(),
            tau: tau.clone(),
            tau_indices: Array1::zeros(n_variants),
            eta: eta.clone(),
            lp: f64::NEG_INFINITY,
            iter: 0,
        };

        let mut state = ModelState {
            config,
            n_variants,
            n_samples,
            n_genomes,
            variants,
            alpha,
            delta,
            gamma,
            tau,
            tau_indices: Array1::zeros(n_variants),
            eta,
            e: Array4::zeros((n_variants, n_samples, NUM_BASES, NUM_BASES)),
            mu: Array4::zeros((n_variants, n_samples, NUM_BASES, n_genomes)),
            tau_table,
            trace,
            star,
            ll: 0.0,
            lp: 0.0,
        };
        state.update_tau_indices();
        state.star.tau_indices = state.tau_indices.clone();
        Ok(state)
    }

    /// Build from a flat row-major count buffer with declared dimensions
    pub fn from_flat<R: Rng + ?Sized>(
        counts: Vec<u32>,
        n_variants: usize,
        n_samples: usize,
        config: SamplerConfig,
        fixed_tau: Option<Array3<u8>>,
        rng: &mut R,
    ) -> Result<Self> {
        let found = counts.len();
        let variants = Array3::from_shape_vec((n_variants, n_samples, NUM_BASES), counts)
            .map_err(|_| {
                HaploError::shape(format!(
                    "{} counts do not fill {} variants x {} samples x {} symbols",
                    found, n_variants, n_samples, NUM_BASES
                ))
            })?;
        Self::new(variants, config, fixed_tau, rng)
    }

    /// Recompute the cached joint index of every variant
    pub fn update_tau_indices(&mut self) {
        if let Some(table) = &self.tau_table {
            for v in 0..self.n_variants {
                self.tau_indices[v] = table.map_state(self.tau.index_axis(Axis(0), v));
            }
        }
    }

    /// Copy the current parameters into the star snapshot
    pub fn store_star(&mut self, iter: usize) {
        self.update_tau_indices();
        self.star = StarState {
            gamma: self.gamma.clone(),
            tau: self.tau.clone(),
            tau_indices: self.tau_indices.clone(),
            eta: self.eta.clone(),
            lp: self.lp,
            iter,
        };
    }

    /// Replace the genome dimension. Every G-sized table, latent tensor and trace
    /// buffer is reallocated together and the star snapshot restarts from the new state.
    pub fn rebuild(&mut self, gamma: Array2<f64>, tau: Array3<u8>) -> Result<()> {
        let n_genomes = gamma.ncols();
        if gamma.nrows() != self.n_samples {
            return Err(HaploError::shape(format!(
                "gamma has {} rows, expected {} samples",
                gamma.nrows(),
                self.n_samples
            )));
        }
        check_tau(&tau, self.n_variants, n_genomes)?;

        self.n_genomes = n_genomes;
        self.config.genomes = n_genomes;
        self.alpha = vec![self.config.alpha_constant; n_genomes];
        self.gamma = gamma;
        self.tau = tau;
        self.mu = Array4::zeros((self.n_variants, self.n_samples, NUM_BASES, n_genomes));
        self.e = Array4::zeros((self.n_variants, self.n_samples, NUM_BASES, NUM_BASES));
        self.tau_table = self.config.enumerable().then(|| TauTable::new(n_genomes));
        self.trace = TraceStore::new(self.config.max_iter, self.n_variants, self.n_samples, n_genomes);
        self.update_tau_indices();
        self.store_star(0);
        self.star.lp = f64::NEG_INFINITY;
        Ok(())
    }

    /// Joint state table, or a configuration error when G is above the enumeration limit
    pub fn require_table(&self) -> Result<&TauTable> {
        self.tau_table.as_ref().ok_or_else(|| {
            HaploError::config(format!(
                "{} genomes exceed max_genomes = {}; the 4^G state table is not built",
                self.n_genomes, self.config.max_genomes
            ))
        })
    }
}

/// Starting error matrix: 0.97 on the diagonal, 0.01 elsewhere
pub fn initial_eta() -> Array2<f64> {
    Array2::from_shape_fn((NUM_BASES, NUM_BASES), |(a, b)| {
        if a == b {
            0.97
        } else {
            0.01
        }
    })
}

fn check_tau(tau: &Array3<u8>, n_variants: usize, n_genomes: usize) -> Result<()> {
    if tau.dim() != (n_variants, n_genomes, NUM_BASES) {
        return Err(HaploError::shape(format!(
            "tau has shape {:?}, expected ({}, {}, {})",
            tau.dim(),
            n_variants,
            n_genomes,
            NUM_BASES
        )));
    }
    for lane in tau.lanes(Axis(2)) {
        let ones = lane.iter().filter(|&&x| x == 1).count();
        let others = lane.iter().filter(|&&x| x > 1).count();
        if ones != 1 || others != 0 {
            return Err(HaploError::shape("tau rows must be one-hot"));
        }
    }
    Ok(())
}
