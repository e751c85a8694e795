// run the Gibbs sampler for each candidate number of genomes
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::chain::GibbsSampler;
use crate::config::SamplerConfig;
use crate::error::{HaploError, Result};
use crate::io::{self, VariantTable};
use crate::marginal::{MarginalEstimate, MarginalEstimator};
use crate::postprocess::calculate_snd;
use crate::state::ModelState;

pub struct RunOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub genomes: Vec<usize>,
    pub config: SamplerConfig,
    pub fixed_tau: Option<PathBuf>,
    /// hold the supplied tau fixed instead of using it as a starting point
    pub fixed: bool,
    pub remove_degenerate: bool,
    pub estimator: Option<MarginalEstimator>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub genomes_requested: usize,
    pub genomes: usize,
    pub variants: usize,
    pub samples: usize,
    pub config: SamplerConfig,
    pub completed: usize,
    pub iter_star: usize,
    pub lp_star: f64,
    pub k: usize,
    pub mean_deviance: f64,
    pub dic: f64,
    pub marginal: Option<MarginalEstimate>,
    pub snd: Vec<Vec<usize>>,
}

/// Fit one chain at `genomes` and collect its state
pub fn fit(
    table: &VariantTable,
    genomes: usize,
    options: &RunOptions,
    fixed_tau: Option<ndarray::Array3<u8>>,
    show_progress: bool,
) -> Result<(ModelState, RunSummary)> {
    let config = SamplerConfig {
        genomes,
        seed: options.config.seed.wrapping_add(genomes as u64),
        ..options.config.clone()
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    let state = ModelState::new(table.counts.clone(), config, fixed_tau, &mut rng)?;
    let mut chain = GibbsSampler::new(state).with_progress(show_progress);

    info!("G = {}: sampling {} variants in {} samples", genomes, table.n_variants(), table.n_samples());
    if options.fixed {
        chain.update_fixed_tau(&mut rng)?;
    } else {
        chain.run(&mut rng)?;
        if options.remove_degenerate && chain.state.remove_degenerate()? > 0 {
            info!("G = {}: resampling with {} genomes", genomes, chain.state.n_genomes);
            chain.update(&mut rng)?;
        }
    }

    let mut state = chain.into_state();
    let marginal = match options.estimator {
        Some(estimator) => match state.marginal_log_likelihood(estimator, &mut rng) {
            Ok(estimate) => Some(estimate),
            Err(e) => {
                warn!("G = {}: marginal likelihood not computed: {}", genomes, e);
                None
            }
        },
        None => None,
    };

    let snd = calculate_snd(&state.star.tau);
    let summary = RunSummary {
        genomes_requested: genomes,
        genomes: state.n_genomes,
        variants: state.n_variants,
        samples: state.n_samples,
        config: state.config.clone(),
        completed: state.trace.completed,
        iter_star: state.star.iter,
        lp_star: state.star.lp,
        k: state.calc_k(),
        mean_deviance: state.mean_deviance()?,
        dic: state.dic()?,
        marginal,
        snd: snd.outer_iter().map(|row| row.to_vec()).collect(),
    };
    Ok((state, summary))
}

fn write_outputs(dir: &Path, table: &VariantTable, state: &ModelState, summary: &RunSummary) -> Result<()> {
    fs::create_dir_all(dir)?;
    let genomes = io::genome_labels(state.n_genomes);
    let bases = io::base_labels();

    io::write_matrix(&dir.join("gamma_star.csv"), "Sample", &table.sample_names, &genomes, state.star.gamma.view())?;
    io::write_matrix(&dir.join("gamma_mean.csv"), "Sample", &table.sample_names, &genomes, state.gamma_mean()?.view())?;
    io::write_matrix(&dir.join("eta_star.csv"), "True", &bases, &bases, state.star.eta.view())?;
    io::write_matrix(&dir.join("eta_mean.csv"), "True", &bases, &bases, state.eta_mean()?.view())?;
    io::write_tau(&dir.join("tau_star.csv"), table, &state.star.tau)?;
    io::write_tau_prob(&dir.join("tau_prob.csv"), table, &state.probabilistic_tau()?)?;

    let n = state.trace.completed;
    io::write_trace(
        &dir.join("ll_trace.csv"),
        state.trace.ll.slice(ndarray::s![..n]),
        state.trace.lp.slice(ndarray::s![..n]),
    )?;
    let file = fs::File::create(dir.join("summary.json"))?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}

pub fn start(options: &RunOptions) -> Result<()> {
    options.config.validate()?;
    if options.genomes.is_empty() {
        return Err(HaploError::config("no genome counts requested"));
    }
    let table = io::read_variant_table(&options.input)?;
    info!(
        "Loaded {} variants across {} samples from {}",
        table.n_variants(),
        table.n_samples(),
        options.input.display()
    );
    let fixed_tau = match &options.fixed_tau {
        Some(path) => Some(io::read_tau(path)?),
        None => None,
    };
    if options.fixed && fixed_tau.is_none() {
        return Err(HaploError::config("--fixed requires --fixed-tau"));
    }

    let show_progress = options.genomes.len() == 1;
    let summaries: Vec<RunSummary> = options
        .genomes
        .par_iter()
        .map(|&g| {
            let (state, summary) = fit(&table, g, options, fixed_tau.clone(), show_progress)?;
            let dir = options.output_dir.join(format!("G{}", g));
            write_outputs(&dir, &table, &state, &summary)?;
            Ok(summary)
        })
        .collect::<Result<Vec<_>>>()?;

    for summary in &summaries {
        let evidence = summary
            .marginal
            .as_ref()
            .map(|m| format!("{:.4}", m.log_evidence))
            .unwrap_or_else(|| "NA".to_string());
        println!(
            "G={} (kept {}): DIC {:.4}, mean deviance {:.4}, log evidence {}",
            summary.genomes_requested, summary.genomes, summary.dic, summary.mean_deviance, evidence
        );
    }
    Ok(())
}
