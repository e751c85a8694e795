use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, LevelFilter};

use haplosnp::config::{SamplerConfig, TauUpdate};
use haplosnp::marginal::MarginalEstimator;
use haplosnp::{compare, run};

#[derive(Debug, Parser)]
#[clap(name = "haplosnp")]
#[clap(about = "Gibbs sampling of strain haplotypes from per-sample variant counts.", long_about = None)]

struct Cli {
    /// increase logging verbosity (-v debug, -vv trace)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Estimator {
    /// tau ordinate from the stored trace over all 4^G joint states
    Stored,
    /// per-genome auxiliary tau sweeps
    Auxiliary,
    /// skip the marginal likelihood
    Skip,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TauMove {
    /// all genomes of a variant jointly (genome by genome above --max-genomes)
    Site,
    /// one genome at a time
    Genome,
    /// one genome at a time, variants across threads
    Parallel,
}

#[derive(Debug, Subcommand)]

enum Commands {
    /// Infer haplotypes, frequencies and error rates for each number of genomes
    #[clap(arg_required_else_help = true)]
    Run {
        /// count table: Contig, Position, then A,C,G,T columns per sample
        #[clap(short, long, value_parser, required = true)]
        input: PathBuf,

        /// output directory, one G<n> subdirectory per genome count
        #[clap(short, long, value_parser, required = true)]
        output_dir: PathBuf,

        /// numbers of genomes to fit
        #[clap(short, long, value_parser, num_args = 1.., default_value = "2")]
        genomes: Vec<usize>,

        /// burn-in sweeps
        #[clap(short, long, value_parser, default_value_t = 250)]
        burn_iter: usize,

        /// recorded sampling sweeps
        #[clap(short, long, value_parser, default_value_t = 250)]
        max_iter: usize,

        /// Dirichlet concentration on genome frequencies
        #[clap(long, value_parser, default_value_t = 0.1)]
        alpha: f64,

        /// Dirichlet concentration on error-matrix rows
        #[clap(long, value_parser, default_value_t = 0.1)]
        delta: f64,

        /// floor on sampled genome frequencies
        #[clap(long, value_parser, default_value_t = 1.0e-6)]
        epsilon: f64,

        /// largest genome count for the exhaustive 4^G state table
        #[clap(long, value_parser, default_value_t = 6)]
        max_genomes: usize,

        /// random seed; chain G uses seed + G
        #[clap(short, long, value_parser, default_value_t = 42)]
        seed: u64,

        /// haplotype CSV used as the starting tau
        #[clap(long, value_parser)]
        fixed_tau: Option<PathBuf>,

        /// hold --fixed-tau fixed and sample only frequencies and errors
        #[clap(long)]
        fixed: bool,

        /// merge genomes identical at every variant and resample
        #[clap(long)]
        remove_degenerate: bool,

        /// marginal likelihood estimator
        #[clap(long, value_enum, default_value_t = Estimator::Auxiliary)]
        estimator: Estimator,

        /// haplotype update used in every sweep
        #[clap(long, value_enum, default_value_t = TauMove::Site)]
        tau_update: TauMove,

        /// haplotype-only sweeps at the starting frequencies and errors before burn-in
        #[clap(long, value_parser, default_value_t = 10)]
        init_tau_iter: usize,
    },

    /// Single-nucleotide differences between two haplotype sets
    #[clap(arg_required_else_help = true)]
    Compare {
        /// first haplotype CSV
        #[clap(short, long, value_parser, required = true)]
        first: PathBuf,

        /// second haplotype CSV
        #[clap(short, long, value_parser, required = true)]
        second: PathBuf,

        /// output CSV for the difference matrix
        #[clap(short, long, value_parser, required = true)]
        output: PathBuf,
    },
}

fn main() {
    let args = Cli::parse();

    let filter_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(filter_level)
        .init();

    let result = match args.command {
        Commands::Run {
            input,
            output_dir,
            genomes,
            burn_iter,
            max_iter,
            alpha,
            delta,
            epsilon,
            max_genomes,
            seed,
            fixed_tau,
            fixed,
            remove_degenerate,
            estimator,
            tau_update,
            init_tau_iter,
        } => {
            let config = SamplerConfig {
                burn_iter,
                max_iter,
                alpha_constant: alpha,
                delta_constant: delta,
                epsilon,
                max_genomes,
                tau_update: match tau_update {
                    TauMove::Site => TauUpdate::Site,
                    TauMove::Genome => TauUpdate::Genome,
                    TauMove::Parallel => TauUpdate::ParallelGenome,
                },
                init_tau_iter,
                seed,
                ..Default::default()
            };
            let estimator = match estimator {
                Estimator::Stored => Some(MarginalEstimator::StoredTrace),
                Estimator::Auxiliary => Some(MarginalEstimator::AuxiliarySweeps),
                Estimator::Skip => None,
            };
            run::start(&run::RunOptions {
                input,
                output_dir,
                genomes,
                config,
                fixed_tau,
                fixed,
                remove_degenerate,
                estimator,
            })
        }

        Commands::Compare {
            first,
            second,
            output,
        } => compare::start(&first, &second, &output),
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
