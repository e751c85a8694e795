//! Gibbs-sampling reconstruction of strain haplotypes from per-sample
//! nucleotide counts at variant sites.

pub mod chain;
pub mod compare;
pub mod config;
pub mod error;
pub mod io;
pub mod likelihood;
pub mod marginal;
pub mod postprocess;
pub mod run;
pub mod sampler;
pub mod state;
pub mod util;

pub use chain::{ChainPhase, GibbsSampler, IterationBudget};
pub use config::{SamplerConfig, TauUpdate};
pub use error::{HaploError, Result};
pub use marginal::{MarginalEstimate, MarginalEstimator};
pub use sampler::{JointTauResampler, ParallelTauResampler, SequentialTauResampler, TauResampler};
pub use state::{ModelState, StarState, TauTable, TraceStore};
