use serde::{Deserialize, Serialize};

use crate::error::{HaploError, Result};

/// How the haplotype block is resampled within a sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TauUpdate {
    /// every genome of a variant jointly, from the 4^G joint states; falls back
    /// to `Genome` when G exceeds `max_genomes`
    Site,
    /// one genome at a time, conditional on the other genomes
    Genome,
    /// as `Genome`, with variants spread over the rayon pool
    ParallelGenome,
}

/// Hyperparameters for one Gibbs chain
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// number of genomes G
    pub genomes: usize,
    pub burn_iter: usize,
    pub max_iter: usize,
    /// Dirichlet concentration for every genome frequency
    pub alpha_constant: f64,
    /// Dirichlet concentration for every error-matrix entry
    pub delta_constant: f64,
    /// floor applied to sampled genome frequencies
    pub epsilon: f64,
    /// stored iterations used by the stored-trace marginal likelihood estimator
    pub tau_comp_iter: usize,
    /// largest G for which the 4^G joint state table is built
    pub max_genomes: usize,
    pub tau_update: TauUpdate,
    /// haplotype-only sweeps at the starting gamma and eta before burn-in
    pub init_tau_iter: usize,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            genomes: 2,
            burn_iter: 250,
            max_iter: 250,
            alpha_constant: 0.1,
            delta_constant: 0.1,
            epsilon: 1.0e-6,
            tau_comp_iter: 10,
            max_genomes: 6,
            tau_update: TauUpdate::Site,
            init_tau_iter: 10,
            seed: 42,
        }
    }
}

impl SamplerConfig {
    pub fn with_genomes(genomes: usize) -> Self {
        SamplerConfig {
            genomes,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.genomes == 0 {
            return Err(HaploError::config("number of genomes must be at least 1"));
        }
        if !(self.alpha_constant > 0.0) {
            return Err(HaploError::config(format!(
                "alpha_constant must be positive, got {}",
                self.alpha_constant
            )));
        }
        if !(self.delta_constant > 0.0) {
            return Err(HaploError::config(format!(
                "delta_constant must be positive, got {}",
                self.delta_constant
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon < 1.0) {
            return Err(HaploError::config(format!(
                "epsilon must lie in (0, 1), got {}",
                self.epsilon
            )));
        }
        // 4^G rows must fit comfortably in memory
        if self.max_genomes > 10 {
            return Err(HaploError::config(format!(
                "max_genomes {} exceeds the supported limit of 10",
                self.max_genomes
            )));
        }
        Ok(())
    }

    /// Whether the exhaustive joint state table is available for this G
    pub fn enumerable(&self) -> bool {
        self.genomes <= self.max_genomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SamplerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_genomes() {
        let config = SamplerConfig::with_genomes(0);
        assert!(matches!(config.validate(), Err(HaploError::Config { .. })));
    }

    #[test]
    fn rejects_non_positive_priors() {
        let mut config = SamplerConfig::default();
        config.alpha_constant = 0.0;
        assert!(config.validate().is_err());

        let mut config = SamplerConfig::default();
        config.delta_constant = -1.0;
        assert!(config.validate().is_err());

        let mut config = SamplerConfig::default();
        config.epsilon = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_keeps_fields() {
        let config = SamplerConfig {
            genomes: 4,
            seed: 7,
            ..Default::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: SamplerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.genomes, 4);
        assert_eq!(back.seed, 7);
        assert_eq!(back.max_iter, 250);
        assert_eq!(back.tau_update, TauUpdate::Site);
        assert_eq!(back.init_tau_iter, 10);
    }
}
