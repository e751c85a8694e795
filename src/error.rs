//! Error types for the haplotype sampler.

use thiserror::Error;

/// Main error type for sampler construction, I/O and distribution setup
#[derive(Error, Debug)]
pub enum HaploError {
    /// Count tensor or supplied tau does not match the declared dimensions
    #[error("Shape error: {message}")]
    Shape { message: String },

    /// Invalid hyperparameter
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A distribution rejected its parameters
    #[error("Distribution error: {message}")]
    Distribution { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input row
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

pub type Result<T> = std::result::Result<T, HaploError>;

impl HaploError {
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn distribution(message: impl Into<String>) -> Self {
        Self::Distribution {
            message: message.into(),
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
