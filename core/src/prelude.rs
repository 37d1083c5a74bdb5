use crate::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Iteration controls for the conjugate-gradient solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub niter_min: usize,
    pub niter_max: usize,
    pub convergence_limit: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            niter_min: 3,
            niter_max: 100,
            convergence_limit: 1e-12,
        }
    }
}

/// Shared configuration for a destriping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapMakerConfig {
    pub nside: usize,
    pub nnz: usize,
    pub signal_name: String,
    pub outprefix: String,
    pub write_hits: bool,
    pub write_wcov_inv: bool,
    pub write_wcov: bool,
    pub write_binned: bool,
    pub write_destriped: bool,
    /// Offset step length in the units of the sample times.
    pub baseline_length: Option<f64>,
    pub subharmonic_order: Option<usize>,
    pub mask_file: Option<PathBuf>,
    pub weight_map_file: Option<PathBuf>,
    pub common_flag_mask: u8,
    pub flag_mask: u8,
    pub intervals: String,
    pub filter_limit: f64,
    pub rcond_limit: f64,
    pub solver: SolverConfig,
}

impl Default for MapMakerConfig {
    fn default() -> Self {
        Self {
            nside: 64,
            nnz: 3,
            signal_name: "signal".to_string(),
            outprefix: String::new(),
            write_hits: true,
            write_wcov_inv: true,
            write_wcov: true,
            write_binned: true,
            write_destriped: true,
            baseline_length: Some(100_000.0),
            subharmonic_order: None,
            mask_file: None,
            weight_map_file: None,
            common_flag_mask: 1,
            flag_mask: 1,
            intervals: "intervals".to_string(),
            filter_limit: 1e-4,
            rcond_limit: 1e-3,
            solver: SolverConfig::default(),
        }
    }
}

impl MapMakerConfig {
    pub fn npix(&self) -> usize {
        12 * self.nside * self.nside
    }

    pub fn submap_npix(&self) -> usize {
        let subnside = self.nside.min(16);
        12 * subnside * subnside
    }

    /// Number of independent entries in the per-pixel covariance block.
    pub fn ncov(&self) -> usize {
        self.nnz * (self.nnz + 1) / 2
    }
}

/// Common error type for the destriping core.
#[derive(thiserror::Error, Debug)]
pub enum DestripeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("signal `{signal}` not found for detector `{detector}` in observation `{observation}`")]
    MissingSignal {
        signal: String,
        observation: String,
        detector: String,
    },
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("input file does not exist: {0}")]
    MissingInput(PathBuf),
    #[error("process {0} has no hit pixels; perhaps there are fewer detectors than processes in the group?")]
    NoHitPixels(usize),
    #[error("matrix is not invertible: {0}")]
    Singular(String),
    #[error("noise filter has no lag above the truncation limit {0:e}")]
    EmptyFilter(f64),
    #[error("residual is not finite at iteration {0}")]
    NonFiniteResidual(usize),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type DestripeResult<T> = Result<T, DestripeError>;

/// Linear operator acting on time-domain signals.
pub trait SignalOperator {
    fn apply(&self, signal: &Signal) -> DestripeResult<Signal>;
    fn apply_transpose(&self, signal: &Signal) -> DestripeResult<Signal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_healpix_sizes() {
        let config = MapMakerConfig::default();
        assert_eq!(config.npix(), 12 * 64 * 64);
        assert_eq!(config.submap_npix(), 12 * 16 * 16);
        assert_eq!(config.ncov(), 6);
    }

    #[test]
    fn small_nside_uses_full_map_as_submap() {
        let config = MapMakerConfig {
            nside: 4,
            ..Default::default()
        };
        assert_eq!(config.submap_npix(), config.npix());
    }
}
