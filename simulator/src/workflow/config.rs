use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use destripecore::MapMakerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub generator: GeneratorConfig,
    pub mapmaker: MapMakerConfig,
    /// Members of the in-process reduction group.
    pub workers: usize,
    pub outdir: PathBuf,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::from_args(2, 8, 10.0)
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(workers: usize, nside: usize, baseline_length: f64) -> Self {
        Self {
            generator: GeneratorConfig::default(),
            mapmaker: MapMakerConfig {
                nside,
                baseline_length: Some(baseline_length),
                ..Default::default()
            },
            workers,
            outdir: PathBuf::from("out"),
        }
    }

    pub fn group_size(&self) -> usize {
        self.workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_sets_mapmaker() {
        let cfg = WorkflowConfig::from_args(3, 4, 25.0);
        assert_eq!(cfg.mapmaker.npix(), 192);
        assert_eq!(cfg.mapmaker.baseline_length, Some(25.0));
        assert_eq!(cfg.group_size(), 3);
        assert_eq!(WorkflowConfig::from_args(0, 4, 25.0).group_size(), 1);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"workers: 3\noutdir: maps\ngenerator:\n  samples: 1000\n  seed: 5\nmapmaker:\n  nside: 2\n  subharmonic_order: 1\n  solver:\n    niter_max: 20\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.outdir, PathBuf::from("maps"));
        assert_eq!(cfg.generator.samples, 1000);
        assert_eq!(cfg.generator.detectors, 4);
        assert_eq!(cfg.mapmaker.nside, 2);
        assert_eq!(cfg.mapmaker.subharmonic_order, Some(1));
        assert_eq!(cfg.mapmaker.solver.niter_max, 20);
        assert_eq!(cfg.mapmaker.nnz, 3);
    }

    #[test]
    fn config_load_reports_missing_file() {
        let err = WorkflowConfig::load("/nonexistent/workflow.yaml").unwrap_err();
        assert!(err.to_string().contains("reading workflow config"));
    }
}
