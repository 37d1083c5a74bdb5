use super::noise::NoiseMatrix;
use super::pcg::{DestripingSystem, PcgSolver, SolveStatus};
use super::projection::ProjectionMatrix;
use crate::comm::Reducer;
use crate::data::{Dataset, DetWeights, FlagMasks};
use crate::pixels::binning::{
    covariance_apply, covariance_invert, local_pixels, local_submaps, scan_mask, Binner,
};
use crate::pixels::{MapSink, PixelMap, MASK_BIT};
use crate::prelude::{DestripeError, DestripeResult, MapMakerConfig};
use crate::telemetry::{LogManager, SolverMetrics};
use crate::templates::{OffsetTemplate, SubharmonicTemplate, TemplateMatrix};
use std::path::Path;

/// Summary of the amplitude solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_sqsum: f64,
    pub final_sqsum: f64,
    pub metrics: SolverMetrics,
}

/// What one worker learned while making maps.
#[derive(Debug, Clone, PartialEq)]
pub struct MapMakerReport {
    pub detweights: DetWeights,
    pub local_submaps: Vec<usize>,
    /// Hit pixels whose covariance block was too poorly conditioned to invert.
    pub rejected_pixels: usize,
    /// Amplitudes over the whole group.
    pub namplitude: usize,
    /// `None` when no template was configured.
    pub solve: Option<SolveSummary>,
}

struct Binning {
    local_submaps: Vec<usize>,
    covariance: PixelMap,
    rejected: usize,
}

/// Template-based destriping map-maker.
///
/// Every worker calls [`MapMaker::exec`] on its own share of the data with
/// the same configuration; maps are written by rank 0 only.
pub struct MapMaker {
    config: MapMakerConfig,
}

impl MapMaker {
    pub fn new(config: MapMakerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MapMakerConfig {
        &self.config
    }

    fn masks(&self) -> FlagMasks {
        FlagMasks::new(self.config.common_flag_mask, self.config.flag_mask)
    }

    fn write_map(
        &self,
        reducer: &dyn Reducer,
        sink: &mut dyn MapSink,
        suffix: &str,
        map: &PixelMap,
    ) -> DestripeResult<()> {
        if reducer.rank() == 0 {
            sink.write_map(&format!("{}{}", self.config.outprefix, suffix), map)?;
        }
        Ok(())
    }

    /// Inverse white-noise variance of every local detector, estimated from
    /// the mid-band of its PSD. Observations without a noise model get unit
    /// weights.
    pub fn detweights(data: &Dataset) -> DestripeResult<DetWeights> {
        data.observations
            .iter()
            .map(|obs| {
                obs.detectors
                    .iter()
                    .map(|det| -> DestripeResult<f64> {
                        match &obs.noise {
                            Some(noise) => Ok(1.0 / noise.psd(&det.name)?.white_noise_variance()?),
                            None => Ok(1.0),
                        }
                    })
                    .collect::<DestripeResult<Vec<f64>>>()
            })
            .collect()
    }

    fn initialize_binning(
        &self,
        data: &Dataset,
        detweights: &DetWeights,
        reducer: &dyn Reducer,
        sink: &mut dyn MapSink,
        logger: &LogManager,
    ) -> DestripeResult<Binning> {
        let pixels = local_pixels(data);
        if pixels.is_empty() {
            return Err(DestripeError::NoHitPixels(reducer.rank()));
        }
        let local_submaps = local_submaps(&pixels, self.config.submap_npix());
        logger.report_clear("Identify local submaps");

        let binner = Binner::new(detweights, self.config.npix(), self.config.nnz, self.masks());
        let (mut hits, mut covariance) = binner.accumulate_covariance(data)?;
        logger.report_clear("Accumulate inverse white noise covariance");
        covariance.all_reduce(reducer)?;
        logger.report_clear("All reduce inverse white noise covariance");

        if self.config.write_hits {
            hits.all_reduce(reducer)?;
            self.write_map(reducer, sink, "hits", &hits)?;
            logger.report_clear("Write hits");
        }
        if self.config.write_wcov_inv {
            self.write_map(reducer, sink, "invnpp", &covariance)?;
            logger.report_clear("Write inverse white noise covariance");
        }

        let rejected = covariance_invert(&mut covariance, self.config.nnz, self.config.rcond_limit)?;
        logger.report_clear("Invert white noise covariance");
        if rejected > 0 {
            logger.record(&format!(
                "Rejected {} poorly conditioned pixels",
                rejected
            ));
        }

        if self.config.write_wcov {
            self.write_map(reducer, sink, "npp", &covariance)?;
            logger.report_clear("Write white noise covariance");
        }

        Ok(Binning {
            local_submaps,
            covariance,
            rejected,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn bin_map(
        &self,
        data: &Dataset,
        detweights: &DetWeights,
        covariance: &PixelMap,
        reducer: &dyn Reducer,
        sink: &mut dyn MapSink,
        suffix: &str,
        logger: &LogManager,
    ) -> DestripeResult<()> {
        let layout = data.layout();
        let signal = data.read_signal(&self.config.signal_name, &layout)?;
        let binner = Binner::new(detweights, self.config.npix(), self.config.nnz, self.masks());
        let mut map = binner.bin_signal(data, &signal)?;
        map.all_reduce(reducer)?;
        logger.report_clear("  Build noise-weighted map");
        covariance_apply(covariance, &mut map)?;
        logger.report_clear("  Apply noise covariance");
        self.write_map(reducer, sink, suffix, &map)?;
        logger.report_clear(&format!("  Write {} map", suffix));
        Ok(())
    }

    fn load_map(&self, path: &Path, what: &str) -> DestripeResult<PixelMap> {
        let map = PixelMap::read_json(path)?;
        if map.npix() != self.config.npix() || map.nnz() == 0 {
            return Err(DestripeError::LayoutMismatch(format!(
                "{} {} has {} pixels, expected {}",
                what,
                path.display(),
                map.npix(),
                self.config.npix()
            )));
        }
        Ok(map)
    }

    pub fn exec(
        &self,
        data: &mut Dataset,
        reducer: &dyn Reducer,
        sink: &mut dyn MapSink,
    ) -> DestripeResult<MapMakerReport> {
        let logger = LogManager::for_rank(reducer.rank());
        let config = &self.config;

        let detweights = Self::detweights(data)?;
        let binning = self.initialize_binning(data, &detweights, reducer, sink, &logger)?;
        if config.write_binned {
            self.bin_map(
                data,
                &detweights,
                &binning.covariance,
                reducer,
                sink,
                "binned",
                &logger,
            )?;
        }

        if let Some(path) = &config.mask_file {
            let mask = self.load_map(path, "processing mask")?;
            logger.report_clear(&format!("Read processing mask from {}", path.display()));
            scan_mask(data, &mask, MASK_BIT)?;
            logger.report_clear("Apply processing mask");
        }
        let weight_map = match &config.weight_map_file {
            Some(path) => {
                let map = self.load_map(path, "weight map")?;
                logger.report_clear(&format!("Read weight map from {}", path.display()));
                Some(map)
            }
            None => None,
        };
        logger.report_clear("Initialize mapmaking");

        let data_view: &Dataset = data;
        let masks = self.masks();
        let template_masks = masks.with_detector_bits(MASK_BIT);
        let layout = data_view.layout();
        let mut templates = TemplateMatrix::new(layout.clone());
        if let Some(step_length) = config.baseline_length {
            templates.register_template(OffsetTemplate::new(
                data_view,
                &detweights,
                step_length,
                &config.intervals,
                template_masks,
                config.filter_limit,
            )?);
        }
        if let Some(order) = config.subharmonic_order {
            templates.register_template(SubharmonicTemplate::new(
                data_view,
                &detweights,
                order,
                &config.intervals,
                template_masks,
            )?);
        }

        let mut report = MapMakerReport {
            detweights: detweights.clone(),
            local_submaps: binning.local_submaps.clone(),
            rejected_pixels: binning.rejected,
            namplitude: 0,
            solve: None,
        };
        if templates.is_empty() {
            logger.record("No templates to fit, no destriping done.");
            return Ok(report);
        }
        report.namplitude = reducer.all_reduce_sum(templates.namplitude() as f64).round() as usize;
        logger.report_clear(&format!(
            "Initialize templates with {} amplitudes",
            report.namplitude
        ));

        let noise = NoiseMatrix::new(data_view, &detweights, weight_map.as_ref(), template_masks);
        // The white-noise covariance was accumulated without the mask bit.
        let projection = ProjectionMatrix::new(
            data_view,
            &detweights,
            &binning.covariance,
            config.npix(),
            config.nnz,
            masks,
            reducer,
        );
        logger.report_clear("Initialize projection matrix");

        let mut signal = data_view.read_signal(&config.signal_name, &layout)?;
        let system = DestripingSystem::new(&templates, &noise, &projection);
        let rhs = system.rhs(&signal)?;
        let solver = PcgSolver::new(config.solver, reducer);
        logger.report_clear("Initialize PCG solver");
        let outcome = solver.solve(&system, &rhs)?;
        logger.report_clear(&format!("Solve amplitudes: {}", outcome.status));

        templates.clean_signal(&mut signal, &outcome.amplitudes)?;
        logger.report_clear("Clean TOD");
        report.solve = Some(SolveSummary {
            status: outcome.status,
            iterations: outcome.iterations,
            initial_sqsum: outcome.initial_sqsum,
            final_sqsum: outcome.final_sqsum,
            metrics: solver.metrics().snapshot(),
        });

        data.write_signal(&config.signal_name, &signal)?;
        if config.write_destriped {
            self.bin_map(
                data,
                &detweights,
                &binning.covariance,
                reducer,
                sink,
                "destriped",
                &logger,
            )?;
        }
        Ok(report)
    }
}
