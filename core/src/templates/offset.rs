use super::{detector_weight, segments_by_stream, Segment};
use crate::data::{Dataset, DetWeights, FlagMasks, Interval, NoisePsd, Observation};
use crate::math::fft::{rfft_frequencies, FftHelper};
use crate::math::filter::{convolve_same, truncate_kernel};
use crate::math::stats::StatsHelper;
use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::Signal;
use log::{debug, warn};
use ndarray::{s, Array1, ArrayView1};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::ops::Range;

/// Smallest power kept in any spectrum before taking logarithms.
const POWER_FLOOR: f64 = 1e-30;
/// Frequencies closer to zero than this are treated as zero.
const ZERO_FREQUENCY: f64 = 1e-10;
/// Number of aliased baseline harmonics folded on each side.
const ALIAS_ORDER: usize = 1;
/// Points in the logarithmic frequency grid of the offset spectrum.
const GRID_POINTS: usize = 1000;
/// Above this frequency the detector PSD is assumed white.
const WHITE_NOISE_FREQUENCY: f64 = 1.0;

/// Real-space kernels acting on one (detector, interval) block of offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetKernels {
    pub prior: Vec<f64>,
    pub precond: Vec<f64>,
}

#[derive(Debug, Clone)]
struct OffsetBlock {
    obs: usize,
    det: usize,
    amplitudes: Range<usize>,
    weight: f64,
    /// Unflagged samples per step.
    good: Vec<usize>,
    kernels: Option<OffsetKernels>,
}

impl OffsetBlock {
    fn nstep(&self) -> usize {
        self.amplitudes.len()
    }

    fn mean_good(&self) -> f64 {
        if self.good.is_empty() {
            return 0.0;
        }
        self.good.iter().sum::<usize>() as f64 / self.good.len() as f64
    }

    fn diagonal(&self, step: usize) -> f64 {
        let weight = self.weight * self.good[step] as f64;
        if weight > 0.0 {
            1.0 / weight
        } else {
            0.0
        }
    }
}

/// Step-function baselines of fixed duration.
#[derive(Debug, Clone)]
pub struct OffsetTemplate {
    step_length: f64,
    namplitude: usize,
    segments: Vec<Segment>,
    by_stream: Vec<Vec<usize>>,
    blocks: Vec<OffsetBlock>,
}

impl OffsetTemplate {
    pub const NAME: &'static str = "offset";

    pub fn new(
        data: &Dataset,
        detweights: &DetWeights,
        step_length: f64,
        intervals: &str,
        masks: FlagMasks,
        filter_limit: f64,
    ) -> DestripeResult<Self> {
        if !step_length.is_finite() || step_length <= 0.0 {
            return Err(DestripeError::InvalidInput(format!(
                "baseline length must be positive, got {}",
                step_length
            )));
        }
        let layout = data.layout();
        let mut segments = Vec::new();
        let mut blocks = Vec::new();
        let mut namplitude = 0;

        for (iobs, obs) in data.observations.iter().enumerate() {
            for interval in obs.local_intervals(intervals)? {
                let bounds = step_boundaries(&obs.times, &interval, step_length)?;
                for idet in 0..obs.detectors.len() {
                    let stream = layout.stream_index(iobs, idet);
                    let first = namplitude;
                    for samples in &bounds {
                        segments.push(Segment {
                            stream,
                            samples: samples.clone(),
                            amplitude: namplitude,
                        });
                        namplitude += 1;
                    }
                    let good = bounds
                        .iter()
                        .map(|samples| {
                            samples
                                .clone()
                                .filter(|&sample| !obs.is_flagged(idet, sample, masks))
                                .count()
                        })
                        .collect();
                    blocks.push(OffsetBlock {
                        obs: iobs,
                        det: idet,
                        amplitudes: first..namplitude,
                        weight: detector_weight(detweights, iobs, idet)?,
                        good,
                        kernels: None,
                    });
                }
            }
        }

        let by_stream = segments_by_stream(&segments, layout.nstream());
        let mut template = Self {
            step_length,
            namplitude,
            segments,
            by_stream,
            blocks,
        };
        template.build_filters(data, filter_limit)?;
        Ok(template)
    }

    /// Computes prior and preconditioner kernels for every block of every
    /// observation that carries a noise model.
    fn build_filters(&mut self, data: &Dataset, filter_limit: f64) -> DestripeResult<()> {
        let mut helpers: BTreeMap<usize, FftHelper> = BTreeMap::new();
        for (iobs, obs) in data.observations.iter().enumerate() {
            let Some(noise) = obs.noise.as_ref() else {
                warn!("Observation \"{}\" does not have noise information", obs.name);
                continue;
            };
            let Some(freq) = frequency_grid(obs, self.step_length) else {
                warn!(
                    "Observation \"{}\" is too short to build offset filters",
                    obs.name
                );
                continue;
            };
            for (idet, det) in obs.detectors.iter().enumerate() {
                let offset_psd = offset_psd(noise.psd(&det.name)?, &freq, self.step_length)?;
                for block in self
                    .blocks
                    .iter_mut()
                    .filter(|block| block.obs == iobs && block.det == idet)
                {
                    let size = 2 * block.nstep();
                    let helper = helpers
                        .entry(size)
                        .or_insert_with(|| FftHelper::inverse(size));
                    block.kernels = Some(block_kernels(
                        helper,
                        &freq,
                        &offset_psd,
                        block,
                        self.step_length,
                        filter_limit,
                    )?);
                }
            }
            debug!("Built offset filters for observation \"{}\"", obs.name);
        }
        Ok(())
    }

    pub fn namplitude(&self) -> usize {
        self.namplitude
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Kernels of each (detector, interval) block, in amplitude order.
    pub fn kernels(&self) -> impl Iterator<Item = Option<&OffsetKernels>> {
        self.blocks.iter().map(|block| block.kernels.as_ref())
    }

    pub fn add_to_signal(&self, signal: &mut Signal, amplitudes: ArrayView1<f64>) {
        signal
            .streams_mut()
            .par_iter_mut()
            .zip(self.by_stream.par_iter())
            .for_each(|(samples, indices)| {
                for &index in indices {
                    let segment = &self.segments[index];
                    let offset = amplitudes[segment.amplitude];
                    samples
                        .slice_mut(s![segment.samples.clone()])
                        .mapv_inplace(|value| value + offset);
                }
            });
    }

    pub fn project_signal(&self, signal: &Signal, amplitudes: &mut Array1<f64>) {
        let sums: Vec<Vec<(usize, f64)>> = signal
            .streams()
            .par_iter()
            .zip(self.by_stream.par_iter())
            .map(|(samples, indices)| {
                indices
                    .iter()
                    .map(|&index| {
                        let segment = &self.segments[index];
                        (
                            segment.amplitude,
                            samples.slice(s![segment.samples.clone()]).sum(),
                        )
                    })
                    .collect()
            })
            .collect();
        for (index, sum) in sums.into_iter().flatten() {
            amplitudes[index] += sum;
        }
    }

    pub fn add_prior(&self, input: ArrayView1<f64>, output: &mut Array1<f64>) {
        let filtered: Vec<(Range<usize>, Array1<f64>)> = self
            .blocks
            .par_iter()
            .filter_map(|block| {
                let kernels = block.kernels.as_ref()?;
                let amps = input.slice(s![block.amplitudes.clone()]);
                Some((block.amplitudes.clone(), convolve_same(amps, &kernels.prior)))
            })
            .collect();
        for (range, values) in filtered {
            let mut target = output.slice_mut(s![range]);
            target += &values;
        }
    }

    /// Applies the block preconditioner, falling back to the inverse of the
    /// white-noise diagonal for blocks without a noise model.
    pub fn apply_precond(&self, input: ArrayView1<f64>, output: &mut Array1<f64>) {
        let preconditioned: Vec<(Range<usize>, Array1<f64>)> = self
            .blocks
            .par_iter()
            .map(|block| {
                let amps = input.slice(s![block.amplitudes.clone()]);
                let values = match &block.kernels {
                    Some(kernels) => convolve_same(amps, &kernels.precond),
                    None => Array1::from_shape_fn(amps.len(), |step| {
                        amps[step] * block.diagonal(step)
                    }),
                };
                (block.amplitudes.clone(), values)
            })
            .collect();
        for (range, values) in preconditioned {
            let mut target = output.slice_mut(s![range]);
            target += &values;
        }
    }
}

/// Splits an interval into steps of `step_length`, snapping each boundary to
/// the first sample at or after the nominal start time.
///
/// Boundaries that collapse onto the same sample (gaps in the sampling) are
/// merged, so every returned range is non-empty. The ranges are contiguous
/// and cover the interval exactly.
pub fn step_boundaries(
    times: &[f64],
    interval: &Interval,
    step_length: f64,
) -> DestripeResult<Vec<Range<usize>>> {
    if interval.is_empty() || interval.last >= times.len() {
        return Err(DestripeError::InvalidInput(format!(
            "interval [{}, {}] does not fit {} samples",
            interval.first,
            interval.last,
            times.len()
        )));
    }
    let window = &times[interval.first..=interval.last];
    let length = times[interval.last] - times[interval.first];
    let nbase = ((length / step_length).ceil() as usize).max(1);

    let mut starts = vec![interval.first];
    for step in 1..nbase {
        let start_time = interval.start + step as f64 * step_length;
        let index = (interval.first + window.partition_point(|&time| time < start_time))
            .min(interval.last);
        if starts.last() != Some(&index) {
            starts.push(index);
        }
    }

    let mut bounds = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let stop = starts.get(i + 1).copied().unwrap_or(interval.last + 1);
        bounds.push(start..stop);
    }
    Ok(bounds)
}

/// Logarithmic frequency grid spanning the observation length to a couple
/// of decades above the baseline frequency.
fn frequency_grid(obs: &Observation, step_length: f64) -> Option<Vec<f64>> {
    let dtime = StatsHelper::min_step(&obs.times)?;
    let obstime = obs.times.last()? - obs.times.first()?;
    if dtime <= 0.0 || obstime <= 0.0 {
        return None;
    }
    let fsample = 1.0 / dtime;
    let powmin = (1.0 / obstime).log10().floor() - 1.0;
    let powmax = ((1.0 / step_length).log10().ceil() + 2.0).min(fsample.log10());
    if powmax <= powmin {
        return None;
    }
    Some(StatsHelper::logspace(powmin, powmax, GRID_POINTS))
}

/// Log-log interpolation of a positive spectrum, zero at zero frequency.
struct LogSpectrum {
    logfreq: Vec<f64>,
    logpower: Vec<f64>,
}

impl LogSpectrum {
    fn new(freq: &[f64], power: &[f64]) -> Self {
        Self {
            logfreq: freq.iter().map(|f| f.ln()).collect(),
            logpower: power.iter().map(|p| p.max(POWER_FLOOR).ln()).collect(),
        }
    }

    fn at(&self, freq: f64) -> f64 {
        if freq.abs() < ZERO_FREQUENCY {
            return 0.0;
        }
        StatsHelper::interp(freq.abs().ln(), &self.logfreq, &self.logpower).exp()
    }
}

fn sinc_squared(x: f64) -> f64 {
    if x.abs() < ZERO_FREQUENCY {
        return 1.0;
    }
    let arg = PI * x;
    (arg.sin() / arg).powi(2)
}

/// Power spectrum of the baseline offsets implied by a detector PSD.
///
/// The white-noise floor is removed first; the remaining low-frequency power
/// is averaged over the baseline length (sinc² window) including the power
/// aliased from the nearest multiples of the baseline frequency.
pub fn offset_psd(noise: &NoisePsd, freq: &[f64], step_length: f64) -> DestripeResult<Vec<f64>> {
    let positive: Vec<(f64, f64)> = noise
        .freq
        .iter()
        .zip(&noise.psd)
        .filter(|(&f, _)| f > 0.0)
        .map(|(&f, &p)| (f, p))
        .collect();
    let Some(&(_, highest)) = positive.last() else {
        return Err(DestripeError::InvalidInput(
            "noise PSD has no positive frequencies".into(),
        ));
    };
    let floor = positive
        .iter()
        .filter(|(f, _)| *f > WHITE_NOISE_FREQUENCY)
        .map(|(_, p)| *p)
        .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
        .unwrap_or(highest);
    let psdfreq: Vec<f64> = positive.iter().map(|(f, _)| *f).collect();
    let psd: Vec<f64> = positive
        .iter()
        .map(|(_, p)| (p - floor).max(POWER_FLOOR))
        .collect();
    let spectrum = LogSpectrum::new(&psdfreq, &psd);

    let fbase = 1.0 / step_length;
    Ok(freq
        .iter()
        .map(|&f| {
            let x = f * step_length;
            let mut power = spectrum.at(f) * sinc_squared(x);
            for m in 1..=ALIAS_ORDER {
                let shift = m as f64;
                power += spectrum.at(f + shift * fbase) * sinc_squared(x + shift);
                power += spectrum.at(f - shift * fbase) * sinc_squared(x - shift);
            }
            (power * fbase).max(POWER_FLOOR)
        })
        .collect())
}

fn block_kernels(
    helper: &mut FftHelper,
    freq: &[f64],
    offset_psd: &[f64],
    block: &OffsetBlock,
    step_length: f64,
    filter_limit: f64,
) -> DestripeResult<OffsetKernels> {
    let spectrum = LogSpectrum::new(freq, offset_psd);
    let filterfreq = rfft_frequencies(2 * block.nstep() + 1, step_length);
    let white = block.weight * block.mean_good();

    let prior_half: Vec<f64> = filterfreq
        .iter()
        .map(|&f| match spectrum.at(f) {
            power if power > 0.0 => 1.0 / power,
            _ => 0.0,
        })
        .collect();
    let precond_half: Vec<f64> = prior_half
        .iter()
        .map(|&inverse_power| {
            let total = white + inverse_power;
            if total > 0.0 {
                1.0 / total
            } else {
                0.0
            }
        })
        .collect();

    let prior = truncate_kernel(&helper.inverse_real(&prior_half)?, filter_limit)?;
    let precond = truncate_kernel(&helper.inverse_real(&precond_half)?, filter_limit)?;
    Ok(OffsetKernels { prior, precond })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DetectorData, NoiseModel};
    use ndarray::Array2;

    fn regular_times(nsamp: usize, dt: f64) -> Vec<f64> {
        (0..nsamp).map(|i| i as f64 * dt).collect()
    }

    fn dataset(nsamp: usize, ndet: usize, with_noise: bool) -> Dataset {
        let times = regular_times(nsamp, 0.1);
        let mut obs = Observation::new("obs", times);
        let mut noise = NoiseModel::new();
        for idet in 0..ndet {
            let name = format!("det{}", idet);
            let det = DetectorData::new(&name, vec![0; nsamp], Array2::ones((nsamp, 1)))
                .with_signal("signal", Array1::zeros(nsamp));
            obs.add_detector(det).unwrap();
            let freq: Vec<f64> = (1..=500).map(|i| i as f64 * 0.01).collect();
            let psd = freq
                .iter()
                .map(|f| 1e-3 * (1.0 + (0.05 / f).powf(1.5)))
                .collect();
            noise.insert(name, NoisePsd::new(freq, psd, 10.0).unwrap());
        }
        if with_noise {
            obs.noise = Some(noise);
        }
        Dataset::new(vec![obs])
    }

    fn weights(data: &Dataset) -> DetWeights {
        data.observations
            .iter()
            .map(|obs| vec![1.0; obs.detectors.len()])
            .collect()
    }

    #[test]
    fn step_count_matches_interval_length() {
        let times = regular_times(1000, 1.0);
        let interval = Interval::new(0.0, 999.0, 0, 999);
        let bounds = step_boundaries(&times, &interval, 100.0).unwrap();
        assert_eq!(bounds.len(), (999.0f64 / 100.0).ceil() as usize);
        assert_eq!(bounds[0].start, 0);
        assert_eq!(bounds.last().unwrap().end, 1000);
        for pair in bounds.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(!pair[0].is_empty());
        }
    }

    #[test]
    fn irregular_sampling_snaps_to_next_sample() {
        let times = vec![0.0, 0.5, 0.9, 2.4, 2.6, 3.0, 4.1, 4.2];
        let interval = Interval::new(0.0, 4.2, 0, 7);
        let bounds = step_boundaries(&times, &interval, 1.0).unwrap();
        // nominal starts 1, 2, 3, 4 snap to samples 3, 3, 5, 6
        assert_eq!(bounds, vec![0..3, 3..5, 5..6, 6..8]);
    }

    #[test]
    fn sub_interval_is_covered_exactly() {
        let times = regular_times(50, 1.0);
        let interval = Interval::new(10.0, 29.0, 10, 29);
        let bounds = step_boundaries(&times, &interval, 7.0).unwrap();
        assert_eq!(bounds, vec![10..17, 17..24, 24..30]);
    }

    #[test]
    fn single_sample_interval_has_one_step() {
        let times = regular_times(5, 1.0);
        let interval = Interval::new(2.0, 2.0, 2, 2);
        let bounds = step_boundaries(&times, &interval, 10.0).unwrap();
        assert_eq!(bounds, vec![2..3]);
    }

    #[test]
    fn non_positive_baseline_is_rejected() {
        let data = dataset(10, 1, false);
        let masks = FlagMasks::new(1, 1);
        let result = OffsetTemplate::new(&data, &weights(&data), 0.0, "intervals", masks, 1e-4);
        assert!(result.is_err());
    }

    #[test]
    fn amplitudes_are_assigned_in_detector_order() {
        let data = dataset(100, 2, false);
        let masks = FlagMasks::new(1, 1);
        let template =
            OffsetTemplate::new(&data, &weights(&data), 2.5, "intervals", masks, 1e-4).unwrap();
        // 9.9 s per detector in 2.5 s steps
        assert_eq!(template.namplitude(), 8);
        let streams: Vec<usize> = template.segments().iter().map(|s| s.stream).collect();
        assert_eq!(streams, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        let amplitudes: Vec<usize> = template.segments().iter().map(|s| s.amplitude).collect();
        assert_eq!(amplitudes, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn missing_noise_falls_back_to_diagonal_preconditioner() {
        let mut data = dataset(100, 1, false);
        data.observations[0].detectors[0].flags[0..10].fill(1);
        let masks = FlagMasks::new(1, 1);
        let detweights = vec![vec![2.0]];
        let template =
            OffsetTemplate::new(&data, &detweights, 2.5, "intervals", masks, 1e-4).unwrap();
        assert!(template.kernels().all(|k| k.is_none()));

        let input = Array1::ones(template.namplitude());
        let mut output = Array1::zeros(template.namplitude());
        template.apply_precond(input.view(), &mut output);
        assert!((output[0] - 1.0 / (2.0 * 15.0)).abs() < 1e-12);
        assert!((output[1] - 1.0 / (2.0 * 25.0)).abs() < 1e-12);

        let mut prior = Array1::zeros(template.namplitude());
        template.add_prior(input.view(), &mut prior);
        assert!(prior.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn noise_model_produces_symmetric_odd_kernels() {
        let data = dataset(2000, 1, true);
        let masks = FlagMasks::new(1, 1);
        let template =
            OffsetTemplate::new(&data, &weights(&data), 5.0, "intervals", masks, 1e-4).unwrap();
        for kernels in template.kernels() {
            let kernels = kernels.expect("filters are built when noise is present");
            for kernel in [&kernels.prior, &kernels.precond] {
                assert_eq!(kernel.len() % 2, 1);
                let scale = kernel.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
                for i in 0..kernel.len() / 2 {
                    let mirror = kernel[kernel.len() - 1 - i];
                    assert!((kernel[i] - mirror).abs() <= 1e-9 * scale);
                }
            }
            let mid = kernels.precond.len() / 2;
            assert!(kernels.precond[mid] > 0.0);
        }
    }

    #[test]
    fn offset_psd_is_positive_and_decreasing_at_low_frequency() {
        let freq: Vec<f64> = (1..=500).map(|i| i as f64 * 0.01).collect();
        let psd: Vec<f64> = freq
            .iter()
            .map(|f| 1e-3 * (1.0 + (0.05 / f).powf(1.5)))
            .collect();
        let noise = NoisePsd::new(freq, psd, 10.0).unwrap();
        let grid = StatsHelper::logspace(-3.0, 0.0, 50);
        let spectrum = offset_psd(&noise, &grid, 10.0).unwrap();
        assert!(spectrum.iter().all(|&p| p >= POWER_FLOOR));
        assert!(spectrum[0] > spectrum[20]);
    }

    #[test]
    fn white_psd_collapses_to_the_floor() {
        let freq: Vec<f64> = (1..=100).map(|i| i as f64 * 0.1).collect();
        let noise = NoisePsd::new(freq, vec![1.0; 100], 20.0).unwrap();
        let grid = StatsHelper::logspace(-2.0, 0.0, 10);
        let spectrum = offset_psd(&noise, &grid, 1.0).unwrap();
        assert!(spectrum.iter().all(|&p| p < 1e-20));
    }
}
