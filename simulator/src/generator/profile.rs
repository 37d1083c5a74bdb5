use anyhow::Context;
use destripecore::{
    Dataset, DetectorData, Interval, NoiseModel, NoisePsd, Observation, PixelMap,
};
use ndarray::{Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const PSD_BINS: usize = 512;

/// Configuration for generating synthetic time-ordered data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub observations: usize,
    pub detectors: usize,
    pub samples: usize,
    /// Samples per second.
    pub sample_rate: f64,
    /// Stability intervals per observation.
    pub intervals: usize,
    /// Consecutive samples that fall in the same pixel.
    pub samples_per_pixel: usize,
    pub sky_amplitude: f64,
    /// White-noise standard deviation per sample.
    pub white_noise: f64,
    /// Standard deviation of each new drift level.
    pub drift: f64,
    /// Seconds between drift level changes.
    pub drift_length: f64,
    pub fknee: f64,
    pub alpha: f64,
    pub seed: u64,
    pub description: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            observations: 2,
            detectors: 4,
            samples: 20_000,
            sample_rate: 10.0,
            intervals: 2,
            samples_per_pixel: 4,
            sky_amplitude: 1.0,
            white_noise: 0.01,
            drift: 0.1,
            drift_length: 30.0,
            fknee: 0.05,
            alpha: 1.5,
            seed: 0,
            description: None,
        }
    }
}

impl GeneratorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.samples == 0 || self.observations == 0 || self.detectors == 0 {
            anyhow::bail!(
                "generator needs at least one observation, detector and sample (got {}, {}, {})",
                self.observations,
                self.detectors,
                self.samples
            );
        }
        if self.sample_rate.is_nan() || self.sample_rate <= 0.0 {
            anyhow::bail!("sample rate must be positive, got {}", self.sample_rate);
        }
        if self.drift_length.is_nan() || self.drift_length <= 0.0 {
            anyhow::bail!("drift length must be positive, got {}", self.drift_length);
        }
        Ok(())
    }

    fn obs_duration(&self) -> f64 {
        self.samples as f64 / self.sample_rate
    }

    /// Detectors handled by `rank` in a group of `size`, dealt round-robin.
    pub fn local_detectors(&self, rank: usize, size: usize) -> Vec<usize> {
        (0..self.detectors)
            .filter(|idet| idet % size.max(1) == rank)
            .collect()
    }

    /// Analytic 1/f noise PSD matching the simulated white-noise level.
    pub fn noise_psd(&self) -> anyhow::Result<NoisePsd> {
        let nyquist = self.sample_rate / 2.0;
        let white = self.white_noise * self.white_noise / self.sample_rate;
        let freq: Vec<f64> = (1..=PSD_BINS)
            .map(|k| k as f64 * nyquist / PSD_BINS as f64)
            .collect();
        let psd = freq
            .iter()
            .map(|f| white * (1.0 + (self.fknee / f).powf(self.alpha)))
            .collect();
        NoisePsd::new(freq, psd, self.sample_rate).context("building analytic noise PSD")
    }
}

fn polarization_angle(idet: usize, iobs: usize, sample: usize) -> f64 {
    idet as f64 * PI / 4.0 + iobs as f64 * 0.3 + sample as f64 * 2e-3
}

fn pointing_weights(nsamp: usize, nnz: usize, idet: usize, iobs: usize) -> Array2<f64> {
    Array2::from_shape_fn((nsamp, nnz), |(sample, inz)| {
        let psi = polarization_angle(idet, iobs, sample);
        match inz {
            0 => 1.0,
            1 => (2.0 * psi).cos(),
            _ => (2.0 * psi).sin(),
        }
    })
}

fn ring_pixels(config: &GeneratorConfig, npix: usize, idet: usize, iobs: usize) -> Vec<i64> {
    let spp = config.samples_per_pixel.max(1);
    (0..config.samples)
        .map(|sample| ((sample / spp + iobs * 7 + idet * 3) % npix) as i64)
        .collect()
}

fn equal_intervals(times: &[f64], count: usize) -> Vec<Interval> {
    let nsamp = times.len();
    let count = count.clamp(1, nsamp);
    (0..count)
        .map(|k| {
            let first = k * nsamp / count;
            let last = (k + 1) * nsamp / count - 1;
            Interval::new(times[first], times[last], first, last)
        })
        .collect()
}

fn simulate_detector(
    config: &GeneratorConfig,
    sky: &PixelMap,
    idet: usize,
    iobs: usize,
) -> anyhow::Result<DetectorData> {
    let nsamp = config.samples;
    let pixels = ring_pixels(config, sky.npix(), idet, iobs);
    let weights = pointing_weights(nsamp, sky.nnz(), idet, iobs);
    let sky_tod: Array1<f64> = pixels
        .iter()
        .zip(weights.outer_iter())
        .map(|(&pixel, w)| w.dot(&sky.pixel(pixel as usize)))
        .collect();

    // Seeded per detector and observation so the data do not depend on the group size.
    let stream = (iobs * config.detectors + idet) as u64;
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_mul(1_000_003).wrapping_add(stream));
    let white = Normal::new(0.0, config.white_noise)
        .map_err(|err| anyhow::anyhow!("invalid white noise level {}: {}", config.white_noise, err))?;
    let drift = Normal::new(0.0, config.drift)
        .map_err(|err| anyhow::anyhow!("invalid drift level {}: {}", config.drift, err))?;
    let drift_samples = ((config.drift_length * config.sample_rate).round() as usize).max(1);

    let mut level = 0.0;
    let mut signal = sky_tod.clone();
    for (sample, value) in signal.iter_mut().enumerate() {
        if sample % drift_samples == 0 {
            level = drift.sample(&mut rng);
        }
        *value += level + white.sample(&mut rng);
    }
    // Occasional glitch flags exercise the flag masks downstream.
    let mut det = DetectorData::new(format!("det{:02}", idet), pixels, weights)
        .with_signal("signal", signal)
        .with_signal("sky", sky_tod);
    for flag in det.flags.iter_mut() {
        if rng.gen_bool(1e-3) {
            *flag = 1;
        }
    }
    Ok(det)
}

/// Builds the local share of the synthetic dataset for one group member.
///
/// Every observation carries the detectors dealt to `rank`, a `signal`
/// stream of sky plus drifting noise, the noiseless `sky` stream, an
/// analytic noise model and equal-length `intervals`.
pub fn build_dataset(
    config: &GeneratorConfig,
    sky: &PixelMap,
    rank: usize,
    size: usize,
) -> anyhow::Result<Dataset> {
    config.validate()?;
    let detectors = config.local_detectors(rank, size);
    let psd = config.noise_psd()?;
    let gap = 60.0;

    let mut observations = Vec::with_capacity(config.observations);
    for iobs in 0..config.observations {
        let t0 = iobs as f64 * (config.obs_duration() + gap);
        let times: Vec<f64> = (0..config.samples)
            .map(|sample| t0 + sample as f64 / config.sample_rate)
            .collect();
        let mut obs = Observation::new(format!("scan{:03}", iobs), times);
        let mut noise = NoiseModel::new();
        for &idet in &detectors {
            let det = simulate_detector(config, sky, idet, iobs)
                .with_context(|| format!("simulating detector {} of observation {}", idet, iobs))?;
            noise.insert(det.name.clone(), psd.clone());
            obs.add_detector(det)
                .with_context(|| format!("adding detector {} to observation {}", idet, iobs))?;
        }
        obs.noise = Some(noise);
        let intervals = equal_intervals(&obs.times, config.intervals);
        obs.add_intervals("intervals", intervals);
        observations.push(obs);
    }
    log::debug!(
        "rank {} generated {} observations with detectors {:?}",
        rank,
        observations.len(),
        detectors
    );
    Ok(Dataset::new(observations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::template::sky_map;

    fn small_config() -> GeneratorConfig {
        GeneratorConfig {
            observations: 2,
            detectors: 4,
            samples: 600,
            intervals: 3,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn detectors_are_dealt_round_robin() {
        let config = GeneratorConfig {
            detectors: 4,
            ..Default::default()
        };
        assert_eq!(config.local_detectors(0, 3), vec![0, 3]);
        assert_eq!(config.local_detectors(1, 3), vec![1]);
        assert_eq!(config.local_detectors(2, 3), vec![2]);
        assert_eq!(config.local_detectors(0, 1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn dataset_has_streams_intervals_and_noise() {
        let config = small_config();
        let sky = sky_map(48, 3, 1.0);
        let data = build_dataset(&config, &sky, 0, 2).unwrap();
        assert_eq!(data.observations.len(), 2);
        for obs in &data.observations {
            assert_eq!(obs.detectors.len(), 2);
            let intervals = obs.local_intervals("intervals").unwrap();
            assert_eq!(intervals.len(), 3);
            assert_eq!(intervals[0].first, 0);
            assert_eq!(intervals[2].last, 599);
            assert_eq!(intervals[1].first, intervals[0].last + 1);
            for det in &obs.detectors {
                assert!(det.signals.contains_key("signal"));
                assert!(det.signals.contains_key("sky"));
                assert!(det.pixels.iter().all(|&p| (0..48).contains(&p)));
                assert_eq!(det.nnz(), 3);
            }
        }
        assert!(data.observations[1].times[0] > data.observations[0].times[599]);
    }

    #[test]
    fn analytic_psd_recovers_white_level() {
        let config = small_config();
        let psd = config.noise_psd().unwrap();
        let variance = psd.white_noise_variance().unwrap();
        let expected = config.white_noise * config.white_noise;
        assert!((variance - expected).abs() < 1e-2 * expected);
    }

    #[test]
    fn data_do_not_depend_on_group_size() {
        let config = small_config();
        let sky = sky_map(48, 3, 1.0);
        let serial = build_dataset(&config, &sky, 0, 1).unwrap();
        let split = build_dataset(&config, &sky, 1, 2).unwrap();
        let a = &serial.observations[1].detectors[1];
        let b = &split.observations[1].detectors[0];
        assert_eq!(a.name, b.name);
        assert_eq!(a.signals["signal"], b.signals["signal"]);
        assert_eq!(a.flags, b.flags);
    }

    #[test]
    fn signal_is_sky_plus_noise() {
        let config = GeneratorConfig {
            drift: 0.0,
            ..small_config()
        };
        let sky = sky_map(48, 3, 1.0);
        let data = build_dataset(&config, &sky, 0, 1).unwrap();
        let det = &data.observations[0].detectors[0];
        let residual = &det.signals["signal"] - &det.signals["sky"];
        let rms = (residual.mapv(|v| v * v).sum() / residual.len() as f64).sqrt();
        assert!(rms > 0.5 * config.white_noise && rms < 2.0 * config.white_noise);
    }

    #[test]
    fn empty_generator_is_rejected() {
        let config = GeneratorConfig {
            samples: 0,
            ..Default::default()
        };
        let sky = sky_map(12, 1, 1.0);
        assert!(build_dataset(&config, &sky, 0, 1).is_err());
    }
}
