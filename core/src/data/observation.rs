use crate::math::stats::StatsHelper;
use crate::prelude::{DestripeError, DestripeResult};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Bit masks applied to the common and per-detector flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagMasks {
    pub common: u8,
    pub detector: u8,
}

impl FlagMasks {
    pub fn new(common: u8, detector: u8) -> Self {
        Self { common, detector }
    }

    pub fn with_detector_bits(self, bits: u8) -> Self {
        Self {
            common: self.common,
            detector: self.detector | bits,
        }
    }
}

/// Stability segment of an observation, inclusive sample bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub stop: f64,
    pub first: usize,
    pub last: usize,
}

impl Interval {
    pub fn new(start: f64, stop: f64, first: usize, last: usize) -> Self {
        Self {
            start,
            stop,
            first,
            last,
        }
    }

    pub fn samples(&self) -> Range<usize> {
        self.first..self.last + 1
    }

    pub fn len(&self) -> usize {
        self.last + 1 - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// Noise power spectral density of one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoisePsd {
    pub freq: Vec<f64>,
    pub psd: Vec<f64>,
    pub rate: f64,
}

impl NoisePsd {
    pub fn new(freq: Vec<f64>, psd: Vec<f64>, rate: f64) -> DestripeResult<Self> {
        if freq.len() != psd.len() || freq.is_empty() {
            return Err(DestripeError::InvalidInput(format!(
                "PSD has {} frequencies and {} values",
                freq.len(),
                psd.len()
            )));
        }
        if rate.is_nan() || rate <= 0.0 {
            return Err(DestripeError::InvalidInput(format!(
                "PSD sample rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self { freq, psd, rate })
    }

    /// Approximate white-noise variance per sample.
    ///
    /// Uses the median PSD between 20% and 40% of the sample rate, which
    /// stays clear of any transfer-function roll-off near Nyquist.
    pub fn white_noise_variance(&self) -> DestripeResult<f64> {
        let band: Vec<f64> = self
            .freq
            .iter()
            .zip(&self.psd)
            .filter(|(&f, _)| f > self.rate * 0.2 && f < self.rate * 0.4)
            .map(|(_, &p)| p)
            .collect();
        let median = StatsHelper::median(&band).ok_or_else(|| {
            DestripeError::InvalidInput(
                "PSD has no frequencies between 0.2 and 0.4 of the sample rate".into(),
            )
        })?;
        Ok(median * self.rate)
    }
}

/// Per-detector noise model of one observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoiseModel {
    psds: BTreeMap<String, NoisePsd>,
}

impl NoiseModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, detector: impl Into<String>, psd: NoisePsd) {
        self.psds.insert(detector.into(), psd);
    }

    pub fn psd(&self, detector: &str) -> DestripeResult<&NoisePsd> {
        self.psds.get(detector).ok_or_else(|| {
            DestripeError::InvalidInput(format!("no noise PSD for detector `{}`", detector))
        })
    }
}

/// Local data of one detector within an observation.
#[derive(Debug, Clone)]
pub struct DetectorData {
    pub name: String,
    pub flags: Vec<u8>,
    /// Pointing pixel per sample, negative for unusable pointing.
    pub pixels: Vec<i64>,
    /// Stokes weights, one row per sample.
    pub weights: Array2<f64>,
    pub signals: BTreeMap<String, Array1<f64>>,
}

impl DetectorData {
    pub fn new(name: impl Into<String>, pixels: Vec<i64>, weights: Array2<f64>) -> Self {
        let nsamp = pixels.len();
        Self {
            name: name.into(),
            flags: vec![0; nsamp],
            pixels,
            weights,
            signals: BTreeMap::new(),
        }
    }

    pub fn with_signal(mut self, name: impl Into<String>, samples: Array1<f64>) -> Self {
        self.signals.insert(name.into(), samples);
        self
    }

    pub fn nnz(&self) -> usize {
        self.weights.ncols()
    }
}

/// Contiguous time span covering a subset of detectors.
#[derive(Debug, Clone)]
pub struct Observation {
    pub name: String,
    pub times: Vec<f64>,
    pub common_flags: Vec<u8>,
    pub detectors: Vec<DetectorData>,
    pub noise: Option<NoiseModel>,
    pub intervals: BTreeMap<String, Vec<Interval>>,
}

impl Observation {
    pub fn new(name: impl Into<String>, times: Vec<f64>) -> Self {
        let nsamp = times.len();
        Self {
            name: name.into(),
            times,
            common_flags: vec![0; nsamp],
            detectors: Vec::new(),
            noise: None,
            intervals: BTreeMap::new(),
        }
    }

    pub fn nsamp(&self) -> usize {
        self.times.len()
    }

    pub fn add_detector(&mut self, detector: DetectorData) -> DestripeResult<()> {
        let nsamp = self.nsamp();
        if detector.pixels.len() != nsamp
            || detector.flags.len() != nsamp
            || detector.weights.nrows() != nsamp
        {
            return Err(DestripeError::InvalidInput(format!(
                "detector `{}` does not match the {} samples of observation `{}`",
                detector.name, nsamp, self.name
            )));
        }
        if let Some((name, signal)) = detector.signals.iter().find(|(_, s)| s.len() != nsamp) {
            return Err(DestripeError::InvalidInput(format!(
                "signal `{}` of detector `{}` has {} samples, expected {}",
                name,
                detector.name,
                signal.len(),
                nsamp
            )));
        }
        self.detectors.push(detector);
        Ok(())
    }

    pub fn add_intervals(&mut self, name: impl Into<String>, intervals: Vec<Interval>) {
        self.intervals.insert(name.into(), intervals);
    }

    /// Intervals registered under `name`, or one interval spanning the whole
    /// observation when there are none.
    pub fn local_intervals(&self, name: &str) -> DestripeResult<Vec<Interval>> {
        let nsamp = self.nsamp();
        match self.intervals.get(name) {
            Some(intervals) => {
                for interval in intervals {
                    if interval.is_empty() || interval.last >= nsamp {
                        return Err(DestripeError::InvalidInput(format!(
                            "interval [{}, {}] is outside observation `{}` with {} samples",
                            interval.first, interval.last, self.name, nsamp
                        )));
                    }
                }
                Ok(intervals.clone())
            }
            None if nsamp == 0 => Ok(Vec::new()),
            None => Ok(vec![Interval::new(
                self.times[0],
                self.times[nsamp - 1],
                0,
                nsamp - 1,
            )]),
        }
    }

    /// Whether a sample is excluded under the given masks.
    pub fn is_flagged(&self, det: usize, sample: usize, masks: FlagMasks) -> bool {
        (self.common_flags[sample] & masks.common) != 0
            || (self.detectors[det].flags[sample] & masks.detector) != 0
    }

    /// Per-sample exclusion mask for one detector.
    pub fn flagged(&self, det: usize, masks: FlagMasks) -> Vec<bool> {
        (0..self.nsamp())
            .map(|sample| self.is_flagged(det, sample, masks))
            .collect()
    }
}
