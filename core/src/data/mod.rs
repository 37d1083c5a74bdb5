//! Worker-local view of the distributed time-ordered dataset.

pub mod observation;

pub use observation::{DetectorData, FlagMasks, Interval, NoiseModel, NoisePsd, Observation};

use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::{ObsLayout, Signal, SignalLayout};
use std::sync::Arc;

/// Inverse white-noise variance per observation and local detector.
pub type DetWeights = Vec<Vec<f64>>;

/// Observations assigned to this worker.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub observations: Vec<Observation>,
}

impl Dataset {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn layout(&self) -> Arc<SignalLayout> {
        Arc::new(SignalLayout::new(
            self.observations
                .iter()
                .map(|obs| ObsLayout {
                    ndet: obs.detectors.len(),
                    nsamp: obs.nsamp(),
                })
                .collect(),
        ))
    }

    /// Copies the named detector signals into a new [`Signal`].
    pub fn read_signal(&self, name: &str, layout: &Arc<SignalLayout>) -> DestripeResult<Signal> {
        let mut streams = Vec::with_capacity(layout.nstream());
        for obs in &self.observations {
            for det in &obs.detectors {
                let samples =
                    det.signals
                        .get(name)
                        .ok_or_else(|| DestripeError::MissingSignal {
                            signal: name.to_string(),
                            observation: obs.name.clone(),
                            detector: det.name.clone(),
                        })?;
                streams.push(samples.clone());
            }
        }
        Signal::from_streams(Arc::clone(layout), streams)
    }

    /// Fails unless `layout` has exactly this dataset's streams and lengths.
    pub fn check_layout(&self, layout: &SignalLayout, context: &str) -> DestripeResult<()> {
        if *self.layout() != *layout {
            return Err(DestripeError::LayoutMismatch(format!(
                "{}: signal does not match the dataset",
                context
            )));
        }
        Ok(())
    }

    /// Stores `signal` under `name`, replacing any previous contents.
    pub fn write_signal(&mut self, name: &str, signal: &Signal) -> DestripeResult<()> {
        self.check_layout(signal.layout(), "write")?;
        let mut stream = 0;
        for obs in &mut self.observations {
            for det in &mut obs.detectors {
                det.signals
                    .insert(name.to_string(), signal.streams()[stream].clone());
                stream += 1;
            }
        }
        Ok(())
    }

    /// Number of local samples over all detectors.
    pub fn local_samples(&self) -> usize {
        self.observations
            .iter()
            .map(|obs| obs.nsamp() * obs.detectors.len())
            .sum()
    }
}
