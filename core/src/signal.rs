//! Time-domain vectors over (observation, detector, sample).

use crate::comm::Reducer;
use crate::prelude::{DestripeError, DestripeResult};
use ndarray::Array1;
use std::sync::Arc;

/// Shape of one observation in a [`SignalLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObsLayout {
    pub ndet: usize,
    pub nsamp: usize,
}

/// Stream geometry shared by every signal built from one dataset.
///
/// Streams are ordered by observation, then by local detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalLayout {
    observations: Vec<ObsLayout>,
    offsets: Vec<usize>,
}

impl SignalLayout {
    pub fn new(observations: Vec<ObsLayout>) -> Self {
        let mut offsets = Vec::with_capacity(observations.len());
        let mut total = 0;
        for obs in &observations {
            offsets.push(total);
            total += obs.ndet;
        }
        Self {
            observations,
            offsets,
        }
    }

    pub fn observations(&self) -> &[ObsLayout] {
        &self.observations
    }

    pub fn nstream(&self) -> usize {
        self.observations.iter().map(|obs| obs.ndet).sum()
    }

    pub fn stream_index(&self, obs: usize, det: usize) -> usize {
        self.offsets[obs] + det
    }

    /// Observation and detector indices of a stream.
    pub fn locate(&self, stream: usize) -> (usize, usize) {
        let obs = self.offsets.partition_point(|&offset| offset <= stream) - 1;
        (obs, stream - self.offsets[obs])
    }

    pub fn stream_nsamp(&self, stream: usize) -> usize {
        self.observations[self.locate(stream).0].nsamp
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    layout: Arc<SignalLayout>,
    streams: Vec<Array1<f64>>,
}

impl Signal {
    pub fn zeros(layout: Arc<SignalLayout>) -> Self {
        let streams = layout
            .observations()
            .iter()
            .flat_map(|obs| (0..obs.ndet).map(move |_| Array1::zeros(obs.nsamp)))
            .collect();
        Self { layout, streams }
    }

    pub fn from_streams(
        layout: Arc<SignalLayout>,
        streams: Vec<Array1<f64>>,
    ) -> DestripeResult<Self> {
        if streams.len() != layout.nstream() {
            return Err(DestripeError::LayoutMismatch(format!(
                "{} streams supplied for a layout with {}",
                streams.len(),
                layout.nstream()
            )));
        }
        for (index, stream) in streams.iter().enumerate() {
            let expected = layout.stream_nsamp(index);
            if stream.len() != expected {
                return Err(DestripeError::LayoutMismatch(format!(
                    "stream {} has {} samples, expected {}",
                    index,
                    stream.len(),
                    expected
                )));
            }
        }
        Ok(Self { layout, streams })
    }

    pub fn layout(&self) -> &Arc<SignalLayout> {
        &self.layout
    }

    pub fn streams(&self) -> &[Array1<f64>] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [Array1<f64>] {
        &mut self.streams
    }

    pub fn stream(&self, obs: usize, det: usize) -> &Array1<f64> {
        &self.streams[self.layout.stream_index(obs, det)]
    }

    pub fn stream_mut(&mut self, obs: usize, det: usize) -> &mut Array1<f64> {
        let index = self.layout.stream_index(obs, det);
        &mut self.streams[index]
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(Arc::clone(&self.layout))
    }

    fn check_layout(&self, other: &Signal) -> DestripeResult<()> {
        if Arc::ptr_eq(&self.layout, &other.layout) || self.layout == other.layout {
            Ok(())
        } else {
            Err(DestripeError::LayoutMismatch(
                "signals do not share the same stream geometry".into(),
            ))
        }
    }

    /// self += alpha * other
    pub fn axpy(&mut self, alpha: f64, other: &Signal) -> DestripeResult<()> {
        self.check_layout(other)?;
        for (mine, theirs) in self.streams.iter_mut().zip(&other.streams) {
            mine.scaled_add(alpha, theirs);
        }
        Ok(())
    }

    pub fn add_assign(&mut self, other: &Signal) -> DestripeResult<()> {
        self.axpy(1.0, other)
    }

    pub fn sub_assign(&mut self, other: &Signal) -> DestripeResult<()> {
        self.axpy(-1.0, other)
    }

    pub fn scale(&mut self, factor: f64) {
        for stream in &mut self.streams {
            stream.mapv_inplace(|value| value * factor);
        }
    }

    /// Local contribution to the dot product, without any reduction.
    pub fn local_dot(&self, other: &Signal) -> DestripeResult<f64> {
        self.check_layout(other)?;
        Ok(self
            .streams
            .iter()
            .zip(&other.streams)
            .map(|(mine, theirs)| mine.dot(theirs))
            .sum())
    }

    pub fn dot(&self, other: &Signal, reducer: &dyn Reducer) -> DestripeResult<f64> {
        Ok(reducer.all_reduce_sum(self.local_dot(other)?))
    }
}
