//! Drift templates and the template matrix F.
//!
//! Each template owns a contiguous range of the amplitude vector. Amplitude
//! indices are handed out in a fixed order (observation, interval, detector,
//! step) so every worker derives the same assignment from its own data.

pub mod matrix;
pub mod offset;
pub mod subharmonic;

pub use matrix::TemplateMatrix;
pub use offset::OffsetTemplate;
pub use subharmonic::SubharmonicTemplate;

use crate::amplitudes::AmplitudeScope;
use crate::data::DetWeights;
use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::Signal;
use ndarray::{Array1, ArrayView1};
use std::ops::Range;

/// One (stream, sample range) tuple and the first amplitude it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub stream: usize,
    pub samples: Range<usize>,
    pub amplitude: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Groups segment indices by stream so streams can be processed in parallel.
pub(crate) fn segments_by_stream(segments: &[Segment], nstream: usize) -> Vec<Vec<usize>> {
    let mut grouped = vec![Vec::new(); nstream];
    for (index, segment) in segments.iter().enumerate() {
        grouped[segment.stream].push(index);
    }
    grouped
}

pub(crate) fn detector_weight(detweights: &DetWeights, obs: usize, det: usize) -> DestripeResult<f64> {
    detweights
        .get(obs)
        .and_then(|weights| weights.get(det))
        .copied()
        .ok_or_else(|| {
            DestripeError::InvalidInput(format!(
                "no detector weight for observation {} detector {}",
                obs, det
            ))
        })
}

/// Closed set of drift models that can be fitted.
#[derive(Debug, Clone)]
pub enum Template {
    Offset(OffsetTemplate),
    Subharmonic(SubharmonicTemplate),
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Template::Offset(_) => OffsetTemplate::NAME,
            Template::Subharmonic(_) => SubharmonicTemplate::NAME,
        }
    }

    pub fn namplitude(&self) -> usize {
        match self {
            Template::Offset(template) => template.namplitude(),
            Template::Subharmonic(template) => template.namplitude(),
        }
    }

    pub fn scope(&self) -> AmplitudeScope {
        AmplitudeScope::Local
    }

    /// signal += F·a
    pub fn add_to_signal(&self, signal: &mut Signal, amplitudes: ArrayView1<f64>) {
        match self {
            Template::Offset(template) => template.add_to_signal(signal, amplitudes),
            Template::Subharmonic(template) => template.add_to_signal(signal, amplitudes),
        }
    }

    /// a += Fᵗ·signal
    pub fn project_signal(&self, signal: &Signal, amplitudes: &mut Array1<f64>) {
        match self {
            Template::Offset(template) => template.project_signal(signal, amplitudes),
            Template::Subharmonic(template) => template.project_signal(signal, amplitudes),
        }
    }

    /// a' += C_a⁻¹·a
    pub fn add_prior(&self, input: ArrayView1<f64>, output: &mut Array1<f64>) {
        match self {
            Template::Offset(template) => template.add_prior(input, output),
            Template::Subharmonic(_) => {}
        }
    }

    /// a' += M⁻¹·a
    pub fn apply_precond(&self, input: ArrayView1<f64>, output: &mut Array1<f64>) {
        match self {
            Template::Offset(template) => template.apply_precond(input, output),
            Template::Subharmonic(template) => template.apply_precond(input, output),
        }
    }
}

impl From<OffsetTemplate> for Template {
    fn from(template: OffsetTemplate) -> Self {
        Template::Offset(template)
    }
}

impl From<SubharmonicTemplate> for Template {
    fn from(template: SubharmonicTemplate) -> Self {
        Template::Subharmonic(template)
    }
}
