//! Destriping map-maker core.
//!
//! Slowly drifting detector noise is modelled as a linear combination of
//! templates (baseline offsets, low-order Legendre polynomials). The template
//! amplitudes are solved from the normal equations
//! (FᵗN⁻¹ZF + C_a⁻¹)·a = FᵗN⁻¹Z·y with preconditioned conjugate gradients,
//! where Z projects out the sky, and the fitted drifts are subtracted from
//! the time-ordered data before binning maps.

pub mod amplitudes;
pub mod comm;
pub mod data;
pub mod math;
pub mod pixels;
pub mod prelude;
pub mod processing;
pub mod signal;
pub mod telemetry;
pub mod templates;

pub use amplitudes::{AmplitudeBlock, AmplitudeScope, TemplateAmplitudes};
pub use comm::{Reducer, SerialReducer, ThreadGroupReducer};
pub use data::{Dataset, DetWeights, DetectorData, FlagMasks, Interval, NoiseModel, NoisePsd, Observation};
pub use pixels::{JsonMapSink, MapSink, MemorySink, PixelMap};
pub use prelude::{DestripeError, DestripeResult, MapMakerConfig, SignalOperator, SolverConfig};
pub use processing::{MapMaker, MapMakerReport, SolveStatus};
pub use signal::{Signal, SignalLayout};
pub use templates::{OffsetTemplate, SubharmonicTemplate, Template, TemplateMatrix};
