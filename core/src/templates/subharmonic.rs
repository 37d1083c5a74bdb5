use super::{detector_weight, segments_by_stream, Segment};
use crate::data::{Dataset, DetWeights, FlagMasks};
use crate::math::matrix::MatrixHelper;
use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::Signal;
use ndarray::{s, Array1, Array2, ArrayView1};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Legendre polynomials P₀..P_order evaluated on `len` evenly spaced points
/// spanning [−1, 1]. Row k holds P_k.
pub fn legendre_basis(order: usize, len: usize) -> Array2<f64> {
    let x: Array1<f64> = Array1::linspace(-1.0, 1.0, len);
    let mut basis = Array2::zeros((order + 1, len));
    basis.row_mut(0).fill(1.0);
    if order >= 1 {
        basis.row_mut(1).assign(&x);
    }
    for n in 1..order {
        let nf = n as f64;
        let next = (&basis.row(n) * &x * (2.0 * nf + 1.0) - &basis.row(n - 1) * nf) / (nf + 1.0);
        basis.row_mut(n + 1).assign(&next);
    }
    basis
}

/// Low-order Legendre polynomials fitted over each interval.
#[derive(Debug, Clone)]
pub struct SubharmonicTemplate {
    order: usize,
    namplitude: usize,
    segments: Vec<Segment>,
    by_stream: Vec<Vec<usize>>,
    bases: BTreeMap<usize, Array2<f64>>,
    /// Inverse Gram matrix of each segment.
    preconditioners: Vec<Array2<f64>>,
}

impl SubharmonicTemplate {
    pub const NAME: &'static str = "subharmonic";

    pub fn new(
        data: &Dataset,
        detweights: &DetWeights,
        order: usize,
        intervals: &str,
        masks: FlagMasks,
    ) -> DestripeResult<Self> {
        let layout = data.layout();
        let norder = order + 1;
        let mut segments = Vec::new();
        let mut bases = BTreeMap::new();
        let mut preconditioners = Vec::new();
        let mut namplitude = 0;

        for (iobs, obs) in data.observations.iter().enumerate() {
            for interval in obs.local_intervals(intervals)? {
                let len = interval.len();
                if len == 0 {
                    return Err(DestripeError::InvalidInput(format!(
                        "empty interval in observation `{}`",
                        obs.name
                    )));
                }
                let basis = bases
                    .entry(len)
                    .or_insert_with(|| legendre_basis(order, len));
                for idet in 0..obs.detectors.len() {
                    let weight = detector_weight(detweights, iobs, idet)?;
                    let mut gram = Array2::<f64>::zeros((norder, norder));
                    for (offset, sample) in interval.samples().enumerate() {
                        if obs.is_flagged(idet, sample, masks) {
                            continue;
                        }
                        let column = basis.column(offset);
                        for i in 0..norder {
                            for j in i..norder {
                                gram[[i, j]] += column[i] * column[j];
                            }
                        }
                    }
                    for i in 0..norder {
                        for j in 0..i {
                            gram[[i, j]] = gram[[j, i]];
                        }
                    }
                    gram.mapv_inplace(|value| value * weight);
                    preconditioners.push(MatrixHelper::invert_gram(gram.view()).map_err(
                        |err| match err {
                            DestripeError::Singular(detail) => DestripeError::Singular(format!(
                                "subharmonic segment of detector `{}` in observation `{}`: {}",
                                obs.detectors[idet].name, obs.name, detail
                            )),
                            other => other,
                        },
                    )?);
                    segments.push(Segment {
                        stream: layout.stream_index(iobs, idet),
                        samples: interval.samples(),
                        amplitude: namplitude,
                    });
                    namplitude += norder;
                }
            }
        }

        let by_stream = segments_by_stream(&segments, layout.nstream());
        Ok(Self {
            order,
            namplitude,
            segments,
            by_stream,
            bases,
            preconditioners,
        })
    }

    pub fn namplitude(&self) -> usize {
        self.namplitude
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn basis(&self, segment: &Segment) -> &Array2<f64> {
        &self.bases[&segment.len()]
    }

    pub fn add_to_signal(&self, signal: &mut Signal, amplitudes: ArrayView1<f64>) {
        let norder = self.order + 1;
        signal
            .streams_mut()
            .par_iter_mut()
            .zip(self.by_stream.par_iter())
            .for_each(|(samples, indices)| {
                for &index in indices {
                    let segment = &self.segments[index];
                    let coefficients =
                        amplitudes.slice(s![segment.amplitude..segment.amplitude + norder]);
                    let model = coefficients.dot(self.basis(segment));
                    let mut target = samples.slice_mut(s![segment.samples.clone()]);
                    target += &model;
                }
            });
    }

    pub fn project_signal(&self, signal: &Signal, amplitudes: &mut Array1<f64>) {
        let projections: Vec<Vec<(usize, Array1<f64>)>> = signal
            .streams()
            .par_iter()
            .zip(self.by_stream.par_iter())
            .map(|(samples, indices)| {
                indices
                    .iter()
                    .map(|&index| {
                        let segment = &self.segments[index];
                        let values = samples.slice(s![segment.samples.clone()]);
                        (segment.amplitude, self.basis(segment).dot(&values))
                    })
                    .collect()
            })
            .collect();
        let norder = self.order + 1;
        for (first, values) in projections.into_iter().flatten() {
            let mut target = amplitudes.slice_mut(s![first..first + norder]);
            target += &values;
        }
    }

    pub fn apply_precond(&self, input: ArrayView1<f64>, output: &mut Array1<f64>) {
        let norder = self.order + 1;
        for (segment, inverse) in self.segments.iter().zip(&self.preconditioners) {
            let range = segment.amplitude..segment.amplitude + norder;
            let values = inverse.dot(&input.slice(s![range.clone()]));
            let mut target = output.slice_mut(s![range]);
            target += &values;
        }
    }
}
