use super::noise::NoiseMatrix;
use crate::comm::Reducer;
use crate::data::{Dataset, DetWeights, FlagMasks};
use crate::pixels::binning::{covariance_apply, scan_map, Binner};
use crate::pixels::PixelMap;
use crate::prelude::{DestripeResult, SignalOperator};
use crate::signal::Signal;

/// Sky deprojection Z = I − P(PᵗN⁻¹P)⁻¹PᵗN⁻¹.
///
/// `covariance` holds the already inverted white-noise covariance
/// (PᵗN⁻¹P)⁻¹, all-reduced over the group. Each application bins, reduces
/// and rescans, so it is a collective call.
pub struct ProjectionMatrix<'a> {
    data: &'a Dataset,
    binner: Binner<'a>,
    noise: NoiseMatrix<'a>,
    covariance: &'a PixelMap,
    reducer: &'a dyn Reducer,
}

impl<'a> ProjectionMatrix<'a> {
    pub fn new(
        data: &'a Dataset,
        detweights: &'a DetWeights,
        covariance: &'a PixelMap,
        npix: usize,
        nnz: usize,
        masks: FlagMasks,
        reducer: &'a dyn Reducer,
    ) -> Self {
        Self {
            data,
            binner: Binner::new(detweights, npix, nnz, masks),
            noise: NoiseMatrix::new(data, detweights, None, masks),
            covariance,
            reducer,
        }
    }

    fn bin_and_scan(&self, mut map: PixelMap, signal: &Signal) -> DestripeResult<Signal> {
        map.all_reduce(self.reducer)?;
        covariance_apply(self.covariance, &mut map)?;
        scan_map(self.data, signal.layout(), &map)
    }
}

impl SignalOperator for ProjectionMatrix<'_> {
    fn apply(&self, signal: &Signal) -> DestripeResult<Signal> {
        let map = self.binner.bin_signal(self.data, signal)?;
        let scanned = self.bin_and_scan(map, signal)?;
        let mut projected = signal.clone();
        projected.sub_assign(&scanned)?;
        Ok(projected)
    }

    fn apply_transpose(&self, signal: &Signal) -> DestripeResult<Signal> {
        let map = self.binner.bin_pointing(self.data, signal)?;
        let scanned = self.bin_and_scan(map, signal)?;
        let weighted = self.noise.apply(&scanned)?;
        let mut projected = signal.clone();
        projected.sub_assign(&weighted)?;
        Ok(projected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialReducer;
    use crate::data::{DetectorData, Observation};
    use crate::pixels::binning::covariance_invert;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const NPIX: usize = 6;
    const NNZ: usize = 3;

    fn dataset(rng: &mut StdRng) -> Dataset {
        let nsamp = 240;
        let mut obs = Observation::new("obs", (0..nsamp).map(|i| i as f64).collect());
        for idet in 0..2 {
            let pixels = (0..nsamp).map(|i| ((i / 4 + idet) % NPIX) as i64).collect();
            let weights = Array2::from_shape_fn((nsamp, NNZ), |(i, inz)| {
                let psi = 0.37 * i as f64 + idet as f64;
                match inz {
                    0 => 1.0,
                    1 => (2.0 * psi).cos(),
                    _ => (2.0 * psi).sin(),
                }
            });
            let signal: Array1<f64> = (0..nsamp).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let mut det = DetectorData::new(format!("det{}", idet), pixels, weights)
                .with_signal("signal", signal);
            det.flags[7] = 1;
            obs.add_detector(det).unwrap();
        }
        Dataset::new(vec![obs])
    }

    fn covariance(data: &Dataset, detweights: &DetWeights, masks: FlagMasks) -> PixelMap {
        let binner = Binner::new(detweights, NPIX, NNZ, masks);
        let (_, mut cov) = binner.accumulate_covariance(data).unwrap();
        covariance_invert(&mut cov, NNZ, 1e-3).unwrap();
        cov
    }

    #[test]
    fn sky_signal_is_removed() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut data = dataset(&mut rng);
        let masks = FlagMasks::new(1, 1);
        let detweights = vec![vec![1.0, 3.0]];
        let cov = covariance(&data, &detweights, masks);

        let sky = Array2::from_shape_fn((NPIX, NNZ), |(p, inz)| (p * 3 + inz) as f64 * 0.1);
        for det in &mut data.observations[0].detectors {
            let sky_tod: Array1<f64> = det
                .pixels
                .iter()
                .zip(det.weights.outer_iter())
                .map(|(&p, w)| w.dot(&sky.row(p as usize)))
                .collect();
            det.signals.insert("sky".into(), sky_tod);
        }
        let layout = data.layout();
        let signal = data.read_signal("sky", &layout).unwrap();
        let reducer = SerialReducer;
        let projection =
            ProjectionMatrix::new(&data, &detweights, &cov, NPIX, NNZ, masks, &reducer);
        let projected = projection.apply(&signal).unwrap();
        for stream in projected.streams() {
            assert!(stream.iter().all(|v| v.abs() < 1e-9));
        }
    }

    #[test]
    fn transpose_is_the_adjoint() {
        let mut rng = StdRng::seed_from_u64(2);
        let data = dataset(&mut rng);
        let masks = FlagMasks::new(1, 1);
        let detweights = vec![vec![1.0, 3.0]];
        let cov = covariance(&data, &detweights, masks);
        let layout = data.layout();
        let x = data.read_signal("signal", &layout).unwrap();
        let mut y = Signal::zeros(layout);
        for stream in y.streams_mut() {
            stream.mapv_inplace(|_| rng.gen_range(-1.0..1.0));
        }
        let reducer = SerialReducer;
        let projection =
            ProjectionMatrix::new(&data, &detweights, &cov, NPIX, NNZ, masks, &reducer);
        let lhs = projection.apply(&x).unwrap().dot(&y, &reducer).unwrap();
        let rhs = x.dot(&projection.apply_transpose(&y).unwrap(), &reducer).unwrap();
        assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0));
    }
}
