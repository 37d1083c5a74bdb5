use crate::data::{Dataset, DetWeights, FlagMasks};
use crate::pixels::PixelMap;
use crate::prelude::{DestripeError, DestripeResult, SignalOperator};
use crate::signal::Signal;
use rayon::prelude::*;

/// Diagonal inverse noise covariance N⁻¹.
///
/// Scales every stream by its detector weight, zeroes flagged samples and
/// optionally multiplies by a static weight map sampled at the pointing.
pub struct NoiseMatrix<'a> {
    data: &'a Dataset,
    detweights: &'a DetWeights,
    weight_map: Option<&'a PixelMap>,
    masks: FlagMasks,
}

impl<'a> NoiseMatrix<'a> {
    pub fn new(
        data: &'a Dataset,
        detweights: &'a DetWeights,
        weight_map: Option<&'a PixelMap>,
        masks: FlagMasks,
    ) -> Self {
        Self {
            data,
            detweights,
            weight_map,
            masks,
        }
    }
}

impl SignalOperator for NoiseMatrix<'_> {
    fn apply(&self, signal: &Signal) -> DestripeResult<Signal> {
        self.data.check_layout(signal.layout(), "noise matrix")?;
        let layout = signal.layout().clone();
        let mut weighted = signal.clone();
        weighted
            .streams_mut()
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(stream, samples)| -> DestripeResult<()> {
                let (iobs, idet) = layout.locate(stream);
                let obs = &self.data.observations[iobs];
                let detweight = self
                    .detweights
                    .get(iobs)
                    .and_then(|weights| weights.get(idet))
                    .copied()
                    .ok_or_else(|| {
                        DestripeError::InvalidInput(format!(
                            "no detector weight for observation {} detector {}",
                            iobs, idet
                        ))
                    })?;
                let pixels = &obs.detectors[idet].pixels;
                for (sample, value) in samples.iter_mut().enumerate() {
                    if obs.is_flagged(idet, sample, self.masks) {
                        *value = 0.0;
                        continue;
                    }
                    *value *= detweight;
                    if let Some(map) = self.weight_map {
                        let pixel = pixels[sample];
                        *value *= if pixel < 0 || pixel as usize >= map.npix() {
                            0.0
                        } else {
                            map.pixel(pixel as usize)[0]
                        };
                    }
                }
                Ok(())
            })?;
        Ok(weighted)
    }

    fn apply_transpose(&self, signal: &Signal) -> DestripeResult<Signal> {
        self.apply(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DetectorData, Observation};
    use crate::signal::{ObsLayout, SignalLayout};
    use ndarray::{Array1, Array2};
    use std::sync::Arc;

    fn dataset() -> Dataset {
        let mut obs = Observation::new("obs", vec![0.0, 1.0, 2.0, 3.0]);
        let mut a = DetectorData::new("a", vec![0, 1, -1, 1], Array2::ones((4, 1)))
            .with_signal("signal", Array1::from(vec![1.0, 2.0, 3.0, 4.0]));
        a.flags = vec![0, 1, 0, 2];
        let b = DetectorData::new("b", vec![1, 1, 0, 0], Array2::ones((4, 1)))
            .with_signal("signal", Array1::from(vec![1.0, 1.0, 1.0, 1.0]));
        obs.add_detector(a).unwrap();
        obs.add_detector(b).unwrap();
        obs.common_flags = vec![0, 0, 0, 4];
        Dataset::new(vec![obs])
    }

    #[test]
    fn weights_and_flags_are_applied() {
        let data = dataset();
        let layout = data.layout();
        let signal = data.read_signal("signal", &layout).unwrap();
        let detweights = vec![vec![2.0, 0.5]];
        let noise = NoiseMatrix::new(&data, &detweights, None, FlagMasks::new(1, 1));
        let weighted = noise.apply(&signal).unwrap();
        // detector flag 1 masks sample 1; flag 2 is not in the mask
        assert_eq!(weighted.stream(0, 0).to_vec(), vec![2.0, 0.0, 6.0, 8.0]);
        assert_eq!(weighted.stream(0, 1).to_vec(), vec![0.5; 4]);

        let strict = NoiseMatrix::new(&data, &detweights, None, FlagMasks::new(4, 3));
        let weighted = strict.apply_transpose(&signal).unwrap();
        assert_eq!(weighted.stream(0, 0).to_vec(), vec![2.0, 0.0, 6.0, 0.0]);
        assert_eq!(weighted.stream(0, 1).to_vec(), vec![0.5, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn weight_map_scales_by_pixel_and_drops_unpointed_samples() {
        let data = dataset();
        let layout = data.layout();
        let signal = data.read_signal("signal", &layout).unwrap();
        let detweights = vec![vec![1.0, 1.0]];
        let weight_map = PixelMap::from_data(Array2::from_shape_vec((2, 1), vec![3.0, 0.5]).unwrap());
        let noise = NoiseMatrix::new(&data, &detweights, Some(&weight_map), FlagMasks::new(0, 0));
        let weighted = noise.apply(&signal).unwrap();
        assert_eq!(weighted.stream(0, 0).to_vec(), vec![3.0, 1.0, 0.0, 2.0]);
        assert_eq!(weighted.stream(0, 1).to_vec(), vec![0.5, 0.5, 3.0, 3.0]);
    }

    #[test]
    fn longer_streams_are_a_layout_mismatch() {
        let data = dataset();
        let layout = Arc::new(SignalLayout::new(vec![ObsLayout { ndet: 2, nsamp: 6 }]));
        let signal = Signal::zeros(layout);
        let detweights = vec![vec![1.0, 1.0]];
        let noise = NoiseMatrix::new(&data, &detweights, None, FlagMasks::new(1, 1));
        let err = noise.apply(&signal).unwrap_err();
        assert!(matches!(err, DestripeError::LayoutMismatch(_)));
    }

    #[test]
    fn missing_weights_are_an_error() {
        let data = dataset();
        let layout = data.layout();
        let signal = data.read_signal("signal", &layout).unwrap();
        let detweights = vec![vec![1.0]];
        let noise = NoiseMatrix::new(&data, &detweights, None, FlagMasks::new(1, 1));
        assert!(noise.apply(&signal).is_err());
    }
}
