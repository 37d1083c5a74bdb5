use super::PixelMap;
use crate::data::{Dataset, DetWeights, FlagMasks};
use crate::math::matrix::MatrixHelper;
use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::{Signal, SignalLayout};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Detector flag bit raised on samples that fall outside the processing mask.
pub const MASK_BIT: u8 = 128;

/// Number of independent elements of a symmetric `nnz` x `nnz` matrix.
pub fn ncov(nnz: usize) -> usize {
    nnz * (nnz + 1) / 2
}

/// Position of element (row, col), row <= col, in upper-triangular row-major
/// storage.
fn cov_index(row: usize, col: usize, nnz: usize) -> usize {
    row * (2 * nnz - row + 1) / 2 + (col - row)
}

fn unpack(values: ArrayView1<f64>, nnz: usize) -> Array2<f64> {
    let mut matrix = Array2::zeros((nnz, nnz));
    for row in 0..nnz {
        for col in row..nnz {
            let value = values[cov_index(row, col, nnz)];
            matrix[[row, col]] = value;
            matrix[[col, row]] = value;
        }
    }
    matrix
}

fn checked_pixel(pixel: i64, npix: usize) -> DestripeResult<Option<usize>> {
    if pixel < 0 {
        return Ok(None);
    }
    let pixel = pixel as usize;
    if pixel >= npix {
        return Err(DestripeError::InvalidInput(format!(
            "pixel {} is outside a map of {} pixels",
            pixel, npix
        )));
    }
    Ok(Some(pixel))
}

/// Sorted pixels hit by any local detector.
pub fn local_pixels(data: &Dataset) -> Vec<usize> {
    let mut pixels = BTreeSet::new();
    for obs in &data.observations {
        for det in &obs.detectors {
            pixels.extend(det.pixels.iter().filter(|&&p| p >= 0).map(|&p| p as usize));
        }
    }
    pixels.into_iter().collect()
}

/// Submaps containing at least one of `pixels`.
pub fn local_submaps(pixels: &[usize], submap_npix: usize) -> Vec<usize> {
    let submaps: BTreeSet<usize> = pixels
        .iter()
        .map(|&pixel| pixel / submap_npix.max(1))
        .collect();
    submaps.into_iter().collect()
}

/// Accumulates noise-weighted time-domain data into pixel maps.
pub struct Binner<'a> {
    detweights: &'a DetWeights,
    npix: usize,
    nnz: usize,
    masks: FlagMasks,
}

impl<'a> Binner<'a> {
    pub fn new(detweights: &'a DetWeights, npix: usize, nnz: usize, masks: FlagMasks) -> Self {
        Self {
            detweights,
            npix,
            nnz,
            masks,
        }
    }

    fn weight(&self, obs: usize, det: usize) -> DestripeResult<f64> {
        self.detweights
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

    fn check_nnz(&self, found: usize, detector: &str) -> DestripeResult<()> {
        if found < self.nnz {
            return Err(DestripeError::InvalidInput(format!(
                "detector `{}` has {} pointing weights, the map needs {}",
                detector, found, self.nnz
            )));
        }
        Ok(())
    }

    /// Local hit counts and the local inverse white-noise covariance
    /// Σ w·PᵢPⱼ in upper-triangular storage.
    pub fn accumulate_covariance(&self, data: &Dataset) -> DestripeResult<(PixelMap, PixelMap)> {
        let nnz = self.nnz;
        let mut hits = PixelMap::zeros(self.npix, 1);
        let mut invnpp = PixelMap::zeros(self.npix, ncov(nnz));
        for (iobs, obs) in data.observations.iter().enumerate() {
            for (idet, det) in obs.detectors.iter().enumerate() {
                self.check_nnz(det.nnz(), &det.name)?;
                let detweight = self.weight(iobs, idet)?;
                for sample in 0..obs.nsamp() {
                    if obs.is_flagged(idet, sample, self.masks) {
                        continue;
                    }
                    let Some(pixel) = checked_pixel(det.pixels[sample], self.npix)? else {
                        continue;
                    };
                    hits.pixel_mut(pixel)[0] += 1.0;
                    let weights = det.weights.row(sample);
                    let mut cov = invnpp.pixel_mut(pixel);
                    for row in 0..nnz {
                        for col in row..nnz {
                            cov[cov_index(row, col, nnz)] += detweight * weights[row] * weights[col];
                        }
                    }
                }
            }
        }
        Ok((hits, invnpp))
    }

    /// Local noise-weighted map Σ w·Pᵗ·signal over unflagged samples.
    pub fn bin_signal(&self, data: &Dataset, signal: &Signal) -> DestripeResult<PixelMap> {
        self.bin(data, signal, true)
    }

    /// Local Pᵗ·signal over every pointed sample, ignoring detector weights
    /// and flags.
    pub fn bin_pointing(&self, data: &Dataset, signal: &Signal) -> DestripeResult<PixelMap> {
        self.bin(data, signal, false)
    }

    fn bin(&self, data: &Dataset, signal: &Signal, weighted: bool) -> DestripeResult<PixelMap> {
        data.check_layout(signal.layout(), "binning")?;
        let mut map = PixelMap::zeros(self.npix, self.nnz);
        for (iobs, obs) in data.observations.iter().enumerate() {
            for (idet, det) in obs.detectors.iter().enumerate() {
                self.check_nnz(det.nnz(), &det.name)?;
                let detweight = if weighted {
                    self.weight(iobs, idet)?
                } else {
                    1.0
                };
                let samples = signal.stream(iobs, idet);
                for sample in 0..obs.nsamp() {
                    if weighted && obs.is_flagged(idet, sample, self.masks) {
                        continue;
                    }
                    let Some(pixel) = checked_pixel(det.pixels[sample], self.npix)? else {
                        continue;
                    };
                    let value = detweight * samples[sample];
                    let weights = det.weights.row(sample);
                    let mut target = map.pixel_mut(pixel);
                    for inz in 0..self.nnz {
                        target[inz] += value * weights[inz];
                    }
                }
            }
        }
        Ok(map)
    }
}

enum Inversion {
    Empty,
    Rejected,
    Inverted(Array1<f64>),
}

/// Inverts every pixel block of a packed covariance in place.
///
/// Blocks whose reciprocal condition number falls below `rcond_limit` are
/// zeroed. Returns the number of rejected pixels that had any hits.
pub fn covariance_invert(cov: &mut PixelMap, nnz: usize, rcond_limit: f64) -> DestripeResult<usize> {
    if cov.nnz() != ncov(nnz) {
        return Err(DestripeError::LayoutMismatch(format!(
            "covariance has {} values per pixel, expected {}",
            cov.nnz(),
            ncov(nnz)
        )));
    }
    let inverted: Vec<Inversion> = (0..cov.npix())
        .into_par_iter()
        .map(|pixel| {
            let values = cov.pixel(pixel);
            if values.iter().all(|&v| v == 0.0) {
                return Inversion::Empty;
            }
            let result = MatrixHelper::invert_symmetric(unpack(values, nnz).view());
            match result.inverse {
                Some(inverse) if result.rcond >= rcond_limit => {
                    let mut packed = Array1::zeros(ncov(nnz));
                    for row in 0..nnz {
                        for col in row..nnz {
                            packed[cov_index(row, col, nnz)] = inverse[[row, col]];
                        }
                    }
                    Inversion::Inverted(packed)
                }
                _ => Inversion::Rejected,
            }
        })
        .collect();
    let mut rejected = 0;
    for (pixel, outcome) in inverted.into_iter().enumerate() {
        match outcome {
            Inversion::Empty => {}
            Inversion::Rejected => {
                cov.pixel_mut(pixel).fill(0.0);
                rejected += 1;
            }
            Inversion::Inverted(packed) => cov.pixel_mut(pixel).assign(&packed),
        }
    }
    Ok(rejected)
}

/// map ← C·map, pixel by pixel.
pub fn covariance_apply(cov: &PixelMap, map: &mut PixelMap) -> DestripeResult<()> {
    let nnz = map.nnz();
    if cov.npix() != map.npix() || cov.nnz() != ncov(nnz) {
        return Err(DestripeError::LayoutMismatch(
            "covariance does not match the map".into(),
        ));
    }
    map.data_mut()
        .outer_iter_mut()
        .into_par_iter()
        .enumerate()
        .for_each(|(pixel, mut values)| {
            let block = unpack(cov.pixel(pixel), nnz);
            let product = block.dot(&values);
            values.assign(&product);
        });
    Ok(())
}

/// Samples a map into time-domain streams: Σᵢ wᵢ·map[pixel, i].
///
/// Samples with negative pixel numbers read zero.
pub fn scan_map(
    data: &Dataset,
    layout: &Arc<SignalLayout>,
    map: &PixelMap,
) -> DestripeResult<Signal> {
    data.check_layout(layout, "scan")?;
    let nnz = map.nnz();
    let mut signal = Signal::zeros(Arc::clone(layout));
    let detectors: Vec<_> = data
        .observations
        .iter()
        .flat_map(|obs| obs.detectors.iter())
        .collect();
    signal
        .streams_mut()
        .par_iter_mut()
        .zip(detectors.par_iter())
        .try_for_each(|(samples, det)| -> DestripeResult<()> {
            if det.nnz() < nnz {
                return Err(DestripeError::InvalidInput(format!(
                    "detector `{}` has {} pointing weights, the map needs {}",
                    det.name,
                    det.nnz(),
                    nnz
                )));
            }
            for (sample, value) in samples.iter_mut().enumerate() {
                let Some(pixel) = checked_pixel(det.pixels[sample], map.npix())? else {
                    continue;
                };
                let weights = det.weights.row(sample);
                let values = map.pixel(pixel);
                *value = (0..nnz).map(|inz| weights[inz] * values[inz]).sum();
            }
            Ok(())
        })?;
    Ok(signal)
}

/// Raises `bit` in the detector flags of every sample whose pixel has a zero
/// value in the first column of `mask`.
pub fn scan_mask(data: &mut Dataset, mask: &PixelMap, bit: u8) -> DestripeResult<()> {
    for obs in &mut data.observations {
        for det in &mut obs.detectors {
            for (flag, &pixel) in det.flags.iter_mut().zip(&det.pixels) {
                let Some(pixel) = checked_pixel(pixel, mask.npix())? else {
                    continue;
                };
                if mask.pixel(pixel)[0] == 0.0 {
                    *flag |= bit;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DetectorData, Observation};
    use crate::signal::ObsLayout;
    use ndarray::array;

    fn dataset() -> Dataset {
        let mut obs = Observation::new("obs", vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let weights = array![
            [1.0, 1.0, 0.0],
            [1.0, 0.0, 1.0],
            [1.0, -1.0, 0.0],
            [1.0, 0.0, -1.0],
            [1.0, 1.0, 0.0]
        ];
        let det = DetectorData::new("det", vec![2, 2, 2, 2, -1], weights)
            .with_signal("signal", Array1::from(vec![1.0, 2.0, 3.0, 4.0, 5.0]));
        obs.add_detector(det).unwrap();
        Dataset::new(vec![obs])
    }

    #[test]
    fn packed_indices_cover_the_upper_triangle() {
        let indices: Vec<usize> = (0..3)
            .flat_map(|row| (row..3).map(move |col| cov_index(row, col, 3)))
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(ncov(3), 6);
    }

    #[test]
    fn hit_pixels_and_submaps() {
        let data = dataset();
        assert_eq!(local_pixels(&data), vec![2]);
        assert_eq!(local_submaps(&[2, 3, 17, 40], 16), vec![0, 1, 2]);
    }

    #[test]
    fn covariance_accumulates_weighted_outer_products() {
        let data = dataset();
        let detweights = vec![vec![2.0]];
        let binner = Binner::new(&detweights, 4, 3, FlagMasks::new(1, 1));
        let (hits, invnpp) = binner.accumulate_covariance(&data).unwrap();
        assert_eq!(hits.pixel(2)[0], 4.0);
        let cov = invnpp.pixel(2);
        assert_eq!(cov.to_vec(), vec![8.0, 0.0, 0.0, 4.0, 0.0, 4.0]);
    }

    #[test]
    fn binned_map_solves_for_stokes_values() {
        let mut data = dataset();
        // I = 2, Q = 0.5, U = -1 seen through the detector weights
        let sky = [2.0, 0.5, -1.0];
        let det = &mut data.observations[0].detectors[0];
        let stokes = array![sky[0], sky[1], sky[2]];
        let observed: Array1<f64> = det.weights.outer_iter().map(|w| w.dot(&stokes)).collect();
        det.signals.insert("signal".into(), observed);

        let detweights = vec![vec![1.0]];
        let binner = Binner::new(&detweights, 4, 3, FlagMasks::new(1, 1));
        let (_, mut cov) = binner.accumulate_covariance(&data).unwrap();
        assert_eq!(covariance_invert(&mut cov, 3, 1e-3).unwrap(), 0);
        let layout = data.layout();
        let signal = data.read_signal("signal", &layout).unwrap();
        let mut map = binner.bin_signal(&data, &signal).unwrap();
        covariance_apply(&cov, &mut map).unwrap();
        for (value, expected) in map.pixel(2).iter().zip(sky) {
            assert!((value - expected).abs() < 1e-12);
        }

        let scanned = scan_map(&data, &layout, &map).unwrap();
        let samples = scanned.stream(0, 0);
        for sample in 0..4 {
            assert!((samples[sample] - signal.stream(0, 0)[sample]).abs() < 1e-12);
        }
        assert_eq!(samples[4], 0.0);
    }

    #[test]
    fn binning_and_scanning_reject_foreign_layouts() {
        let data = dataset();
        let layout = Arc::new(SignalLayout::new(vec![ObsLayout { ndet: 1, nsamp: 8 }]));
        let signal = Signal::zeros(Arc::clone(&layout));
        let detweights = vec![vec![1.0]];
        let binner = Binner::new(&detweights, 4, 3, FlagMasks::new(1, 1));
        assert!(matches!(
            binner.bin_signal(&data, &signal),
            Err(DestripeError::LayoutMismatch(_))
        ));
        assert!(matches!(
            binner.bin_pointing(&data, &signal),
            Err(DestripeError::LayoutMismatch(_))
        ));
        let map = PixelMap::zeros(4, 3);
        assert!(matches!(
            scan_map(&data, &layout, &map),
            Err(DestripeError::LayoutMismatch(_))
        ));
    }

    #[test]
    fn poorly_conditioned_pixels_are_rejected() {
        let mut cov = PixelMap::zeros(2, 3);
        // pixel 0 only has intensity sensitivity
        cov.pixel_mut(0).assign(&array![4.0, 0.0, 0.0, 1e-6, 0.0, 1e-6]);
        cov.pixel_mut(1).assign(&array![2.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
        let rejected = covariance_invert(&mut cov, 3, 1e-3).unwrap();
        assert_eq!(rejected, 1);
        assert!(cov.pixel(0).iter().all(|&v| v == 0.0));
        let expected = [0.5, 0.0, 0.0, 1.0, 0.0, 1.0];
        for (value, expected) in cov.pixel(1).iter().zip(expected) {
            assert!((value - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn mask_raises_flag_bit_on_masked_pixels() {
        let mut data = dataset();
        let mut mask = PixelMap::zeros(4, 1);
        mask.fill(1.0);
        mask.pixel_mut(2)[0] = 0.0;
        scan_mask(&mut data, &mask, MASK_BIT).unwrap();
        let flags = &data.observations[0].detectors[0].flags;
        assert_eq!(flags, &vec![MASK_BIT, MASK_BIT, MASK_BIT, MASK_BIT, 0]);
    }

    #[test]
    fn out_of_range_pixel_is_an_error() {
        let data = dataset();
        let detweights = vec![vec![1.0]];
        let binner = Binner::new(&detweights, 2, 3, FlagMasks::new(1, 1));
        assert!(binner.accumulate_covariance(&data).is_err());
    }
}
