use crate::prelude::{DestripeError, DestripeResult};
use ndarray::{Array1, ArrayView1};

/// Discrete convolution with an odd-length kernel centred on zero lag,
/// returning as many values as the input ("same" mode).
pub fn convolve_same(input: ArrayView1<f64>, kernel: &[f64]) -> Array1<f64> {
    let n = input.len();
    let half = (kernel.len() / 2) as isize;
    let mut output = Array1::zeros(n);
    for (i, out) in output.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &weight) in kernel.iter().enumerate() {
            let j = i as isize + half - k as isize;
            if j >= 0 && (j as usize) < n {
                acc += weight * input[j as usize];
            }
        }
        *out = acc;
    }
    output
}

/// Cuts an inverse-FFT kernel down to the lags that matter.
///
/// `raw` is the wrapped output of an inverse real FFT (lag 0 first). The kept
/// half-width is the last lag in the first half whose magnitude exceeds
/// `limit * |raw[0]|`, bumped to an odd number. The result is rolled so that
/// lag 0 sits in the middle, has odd length and is symmetric.
pub fn truncate_kernel(raw: &[f64], limit: f64) -> DestripeResult<Vec<f64>> {
    let n = raw.len();
    let center = n / 2;
    let threshold = raw.first().map(|v| v.abs() * limit).unwrap_or(0.0);
    let mut cut = raw[..center]
        .iter()
        .rposition(|v| v.abs() > threshold)
        .ok_or(DestripeError::EmptyFilter(limit))?;
    if cut % 2 == 0 {
        cut += 1;
    }
    let cut = cut.min(n - center - 1).min(center);
    Ok((0..2 * cut + 1)
        .map(|i| {
            let lag = i as isize - cut as isize;
            raw[lag.rem_euclid(n as isize) as usize]
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn delta_kernel_is_identity() {
        let input = array![1.0, -2.0, 3.0];
        let output = convolve_same(input.view(), &[0.0, 1.0, 0.0]);
        assert_eq!(output, input);
    }

    #[test]
    fn same_mode_keeps_centre() {
        let input = array![1.0, 0.0, 0.0, 0.0];
        let output = convolve_same(input.view(), &[0.5, 1.0, 0.25]);
        assert_eq!(output.to_vec(), vec![1.0, 0.25, 0.0, 0.0]);
        let input = array![0.0, 1.0, 0.0, 0.0];
        let output = convolve_same(input.view(), &[0.5, 1.0, 0.25]);
        assert_eq!(output.to_vec(), vec![0.5, 1.0, 0.25, 0.0]);
    }

    #[test]
    fn truncated_kernel_is_odd_and_symmetric() {
        let n = 20;
        let raw: Vec<f64> = (0..n)
            .map(|k| {
                let lag = k.min(n - k) as f64;
                (-lag).exp()
            })
            .collect();
        let kernel = truncate_kernel(&raw, 1e-3).unwrap();
        assert_eq!(kernel.len() % 2, 1);
        let mid = kernel.len() / 2;
        assert_eq!(kernel[mid], 1.0);
        for i in 0..mid {
            assert_eq!(kernel[i], kernel[kernel.len() - 1 - i]);
        }
        // exp(-6) > 1e-3 > exp(-7), half-width 6 bumped to 7
        assert_eq!(mid, 7);
    }

    #[test]
    fn wide_kernel_is_clipped_to_the_available_lags() {
        let raw = vec![1.0; 8];
        let kernel = truncate_kernel(&raw, 1e-4).unwrap();
        assert_eq!(kernel.len(), 7);
    }

    #[test]
    fn zero_kernel_is_an_error() {
        assert!(matches!(
            truncate_kernel(&[0.0; 6], 1e-4),
            Err(DestripeError::EmptyFilter(_))
        ));
    }
}
