use crate::prelude::{DestripeError, DestripeResult};
use num_complex::Complex64;
use rustfft::{num_traits::Zero, Fft, FftPlanner};

/// Helper that wraps the `rustfft` planner for inverse real transforms.
pub struct FftHelper {
    fft: std::sync::Arc<dyn Fft<f64>>,
    scratch: Vec<Complex64>,
}

impl FftHelper {
    /// Plans an inverse transform producing `size` real samples.
    pub fn inverse(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_inverse(size);
        let scratch = vec![Complex64::zero(); fft.get_inplace_scratch_len()];
        Self { fft, scratch }
    }

    pub fn len(&self) -> usize {
        self.fft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inverse of a real-input FFT given its non-negative frequency half.
    ///
    /// The half spectrum must hold `len / 2 + 1` real coefficients, which is
    /// the only case needed for the symmetric spectra used here. The output is
    /// scaled by `1 / len` to match the usual `irfft` convention.
    pub fn inverse_real(&mut self, half: &[f64]) -> DestripeResult<Vec<f64>> {
        let size = self.len();
        if size == 0 || half.len() != size / 2 + 1 {
            return Err(DestripeError::InvalidInput(format!(
                "half spectrum of {} values cannot produce {} samples",
                half.len(),
                size
            )));
        }
        let mut buffer = vec![Complex64::zero(); size];
        for (k, &value) in half.iter().enumerate() {
            buffer[k] = Complex64::new(value, 0.0);
            if k > 0 && k < size - k {
                buffer[size - k] = Complex64::new(value, 0.0);
            }
        }
        self.fft.process_with_scratch(&mut buffer, &mut self.scratch);
        let norm = 1.0 / size as f64;
        Ok(buffer.iter().map(|value| value.re * norm).collect())
    }
}

/// Sample frequencies of a real FFT of length `n` with sample spacing `spacing`.
pub fn rfft_frequencies(n: usize, spacing: f64) -> Vec<f64> {
    let scale = 1.0 / (n as f64 * spacing);
    (0..=n / 2).map(|k| k as f64 * scale).collect()
}
