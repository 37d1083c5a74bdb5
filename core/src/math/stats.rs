pub struct StatsHelper;

impl StatsHelper {
    pub fn median(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some(0.5 * (sorted[mid - 1] + sorted[mid]))
        } else {
            Some(sorted[mid])
        }
    }

    /// Piecewise-linear interpolation on increasing `xp`, clamped to the end
    /// values outside the sampled range.
    pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
        let n = xp.len().min(fp.len());
        if n == 0 {
            return 0.0;
        }
        if x <= xp[0] {
            return fp[0];
        }
        if x >= xp[n - 1] {
            return fp[n - 1];
        }
        let upper = xp[..n].partition_point(|&value| value <= x);
        let lower = upper - 1;
        let span = xp[upper] - xp[lower];
        if span <= 0.0 {
            return fp[lower];
        }
        let weight = (x - xp[lower]) / span;
        fp[lower] + weight * (fp[upper] - fp[lower])
    }

    pub fn logspace(start_exp: f64, stop_exp: f64, count: usize) -> Vec<f64> {
        match count {
            0 => Vec::new(),
            1 => vec![10f64.powf(start_exp)],
            _ => {
                let step = (stop_exp - start_exp) / (count - 1) as f64;
                (0..count)
                    .map(|i| 10f64.powf(start_exp + step * i as f64))
                    .collect()
            }
        }
    }

    /// Smallest spacing between consecutive samples.
    pub fn min_step(times: &[f64]) -> Option<f64> {
        times
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .min_by(|a, b| a.total_cmp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(StatsHelper::median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(StatsHelper::median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(StatsHelper::median(&[]), None);
    }

    #[test]
    fn interp_clamps_and_interpolates() {
        let xp = [0.0, 1.0, 3.0];
        let fp = [10.0, 20.0, 40.0];
        assert_eq!(StatsHelper::interp(-1.0, &xp, &fp), 10.0);
        assert_eq!(StatsHelper::interp(5.0, &xp, &fp), 40.0);
        assert!((StatsHelper::interp(2.0, &xp, &fp) - 30.0).abs() < 1e-12);
        assert!((StatsHelper::interp(1.0, &xp, &fp) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn logspace_spans_decades() {
        let values = StatsHelper::logspace(-2.0, 1.0, 4);
        assert_eq!(values.len(), 4);
        assert!((values[0] - 0.01).abs() < 1e-15);
        assert!((values[3] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn min_step_finds_smallest_gap() {
        assert_eq!(StatsHelper::min_step(&[0.0, 1.0, 1.5, 4.0]), Some(0.5));
        assert_eq!(StatsHelper::min_step(&[1.0]), None);
    }
}
