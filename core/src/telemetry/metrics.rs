use std::sync::Mutex;

/// Counts of solver operator applications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverMetrics {
    pub lhs_applications: usize,
    pub precond_applications: usize,
    pub iterations: usize,
}

pub struct MetricsRecorder {
    inner: Mutex<SolverMetrics>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SolverMetrics::default()),
        }
    }

    pub fn record_lhs(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.lhs_applications += 1;
        }
    }

    pub fn record_precond(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.precond_applications += 1;
        }
    }

    pub fn record_iteration(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.iterations += 1;
        }
    }

    pub fn snapshot(&self) -> SolverMetrics {
        self.inner.lock().map(|metrics| *metrics).unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let recorder = MetricsRecorder::new();
        recorder.record_lhs();
        recorder.record_lhs();
        recorder.record_precond();
        recorder.record_iteration();
        assert_eq!(
            recorder.snapshot(),
            SolverMetrics {
                lhs_applications: 2,
                precond_applications: 1,
                iterations: 1,
            }
        );
    }
}
