use crate::amplitudes::TemplateAmplitudes;
use crate::comm::Reducer;
use crate::prelude::{DestripeError, DestripeResult, SignalOperator, SolverConfig};
use crate::signal::Signal;
use crate::telemetry::{LogManager, MetricsRecorder};
use crate::templates::TemplateMatrix;
use std::fmt;

/// A symmetric positive-definite system A·a = b over template amplitudes.
pub trait NormalEquations {
    fn zero_amplitudes(&self) -> TemplateAmplitudes;

    /// A·a
    fn apply_lhs(&self, amplitudes: &TemplateAmplitudes) -> DestripeResult<TemplateAmplitudes>;

    /// M⁻¹·r
    fn apply_precond(&self, residual: &TemplateAmplitudes)
        -> DestripeResult<TemplateAmplitudes>;
}

/// Destriping normal equations (FᵗN⁻¹ZF + C_a⁻¹)·a = FᵗN⁻¹Z·y.
pub struct DestripingSystem<'a, N: SignalOperator, P: SignalOperator> {
    templates: &'a TemplateMatrix,
    noise: &'a N,
    projection: &'a P,
}

impl<'a, N: SignalOperator, P: SignalOperator> DestripingSystem<'a, N, P> {
    pub fn new(templates: &'a TemplateMatrix, noise: &'a N, projection: &'a P) -> Self {
        Self {
            templates,
            noise,
            projection,
        }
    }

    /// FᵗN⁻¹Z·signal
    pub fn rhs(&self, signal: &Signal) -> DestripeResult<TemplateAmplitudes> {
        let projected = self.projection.apply(signal)?;
        let weighted = self.noise.apply(&projected)?;
        self.templates.apply_transpose(&weighted)
    }
}

impl<N: SignalOperator, P: SignalOperator> NormalEquations for DestripingSystem<'_, N, P> {
    fn zero_amplitudes(&self) -> TemplateAmplitudes {
        self.templates.zero_amplitudes()
    }

    fn apply_lhs(&self, amplitudes: &TemplateAmplitudes) -> DestripeResult<TemplateAmplitudes> {
        let signal = self.templates.apply(amplitudes)?;
        let projected = self.projection.apply(&signal)?;
        let weighted = self.noise.apply(&projected)?;
        let mut result = self.templates.apply_transpose(&weighted)?;
        self.templates.add_prior(amplitudes, &mut result)?;
        Ok(result)
    }

    fn apply_precond(&self, residual: &TemplateAmplitudes) -> DestripeResult<TemplateAmplitudes> {
        self.templates.apply_precond(residual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    Stalled,
    MaxIterReached,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolveStatus::Converged => "converged",
            SolveStatus::Stalled => "stalled",
            SolveStatus::MaxIterReached => "reached the iteration limit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct PcgOutcome {
    pub amplitudes: TemplateAmplitudes,
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_sqsum: f64,
    pub final_sqsum: f64,
}

/// Preconditioned conjugate gradient with the stall heuristic used for
/// destriping: every ten iterations the best residual must have halved.
pub struct PcgSolver<'a> {
    config: SolverConfig,
    reducer: &'a dyn Reducer,
    logger: LogManager,
    metrics: MetricsRecorder,
}

impl<'a> PcgSolver<'a> {
    pub fn new(config: SolverConfig, reducer: &'a dyn Reducer) -> Self {
        Self {
            config,
            reducer,
            logger: LogManager::for_rank(reducer.rank()),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    fn lhs<S: NormalEquations>(
        &self,
        system: &S,
        amplitudes: &TemplateAmplitudes,
    ) -> DestripeResult<TemplateAmplitudes> {
        self.metrics.record_lhs();
        system.apply_lhs(amplitudes)
    }

    fn precond<S: NormalEquations>(
        &self,
        system: &S,
        residual: &TemplateAmplitudes,
    ) -> DestripeResult<TemplateAmplitudes> {
        self.metrics.record_precond();
        system.apply_precond(residual)
    }

    pub fn solve<S: NormalEquations>(
        &self,
        system: &S,
        rhs: &TemplateAmplitudes,
    ) -> DestripeResult<PcgOutcome> {
        let reducer = self.reducer;
        let mut guess = system.zero_amplitudes();
        let mut residual = rhs.clone();
        residual.sub_assign(&self.lhs(system, &guess)?)?;
        let mut precond_residual = self.precond(system, &residual)?;
        let mut proposal = precond_residual.clone();
        let mut sqsum = precond_residual.dot(&residual, reducer)?;
        if !sqsum.is_finite() {
            return Err(DestripeError::NonFiniteResidual(0));
        }
        let init_sqsum = sqsum;
        let mut best_sqsum = sqsum;
        let mut last_best = sqsum;
        self.logger
            .record(&format!("Initial residual: {:e}", init_sqsum));

        if init_sqsum == 0.0 {
            self.logger.report_clear("PCG converged with a zero residual");
            return Ok(PcgOutcome {
                amplitudes: guess,
                status: SolveStatus::Converged,
                iterations: 0,
                initial_sqsum: init_sqsum,
                final_sqsum: sqsum,
            });
        }

        let mut status = SolveStatus::MaxIterReached;
        let mut iterations = 0;
        for iiter in 0..self.config.niter_max {
            let lhs_proposal = self.lhs(system, &proposal)?;
            let alpha = sqsum / proposal.dot(&lhs_proposal, reducer)?;
            guess.axpy(alpha, &proposal)?;
            residual.axpy(-alpha, &lhs_proposal)?;
            drop(lhs_proposal);

            precond_residual = self.precond(system, &residual)?;
            let previous = sqsum;
            sqsum = precond_residual.dot(&residual, reducer)?;
            iterations = iiter + 1;
            self.metrics.record_iteration();
            if !sqsum.is_finite() {
                return Err(DestripeError::NonFiniteResidual(iiter));
            }
            self.logger.report_clear(&format!(
                "Iter = {:4} relative residual: {:12.4e}",
                iiter,
                sqsum / init_sqsum
            ));

            if sqsum < init_sqsum * self.config.convergence_limit {
                self.logger
                    .record(&format!("PCG converged after {} iterations", iiter));
                status = SolveStatus::Converged;
                break;
            }
            best_sqsum = best_sqsum.min(sqsum);
            if iiter % 10 == 0 && iiter >= self.config.niter_min {
                if last_best < best_sqsum * 2.0 {
                    self.logger
                        .record(&format!("PCG stalled after {} iterations", iiter));
                    status = SolveStatus::Stalled;
                    break;
                }
                last_best = best_sqsum;
            }

            let beta = sqsum / previous;
            proposal.scale(beta);
            proposal.add_assign(&precond_residual)?;
        }

        Ok(PcgOutcome {
            amplitudes: guess,
            status,
            iterations,
            initial_sqsum: init_sqsum,
            final_sqsum: sqsum,
        })
    }
}
