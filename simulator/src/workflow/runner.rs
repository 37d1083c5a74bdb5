use crate::generator::profile::build_dataset;
use crate::generator::template::sky_map;
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use destripecore::{
    Dataset, JsonMapSink, MapMaker, MapMakerReport, PixelMap, Reducer, ThreadGroupReducer,
};
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;
use tokio::task::JoinSet;

pub struct WorkflowResult {
    /// One report per group member, in rank order.
    pub reports: Vec<MapMakerReport>,
    /// RMS of the simulated noise before destriping, mean removed.
    pub input_rms: f64,
    /// RMS of the noise left in the destriped signal, mean removed.
    pub residual_rms: f64,
}

struct WorkerOutcome {
    rank: usize,
    report: MapMakerReport,
    input_rms: f64,
    residual_rms: f64,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    /// Simulates data and runs the map-maker on every group member.
    pub fn execute(&self) -> anyhow::Result<WorkflowResult> {
        let runtime = TokioBuilder::new_multi_thread()
            .worker_threads(self.config.group_size())
            .enable_all()
            .build()
            .context("creating runtime for workflow workers")?;
        runtime.block_on(self.run_group())
    }

    async fn run_group(&self) -> anyhow::Result<WorkflowResult> {
        let mapmaker = &self.config.mapmaker;
        let sky = Arc::new(sky_map(
            mapmaker.npix(),
            mapmaker.nnz,
            self.config.generator.sky_amplitude,
        ));

        // Members synchronize through the reducer, so each needs its own thread.
        let mut workers = JoinSet::new();
        for reducer in ThreadGroupReducer::group(self.config.group_size()) {
            let config = self.config.clone();
            let sky = Arc::clone(&sky);
            workers.spawn_blocking(move || run_worker(&config, &sky, reducer));
        }

        let mut outcomes = Vec::with_capacity(self.config.group_size());
        while let Some(joined) = workers.join_next().await {
            outcomes.push(joined.context("joining workflow worker")??);
        }
        outcomes.sort_by_key(|outcome| outcome.rank);

        let input_rms = outcomes.first().map_or(0.0, |outcome| outcome.input_rms);
        let residual_rms = outcomes.first().map_or(0.0, |outcome| outcome.residual_rms);
        Ok(WorkflowResult {
            reports: outcomes.into_iter().map(|outcome| outcome.report).collect(),
            input_rms,
            residual_rms,
        })
    }
}

fn run_worker(
    config: &WorkflowConfig,
    sky: &PixelMap,
    reducer: ThreadGroupReducer,
) -> anyhow::Result<WorkerOutcome> {
    let rank = reducer.rank();
    let signal_name = &config.mapmaker.signal_name;
    let mut data = build_dataset(&config.generator, sky, rank, reducer.size())
        .with_context(|| format!("generating data for rank {}", rank))?;
    let input_rms = noise_rms(&data, signal_name, &reducer)?;

    let mut sink = JsonMapSink::new(&config.outdir);
    let report = MapMaker::new(config.mapmaker.clone())
        .exec(&mut data, &reducer, &mut sink)
        .with_context(|| format!("running map-maker on rank {}", rank))?;
    let residual_rms = noise_rms(&data, signal_name, &reducer)?;
    log::debug!(
        "rank {} noise rms {:.4e} -> {:.4e}",
        rank,
        input_rms,
        residual_rms
    );

    Ok(WorkerOutcome {
        rank,
        report,
        input_rms,
        residual_rms,
    })
}

/// Group-wide RMS of `signal` minus the simulated sky, mean removed.
fn noise_rms(data: &Dataset, signal: &str, reducer: &dyn Reducer) -> anyhow::Result<f64> {
    let (mut sum, mut sqsum, mut count) = (0.0, 0.0, 0.0);
    for obs in &data.observations {
        for det in &obs.detectors {
            let total = det
                .signals
                .get(signal)
                .with_context(|| format!("signal `{}` missing for {}", signal, det.name))?;
            let sky = det
                .signals
                .get("sky")
                .with_context(|| format!("sky signal missing for {}", det.name))?;
            for (value, sky) in total.iter().zip(sky.iter()) {
                let residual = value - sky;
                sum += residual;
                sqsum += residual * residual;
            }
            count += total.len() as f64;
        }
    }
    let sum = reducer.all_reduce_sum(sum);
    let sqsum = reducer.all_reduce_sum(sqsum);
    let count = reducer.all_reduce_sum(count);
    if count == 0.0 {
        return Ok(0.0);
    }
    let mean = sum / count;
    Ok((sqsum / count - mean * mean).max(0.0).sqrt())
}
