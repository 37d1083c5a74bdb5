use clap::Parser;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Synthetic destriping workflow driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Members of the in-process reduction group
    #[arg(long, default_value_t = 2)]
    workers: usize,
    #[arg(long, default_value_t = 8)]
    nside: usize,
    /// Offset baseline length in seconds
    #[arg(long, default_value_t = 10.0)]
    baseline: f64,
    /// Override the output directory of the maps
    #[arg(long)]
    outdir: Option<PathBuf>,
    /// Append a JSON run summary line to this file
    #[arg(long, default_value = "tools/data/destripe_run.log")]
    report: PathBuf,
}

#[derive(Serialize)]
struct RunSummary {
    workers: usize,
    nside: usize,
    amplitudes: usize,
    status: String,
    iterations: usize,
    input_rms: f64,
    residual_rms: f64,
    outdir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.workers, args.nside, args.baseline)
    };
    if let Some(outdir) = args.outdir {
        workflow_config.outdir = outdir;
    }

    let runner = Runner::new(workflow_config.clone());
    let result = runner.execute()?;

    let solve = result.reports.first().and_then(|report| report.solve.as_ref());
    let (status, iterations) = solve
        .map(|solve| (solve.status.to_string(), solve.iterations))
        .unwrap_or_else(|| ("skipped".to_string(), 0));
    let namplitude = result.reports.first().map_or(0, |report| report.namplitude);
    println!(
        "Destriping run -> workers {}, amplitudes {}, solver {} after {} iterations, noise rms {:.4e} -> {:.4e}",
        result.reports.len(),
        namplitude,
        status,
        iterations,
        result.input_rms,
        result.residual_rms
    );

    let summary = RunSummary {
        workers: result.reports.len(),
        nside: workflow_config.mapmaker.nside,
        amplitudes: namplitude,
        status,
        iterations,
        input_rms: result.input_rms,
        residual_rms: result.residual_rms,
        outdir: workflow_config.outdir.clone(),
    };
    let mut report = serde_json::to_string(&summary)?;
    report.push('\n');
    if let Some(parent) = args.report.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.report)?;
    file.write_all(report.as_bytes())?;

    Ok(())
}
