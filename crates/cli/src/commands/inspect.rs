//! `patchwright inspect` — summarize a recorded trajectory file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use patchwright_core::trajectory::TrajectoryRecord;

#[derive(Args)]
pub struct InspectArgs {
    /// A trajectory file written by `patchwright run`
    trajectory: PathBuf,

    /// Also list every step's action
    #[arg(short, long)]
    steps: bool,
}

pub fn run(args: InspectArgs) -> anyhow::Result<()> {
    let record = TrajectoryRecord::load(&args.trajectory)
        .with_context(|| format!("loading trajectory {}", args.trajectory.display()))?;

    let status = record
        .info
        .exit_status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let execution_secs: f64 = record.trajectory.iter().map(|s| s.execution_time).sum();
    println!("steps:       {}", record.trajectory.len());
    println!("exit status: {status}");
    println!(
        "submission:  {}",
        match &record.info.submission {
            Some(s) => format!("{} bytes", s.len()),
            None => "none".into(),
        }
    );
    let stats = &record.info.model_stats;
    println!(
        "model calls: {} ({} tokens sent, {} received), cost {:.4}",
        stats.api_calls, stats.tokens_sent, stats.tokens_received, stats.instance_cost
    );
    println!("exec time:   {execution_secs:.1}s");

    if args.steps {
        println!();
        for (index, step) in record.trajectory.iter().enumerate() {
            println!("{:>4}  {}", index + 1, first_line(&step.action));
        }
    }
    Ok(())
}

fn first_line(action: &str) -> &str {
    action.lines().next().unwrap_or("")
}
