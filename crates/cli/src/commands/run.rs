//! `patchwright run` — one task instance end to end.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use tracing::warn;

use patchwright_agent::{run_instance, RunConfig, RunOptions};
use patchwright_core::sandbox::Sandbox;
use patchwright_sandbox::LocalShell;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the run configuration (TOML)
    #[arg(short, long, env = "PATCHWRIGHT_CONFIG")]
    config: PathBuf,

    /// The problem statement: a file path or literal text
    #[arg(short, long)]
    problem: String,

    /// Directory for trajectory and submission files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Override the configured model name
    #[arg(short, long)]
    model: Option<String>,

    /// Start the sandbox session in this directory
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Name used for output files; derived from the problem when omitted
    #[arg(long)]
    instance_id: Option<String>,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = RunConfig::from_path(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(model) = args.model {
        config.agent.model.name = model;
    }

    let problem = problem_statement(&args.problem)?;
    let instance_id = args
        .instance_id
        .unwrap_or_else(|| derive_instance_id(&args.problem));

    let mut options = RunOptions::new(&instance_id);
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        options = options.with_output_dir(dir);
    }

    let mut sandbox = match &args.workdir {
        Some(dir) => LocalShell::new().with_workdir(dir),
        None => LocalShell::new(),
    };
    sandbox
        .start_session()
        .await
        .context("starting the local shell session")?;

    // The session is closed even when the run fails; the run error wins.
    let outcome = run_instance(config, &mut sandbox, &problem, &options).await;
    if let Err(err) = sandbox.close_session().await {
        warn!(error = %err, "failed to close the shell session");
    }
    let result = outcome.context("running the instance")?;

    println!("instance:    {instance_id}");
    println!("exit status: {}", result.exit_status);
    if result.attempts > 1 {
        println!(
            "attempts:    {} (best: {})",
            result.attempts,
            result.best_attempt + 1
        );
    }
    println!(
        "model calls: {} ({} tokens sent, {} received), cost {:.4}",
        result.stats.api_calls,
        result.stats.tokens_sent,
        result.stats.tokens_received,
        result.stats.instance_cost
    );
    if let Some(review) = &result.review_stats {
        println!(
            "review:      {} judge calls, cost {:.4}",
            review.api_calls, review.instance_cost
        );
    }
    if let Some(path) = &result.trajectory_path {
        println!("trajectory:  {}", path.display());
    }
    match (&result.submission, &args.output_dir) {
        (Some(submission), Some(dir)) => {
            let path = dir.join(format!("{instance_id}.patch"));
            std::fs::write(&path, submission)
                .with_context(|| format!("writing submission {}", path.display()))?;
            println!("submission:  {}", path.display());
        }
        (Some(submission), None) => {
            println!("submission:\n{submission}");
        }
        (None, _) => println!("submission:  none"),
    }
    Ok(())
}

/// A value naming an existing file is read; anything else is the problem
/// text itself.
fn problem_statement(value: &str) -> anyhow::Result<String> {
    let path = Path::new(value);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading problem statement {}", path.display()));
    }
    Ok(value.to_string())
}

fn derive_instance_id(problem: &str) -> String {
    let path = Path::new(problem);
    if path.is_file() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            return stem.to_string();
        }
    }
    format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}
