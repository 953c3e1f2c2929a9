//! Driving one task instance end to end.
//!
//! Without a review section the runner is a thin wrapper around a single
//! [`Agent`] run. With one, it samples attempts: each gets a fresh agent
//! seeded with the spend accumulated so far, its submission goes to the
//! [`ReviewLoop`], and rejected-attempt summaries can be forwarded into the
//! next attempt's instance prompt. The loop's running best decides which
//! attempt the instance reports.

use std::path::PathBuf;

use tracing::info;

use patchwright_core::error::Result;
use patchwright_core::exit::ExitStatus;
use patchwright_core::sandbox::Sandbox;
use patchwright_core::stats::ApiStats;
use patchwright_core::trajectory::TrajectoryRecord;

use crate::agent::{Agent, RunResult};
use crate::config::{AgentConfig, RunConfig};
use crate::reviewer::{ReviewConfig, ReviewLoop, ReviewSubmission};

/// Where and under which name this instance's artifacts land.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub instance_id: String,
    /// Trajectory files are written here; nothing is persisted when unset.
    pub output_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    fn trajectory_path(&self, attempt: Option<usize>) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        let file = match attempt {
            Some(k) => format!("{}.attempt{}.traj.json", self.instance_id, k + 1),
            None => format!("{}.traj.json", self.instance_id),
        };
        Some(dir.join(file))
    }
}

/// The instance-level outcome: the winning attempt plus spend accounting
/// across every attempt and the review loop.
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub exit_status: ExitStatus,
    pub submission: Option<String>,
    /// Agent spend summed over all attempts.
    pub stats: ApiStats,
    /// Judge spend, when a review loop ran.
    pub review_stats: Option<ApiStats>,
    pub attempts: usize,
    /// Zero-based index of the attempt the review loop settled on.
    pub best_attempt: usize,
    /// Trajectory file of the winning attempt, when persistence is on.
    pub trajectory_path: Option<PathBuf>,
    pub record: TrajectoryRecord,
}

/// Runs one instance against an already started sandbox session.
pub async fn run_instance(
    config: RunConfig,
    sandbox: &mut dyn Sandbox,
    problem_statement: &str,
    options: &RunOptions,
) -> Result<InstanceResult> {
    let RunConfig { agent, review } = config;
    match review {
        None => run_single(agent, sandbox, problem_statement, options).await,
        Some(review) => run_reviewed(agent, review, sandbox, problem_statement, options).await,
    }
}

async fn run_single(
    config: AgentConfig,
    sandbox: &mut dyn Sandbox,
    problem_statement: &str,
    options: &RunOptions,
) -> Result<InstanceResult> {
    let path = options.trajectory_path(None);
    let mut agent = Agent::from_config(config)?;
    let result = agent
        .run(sandbox, problem_statement, path.as_deref())
        .await?;
    info!(
        instance = %options.instance_id,
        status = %result.exit_status,
        "instance finished"
    );
    Ok(InstanceResult {
        exit_status: result.exit_status,
        submission: result.submission,
        stats: result.stats,
        review_stats: None,
        attempts: 1,
        best_attempt: 0,
        trajectory_path: path,
        record: result.record,
    })
}

async fn run_reviewed(
    config: AgentConfig,
    review_config: ReviewConfig,
    sandbox: &mut dyn Sandbox,
    problem_statement: &str,
    options: &RunOptions,
) -> Result<InstanceResult> {
    let mut review = ReviewLoop::build(review_config, &config.model, problem_statement)?;

    let mut attempts: Vec<(RunResult, Option<PathBuf>)> = Vec::new();
    let mut total_cost = 0.0;
    loop {
        let attempt = attempts.len();
        let path = options.trajectory_path(Some(attempt));

        let mut agent = Agent::from_config(config.clone())?;
        agent.carry_total_cost(total_cost);
        let forwarded = review.forwarded_context();
        if !forwarded.is_empty() {
            agent.forward_rejected_attempts(forwarded);
        }

        let result = agent
            .run(sandbox, problem_statement, path.as_deref())
            .await?;
        total_cost = result.stats.total_cost;
        info!(
            instance = %options.instance_id,
            attempt = attempt + 1,
            status = %result.exit_status,
            "attempt finished"
        );

        review
            .on_submit(ReviewSubmission {
                trajectory: result.record.trajectory.clone(),
                info: result.record.info.clone(),
            })
            .await?;
        attempts.push((result, path));

        if !review.keep_sampling() {
            break;
        }
    }

    let best = review.best_index();
    let stats = combined_stats(&attempts);
    info!(
        instance = %options.instance_id,
        attempts = attempts.len(),
        best = best + 1,
        "review loop settled"
    );
    let n_attempts = attempts.len();
    let (result, path) = attempts.swap_remove(best);
    Ok(InstanceResult {
        exit_status: result.exit_status,
        submission: result.submission,
        stats,
        review_stats: Some(review.stats().clone()),
        attempts: n_attempts,
        best_attempt: best,
        trajectory_path: path,
        record: result.record,
    })
}

/// Per-attempt counters are summed; the running total of the last attempt
/// already covers the whole instance.
fn combined_stats(attempts: &[(RunResult, Option<PathBuf>)]) -> ApiStats {
    let mut stats = ApiStats::default();
    for (result, _) in attempts {
        stats.instance_cost += result.stats.instance_cost;
        stats.tokens_sent += result.stats.tokens_sent;
        stats.tokens_received += result.stats.tokens_received;
        stats.api_calls += result.stats.api_calls;
    }
    if let Some((last, _)) = attempts.last() {
        stats.total_cost = last.stats.total_cost;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use patchwright_core::error::SandboxError;
    use patchwright_core::message::Role;
    use patchwright_core::sandbox::ExecutionResult;
    use patchwright_providers::BackendConfig;

    use crate::config::{AgentConfig, ModelConfig};
    use crate::reviewer::ReviewConfig;

    const MARKER: &str = "<<SUBMISSION||diff --git a/fix b/fix||SUBMISSION>>";

    /// Answers `submit` with a submission marker and everything else with
    /// empty successful output.
    struct SubmitSandbox {
        calls: Mutex<Vec<String>>,
    }

    impl SubmitSandbox {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sandbox for SubmitSandbox {
        fn name(&self) -> &str {
            "submit-only"
        }

        async fn start_session(&mut self) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn execute(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> std::result::Result<ExecutionResult, SandboxError> {
            self.calls.lock().unwrap().push(command.to_string());
            let output = if command == "submit" {
                MARKER.to_string()
            } else {
                String::new()
            };
            Ok(ExecutionResult {
                output,
                exit_code: 0,
            })
        }

        async fn write_file(
            &mut self,
            _path: &Path,
            _content: &str,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn upload_directory(
            &mut self,
            _source: &Path,
            _dest: &Path,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn close_session(&mut self) -> std::result::Result<(), SandboxError> {
            Ok(())
        }
    }

    fn replay_model(dir: &tempfile::TempDir, file: &str, responses: &[&str]) -> ModelConfig {
        let path = dir.path().join(file);
        let responses: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        std::fs::write(&path, serde_json::to_string(&responses).unwrap()).unwrap();
        ModelConfig {
            name: "replay".into(),
            backend: Some(BackendConfig::Replay { path, usage: None }),
            ..ModelConfig::default()
        }
    }

    fn submitting_agent(dir: &tempfile::TempDir) -> AgentConfig {
        AgentConfig {
            model: replay_model(
                dir,
                "agent.json",
                &["DISCUSSION\nDone.\n\n```\nsubmit\n```"],
            ),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn single_attempt_writes_one_trajectory_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            agent: submitting_agent(&dir),
            review: None,
        };
        let options = RunOptions::new("instance_1").with_output_dir(dir.path().join("out"));
        let mut sandbox = SubmitSandbox::new();

        let result = run_instance(config, &mut sandbox, "fix it", &options)
            .await
            .unwrap();

        assert_eq!(result.exit_status, ExitStatus::Submitted);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.best_attempt, 0);
        assert!(result.review_stats.is_none());
        let path = result.trajectory_path.unwrap();
        assert!(path.ends_with("instance_1.traj.json"));
        assert!(TrajectoryRecord::load(&path).is_ok());
    }

    #[tokio::test]
    async fn rejected_first_attempt_triggers_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            agent: submitting_agent(&dir),
            review: Some(ReviewConfig {
                model: Some(replay_model(&dir, "judge.json", &["failure", "success"])),
                ..ReviewConfig::default()
            }),
        };
        let options = RunOptions::new("instance_2").with_output_dir(dir.path().join("out"));
        let mut sandbox = SubmitSandbox::new();

        let result = run_instance(config, &mut sandbox, "fix it", &options)
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        // The accepted second attempt wins without a comparison call.
        assert_eq!(result.best_attempt, 1);
        assert_eq!(result.exit_status, ExitStatus::Submitted);
        let review_stats = result.review_stats.unwrap();
        assert_eq!(review_stats.api_calls, 2);
        // Both attempts left their own trajectory file.
        let out = dir.path().join("out");
        assert!(out.join("instance_2.attempt1.traj.json").exists());
        assert!(out.join("instance_2.attempt2.traj.json").exists());
        let best = result.trajectory_path.unwrap();
        assert!(best.ends_with("instance_2.attempt2.traj.json"));
    }

    #[tokio::test]
    async fn accepted_first_attempt_stops_the_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            agent: submitting_agent(&dir),
            review: Some(ReviewConfig {
                model: Some(replay_model(&dir, "judge.json", &["success"])),
                max_samples: 3,
                ..ReviewConfig::default()
            }),
        };
        let options = RunOptions::new("instance_3");
        let mut sandbox = SubmitSandbox::new();

        let result = run_instance(config, &mut sandbox, "fix it", &options)
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.best_attempt, 0);
        assert!(result.trajectory_path.is_none());
        assert_eq!(result.review_stats.unwrap().api_calls, 1);
    }

    #[tokio::test]
    async fn rejected_attempts_are_forwarded_into_the_next_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            agent: submitting_agent(&dir),
            review: Some(ReviewConfig {
                model: Some(replay_model(&dir, "judge.json", &["failure", "success"])),
                forward_rejected: true,
                ..ReviewConfig::default()
            }),
        };
        let options = RunOptions::new("instance_4");
        let mut sandbox = SubmitSandbox::new();

        let result = run_instance(config, &mut sandbox, "fix it", &options)
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        // The winning record is attempt 2, whose instance prompt carries
        // the rejected attempt.
        let instance_turn = result
            .record
            .history
            .iter()
            .find(|e| e.role == Role::User)
            .unwrap();
        assert!(instance_turn.content.contains("ATTEMPT 1 (rejected)"));
        assert!(instance_turn
            .content
            .contains("rejected by a reviewer"));
    }

    #[tokio::test]
    async fn attempt_spend_accumulates_into_the_combined_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = submitting_agent(&dir);
        if let Some(BackendConfig::Replay { usage, .. }) = agent.model.backend.as_mut() {
            *usage = Some((100, 10));
        }
        agent
            .model
            .metadata_overrides
            .insert("replay".into(), priced());
        let config = RunConfig {
            agent,
            review: Some(ReviewConfig {
                model: Some(replay_model(&dir, "judge.json", &["failure", "success"])),
                ..ReviewConfig::default()
            }),
        };
        let options = RunOptions::new("instance_5");
        let mut sandbox = SubmitSandbox::new();

        let result = run_instance(config, &mut sandbox, "fix it", &options)
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.stats.api_calls, 2);
        assert_eq!(result.stats.tokens_sent, 200);
        // Two calls at 100 input tokens each.
        assert!((result.stats.total_cost - 0.02).abs() < 1e-9);
        assert!((result.stats.instance_cost - 0.02).abs() < 1e-9);
    }

    fn priced() -> patchwright_providers::MetadataOverride {
        serde_json::from_value(serde_json::json!({
            "cost_per_input_token": 1e-4,
            "cost_per_output_token": 0.0,
        }))
        .unwrap()
    }
}
