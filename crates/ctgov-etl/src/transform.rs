//! Transform runner boundary
//!
//! The pipeline treats SQL modelling as opaque. It hands a batch id to a
//! [`TransformRunner`] and only looks at the returned [`TransformStatus`]:
//! `Error` fails the run, `Warning` is logged and the run continues.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::TransformConfig;
use crate::error::Result;
use crate::models::BatchId;

/// Keep at most this many bytes of tool output per outcome
const OUTPUT_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub status: TransformStatus,
    pub output: String,
}

impl TransformOutcome {
    pub fn new(status: TransformStatus, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn run_transform(&self, batch_id: &BatchId) -> Result<TransformOutcome>;

    /// Regenerate model documentation. Only called after a non-error
    /// transform.
    async fn generate_docs(&self) -> Result<TransformOutcome> {
        Ok(TransformOutcome::new(TransformStatus::Success, ""))
    }
}

/// Runs dbt as a child process.
///
/// Each selector is run in order with `--vars '{"batch_id": ...}'`. A failed
/// `dbt run` is an error; a failed `dbt test` is a warning.
pub struct DbtRunner {
    executable: String,
    project_dir: PathBuf,
    profiles_dir: Option<PathBuf>,
    selectors: Vec<String>,
    run_tests: bool,
}

struct StepOutput {
    success: bool,
    output: String,
}

impl DbtRunner {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            executable: config.dbt_executable.clone(),
            project_dir: config.project_dir.clone(),
            profiles_dir: config.profiles_dir.clone(),
            selectors: config.selectors.clone(),
            run_tests: config.run_tests,
        }
    }

    fn vars(batch_id: &BatchId) -> String {
        serde_json::json!({ "batch_id": batch_id.as_str() }).to_string()
    }

    async fn step(&self, args: &[&str]) -> StepOutput {
        let mut command = Command::new(&self.executable);
        command
            .args(args)
            .arg("--project-dir")
            .arg(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(profiles) = &self.profiles_dir {
            command.arg("--profiles-dir").arg(profiles);
        }

        debug!(executable = %self.executable, ?args, "Running dbt");

        match command.output().await {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                StepOutput {
                    success: output.status.success(),
                    output: text,
                }
            },
            Err(e) => StepOutput {
                success: false,
                output: format!("failed to start {}: {}", self.executable, e),
            },
        }
    }
}

fn tail(output: &str) -> String {
    if output.len() <= OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut start = output.len() - OUTPUT_LIMIT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}

#[async_trait]
impl TransformRunner for DbtRunner {
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn run_transform(&self, batch_id: &BatchId) -> Result<TransformOutcome> {
        let vars = Self::vars(batch_id);
        let mut log = String::new();

        if self.selectors.is_empty() {
            let step = self.step(&["run", "--vars", vars.as_str()]).await;
            log.push_str(&step.output);
            if !step.success {
                return Ok(TransformOutcome::new(TransformStatus::Error, tail(&log)));
            }
        }
        for selector in &self.selectors {
            let step = self
                .step(&["run", "--select", selector.as_str(), "--vars", vars.as_str()])
                .await;
            log.push_str(&step.output);
            if !step.success {
                warn!(selector = %selector, "dbt run failed");
                return Ok(TransformOutcome::new(TransformStatus::Error, tail(&log)));
            }
            info!(selector = %selector, "dbt run succeeded");
        }

        if self.run_tests {
            let step = self.step(&["test", "--vars", vars.as_str()]).await;
            log.push_str(&step.output);
            if !step.success {
                warn!("dbt tests failed");
                return Ok(TransformOutcome::new(TransformStatus::Warning, tail(&log)));
            }
        }

        Ok(TransformOutcome::new(TransformStatus::Success, tail(&log)))
    }

    async fn generate_docs(&self) -> Result<TransformOutcome> {
        let step = self.step(&["docs", "generate"]).await;
        let status = if step.success {
            TransformStatus::Success
        } else {
            TransformStatus::Warning
        };
        Ok(TransformOutcome::new(status, tail(&step.output)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A stand-in dbt that logs its arguments and fails the subcommand
    /// named in `fail_on`. Tests that spawn it are serial so no other test
    /// forks while the script is open for writing.
    fn fake_dbt(dir: &TempDir, fail_on: &str) -> (String, PathBuf) {
        let log = dir.path().join("calls.log");
        let script = dir.path().join("dbt");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = \"{}\" ]; then echo boom; exit 1; fi\necho ok\n",
                log.display(),
                fail_on
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    fn runner(executable: String) -> DbtRunner {
        DbtRunner::new(&TransformConfig {
            dbt_executable: executable,
            project_dir: PathBuf::from("/tmp/project"),
            ..TransformConfig::default()
        })
    }

    #[tokio::test]
    #[serial]
    async fn test_success_runs_selectors_then_tests() {
        let dir = TempDir::new().unwrap();
        let (exe, log) = fake_dbt(&dir, "never");
        let outcome = runner(exe)
            .run_transform(&BatchId::parse("b1").unwrap())
            .await
            .unwrap();

        assert_eq!(outcome.status, TransformStatus::Success);
        let calls = std::fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("run --select staging --vars {\"batch_id\":\"b1\"}"));
        assert!(lines[1].starts_with("run --select marts"));
        assert!(lines[2].starts_with("test"));
        assert!(lines[0].contains("--project-dir /tmp/project"));
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_tests_are_warning() {
        let dir = TempDir::new().unwrap();
        let (exe, _) = fake_dbt(&dir, "test");
        let outcome = runner(exe)
            .run_transform(&BatchId::parse("b1").unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.status, TransformStatus::Warning);
        assert!(outcome.output.contains("boom"));
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_run_is_error() {
        let dir = TempDir::new().unwrap();
        let (exe, log) = fake_dbt(&dir, "run");
        let outcome = runner(exe)
            .run_transform(&BatchId::parse("b1").unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.status, TransformStatus::Error);
        // Stops at the first selector
        assert_eq!(std::fs::read_to_string(log).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_executable_is_error() {
        let outcome = runner("/nonexistent/dbt".to_string())
            .run_transform(&BatchId::parse("b1").unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.status, TransformStatus::Error);
        assert!(outcome.output.contains("failed to start"));
    }

    #[test]
    fn test_tail_keeps_char_boundaries() {
        let long = "é".repeat(OUTPUT_LIMIT);
        let kept = tail(&long);
        assert!(kept.len() <= OUTPUT_LIMIT);
        assert!(kept.chars().all(|c| c == 'é'));
    }
}
