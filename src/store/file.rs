//! File-backed cluster operator.
//!
//! Keeps one directory per operation under `<root>/operations/<id>/`:
//! `plan.json` for the stored plan, `changelog.jsonl` with one change per
//! line, `progress.jsonl`, and `state.json` for the coarse operation
//! state. Changelog appends take an exclusive advisory lock so concurrent
//! drivers on the same host cannot interleave partial lines.

use async_trait::async_trait;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::{OperationError, Result};
use crate::plan::{OperationKey, OperationPlan, PlanChange, PlanChangelog};
use crate::store::{ClusterOperator, ProgressEntry, SetOperationStateRequest};

/// A cluster operator persisting to a local state directory.
#[derive(Debug, Clone)]
pub struct FileOperator {
    root: PathBuf,
}

impl FileOperator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn operation_dir(&self, key: &OperationKey) -> PathBuf {
        self.root.join("operations").join(&key.operation_id)
    }

    fn plan_path(&self, key: &OperationKey) -> PathBuf {
        self.operation_dir(key).join("plan.json")
    }

    fn changelog_path(&self, key: &OperationKey) -> PathBuf {
        self.operation_dir(key).join("changelog.jsonl")
    }

    fn progress_path(&self, key: &OperationKey) -> PathBuf {
        self.operation_dir(key).join("progress.jsonl")
    }

    fn state_path(&self, key: &OperationKey) -> PathBuf {
        self.operation_dir(key).join("state.json")
    }
}

fn store_error(context: &str, err: std::io::Error) -> OperationError {
    OperationError::transient_with(format!("state directory unavailable: {context}"), err.into())
}

fn encode_error(context: &str, err: serde_json::Error) -> OperationError {
    OperationError::bad_parameter(format!("{context}: {err}"))
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    file.lock_exclusive()?;
    let result = writeln!(&file, "{line}");
    let _ = fs2::FileExt::unlock(&file);
    result
}

#[async_trait]
impl ClusterOperator for FileOperator {
    async fn get_operation_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        let path = self.plan_path(key);
        if !path.exists() {
            return Err(OperationError::not_found(format!(
                "operation plan for {key}"
            )));
        }
        let content =
            fs::read_to_string(&path).map_err(|e| store_error("reading plan.json", e))?;
        serde_json::from_str(&content).map_err(|e| encode_error("parsing plan.json", e))
    }

    async fn create_operation_plan(&self, key: &OperationKey, plan: &OperationPlan) -> Result<()> {
        let path = self.plan_path(key);
        if path.exists() {
            return Err(OperationError::already_exists(format!(
                "operation plan for {key}"
            )));
        }
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let content = serde_json::to_string_pretty(plan)
            .map_err(|e| encode_error("encoding plan", e))?;
        fs::write(&path, content).map_err(|e| store_error("writing plan.json", e))
    }

    async fn create_plan_change(&self, key: &OperationKey, change: &PlanChange) -> Result<()> {
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let path = self.changelog_path(key);

        // Read-check-append under the exclusive lock so retried appends
        // with the same change ID stay idempotent.
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| store_error("opening changelog", e))?;
        file.lock_exclusive()
            .map_err(|e| store_error("locking changelog", e))?;

        let mut content = String::new();
        let result = (&file)
            .read_to_string(&mut content)
            .map_err(|e| store_error("reading changelog", e))
            .and_then(|_| {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    let existing: PlanChange = serde_json::from_str(line)
                        .map_err(|e| encode_error("parsing changelog entry", e))?;
                    if existing.id == change.id {
                        return Ok(());
                    }
                }
                let line = serde_json::to_string(change)
                    .map_err(|e| encode_error("encoding change", e))?;
                writeln!(&file, "{line}").map_err(|e| store_error("appending change", e))
            });
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    async fn get_plan_changelog(&self, key: &OperationKey) -> Result<PlanChangelog> {
        let path = self.changelog_path(key);
        if !path.exists() {
            return Ok(PlanChangelog::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| store_error("reading changelog", e))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<PlanChange>(line)
                    .map_err(|e| encode_error("parsing changelog entry", e))
            })
            .collect::<Result<Vec<_>>>()
            .map(PlanChangelog::from_iter)
    }

    async fn create_progress_entry(&self, key: &OperationKey, entry: &ProgressEntry) -> Result<()> {
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let line =
            serde_json::to_string(entry).map_err(|e| encode_error("encoding progress entry", e))?;
        append_line(&self.progress_path(key), &line)
            .map_err(|e| store_error("appending progress entry", e))
    }

    async fn set_operation_state(
        &self,
        key: &OperationKey,
        request: &SetOperationStateRequest,
    ) -> Result<()> {
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let content = serde_json::to_string_pretty(request)
            .map_err(|e| encode_error("encoding operation state", e))?;
        fs::write(self.state_path(key), content)
            .map_err(|e| store_error("writing state.json", e))
    }

    async fn rotate_runtime_config(
        &self,
        key: &OperationKey,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let content = serde_json::to_string_pretty(env)
            .map_err(|e| encode_error("encoding runtime environment", e))?;
        fs::write(self.operation_dir(key).join("runtime-env.json"), content)
            .map_err(|e| store_error("writing runtime-env.json", e))
    }

    async fn update_cluster_config(
        &self,
        key: &OperationKey,
        config: &serde_json::Value,
    ) -> Result<()> {
        fs::create_dir_all(self.operation_dir(key))
            .map_err(|e| store_error("creating operation directory", e))?;
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| encode_error("encoding cluster configuration", e))?;
        fs::write(self.operation_dir(key).join("cluster-config.json"), content)
            .map_err(|e| store_error("writing cluster-config.json", e))
    }
}
