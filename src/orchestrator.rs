use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::{self, AgentRunner};
use crate::artifact::{self, Paths};
use crate::config::WreckitConfig;
use crate::dag;
use crate::error::WreckitError;
use crate::gateway;
use crate::item::Item;
use crate::lock;
use crate::log_info;
use crate::progress::{self, BatchProgress};
use crate::state_machine::ItemState;
use crate::workflow;

pub struct RunOptions {
    pub parallel: u32,
    pub no_resume: bool,
    pub retry_failed: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn scan_items(paths: &Paths) -> Result<Vec<Item>, WreckitError> {
    let items_dir = paths.items_dir();
    if !items_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<_> = std::fs::read_dir(&items_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut items = Vec::new();
    for entry in entries {
        let id = entry.file_name().to_string_lossy().to_string();
        items.push(artifact::read_item(paths, &id)?);
    }
    Ok(items)
}

/// Pick the first (by id order) item from `remaining` whose dependencies are
/// already satisfied, removing and returning it.
fn pick_next_eligible(remaining: &mut Vec<Item>, done_ids: &HashSet<String>) -> Option<Item> {
    let pos = remaining.iter().position(|i| dag::dependencies_satisfied(i, done_ids))?;
    Some(remaining.remove(pos))
}

/// Run every non-`done` item in `repo_root` to completion or failure, honoring
/// `options.parallel` concurrent workers. Holds the batch-run lock for the
/// duration of the call. This is the Batch Orchestrator of §4.H.
pub async fn run_batch<R>(
    repo_root: &Path,
    config: &WreckitConfig,
    options: &RunOptions,
    runner: Arc<R>,
    cancel: CancellationToken,
) -> Result<RunSummary, WreckitError>
where
    R: AgentRunner + 'static,
{
    let paths = Paths::new(repo_root);
    if !paths.root.is_dir() {
        return Err(WreckitError::RepoNotFound(repo_root.to_path_buf()));
    }

    let _lock_guard = lock::try_acquire(&paths.root).map_err(WreckitError::GenericWreckit)?;

    let mut all_items = scan_items(&paths)?;
    let validation_errors = dag::validate_dependency_graph(&all_items);
    if !validation_errors.is_empty() {
        return Err(WreckitError::SchemaValidation {
            path: paths.items_dir(),
            errors: validation_errors,
        });
    }

    let mut done_ids: HashSet<String> = all_items
        .iter()
        .filter(|i| i.state == ItemState::Done)
        .map(|i| i.id.clone())
        .collect();

    let session_id = format!("wreckit-{}", std::process::id());
    let mut excluded_this_run: HashSet<String> = HashSet::new();

    let previous = if options.no_resume { None } else { progress::read_batch_progress(&paths) };
    if let Some(prev) = &previous {
        if !prev.is_stale(Utc::now()) && !options.retry_failed {
            excluded_this_run.extend(prev.failed.iter().cloned());
        }
    }

    let mut remaining: Vec<Item> = all_items
        .drain(..)
        .filter(|i| i.state != ItemState::Done && !excluded_this_run.contains(&i.id))
        .collect();

    let mut summary = RunSummary::default();
    summary.failed.extend(excluded_this_run.iter().cloned());

    let mut queued_ids: Vec<String> = remaining.iter().map(|i| i.id.clone()).collect();
    let mut progress = BatchProgress::new(session_id, options.parallel, queued_ids.clone());
    progress.failed = summary.failed.clone();
    progress::write_batch_progress(&paths, &mut progress)?;

    let (gateway, _gateway_task) = gateway::spawn_gateway(repo_root.to_path_buf());

    let parallel = options.parallel.max(1) as usize;
    let mut join_set = tokio::task::JoinSet::new();
    let mut in_flight = 0usize;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        while in_flight < parallel && !cancel.is_cancelled() {
            let Some(item) = pick_next_eligible(&mut remaining, &done_ids) else { break };
            let id = item.id.clone();
            queued_ids.retain(|q| q != &id);
            if parallel == 1 {
                progress.start_item(&id, Utc::now());
            }
            progress::write_batch_progress(&paths, &mut progress)?;

            let gw = gateway.clone();
            let cfg = config.clone();
            let root = repo_root.to_path_buf();
            let r = Arc::clone(&runner);
            let done_snapshot = done_ids.clone();
            let cancel_clone = cancel.clone();
            join_set.spawn(async move {
                let outcome = workflow::run_item_workflow(item, &cfg, &root, &gw, r.as_ref(), &done_snapshot, &cancel_clone).await;
                (id, outcome)
            });
            in_flight += 1;
        }

        if in_flight == 0 {
            break;
        }

        let Some(joined) = join_set.join_next().await else { break };
        in_flight -= 1;
        let (id, outcome) = joined.map_err(|e| WreckitError::GenericWreckit(format!("worker task panicked: {e}")))?;

        let now = Utc::now();
        match outcome {
            Ok(item) if item.state == ItemState::Done => {
                done_ids.insert(id.clone());
                summary.completed.push(id.clone());
                if parallel == 1 {
                    progress.complete_current(now);
                } else {
                    progress.completed.push(id.clone());
                }
                log_info!("[orchestrator] {} reached done", id);

                if config.git.direct_merge_on_complete {
                    if let Some(branch) = item.branch.as_deref() {
                        if let Err(e) = gateway.merge_and_push_to_base(branch, &config.git.base_branch).await {
                            log_info!("[orchestrator] direct merge for {} failed: {}", id, e);
                        }
                    }
                }
            }
            Ok(_unfinished) => {
                // item stopped without error and without reaching done: its
                // dependency chain no longer resolves this run (a sibling it
                // depends on failed after this item's snapshot was taken).
                summary.skipped.push(id.clone());
                if parallel == 1 {
                    progress.skip_current(now);
                } else {
                    progress.skipped.push(id.clone());
                }
            }
            Err(e) => {
                summary.failed.push(id.clone());
                if parallel == 1 {
                    progress.fail_current(now);
                } else {
                    progress.failed.push(id.clone());
                }
                log_info!("[orchestrator] {} failed: {}", id, e);
            }
        }
        progress::write_batch_progress(&paths, &mut progress)?;
    }

    for leftover in remaining {
        summary.skipped.push(leftover.id.clone());
        progress.skipped.push(leftover.id);
    }
    progress::write_batch_progress(&paths, &mut progress)?;

    if cancel.is_cancelled() {
        agent::kill_all_children();
        return Err(WreckitError::GenericWreckit("batch run interrupted by signal".to_string()));
    }

    progress::clear_batch_progress(&paths)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResult, MockAgentRunner};
    use crate::state_machine::ItemState;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.name", "t"]).current_dir(dir).status().unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).status().unwrap();
    }

    fn seed_item(paths: &Paths, id: &str, state: ItemState) {
        let mut item = Item::new(id, "title");
        item.state = state;
        artifact::write_item(paths, &item).unwrap();
    }

    #[tokio::test]
    async fn no_items_yields_empty_clean_summary() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let paths = Paths::new(dir.path());
        std::fs::create_dir_all(paths.items_dir()).unwrap();

        let config = WreckitConfig::default();
        let options = RunOptions { parallel: 1, no_resume: true, retry_failed: false };
        let runner = Arc::new(MockAgentRunner::new(vec![]));
        let summary = run_batch(dir.path(), &config, &options, runner, CancellationToken::new()).await.unwrap();
        assert!(summary.is_clean());
        assert!(summary.completed.is_empty());
    }

    #[tokio::test]
    async fn already_done_item_is_excluded_from_the_run() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let paths = Paths::new(dir.path());
        seed_item(&paths, "001-foo", ItemState::Done);

        let config = WreckitConfig::default();
        let options = RunOptions { parallel: 1, no_resume: true, retry_failed: false };
        let runner = Arc::new(MockAgentRunner::new(vec![]));
        let summary = run_batch(dir.path(), &config, &options, runner, CancellationToken::new()).await.unwrap();
        assert!(summary.completed.is_empty());
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn agent_failure_surfaces_item_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let paths = Paths::new(dir.path());
        seed_item(&paths, "001-foo", ItemState::Idea);

        let config = WreckitConfig::default();
        let options = RunOptions { parallel: 1, no_resume: true, retry_failed: false };
        let failing = AgentResult {
            success: false,
            output: "boom".to_string(),
            exit_code: Some(1),
            timed_out: false,
            completion_detected: false,
            error_kind: None,
            mcp_capture: None,
        };
        let mut results = Vec::new();
        for _ in 0..config.execution.max_retries {
            results.push(failing.clone());
        }
        let runner = Arc::new(MockAgentRunner::new(results));
        let summary = run_batch(dir.path(), &config, &options, runner, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.failed, vec!["001-foo".to_string()]);
        assert!(!summary.is_clean());
    }
}
