use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRequest, AgentRunner};
use crate::artifact::{self, Paths, Prd};
use crate::config::WreckitConfig;
use crate::error::WreckitError;
use crate::gateway::GatewayHandle;
use crate::git::{self, PreflightCode, PrSummary};
use crate::item::{self, Item, ItemUpdate};
use crate::permissions::{self, PhaseTag};
use crate::prompt;
use crate::quality;
use crate::scope::{self, ScopePolicy};
use crate::state_machine::{self, TransitionContext};

/// Everything the Phase Executor needs to run one phase, independent of any
/// particular item (the fixed, per-phase half of the contract in §4.F).
pub struct PhaseSpec {
    pub tag: PhaseTag,
    pub prompt_template: String,
    pub scope_policy: ScopePolicy,
    /// Name of the structured tool call this phase's artifact must come
    /// through instead of a file write (plan's PRD save, implement's
    /// story-status update, complete's completion tool). `None` for phases
    /// that write files directly.
    pub required_mcp_tool: Option<&'static str>,
}

pub struct PhaseOutcome {
    pub success: bool,
    pub item: Item,
    pub attempts: u32,
    pub errors: Vec<String>,
}

/// Run `spec` against `item` with bounded retries, per the execution sequence
/// in §4.F. `extra_vars` supplies phase-specific prompt fields (merge
/// strategy, source context, allowed-paths list); `pre_impl_ref` is the ref a
/// `Scoped` policy's diff stats are measured against. `cancel` is checked
/// before each attempt and races the agent invocation itself, so a shutdown
/// signal stops a phase between (or during) attempts rather than only after
/// the whole retry budget is exhausted.
pub async fn run_phase(
    spec: &PhaseSpec,
    item: &Item,
    config: &WreckitConfig,
    repo_root: &Path,
    gateway: &GatewayHandle,
    runner: &impl AgentRunner,
    extra_vars: &HashMap<&str, String>,
    pre_impl_ref: Option<&str>,
    cancel: &CancellationToken,
) -> Result<PhaseOutcome, WreckitError> {
    let paths = Paths::new(repo_root);
    let max_attempts = config.execution.max_retries.max(1);
    let timeout = Duration::from_secs(config.execution.phase_timeout_seconds);
    let skills = artifact::read_skills(&paths);
    let skill_tools = skills.as_ref().and_then(|s| s.phases.get(phase_name(spec.tag)));
    let allowed_tools = permissions::effective_tools(spec.tag, skill_tools.map(|v| v.as_slice()));

    let mut previous_errors: Vec<String> = Vec::new();

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(WreckitError::GenericWreckit(format!(
                "phase {} for {} cancelled by shutdown signal",
                phase_name(spec.tag),
                item.id
            )));
        }

        let prompt_text = prompt::build_phase_prompt(
            &spec.prompt_template,
            item,
            &config.agent.completion_sentinel,
            extra_vars,
            attempt,
            &previous_errors,
        );

        let before = gateway.get_status().await?;

        let request = AgentRequest {
            working_dir: repo_root,
            prompt: &prompt_text,
            allowed_tools: Some(&allowed_tools),
            timeout,
            completion_sentinel: &config.agent.completion_sentinel,
            dry_run: config.agent.dry_run,
        };
        let agent_result = tokio::select! {
            result = runner.run_agent(&request) => result,
            _ = cancel.cancelled() => {
                return Err(WreckitError::GenericWreckit(format!(
                    "phase {} for {} cancelled by shutdown signal",
                    phase_name(spec.tag),
                    item.id
                )));
            }
        };

        if agent_result.timed_out {
            return Err(WreckitError::PhaseTimedOut {
                item_id: item.id.clone(),
                phase: phase_name(spec.tag).to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }

        if !agent_result.success {
            previous_errors = vec![agent_result.output.clone()];
            if attempt == max_attempts {
                return Err(WreckitError::PhaseFailed {
                    item_id: item.id.clone(),
                    phase: phase_name(spec.tag).to_string(),
                    attempts: attempt,
                    last_error: agent_result.output,
                });
            }
            continue;
        }

        match verify_attempt(spec, item, &paths, &agent_result.mcp_capture) {
            Ok(()) => {}
            Err(errors) => {
                previous_errors = errors.clone();
                if attempt == max_attempts {
                    return Err(WreckitError::PhaseFailed {
                        item_id: item.id.clone(),
                        phase: phase_name(spec.tag).to_string(),
                        attempts: attempt,
                        last_error: errors.join("; "),
                    });
                }
                continue;
            }
        }

        let after = gateway.get_status().await?;
        let diff = match pre_impl_ref {
            Some(r) => Some(gateway.diff_stats(r).await?),
            None => None,
        };
        let scope_report = scope::enforce(&spec.scope_policy, &before, &after, diff.as_ref());
        if !scope_report.valid {
            previous_errors = scope_report.violations.clone();
            if attempt == max_attempts {
                return Err(WreckitError::ScopeViolation { paths: scope_report.violations });
            }
            continue;
        }

        match quality_errors(spec.tag, item, &paths) {
            Ok(()) => {}
            Err(errors) => {
                previous_errors = errors.clone();
                if attempt == max_attempts {
                    return Err(quality_error(spec.tag, errors));
                }
                continue;
            }
        }

        // Phase commit: stage and commit whatever this attempt produced,
        // per §4.F's "[<id>][<phase>] <summary>" convention. A clean attempt
        // that changed nothing (e.g. a read-only research pass) has nothing
        // staged; that's not a failure.
        let commit_message = phase_commit_message(&item.id, phase_name(spec.tag), &agent_result.output);
        match gateway.commit_all(&commit_message).await {
            Ok(_) => {}
            Err(WreckitError::Git(ref msg)) if msg.contains("nothing to commit") => {}
            Err(e) => return Err(e),
        }

        if spec.tag == PhaseTag::Pr {
            let blocking_defects = std::fs::read_to_string(paths.critique_md(&item.id))
                .map(|md| parse_blocking_defects(&md))
                .unwrap_or_default();
            if !blocking_defects.is_empty() {
                previous_errors = blocking_defects.clone();
                if attempt == max_attempts {
                    return Err(WreckitError::PhaseFailed {
                        item_id: item.id.clone(),
                        phase: phase_name(spec.tag).to_string(),
                        attempts: attempt,
                        last_error: blocking_defects.join("; "),
                    });
                }
                continue;
            }
        }

        let mut pr_summary = None;
        if spec.tag == PhaseTag::Pr {
            match run_pr_side_effects(item, config, repo_root, gateway).await {
                Ok(pr) => pr_summary = Some(pr),
                Err(errors) => {
                    previous_errors = errors.clone();
                    if attempt == max_attempts {
                        return Err(WreckitError::PrCreationError(errors.join("; ")));
                    }
                    continue;
                }
            }
        }

        let ctx = build_transition_context(&paths, item, repo_root)?;
        let mut next_item = state_machine::apply_state_transition(item, &ctx, Utc::now())?;
        if let Some(pr) = pr_summary {
            item::apply_update(&mut next_item, ItemUpdate::SetPr { url: pr.url, number: pr.number }, Utc::now());
        }
        artifact::write_item(&paths, &next_item)?;

        return Ok(PhaseOutcome { success: true, item: next_item, attempts: attempt, errors: Vec::new() });
    }

    unreachable!("loop always returns on its final iteration")
}

/// Build a `[<id>][<phase>] <summary>` commit message, deduplicating the
/// prefix if the agent's own output already opens with it.
fn phase_commit_message(item_id: &str, phase: &str, agent_output: &str) -> String {
    let prefix = format!("[{}][{}]", item_id, phase);
    let summary = agent_output
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or("automated update");
    if summary.starts_with(&prefix) {
        summary.to_string()
    } else {
        format!("{} {}", prefix, summary)
    }
}

fn phase_name(tag: PhaseTag) -> &'static str {
    match tag {
        PhaseTag::Idea => "idea",
        PhaseTag::Research => "research",
        PhaseTag::Plan => "plan",
        PhaseTag::Implement => "implement",
        PhaseTag::Critique => "critique",
        PhaseTag::Pr => "pr",
        PhaseTag::Complete => "complete",
        PhaseTag::Strategy => "strategy",
        PhaseTag::Learn => "learn",
    }
}

/// Step 6 of §4.F: verify the phase's artifact exists and parses — either a
/// required file, or (for MCP-gated phases) a captured structured tool call.
/// Falling back to parsing stdout when the structured capture is absent is
/// forbidden, per §4.F.2's plan-phase note.
fn verify_attempt(
    spec: &PhaseSpec,
    item: &Item,
    paths: &Paths,
    mcp_capture: &Option<serde_json::Value>,
) -> Result<(), Vec<String>> {
    if let Some(tool) = spec.required_mcp_tool {
        if mcp_capture.is_none() {
            return Err(vec![format!("structured tool call '{}' was required but was not invoked", tool)]);
        }
        return Ok(());
    }

    match spec.tag {
        PhaseTag::Research => {
            if !paths.research_md(&item.id).exists() {
                return Err(vec!["research.md was not created".to_string()]);
            }
        }
        PhaseTag::Plan => {
            if !paths.plan_md(&item.id).exists() {
                return Err(vec!["plan.md was not created".to_string()]);
            }
        }
        PhaseTag::Critique => {
            if !paths.critique_md(&item.id).exists() {
                return Err(vec!["critique.md was not created".to_string()]);
            }
        }
        _ => {}
    }
    Ok(())
}

fn quality_errors(tag: PhaseTag, item: &Item, paths: &Paths) -> Result<(), Vec<String>> {
    match tag {
        PhaseTag::Research => {
            let markdown = std::fs::read_to_string(paths.research_md(&item.id)).map_err(|e| vec![e.to_string()])?;
            quality::validate_research(&markdown)
        }
        PhaseTag::Plan => {
            let markdown = std::fs::read_to_string(paths.plan_md(&item.id)).map_err(|e| vec![e.to_string()])?;
            quality::validate_plan(&markdown)?;
            let prd: Prd = artifact::read_prd(paths, &item.id).map_err(|e| vec![e.to_string()])?;
            artifact::validate_prd(&prd)
        }
        _ => Ok(()),
    }
}

fn quality_error(tag: PhaseTag, errors: Vec<String>) -> WreckitError {
    match tag {
        PhaseTag::Research => WreckitError::ResearchQuality(errors),
        PhaseTag::Plan => WreckitError::PlanQuality(errors),
        _ => WreckitError::GenericWreckit(errors.join("; ")),
    }
}

/// Preflight + secret-scan + quality-gates + create/update-PR + mergeability
/// poll for the `Pr` phase, per §4.F.2. `gh` calls run directly against the
/// repo rather than through the gateway, matching the spec's note that they
/// are not serialized with `git` plumbing.
async fn run_pr_side_effects(
    item: &Item,
    config: &WreckitConfig,
    repo_root: &Path,
    gateway: &GatewayHandle,
) -> Result<PrSummary, Vec<String>> {
    let branch = item.branch.clone().ok_or_else(|| vec!["no branch recorded for this item".to_string()])?;

    let issues = gateway.check_preflight(&config.git.allowed_remote_patterns).await;
    let blocking: Vec<String> = issues
        .into_iter()
        .filter(|i| matches!(i.code, PreflightCode::NoRemote | PreflightCode::InvalidRemoteUrl))
        .map(|i| i.message)
        .collect();
    if !blocking.is_empty() {
        return Err(blocking);
    }

    if config.git.secret_scan_enabled {
        let added = gateway.added_lines(&config.git.base_branch).await.map_err(|e| vec![e.to_string()])?;
        let hits = git::secret_scan(&added);
        if !hits.is_empty() {
            return Err(hits.into_iter().map(|h| format!("possible secret ({}): {}", h.pattern_name, h.line_preview)).collect());
        }
    }

    if !config.git.quality_gate_commands.is_empty() {
        gateway.run_quality_gates(&config.git.quality_gate_commands).await.map_err(|e| vec![e.to_string()])?;
    }

    gateway.push_branch(&branch).await.map_err(|e| vec![e.to_string()])?;

    let title = format!("{}: {}", item.id, item.title);
    let body = format!("Automated pull request for {}.", item.id);
    let pr = git::create_or_update_pr(&branch, &config.git.base_branch, &title, &body, repo_root)
        .map_err(|e| vec![e.to_string()])?;

    let mergeability = git::check_pr_mergeability(&branch, repo_root).map_err(|e| vec![e.to_string()])?;
    if mergeability.determined && !mergeability.mergeable {
        return Err(vec!["PR has merge conflicts against the base branch".to_string()]);
    }

    Ok(pr)
}

/// Assemble the context the state machine's guards need, reading whatever
/// artifacts are relevant for the item's *next* state. For the `Complete`
/// transition this queries `gh` directly for the PR's merged status.
fn build_transition_context(paths: &Paths, item: &Item, repo_root: &Path) -> Result<TransitionContext, WreckitError> {
    let prd = artifact::read_prd(paths, &item.id).ok();
    let pr_merged = match item.branch.as_deref() {
        Some(branch) if item.pr_url.is_some() => git::get_pr_details(branch, repo_root).map(|d| d.merged).unwrap_or(false),
        _ => false,
    };
    let blocking_defects = std::fs::read_to_string(paths.critique_md(&item.id))
        .map(|md| parse_blocking_defects(&md))
        .unwrap_or_default();
    Ok(TransitionContext {
        has_research_md: paths.research_md(&item.id).exists(),
        has_plan_md: paths.plan_md(&item.id).exists(),
        prd,
        has_pr: item.pr_url.is_some(),
        pr_merged,
        blocking_defects,
    })
}

/// Pull bullet items out of critique.md's `## Blocking Defects` section, per
/// the prompt convention set by `workflow::CRITIQUE_TEMPLATE`. A section
/// that's absent or has no bullets means no blocking defects were flagged.
fn parse_blocking_defects(markdown: &str) -> Vec<String> {
    let marker = "## Blocking Defects";
    let Some(start) = markdown.find(marker) else {
        return Vec::new();
    };
    let rest = &markdown[start + marker.len()..];
    let end = rest
        .match_indices("\n## ")
        .map(|(i, _)| i)
        .chain(rest.match_indices("\n# ").map(|(i, _)| i))
        .min()
        .unwrap_or(rest.len());
    rest[..end]
        .lines()
        .map(|l| l.trim())
        .filter(|l| l.starts_with('-') || l.starts_with('*'))
        .map(|l| l.trim_start_matches(['-', '*']).trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentErrorKind, AgentResult, MockAgentRunner};
    use crate::gateway::spawn_gateway;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &std::path::Path) {
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["config", "user.name", "t"]).current_dir(dir).status().unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(dir).status().unwrap();
        StdCommand::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).status().unwrap();
    }

    #[test]
    fn parse_blocking_defects_reads_bullets_under_heading() {
        let md = "# Critique\n\n## Summary\nLooks fine overall.\n\n## Blocking Defects\n- race condition in the retry loop\n- missing null check on line 42\n\n## Notes\nunrelated\n";
        let defects = parse_blocking_defects(md);
        assert_eq!(defects, vec!["race condition in the retry loop", "missing null check on line 42"]);
    }

    #[test]
    fn parse_blocking_defects_empty_section_yields_no_defects() {
        let md = "## Blocking Defects\nNone found.\n";
        assert!(parse_blocking_defects(md).is_empty());
    }

    #[test]
    fn parse_blocking_defects_missing_heading_yields_no_defects() {
        assert!(parse_blocking_defects("# Critique\n\nAll good.\n").is_empty());
    }

    fn ok_result() -> AgentResult {
        AgentResult {
            success: true,
            output: "<promise>COMPLETE</promise>".to_string(),
            exit_code: Some(0),
            timed_out: false,
            completion_detected: true,
            error_kind: None,
            mcp_capture: None,
        }
    }

    #[tokio::test]
    async fn research_phase_writes_research_md_and_advances_state() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (gateway, _task) = spawn_gateway(dir.path().to_path_buf());
        let paths = Paths::new(dir.path());
        let item = Item::new("001-foo", "Foo");
        artifact::write_item(&paths, &item).unwrap();

        // the mock agent "writes" research.md as a side effect, standing in for
        // what a real CLI backend would do while running
        let research_md = (1..=5).map(|i| format!("src/lib{i}.rs:{}\n", i * 10)).collect::<String>();
        let markdown = format!(
            "# R\n\n## Research Question\nQ\n\n## Summary\n{}\n\n## Current State Analysis\n{}\n\n## Key Files\n{}\n\n## Technical Considerations\nN\n\n## Risks and Mitigations\nN\n\n## Recommended Approach\nN\n\n## Open Questions\nN\n",
            "x".repeat(100),
            "y".repeat(150),
            research_md,
        );
        std::fs::create_dir_all(paths.item_dir(&item.id)).unwrap();
        std::fs::write(paths.research_md(&item.id), markdown).unwrap();

        let config = WreckitConfig::default();
        let runner = MockAgentRunner::new(vec![ok_result()]);
        let spec = PhaseSpec {
            tag: PhaseTag::Research,
            prompt_template: "Research {{id}}".to_string(),
            scope_policy: ScopePolicy::ReadOnly { allowed_paths: vec![format!(".wreckit/items/{}/research.md", item.id)] },
            required_mcp_tool: None,
        };

        let outcome = run_phase(&spec, &item, &config, dir.path(), &gateway, &runner, &HashMap::new(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.item.state, crate::state_machine::ItemState::Researched);
    }

    #[tokio::test]
    async fn plan_phase_without_mcp_capture_fails_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (gateway, _task) = spawn_gateway(dir.path().to_path_buf());
        let mut item = Item::new("001-foo", "Foo");
        item.state = crate::state_machine::ItemState::Researched;
        let paths = Paths::new(dir.path());
        artifact::write_item(&paths, &item).unwrap();

        let mut config = WreckitConfig::default();
        config.execution.max_retries = 2;
        let runner = MockAgentRunner::new(vec![ok_result(), ok_result()]);
        let spec = PhaseSpec {
            tag: PhaseTag::Plan,
            prompt_template: "Plan {{id}}".to_string(),
            scope_policy: ScopePolicy::DesignOnly { allowed_paths: vec![format!(".wreckit/items/{}/", item.id)] },
            required_mcp_tool: Some("save_prd"),
        };

        let result = run_phase(&spec, &item, &config, dir.path(), &gateway, &runner, &HashMap::new(), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WreckitError::PhaseFailed { .. })));
    }

    #[tokio::test]
    async fn timeout_is_surfaced_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let (gateway, _task) = spawn_gateway(dir.path().to_path_buf());
        let item = Item::new("001-foo", "Foo");
        let paths = Paths::new(dir.path());
        artifact::write_item(&paths, &item).unwrap();

        let config = WreckitConfig::default();
        let timed_out = AgentResult {
            success: false,
            output: String::new(),
            exit_code: None,
            timed_out: true,
            completion_detected: false,
            error_kind: Some(AgentErrorKind::Generic),
            mcp_capture: None,
        };
        let runner = MockAgentRunner::new(vec![timed_out]);
        let spec = PhaseSpec {
            tag: PhaseTag::Research,
            prompt_template: "Research {{id}}".to_string(),
            scope_policy: ScopePolicy::ReadOnly { allowed_paths: vec![] },
            required_mcp_tool: None,
        };

        let result = run_phase(&spec, &item, &config, dir.path(), &gateway, &runner, &HashMap::new(), None, &CancellationToken::new()).await;
        assert!(matches!(result, Err(WreckitError::PhaseTimedOut { .. })));
    }
}
