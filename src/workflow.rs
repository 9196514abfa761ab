use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::artifact::{self, Paths};
use crate::config::WreckitConfig;
use crate::dag;
use crate::error::WreckitError;
use crate::gateway::GatewayHandle;
use crate::item::{self, Item, ItemUpdate};
use crate::permissions::PhaseTag;
use crate::phase::{self, PhaseSpec};
use crate::scope::{ScopePolicy, StoryLimits};
use crate::state_machine::ItemState;

/// What the orchestrator should do next for a given item, per §4.G step 1-2.
pub enum NextStep {
    RunPhase(PhaseTag),
    /// Not a persisted item state — purely orchestrator-run output for a
    /// dependency that is not yet `done`.
    Blocked,
    Stop,
}

pub fn next_step(item: &Item, done_ids: &HashSet<String>) -> NextStep {
    if item.state == ItemState::Done {
        return NextStep::Stop;
    }
    if !dag::dependencies_satisfied(item, done_ids) {
        return NextStep::Blocked;
    }
    let tag = match item.state {
        ItemState::Idea => PhaseTag::Research,
        ItemState::Researched => PhaseTag::Plan,
        ItemState::Planned => PhaseTag::Implement,
        ItemState::Implementing => PhaseTag::Critique,
        ItemState::Critique => PhaseTag::Pr,
        ItemState::InPr => PhaseTag::Complete,
        ItemState::Done => unreachable!("handled above"),
    };
    NextStep::RunPhase(tag)
}

fn item_dir_prefix(item_id: &str) -> String {
    format!(".wreckit/items/{}/", item_id)
}

/// Build the fixed half of a phase's contract for `tag` against `item`. Used
/// both by the item workflow loop and by the single-phase CLI command.
pub fn phase_spec_for_cli(tag: PhaseTag, item: &Item) -> PhaseSpec {
    phase_spec_for(tag, item)
}

fn phase_spec_for(tag: PhaseTag, item: &Item) -> PhaseSpec {
    let dir = item_dir_prefix(&item.id);
    match tag {
        PhaseTag::Research => PhaseSpec {
            tag,
            prompt_template: RESEARCH_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::ReadOnly { allowed_paths: vec![format!("{}research.md", dir)] },
            required_mcp_tool: None,
        },
        PhaseTag::Plan => PhaseSpec {
            tag,
            prompt_template: PLAN_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::DesignOnly { allowed_paths: vec![format!("{}plan.md", dir), format!("{}prd.json", dir)] },
            required_mcp_tool: Some("save_prd"),
        },
        PhaseTag::Implement => PhaseSpec {
            tag,
            prompt_template: IMPLEMENT_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::Scoped {
                story_limits: StoryLimits::default(),
                allowed_paths: vec![dir.clone()],
            },
            required_mcp_tool: Some("mark_story_done"),
        },
        PhaseTag::Critique => PhaseSpec {
            tag,
            prompt_template: CRITIQUE_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::DesignOnly { allowed_paths: vec![format!("{}critique.md", dir)] },
            required_mcp_tool: None,
        },
        PhaseTag::Pr => PhaseSpec {
            tag,
            prompt_template: PR_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::Unrestricted,
            required_mcp_tool: None,
        },
        PhaseTag::Complete => PhaseSpec {
            tag,
            prompt_template: COMPLETE_TEMPLATE.to_string(),
            scope_policy: ScopePolicy::ReadOnly { allowed_paths: vec![] },
            required_mcp_tool: Some("complete"),
        },
        PhaseTag::Idea | PhaseTag::Strategy | PhaseTag::Learn => {
            unreachable!("{:?} is not reachable from the item workflow's next-phase table", tag)
        }
    }
}

fn extra_vars_for<'a>(tag: PhaseTag, _config: &'a WreckitConfig) -> HashMap<&'a str, String> {
    let mut vars = HashMap::new();
    if tag == PhaseTag::Pr {
        vars.insert("merge_strategy", "no-ff".to_string());
    }
    vars
}

const RESEARCH_TEMPLATE: &str = "Research {{id}} — {{title}}\n\n{{overview}}\n\nWrite research.md. Signal {{completion_signal}} when done.";
const PLAN_TEMPLATE: &str = "Plan {{id}} — {{title}}\n\nWrite plan.md and save the PRD via the structured tool. Signal {{completion_signal}} when done.";
const IMPLEMENT_TEMPLATE: &str = "Implement pending stories for {{id}} — {{title}}. Mark each story done via the structured tool once verified. Signal {{completion_signal}} when done.";
const CRITIQUE_TEMPLATE: &str = "Critique the implementation of {{id}} — {{title}}. Write critique.md, flagging any blocking defects under a '## Blocking Defects' heading. Signal {{completion_signal}} when done.";
const PR_TEMPLATE: &str = "Open or update the PR for {{id}} — {{title}} using a {{merge_strategy}} merge strategy. Signal {{completion_signal}} when done.";
const COMPLETE_TEMPLATE: &str = "Confirm {{id}} — {{title}} is fully merged and clean up. Signal {{completion_signal}} when done.";

/// Drive a single item through its remaining phases, strictly sequentially —
/// never two phases of the same item concurrently (§4.G's ordering guarantee
/// holds for free since this is one `await`-chained loop, not a fan-out).
pub async fn run_item_workflow(
    mut item: Item,
    config: &WreckitConfig,
    repo_root: &Path,
    gateway: &GatewayHandle,
    runner: &impl AgentRunner,
    done_ids: &HashSet<String>,
    cancel: &CancellationToken,
) -> Result<Item, WreckitError> {
    let paths = Paths::new(repo_root);

    loop {
        if cancel.is_cancelled() {
            return Ok(item);
        }

        match next_step(&item, done_ids) {
            NextStep::Stop => return Ok(item),
            NextStep::Blocked => return Ok(item),
            NextStep::RunPhase(tag) => {
                if item.branch.is_none() {
                    let ensured = gateway.ensure_branch(&config.git.base_branch, &config.git.branch_prefix, &item.id).await?;
                    item::apply_update(&mut item, ItemUpdate::SetBranch(ensured.name), Utc::now());
                    artifact::write_item(&paths, &item)?;
                }

                let spec = phase_spec_for(tag, &item);
                let extra_vars = extra_vars_for(tag, config);
                let pre_impl_ref = if tag == PhaseTag::Implement { gateway.get_head_sha().await.ok() } else { None };

                match phase::run_phase(&spec, &item, config, repo_root, gateway, runner, &extra_vars, pre_impl_ref.as_deref(), cancel)
                    .await
                {
                    Ok(outcome) => {
                        item = outcome.item;
                        item::apply_update(&mut item, ItemUpdate::ClearLastError, Utc::now());
                        artifact::write_item(&paths, &item)?;
                    }
                    Err(e) => {
                        item::apply_update(&mut item, ItemUpdate::SetLastError(Some(e.to_string())), Utc::now());
                        artifact::write_item(&paths, &item)?;
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, state: ItemState, deps: &[&str]) -> Item {
        let mut i = Item::new_for_test(id, state);
        i.depends_on = deps.iter().map(|s| s.to_string()).collect();
        i
    }

    #[test]
    fn idea_maps_to_research_phase() {
        let done = HashSet::new();
        assert!(matches!(next_step(&item("001-a", ItemState::Idea, &[]), &done), NextStep::RunPhase(PhaseTag::Research)));
    }

    #[test]
    fn done_item_stops() {
        let done = HashSet::new();
        assert!(matches!(next_step(&item("001-a", ItemState::Done, &[]), &done), NextStep::Stop));
    }

    #[test]
    fn unmet_dependency_blocks_without_persisting() {
        let done = HashSet::new();
        let blocked = item("002-b", ItemState::Idea, &["001-a"]);
        assert!(matches!(next_step(&blocked, &done), NextStep::Blocked));
    }

    #[test]
    fn met_dependency_proceeds() {
        let mut done = HashSet::new();
        done.insert("001-a".to_string());
        let unblocked = item("002-b", ItemState::Idea, &["001-a"]);
        assert!(matches!(next_step(&unblocked, &done), NextStep::RunPhase(PhaseTag::Research)));
    }

    #[test]
    fn critique_maps_to_pr_phase() {
        let done = HashSet::new();
        assert!(matches!(next_step(&item("001-a", ItemState::Critique, &[]), &done), NextStep::RunPhase(PhaseTag::Pr)));
    }
}
