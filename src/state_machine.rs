use serde::{Deserialize, Serialize};

use crate::artifact::Prd;
use crate::error::WreckitError;

/// The canonical, strictly linear state sequence. This is the single source of
/// truth: phase selection (`workflow.rs`) and transition guards both read from
/// `SEQUENCE` / `guard` rather than redeclaring the list.
pub const SEQUENCE: [ItemState; 7] = [
    ItemState::Idea,
    ItemState::Researched,
    ItemState::Planned,
    ItemState::Implementing,
    ItemState::Critique,
    ItemState::InPr,
    ItemState::Done,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Idea,
    Researched,
    Planned,
    Implementing,
    Critique,
    InPr,
    Done,
}

impl ItemState {
    fn index(self) -> usize {
        SEQUENCE.iter().position(|s| *s == self).expect("state in SEQUENCE")
    }

    /// The immediate successor in the canonical sequence, or `None` at `Done`.
    pub fn next_state(self) -> Option<ItemState> {
        SEQUENCE.get(self.index() + 1).copied()
    }

    /// A 0-or-1-element list: the state machine is strictly linear.
    pub fn allowed_next_states(self) -> Vec<ItemState> {
        self.next_state().into_iter().collect()
    }
}

/// Evidence gathered by the Phase Executor and passed to `apply_state_transition`.
/// Building this is the executor's job; evaluating it is this module's.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub has_research_md: bool,
    pub has_plan_md: bool,
    pub prd: Option<Prd>,
    pub has_pr: bool,
    pub pr_merged: bool,
    /// Any non-empty "Blocking Defects" list from `critique.md`.
    pub blocking_defects: Vec<String>,
}

fn guard(target: ItemState, ctx: &TransitionContext) -> Result<(), WreckitError> {
    match target {
        ItemState::Idea => Ok(()),
        ItemState::Researched => {
            if ctx.has_research_md {
                Ok(())
            } else {
                Err(WreckitError::ArtifactNotCreated {
                    path: "research.md".into(),
                })
            }
        }
        ItemState::Planned => {
            if !ctx.has_plan_md {
                return Err(WreckitError::ArtifactNotCreated {
                    path: "plan.md".into(),
                });
            }
            match &ctx.prd {
                Some(prd) if prd.stories.iter().any(|s| s.status == crate::artifact::StoryStatus::Pending) => {
                    Ok(())
                }
                Some(_) => Err(WreckitError::StoryQuality(vec![
                    "prd.json has no pending stories".to_string(),
                ])),
                None => Err(WreckitError::ArtifactNotCreated {
                    path: "prd.json".into(),
                }),
            }
        }
        ItemState::Implementing => match &ctx.prd {
            Some(prd) if prd.stories.iter().any(|s| s.status == crate::artifact::StoryStatus::Pending) => {
                Ok(())
            }
            _ => Err(WreckitError::StoryQuality(vec![
                "no pending stories to implement".to_string(),
            ])),
        },
        ItemState::Critique => match &ctx.prd {
            Some(prd) if prd.stories.iter().all(|s| s.status == crate::artifact::StoryStatus::Done) => {
                Ok(())
            }
            _ => Err(WreckitError::StoryQuality(vec![
                "not all stories are done".to_string(),
            ])),
        },
        ItemState::InPr => {
            // The phase executor already gates on this before ever calling the
            // `pr` phase's side effects (see `phase::run_phase`); this is a
            // defense-in-depth backstop, so it uses the same retryable
            // classification the executor's own check resolves to.
            if !ctx.blocking_defects.is_empty() {
                return Err(WreckitError::StoryQuality(vec![format!(
                    "critique flagged blocking defects: {:?}",
                    ctx.blocking_defects
                )]));
            }
            let all_done = ctx
                .prd
                .as_ref()
                .map(|p| p.stories.iter().all(|s| s.status == crate::artifact::StoryStatus::Done))
                .unwrap_or(false);
            if all_done && ctx.has_pr {
                Ok(())
            } else if !all_done {
                Err(WreckitError::StoryQuality(vec!["not all stories are done".to_string()]))
            } else {
                Err(WreckitError::PrCreationError("no PR exists for the current branch".to_string()))
            }
        }
        ItemState::Done => {
            if ctx.pr_merged {
                Ok(())
            } else {
                Err(WreckitError::MergeConflict("PR is not merged".to_string()))
            }
        }
    }
}

/// Pure: validates the transition from `item.state` to its successor and returns a
/// new `Item` with `state` advanced and `updated_at` refreshed, or a typed error.
/// Never mutates `item`; calling twice with the same inputs yields the same output.
pub fn apply_state_transition(
    item: &crate::item::Item,
    ctx: &TransitionContext,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<crate::item::Item, WreckitError> {
    let target = item
        .state
        .next_state()
        .ok_or_else(|| WreckitError::GenericWreckit(format!("{} is already at a terminal state", item.id)))?;
    guard(target, ctx)?;
    let mut next = item.clone();
    next.state = target;
    next.updated_at = now.max(item.updated_at);
    Ok(next)
}
