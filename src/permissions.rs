use std::collections::HashSet;

use crate::error::WreckitError;

/// Phase tags that drive the phase → toolset mapping. Distinct from
/// `state_machine::ItemState`: `strategy`/`learn` have no corresponding item
/// state, and `idea`/`complete` map onto states but are phases in their own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseTag {
    Idea,
    Research,
    Plan,
    Implement,
    Critique,
    Pr,
    Complete,
    Strategy,
    Learn,
}

fn phase_toolset(phase: PhaseTag) -> Vec<&'static str> {
    match phase {
        PhaseTag::Idea => vec!["structured-capture"],
        PhaseTag::Research => vec!["Read", "Write", "Glob", "Grep"],
        PhaseTag::Plan => vec!["Read", "Write", "Edit", "Glob", "Grep", "structured-prd-save"],
        PhaseTag::Implement => vec!["Read", "Write", "Edit", "Glob", "Grep", "Bash", "structured-story-status-update"],
        PhaseTag::Critique => vec!["Read", "Glob", "Grep"],
        PhaseTag::Pr => vec!["Read", "Glob", "Grep", "Bash"],
        PhaseTag::Complete => vec!["Read", "Glob", "Grep", "structured-complete"],
        PhaseTag::Strategy | PhaseTag::Learn => vec!["Read", "Write", "Glob", "Grep"],
    }
}

/// Compute the effective tool set for a phase, optionally narrowed by a skill's
/// own declared tool set. A skill can only narrow, never widen, the phase's
/// allowlist: the result is always a subset of `phase_toolset(phase)`.
pub fn effective_tools(phase: PhaseTag, skill_tools: Option<&[String]>) -> Vec<String> {
    let phase_set: HashSet<&str> = phase_toolset(phase).into_iter().collect();
    match skill_tools {
        None => {
            let mut tools: Vec<String> = phase_set.into_iter().map(|s| s.to_string()).collect();
            tools.sort();
            tools
        }
        Some(skill_tools) => {
            let skill_set: HashSet<&str> = skill_tools.iter().map(|s| s.as_str()).collect();
            let mut tools: Vec<String> = phase_set.intersection(&skill_set).map(|s| s.to_string()).collect();
            tools.sort();
            tools
        }
    }
}

/// Callers that cannot actually enforce a per-invocation tool restriction (e.g.
/// an agent CLI with no `--allowedTools`-equivalent flag) must refuse rather
/// than silently run unrestricted.
pub fn require_enforceable(cli_supports_tool_restriction: bool) -> Result<(), WreckitError> {
    if cli_supports_tool_restriction {
        Ok(())
    } else {
        Err(WreckitError::GenericWreckit(
            "agent CLI cannot enforce a per-invocation tool allowlist; refusing to invoke unrestricted".to_string(),
        ))
    }
}
