use std::sync::OnceLock;

use regex::Regex;

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[\w./-]+\.[\w-]+:\d+(?:-\d+)?\b").unwrap())
}

const RESEARCH_REQUIRED_SECTIONS: &[&str] = &[
    "Header",
    "Research Question",
    "Summary",
    "Current State Analysis",
    "Key Files",
    "Technical Considerations",
    "Risks and Mitigations",
    "Recommended Approach",
    "Open Questions",
];

const PLAN_REQUIRED_SECTIONS: &[&str] = &[
    "Header",
    "Implementation Plan Title",
    "Overview",
    "Current State",
    "Desired End State",
    "What We're NOT Doing",
    "Implementation Approach",
    "Phases",
    "Testing Strategy",
];

/// Find the body text between a level-2 (`## Name`) heading and the next
/// level-1/2 heading (or end of document). `Header` is a stand-in for the
/// document title (the first line) and is treated as always present once
/// `markdown` is non-empty.
fn section_body<'a>(markdown: &'a str, heading: &str) -> Option<&'a str> {
    if heading == "Header" {
        return if markdown.trim().is_empty() { None } else { Some(markdown) };
    }
    let marker = format!("## {}", heading);
    let start = markdown.find(&marker)? + marker.len();
    let rest = &markdown[start..];
    let end = rest
        .match_indices("\n## ")
        .map(|(i, _)| i)
        .chain(rest.match_indices("\n# ").map(|(i, _)| i))
        .min()
        .unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn missing_sections(markdown: &str, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|s| section_body(markdown, s).is_none())
        .map(|s| format!("missing required section '{}'", s))
        .collect()
}

/// Validate `research.md` per §4.F.1: citation count, required sections, and
/// minimum content length for two of them. Returns every error found.
pub fn validate_research(markdown: &str) -> Result<(), Vec<String>> {
    let mut errors = missing_sections(markdown, RESEARCH_REQUIRED_SECTIONS);

    let citations = citation_re().find_iter(markdown).count();
    if citations < 5 {
        errors.push(format!("research.md cites {} file:line references, need >= 5", citations));
    }

    if let Some(summary) = section_body(markdown, "Summary") {
        if summary.len() < 100 {
            errors.push(format!("Summary section is {} chars, need >= 100", summary.len()));
        }
    }
    if let Some(analysis) = section_body(markdown, "Current State Analysis") {
        if analysis.len() < 150 {
            errors.push(format!("Current State Analysis section is {} chars, need >= 150", analysis.len()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate `plan.md` per §4.F.1: required sections and at least one level-3
/// heading nested under `## Phases`.
pub fn validate_plan(markdown: &str) -> Result<(), Vec<String>> {
    let mut errors = missing_sections(markdown, PLAN_REQUIRED_SECTIONS);

    if let Some(phases_body) = section_body(markdown, "Phases") {
        let phase_count = phases_body.lines().filter(|l| l.trim_start().starts_with("### ")).count();
        if phase_count < 1 {
            errors.push("Phases section must contain at least one level-3 phase heading".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

const MAX_IDEAS: usize = 50;
const MAX_TITLE_CHARS: usize = 120;
const MAX_DESCRIPTION_CHARS: usize = 2000;
const MAX_SUCCESS_CRITERIA: usize = 20;
const MAX_PAYLOAD_BYTES: usize = 100 * 1024;

pub struct IdeaPayload {
    pub title: String,
    pub description: String,
    pub success_criteria: Vec<String>,
}

/// Validate an idea-ingestion payload against §4.F.1's hard limits before any
/// of it touches the filesystem.
pub fn validate_idea_payload(ideas: &[IdeaPayload], raw_json: &[u8]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if ideas.len() > MAX_IDEAS {
        errors.push(format!("payload contains {} ideas, max {}", ideas.len(), MAX_IDEAS));
    }
    if raw_json.len() > MAX_PAYLOAD_BYTES {
        errors.push(format!("payload is {} bytes, max {}", raw_json.len(), MAX_PAYLOAD_BYTES));
    }
    for (i, idea) in ideas.iter().enumerate() {
        if idea.title.chars().count() > MAX_TITLE_CHARS {
            errors.push(format!("idea[{}].title exceeds {} chars", i, MAX_TITLE_CHARS));
        }
        if idea.description.chars().count() > MAX_DESCRIPTION_CHARS {
            errors.push(format!("idea[{}].description exceeds {} chars", i, MAX_DESCRIPTION_CHARS));
        }
        if idea.success_criteria.len() > MAX_SUCCESS_CRITERIA {
            errors.push(format!("idea[{}].success_criteria exceeds {} items", i, MAX_SUCCESS_CRITERIA));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
