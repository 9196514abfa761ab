use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::artifact::Prd;
use crate::state_machine::ItemState;

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{3,}-[a-z0-9-]+$").unwrap())
}

/// Returns `Ok(())` if `id` matches `^\d{3,}-[a-z0-9-]+$`.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(format!("invalid item id '{}': must match ^\\d{{3,}}-[a-z0-9-]+$", id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    pub schema_version: u32,
    pub id: String,
    pub title: String,
    pub overview: String,
    pub section: Option<String>,
    pub campaign: Option<String>,
    pub depends_on: Vec<String>,
    pub state: ItemState,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Structured intake hints.
    pub problem_statement: Option<String>,
    pub motivation: Option<String>,
    pub success_criteria: Vec<String>,
    pub technical_constraints: Vec<String>,
    pub scope_in: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub priority_hint: Option<String>,
    pub urgency_hint: Option<String>,

    /// Not persisted in `item.json` directly; hydrated from `prd.json` when present.
    /// Kept on the struct so `state_machine` guards can consult it without threading
    /// a second argument through every call site.
    #[serde(skip)]
    pub prd: Option<Prd>,
}

impl Default for Item {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            schema_version: 1,
            id: String::new(),
            title: String::new(),
            overview: String::new(),
            section: None,
            campaign: None,
            depends_on: Vec::new(),
            state: ItemState::Idea,
            branch: None,
            pr_url: None,
            pr_number: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            problem_statement: None,
            motivation: None,
            success_criteria: Vec::new(),
            technical_constraints: Vec::new(),
            scope_in: Vec::new(),
            out_of_scope: Vec::new(),
            priority_hint: None,
            urgency_hint: None,
            prd: None,
        }
    }
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn new_for_test(id: &str, state: ItemState) -> Self {
        Self {
            id: id.to_string(),
            title: "test item".to_string(),
            state,
            ..Default::default()
        }
    }

    pub fn branch_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.id)
    }
}

/// Pure mutation dispatch, mirroring the update-enum pattern used elsewhere in this
/// lineage for item mutation: every write to an `Item` outside of a state transition
/// goes through one of these variants so call sites stay declarative.
pub enum ItemUpdate {
    SetBranch(String),
    SetPr { url: String, number: u64 },
    SetLastError(Option<String>),
    ClearLastError,
}

pub fn apply_update(item: &mut Item, update: ItemUpdate, now: DateTime<Utc>) {
    match update {
        ItemUpdate::SetBranch(branch) => item.branch = Some(branch),
        ItemUpdate::SetPr { url, number } => {
            item.pr_url = Some(url);
            item.pr_number = Some(number);
        }
        ItemUpdate::SetLastError(err) => item.last_error = err,
        ItemUpdate::ClearLastError => item.last_error = None,
    }
    item.updated_at = now.max(item.updated_at);
}
