use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::WreckitError;
use crate::item::Item;

/// Path helpers for every known location under `<repo>/.wreckit/`.
pub struct Paths {
    pub root: PathBuf,
}

impl Paths {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            root: repo_root.join(".wreckit"),
        }
    }

    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    pub fn item_dir(&self, id: &str) -> PathBuf {
        self.items_dir().join(id)
    }

    pub fn item_json(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("item.json")
    }

    pub fn research_md(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("research.md")
    }

    pub fn plan_md(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("plan.md")
    }

    pub fn prd_json(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("prd.json")
    }

    pub fn critique_md(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("critique.md")
    }

    pub fn index_json(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn batch_progress_json(&self) -> PathBuf {
        self.root.join("batch-progress.json")
    }

    pub fn skills_json(&self) -> PathBuf {
        self.root.join("skills.json")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }
}

/// Write `path + ".tmp"`, fsync, rename to `path`. A stray `.tmp` left behind by a
/// crash is safe to delete; `path` itself is only ever replaced atomically.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), WreckitError> {
    let parent = path
        .parent()
        .ok_or_else(|| WreckitError::GenericWreckit(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let temp_file = NamedTempFile::new_in(parent)?;
    fs::write(temp_file.path(), contents)?;

    let file = File::open(temp_file.path())?;
    file.sync_all()?;

    temp_file
        .persist(path)
        .map_err(|e| WreckitError::Io(e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), WreckitError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| WreckitError::InvalidJson {
        path: path.to_path_buf(),
        source: e,
    })?;
    atomic_write(path, &json)
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, WreckitError> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| WreckitError::InvalidJson {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn write_markdown_atomic(path: &Path, contents: &str) -> Result<(), WreckitError> {
    atomic_write(path, contents.as_bytes())
}

pub fn read_item(paths: &Paths, id: &str) -> Result<Item, WreckitError> {
    let mut item: Item = read_json(&paths.item_json(id))?;
    item.prd = read_prd(paths, id).ok();
    Ok(item)
}

pub fn write_item(paths: &Paths, item: &Item) -> Result<(), WreckitError> {
    write_json_atomic(&paths.item_json(&item.id), item)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: u8,
    pub status: StoryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Prd {
    pub stories: Vec<Story>,
}

/// Validate a PRD against the schema in §4.F.1 ("story quality"): 1-15 stories;
/// id matches `US-(\d+|\d{3}-\d+)`; non-empty title; >=2 non-empty acceptance
/// criteria; priority in [1,4]. A total function: never panics on malformed input.
pub fn validate_prd(prd: &Prd) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if prd.stories.is_empty() || prd.stories.len() > 15 {
        errors.push(format!(
            "prd must contain 1-15 stories, found {}",
            prd.stories.len()
        ));
    }
    let id_re = Regex::new(r"^US-(?:\d+|\d{3}-\d+)$").unwrap();
    for story in &prd.stories {
        if !id_re.is_match(&story.id) {
            errors.push(format!("story id '{}' does not match ^US-(\\d+|\\d{{3}}-\\d+)$", story.id));
        }
        if story.title.trim().is_empty() {
            errors.push(format!("story {} has an empty title", story.id));
        }
        let non_empty_criteria = story
            .acceptance_criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .count();
        if non_empty_criteria < 2 {
            errors.push(format!(
                "story {} has {} non-empty acceptance criteria, need >= 2",
                story.id, non_empty_criteria
            ));
        }
        if !(1..=4).contains(&story.priority) {
            errors.push(format!("story {} priority {} is out of range [1,4]", story.id, story.priority));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn read_prd(paths: &Paths, id: &str) -> Result<Prd, WreckitError> {
    read_json(&paths.prd_json(id))
}

pub fn write_prd(paths: &Paths, id: &str, prd: &Prd) -> Result<(), WreckitError> {
    write_json_atomic(&paths.prd_json(id), prd)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub state: crate::state_machine::ItemState,
    pub title: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub items: Vec<IndexEntry>,
}

/// Rebuild `index.json` by scanning `items/*/item.json`. Readers must tolerate a
/// stale index; nothing prevents rebuilding it at any time.
pub fn rebuild_index(paths: &Paths) -> Result<Index, WreckitError> {
    let mut items = Vec::new();
    let items_dir = paths.items_dir();
    if items_dir.is_dir() {
        let mut dirs: Vec<_> = fs::read_dir(&items_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        dirs.sort_by_key(|e| e.file_name());
        for entry in dirs {
            let id = entry.file_name().to_string_lossy().to_string();
            if let Ok(item) = read_item(paths, &id) {
                items.push(IndexEntry {
                    id: item.id,
                    state: item.state,
                    title: item.title,
                    depends_on: item.depends_on,
                });
            }
        }
    }
    Ok(Index {
        schema_version: 1,
        generated_at: Utc::now(),
        items,
    })
}

pub fn write_index(paths: &Paths, index: &Index) -> Result<(), WreckitError> {
    write_json_atomic(&paths.index_json(), index)
}

/// Optional `skills.json`: per-phase tool sets that can only narrow, never
/// widen, a phase's own allowlist (see `permissions::effective_tools`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    pub phases: std::collections::HashMap<String, Vec<String>>,
}

/// `None` for a missing or malformed file: skill narrowing is optional, so its
/// absence falls back to each phase's full toolset rather than an error.
pub fn read_skills(paths: &Paths) -> Option<SkillsConfig> {
    let contents = fs::read_to_string(paths.skills_json()).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("item.json");
        let item = Item::new("001-foo", "Foo");
        write_json_atomic(&path, &item).unwrap();
        let read_back: Item = read_json(&path).unwrap();
        assert_eq!(read_back.id, "001-foo");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn prd_validation_total_function_never_panics() {
        let garbage = Prd {
            stories: vec![Story {
                id: "not-a-valid-id".to_string(),
                title: "".to_string(),
                acceptance_criteria: vec![],
                priority: 99,
                status: StoryStatus::Pending,
            }],
        };
        let errors = validate_prd(&garbage).unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn prd_validation_accepts_well_formed_story() {
        let prd = Prd {
            stories: vec![Story {
                id: "US-001".to_string(),
                title: "Add login".to_string(),
                acceptance_criteria: vec!["works".to_string(), "is tested".to_string()],
                priority: 2,
                status: StoryStatus::Pending,
            }],
        };
        assert!(validate_prd(&prd).is_ok());
    }

    #[test]
    fn index_rebuild_is_empty_for_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let index = rebuild_index(&paths).unwrap();
        assert!(index.items.is_empty());
    }

    #[test]
    fn read_skills_is_none_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        assert!(read_skills(&paths).is_none());
    }

    #[test]
    fn read_skills_parses_per_phase_tool_sets() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        fs::create_dir_all(&paths.root).unwrap();
        fs::write(paths.skills_json(), r#"{"phases":{"research":["Read","Grep"]}}"#).unwrap();
        let skills = read_skills(&paths).unwrap();
        assert_eq!(skills.phases.get("research").unwrap(), &vec!["Read".to_string(), "Grep".to_string()]);
    }
}
