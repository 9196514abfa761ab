use crate::git::{DiffStats, GitFileChange};

/// What a phase is permitted to touch. Mirrors the phase-spec's `scope policy`
/// field (§4.F); `Phase Executor` picks the variant, this module enforces it.
#[derive(Debug, Clone)]
pub enum ScopePolicy {
    ReadOnly { allowed_paths: Vec<String> },
    DesignOnly { allowed_paths: Vec<String> },
    Scoped { story_limits: StoryLimits, allowed_paths: Vec<String> },
    Unrestricted,
}

#[derive(Debug, Clone)]
pub struct StoryLimits {
    pub max_files: u64,
    pub max_lines: u64,
    pub max_bytes: u64,
    pub exclude_patterns: Vec<String>,
    pub warning_threshold: f64,
}

impl Default for StoryLimits {
    fn default() -> Self {
        Self {
            max_files: 25,
            max_lines: 2000,
            max_bytes: 500_000,
            exclude_patterns: vec!["Cargo.lock".to_string(), "package-lock.json".to_string()],
            warning_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScopeStats {
    pub total_files: u64,
    pub total_lines: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeReport {
    pub valid: bool,
    pub stats: ScopeStats,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// A changed path is allowed if it exactly matches an allowed path, falls under
/// a trailing-slash directory entry, or (for a directory entry itself, reported
/// by git with a trailing slash) is a prefix of some allowed path.
fn path_allowed(changed: &str, allowed_paths: &[String]) -> bool {
    let changed_norm = normalize(changed);
    let is_directory_entry = changed.ends_with('/');

    for allowed in allowed_paths {
        let allowed_norm = normalize(allowed);
        if allowed.ends_with('/') {
            if changed_norm == allowed_norm || changed_norm.starts_with(&format!("{}/", allowed_norm)) {
                return true;
            }
        } else if changed_norm == allowed_norm {
            return true;
        }

        if is_directory_entry && allowed_norm.starts_with(&changed_norm) {
            return true;
        }
    }
    false
}

fn changed_paths(before: &[GitFileChange], after: &[GitFileChange]) -> Vec<String> {
    let before_paths: std::collections::HashSet<&str> = before.iter().map(|c| c.path.as_str()).collect();
    after
        .iter()
        .filter(|c| !before_paths.contains(c.path.as_str()))
        .map(|c| c.path.clone())
        .collect()
}

fn validate_allowed_paths(before: &[GitFileChange], after: &[GitFileChange], allowed_paths: &[String]) -> Vec<String> {
    changed_paths(before, after)
        .into_iter()
        .filter(|p| !path_allowed(p, allowed_paths))
        .map(|p| format!("path '{}' is outside the allowed scope", p))
        .collect()
}

fn excluded(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pat| path.ends_with(pat.as_str()))
}

fn check_story_limits(diff: &DiffStats, limits: &StoryLimits) -> (ScopeStats, Vec<String>, Vec<String>) {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    let counted: Vec<&(String, u64, u64)> = diff
        .per_file
        .iter()
        .filter(|(path, _, _)| !excluded(path, &limits.exclude_patterns))
        .collect();

    let total_files = counted.len() as u64;
    let total_lines: u64 = counted.iter().map(|(_, lines, _)| lines).sum();
    let total_bytes: u64 = counted.iter().map(|(_, _, bytes)| bytes).sum();

    let check = |label: &str, value: u64, max: u64, violations: &mut Vec<String>, warnings: &mut Vec<String>| {
        if max == 0 {
            return;
        }
        if value > max {
            violations.push(format!("{} changed ({}) exceeds limit ({})", label, value, max));
        } else if (value as f64) >= (max as f64) * limits.warning_threshold {
            warnings.push(format!("{} changed ({}) is approaching the limit ({})", label, value, max));
        }
    };

    check("files", total_files, limits.max_files, &mut violations, &mut warnings);
    check("lines", total_lines, limits.max_lines, &mut violations, &mut warnings);
    check("bytes", total_bytes, limits.max_bytes, &mut violations, &mut warnings);

    (
        ScopeStats { total_files, total_lines, total_bytes },
        violations,
        warnings,
    )
}

/// Evaluate a phase's scope policy against the observed before/after `git status`
/// snapshots, and (for `Scoped`) the diff stats against the pre-implementation ref.
pub fn enforce(
    policy: &ScopePolicy,
    before: &[GitFileChange],
    after: &[GitFileChange],
    diff: Option<&DiffStats>,
) -> ScopeReport {
    match policy {
        ScopePolicy::Unrestricted => ScopeReport { valid: true, ..Default::default() },
        ScopePolicy::ReadOnly { allowed_paths } | ScopePolicy::DesignOnly { allowed_paths } => {
            let violations = validate_allowed_paths(before, after, allowed_paths);
            ScopeReport { valid: violations.is_empty(), violations, ..Default::default() }
        }
        ScopePolicy::Scoped { story_limits, allowed_paths } => {
            let mut violations = validate_allowed_paths(before, after, allowed_paths);
            let mut warnings = Vec::new();
            let mut stats = ScopeStats::default();
            if let Some(diff) = diff {
                let (s, mut v, mut w) = check_story_limits(diff, story_limits);
                stats = s;
                violations.append(&mut v);
                warnings.append(&mut w);
            }
            ScopeReport { valid: violations.is_empty(), stats, violations, warnings }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str) -> GitFileChange {
        GitFileChange { status_code: "M".to_string(), path: path.to_string() }
    }

    #[test]
    fn read_only_allows_declared_output_only() {
        let policy = ScopePolicy::ReadOnly { allowed_paths: vec![".wreckit/items/001-foo/research.md".to_string()] };
        let before = vec![];
        let after = vec![change(".wreckit/items/001-foo/research.md")];
        let report = enforce(&policy, &before, &after, None);
        assert!(report.valid);
    }

    #[test]
    fn read_only_flags_unexpected_path() {
        let policy = ScopePolicy::ReadOnly { allowed_paths: vec![".wreckit/items/001-foo/research.md".to_string()] };
        let before = vec![];
        let after = vec![change("src/main.rs")];
        let report = enforce(&policy, &before, &after, None);
        assert!(!report.valid);
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn directory_prefix_allows_nested_files() {
        let policy =
            ScopePolicy::Scoped { story_limits: StoryLimits::default(), allowed_paths: vec![".wreckit/items/001-foo/".to_string()] };
        let before = vec![];
        let after = vec![change(".wreckit/items/001-foo/prd.json")];
        let report = enforce(&policy, &before, &after, None);
        assert!(report.valid);
    }

    #[test]
    fn story_limit_violation_when_lines_exceed_max() {
        let limits = StoryLimits { max_files: 10, max_lines: 10, max_bytes: 100_000, exclude_patterns: vec![], warning_threshold: 0.8 };
        let policy = ScopePolicy::Scoped { story_limits: limits, allowed_paths: vec!["src/".to_string()] };
        let diff = DiffStats { total_files: 1, total_lines: 20, total_bytes: 500, per_file: vec![("src/lib.rs".to_string(), 20, 500)] };
        let before = vec![];
        let after = vec![change("src/lib.rs")];
        let report = enforce(&policy, &before, &after, Some(&diff));
        assert!(!report.valid);
        assert!(report.violations.iter().any(|v| v.contains("lines")));
    }

    #[test]
    fn excluded_lockfile_does_not_count_toward_limits() {
        let limits = StoryLimits { max_files: 10, max_lines: 5, max_bytes: 100_000, exclude_patterns: vec!["Cargo.lock".to_string()], warning_threshold: 0.8 };
        let policy = ScopePolicy::Scoped { story_limits: limits, allowed_paths: vec!["Cargo.lock".to_string()] };
        let diff = DiffStats { total_files: 1, total_lines: 500, total_bytes: 9000, per_file: vec![("Cargo.lock".to_string(), 500, 9000)] };
        let before = vec![];
        let after = vec![change("Cargo.lock")];
        let report = enforce(&policy, &before, &after, Some(&diff));
        assert!(report.valid);
        assert_eq!(report.stats.total_lines, 0);
    }

    #[test]
    fn warning_emitted_near_threshold_without_violation() {
        let limits = StoryLimits { max_files: 10, max_lines: 100, max_bytes: 100_000, exclude_patterns: vec![], warning_threshold: 0.8 };
        let policy = ScopePolicy::Scoped { story_limits: limits, allowed_paths: vec!["src/".to_string()] };
        let diff = DiffStats { total_files: 1, total_lines: 85, total_bytes: 500, per_file: vec![("src/lib.rs".to_string(), 85, 500)] };
        let before = vec![];
        let after = vec![change("src/lib.rs")];
        let report = enforce(&policy, &before, &after, Some(&diff));
        assert!(report.valid);
        assert!(!report.warnings.is_empty());
    }
}
