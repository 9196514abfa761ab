use std::path::Path;

use serde::Deserialize;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WreckitConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub agent: AgentConfig,
    pub git: GitConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub prefix: String,
    pub items_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            prefix: "WRK".to_string(),
            items_dir: ".wreckit/items".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub phase_timeout_seconds: u64,
    pub max_retries: u32,
    pub parallel: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phase_timeout_seconds: 3600,
            max_retries: 3,
            parallel: 1,
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    /// Whether this CLI has a flag to express a per-invocation tool allowlist.
    /// Both configured tools do today; kept as a method (not a constant `true`)
    /// so a future backend without one fails fast instead of silently widening.
    pub fn supports_tool_restriction(&self) -> bool {
        match self {
            CliTool::Claude => true,
            CliTool::OpenCode => true,
        }
    }

    /// Build the argv (excluding the binary itself) for one agent invocation.
    ///
    /// `allowed_tools = None` means unrestricted; an empty slice means "no tools".
    pub fn build_args(
        &self,
        prompt: &str,
        model: Option<&str>,
        allowed_tools: Option<&[String]>,
    ) -> Vec<String> {
        match self {
            CliTool::Claude => {
                let mut args = vec!["--dangerously-skip-permissions".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                if let Some(tools) = allowed_tools {
                    args.push("--allowedTools".to_string());
                    args.push(tools.join(","));
                }
                args.push("-p".to_string());
                args.push(prompt.to_string());
                args
            }
            CliTool::OpenCode => {
                let mut args = vec!["run".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                if let Some(tools) = allowed_tools {
                    args.push("--allow-tools".to_string());
                    args.push(tools.join(","));
                }
                args.push("--quiet".to_string());
                args.push(prompt.to_string());
                args
            }
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub cli: CliTool,
    pub model: Option<String>,
    pub completion_sentinel: String,
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli: CliTool::default(),
            model: None,
            completion_sentinel: "<promise>COMPLETE</promise>".to_string(),
            dry_run: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    /// Prefix-match allow-list for normalized remote URLs. Empty = allow any.
    pub allowed_remote_patterns: Vec<String>,
    /// Shell commands run in order as quality gates before a PR is opened.
    pub quality_gate_commands: Vec<String>,
    pub secret_scan_enabled: bool,
    pub direct_merge_on_complete: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: "wreckit/".to_string(),
            allowed_remote_patterns: Vec::new(),
            quality_gate_commands: Vec::new(),
            secret_scan_enabled: true,
            direct_merge_on_complete: false,
        }
    }
}

/// Collect every configuration error rather than failing on the first.
pub fn validate(config: &WreckitConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.parallel < 1 {
        errors.push("execution.parallel must be >= 1".to_string());
    }

    if let Some(ref model) = config.agent.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "agent.model must not start with '-' (flag-like values are rejected)".to_string(),
            );
        }
    }

    if config.agent.completion_sentinel.trim().is_empty() {
        errors.push("agent.completion_sentinel must not be empty".to_string());
    }

    if config.git.direct_merge_on_complete && config.execution.parallel > 1 {
        errors.push(
            "git.direct_merge_on_complete is incompatible with execution.parallel > 1".to_string(),
        );
    }

    if !config
        .project
        .prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push(
            "project.prefix must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn normalize_agent_config(config: &mut WreckitConfig) {
    if let Some(ref model) = config.agent.model {
        let trimmed = model.trim();
        config.agent.model = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
}

/// Load `wreckit.toml` from an explicit path, or `{project_root}/wreckit.toml` if `config_path`
/// is `None`. A missing file (in the implicit case) falls back to documented defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<WreckitConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

fn load_config_at(path: &Path) -> Result<WreckitConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }
    parse_and_validate(
        &std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?,
        path,
    )
}

pub fn load_config(project_root: &Path) -> Result<WreckitConfig, String> {
    let config_path = project_root.join("wreckit.toml");
    if !config_path.exists() {
        let config = WreckitConfig::default();
        validate(&config).map_err(|errors| format_errors(&errors))?;
        return Ok(config);
    }
    parse_and_validate(
        &std::fs::read_to_string(&config_path)
            .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?,
        &config_path,
    )
}

fn parse_and_validate(contents: &str, path: &Path) -> Result<WreckitConfig, String> {
    let mut config: WreckitConfig = toml::from_str(contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    normalize_agent_config(&mut config);
    validate(&config).map_err(|errors| format_errors(&errors))?;
    Ok(config)
}

fn format_errors(errors: &[String]) -> String {
    format!(
        "Config validation failed:\n{}",
        errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
