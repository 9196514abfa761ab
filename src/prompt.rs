use std::collections::HashMap;

use crate::item::Item;

/// Render a template string, substituting every `{{name}}` occurrence with the
/// matching value from `vars`. An unmatched placeholder is left verbatim —
/// callers decide whether that should be a quality-validator error downstream,
/// not a template-rendering one.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Common variables every phase template may reference, per §4.F step 1.
pub fn base_vars<'a>(item: &'a Item, completion_sentinel: &'a str) -> HashMap<&'a str, String> {
    let mut vars = HashMap::new();
    vars.insert("id", item.id.clone());
    vars.insert("title", item.title.clone());
    vars.insert("overview", item.overview.clone());
    vars.insert("completion_signal", completion_sentinel.to_string());
    vars
}

/// Append validation-failure feedback from a previous attempt, per §4.F step 2.
/// `errors` is the flat list surfaced by a quality validator or scope check.
pub fn with_retry_feedback(prompt: &str, attempt: u32, errors: &[String]) -> String {
    if errors.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{prompt}\n\n## Previous Attempt Failed (attempt {attempt})\n\n\
        The previous attempt did not pass verification:\n\n{errors}\n\n\
        Address these issues before signaling completion.",
        prompt = prompt,
        attempt = attempt,
        errors = errors.iter().map(|e| format!("- {}", e)).collect::<Vec<_>>().join("\n"),
    )
}

/// Build the phase prompt: render `template` against the base variables plus
/// any phase-specific extras (merge strategy, source context, allowed-paths
/// list), then fold in retry feedback if this is not the first attempt.
pub fn build_phase_prompt(
    template: &str,
    item: &Item,
    completion_sentinel: &str,
    extra_vars: &HashMap<&str, String>,
    attempt: u32,
    previous_errors: &[String],
) -> String {
    let mut vars = base_vars(item, completion_sentinel);
    vars.extend(extra_vars.clone());
    let rendered = render(template, &vars);
    with_retry_feedback(&rendered, attempt, previous_errors)
}
