use std::collections::{HashMap, HashSet};

use crate::item::Item;

#[derive(Debug, Clone, Copy, PartialEq)]
enum VisitState {
    Unvisited,
    InStack,
    Done,
}

/// Validate that `depends_on` forms a DAG across `items`: no dangling references
/// (a dependency id that names no scanned item) and no cycles. Returns every
/// error found rather than stopping at the first.
pub fn validate_dependency_graph(items: &[Item]) -> Vec<String> {
    let mut errors = Vec::new();
    let ids: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();

    for item in items {
        for dep in &item.depends_on {
            if !ids.contains(dep.as_str()) {
                errors.push(format!("{} depends on unknown item '{}'", item.id, dep));
            }
        }
    }

    for cycle in detect_cycles(items) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

fn detect_cycles(items: &[Item]) -> Vec<Vec<String>> {
    let ids: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
    let mut state: HashMap<&str, VisitState> =
        items.iter().map(|i| (i.id.as_str(), VisitState::Unvisited)).collect();
    let mut cycles = Vec::new();

    fn dfs<'a>(
        id: &'a str,
        items: &'a [Item],
        ids: &HashSet<&str>,
        state: &mut HashMap<&'a str, VisitState>,
        path: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        state.insert(id, VisitState::InStack);
        path.push(id);

        let item = items.iter().find(|i| i.id == id).expect("dfs called with unknown id");
        for dep in &item.depends_on {
            if !ids.contains(dep.as_str()) {
                continue;
            }
            match state.get(dep.as_str()) {
                Some(VisitState::InStack) => {
                    let start = path.iter().position(|&p| p == dep.as_str()).expect("back-edge target on path");
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
                Some(VisitState::Unvisited) => dfs(dep, items, ids, state, path, cycles),
                _ => {}
            }
        }

        path.pop();
        state.insert(id, VisitState::Done);
    }

    for item in items {
        if state.get(item.id.as_str()) == Some(&VisitState::Unvisited) {
            dfs(&item.id, items, &ids, &mut state, &mut Vec::new(), &mut cycles);
        }
    }

    cycles
}

/// Whether every dependency of `item` is present in `done_ids` — the orchestrator
/// refuses to start an item unless this holds.
pub fn dependencies_satisfied(item: &Item, done_ids: &HashSet<String>) -> bool {
    item.depends_on.iter().all(|d| done_ids.contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ItemState;

    fn item(id: &str, deps: &[&str]) -> Item {
        let mut i = Item::new(id, id);
        i.depends_on = deps.iter().map(|s| s.to_string()).collect();
        i
    }

    #[test]
    fn no_errors_on_acyclic_graph() {
        let items = vec![item("001-a", &[]), item("002-b", &["001-a"])];
        assert!(validate_dependency_graph(&items).is_empty());
    }

    #[test]
    fn detects_dangling_reference() {
        let items = vec![item("001-a", &["999-ghost"])];
        let errors = validate_dependency_graph(&items);
        assert!(errors.iter().any(|e| e.contains("unknown item")));
    }

    #[test]
    fn detects_simple_cycle() {
        let items = vec![item("001-a", &["002-b"]), item("002-b", &["001-a"])];
        let errors = validate_dependency_graph(&items);
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn dependencies_satisfied_checks_done_set() {
        let mut done = std::collections::HashSet::new();
        let item = item("002-b", &["001-a"]);
        assert!(!dependencies_satisfied(&item, &done));
        done.insert("001-a".to_string());
        assert!(dependencies_satisfied(&item, &done));
        let _ = ItemState::Done;
    }
}
