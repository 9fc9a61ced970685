//! Rule Engine
//!
//! Selects the diagnostic playbooks applicable to a ticket description.
//! Matching is case-insensitive substring search over each rule's keywords;
//! ties break on priority (higher wins) then rule id. The selected set is
//! expanded with transitive dependencies and emitted in dependency order so
//! the agent reads context before the primary playbook.

use std::collections::HashSet;
use std::sync::Arc;

use crate::models::rule::Rule;
use crate::services::rules::catalog::CatalogSnapshot;
use crate::utils::error::{AppError, AppResult};

/// The outcome of a rule selection.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Id of the primary rule (highest-priority match, or the fallback)
    pub primary_id: String,
    /// Rules in prompt order: dependencies strictly before dependents, the
    /// primary last within its own chain
    pub rules: Vec<Rule>,
}

impl Selection {
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.meta.id.clone()).collect()
    }
}

/// Select rules for a description against one catalog snapshot.
///
/// Deterministic for a fixed snapshot + description. Never returns an empty
/// list while the catalog has a fallback rule; a catalog without one is a
/// configuration error surfaced to the caller.
pub fn select_rules(snapshot: &Arc<CatalogSnapshot>, description: &str) -> AppResult<Selection> {
    let needle = description.to_lowercase();

    let mut matched: Vec<&Rule> = snapshot
        .list()
        .into_iter()
        .filter(|r| r.meta.enabled && !r.is_fallback())
        .filter(|r| {
            r.meta
                .triggers
                .keywords
                .iter()
                .any(|kw| !kw.is_empty() && needle.contains(&kw.to_lowercase()))
        })
        .collect();

    // Higher priority first; id breaks ties for stability
    matched.sort_by(|a, b| {
        b.meta
            .triggers
            .priority
            .cmp(&a.meta.triggers.priority)
            .then_with(|| a.meta.id.cmp(&b.meta.id))
    });

    if matched.is_empty() {
        let fallback = snapshot.fallback().ok_or_else(|| {
            AppError::validation("rule catalog has no fallback rule (empty keywords)")
        })?;
        return Ok(Selection {
            primary_id: fallback.meta.id.clone(),
            rules: vec![fallback.clone()],
        });
    }

    let primary_id = matched[0].meta.id.clone();

    // Dependency-ordered expansion: depth-first over each matched rule's
    // depends_on closure. Missing or disabled dependencies are skipped with
    // a warning; a cycle is broken at the offending edge. Both are non-fatal
    // here since the catalog validated at load.
    let mut ordered: Vec<Rule> = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();
    let mut on_path: HashSet<String> = HashSet::new();

    for rule in &matched {
        visit(snapshot, rule, &mut ordered, &mut emitted, &mut on_path);
    }

    Ok(Selection {
        primary_id,
        rules: ordered,
    })
}

fn visit(
    snapshot: &Arc<CatalogSnapshot>,
    rule: &Rule,
    ordered: &mut Vec<Rule>,
    emitted: &mut HashSet<String>,
    on_path: &mut HashSet<String>,
) {
    if emitted.contains(&rule.meta.id) {
        return;
    }
    on_path.insert(rule.meta.id.clone());

    for dep_id in &rule.meta.depends_on {
        if on_path.contains(dep_id) {
            tracing::warn!(
                rule = %rule.meta.id,
                dependency = %dep_id,
                "dependency cycle at selection time; dropping the edge"
            );
            continue;
        }
        match snapshot.get(dep_id) {
            Some(dep) if dep.meta.enabled => {
                visit(snapshot, dep, ordered, emitted, on_path);
            }
            Some(_) => {} // disabled dependencies are silently filtered
            None => {
                tracing::warn!(
                    rule = %rule.meta.id,
                    dependency = %dep_id,
                    "unknown dependency skipped"
                );
            }
        }
    }

    on_path.remove(&rule.meta.id);
    if emitted.insert(rule.meta.id.clone()) {
        ordered.push(rule.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rule::{RuleMeta, RuleTrigger};

    fn rule(id: &str, keywords: Vec<&str>, priority: i64, deps: Vec<&str>) -> Rule {
        Rule {
            meta: RuleMeta {
                id: id.into(),
                name: id.into(),
                version: 1,
                enabled: true,
                triggers: RuleTrigger {
                    keywords: keywords.iter().map(|s| s.to_string()).collect(),
                    priority,
                },
                depends_on: deps.iter().map(|s| s.to_string()).collect(),
                pre_extract: vec![],
                needs_code: false,
            },
            body: String::new(),
        }
    }

    fn snapshot(rules: Vec<Rule>) -> Arc<CatalogSnapshot> {
        Arc::new(CatalogSnapshot::build(rules).unwrap())
    }

    fn scenario_catalog() -> Arc<CatalogSnapshot> {
        snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("recording-missing", vec!["录音丢失"], 10, vec!["timestamp-drift"]),
            rule("timestamp-drift", vec!["time drift"], 8, vec![]),
            rule("bluetooth", vec!["蓝牙"], 8, vec![]),
        ])
    }

    #[test]
    fn test_keyword_miss_returns_fallback() {
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("bluetooth", vec!["蓝牙"], 8, vec![]),
            rule("recording", vec!["recording"], 8, vec![]),
        ]);
        let selection = select_rules(&catalog, "random gibberish about user login").unwrap();
        assert_eq!(selection.primary_id, "general");
        assert_eq!(selection.rule_ids(), vec!["general"]);
    }

    #[test]
    fn test_priority_and_dependency_order() {
        let catalog = scenario_catalog();
        let selection = select_rules(&catalog, "录音丢失 and time drift").unwrap();
        assert_eq!(selection.primary_id, "recording-missing");
        assert_eq!(
            selection.rule_ids(),
            vec!["timestamp-drift", "recording-missing"]
        );
    }

    #[test]
    fn test_match_is_case_insensitive_substring() {
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("bluetooth", vec!["Bluetooth"], 8, vec![]),
        ]);
        let selection = select_rules(&catalog, "BLUETOOTH pairing keeps failing").unwrap();
        assert_eq!(selection.primary_id, "bluetooth");
    }

    #[test]
    fn test_tie_breaks_on_id() {
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("zeta", vec!["crash"], 8, vec![]),
            rule("alpha", vec!["crash"], 8, vec![]),
        ]);
        let selection = select_rules(&catalog, "app crash on start").unwrap();
        assert_eq!(selection.primary_id, "alpha");
        assert_eq!(selection.rule_ids(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_disabled_rules_filtered() {
        let mut disabled = rule("bluetooth", vec!["蓝牙"], 8, vec![]);
        disabled.meta.enabled = false;
        let catalog = snapshot(vec![rule("general", vec![], 0, vec![]), disabled]);
        let selection = select_rules(&catalog, "蓝牙连不上").unwrap();
        assert_eq!(selection.primary_id, "general");
    }

    #[test]
    fn test_disabled_dependency_skipped() {
        let mut dep = rule("dep", vec![], 1, vec![]);
        dep.meta.enabled = false;
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("main", vec!["crash"], 8, vec!["dep"]),
            dep,
        ]);
        let selection = select_rules(&catalog, "crash").unwrap();
        assert_eq!(selection.rule_ids(), vec!["main"]);
    }

    #[test]
    fn test_missing_dependency_skipped() {
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("main", vec!["crash"], 8, vec!["ghost"]),
        ]);
        let selection = select_rules(&catalog, "crash").unwrap();
        assert_eq!(selection.rule_ids(), vec!["main"]);
    }

    #[test]
    fn test_transitive_closure_no_duplicates() {
        let catalog = snapshot(vec![
            rule("general", vec![], 0, vec![]),
            rule("a", vec!["alpha"], 10, vec!["b", "c"]),
            rule("b", vec!["beta"], 8, vec!["c"]),
            rule("c", vec![], 1, vec![]),
        ]);
        // "c" never matches by keyword but is pulled in as a dependency
        let selection = select_rules(&catalog, "alpha and beta").unwrap();
        let ids = selection.rule_ids();
        assert_eq!(ids, vec!["c", "b", "a"]);

        // Every dependency precedes its dependent
        let pos = |id: &str| ids.iter().position(|x| x == id).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let catalog = scenario_catalog();
        let first = select_rules(&catalog, "录音丢失 time drift 蓝牙").unwrap();
        for _ in 0..10 {
            let again = select_rules(&catalog, "录音丢失 time drift 蓝牙").unwrap();
            assert_eq!(again.rule_ids(), first.rule_ids());
            assert_eq!(again.primary_id, first.primary_id);
        }
    }

    #[test]
    fn test_no_fallback_is_an_error() {
        let catalog = snapshot(vec![rule("bluetooth", vec!["蓝牙"], 8, vec![])]);
        let result = select_rules(&catalog, "nothing matches this");
        assert!(result.is_err());
    }

    #[test]
    fn test_never_empty_with_fallback_present() {
        let catalog = scenario_catalog();
        for desc in ["", "x", "完全无关的描述", "bluetooth"] {
            let selection = select_rules(&catalog, desc).unwrap();
            assert!(!selection.rules.is_empty());
        }
    }
}
