//! Rule Catalog
//!
//! Loads diagnostic playbooks from a directory tree, validates the set as a
//! whole (unique ids, acyclic dependencies, compilable regex patterns), and
//! publishes it as an immutable snapshot behind an atomically swapped `Arc`.
//! Readers take one snapshot for the duration of a selection and never
//! observe a half-replaced catalog.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::models::rule::{Rule, RuleCreateRequest, RuleMeta, RuleUpdateRequest};
use crate::services::rules::parser::{parse_rule_file, render_rule_file};
use crate::utils::error::{AppError, AppResult};

/// An immutable, validated set of rules.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    rules: BTreeMap<String, Rule>,
}

impl CatalogSnapshot {
    /// Build and validate a snapshot from a list of parsed rules.
    pub fn build(rules: Vec<Rule>) -> AppResult<Self> {
        let mut map = BTreeMap::new();
        for rule in rules {
            let id = rule.meta.id.clone();
            if map.insert(id.clone(), rule).is_some() {
                return Err(AppError::validation(format!("duplicate rule id '{}'", id)));
            }
        }

        let snapshot = Self { rules: map };
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> AppResult<()> {
        for rule in self.rules.values() {
            if rule.meta.triggers.priority < 0 {
                return Err(AppError::validation(format!(
                    "rule '{}' has a negative priority",
                    rule.meta.id
                )));
            }
            for pat in &rule.meta.pre_extract {
                regex::Regex::new(&pat.pattern).map_err(|e| {
                    AppError::validation(format!(
                        "rule '{}' pattern '{}' does not compile: {}",
                        rule.meta.id, pat.name, e
                    ))
                })?;
            }
            for dep in &rule.meta.depends_on {
                if !self.rules.contains_key(dep) {
                    tracing::warn!(
                        rule = %rule.meta.id,
                        dependency = %dep,
                        "rule depends on an unknown rule; the dependency will be skipped"
                    );
                }
            }
        }
        self.check_acyclic()?;
        Ok(())
    }

    /// Depth-first cycle check over the dependency graph.
    fn check_acyclic(&self) -> AppResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<(&str, usize)> = Vec::new();

        for start in self.rules.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            stack.push((start.as_str(), 0));
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some((id, dep_idx)) = stack.pop() {
                let deps = self
                    .rules
                    .get(id)
                    .map(|r| r.meta.depends_on.as_slice())
                    .unwrap_or_default();

                if dep_idx < deps.len() {
                    stack.push((id, dep_idx + 1));
                    let dep = deps[dep_idx].as_str();
                    match marks.get(dep) {
                        Some(Mark::Visiting) => {
                            return Err(AppError::validation(format!(
                                "dependency cycle involving '{}' and '{}'",
                                id, dep
                            )));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if self.rules.contains_key(dep) {
                                marks.insert(dep, Mark::Visiting);
                                stack.push((dep, 0));
                            }
                        }
                    }
                } else {
                    marks.insert(id, Mark::Done);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    pub fn list(&self) -> Vec<&Rule> {
        self.rules.values().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The fallback rule: empty keywords, lowest priority among fallbacks.
    pub fn fallback(&self) -> Option<&Rule> {
        self.rules
            .values()
            .filter(|r| r.meta.enabled && r.is_fallback())
            .min_by_key(|r| (r.meta.triggers.priority, r.meta.id.clone()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }
}

/// The live catalog: a swappable snapshot plus the backing directory.
pub struct RuleCatalog {
    rules_dir: PathBuf,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl RuleCatalog {
    /// Load all `.md` rule files under `rules_dir`. A missing directory is
    /// created empty; individual unparsable files fail the load so a broken
    /// edit cannot silently drop a playbook.
    pub fn load(rules_dir: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&rules_dir)?;
        let snapshot = Self::build_from_dir(&rules_dir)?;
        tracing::info!(
            count = snapshot.len(),
            dir = %rules_dir.display(),
            "rule catalog loaded"
        );
        Ok(Self {
            rules_dir,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    fn build_from_dir(dir: &Path) -> AppResult<CatalogSnapshot> {
        let mut rules = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    let content = std::fs::read_to_string(&path)?;
                    let rule = parse_rule_file(&path, &content)?;
                    rules.push(rule);
                }
            }
        }
        CatalogSnapshot::build(rules)
    }

    /// Current snapshot. Hold it for the duration of one selection.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().expect("catalog lock poisoned").clone()
    }

    /// Rebuild from disk and swap in atomically. Callers observe either the
    /// old catalog or the new one in full.
    pub fn reload(&self) -> AppResult<usize> {
        let snapshot = Self::build_from_dir(&self.rules_dir)?;
        let count = snapshot.len();
        *self.current.write().expect("catalog lock poisoned") = Arc::new(snapshot);
        tracing::info!(count, "rule catalog reloaded");
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.snapshot().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Rule> {
        self.snapshot().list().into_iter().cloned().collect()
    }

    /// Create a new rule: validate against the current set, persist the file,
    /// swap the snapshot.
    pub fn create(&self, req: RuleCreateRequest) -> AppResult<Rule> {
        let snapshot = self.snapshot();
        if snapshot.get(&req.id).is_some() {
            return Err(AppError::conflict(format!("rule '{}' already exists", req.id)));
        }

        let rule = Rule {
            meta: RuleMeta {
                id: req.id,
                name: req.name,
                version: 1,
                enabled: true,
                triggers: req.triggers,
                depends_on: req.depends_on,
                pre_extract: req.pre_extract,
                needs_code: req.needs_code,
            },
            body: req.body,
        };

        self.apply_change(|rules| {
            rules.push(rule.clone());
            Ok(())
        })?;
        Ok(rule)
    }

    /// Partial update. Metadata and body can change independently; every
    /// update bumps the rule version.
    pub fn update(&self, id: &str, req: RuleUpdateRequest) -> AppResult<Rule> {
        let mut rule = self
            .get(id)
            .ok_or_else(|| AppError::not_found(format!("rule '{}'", id)))?;

        if let Some(name) = req.name {
            rule.meta.name = name;
        }
        if let Some(triggers) = req.triggers {
            rule.meta.triggers = triggers;
        }
        if let Some(deps) = req.depends_on {
            rule.meta.depends_on = deps;
        }
        if let Some(pre) = req.pre_extract {
            rule.meta.pre_extract = pre;
        }
        if let Some(needs_code) = req.needs_code {
            rule.meta.needs_code = needs_code;
        }
        if let Some(enabled) = req.enabled {
            rule.meta.enabled = enabled;
        }
        if let Some(body) = req.body {
            rule.body = body;
        }
        rule.meta.version += 1;

        let updated = rule.clone();
        self.apply_change(move |rules| {
            rules.retain(|r| r.meta.id != rule.meta.id);
            rules.push(rule.clone());
            Ok(())
        })?;
        Ok(updated)
    }

    /// Delete a rule and its backing file.
    pub fn delete(&self, id: &str) -> AppResult<()> {
        if self.get(id).is_none() {
            return Err(AppError::not_found(format!("rule '{}'", id)));
        }
        let id = id.to_string();
        self.apply_change(move |rules| {
            rules.retain(|r| r.meta.id != id);
            Ok(())
        })?;
        Ok(())
    }

    /// Apply a mutation to the rule set: validate the candidate snapshot
    /// first, then persist files and swap. Failed validation leaves both the
    /// catalog and the directory untouched.
    fn apply_change(
        &self,
        mutate: impl FnOnce(&mut Vec<Rule>) -> AppResult<()>,
    ) -> AppResult<()> {
        let mut guard = self.current.write().expect("catalog lock poisoned");
        let mut rules: Vec<Rule> = guard.list().into_iter().cloned().collect();
        let before: HashSet<String> = rules.iter().map(|r| r.meta.id.clone()).collect();

        mutate(&mut rules)?;
        let snapshot = CatalogSnapshot::build(rules)?;

        // Persist: write changed files, remove deleted ones
        for rule in snapshot.list() {
            let path = self.rule_path(&rule.meta.id);
            std::fs::write(&path, render_rule_file(rule))?;
        }
        for removed in before.iter().filter(|id| snapshot.get(id.as_str()).is_none()) {
            let path = self.rule_path(removed);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        *guard = Arc::new(snapshot);
        Ok(())
    }

    fn rule_path(&self, id: &str) -> PathBuf {
        self.rules_dir.join(format!("{}.md", id))
    }
}

impl std::fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCatalog")
            .field("rules_dir", &self.rules_dir)
            .field("count", &self.snapshot().len())
            .finish()
    }
}
