//! Rule File Parser
//!
//! Parses diagnostic playbook files: a metadata header delimited by `---`
//! lines followed by a Markdown body handed to the agent. The header uses a
//! small YAML subset (scalars, string lists, one level of nesting, lists of
//! maps) so rule files stay hand-editable without a full YAML dependency.

use std::collections::HashMap;
use std::path::Path;

use crate::models::rule::{PreExtractPattern, Rule, RuleMeta, RuleTrigger};
use crate::utils::error::{AppError, AppResult};

/// Parse a rule file. The rule id falls back to the file stem when the
/// header omits it.
pub fn parse_rule_file(path: &Path, content: &str) -> AppResult<Rule> {
    let (header, body) = extract_header(content).ok_or_else(|| {
        AppError::parse(format!(
            "Rule file {} has no metadata header (--- delimited)",
            path.display()
        ))
    })?;

    let fields = parse_fields(&header);

    let id = fields
        .get("id")
        .map(Value::as_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string()
        });
    if id.is_empty() {
        return Err(AppError::parse(format!(
            "Rule file {} has no id and no usable file name",
            path.display()
        )));
    }

    let triggers = match fields.get("triggers") {
        Some(Value::Map(map)) => RuleTrigger {
            keywords: map
                .get("keywords")
                .map(Value::as_string_list)
                .unwrap_or_default(),
            priority: map
                .get("priority")
                .and_then(|v| v.as_string().parse().ok())
                .unwrap_or(5),
        },
        _ => RuleTrigger::default(),
    };

    let pre_extract = match fields.get("pre_extract") {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Map(map) => {
                    let name = map.get("name").map(Value::as_string).unwrap_or_default();
                    let pattern = map.get("pattern").map(Value::as_string).unwrap_or_default();
                    if name.is_empty() || pattern.is_empty() {
                        return None;
                    }
                    Some(PreExtractPattern {
                        name,
                        pattern,
                        date_filter: map.get("date_filter").map(Value::as_bool).unwrap_or(false),
                    })
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let meta = RuleMeta {
        id,
        name: fields.get("name").map(Value::as_string).unwrap_or_default(),
        version: fields
            .get("version")
            .and_then(|v| v.as_string().parse().ok())
            .unwrap_or(1),
        enabled: fields.get("enabled").map(Value::as_bool).unwrap_or(true),
        triggers,
        depends_on: fields
            .get("depends_on")
            .map(Value::as_string_list)
            .unwrap_or_default(),
        pre_extract,
        needs_code: fields.get("needs_code").map(Value::as_bool).unwrap_or(false),
    };

    Ok(Rule { meta, body })
}

/// Render a rule back into its file form, for catalog CRUD persistence.
pub fn render_rule_file(rule: &Rule) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("id: {}\n", rule.meta.id));
    if !rule.meta.name.is_empty() {
        out.push_str(&format!("name: {}\n", rule.meta.name));
    }
    out.push_str(&format!("version: {}\n", rule.meta.version));
    out.push_str(&format!("enabled: {}\n", rule.meta.enabled));
    out.push_str("triggers:\n");
    if rule.meta.triggers.keywords.is_empty() {
        out.push_str("  keywords: []\n");
    } else {
        out.push_str("  keywords:\n");
        for kw in &rule.meta.triggers.keywords {
            out.push_str(&format!("    - {}\n", kw));
        }
    }
    out.push_str(&format!("  priority: {}\n", rule.meta.triggers.priority));
    if !rule.meta.depends_on.is_empty() {
        out.push_str("depends_on:\n");
        for dep in &rule.meta.depends_on {
            out.push_str(&format!("  - {}\n", dep));
        }
    }
    if !rule.meta.pre_extract.is_empty() {
        out.push_str("pre_extract:\n");
        for pat in &rule.meta.pre_extract {
            out.push_str(&format!("  - name: {}\n", pat.name));
            out.push_str(&format!("    pattern: \"{}\"\n", pat.pattern.replace('"', "\\\"")));
            if pat.date_filter {
                out.push_str("    date_filter: true\n");
            }
        }
    }
    if rule.meta.needs_code {
        out.push_str("needs_code: true\n");
    }
    out.push_str("---\n\n");
    out.push_str(&rule.body);
    if !rule.body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Extract the `---` delimited header. Returns (header, body) or None when
/// the file does not start with a delimiter.
fn extract_header(content: &str) -> Option<(String, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }

    let mut lines = trimmed.lines();
    lines.next(); // opening ---

    let mut header_lines = Vec::new();
    let mut body_lines = Vec::new();
    let mut in_header = true;
    for line in lines {
        if in_header {
            let t = line.trim();
            if t.len() >= 3 && t.chars().all(|c| c == '-') {
                in_header = false;
                continue;
            }
            header_lines.push(line);
        } else {
            body_lines.push(line);
        }
    }

    if in_header {
        return None; // unterminated header
    }

    let body = body_lines.join("\n").trim_start_matches('\n').to_string();
    Some((header_lines.join("\n"), body))
}

// --- YAML subset ---

/// A parsed header value.
#[derive(Debug, Clone)]
enum Value {
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    fn as_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::as_string)
                .collect::<Vec<_>>()
                .join(", "),
            Value::Map(_) => String::new(),
        }
    }

    fn as_string_list(&self) -> Vec<String> {
        match self {
            Value::List(items) => items.iter().map(Value::as_string).collect(),
            Value::String(s) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    fn as_bool(&self) -> bool {
        matches!(
            self.as_string().to_lowercase().as_str(),
            "true" | "yes" | "1"
        )
    }
}

/// Parse header text into a map of top-level field → value.
fn parse_fields(header: &str) -> HashMap<String, Value> {
    let lines: Vec<&str> = header.lines().collect();
    let (map, _) = parse_map(&lines, 0, 0);
    map
}

/// Parse a map at the given indent level, starting from `start`.
/// Returns the map and the index of the first unconsumed line.
fn parse_map(lines: &[&str], start: usize, indent: usize) -> (HashMap<String, Value>, usize) {
    let mut map = HashMap::new();
    let mut i = start;

    while i < lines.len() {
        let line = lines[i];
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') {
            i += 1;
            continue;
        }
        let line_indent = indent_level(line);
        if line_indent < indent || t.starts_with("- ") || t == "-" {
            break;
        }
        if line_indent > indent {
            // Stray deeper indentation; skip defensively handled by callers
            i += 1;
            continue;
        }

        let Some((key, rest)) = split_key_value(t) else {
            i += 1;
            continue;
        };

        if rest.is_empty() {
            // Nested list or map below
            let (value, next) = parse_nested(lines, i + 1, indent);
            map.insert(key, value);
            i = next;
        } else if rest.starts_with('[') && rest.ends_with(']') {
            map.insert(key, Value::List(parse_inline_list(rest)));
            i += 1;
        } else {
            map.insert(key, Value::String(unquote(rest)));
            i += 1;
        }
    }

    (map, i)
}

/// Parse the block nested under a key with no inline value.
fn parse_nested(lines: &[&str], start: usize, parent_indent: usize) -> (Value, usize) {
    // Find the first non-empty line to learn the child indent
    let mut j = start;
    while j < lines.len() && lines[j].trim().is_empty() {
        j += 1;
    }
    if j >= lines.len() || indent_level(lines[j]) <= parent_indent {
        return (Value::String(String::new()), start);
    }
    let child_indent = indent_level(lines[j]);

    if lines[j].trim().starts_with('-') {
        parse_list(lines, j, child_indent)
    } else {
        let (map, next) = parse_map(lines, j, child_indent);
        (Value::Map(map), next)
    }
}

/// Parse a `- item` list at a fixed indent. Items may be scalars or maps
/// (`- name: x` followed by further `key: value` lines at deeper indent).
fn parse_list(lines: &[&str], start: usize, indent: usize) -> (Value, usize) {
    let mut items = Vec::new();
    let mut i = start;

    while i < lines.len() {
        let line = lines[i];
        let t = line.trim();
        if t.is_empty() {
            i += 1;
            continue;
        }
        let line_indent = indent_level(line);
        if line_indent < indent || !t.starts_with('-') {
            break;
        }
        if line_indent > indent {
            i += 1;
            continue;
        }

        let rest = t[1..].trim();
        if let Some((key, val)) = split_key_value(rest) {
            // Map item: first field inline after the dash, remaining fields
            // at deeper indentation
            let mut item = HashMap::new();
            if val.is_empty() {
                item.insert(key, Value::String(String::new()));
            } else {
                item.insert(key, Value::String(unquote(val)));
            }
            let field_indent = line_indent + 2;
            let (tail, next) = parse_map(lines, i + 1, field_indent);
            item.extend(tail);
            items.push(Value::Map(item));
            i = next;
        } else {
            items.push(Value::String(unquote(rest)));
            i += 1;
        }
    }

    (Value::List(items), i)
}

fn split_key_value(line: &str) -> Option<(String, &str)> {
    let colon = line.find(':')?;
    let key = line[..colon].trim();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key.to_string(), line[colon + 1..].trim()))
}

fn indent_level(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_inline_list(text: &str) -> Vec<Value> {
    let inner = text.trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|s| unquote(s.trim()))
        .filter(|s| !s.is_empty())
        .map(Value::String)
        .collect()
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
