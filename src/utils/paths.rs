//! Path Utilities
//!
//! Resolves the service's data, workspace, and rules directories.
//! Defaults live under ~/.caseworker/ and can be overridden in the config.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the caseworker data directory (~/.caseworker/)
pub fn data_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".caseworker"))
}

/// Get the config file path (~/.caseworker/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

/// Get the database file path (~/.caseworker/data.db)
pub fn database_path() -> AppResult<PathBuf> {
    Ok(data_dir()?.join("data.db"))
}

/// Get the default workspace root (~/.caseworker/workspaces/)
pub fn workspaces_dir() -> AppResult<PathBuf> {
    Ok(data_dir()?.join("workspaces"))
}

/// Get the default rules directory (~/.caseworker/rules/)
pub fn rules_dir() -> AppResult<PathBuf> {
    Ok(data_dir()?.join("rules"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Sanitize an uploaded file name: strip path separators, keep a conservative
/// character set (plus CJK), cap the length. Falls back to a generated name.
pub fn safe_filename(name: &str) -> String {
    let normalized = name.trim().replace(['\\', '/'], "_");
    let cleaned: String = normalized
        .chars()
        .map(|c| {
            let keep = c.is_ascii_alphanumeric()
                || matches!(c, '.' | '_' | '-')
                || ('\u{4e00}'..='\u{9fff}').contains(&c);
            if keep {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return format!("upload_{}.bin", &uuid::Uuid::new_v4().simple().to_string()[..6]);
    }
    cleaned.chars().take(180).collect()
}
