//! Issue Model
//!
//! The normalized ticket record that is the unit of analysis. Issues are
//! created by producers (chat ticket source, support-desk importer, tracker
//! webhook, direct API upload) and are immutable afterwards except for the
//! soft-delete flag and late-arriving metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an issue came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Chat,
    SupportDesk,
    Tracker,
    Api,
    Local,
}

impl std::fmt::Display for IssueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::SupportDesk => write!(f, "support_desk"),
            Self::Tracker => write!(f, "tracker"),
            Self::Api => write!(f, "api"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl IssueSource {
    /// Parse from a database string.
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "chat" => Self::Chat,
            "support_desk" => Self::SupportDesk,
            "tracker" => Self::Tracker,
            "local" => Self::Local,
            _ => Self::Api,
        }
    }
}

/// Ticket priority band. High-priority issues are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "H")]
    High,
    #[serde(rename = "L")]
    #[default]
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "H",
            Self::Low => "L",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "H" | "h" | "high" => Self::High,
            _ => Self::Low,
        }
    }
}

/// One log bundle attached to an issue. The payload is either already present
/// in the task workspace (direct upload) or fetched through the artifact
/// resolver using the opaque token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogArtifact {
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub size: u64,
}

/// The ticket record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub record_id: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub device_serial: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub category: String,
    pub source: IssueSource,
    /// Link back to the originating system (ticket URL, tracker issue, …)
    #[serde(default)]
    pub external_link: String,
    /// Optional callback URL notified when analysis completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub log_artifacts: Vec<LogArtifact>,
    #[serde(default)]
    pub soft_deleted: bool,
}

impl Issue {
    /// Build a minimal issue for a given source. Timestamps are stamped now.
    pub fn new(record_id: impl Into<String>, description: impl Into<String>, source: IssueSource) -> Self {
        Self {
            record_id: record_id.into(),
            description: description.into(),
            priority: Priority::Low,
            device_serial: String::new(),
            firmware: String::new(),
            app_version: String::new(),
            platform: String::new(),
            category: String::new(),
            source,
            external_link: String::new(),
            webhook_url: None,
            created_by: String::new(),
            created_at: Utc::now(),
            log_artifacts: Vec::new(),
            soft_deleted: false,
        }
    }
}

/// Filters for issue listings. All fields are conjunctive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueFilter {
    pub created_by: Option<String>,
    pub platform: Option<String>,
    pub category: Option<String>,
    /// Filter by the state of the issue's most recent task
    pub state: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

impl IssueFilter {
    pub fn offset(&self) -> u32 {
        (self.page.max(1) - 1) * self.page_size.clamp(1, 100)
    }

    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, 100)
    }
}
