//! Wire and data types shared across the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a browser session. RUNNING is the only
/// non-terminal state; exactly one terminal transition happens per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMED_OUT")]
    TimedOut,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            "TIMED_OUT" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// One live browser instance owned by one tenant, with a deadline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub status: SessionStatus,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub timeout: u64,
    pub connect_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip)]
    pub container_id: String,
    #[serde(skip)]
    pub user_data_dir: String,
}

/// A persistent browser profile captured as a tar.gz archive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Path of the stored archive; empty until the first save.
    #[serde(skip)]
    pub data_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub context_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContextRequest {
    #[serde(default)]
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateRequest {
    #[serde(default)]
    pub url: String,
}
