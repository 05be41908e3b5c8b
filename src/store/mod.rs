//! Persistence boundary consumed by the broker, the sync handler, and the
//! gateway's admin surface.

pub mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A project row: the owning context for agent tokens and synced objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One issued agent token with its persisted presence.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLink {
    pub token: String,
    pub project: String,
    pub online: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Object categories agents keep in sync with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectCategory {
    Models,
    Prompts,
}

impl ObjectCategory {
    pub const ALL: [ObjectCategory; 2] = [ObjectCategory::Models, ObjectCategory::Prompts];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectCategory::Models => "models",
            ObjectCategory::Prompts => "prompts",
        }
    }
}

impl fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store operations the server needs. Presence and object-sync calls serve
/// the broker and the sync handler; the admin calls serve the CLI and the
/// gateway's listing route. Shared as `Arc<dyn ProjectStore>`.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Mark `token` online and stamp a fresh session credential.
    async fn set_online(&self, token: &str) -> Result<()>;

    /// One transactional disconnect: clear the session credential, flip the
    /// online flag, and cascade unavailability onto the project's synced
    /// objects.
    async fn disconnect_and_cascade(&self, token: &str) -> Result<()>;

    /// The project an agent token belongs to.
    async fn lookup_owning_project(&self, token: &str) -> Result<Option<Project>>;

    /// Whether `token` was ever issued. Checked at the WebSocket accept
    /// boundary.
    async fn token_exists(&self, token: &str) -> Result<bool>;

    /// Names currently recorded for one category of a project.
    async fn list_object_names(
        &self,
        project_id: i64,
        category: ObjectCategory,
    ) -> Result<Vec<String>>;

    /// Bulk-insert new objects, returning their row ids.
    async fn create_objects(
        &self,
        project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>>;

    /// Bulk-touch existing objects by name (marks them available again and
    /// refreshes the sync timestamp), returning the affected row ids.
    async fn update_objects(
        &self,
        project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>>;

    /// Append one changelog entry for a category's sync and bump the
    /// per-(project, category) sync metric.
    async fn append_changelog(
        &self,
        project_id: i64,
        category: ObjectCategory,
        affected_ids: &[i64],
    ) -> Result<()>;

    /// Create a project row. Names are unique.
    async fn create_project(&self, name: &str) -> Result<Project>;

    /// Issue a fresh agent token for `project`, creating the project row on
    /// first use.
    async fn issue_token(&self, project: &str) -> Result<String>;

    /// Every issued token with its persisted presence.
    async fn list_agents(&self) -> Result<Vec<AgentLink>>;
}
