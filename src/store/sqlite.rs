//! SQLite-backed [`ProjectStore`] over a bundled database file.
//!
//! Calls are synchronous rusqlite under a `parking_lot` mutex; nothing holds
//! the lock across an await point. Timestamps are stored as RFC3339 text.

use super::{AgentLink, ObjectCategory, Project, ProjectStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::RngExt;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

/// Attempts for the seed-then-bump metric write before giving up.
const METRIC_RETRY_ATTEMPTS: usize = 3;

const PRAGMA_SQL: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA busy_timeout=5000;
PRAGMA foreign_keys=ON;
";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_links (
    token        TEXT PRIMARY KEY,
    project_id   INTEGER NOT NULL,
    online       INTEGER NOT NULL DEFAULT 0,
    session_id   TEXT,
    connected_at TEXT,
    created_at   TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS model_endpoints (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id     INTEGER NOT NULL,
    name           TEXT NOT NULL,
    available      INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT,
    UNIQUE (project_id, name),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prompt_templates (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id     INTEGER NOT NULL,
    name           TEXT NOT NULL,
    available      INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT,
    UNIQUE (project_id, name),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sync_changelog (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id   INTEGER NOT NULL,
    category     TEXT NOT NULL,
    affected_ids TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_sync_changelog_project
    ON sync_changelog(project_id, category);

CREATE TABLE IF NOT EXISTS sync_metrics (
    project_id     INTEGER NOT NULL,
    category       TEXT NOT NULL,
    sync_count     INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT,
    PRIMARY KEY (project_id, category),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);
";

fn category_table(category: ObjectCategory) -> &'static str {
    match category {
        ObjectCategory::Models => "model_endpoints",
        ObjectCategory::Prompts => "prompt_templates",
    }
}

/// Opaque agent token: `aw_` plus 32 alphanumeric characters.
fn generate_token() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("aw_{suffix}")
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in store DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

/// Production store over one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, creating parent directories as
    /// needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store DB: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests and benches.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(PRAGMA_SQL)
            .context("Failed to set store pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Seed-then-bump write for one `(project, category)` metric row. Another
/// writer on the same file can delete the row between the two statements,
/// so the pair retries a bounded number of times.
fn bump_sync_metric(
    conn: &Connection,
    project_id: i64,
    category: ObjectCategory,
    now: &str,
) -> Result<()> {
    for attempt in 1..=METRIC_RETRY_ATTEMPTS {
        conn.execute(
            "INSERT INTO sync_metrics (project_id, category, sync_count, last_synced_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT (project_id, category) DO NOTHING",
            params![project_id, category.as_str(), now],
        )
        .context("Failed to seed sync metric row")?;

        let updated = conn
            .execute(
                "UPDATE sync_metrics SET sync_count = sync_count + 1, last_synced_at = ?3
                 WHERE project_id = ?1 AND category = ?2",
                params![project_id, category.as_str(), now],
            )
            .context("Failed to bump sync metric")?;

        if updated > 0 {
            return Ok(());
        }
        tracing::debug!(
            "sync metric row for project {project_id}/{category} vanished before update (attempt {attempt})"
        );
    }
    anyhow::bail!(
        "Gave up bumping sync metric for project {project_id}/{category} after {METRIC_RETRY_ATTEMPTS} attempts"
    )
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn set_online(&self, token: &str) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE agent_links SET online = 1, session_id = ?2, connected_at = ?3
                 WHERE token = ?1",
                params![token, session_id, now],
            )
            .context("Failed to mark agent online")?;
        if updated == 0 {
            anyhow::bail!("Unknown agent token `{token}`");
        }
        Ok(())
    }

    async fn disconnect_and_cascade(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let project_id: Option<i64> = tx
            .query_row(
                "SELECT project_id FROM agent_links WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to resolve agent link")?;
        let Some(project_id) = project_id else {
            anyhow::bail!("Unknown agent token `{token}`");
        };

        tx.execute(
            "UPDATE agent_links SET online = 0, session_id = NULL, connected_at = NULL
             WHERE token = ?1",
            params![token],
        )
        .context("Failed to mark agent offline")?;

        for category in ObjectCategory::ALL {
            tx.execute(
                &format!(
                    "UPDATE {} SET available = 0 WHERE project_id = ?1",
                    category_table(category)
                ),
                params![project_id],
            )
            .with_context(|| format!("Failed to cascade offline onto {category}"))?;
        }

        tx.commit().context("Failed to commit disconnect")?;
        Ok(())
    }

    async fn lookup_owning_project(&self, token: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT p.id, p.name, p.created_at
             FROM projects p
             JOIN agent_links a ON a.project_id = p.id
             WHERE a.token = ?1",
            params![token],
            |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_rfc3339(&row.get::<_, String>(2)?)
                        .map_err(sql_conversion_error)?,
                })
            },
        )
        .optional()
        .context("Failed to look up owning project")
    }

    async fn token_exists(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM agent_links WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check agent token")?;
        Ok(found.is_some())
    }

    async fn list_object_names(
        &self,
        project_id: i64,
        category: ObjectCategory,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT name FROM {} WHERE project_id = ?1 ORDER BY name ASC",
            category_table(category)
        ))?;
        let rows = stmt.query_map(params![project_id], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("Failed to read object name")?);
        }
        Ok(names)
    }

    async fn create_objects(
        &self,
        project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut ids = Vec::with_capacity(names.len());
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (project_id, name, available, last_synced_at)
                 VALUES (?1, ?2, 1, ?3)",
                category_table(category)
            ))?;
            for name in names {
                stmt.execute(params![project_id, name, now])
                    .with_context(|| format!("Failed to insert {category} object `{name}`"))?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit().context("Failed to commit object inserts")?;
        Ok(ids)
    }

    async fn update_objects(
        &self,
        project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut ids = Vec::with_capacity(names.len());
        {
            let table = category_table(category);
            let mut touch = tx.prepare(&format!(
                "UPDATE {table} SET available = 1, last_synced_at = ?3
                 WHERE project_id = ?1 AND name = ?2"
            ))?;
            let mut select = tx.prepare(&format!(
                "SELECT id FROM {table} WHERE project_id = ?1 AND name = ?2"
            ))?;
            for name in names {
                let touched = touch
                    .execute(params![project_id, name, now])
                    .with_context(|| format!("Failed to touch {category} object `{name}`"))?;
                if touched == 0 {
                    // Raced with a delete; nothing to report for this name.
                    continue;
                }
                let id: i64 = select
                    .query_row(params![project_id, name], |row| row.get(0))
                    .with_context(|| format!("Failed to read id of {category} object `{name}`"))?;
                ids.push(id);
            }
        }

        tx.commit().context("Failed to commit object updates")?;
        Ok(ids)
    }

    async fn append_changelog(
        &self,
        project_id: i64,
        category: ObjectCategory,
        affected_ids: &[i64],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let affected_json =
            serde_json::to_string(affected_ids).context("Failed to encode affected ids")?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_changelog (project_id, category, affected_ids, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_id, category.as_str(), affected_json, now],
        )
        .context("Failed to append sync changelog")?;

        bump_sync_metric(&conn, project_id, category, &now)
    }

    async fn create_project(&self, name: &str) -> Result<Project> {
        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO projects (name, created_at) VALUES (?1, ?2)",
            params![name, now.to_rfc3339()],
        )
        .with_context(|| format!("Failed to create project `{name}`"))?;

        Ok(Project {
            id: conn.last_insert_rowid(),
            name: name.to_owned(),
            created_at: now,
        })
    }

    async fn issue_token(&self, project: &str) -> Result<String> {
        let token = generate_token();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO projects (name, created_at) VALUES (?1, ?2)
             ON CONFLICT (name) DO NOTHING",
            params![project, now],
        )
        .context("Failed to ensure project row")?;
        let project_id: i64 = tx
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![project],
                |row| row.get(0),
            )
            .context("Failed to resolve project id")?;

        tx.execute(
            "INSERT INTO agent_links (token, project_id, online, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![token, project_id, now],
        )
        .context("Failed to insert agent link")?;

        tx.commit().context("Failed to commit token issue")?;
        Ok(token)
    }

    async fn list_agents(&self) -> Result<Vec<AgentLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.token, p.name, a.online, a.connected_at
             FROM agent_links a
             JOIN projects p ON p.id = a.project_id
             ORDER BY a.created_at ASC, a.token ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let connected_raw: Option<String> = row.get(3)?;
            Ok(AgentLink {
                token: row.get(0)?,
                project: row.get(1)?,
                online: row.get::<_, i64>(2)? != 0,
                connected_at: match connected_raw {
                    Some(raw) => Some(parse_rfc3339(&raw).map_err(sql_conversion_error)?),
                    None => None,
                },
            })
        })?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent link")?);
        }
        Ok(agents)
    }
}
