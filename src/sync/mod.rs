//! Bulk object synchronization, the production unsolicited-task handler.
//!
//! Agents push a `SYNC_CODE` envelope carrying the object names they serve,
//! one array per category. The handler diffs each report against the store,
//! bulk-inserts the new names, touches the known ones, appends a changelog
//! entry per affected category, and acks with `SYNC_COMPLETE` over the same
//! connection, echoing the inbound correlation id so agents can send the
//! sync as a request of their own.

use crate::broker::{AgentConnection, Envelope, UnsolicitedHandler, STATUS_COMPLETED};
use crate::store::{ObjectCategory, ProjectStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Envelope kind an agent sends to start a bulk sync.
pub const SYNC_REQUEST: &str = "SYNC_CODE";
/// Envelope kind of the ack sent back when the sync is persisted.
pub const SYNC_REPLY: &str = "SYNC_COMPLETE";

pub struct SyncHandler {
    store: Arc<dyn ProjectStore>,
}

impl SyncHandler {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    async fn sync_objects(
        &self,
        token: &str,
        envelope: Envelope,
        connection: &AgentConnection,
    ) -> Result<()> {
        let project = self
            .store
            .lookup_owning_project(token)
            .await?
            .with_context(|| format!("agent token `{token}` has no owning project"))?;

        let mut counts = Map::new();
        for category in ObjectCategory::ALL {
            let reported = reported_names(&envelope, category);
            if reported.is_empty() {
                counts.insert(
                    category.as_str().to_owned(),
                    json!({"created": 0, "updated": 0}),
                );
                continue;
            }

            let existing = self.store.list_object_names(project.id, category).await?;
            let (to_create, to_update) = partition_names(&reported, &existing);

            let mut affected = Vec::with_capacity(to_create.len() + to_update.len());
            if !to_create.is_empty() {
                affected.extend(
                    self.store
                        .create_objects(project.id, category, &to_create)
                        .await?,
                );
            }
            if !to_update.is_empty() {
                affected.extend(
                    self.store
                        .update_objects(project.id, category, &to_update)
                        .await?,
                );
            }
            // A category whose report changed nothing leaves no changelog
            // entry.
            if !affected.is_empty() {
                self.store
                    .append_changelog(project.id, category, &affected)
                    .await?;
            }

            info!(
                "synced {category} for project {}: {} created, {} updated",
                project.name,
                to_create.len(),
                to_update.len()
            );
            counts.insert(
                category.as_str().to_owned(),
                json!({"created": to_create.len(), "updated": to_update.len()}),
            );
        }

        let mut payload = counts;
        payload.insert("status".to_owned(), json!(STATUS_COMPLETED));
        let reply = match envelope.correlation_id {
            Some(correlation_id) => Envelope::correlated(SYNC_REPLY, correlation_id, payload),
            None => Envelope::new(SYNC_REPLY, payload),
        };
        connection.send(&reply).await?;
        Ok(())
    }
}

#[async_trait]
impl UnsolicitedHandler for SyncHandler {
    async fn handle(
        &self,
        token: &str,
        envelope: Envelope,
        connection: &AgentConnection,
    ) -> Result<()> {
        match envelope.kind.as_str() {
            SYNC_REQUEST => self.sync_objects(token, envelope, connection).await,
            other => {
                debug!("dropping unrecognized agent-initiated `{other}` envelope from {token}");
                Ok(())
            }
        }
    }
}

/// Names the agent reported for one category. Non-string entries are
/// skipped; a missing or non-array field reads as an empty report.
fn reported_names(envelope: &Envelope, category: ObjectCategory) -> Vec<String> {
    envelope
        .payload
        .get(category.as_str())
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Split reported names into create/update partitions by set membership in
/// the store's current names. Repeats within one report are deduped.
fn partition_names(reported: &[String], existing: &[String]) -> (Vec<String>, Vec<String>) {
    let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut to_create = Vec::new();
    let mut to_update = Vec::new();

    for name in reported {
        if !seen.insert(name.as_str()) {
            continue;
        }
        if known.contains(name.as_str()) {
            to_update.push(name.clone());
        } else {
            to_create.push(name.clone());
        }
    }

    (to_create, to_update)
}
