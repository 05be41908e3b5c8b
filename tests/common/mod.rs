//! Shared fixtures: an in-memory agent transport and recording fakes for
//! the store and the unsolicited-task handler.

#![allow(dead_code)]

use agentwire::broker::{
    AgentConnection, Broker, Envelope, FrameSink, FrameStream, UnsolicitedHandler,
};
use agentwire::store::{AgentLink, ObjectCategory, Project, ProjectStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

// ── In-memory transport ──────────────────────────────────────────

pub struct ChannelSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, frame: String) -> Result<()> {
        self.0
            .send(frame)
            .map_err(|_| anyhow::anyhow!("agent side closed"))
    }
}

pub struct ChannelStream(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl FrameStream for ChannelStream {
    async fn recv_text(&mut self) -> Result<Option<String>> {
        Ok(self.0.recv().await)
    }
}

/// The agent's side of one fake transport.
pub struct FakeAgent {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
}

/// Build one in-memory transport: the sink/stream pair the broker consumes,
/// plus the agent-side handle driving it.
pub fn fake_transport() -> (Box<dyn FrameSink>, Box<dyn FrameStream>, FakeAgent) {
    let (to_agent_tx, to_agent_rx) = mpsc::unbounded_channel();
    let (from_agent_tx, from_agent_rx) = mpsc::unbounded_channel();
    (
        Box::new(ChannelSink(to_agent_tx)),
        Box::new(ChannelStream(from_agent_rx)),
        FakeAgent {
            outbound: to_agent_rx,
            inbound: from_agent_tx,
        },
    )
}

impl FakeAgent {
    /// Next frame the broker dispatched, decoded. Panics after two quiet
    /// seconds.
    pub async fn next_envelope(&mut self) -> Envelope {
        let frame = timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("timed out waiting for a dispatched frame")
            .expect("broker closed the transport");
        Envelope::decode(&frame).expect("broker wrote an undecodable frame")
    }

    /// Frame already dispatched, if any.
    pub fn try_next_frame(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) {
        self.send_frame(&envelope.encode().expect("envelope encodes"));
    }

    pub fn send_frame(&self, frame: &str) {
        self.inbound
            .send(frame.to_owned())
            .expect("reader loop gone");
    }

    /// Drop the agent side, which the broker observes as a clean close.
    pub fn close(self) {}
}

// ── Recording fakes ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingState {
    project: Option<Project>,
    objects: HashMap<ObjectCategory, Vec<String>>,
    online: HashSet<String>,
    disconnects: Vec<String>,
    created: Vec<(ObjectCategory, Vec<String>)>,
    updated: Vec<(ObjectCategory, Vec<String>)>,
    changelog: Vec<(ObjectCategory, Vec<i64>)>,
}

/// `ProjectStore` fake that records every mutation for assertions.
#[derive(Default)]
pub struct RecordingStore {
    state: Mutex<RecordingState>,
    next_id: AtomicI64,
}

impl RecordingStore {
    pub fn with_project(&self, name: &str) {
        self.state.lock().project = Some(Project {
            id: 1,
            name: name.to_owned(),
            created_at: Utc::now(),
        });
    }

    pub fn seed_objects(&self, category: ObjectCategory, names: &[&str]) {
        self.state
            .lock()
            .objects
            .entry(category)
            .or_default()
            .extend(names.iter().map(|s| (*s).to_owned()));
    }

    pub fn is_online(&self, token: &str) -> bool {
        self.state.lock().online.contains(token)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects.len()
    }

    pub fn created(&self) -> Vec<(ObjectCategory, Vec<String>)> {
        self.state.lock().created.clone()
    }

    pub fn updated(&self) -> Vec<(ObjectCategory, Vec<String>)> {
        self.state.lock().updated.clone()
    }

    pub fn changelog(&self) -> Vec<(ObjectCategory, Vec<i64>)> {
        self.state.lock().changelog.clone()
    }

    fn fresh_ids(&self, count: usize) -> Vec<i64> {
        (0..count)
            .map(|_| self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
            .collect()
    }
}

#[async_trait]
impl ProjectStore for RecordingStore {
    async fn set_online(&self, token: &str) -> Result<()> {
        self.state.lock().online.insert(token.to_owned());
        Ok(())
    }

    async fn disconnect_and_cascade(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.online.remove(token);
        state.disconnects.push(token.to_owned());
        Ok(())
    }

    async fn lookup_owning_project(&self, _token: &str) -> Result<Option<Project>> {
        Ok(self.state.lock().project.clone())
    }

    async fn token_exists(&self, _token: &str) -> Result<bool> {
        Ok(true)
    }

    async fn list_object_names(
        &self,
        _project_id: i64,
        category: ObjectCategory,
    ) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .objects
            .get(&category)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_objects(
        &self,
        _project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>> {
        let mut state = self.state.lock();
        state
            .objects
            .entry(category)
            .or_default()
            .extend(names.iter().cloned());
        state.created.push((category, names.to_vec()));
        drop(state);
        Ok(self.fresh_ids(names.len()))
    }

    async fn update_objects(
        &self,
        _project_id: i64,
        category: ObjectCategory,
        names: &[String],
    ) -> Result<Vec<i64>> {
        self.state.lock().updated.push((category, names.to_vec()));
        Ok(self.fresh_ids(names.len()))
    }

    async fn append_changelog(
        &self,
        _project_id: i64,
        category: ObjectCategory,
        affected_ids: &[i64],
    ) -> Result<()> {
        self.state
            .lock()
            .changelog
            .push((category, affected_ids.to_vec()));
        Ok(())
    }

    async fn create_project(&self, name: &str) -> Result<Project> {
        Ok(Project {
            id: 1,
            name: name.to_owned(),
            created_at: Utc::now(),
        })
    }

    async fn issue_token(&self, _project: &str) -> Result<String> {
        Ok(format!(
            "aw_fake{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ))
    }

    async fn list_agents(&self) -> Result<Vec<AgentLink>> {
        Ok(Vec::new())
    }
}

/// `UnsolicitedHandler` fake that records what reached it.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl UnsolicitedHandler for RecordingHandler {
    async fn handle(
        &self,
        _token: &str,
        envelope: Envelope,
        _connection: &AgentConnection,
    ) -> Result<()> {
        self.seen.lock().push(envelope);
        Ok(())
    }
}

/// Broker over recording fakes.
pub fn test_broker() -> (Broker, Arc<RecordingStore>, Arc<RecordingHandler>) {
    let store = Arc::new(RecordingStore::default());
    let handler = Arc::new(RecordingHandler::default());
    let broker = Broker::new(store.clone(), handler.clone());
    (broker, store, handler)
}

/// Poll `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Shorthand for building envelope payloads in tests.
pub fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}
