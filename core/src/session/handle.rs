//! A live, in-memory conversation session.
//!
//! Wraps one `ConversationContext` with its bound model connector, its private
//! event stream and the persisted metadata record. Every operation that touches
//! the conversation also refreshes `lastActivity` in the session store.
//!
//! Once closed (ended, expired or evicted by the manager) a session never writes
//! to storage again; operations on a stale handle fail with `NotFound`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::connector::{ModelConfig, ModelConnector, SessionSnapshot};
use super::events::{self, BroadcastEventSink, EventSink, ScopedEventSink, SessionEvent};
use super::metadata::SessionMetadata;
use crate::context::{
    CompactionReport, ContentPart, ContextUsage, ConversationContext, Message, TokenCount,
    Tokenizer, ToolCall,
};
use crate::storage::SessionStore;
use crate::telemetry::SessionMetrics;
use crate::{ParleyError, Result};

pub struct Session {
    id: String,
    metadata: RwLock<SessionMetadata>,
    context: Mutex<ConversationContext>,
    connector: RwLock<Arc<dyn ModelConnector>>,
    store: Arc<SessionStore>,
    events: BroadcastEventSink,
    mirror: Option<ScopedEventSink>,
    metrics: Option<SessionMetrics>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Clears the run flag when a run finishes, however it finishes
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Session {
    pub fn new(
        metadata: SessionMetadata,
        context: ConversationContext,
        connector: Arc<dyn ModelConnector>,
        store: Arc<SessionStore>,
        global_events: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let id = metadata.id.clone();
        let mirror = global_events.map(|sink| ScopedEventSink::new(id.clone(), sink));

        Self {
            id,
            metadata: RwLock::new(metadata),
            context: Mutex::new(context),
            connector: RwLock::new(connector),
            store,
            events: BroadcastEventSink::default(),
            mirror,
            metrics: None,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: SessionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe to this session's private event stream
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn metadata(&self) -> SessionMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn model(&self) -> ModelConfig {
        self.connector.read().await.model().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refresh `lastActivity` without touching the conversation
    pub async fn touch(&self) -> Result<()> {
        self.persist(|m| m.touch()).await
    }

    /// Mutate and persist the metadata record. The id cannot be changed.
    pub async fn update_metadata(
        &self,
        update: impl FnOnce(&mut SessionMetadata),
    ) -> Result<SessionMetadata> {
        let mut metadata = self.metadata.write().await;
        self.ensure_open()?;
        update(&mut metadata);
        metadata.id = self.id.clone();
        self.store.save(&metadata).await?;
        Ok(metadata.clone())
    }

    pub async fn add_user_message(&self, text: impl Into<String>) -> Result<()> {
        self.append(Message::user(text)).await
    }

    pub async fn add_user_parts(&self, parts: Vec<ContentPart>) -> Result<()> {
        self.append(Message::user_parts(parts)).await
    }

    pub async fn add_assistant_message(
        &self,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Result<()> {
        self.ensure_open()?;
        {
            let mut context = self.context.lock().await;
            context.add_assistant_message(content, tool_calls)?;
        }
        self.record_append("assistant").await
    }

    pub async fn add_tool_result(
        &self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.append(Message::tool(tool_call_id, tool_name, content))
            .await
    }

    /// Validate and append any message
    pub async fn append(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        let role = message.role;
        {
            let mut context = self.context.lock().await;
            context.append(message)?;
        }
        self.record_append(role.as_str()).await
    }

    pub async fn set_system_prompt(&self, prompt: Option<String>) -> Result<()> {
        self.ensure_open()?;
        self.context.lock().await.set_system_prompt(prompt);
        self.touch().await
    }

    /// Clear the conversation; the system prompt and bound model are kept
    pub async fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.context.lock().await.reset();
        self.persist(|m| {
            m.message_count = 0;
            m.touch();
        })
        .await?;
        self.emit(events::HISTORY_RESET, json!({}));
        Ok(())
    }

    /// Raw message log, unbounded
    pub async fn history(&self) -> Vec<Message> {
        self.context.lock().await.history().to_vec()
    }

    /// Budget-respecting view with the system prompt first
    pub async fn formatted_history(&self) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let (view, report) = {
            let mut context = self.context.lock().await;
            let report = context.compact();
            (context.formatted(), report)
        };

        if let Some(report) = report {
            self.on_compacted(&report);
        }
        self.touch().await?;
        Ok(view)
    }

    pub async fn count_tokens(&self) -> TokenCount {
        self.context.lock().await.count_total_tokens()
    }

    pub async fn usage(&self) -> ContextUsage {
        self.context.lock().await.usage()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            model: self.model().await,
            usage: self.usage().await,
        }
    }

    /// Run one turn: record the user text, ask the bound model, record the reply.
    ///
    /// Only one run may be in flight per session; a second concurrent call fails
    /// with `SessionBusy` instead of queueing.
    pub async fn run(&self, text: impl Into<String>) -> Result<String> {
        self.ensure_open()?;
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ParleyError::SessionBusy(self.id.clone()));
        }
        let _guard = RunGuard(&self.running);

        self.emit(events::RUN_STARTED, json!({}));
        match self.run_turn(text.into()).await {
            Ok((model, reply)) => {
                self.emit(
                    events::RUN_COMPLETED,
                    json!({ "model": model, "chars": reply.len() }),
                );
                Ok(reply)
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Model run failed");
                self.emit(events::RUN_FAILED, json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    async fn run_turn(&self, text: String) -> Result<(String, String)> {
        self.add_user_message(text).await?;

        let view = self.formatted_history().await?;
        let connector = self.connector.read().await.clone();
        let reply = connector.complete(&view).await?;

        let text = reply.content.clone().unwrap_or_default();
        self.add_assistant_message(reply.content, reply.tool_calls)
            .await?;
        Ok((connector.model().model.clone(), text))
    }

    /// Swap the bound connector (and tokenizer) after the caller validated it.
    pub async fn bind_connector(
        &self,
        connector: Arc<dyn ModelConnector>,
        tokenizer: Option<Arc<dyn Tokenizer>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let model = connector.model().clone();
        let previous = {
            let mut bound = self.connector.write().await;
            std::mem::replace(&mut *bound, connector)
        };
        self.context.lock().await.set_tokenizer(tokenizer);

        if let Err(e) = previous.close().await {
            warn!(session_id = %self.id, error = %e, "Failed to close previous connector");
        }

        info!(session_id = %self.id, provider = %model.provider, model = %model.model, "Switched model");
        self.emit(
            events::MODEL_SWITCHED,
            json!({ "provider": model.provider, "model": model.model }),
        );
        self.touch().await
    }

    /// Stop persisting and release the bound connector.
    ///
    /// Waits for any in-progress metadata write, so nothing reaches storage after
    /// this returns. The conversation stays in memory until dropped.
    pub async fn close(&self) {
        {
            let _metadata = self.metadata.write().await;
            self.closed.store(true, Ordering::Release);
        }
        let connector = self.connector.read().await.clone();
        if let Err(e) = connector.close().await {
            warn!(session_id = %self.id, error = %e, "Failed to close connector");
        }
        debug!(session_id = %self.id, "Session closed");
    }

    async fn record_append(&self, role: &str) -> Result<()> {
        let count = {
            let mut metadata = self.metadata.write().await;
            self.ensure_open()?;
            metadata.message_count += 1;
            metadata.touch();
            let count = metadata.message_count;
            self.store.save(&metadata).await?;
            count
        };
        self.emit(
            events::MESSAGE_ADDED,
            json!({ "role": role, "messageCount": count }),
        );
        Ok(())
    }

    fn on_compacted(&self, report: &CompactionReport) {
        if let Some(metrics) = &self.metrics {
            metrics.compactions.add(1, &[]);
        }
        self.emit(
            events::HISTORY_COMPACTED,
            json!({
                "removed": report.removed,
                "strategies": report.applied,
                "withinBudget": report.within_budget,
            }),
        );
    }

    async fn persist(&self, update: impl FnOnce(&mut SessionMetadata)) -> Result<()> {
        let mut metadata = self.metadata.write().await;
        self.ensure_open()?;
        update(&mut metadata);
        self.store.save(&metadata).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ParleyError::NotFound(self.id.clone()));
        }
        Ok(())
    }

    fn emit(&self, name: &str, payload: serde_json::Value) {
        let event = SessionEvent::new(self.id.clone(), name, payload);
        if let Some(mirror) = &self.mirror {
            mirror.emit(event.clone());
        }
        self.events.emit(event);
    }
}
