//! Session Manager - lifecycle, capacity and TTL for conversation sessions
//!
//! The durable store holds the census of sessions. The in-memory map only holds
//! sessions that are active in this process and may be a strict subset: idle
//! sessions are evicted from memory and rehydrated lazily on their next access.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::context::ConversationContext;
use crate::session::{ConnectorFactory, EventSink, ModelConfig, Session, SessionMetadata};
use crate::storage::SessionStore;
use crate::telemetry::SessionMetrics;
use crate::{ParleyError, Result};

/// Id of the session targeted by `switch_default_model`
pub const DEFAULT_SESSION_ID: &str = "default";

/// Where a known session currently lives
#[derive(Clone)]
pub enum SessionState {
    /// Metadata persists but no in-memory session exists
    DurableOnly(SessionMetadata),
    /// Resident in memory with its context and bound connector
    Active(Arc<Session>),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Durably recorded sessions
    pub total: usize,
    pub in_memory: usize,
    pub max_sessions: usize,
    pub ttl: Duration,
}

/// Outcome of switching the model on every known session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchReport {
    pub switched: Vec<String>,
    pub failed: Vec<String>,
    pub message: String,
}

pub struct SessionManager {
    config: SessionConfig,
    default_model: RwLock<ModelConfig>,
    sessions: DashMap<String, Arc<Session>>,
    store: Arc<SessionStore>,
    connectors: Arc<dyn ConnectorFactory>,
    events: Option<Arc<dyn EventSink>>,
    // Serializes the capacity check with the durable write
    creation: Mutex<()>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    metrics: SessionMetrics,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<SessionStore>,
        connectors: Arc<dyn ConnectorFactory>,
        events: Option<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            default_model: RwLock::new(config.default_model.clone()),
            config,
            sessions: DashMap::new(),
            store,
            connectors,
            events,
            creation: Mutex::new(()),
            sweeper: StdMutex::new(None),
            metrics: SessionMetrics::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Model bound to sessions created or rehydrated from now on
    pub async fn default_model(&self) -> ModelConfig {
        self.default_model.read().await.clone()
    }

    /// Startup recovery: delete durable records that already expired.
    ///
    /// Valid sessions stay durable-only until first accessed. Storage errors are
    /// logged per record and never abort the pass. Returns how many were removed.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> usize {
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate sessions during recovery");
                return 0;
            }
        };

        let ttl = self.config.session_ttl();
        let now = Utc::now();
        let mut removed = 0;

        for id in &ids {
            match self.store.load(id).await {
                Ok(Some(metadata)) if metadata.is_expired(ttl, now) => {
                    match self.store.delete(id).await {
                        Ok(()) => {
                            removed += 1;
                            self.metrics.expired.add(1, &[]);
                            debug!(session_id = %id, "Removed expired session during recovery");
                        }
                        Err(e) => warn!(session_id = %id, error = %e, "Failed to remove expired session"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Failed to read session during recovery"),
            }
        }

        info!(known = ids.len(), removed, "Session recovery complete");
        removed
    }

    /// Spawn the periodic sweep (every `min(TTL/4, 15 min)`).
    ///
    /// Also evicts idle sessions from memory when `idle_eviction_ms` is set. The
    /// task holds a weak reference and stops once the manager is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let idle = self.config.idle_eviction();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_expired().await;
                if let Some(idle) = idle {
                    manager.evict_idle(idle).await;
                }
            }
        });

        if let Some(previous) = self.replace_sweeper(Some(handle)) {
            previous.abort();
        }
        info!(period_ms = period.as_millis() as u64, "Session sweeper started");
    }

    /// Stop the sweeper and close every in-memory session.
    ///
    /// Durable metadata is kept so sessions can be rehydrated after a restart.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.replace_sweeper(None) {
            handle.abort();
        }

        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();

        for session in &sessions {
            session.close().await;
        }
        self.metrics.in_memory.add(-(sessions.len() as i64), &[]);
        info!(released = sessions.len(), "Session manager shut down");
    }

    /// Return the session for `id`, creating it when unknown.
    ///
    /// A fresh id is minted when none is given. An in-memory hit refreshes its
    /// activity; a durable-only record is rehydrated; otherwise a new session is
    /// created if capacity allows.
    #[tracing::instrument(skip(self))]
    pub async fn create_or_get(&self, id: Option<&str>) -> Result<Arc<Session>> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(session) = self.active(&id) {
            session.touch().await?;
            return Ok(session);
        }

        let _creating = self.creation.lock().await;

        if let Some(session) = self.get(&id).await? {
            session.touch().await?;
            return Ok(session);
        }

        // Dead sessions must not hold capacity
        self.sweep_expired().await;

        let count = self.store.count().await?;
        if count >= self.config.max_sessions {
            warn!(session_id = %id, count, max = self.config.max_sessions, "Session limit reached");
            return Err(ParleyError::Capacity {
                max: self.config.max_sessions,
            });
        }

        let metadata = SessionMetadata::new(id.clone());
        let session = self.build_session(metadata.clone()).await?;
        self.store.save(&metadata).await?;

        let session = self.register(session);
        self.metrics.created.add(1, &[]);
        info!(session_id = %id, "Created session");
        Ok(session)
    }

    /// Look up a session, rehydrating it from durable metadata if needed.
    ///
    /// `Ok(None)` when the id is unknown or its record has already expired.
    pub async fn get(&self, id: &str) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.active(id) {
            return Ok(Some(session));
        }

        let Some(metadata) = self.store.load(id).await? else {
            return Ok(None);
        };

        if metadata.is_expired(self.config.session_ttl(), Utc::now()) {
            debug!(session_id = %id, "Durable record expired before rehydration");
            self.end(id).await?;
            self.metrics.expired.add(1, &[]);
            return Ok(None);
        }

        let session = self.build_session(metadata).await?;
        let session = self.register(session);
        self.metrics.rehydrated.add(1, &[]);
        debug!(session_id = %id, "Rehydrated session");
        Ok(Some(session))
    }

    /// Close, evict and delete a session from both tiers.
    ///
    /// Returns whether the session was known in memory or durably.
    #[tracing::instrument(skip(self))]
    pub async fn end(&self, id: &str) -> Result<bool> {
        let in_memory = self.sessions.remove(id).map(|(_, session)| session);
        if let Some(session) = &in_memory {
            session.close().await;
            self.metrics.in_memory.add(-1, &[]);
        }

        let durable = self.store.exists(id).await?;
        self.store.delete(id).await?;

        let existed = in_memory.is_some() || durable;
        if existed {
            self.metrics.ended.add(1, &[]);
            info!(session_id = %id, "Ended session");
        }
        Ok(existed)
    }

    /// Authoritative census: every durably recorded session id
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list_ids().await
    }

    /// Ids of sessions resident in memory
    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn state(&self, id: &str) -> Result<Option<SessionState>> {
        if let Some(session) = self.active(id) {
            return Ok(Some(SessionState::Active(session)));
        }
        Ok(self.store.load(id).await?.map(SessionState::DurableOnly))
    }

    pub async fn metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        match self.state(id).await? {
            Some(SessionState::Active(session)) => Ok(Some(session.metadata().await)),
            Some(SessionState::DurableOnly(metadata)) => Ok(Some(metadata)),
            None => Ok(None),
        }
    }

    /// Mutate and persist a session's metadata without rehydrating it
    pub async fn update_metadata(
        &self,
        id: &str,
        update: impl FnOnce(&mut SessionMetadata),
    ) -> Result<SessionMetadata> {
        match self.state(id).await? {
            Some(SessionState::Active(session)) => session.update_metadata(update).await,
            Some(SessionState::DurableOnly(mut metadata)) => {
                update(&mut metadata);
                metadata.id = id.to_string();
                self.store.save(&metadata).await?;
                Ok(metadata)
            }
            None => Err(ParleyError::NotFound(id.to_string())),
        }
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        Ok(SessionStats {
            total: self.store.count().await?,
            in_memory: self.sessions.len(),
            max_sessions: self.config.max_sessions,
            ttl: self.config.session_ttl(),
        })
    }

    /// End every session idle for longer than the TTL.
    ///
    /// Each session is cleaned up independently; failures are logged and skipped.
    pub async fn sweep_expired(&self) -> usize {
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Sweep could not enumerate sessions");
                return 0;
            }
        };

        let ttl = self.config.session_ttl();
        let now = Utc::now();
        let mut expired = 0;

        for id in ids {
            let metadata = match self.store.load(&id).await {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Sweep could not read session");
                    continue;
                }
            };
            if !metadata.is_expired(ttl, now) {
                continue;
            }

            match self.end(&id).await {
                Ok(_) => {
                    expired += 1;
                    self.metrics.expired.add(1, &[]);
                    debug!(session_id = %id, "Expired session");
                }
                Err(e) => warn!(session_id = %id, error = %e, "Failed to expire session"),
            }
        }

        if expired > 0 {
            info!(expired, "Swept expired sessions");
        }
        expired
    }

    /// Drop sessions idle for longer than `idle` from memory.
    ///
    /// Their metadata is persisted first and stays durable, so the next access
    /// rehydrates them. Evicted handles are closed; callers obtain a fresh one
    /// through `get`. Sessions with a run in flight are skipped.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let candidates: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let now = Utc::now();
        let mut evicted = 0;

        for session in candidates {
            if session.is_running() {
                continue;
            }
            let metadata = session.metadata().await;
            if metadata.idle_for(now) <= idle {
                continue;
            }
            if let Err(e) = self.store.save(&metadata).await {
                warn!(session_id = %metadata.id, error = %e, "Keeping idle session in memory");
                continue;
            }

            let removed = self
                .sessions
                .remove_if(&metadata.id, |_, current| Arc::ptr_eq(current, &session))
                .is_some();
            if removed {
                session.close().await;
                evicted += 1;
                self.metrics.in_memory.add(-1, &[]);
                self.metrics.evicted.add(1, &[]);
                debug!(session_id = %metadata.id, "Evicted idle session");
            }
        }
        evicted
    }

    /// Validate `config` against one session and rebind its connector.
    #[tracing::instrument(skip(self, config), fields(model = %config.model))]
    pub async fn switch_model(&self, id: &str, config: ModelConfig) -> Result<()> {
        let session = self
            .get(id)
            .await?
            .ok_or_else(|| ParleyError::NotFound(id.to_string()))?;
        self.rebind(&session, &config).await
    }

    /// Switch every known session independently.
    ///
    /// Covers the durable census, rehydrating durable-only sessions so each one
    /// is validated against its own state. Not atomic: sessions that fail
    /// validation or cannot be loaded keep their current model and are reported
    /// in `failed`. Only a failure to enumerate sessions is returned as an error.
    #[tracing::instrument(skip(self, config), fields(model = %config.model))]
    pub async fn switch_model_all(&self, config: ModelConfig) -> Result<SwitchReport> {
        let ids = self.list().await?;
        let mut report = SwitchReport::default();

        for id in ids {
            let outcome = match self.get(&id).await {
                Ok(Some(session)) => self.rebind(&session, &config).await,
                // Expired while we were iterating
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => report.switched.push(id),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Model switch rejected");
                    report.failed.push(id);
                }
            }
        }

        report.message = format!(
            "Switched {} session(s) to {}/{}",
            report.switched.len(),
            config.provider,
            config.model
        );
        Ok(report)
    }

    /// Switch the default session and use `config` for sessions created later
    pub async fn switch_default_model(&self, config: ModelConfig) -> Result<()> {
        let session = self.create_or_get(Some(DEFAULT_SESSION_ID)).await?;
        self.rebind(&session, &config).await?;
        *self.default_model.write().await = config;
        Ok(())
    }

    async fn rebind(&self, session: &Session, config: &ModelConfig) -> Result<()> {
        let snapshot = session.snapshot().await;
        self.connectors.validate(config, &snapshot)?;

        let connector = self.connectors.connect(config).await?;
        let tokenizer = self.connectors.tokenizer(config);
        session.bind_connector(connector, tokenizer).await
    }

    async fn build_session(&self, metadata: SessionMetadata) -> Result<Session> {
        let model = self.default_model().await;
        let connector = self.connectors.connect(&model).await?;
        let context = ConversationContext::from_config(&self.config, self.connectors.tokenizer(&model));

        Ok(Session::new(
            metadata,
            context,
            connector,
            self.store.clone(),
            self.events.clone(),
        )
        .with_metrics(self.metrics.clone()))
    }

    /// Insert unless another task registered the same id first
    fn register(&self, session: Session) -> Arc<Session> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let session = Arc::new(session);
                slot.insert(session.clone());
                self.metrics.in_memory.add(1, &[]);
                session
            }
        }
    }

    fn active(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    fn replace_sweeper(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        match self.sweeper.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, handle),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EchoConnectorFactory;
    use crate::storage::InMemoryDurableStore;

    fn manager(max_sessions: usize) -> SessionManager {
        let config = SessionConfig {
            max_sessions,
            ..SessionConfig::default()
        };
        let store = Arc::new(SessionStore::new(InMemoryDurableStore::new()));
        SessionManager::new(config, store, Arc::new(EchoConnectorFactory), None).unwrap()
    }

    #[tokio::test]
    async fn test_create_or_get_returns_same_session() {
        let manager = manager(5);

        let first = manager.create_or_get(Some("s1")).await.unwrap();
        let second = manager.create_or_get(Some("s1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.list().await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_minted_ids_are_unique() {
        let manager = manager(5);

        let a = manager.create_or_get(None).await.unwrap();
        let b = manager.create_or_get(None).await.unwrap();

        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_get_unknown_is_none() {
        let manager = manager(5);
        assert!(manager.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_switch_model_requires_existing_session() {
        let manager = manager(5);
        let err = manager
            .switch_model("missing", ModelConfig::new("echo", "echo-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_evicted_session_is_durable_only_then_rehydrated() {
        let manager = manager(5);
        let session = manager.create_or_get(Some("s1")).await.unwrap();
        session.add_user_message("Hello").await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.evict_idle(Duration::from_millis(1)).await, 1);

        let state = manager.state("s1").await.unwrap().unwrap();
        assert!(!state.is_active());
        assert_eq!(manager.metadata("s1").await.unwrap().unwrap().message_count, 1);

        let rehydrated = manager.get("s1").await.unwrap().unwrap();
        assert_eq!(rehydrated.metadata().await.message_count, 1);
        assert!(manager.state("s1").await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_switch_default_model_updates_future_sessions() {
        let manager = manager(5);
        manager
            .switch_default_model(ModelConfig::new("echo", "echo-2"))
            .await
            .unwrap();

        let default = manager.get(DEFAULT_SESSION_ID).await.unwrap().unwrap();
        assert_eq!(default.model().await.model, "echo-2");

        let fresh = manager.create_or_get(Some("s2")).await.unwrap();
        assert_eq!(fresh.model().await.model, "echo-2");
    }
}
