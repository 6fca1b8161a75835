//! Session registry — the library surface an HTTP layer embeds.
//!
//! The registry owns the store handle and one [`SessionHandle`] per live
//! session. Its methods mirror the admin and public surfaces: create,
//! list, fetch, status toggle, delete (cascading), submission by id or
//! slug, and subscription. Results map one-to-one onto the HTTP contract:
//! [`PollStreamError::ConfigInvalid`] / [`PollStreamError::NotOpen`] /
//! [`PollStreamError::IngestRejected`] are 400s,
//! [`PollStreamError::NotFound`] is a 404, and a successful delete is a
//! 204 with no body.
//!
//! Session tasks are revived lazily: a session that exists in the store
//! but has no running task (after a process restart, say) gets one
//! spawned on first use, and the task reloads its persisted state on its
//! first wake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::info;

use crate::config::Settings;
use crate::error::PollStreamError;
use crate::model::{Answer, Id, QuestionKey, SessionConfig, SessionRecord, generate_slug};
use crate::session::{SessionCounters, SessionHandle, SubscriptionStream, spawn_session};
use crate::store::SessionStore;

/// Attempts at drawing an unused slug before giving up.
const SLUG_ATTEMPTS: usize = 16;

/// Registry of live polling sessions over one store.
pub struct SessionRegistry<S: SessionStore> {
    store: Arc<S>,
    settings: Settings,
    handles: tokio::sync::RwLock<HashMap<Id, SessionHandle>>,
    slug_rng: Mutex<SmallRng>,
}

impl<S: SessionStore> SessionRegistry<S> {
    pub fn new(store: Arc<S>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            handles: tokio::sync::RwLock::new(HashMap::new()),
            slug_rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Registry with a seeded slug generator, for deterministic tests.
    pub fn with_slug_seed(store: Arc<S>, settings: Settings, seed: u64) -> Self {
        Self {
            store,
            settings,
            handles: tokio::sync::RwLock::new(HashMap::new()),
            slug_rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a session: validate the configuration, assign the
    /// visualization id and slug, seed the store rows, spawn the task.
    pub async fn create_session(
        &self,
        description: String,
        mut config: SessionConfig,
    ) -> Result<SessionRecord, PollStreamError> {
        config.validate()?;
        config.visualization.id = 1;

        let slug = self.free_slug().await?;
        let record = self
            .store
            .insert_session(slug, description, config, Utc::now())
            .await?;
        crate::session::persist_initial_state(&record, self.store.as_ref()).await?;
        info!(session = record.id, slug = %record.slug, "session created");

        let handle = spawn_session(record.clone(), self.store.clone(), self.settings.clone());
        self.handles.write().await.insert(record.id, handle);
        Ok(record)
    }

    /// Draw a slug no existing session uses.
    async fn free_slug(&self) -> Result<String, PollStreamError> {
        for _ in 0..SLUG_ATTEMPTS {
            let candidate = {
                let mut rng = self.slug_rng.lock().expect("slug rng lock");
                generate_slug(&mut *rng)
            };
            match self.store.session_by_slug(&candidate).await {
                Err(PollStreamError::NotFound(_)) => return Ok(candidate),
                Err(other) => return Err(other),
                Ok(_) => continue,
            }
        }
        Err(PollStreamError::InternalInvariantViolation(
            "slug space exhausted".into(),
        ))
    }

    /// All sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, PollStreamError> {
        self.store.sessions().await
    }

    /// One session by id.
    pub async fn session(&self, id: Id) -> Result<SessionRecord, PollStreamError> {
        self.store.session(id).await
    }

    /// The session's questions in presentation order.
    pub async fn questions(&self, id: Id) -> Result<Vec<QuestionKey>, PollStreamError> {
        let mut rows = self.store.poll_questions(id).await?;
        rows.sort_by_key(|r| r.ordering_index);
        Ok(rows.into_iter().map(|r| r.question).collect())
    }

    /// Open or close a session for writes.
    pub async fn set_status(
        &self,
        id: Id,
        is_open: bool,
    ) -> Result<SessionRecord, PollStreamError> {
        let handle = self.handle(id).await?;
        map_deleted(handle.set_open(is_open).await)
    }

    /// Delete a session; cascades to all derived state and stops the task.
    pub async fn delete_session(&self, id: Id) -> Result<(), PollStreamError> {
        let handle = self.handles.write().await.remove(&id);
        if let Some(handle) = handle {
            // The task may already be gone; deletion proceeds regardless.
            let _ = handle.shutdown().await;
        }
        self.store.delete_session(id).await?;
        info!(session = id, "session deleted");
        Ok(())
    }

    /// Submit a response batch entry to a session by id.
    pub async fn submit(
        &self,
        id: Id,
        answers: Vec<Answer>,
        weight: f64,
    ) -> Result<Id, PollStreamError> {
        let handle = self.handle(id).await?;
        map_deleted(handle.submit(answers, weight).await)
    }

    /// Submit by the session's public slug.
    pub async fn submit_by_slug(
        &self,
        slug: &str,
        answers: Vec<Answer>,
        weight: f64,
    ) -> Result<Id, PollStreamError> {
        let record = self.store.session_by_slug(slug).await?;
        self.submit(record.id, answers, weight).await
    }

    /// Subscribe to a session's visualization event stream.
    pub async fn subscribe(&self, id: Id) -> Result<SubscriptionStream, PollStreamError> {
        let handle = self.handle(id).await?;
        map_deleted(handle.subscribe().await)
    }

    /// Flush a session to the store and release its compute state.
    pub async fn force_sleep(&self, id: Id) -> Result<(), PollStreamError> {
        let handle = self.handle(id).await?;
        map_deleted(handle.force_sleep().await)
    }

    /// Monitoring counters of one session.
    pub async fn counters(&self, id: Id) -> Result<SessionCounters, PollStreamError> {
        let handle = self.handle(id).await?;
        map_deleted(handle.counters().await)
    }

    /// Handle of a session, reviving the task if none is running.
    async fn handle(&self, id: Id) -> Result<SessionHandle, PollStreamError> {
        if let Some(handle) = self.handles.read().await.get(&id) {
            return Ok(handle.clone());
        }
        // Not running: revive from the store (post-restart, or the task
        // ended). The record must exist.
        let record = self.store.session(id).await?;
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(&id) {
            return Ok(handle.clone());
        }
        let handle = spawn_session(record, self.store.clone(), self.settings.clone());
        handles.insert(id, handle.clone());
        info!(session = id, "session task revived");
        Ok(handle)
    }
}

/// A closed command channel means the session was deleted while the
/// request was in flight; surface it as not-found.
fn map_deleted<T>(result: Result<T, PollStreamError>) -> Result<T, PollStreamError> {
    result.map_err(|err| match err {
        PollStreamError::ChannelClosed(message) => PollStreamError::NotFound(message),
        other => other,
    })
}
