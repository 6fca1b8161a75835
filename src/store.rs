//! Persistence seam — the storage contract and its in-memory implementation.
//!
//! The core never talks to a database directly; it goes through
//! [`SessionStore`], whose logical tables mirror the relational schema:
//! `sessions`, `poll_questions` (with `ordering_index`), `respondents` +
//! `responses`, and `session_visualizations` holding the opaque engine
//! state blob keyed by `(session, visualization)`.
//!
//! Visualization-state writes are last-writer-wins on `computed_at`: a
//! write that is older than the stored row loses the race and surfaces
//! [`PollStreamError::RaceLost`]; the session task rolls forward on its
//! next tick. Session deletion cascades to every dependent row.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::LookupMaps;
use crate::error::PollStreamError;
use crate::model::{Answer, Id, QuestionKey, Respondent, SessionConfig, SessionRecord};

/// One `poll_questions` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuestionRow {
    pub session_id: Id,
    pub question: QuestionKey,
    pub ordering_index: usize,
}

/// One `session_visualizations` row: the persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationStateRow {
    pub session_id: Id,
    pub visualization_id: Id,
    pub basis_split_indices: Vec<usize>,
    /// Opaque split payload (the engine's serialized streaming state).
    pub splits: serde_json::Value,
    pub lookup_maps: LookupMaps,
    /// Monotonically advancing write timestamp; write-after-write wins.
    pub computed_at: DateTime<Utc>,
}

/// Storage contract of the session runtime.
///
/// Implementations must be shareable across session tasks; every method
/// returns a `Send` future so tasks holding a store handle stay
/// spawnable.
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a session and its `poll_questions` rows; assigns the id.
    fn insert_session(
        &self,
        slug: String,
        description: String,
        config: SessionConfig,
        created_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<SessionRecord, PollStreamError>> + Send;

    /// Load a session by id.
    fn session(&self, id: Id) -> impl Future<Output = Result<SessionRecord, PollStreamError>> + Send;

    /// Load a session by its public slug.
    fn session_by_slug(
        &self,
        slug: &str,
    ) -> impl Future<Output = Result<SessionRecord, PollStreamError>> + Send;

    /// All sessions, ordered by id.
    fn sessions(&self) -> impl Future<Output = Result<Vec<SessionRecord>, PollStreamError>> + Send;

    /// Toggle a session open/closed; returns the updated record.
    fn set_open(
        &self,
        id: Id,
        is_open: bool,
    ) -> impl Future<Output = Result<SessionRecord, PollStreamError>> + Send;

    /// Delete a session, cascading to questions, respondents, responses,
    /// and visualization state.
    fn delete_session(&self, id: Id) -> impl Future<Output = Result<(), PollStreamError>> + Send;

    /// The session's `poll_questions` rows in ordering-index order.
    fn poll_questions(
        &self,
        session_id: Id,
    ) -> impl Future<Output = Result<Vec<PollQuestionRow>, PollStreamError>> + Send;

    /// Persist one respondent and its responses; assigns the id.
    fn insert_respondent(
        &self,
        session_id: Id,
        answers: Vec<Answer>,
        weight: f64,
    ) -> impl Future<Output = Result<Id, PollStreamError>> + Send;

    /// All respondents of a session, in insertion order.
    fn respondents(
        &self,
        session_id: Id,
    ) -> impl Future<Output = Result<Vec<Respondent>, PollStreamError>> + Send;

    /// Write the visualization state; last-writer-wins on `computed_at`.
    fn save_visualization_state(
        &self,
        row: VisualizationStateRow,
    ) -> impl Future<Output = Result<(), PollStreamError>> + Send;

    /// Load the visualization state, if any was persisted.
    fn visualization_state(
        &self,
        session_id: Id,
        visualization_id: Id,
    ) -> impl Future<Output = Result<Option<VisualizationStateRow>, PollStreamError>> + Send;
}

// ── In-memory store ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryTables {
    next_session_id: Id,
    next_respondent_id: Id,
    sessions: BTreeMap<Id, SessionRecord>,
    poll_questions: BTreeMap<Id, Vec<PollQuestionRow>>,
    respondents: BTreeMap<Id, Vec<Respondent>>,
    viz_states: BTreeMap<(Id, Id), VisualizationStateRow>,
}

/// Reference [`SessionStore`] backed by in-process tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    async fn insert_session(
        &self,
        slug: String,
        description: String,
        config: SessionConfig,
        created_at: DateTime<Utc>,
    ) -> Result<SessionRecord, PollStreamError> {
        let mut tables = self.tables.write().await;
        tables.next_session_id += 1;
        let id = tables.next_session_id;

        let record = SessionRecord {
            id,
            slug,
            description,
            is_open: true,
            session_config: config,
            created_at,
        };
        let questions: Vec<PollQuestionRow> = record
            .session_config
            .question_order
            .iter()
            .enumerate()
            .map(|(ordering_index, question)| PollQuestionRow {
                session_id: id,
                question: question.clone(),
                ordering_index,
            })
            .collect();

        tables.sessions.insert(id, record.clone());
        tables.poll_questions.insert(id, questions);
        tables.respondents.insert(id, Vec::new());
        Ok(record)
    }

    async fn session(&self, id: Id) -> Result<SessionRecord, PollStreamError> {
        self.tables
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| PollStreamError::NotFound(format!("session {id}")))
    }

    async fn session_by_slug(&self, slug: &str) -> Result<SessionRecord, PollStreamError> {
        self.tables
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.slug == slug)
            .cloned()
            .ok_or_else(|| PollStreamError::NotFound(format!("session slug {slug}")))
    }

    async fn sessions(&self) -> Result<Vec<SessionRecord>, PollStreamError> {
        Ok(self.tables.read().await.sessions.values().cloned().collect())
    }

    async fn set_open(&self, id: Id, is_open: bool) -> Result<SessionRecord, PollStreamError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| PollStreamError::NotFound(format!("session {id}")))?;
        record.is_open = is_open;
        Ok(record.clone())
    }

    async fn delete_session(&self, id: Id) -> Result<(), PollStreamError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.remove(&id).is_none() {
            return Err(PollStreamError::NotFound(format!("session {id}")));
        }
        tables.poll_questions.remove(&id);
        tables.respondents.remove(&id);
        tables.viz_states.retain(|(session_id, _), _| *session_id != id);
        Ok(())
    }

    async fn poll_questions(&self, session_id: Id) -> Result<Vec<PollQuestionRow>, PollStreamError> {
        self.tables
            .read()
            .await
            .poll_questions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PollStreamError::NotFound(format!("session {session_id}")))
    }

    async fn insert_respondent(
        &self,
        session_id: Id,
        answers: Vec<Answer>,
        weight: f64,
    ) -> Result<Id, PollStreamError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(PollStreamError::NotFound(format!("session {session_id}")));
        }
        tables.next_respondent_id += 1;
        let id = tables.next_respondent_id;
        let respondent = Respondent {
            id,
            weight,
            answers,
        };
        tables
            .respondents
            .entry(session_id)
            .or_default()
            .push(respondent);
        Ok(id)
    }

    async fn respondents(&self, session_id: Id) -> Result<Vec<Respondent>, PollStreamError> {
        self.tables
            .read()
            .await
            .respondents
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PollStreamError::NotFound(format!("session {session_id}")))
    }

    async fn save_visualization_state(
        &self,
        row: VisualizationStateRow,
    ) -> Result<(), PollStreamError> {
        let mut tables = self.tables.write().await;
        let key = (row.session_id, row.visualization_id);
        if let Some(existing) = tables.viz_states.get(&key)
            && existing.computed_at > row.computed_at
        {
            return Err(PollStreamError::RaceLost(format!(
                "visualization {}/{}: stored computedAt {} is newer than {}",
                row.session_id, row.visualization_id, existing.computed_at, row.computed_at
            )));
        }
        tables.viz_states.insert(key, row);
        Ok(())
    }

    async fn visualization_state(
        &self,
        session_id: Id,
        visualization_id: Id,
    ) -> Result<Option<VisualizationStateRow>, PollStreamError> {
        Ok(self
            .tables
            .read()
            .await
            .viz_states
            .get(&(session_id, visualization_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        GroupingQuestion, LayoutParams, ResponseGroup, ResponseQuestion, VisualizationConfig,
    };

    fn qk(name: &str) -> QuestionKey {
        QuestionKey::new(name, "b", "")
    }

    fn config() -> SessionConfig {
        SessionConfig {
            question_order: vec![qk("sat"), qk("gender")],
            visualization: VisualizationConfig {
                id: 1,
                response_question: ResponseQuestion {
                    question: qk("sat"),
                    expanded: vec![
                        ResponseGroup::new("lo", [0]),
                        ResponseGroup::new("hi", [1]),
                    ],
                    collapsed: vec![ResponseGroup::new("all", [0, 1])],
                },
                x: vec![GroupingQuestion {
                    question: qk("gender"),
                    response_groups: vec![
                        ResponseGroup::new("m", [0]),
                        ResponseGroup::new("f", [1]),
                    ],
                }],
                y: vec![],
                layout: LayoutParams {
                    min_group_available_width: 40.0,
                    min_group_height: 30.0,
                    group_gap_x: 4.0,
                    group_gap_y: 4.0,
                    response_gap: 2.0,
                    base_segment_width: 3.0,
                },
                synthetic_sample_size: None,
            },
        }
    }

    async fn seeded_store() -> (MemoryStore, SessionRecord) {
        let store = MemoryStore::new();
        let record = store
            .insert_session("abc123defg".into(), "test".into(), config(), Utc::now())
            .await
            .unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_question_rows() {
        let (store, record) = seeded_store().await;
        assert_eq!(record.id, 1);
        assert!(record.is_open);

        let questions = store.poll_questions(record.id).await.unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].ordering_index, 0);
        assert_eq!(questions[1].ordering_index, 1);
        assert_eq!(questions[0].question, qk("sat"));
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_slug() {
        let (store, record) = seeded_store().await;
        assert_eq!(store.session(record.id).await.unwrap().id, record.id);
        assert_eq!(
            store.session_by_slug("abc123defg").await.unwrap().id,
            record.id
        );
        assert!(matches!(
            store.session(999).await.unwrap_err(),
            PollStreamError::NotFound(_)
        ));
        assert!(store.session_by_slug("zzzzzzzzzz").await.is_err());
    }

    #[tokio::test]
    async fn test_set_open_round_trip() {
        let (store, record) = seeded_store().await;
        let closed = store.set_open(record.id, false).await.unwrap();
        assert!(!closed.is_open);
        let reopened = store.set_open(record.id, true).await.unwrap();
        assert!(reopened.is_open);
        assert!(store.set_open(42, false).await.is_err());
    }

    #[tokio::test]
    async fn test_respondent_rows() {
        let (store, record) = seeded_store().await;
        let id1 = store
            .insert_respondent(record.id, vec![Answer::new(qk("sat"), Some(0))], 1.0)
            .await
            .unwrap();
        let id2 = store
            .insert_respondent(record.id, vec![Answer::new(qk("sat"), Some(1))], 1.0)
            .await
            .unwrap();
        assert!(id2 > id1);

        let rows = store.respondents(record.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, id1);

        assert!(store.insert_respondent(999, vec![], 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, record) = seeded_store().await;
        store
            .insert_respondent(record.id, vec![], 1.0)
            .await
            .unwrap();
        store
            .save_visualization_state(VisualizationStateRow {
                session_id: record.id,
                visualization_id: 1,
                basis_split_indices: vec![0, 1],
                splits: serde_json::json!({}),
                lookup_maps: LookupMaps::default(),
                computed_at: Utc::now(),
            })
            .await
            .unwrap();

        store.delete_session(record.id).await.unwrap();

        assert!(store.session(record.id).await.is_err());
        assert!(store.poll_questions(record.id).await.is_err());
        assert!(store.respondents(record.id).await.is_err());
        assert!(
            store
                .visualization_state(record.id, 1)
                .await
                .unwrap()
                .is_none()
        );
        // Double delete is not-found.
        assert!(store.delete_session(record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_visualization_state_last_writer_wins() {
        let (store, record) = seeded_store().await;
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        let row = |computed_at| VisualizationStateRow {
            session_id: record.id,
            visualization_id: 1,
            basis_split_indices: vec![0],
            splits: serde_json::json!({"marker": computed_at}),
            lookup_maps: LookupMaps::default(),
            computed_at,
        };

        store.save_visualization_state(row(t1)).await.unwrap();
        // An older write loses the race.
        let err = store.save_visualization_state(row(t0)).await.unwrap_err();
        assert!(matches!(err, PollStreamError::RaceLost(_)));

        // Equal or newer timestamps win.
        store.save_visualization_state(row(t1)).await.unwrap();
        let stored = store
            .visualization_state(record.id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.computed_at, t1);
    }
}
