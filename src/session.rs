//! Per-session runtime task.
//!
//! Each live session is owned by exactly one tokio task holding the
//! lattice, statistics, layout caches, and point sets. Submissions and
//! subscriptions arrive over a bounded command queue and are processed in
//! arrival order; nothing else touches the state, so the engine's compute
//! phase runs without suspension points.
//!
//! # Tick cycle
//! A timer fires every `batch_update_interval`. When the buffer holds
//! respondents and the session is awake, the task drains it atomically,
//! runs the engine pipeline, persists the snapshot, and fans the diff out
//! to every subscriber. Sequence numbers advance only after a successful
//! emit, so diffs are strictly ordered and gap-free per session. A tick
//! whose compute exceeds the soft budget emits its diff and immediately
//! schedules the next tick.
//!
//! # Resilience
//! - A persistence write race reloads the flushed state and replays the
//!   batch on a later tick; consecutive losses defer more ticks.
//! - An invariant violation aborts the tick and re-queues the drained
//!   batch; persisted snapshots are never written from a failed compute.
//! - A subscriber whose bounded queue overflows is dropped; reconnecting
//!   yields a fresh snapshot.
//!
//! # Sleep
//! After an idle period with no submissions and no subscribers (or via
//! an explicit force-sleep), the task flushes its state blob and releases
//! the engine; the next submission or subscription reloads it.

use std::mem;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Settings;
use crate::engine::{EngineState, VizEngine};
use crate::error::{PollStreamError, RetryPolicy, RetryState};
use crate::model::{Answer, Id, Respondent, SessionRecord};
use crate::protocol::VisualizationEvent;
use crate::store::{SessionStore, VisualizationStateRow};

/// Event stream handed to a subscriber; the first item is always the
/// `visualization.snapshot` event.
pub type SubscriptionStream = ReceiverStream<VisualizationEvent>;

/// Monitoring counters of one session task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub respondents_ingested: u64,
    pub ticks_run: u64,
    pub updates_emitted: u64,
    pub subscribers_dropped: u64,
    pub invariant_aborts: u64,
    pub race_retries: u64,
    pub sleeps: u64,
}

/// The opaque blob stored in `session_visualizations.splits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    sequence: u64,
    engine: EngineState,
}

enum Command {
    Submit {
        answers: Vec<Answer>,
        weight: f64,
        reply: oneshot::Sender<Result<Id, PollStreamError>>,
    },
    Subscribe {
        reply: oneshot::Sender<Result<SubscriptionStream, PollStreamError>>,
    },
    SetOpen {
        is_open: bool,
        reply: oneshot::Sender<Result<SessionRecord, PollStreamError>>,
    },
    ForceSleep {
        reply: oneshot::Sender<Result<(), PollStreamError>>,
    },
    Counters {
        reply: oneshot::Sender<SessionCounters>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle to a session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Id,
    slug: String,
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PollStreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PollStreamError::ChannelClosed(format!("session {}", self.id)))?;
        rx.await
            .map_err(|_| PollStreamError::ChannelClosed(format!("session {}", self.id)))
    }

    /// Enqueue a submission; resolves once the respondent is persisted.
    pub async fn submit(&self, answers: Vec<Answer>, weight: f64) -> Result<Id, PollStreamError> {
        self.request(|reply| Command::Submit {
            answers,
            weight,
            reply,
        })
        .await?
    }

    /// Subscribe to the event stream; the snapshot arrives first.
    pub async fn subscribe(&self) -> Result<SubscriptionStream, PollStreamError> {
        self.request(|reply| Command::Subscribe { reply }).await?
    }

    /// Open or close the session for writes.
    pub async fn set_open(&self, is_open: bool) -> Result<SessionRecord, PollStreamError> {
        self.request(|reply| Command::SetOpen { is_open, reply })
            .await?
    }

    /// Flush state and release compute resources immediately.
    pub async fn force_sleep(&self) -> Result<(), PollStreamError> {
        self.request(|reply| Command::ForceSleep { reply }).await?
    }

    /// Current monitoring counters.
    pub async fn counters(&self) -> Result<SessionCounters, PollStreamError> {
        self.request(|reply| Command::Counters { reply }).await
    }

    /// Stop the task. Used on session delete and runtime shutdown.
    pub async fn shutdown(&self) -> Result<(), PollStreamError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Persist a freshly created session's zeroed visualization state so the
/// `session_visualizations` row exists from creation onward.
pub async fn persist_initial_state<S: SessionStore>(
    record: &SessionRecord,
    store: &S,
) -> Result<(), PollStreamError> {
    let viz = record.session_config.visualization.clone();
    let visualization_id = viz.id;
    let engine = VizEngine::new(viz, xxh3_64(record.slug.as_bytes()));
    let persisted = PersistedSession {
        sequence: 0,
        engine: engine.state(),
    };
    store
        .save_visualization_state(VisualizationStateRow {
            session_id: record.id,
            visualization_id,
            basis_split_indices: engine.basis_split_indices(),
            splits: serde_json::to_value(&persisted).map_err(|e| {
                PollStreamError::InternalInvariantViolation(format!(
                    "state serialization failed: {e}"
                ))
            })?,
            lookup_maps: engine.lookup_maps(),
            computed_at: Utc::now(),
        })
        .await
}

/// Spawn the runtime task for a session and return its handle.
pub fn spawn_session<S: SessionStore>(
    record: SessionRecord,
    store: Arc<S>,
    settings: Settings,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(settings.command_queue_depth);
    let handle = SessionHandle {
        id: record.id,
        slug: record.slug.clone(),
        tx,
    };
    let task = SessionTask {
        seed: xxh3_64(record.slug.as_bytes()),
        record,
        store,
        settings,
        engine: None,
        sequence: 0,
        buffer: Vec::new(),
        subscribers: Vec::new(),
        counters: SessionCounters::default(),
        retry: RetryState::new(),
        retry_policy: RetryPolicy::default(),
        last_activity: Instant::now(),
    };
    tokio::spawn(task.run(rx));
    handle
}

struct SessionTask<S: SessionStore> {
    record: SessionRecord,
    store: Arc<S>,
    settings: Settings,
    /// `None` while asleep.
    engine: Option<VizEngine>,
    sequence: u64,
    buffer: Vec<Respondent>,
    subscribers: Vec<mpsc::Sender<VisualizationEvent>>,
    counters: SessionCounters,
    retry: RetryState,
    retry_policy: RetryPolicy,
    last_activity: Instant,
    /// Poisson-disk seed, derived from the slug so a reloaded session
    /// continues the same deterministic placement streams.
    seed: u64,
}

impl<S: SessionStore> SessionTask<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(session = self.record.id, slug = %self.record.slug, "session task started");
        let mut ticker = tokio::time::interval(self.settings.batch_update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so the first
        // batch waits a full period.
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None => break,
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                _ = ticker.tick() => {
                    let started = Instant::now();
                    self.on_tick().await;
                    if started.elapsed() > self.settings.tick_soft_budget
                        && !self.buffer.is_empty()
                    {
                        // Over budget with work queued behind the tick:
                        // run again right away instead of waiting a period.
                        ticker.reset_immediately();
                    }
                }
            }
        }
        info!(session = self.record.id, "session task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                answers,
                weight,
                reply,
            } => {
                let result = self.ingest(answers, weight).await;
                let _ = reply.send(result);
            }
            Command::Subscribe { reply } => {
                let result = self.subscribe().await;
                let _ = reply.send(result);
            }
            Command::SetOpen { is_open, reply } => {
                let result = self.store.set_open(self.record.id, is_open).await;
                if let Ok(record) = &result {
                    self.record.is_open = record.is_open;
                }
                let _ = reply.send(result);
            }
            Command::ForceSleep { reply } => {
                let result = self.go_to_sleep().await;
                let _ = reply.send(result);
            }
            Command::Counters { reply } => {
                let _ = reply.send(self.counters);
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    /// Accept one submission: validate, persist, buffer until the tick.
    async fn ingest(&mut self, answers: Vec<Answer>, weight: f64) -> Result<Id, PollStreamError> {
        if !self.record.is_open {
            return Err(PollStreamError::NotOpen(self.record.id.to_string()));
        }
        self.record.session_config.validate_answers(&answers)?;

        // Suspension point: the respondent is durable before we ack.
        let id = self
            .store
            .insert_respondent(self.record.id, answers.clone(), weight)
            .await?;

        self.buffer.push(Respondent {
            id,
            weight,
            answers,
        });
        self.counters.respondents_ingested += 1;
        self.last_activity = Instant::now();
        Ok(id)
    }

    /// Attach a subscriber; its stream starts with the snapshot.
    async fn subscribe(&mut self) -> Result<SubscriptionStream, PollStreamError> {
        self.ensure_awake().await?;
        self.last_activity = Instant::now();

        let Some(engine) = self.engine.as_ref() else {
            return Err(PollStreamError::InternalInvariantViolation(
                "session has no engine after wake".into(),
            ));
        };
        let snapshot = engine.snapshot_payload(self.record.id, self.sequence, Utc::now());

        let (tx, rx) = mpsc::channel(self.settings.subscriber_queue_depth);
        // A fresh queue always has room for the snapshot.
        let _ = tx.try_send(VisualizationEvent::Snapshot(snapshot));
        self.subscribers.push(tx);
        debug!(
            session = self.record.id,
            subscribers = self.subscribers.len(),
            "subscriber attached"
        );
        Ok(ReceiverStream::new(rx))
    }

    /// Timer tick: drain the buffer, drive the engine, persist, emit.
    async fn on_tick(&mut self) {
        self.counters.ticks_run += 1;

        if self.buffer.is_empty() {
            self.maybe_sleep().await;
            return;
        }
        // A recently lost write race defers whole ticks; the batch keeps
        // accumulating in the buffer meanwhile.
        if self.retry.consume_deferral() {
            return;
        }
        if let Err(err) = self.ensure_awake().await {
            warn!(session = self.record.id, error = %err, "cannot wake session, tick skipped");
            return;
        }

        let batch = mem::take(&mut self.buffer);
        let Some(engine) = self.engine.as_mut() else {
            self.buffer = batch;
            return;
        };

        // Compute phase: no suspension points.
        let outcome = match engine.tick(&batch) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return, // nothing moved: no diff, no sequence advance
            Err(err) => {
                // Tick aborted: drop the tainted engine so the next tick
                // re-derives from the last good snapshot, and re-queue the
                // batch. Persisted snapshots are never written from here.
                warn!(session = self.record.id, error = %err, "tick aborted");
                self.counters.invariant_aborts += 1;
                self.engine = None;
                let mut requeued = batch;
                requeued.extend(mem::take(&mut self.buffer));
                self.buffer = requeued;
                return;
            }
        };

        if let Err(err) = self.persist_with_sequence(self.sequence + 1).await {
            if err.is_retryable() {
                // Lost the write race: drop to the winning state and let
                // a later tick (after the deferral) replay the batch.
                warn!(session = self.record.id, error = %err, "persist race lost, reloading");
                self.counters.race_retries += 1;
                self.retry.record_loss(&self.retry_policy);
                self.engine = None;
                let mut requeued = batch;
                requeued.extend(mem::take(&mut self.buffer));
                self.buffer = requeued;
                return;
            }
            warn!(session = self.record.id, error = %err, "persist failed, diff dropped");
            return;
        }
        self.retry.reset();

        if let Some(engine) = self.engine.as_ref() {
            let payload = engine.update_payload(outcome, self.sequence, Utc::now());
            self.emit(VisualizationEvent::Updated(payload));
            self.sequence += 1;
            self.counters.updates_emitted += 1;
        }
    }

    /// Fan an event out to every subscriber; drop the ones that lag or
    /// went away. Cancellation is observed here, at the emission boundary.
    fn emit(&mut self, event: VisualizationEvent) {
        let session = self.record.id;
        let dropped_before = self.subscribers.len();
        self.subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session, "subscriber queue overflow, dropping subscription");
                    false
                }
            }
        });
        self.counters.subscribers_dropped +=
            (dropped_before - self.subscribers.len()) as u64;
    }

    /// Load the engine if the session is asleep.
    async fn ensure_awake(&mut self) -> Result<(), PollStreamError> {
        if self.engine.is_some() {
            return Ok(());
        }
        let viz = self.record.session_config.visualization.clone();
        let stored = self
            .store
            .visualization_state(self.record.id, viz.id)
            .await?;

        let engine = match stored {
            Some(row) => {
                let persisted: PersistedSession = serde_json::from_value(row.splits)
                    .map_err(|e| {
                        PollStreamError::InternalInvariantViolation(format!(
                            "corrupt persisted state for session {}: {e}",
                            self.record.id
                        ))
                    })?;
                self.sequence = persisted.sequence;
                VizEngine::restore(viz, self.seed, persisted.engine)?
            }
            None => VizEngine::new(viz, self.seed),
        };
        info!(session = self.record.id, sequence = self.sequence, "session awake");
        self.engine = Some(engine);
        Ok(())
    }

    /// Flush the engine state blob under the given sequence;
    /// write-after-write wins on computedAt.
    async fn persist_with_sequence(&self, sequence: u64) -> Result<(), PollStreamError> {
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };
        let persisted = PersistedSession {
            sequence,
            engine: engine.state(),
        };
        let row = VisualizationStateRow {
            session_id: self.record.id,
            visualization_id: engine.config().id,
            basis_split_indices: engine.basis_split_indices(),
            splits: serde_json::to_value(&persisted).map_err(|e| {
                PollStreamError::InternalInvariantViolation(format!(
                    "state serialization failed: {e}"
                ))
            })?,
            lookup_maps: engine.lookup_maps(),
            computed_at: Utc::now(),
        };
        self.store.save_visualization_state(row).await
    }

    /// Sleep when idle: no buffered work, no subscribers, and no
    /// activity for the configured timeout.
    async fn maybe_sleep(&mut self) {
        if self.engine.is_none()
            || !self.buffer.is_empty()
            || !self.subscribers.is_empty()
            || self.last_activity.elapsed() < self.settings.session_idle_timeout
        {
            return;
        }
        if let Err(err) = self.go_to_sleep().await {
            warn!(session = self.record.id, error = %err, "sleep flush failed");
        }
    }

    /// Flush state and release the engine.
    async fn go_to_sleep(&mut self) -> Result<(), PollStreamError> {
        if self.engine.is_none() {
            return Ok(());
        }
        self.persist_with_sequence(self.sequence).await?;
        self.engine = None;
        self.counters.sleeps += 1;
        info!(session = self.record.id, "session asleep");
        Ok(())
    }
}
