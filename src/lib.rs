//! pollstream — streaming grouped-segment visualizations for live
//! polling sessions.
//!
//! Administrators configure a session by choosing questions and a
//! grouped-segment visualization over them; participants submit answers;
//! the engine aggregates the answers and pushes incremental updates of a
//! precomputed visualization to subscribed viewers in near-real time.
//!
//! # Architecture
//!
//! - [`engine::lattice`] enumerates the cartesian lattice of splits
//!   induced by the grouping questions, with an "any" wildcard per
//!   question.
//! - [`engine::stats`] maintains per-split response-question tallies
//!   under streaming arrivals and produces per-tick deltas.
//! - [`engine::layout`] computes the fixed canvas, the per-view
//!   segment-group grid, and proportion-driven segment widths.
//! - [`engine::points`] keeps stable glyph identities and positions them
//!   with Poisson-disk sampling under insert/remove churn.
//! - [`session`] owns one live session: it buffers submissions, drives
//!   the engine on a timer, persists snapshots, and fans sequence-
//!   numbered diffs out over bounded subscriber queues.
//! - [`registry`] is the embedding surface: session CRUD, submissions by
//!   id or slug, and subscriptions.
//! - [`store`] is the persistence seam; [`store::MemoryStore`] is the
//!   in-process reference implementation.
//!
//! Distinct sessions are independent tasks; within a session,
//! submissions are ingested in arrival order and diffs are emitted in
//! strictly increasing sequence with no gaps.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;

pub use config::Settings;
pub use error::{ErrorKind, PollStreamError};
pub use registry::SessionRegistry;
pub use session::{SessionCounters, SessionHandle, SubscriptionStream};
pub use store::{MemoryStore, SessionStore};
