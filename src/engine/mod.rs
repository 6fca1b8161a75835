//! Streaming grouped-segment visualization engine.
//!
//! The engine decomposes a sample of respondents into the lattice of
//! splits induced by the grouping questions, maintains per-split
//! response-question statistics under streaming arrivals, lays out a
//! responsive grid of segment groups whose widths encode proportions, and
//! positions non-overlapping glyphs inside each segment.
//!
//! # Submodules
//! - `lattice` — split enumeration, basis indices, view encoding
//! - `stats` — per-split tallies and batch deltas
//! - `layout` — canvas, grid, and proportional segment widths
//! - `points` — glyph membership and Poisson-disk positioning
//!
//! [`VizEngine`] owns one visualization's worth of all four and drives
//! them through the tick pipeline: apply the batch to the tallies, verify
//! the cross-split invariants, refresh glyph membership and positions,
//! and assemble the `splits` / `splitDiffs` arrays the session runtime
//! emits. The lattice and canvas are fixed at creation; tallies and
//! point state round-trip through an opaque snapshot blob so a sleeping
//! session can be rebuilt exactly.

pub mod lattice;
pub mod layout;
pub mod points;
pub mod stats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use lattice::{LookupMaps, Split, SplitLattice};
pub use layout::{Bounds, LayoutEngine};
pub use points::{PlacedPoint, PointEngine, PointKey, PointMode, SegmentUpdate};
pub use stats::{GroupView, SplitDelta, StatsEngine, Tally};

use crate::error::PollStreamError;
use crate::model::{Respondent, VisualizationConfig};
use crate::protocol::{
    Canvas, SegmentBoundsChange, SegmentState, SnapshotPayload, SplitDiff, SplitState,
    UpdatePayload, ViewDescriptor,
};

/// Result of one tick that changed something.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Basis splits whose tallies changed.
    pub changed_basis: Vec<usize>,
    /// Current state of every split.
    pub splits: Vec<SplitState>,
    /// One diff per split, same length as `splits`.
    pub split_diffs: Vec<SplitDiff>,
}

/// Opaque persisted engine state: the streaming halves of the engine.
/// The lattice and layout are re-derived from the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub stats: StatsEngine,
    pub points: PointEngine,
}

/// One visualization's complete engine.
#[derive(Debug, Clone)]
pub struct VizEngine {
    config: VisualizationConfig,
    lattice: SplitLattice,
    layout: LayoutEngine,
    stats: StatsEngine,
    points: PointEngine,
}

impl VizEngine {
    /// Build a zeroed engine for a validated visualization configuration.
    ///
    /// `seed` drives all Poisson-disk placement; the same seed and input
    /// sequence reproduce identical positions.
    pub fn new(config: VisualizationConfig, seed: u64) -> Self {
        let lattice = SplitLattice::build(&config);
        let group_count = config.response_question.expanded.len();
        let layout = LayoutEngine::new(&lattice, config.layout.clone(), group_count);
        let stats = StatsEngine::new(
            &lattice,
            vec![config.response_question.clone()],
            config.grouping_questions().cloned().collect(),
        );
        let mode = match config.synthetic_sample_size {
            Some(sample_size) => PointMode::Synthetic { sample_size },
            None => PointMode::Real,
        };
        let points = PointEngine::new(mode, seed, &lattice, &layout, group_count);
        Self {
            config,
            lattice,
            layout,
            stats,
            points,
        }
    }

    /// Rebuild an engine from its persisted state.
    pub fn restore(
        config: VisualizationConfig,
        seed: u64,
        state: EngineState,
    ) -> Result<Self, PollStreamError> {
        let mut engine = Self::new(config, seed);
        state.stats.check_invariants(&engine.lattice)?;
        engine.stats = state.stats;
        engine.points = state.points;
        Ok(engine)
    }

    /// Extract the persistable engine state.
    pub fn state(&self) -> EngineState {
        EngineState {
            stats: self.stats.clone(),
            points: self.points.clone(),
        }
    }

    pub fn config(&self) -> &VisualizationConfig {
        &self.config
    }

    pub fn lattice(&self) -> &SplitLattice {
        &self.lattice
    }

    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    /// Canvas dimensions, fixed for the session.
    pub fn canvas(&self) -> Canvas {
        let (width, height) = self.layout.canvas();
        Canvas { width, height }
    }

    /// The per-view split identities.
    pub fn views(&self) -> Vec<ViewDescriptor> {
        self.lattice
            .view_map()
            .iter()
            .map(|(view_id, split_indices)| ViewDescriptor {
                view_id: view_id.clone(),
                split_indices: split_indices.clone(),
            })
            .collect()
    }

    /// Indices of all basis splits in enumeration order.
    pub fn basis_split_indices(&self) -> Vec<usize> {
        self.lattice.basis_indices().to_vec()
    }

    /// The persisted lookup maps.
    pub fn lookup_maps(&self) -> LookupMaps {
        self.lattice.lookup_maps(&self.config)
    }

    /// Apply one batch and refresh geometry and glyphs.
    ///
    /// Returns `None` when the batch moved no statistic — partial and
    /// out-of-range respondents produce no update at all.
    pub fn tick(
        &mut self,
        batch: &[Respondent],
    ) -> Result<Option<TickOutcome>, PollStreamError> {
        let deltas = self.stats.apply_batch(&self.lattice, batch);
        if deltas.is_empty() {
            return Ok(None);
        }

        self.stats.check_invariants(&self.lattice)?;

        let changed_basis: Vec<usize> = deltas
            .iter()
            .map(|d| d.split_index)
            .filter(|&i| self.lattice.split(i).is_basis())
            .collect();

        let segment_updates =
            self.points
                .update(&self.lattice, &self.layout, &self.stats, &changed_basis);

        let mut split_diffs: Vec<SplitDiff> =
            (0..self.lattice.len()).map(SplitDiff::zero).collect();
        for delta in deltas {
            split_diffs[delta.split_index].stats = delta.response_question_changes;
        }
        for update in segment_updates {
            let diff = &mut split_diffs[update.split_index];
            if update.bounds_changed {
                diff.bounds_changes.push(SegmentBoundsChange {
                    group_index: update.group_index,
                    bounds: self
                        .points
                        .segment(update.split_index, update.group_index)
                        .bounds,
                });
            }
            diff.points.added.extend(update.added);
            diff.points.removed.extend(update.removed);
            diff.points.moved.extend(update.moved);
        }

        Ok(Some(TickOutcome {
            changed_basis,
            splits: self.split_states(),
            split_diffs,
        }))
    }

    /// Current state of every split, in enumeration order.
    pub fn split_states(&self) -> Vec<SplitState> {
        (0..self.lattice.len())
            .map(|i| self.split_state(i))
            .collect()
    }

    /// Current state of one split.
    pub fn split_state(&self, split_index: usize) -> SplitState {
        let proportions = self.stats.proportions(split_index, 0, GroupView::Expanded);
        let tallies = self.stats.tallies(split_index, 0);
        let segments = self
            .points
            .segments_of(split_index)
            .iter()
            .enumerate()
            .map(|(g, segment)| SegmentState {
                response_group_label: self.config.response_question.expanded[g].label.clone(),
                bounds: segment.bounds,
                total_count: tallies.expanded[g].total_count,
                total_weight: tallies.expanded[g].total_weight,
                proportion: proportions[g],
                point_positions: segment.points.clone(),
            })
            .collect();
        SplitState {
            split_index,
            view_id: self.lattice.view_id(split_index),
            segments,
        }
    }

    /// Assemble the subscription snapshot.
    pub fn snapshot_payload(
        &self,
        session_id: crate::model::Id,
        sequence: u64,
        timestamp: DateTime<Utc>,
    ) -> SnapshotPayload {
        SnapshotPayload {
            session_id,
            visualization_id: self.config.id,
            timestamp,
            sequence,
            canvas: self.canvas(),
            views: self.views(),
            basis_split_indices: self.basis_split_indices(),
            splits: self.split_states(),
        }
    }

    /// Assemble the per-tick update payload from a tick outcome.
    pub fn update_payload(
        &self,
        outcome: TickOutcome,
        from_sequence: u64,
        timestamp: DateTime<Utc>,
    ) -> UpdatePayload {
        UpdatePayload {
            visualization_id: self.config.id,
            timestamp,
            from_sequence,
            to_sequence: from_sequence + 1,
            basis_split_indices: self.basis_split_indices(),
            splits: outcome.splits,
            split_diffs: outcome.split_diffs,
        }
    }
}
