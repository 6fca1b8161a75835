//! Wire protocol — the events pushed to subscribers.
//!
//! Two named events exist, and their names are part of the contract with
//! consumers:
//! - `visualization.snapshot` — sent once per subscription: canvas
//!   dimensions, view identities, and the complete current splits with
//!   segments and point positions.
//! - `visualization.updated` — sent per tick: the current split states
//!   plus a `splitDiffs` array of the **same length**, one entry per
//!   split. Splits the tick did not touch contribute structurally-present
//!   zero diffs, so consumers can index both arrays in lockstep.
//!
//! Every diff carries `{fromSequence, toSequence = fromSequence + 1}`; a
//! consumer that observes a gap re-subscribes for a fresh snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::layout::Bounds;
use crate::engine::points::{PlacedPoint, PointKey};
use crate::engine::stats::ResponseQuestionChange;
use crate::model::Id;

/// Canvas dimensions in point radii; fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    pub width: f64,
    pub height: f64,
}

/// Identity of one view: which splits it selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDescriptor {
    /// Sorted comma-separated active question positions; empty for the
    /// all-null base view.
    pub view_id: String,
    pub split_indices: Vec<usize>,
}

/// Current state of one segment: geometry, statistics, and glyphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentState {
    pub response_group_label: String,
    pub bounds: Bounds,
    pub total_count: u64,
    pub total_weight: f64,
    pub proportion: f64,
    pub point_positions: Vec<PlacedPoint>,
}

/// Current state of one split: its segments in expanded-group order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitState {
    pub split_index: usize,
    pub view_id: String,
    pub segments: Vec<SegmentState>,
}

/// New bounds of one segment whose geometry changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentBoundsChange {
    pub group_index: usize,
    pub bounds: Bounds,
}

/// Point-level changes of one split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointDiff {
    pub added: Vec<PlacedPoint>,
    pub removed: Vec<PointKey>,
    pub moved: Vec<PlacedPoint>,
}

/// Per-split diff entry. One exists for every split in the paired
/// `splits` array; untouched splits carry the zero value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDiff {
    pub split_index: usize,
    pub bounds_changes: Vec<SegmentBoundsChange>,
    pub points: PointDiff,
    pub stats: Vec<ResponseQuestionChange>,
}

impl SplitDiff {
    /// The structurally-present zero diff for an untouched split.
    pub fn zero(split_index: usize) -> Self {
        Self {
            split_index,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bounds_changes.is_empty()
            && self.points.added.is_empty()
            && self.points.removed.is_empty()
            && self.points.moved.is_empty()
            && self.stats.is_empty()
    }
}

/// Complete state, sent once on subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub session_id: Id,
    pub visualization_id: Id,
    pub timestamp: DateTime<Utc>,
    /// Current sequence; the next diff's `fromSequence` equals this.
    pub sequence: u64,
    pub canvas: Canvas,
    pub views: Vec<ViewDescriptor>,
    pub basis_split_indices: Vec<usize>,
    pub splits: Vec<SplitState>,
}

/// Incremental update, sent once per tick that changed anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub visualization_id: Id,
    pub timestamp: DateTime<Utc>,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub basis_split_indices: Vec<usize>,
    pub splits: Vec<SplitState>,
    /// Same length as `splits`.
    pub split_diffs: Vec<SplitDiff>,
}

/// A named subscriber event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum VisualizationEvent {
    #[serde(rename = "visualization.snapshot")]
    Snapshot(SnapshotPayload),
    #[serde(rename = "visualization.updated")]
    Updated(UpdatePayload),
}

impl VisualizationEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            VisualizationEvent::Snapshot(_) => "visualization.snapshot",
            VisualizationEvent::Updated(_) => "visualization.updated",
        }
    }

    pub fn as_updated(&self) -> Option<&UpdatePayload> {
        match self {
            VisualizationEvent::Updated(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotPayload> {
        match self {
            VisualizationEvent::Snapshot(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SnapshotPayload {
        SnapshotPayload {
            session_id: 1,
            visualization_id: 1,
            timestamp: Utc::now(),
            sequence: 0,
            canvas: Canvas {
                width: 110.0,
                height: 66.0,
            },
            views: vec![ViewDescriptor {
                view_id: String::new(),
                split_indices: vec![8],
            }],
            basis_split_indices: vec![0, 1, 3, 4],
            splits: Vec::new(),
        }
    }

    #[test]
    fn test_event_names() {
        let snap = VisualizationEvent::Snapshot(snapshot());
        assert_eq!(snap.name(), "visualization.snapshot");

        let update = VisualizationEvent::Updated(UpdatePayload {
            visualization_id: 1,
            timestamp: Utc::now(),
            from_sequence: 0,
            to_sequence: 1,
            basis_split_indices: vec![],
            splits: vec![],
            split_diffs: vec![],
        });
        assert_eq!(update.name(), "visualization.updated");
    }

    #[test]
    fn test_event_serde_tagging() {
        let snap = VisualizationEvent::Snapshot(snapshot());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["event"], "visualization.snapshot");
        assert!(json["data"]["canvas"]["width"].is_number());
        assert_eq!(json["data"]["basisSplitIndices"][0], 0);

        let back: VisualizationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "visualization.snapshot");
    }

    #[test]
    fn test_zero_diff_is_zero() {
        let diff = SplitDiff::zero(5);
        assert!(diff.is_zero());
        assert_eq!(diff.split_index, 5);

        let mut touched = SplitDiff::zero(5);
        touched.points.added.push(PlacedPoint {
            key: PointKey {
                split_index: 5,
                expanded_group_index: 0,
                local_id: 0,
            },
            x: 1.0,
            y: 2.0,
        });
        assert!(!touched.is_zero());
    }

    #[test]
    fn test_sequence_fields_round_trip() {
        let update = UpdatePayload {
            visualization_id: 3,
            timestamp: Utc::now(),
            from_sequence: 6,
            to_sequence: 7,
            basis_split_indices: vec![0],
            splits: vec![],
            split_diffs: vec![],
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"fromSequence\":6"));
        assert!(json.contains("\"toSequence\":7"));
        let back: UpdatePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
