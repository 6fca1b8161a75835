//! Layout engine — canvas, segment-group grid, and proportional segment
//! widths.
//!
//! All geometry is expressed in point-radius units. The canvas is computed
//! once per session from the *maximum* view (every grouping question
//! active, expanded groups) and never changes afterwards, so toggling
//! views never resizes the visualization. Per-view segment-group grids
//! redistribute the same canvas; inside each group, segment widths carry
//! the response-group proportions on top of a `base_segment_width` floor
//! so no segment ever vanishes.

use serde::{Deserialize, Serialize};

use crate::engine::lattice::SplitLattice;
use crate::model::LayoutParams;

/// An axis-aligned rectangle in point-radius units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether a point lies inside (inclusive edges).
    pub fn contains_point(&self, px: f64, py: f64) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Center of the rectangle.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Fixed per-session layout computed from the maximum view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEngine {
    params: LayoutParams,
    /// Canvas width in point radii; invariant for the session.
    viz_width: f64,
    /// Canvas height in point radii; invariant for the session.
    viz_height: f64,
}

impl LayoutEngine {
    /// Compute the canvas from the maximum view.
    ///
    /// `max_expanded` is the largest expanded response-group count across
    /// the visualized response questions.
    pub fn new(lattice: &SplitLattice, params: LayoutParams, max_expanded: usize) -> Self {
        let (gx, gy) = lattice.max_view_shape();
        let gx = gx as f64;
        let gy = gy as f64;
        let r = max_expanded as f64;

        let viz_width = (gx - 1.0) * params.group_gap_x
            + gx * ((r - 1.0) * params.response_gap
                + r * params.base_segment_width
                + params.min_group_available_width);
        let viz_height = (gy - 1.0) * params.group_gap_y + gy * params.min_group_height;

        Self {
            params,
            viz_width,
            viz_height,
        }
    }

    pub fn params(&self) -> &LayoutParams {
        &self.params
    }

    /// Canvas `(width, height)`; invariant across all ticks (I6).
    pub fn canvas(&self) -> (f64, f64) {
        (self.viz_width, self.viz_height)
    }

    /// Bounds of a split's segment group within its view's grid.
    pub fn group_bounds(&self, lattice: &SplitLattice, split_index: usize) -> Bounds {
        let (vx, vy) = lattice.view_shape_of(split_index);
        let (col, row) = lattice.cell_of(split_index);

        let group_width = (self.viz_width - (vx as f64 - 1.0) * self.params.group_gap_x) / vx as f64;
        let group_height =
            (self.viz_height - (vy as f64 - 1.0) * self.params.group_gap_y) / vy as f64;

        Bounds::new(
            col as f64 * (group_width + self.params.group_gap_x),
            row as f64 * (group_height + self.params.group_gap_y),
            group_width,
            group_height,
        )
    }

    /// Segment bounds inside a group, left to right in group order.
    ///
    /// With data, each segment's width is `base_segment_width` plus its
    /// share of the group's available width; without data every segment
    /// sits at `base_segment_width`, packed from the left. Segments span
    /// the full cell height.
    pub fn segment_bounds(
        &self,
        group: Bounds,
        proportions: &[f64],
        has_data: bool,
    ) -> Vec<Bounds> {
        let n = proportions.len();
        if n == 0 {
            return Vec::new();
        }
        let available = group.width
            - (n as f64 - 1.0) * self.params.response_gap
            - n as f64 * self.params.base_segment_width;

        let mut segments = Vec::with_capacity(n);
        let mut x = group.x;
        for &p in proportions {
            let width = if has_data {
                self.params.base_segment_width + available * p
            } else {
                self.params.base_segment_width
            };
            segments.push(Bounds::new(x, group.y, width, group.height));
            x += width + self.params.response_gap;
        }
        segments
    }
}
