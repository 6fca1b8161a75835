//! Point engine — glyph membership and Poisson-disk positioning.
//!
//! Points are keyed by `(splitIndex, expandedGroupIndex, localId)`, where
//! the split index always names the *basis* split that owns the identity
//! and `localId` increases monotonically per (split, group). Identities
//! persist across re-layouts; removals cite the exact departed keys.
//!
//! Membership lives in basis splits. In real-data mode each basis
//! segment's point count equals its tally: arrivals append new ids at the
//! end, departures remove the highest ids. In synthetic-sample mode every
//! populated basis split carries exactly `syntheticSampleSize` points,
//! allocated across expanded groups by the largest-remainder method and
//! regenerated wholesale whenever the basis split changes. A non-basis
//! segment shows the union of its contained basis splits' points,
//! positioned inside its own bounds.
//!
//! Positions come from Bridson-style Poisson-disk sampling over a spatial
//! grid. Incremental updates preserve the positions of retained points and
//! sample only the newcomers against them; a segment whose width moved by
//! more than 10% is re-sampled from scratch. Sampling is driven by a
//! seeded PRNG with per-segment streams, so placement is deterministic and
//! independent of segment visit order.

use std::collections::BTreeSet;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::engine::lattice::SplitLattice;
use crate::engine::layout::{Bounds, LayoutEngine};
use crate::engine::stats::{GroupView, StatsEngine};

/// Minimum separation between points in a segment, in point radii.
pub const MIN_POINT_DISTANCE: f64 = 2.5;

/// Inset applied to segment bounds before sampling, in point radii.
const POINT_MARGIN: f64 = 1.0;

/// Candidates tried per active seed in the Bridson annulus.
const ANNULUS_ATTEMPTS: usize = 30;

/// Random placements tried once the active list is exhausted.
const RANDOM_ATTEMPTS: usize = 60;

/// Relative width change beyond which a segment is fully re-sampled.
const RESAMPLE_WIDTH_THRESHOLD: f64 = 0.10;

/// Stable identity of one glyph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct PointKey {
    /// Basis split owning the identity.
    pub split_index: usize,
    pub expanded_group_index: usize,
    pub local_id: u64,
}

/// A positioned glyph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedPoint {
    pub key: PointKey,
    pub x: f64,
    pub y: f64,
}

/// Point state of one segment (one split × one expanded group).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPoints {
    pub bounds: Bounds,
    pub points: Vec<PlacedPoint>,
    /// Sampling epoch; advanced on every placement pass so re-sampling
    /// after a restore continues the same deterministic stream.
    pub generation: u64,
}

/// Changes to one segment produced by a tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentUpdate {
    pub split_index: usize,
    pub group_index: usize,
    pub bounds_changed: bool,
    pub added: Vec<PlacedPoint>,
    pub removed: Vec<PointKey>,
    pub moved: Vec<PlacedPoint>,
}

impl SegmentUpdate {
    pub fn is_empty(&self) -> bool {
        !self.bounds_changed
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
    }
}

/// Membership mode, fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PointMode {
    /// One point per classified respondent.
    Real,
    /// A fixed-size proportional sample per populated basis split.
    Synthetic { sample_size: usize },
}

/// Point membership and positions for one visualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointEngine {
    mode: PointMode,
    seed: u64,
    /// Per split (basis entries only), per expanded group: member local
    /// ids, ascending.
    membership: Vec<Vec<Vec<u64>>>,
    /// Per split (basis entries only), per expanded group: next local id.
    next_local_id: Vec<Vec<u64>>,
    /// Per split, per expanded group: positioned points.
    segments: Vec<Vec<SegmentPoints>>,
}

impl PointEngine {
    /// Create an empty engine; segment bounds start at the no-data layout
    /// so the first populated tick triggers a clean full placement.
    pub fn new(
        mode: PointMode,
        seed: u64,
        lattice: &SplitLattice,
        layout: &LayoutEngine,
        group_count: usize,
    ) -> Self {
        let membership = vec![vec![Vec::new(); group_count]; lattice.len()];
        let next_local_id = vec![vec![0u64; group_count]; lattice.len()];
        let mut segments = Vec::with_capacity(lattice.len());
        for split in 0..lattice.len() {
            let group = layout.group_bounds(lattice, split);
            let bounds = layout.segment_bounds(group, &vec![0.0; group_count], false);
            segments.push(
                bounds
                    .into_iter()
                    .map(|b| SegmentPoints {
                        bounds: b,
                        points: Vec::new(),
                        generation: 0,
                    })
                    .collect(),
            );
        }
        Self {
            mode,
            seed,
            membership,
            next_local_id,
            segments,
        }
    }

    pub fn mode(&self) -> PointMode {
        self.mode
    }

    /// Positioned points of one segment.
    pub fn segment(&self, split_index: usize, group_index: usize) -> &SegmentPoints {
        &self.segments[split_index][group_index]
    }

    /// All segments of one split, in expanded-group order.
    pub fn segments_of(&self, split_index: usize) -> &[SegmentPoints] {
        &self.segments[split_index]
    }

    /// Apply a tick: refresh membership of the changed basis splits, then
    /// re-position every affected segment. Returns one update per touched
    /// segment, ordered by (split, group).
    pub fn update(
        &mut self,
        lattice: &SplitLattice,
        layout: &LayoutEngine,
        stats: &StatsEngine,
        changed_basis: &[usize],
    ) -> Vec<SegmentUpdate> {
        for &basis in changed_basis {
            self.refresh_membership(basis, stats);
        }

        let affected: BTreeSet<usize> = changed_basis
            .iter()
            .flat_map(|&b| lattice.containing_splits(b).iter().copied())
            .collect();

        let mut updates = Vec::new();
        for &split in &affected {
            let proportions = stats.proportions(split, 0, GroupView::Expanded);
            let has_data = stats.total_count(split, 0) > 0;
            let group = layout.group_bounds(lattice, split);
            let bounds = layout.segment_bounds(group, &proportions, has_data);

            for (g, new_bounds) in bounds.into_iter().enumerate() {
                let desired = self.desired_keys(lattice, split, g);
                let update = self.reposition_segment(split, g, new_bounds, &desired);
                if !update.is_empty() {
                    updates.push(update);
                }
            }
        }
        updates
    }

    /// The keys a segment should show: the union of its contained basis
    /// splits' members, in basis order with ascending ids.
    fn desired_keys(&self, lattice: &SplitLattice, split: usize, group: usize) -> Vec<PointKey> {
        let mut keys = Vec::new();
        for &basis in lattice.basis_of(split) {
            for &local_id in &self.membership[basis][group] {
                keys.push(PointKey {
                    split_index: basis,
                    expanded_group_index: group,
                    local_id,
                });
            }
        }
        keys
    }

    /// Bring a basis split's membership in line with its tallies.
    fn refresh_membership(&mut self, basis: usize, stats: &StatsEngine) {
        match self.mode {
            PointMode::Real => {
                let tallies = stats.tallies(basis, 0);
                for (g, tally) in tallies.expanded.iter().enumerate() {
                    let target = tally.total_count as usize;
                    let members = &mut self.membership[basis][g];
                    while members.len() < target {
                        members.push(self.next_local_id[basis][g]);
                        self.next_local_id[basis][g] += 1;
                    }
                    // Departures drop the highest ids.
                    members.truncate(target);
                }
            }
            PointMode::Synthetic { sample_size } => {
                if stats.total_count(basis, 0) == 0 {
                    for members in &mut self.membership[basis] {
                        members.clear();
                    }
                    return;
                }
                let proportions = stats.proportions(basis, 0, GroupView::Expanded);
                let counts = largest_remainder(&proportions, sample_size);
                // Wholesale regeneration: identities are not preserved.
                for (g, count) in counts.into_iter().enumerate() {
                    let members = &mut self.membership[basis][g];
                    members.clear();
                    for _ in 0..count {
                        members.push(self.next_local_id[basis][g]);
                        self.next_local_id[basis][g] += 1;
                    }
                }
            }
        }
    }

    /// Re-position one segment against its desired membership and bounds.
    fn reposition_segment(
        &mut self,
        split: usize,
        group: usize,
        new_bounds: Bounds,
        desired: &[PointKey],
    ) -> SegmentUpdate {
        let segment = &mut self.segments[split][group];
        let old_bounds = segment.bounds;
        let bounds_changed = old_bounds != new_bounds;

        let width_delta = if old_bounds.width > 0.0 {
            (new_bounds.width - old_bounds.width).abs() / old_bounds.width
        } else {
            f64::INFINITY
        };
        let full_resample = bounds_changed && width_delta > RESAMPLE_WIDTH_THRESHOLD;

        let desired_set: BTreeSet<PointKey> = desired.iter().copied().collect();
        let removed: Vec<PointKey> = segment
            .points
            .iter()
            .map(|p| p.key)
            .filter(|k| !desired_set.contains(k))
            .collect();
        let existing: BTreeSet<PointKey> = segment.points.iter().map(|p| p.key).collect();
        let new_keys: Vec<PointKey> = desired
            .iter()
            .copied()
            .filter(|k| !existing.contains(k))
            .collect();

        if !bounds_changed && removed.is_empty() && new_keys.is_empty() {
            return SegmentUpdate {
                split_index: split,
                group_index: group,
                ..SegmentUpdate::default()
            };
        }

        segment.generation += 1;
        let rng_seed = derive_segment_seed(self.seed, split, group, segment.generation);
        let mut update = SegmentUpdate {
            split_index: split,
            group_index: group,
            bounds_changed,
            removed,
            ..SegmentUpdate::default()
        };

        if full_resample {
            // Re-place everything; surviving keys are reported as moved.
            let mut sampler = DiskSampler::new(new_bounds, rng_seed);
            let mut points = Vec::with_capacity(desired.len());
            for &key in desired {
                let (x, y) = sampler.place_next();
                let placed = PlacedPoint { key, x, y };
                if existing.contains(&key) {
                    update.moved.push(placed);
                } else {
                    update.added.push(placed);
                }
                points.push(placed);
            }
            segment.bounds = new_bounds;
            segment.points = points;
            return update;
        }

        // Incremental: keep retained positions, re-place the ones a
        // shrunken or shifted segment no longer contains, sample only the
        // newcomers.
        let inner = inset(new_bounds);
        let degenerate = inner.width <= 0.0 || inner.height <= 0.0;
        let mut retained: Vec<PlacedPoint> = Vec::with_capacity(desired.len());
        let mut displaced: Vec<PointKey> = Vec::new();
        for p in &segment.points {
            if !desired_set.contains(&p.key) {
                continue;
            }
            let out_of_bounds = if degenerate {
                (p.x, p.y) != new_bounds.center()
            } else {
                !inner.contains_point(p.x, p.y)
            };
            if out_of_bounds {
                displaced.push(p.key);
            } else {
                retained.push(*p);
            }
        }

        let mut sampler = DiskSampler::with_existing(
            new_bounds,
            rng_seed,
            retained.iter().map(|p| (p.x, p.y)),
        );
        for key in displaced {
            let (x, y) = sampler.place_next();
            let placed = PlacedPoint { key, x, y };
            update.moved.push(placed);
            retained.push(placed);
        }
        for key in new_keys {
            let (x, y) = sampler.place_next();
            let placed = PlacedPoint { key, x, y };
            update.added.push(placed);
            retained.push(placed);
        }

        // Keep segment order aligned with the desired key order.
        retained.sort_by_key(|p| {
            desired
                .iter()
                .position(|k| *k == p.key)
                .unwrap_or(usize::MAX)
        });
        segment.bounds = new_bounds;
        segment.points = retained;
        update
    }
}

/// Largest-remainder allocation of `total` slots across groups.
///
/// Floors `proportion * total` per group, then hands the remainder out
/// one slot at a time by descending fractional part; ties prefer the
/// larger proportion, then the smaller group index. Fully deterministic.
pub fn largest_remainder(proportions: &[f64], total: usize) -> Vec<usize> {
    let mut counts: Vec<usize> = Vec::with_capacity(proportions.len());
    let mut fractions: Vec<(usize, f64, f64)> = Vec::with_capacity(proportions.len());
    let mut allocated = 0usize;
    for (i, &p) in proportions.iter().enumerate() {
        let exact = p * total as f64;
        let floor = exact.floor() as usize;
        counts.push(floor);
        allocated += floor;
        fractions.push((i, exact - floor as f64, p));
    }

    fractions.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.0.cmp(&b.0))
    });

    let mut remainder = total.saturating_sub(allocated);
    for (i, _, _) in &fractions {
        if remainder == 0 {
            break;
        }
        counts[*i] += 1;
        remainder -= 1;
    }
    counts
}

/// Derive the deterministic RNG seed of one segment's sampling pass.
fn derive_segment_seed(seed: u64, split: usize, group: usize, generation: u64) -> u64 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..16].copy_from_slice(&(split as u64).to_le_bytes());
    bytes[16..24].copy_from_slice(&(group as u64).to_le_bytes());
    bytes[24..].copy_from_slice(&generation.to_le_bytes());
    xxh3_64(&bytes)
}

/// Inset bounds by the sampling margin.
fn inset(bounds: Bounds) -> Bounds {
    Bounds::new(
        bounds.x + POINT_MARGIN,
        bounds.y + POINT_MARGIN,
        bounds.width - 2.0 * POINT_MARGIN,
        bounds.height - 2.0 * POINT_MARGIN,
    )
}

// ── Poisson-disk sampler ───────────────────────────────────────────────────

/// Bridson-style Poisson-disk sampler over a background grid.
///
/// The grid cell size is `d/√2`; candidate validity consults the 3×3
/// neighborhood around the candidate's cell. Placement never fails: after
/// the annulus and random fallbacks are exhausted the candidate is
/// accepted with overlap, and degenerate bounds collapse every point onto
/// the segment center.
struct DiskSampler {
    /// Sampling region (bounds inset by the margin).
    inner: Bounds,
    /// Center of the original bounds, for the degenerate fallback.
    center: (f64, f64),
    degenerate: bool,
    cell: f64,
    cols: usize,
    rows: usize,
    /// Point indices per grid cell; overlap fallbacks can stack several.
    grid: Vec<Vec<usize>>,
    points: Vec<(f64, f64)>,
    active: Vec<usize>,
    rng: SmallRng,
}

impl DiskSampler {
    fn new(bounds: Bounds, seed: u64) -> Self {
        let inner = inset(bounds);
        let degenerate = inner.width <= 0.0 || inner.height <= 0.0;
        let cell = MIN_POINT_DISTANCE / std::f64::consts::SQRT_2;
        let (cols, rows) = if degenerate {
            (1, 1)
        } else {
            (
                (inner.width / cell).ceil().max(1.0) as usize,
                (inner.height / cell).ceil().max(1.0) as usize,
            )
        };
        Self {
            inner,
            center: bounds.center(),
            degenerate,
            cell,
            cols,
            rows,
            grid: vec![Vec::new(); cols * rows],
            points: Vec::new(),
            active: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    fn with_existing(
        bounds: Bounds,
        seed: u64,
        existing: impl Iterator<Item = (f64, f64)>,
    ) -> Self {
        let mut sampler = Self::new(bounds, seed);
        for (x, y) in existing {
            sampler.insert(x, y);
        }
        sampler
    }

    fn cell_of(&self, x: f64, y: f64) -> (usize, usize) {
        let cx = ((x - self.inner.x) / self.cell).floor().max(0.0) as usize;
        let cy = ((y - self.inner.y) / self.cell).floor().max(0.0) as usize;
        (cx.min(self.cols - 1), cy.min(self.rows - 1))
    }

    fn insert(&mut self, x: f64, y: f64) {
        let index = self.points.len();
        self.points.push((x, y));
        if !self.degenerate {
            let (cx, cy) = self.cell_of(x, y);
            self.grid[cy * self.cols + cx].push(index);
        }
        self.active.push(index);
    }

    /// Whether a candidate keeps the minimum distance to every neighbor
    /// in the 3×3 cells around it.
    fn is_valid(&self, x: f64, y: f64) -> bool {
        if !self.inner.contains_point(x, y) {
            return false;
        }
        let (cx, cy) = self.cell_of(x, y);
        let x0 = cx.saturating_sub(1);
        let y0 = cy.saturating_sub(1);
        let x1 = (cx + 1).min(self.cols - 1);
        let y1 = (cy + 1).min(self.rows - 1);
        for gy in y0..=y1 {
            for gx in x0..=x1 {
                for &i in &self.grid[gy * self.cols + gx] {
                    let (px, py) = self.points[i];
                    let dx = px - x;
                    let dy = py - y;
                    if dx * dx + dy * dy < MIN_POINT_DISTANCE * MIN_POINT_DISTANCE {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn random_in_bounds(&mut self) -> (f64, f64) {
        (
            self.inner.x + self.rng.gen_range(0.0..=1.0) * self.inner.width,
            self.inner.y + self.rng.gen_range(0.0..=1.0) * self.inner.height,
        )
    }

    /// Place the next point and return its position.
    fn place_next(&mut self) -> (f64, f64) {
        if self.degenerate {
            let (x, y) = self.center;
            self.points.push((x, y));
            return (x, y);
        }

        if self.points.is_empty() {
            let (x, y) = self.random_in_bounds();
            self.insert(x, y);
            return (x, y);
        }

        // Bridson: grow from a random active seed.
        while !self.active.is_empty() {
            let slot = self.rng.gen_range(0..self.active.len());
            let (sx, sy) = self.points[self.active[slot]];

            for _ in 0..ANNULUS_ATTEMPTS {
                let angle = self.rng.gen_range(0.0..std::f64::consts::TAU);
                let radius = MIN_POINT_DISTANCE * (1.0 + self.rng.gen_range(0.0..=1.0));
                let x = sx + radius * angle.cos();
                let y = sy + radius * angle.sin();
                if self.is_valid(x, y) {
                    self.insert(x, y);
                    return (x, y);
                }
            }
            // Seed exhausted.
            self.active.swap_remove(slot);
        }

        // Fallback: random placement attempts.
        for _ in 0..RANDOM_ATTEMPTS {
            let (x, y) = self.random_in_bounds();
            if self.is_valid(x, y) {
                self.insert(x, y);
                return (x, y);
            }
        }

        // Last resort: accept overlap.
        let (x, y) = self.random_in_bounds();
        self.insert(x, y);
        (x, y)
    }
}
