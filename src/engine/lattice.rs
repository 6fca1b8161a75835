//! Split lattice — enumeration of grouping-question combinations.
//!
//! A *split* is an ordered list of group selections, one per grouping
//! question in `x ++ y`, where each entry is either a response-group index
//! or `None` ("any"). A *basis split* has no `None` entries; every other
//! split's statistics are the sum over the basis splits it contains.
//!
//! The enumeration is a mixed-radix cartesian product: for each grouping
//! question the alternatives are its groups in configured order followed by
//! the `None` alternative, and earlier questions vary slowest. The order is
//! deterministic and part of the on-wire identity of splits — consumers
//! reference splits by index into this enumeration.
//!
//! Views select which grouping questions are active. The `viewId` encoding
//! (sorted, comma-separated active positions; empty string for the all-null
//! base view) is the sole contract between the engine and consumers that
//! reference views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::VisualizationConfig;

/// One split: per grouping question, a group index or `None` for "any".
///
/// The grouping questions are implied by position (x axis first, then y).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Split(pub Vec<Option<usize>>);

impl Split {
    /// A basis split has no "any" entries.
    pub fn is_basis(&self) -> bool {
        self.0.iter().all(|g| g.is_some())
    }

    /// `self` contains `basis` iff every position is either "any" or
    /// equal to the basis entry. A basis split contains itself.
    pub fn contains(&self, basis: &Split) -> bool {
        self.0
            .iter()
            .zip(basis.0.iter())
            .all(|(s, b)| s.is_none() || s == b)
    }

    /// Positions with a concrete group selection.
    pub fn active_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_some())
            .map(|(i, _)| i)
    }
}

/// Lookup maps persisted alongside the visualization state. Rebuilt from
/// the split list on restore, never stored as owning references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupMaps {
    /// Response value (as decimal string) → expanded group index on the
    /// visualized response question.
    pub response_index_to_group_index: BTreeMap<String, usize>,
    /// Basis profile `"g0:g1:…"` → split index.
    pub profile_to_split_index: BTreeMap<String, usize>,
}

/// The full lattice of splits for one visualization, fixed at session
/// creation.
#[derive(Debug, Clone)]
pub struct SplitLattice {
    /// Group count per grouping question, in `x ++ y` order.
    group_counts: Vec<usize>,
    /// Number of grouping questions on the x axis.
    x_len: usize,
    splits: Vec<Split>,
    /// Indices of basis splits, in enumeration order.
    basis_indices: Vec<usize>,
    /// Per split: indices of the basis splits it contains.
    basis_of: Vec<Vec<usize>>,
    /// Per split: indices of the splits that contain it. Only populated
    /// for basis splits (used for ingest propagation).
    containing: Vec<Vec<usize>>,
    /// viewId → split indices, covering all `2^n` views.
    view_map: BTreeMap<String, Vec<usize>>,
}

impl SplitLattice {
    /// Enumerate the lattice for a visualization.
    pub fn build(viz: &VisualizationConfig) -> Self {
        let group_counts: Vec<usize> = viz
            .grouping_questions()
            .map(|g| g.response_groups.len())
            .collect();
        let x_len = viz.x.len();
        Self::from_group_counts(group_counts, x_len)
    }

    /// Build from raw group counts (x-axis questions first).
    pub fn from_group_counts(group_counts: Vec<usize>, x_len: usize) -> Self {
        debug_assert!(x_len <= group_counts.len());

        // Mixed-radix odometer over `group_count + 1` alternatives per
        // question; the last question varies fastest. Alternative `g` for
        // g < group_count selects that group, `group_count` selects "any".
        let total: usize = group_counts.iter().map(|c| c + 1).product();
        let mut splits = Vec::with_capacity(total);
        let mut digits = vec![0usize; group_counts.len()];
        for _ in 0..total {
            let entries = digits
                .iter()
                .zip(group_counts.iter())
                .map(|(&d, &c)| if d < c { Some(d) } else { None })
                .collect();
            splits.push(Split(entries));

            for pos in (0..digits.len()).rev() {
                digits[pos] += 1;
                if digits[pos] <= group_counts[pos] {
                    break;
                }
                digits[pos] = 0;
            }
        }

        let basis_indices: Vec<usize> = splits
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_basis())
            .map(|(i, _)| i)
            .collect();

        let mut basis_of = Vec::with_capacity(splits.len());
        let mut containing = vec![Vec::new(); splits.len()];
        for (i, split) in splits.iter().enumerate() {
            let contained: Vec<usize> = basis_indices
                .iter()
                .copied()
                .filter(|&b| split.contains(&splits[b]))
                .collect();
            for &b in &contained {
                containing[b].push(i);
            }
            basis_of.push(contained);
        }

        let mut view_map: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, split) in splits.iter().enumerate() {
            view_map.entry(view_id_of(split)).or_default().push(i);
        }

        Self {
            group_counts,
            x_len,
            splits,
            basis_indices,
            basis_of,
            containing,
            view_map,
        }
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    pub fn split(&self, index: usize) -> &Split {
        &self.splits[index]
    }

    /// Indices of all basis splits, in enumeration order.
    pub fn basis_indices(&self) -> &[usize] {
        &self.basis_indices
    }

    /// The basis splits contained by split `index`. For a basis split this
    /// lists the split itself; for the fully-null split it lists every
    /// basis split.
    pub fn basis_of(&self, index: usize) -> &[usize] {
        &self.basis_of[index]
    }

    /// The splits containing basis split `basis_index` (including itself).
    pub fn containing_splits(&self, basis_index: usize) -> &[usize] {
        &self.containing[basis_index]
    }

    /// viewId → split indices for all `2^n` views.
    pub fn view_map(&self) -> &BTreeMap<String, Vec<usize>> {
        &self.view_map
    }

    /// The viewId of split `index`.
    pub fn view_id(&self, index: usize) -> String {
        view_id_of(&self.splits[index])
    }

    /// Resolve a complete grouping profile (one group index per question)
    /// to its basis split index. Returns `None` when a digit is out of
    /// range or the profile length does not match.
    pub fn basis_index_for_profile(&self, profile: &[usize]) -> Option<usize> {
        if profile.len() != self.group_counts.len() {
            return None;
        }
        let mut index = 0usize;
        for (digit, count) in profile.iter().zip(self.group_counts.iter()) {
            if digit >= count {
                return None;
            }
            index = index * (count + 1) + digit;
        }
        Some(index)
    }

    /// Grid cell of a split within its view: column from the active
    /// x-axis selections, row from the active y-axis selections, each via
    /// the cartesian enumeration (earlier questions vary slowest).
    pub fn cell_of(&self, index: usize) -> (usize, usize) {
        let split = &self.splits[index];
        let mut col = 0usize;
        for pos in 0..self.x_len {
            if let Some(g) = split.0[pos] {
                col = col * self.group_counts[pos] + g;
            }
        }
        let mut row = 0usize;
        for pos in self.x_len..self.group_counts.len() {
            if let Some(g) = split.0[pos] {
                row = row * self.group_counts[pos] + g;
            }
        }
        (col, row)
    }

    /// Grid shape `(columns, rows)` of the view a split belongs to:
    /// products of group counts over the active positions of each axis
    /// (1 for an axis with no active questions).
    pub fn view_shape_of(&self, index: usize) -> (usize, usize) {
        let split = &self.splits[index];
        let mut cols = 1usize;
        let mut rows = 1usize;
        for pos in split.active_positions() {
            if pos < self.x_len {
                cols *= self.group_counts[pos];
            } else {
                rows *= self.group_counts[pos];
            }
        }
        (cols, rows)
    }

    /// Grid shape of the maximum view (every grouping question active).
    pub fn max_view_shape(&self) -> (usize, usize) {
        let cols = self.group_counts[..self.x_len].iter().product();
        let rows = self.group_counts[self.x_len..].iter().product();
        (cols, rows)
    }

    /// Build the persisted lookup maps for this lattice.
    pub fn lookup_maps(&self, viz: &VisualizationConfig) -> LookupMaps {
        let mut response_index_to_group_index = BTreeMap::new();
        for (g, group) in viz.response_question.expanded.iter().enumerate() {
            for value in &group.values {
                response_index_to_group_index.insert(value.to_string(), g);
            }
        }

        let mut profile_to_split_index = BTreeMap::new();
        for &b in &self.basis_indices {
            let profile: Vec<String> = self.splits[b]
                .0
                .iter()
                .map(|g| g.unwrap_or_default().to_string())
                .collect();
            profile_to_split_index.insert(profile.join(":"), b);
        }

        LookupMaps {
            response_index_to_group_index,
            profile_to_split_index,
        }
    }
}

/// Encode a split's view: sorted comma-separated active positions, the
/// empty string for the all-null base view.
pub fn view_id_of(split: &Split) -> String {
    let positions: Vec<String> = split.active_positions().map(|p| p.to_string()).collect();
    positions.join(",")
}
