//! Statistics engine — per-split response-question tallies under
//! streaming arrivals.
//!
//! For every split and every response question, the engine maintains
//! expanded and collapsed response-group tallies. Ingest is single-writer
//! per session: a batch of respondents is applied atomically between
//! ticks, and the engine is quiescent and consistent between batches.
//!
//! A respondent moves statistics only when its grouping profile is
//! complete (every grouping question answered with a value covered by a
//! group) and its response on a response question falls inside an
//! expanded group. A skipped or out-of-range answer anywhere leaves every
//! tally untouched and produces no delta. The respondent is still
//! persisted by the caller; there is no error channel for "your response
//! did not affect the chart".
//!
//! Each batch yields [`SplitDelta`]s listing only the entries whose counts
//! actually changed, in split-index order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::lattice::SplitLattice;
use crate::error::PollStreamError;
use crate::model::{GroupingQuestion, QuestionKey, Respondent, ResponseQuestion};

/// Which response-group view a computation runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupView {
    Expanded,
    Collapsed,
}

/// Count and weighted count of one response group in one split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub total_count: u64,
    pub total_weight: f64,
}

impl Tally {
    fn add(&mut self, weight: f64) {
        self.total_count += 1;
        self.total_weight += weight;
    }
}

/// Tallies of one response question within one split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTallies {
    pub expanded: Vec<Tally>,
    pub collapsed: Vec<Tally>,
    /// Respondents with a complete profile whose response fell in no
    /// expanded group. Only enters proportion denominators when the
    /// engine's `count_partial_in_denominator` flag is set.
    pub unclassified: Tally,
}

impl QuestionTallies {
    fn new(expanded_len: usize, collapsed_len: usize) -> Self {
        Self {
            expanded: vec![Tally::default(); expanded_len],
            collapsed: vec![Tally::default(); collapsed_len],
            unclassified: Tally::default(),
        }
    }

    /// Total respondent count across expanded groups.
    pub fn total_count(&self) -> u64 {
        self.expanded.iter().map(|t| t.total_count).sum()
    }
}

/// A changed expanded-group count within one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChange {
    pub response_group_label: String,
    pub count_before: u64,
    pub count_after: u64,
}

/// Changes of one response question within one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseQuestionChange {
    pub response_question_key: QuestionKey,
    pub expanded_group_changes: Vec<GroupChange>,
}

/// Per-split delta produced by one batch. Only changed entries appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDelta {
    pub split_index: usize,
    pub response_question_changes: Vec<ResponseQuestionChange>,
}

/// Streaming tally state for one visualization.
///
/// Serializable as-is: the persisted snapshot blob carries the full tally
/// state, and a restored engine continues exactly where the flushed one
/// stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEngine {
    /// Response questions tallied per split. Only one is visualized, but
    /// the engine handles the generalization.
    questions: Vec<ResponseQuestion>,
    /// Grouping questions in lattice order (x axis then y).
    grouping: Vec<GroupingQuestion>,
    /// Per response question: expanded index → collapsed index.
    collapse_maps: Vec<Vec<usize>>,
    /// Per split, per response question.
    splits: Vec<Vec<QuestionTallies>>,
    /// When set, respondents with a complete profile but no classifiable
    /// response still enter proportion denominators.
    count_partial_in_denominator: bool,
}

impl StatsEngine {
    /// Create a zeroed engine for the given lattice and questions.
    pub fn new(
        lattice: &SplitLattice,
        questions: Vec<ResponseQuestion>,
        grouping: Vec<GroupingQuestion>,
    ) -> Self {
        let collapse_maps: Vec<Vec<usize>> = questions.iter().map(|q| q.collapse_map()).collect();
        let splits = (0..lattice.len())
            .map(|_| {
                questions
                    .iter()
                    .map(|q| QuestionTallies::new(q.expanded.len(), q.collapsed.len()))
                    .collect()
            })
            .collect();
        Self {
            questions,
            grouping,
            collapse_maps,
            splits,
            count_partial_in_denominator: false,
        }
    }

    /// Enable the denominator-only accounting of profile-complete
    /// respondents with unclassifiable responses.
    pub fn with_partial_in_denominator(mut self) -> Self {
        self.count_partial_in_denominator = true;
        self
    }

    pub fn questions(&self) -> &[ResponseQuestion] {
        &self.questions
    }

    /// Tallies of one response question within one split.
    pub fn tallies(&self, split_index: usize, question_index: usize) -> &QuestionTallies {
        &self.splits[split_index][question_index]
    }

    /// Total count of one response question within one split.
    pub fn total_count(&self, split_index: usize, question_index: usize) -> u64 {
        self.splits[split_index][question_index].total_count()
    }

    /// Per-group proportions of a split in the given view.
    ///
    /// All zeros when the split has no classified respondents; otherwise
    /// the proportions sum to 1 (unless the denominator flag admits
    /// unclassified respondents).
    pub fn proportions(
        &self,
        split_index: usize,
        question_index: usize,
        view: GroupView,
    ) -> Vec<f64> {
        let tallies = &self.splits[split_index][question_index];
        let groups = match view {
            GroupView::Expanded => &tallies.expanded,
            GroupView::Collapsed => &tallies.collapsed,
        };
        let mut denominator: u64 = groups.iter().map(|t| t.total_count).sum();
        if self.count_partial_in_denominator {
            denominator += tallies.unclassified.total_count;
        }
        if denominator == 0 {
            return vec![0.0; groups.len()];
        }
        groups
            .iter()
            .map(|t| t.total_count as f64 / denominator as f64)
            .collect()
    }

    /// Resolve a respondent's grouping profile: one group index per
    /// grouping question, or `None` when any answer is missing, null, or
    /// covered by no group.
    pub fn profile_of(&self, respondent: &Respondent) -> Option<Vec<usize>> {
        self.grouping
            .iter()
            .map(|gq| {
                respondent
                    .response_to(&gq.question)
                    .and_then(|v| gq.group_for(v))
            })
            .collect()
    }

    /// Apply a batch of respondents, in arrival order.
    ///
    /// Returns the per-split deltas for every affected split, ordered by
    /// split index. Splits whose counts did not change do not appear.
    pub fn apply_batch(
        &mut self,
        lattice: &SplitLattice,
        respondents: &[Respondent],
    ) -> Vec<SplitDelta> {
        // (split, question, expanded group) → count before this batch.
        let mut before: BTreeMap<(usize, usize, usize), u64> = BTreeMap::new();

        for respondent in respondents {
            let Some(profile) = self.profile_of(respondent) else {
                continue;
            };
            let Some(basis) = lattice.basis_index_for_profile(&profile) else {
                continue;
            };

            for qi in 0..self.questions.len() {
                let group = respondent
                    .response_to(&self.questions[qi].question)
                    .and_then(|v| self.questions[qi].expanded_group_for(v));

                match group {
                    Some(g) => {
                        let collapsed = self.collapse_maps[qi][g];
                        for &split in lattice.containing_splits(basis) {
                            before
                                .entry((split, qi, g))
                                .or_insert(self.splits[split][qi].expanded[g].total_count);
                            let tallies = &mut self.splits[split][qi];
                            tallies.expanded[g].add(respondent.weight);
                            tallies.collapsed[collapsed].add(respondent.weight);
                        }
                    }
                    None if self.count_partial_in_denominator => {
                        for &split in lattice.containing_splits(basis) {
                            self.splits[split][qi].unclassified.add(respondent.weight);
                        }
                    }
                    None => {}
                }
            }
        }

        self.build_deltas(before)
    }

    /// Assemble [`SplitDelta`]s from the recorded before-counts, dropping
    /// entries whose counts ended where they started.
    fn build_deltas(&self, before: BTreeMap<(usize, usize, usize), u64>) -> Vec<SplitDelta> {
        let mut deltas: Vec<SplitDelta> = Vec::new();
        for ((split, qi, g), count_before) in before {
            let count_after = self.splits[split][qi].expanded[g].total_count;
            if count_after == count_before {
                continue;
            }
            let change = GroupChange {
                response_group_label: self.questions[qi].expanded[g].label.clone(),
                count_before,
                count_after,
            };

            // BTreeMap iteration is ordered, so the current split/question
            // entries are always at the tail.
            let key = &self.questions[qi].question;
            match deltas.last_mut() {
                Some(delta) if delta.split_index == split => {
                    match delta.response_question_changes.last_mut() {
                        Some(qc) if &qc.response_question_key == key => {
                            qc.expanded_group_changes.push(change);
                        }
                        _ => delta.response_question_changes.push(ResponseQuestionChange {
                            response_question_key: key.clone(),
                            expanded_group_changes: vec![change],
                        }),
                    }
                }
                _ => deltas.push(SplitDelta {
                    split_index: split,
                    response_question_changes: vec![ResponseQuestionChange {
                        response_question_key: key.clone(),
                        expanded_group_changes: vec![change],
                    }],
                }),
            }
        }
        deltas
    }

    /// Verify the cross-split consistency invariants.
    ///
    /// - Every non-basis split's expanded counts equal the sum over its
    ///   basis splits.
    /// - Every collapsed tally equals the sum of the expanded tallies it
    ///   contains.
    ///
    /// A failure aborts the tick that detected it; the session keeps
    /// accepting writes and the next tick re-derives state.
    pub fn check_invariants(&self, lattice: &SplitLattice) -> Result<(), PollStreamError> {
        for (qi, question) in self.questions.iter().enumerate() {
            for split in 0..lattice.len() {
                if lattice.split(split).is_basis() {
                    continue;
                }
                for g in 0..question.expanded.len() {
                    let own = self.splits[split][qi].expanded[g].total_count;
                    let summed: u64 = lattice
                        .basis_of(split)
                        .iter()
                        .map(|&b| self.splits[b][qi].expanded[g].total_count)
                        .sum();
                    if own != summed {
                        return Err(PollStreamError::InternalInvariantViolation(format!(
                            "split {split} group {g} count {own} != basis sum {summed}"
                        )));
                    }
                }
            }

            let collapse_map = &self.collapse_maps[qi];
            for split in 0..lattice.len() {
                for (c, collapsed) in self.splits[split][qi].collapsed.iter().enumerate() {
                    let summed: u64 = self.splits[split][qi]
                        .expanded
                        .iter()
                        .enumerate()
                        .filter(|(g, _)| collapse_map[*g] == c)
                        .map(|(_, t)| t.total_count)
                        .sum();
                    if collapsed.total_count != summed {
                        return Err(PollStreamError::InternalInvariantViolation(format!(
                            "split {split} collapsed group {c} count {} != expanded sum {summed}",
                            collapsed.total_count
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
