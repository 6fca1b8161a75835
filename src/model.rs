//! Session configuration data model.
//!
//! Questions, response groups, splits, and diffs are tagged plain records
//! with structural equality. A question is identified by the triple
//! `(varName, batteryName, subBattery)` and nothing else; a response group
//! by its `(label, values)` pair. Object identity is never used.
//!
//! A session's configuration is immutable after creation. Validation runs
//! once at creation time and enforces the structural invariants the engine
//! relies on: pairwise-disjoint response groups, the expanded-in-collapsed
//! containment invariant, grouping questions present in `questionOrder`,
//! and positive layout parameters.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PollStreamError;

/// Alphabet for session slugs: lowercase alphanumerics.
const SLUG_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a session slug.
pub const SLUG_LEN: usize = 10;

/// Database-style identifier for sessions and respondents.
pub type Id = i64;

// ── Question identity ──────────────────────────────────────────────────────

/// Structural identity of a question: the `(varName, batteryName,
/// subBattery)` triple. Equality on this triple is the sole identity used
/// across configuration, responses, and statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionKey {
    pub var_name: String,
    pub battery_name: String,
    pub sub_battery: String,
}

impl QuestionKey {
    pub fn new(
        var_name: impl Into<String>,
        battery_name: impl Into<String>,
        sub_battery: impl Into<String>,
    ) -> Self {
        Self {
            var_name: var_name.into(),
            battery_name: battery_name.into(),
            sub_battery: sub_battery.into(),
        }
    }
}

impl std::fmt::Display for QuestionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.var_name, self.battery_name, self.sub_battery
        )
    }
}

// ── Response groups ────────────────────────────────────────────────────────

/// A labeled, unordered set of integer response values.
///
/// Identity is the `(label, values)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseGroup {
    pub label: String,
    pub values: BTreeSet<i32>,
}

impl ResponseGroup {
    pub fn new(label: impl Into<String>, values: impl IntoIterator<Item = i32>) -> Self {
        Self {
            label: label.into(),
            values: values.into_iter().collect(),
        }
    }

    /// Whether this group covers the given response value.
    pub fn contains(&self, value: i32) -> bool {
        self.values.contains(&value)
    }
}

/// The visualized response question with its two coexisting group views.
///
/// `expanded` is fine-grained; its value sets need not partition the
/// domain but must be pairwise disjoint. `collapsed` is coarser; every
/// expanded group's value set must be entirely contained in exactly one
/// collapsed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseQuestion {
    pub question: QuestionKey,
    pub expanded: Vec<ResponseGroup>,
    pub collapsed: Vec<ResponseGroup>,
}

impl ResponseQuestion {
    /// Index of the expanded group covering `value`, if any.
    pub fn expanded_group_for(&self, value: i32) -> Option<usize> {
        self.expanded.iter().position(|g| g.contains(value))
    }

    /// Index of the collapsed group containing the given expanded group.
    ///
    /// Relies on the containment invariant; after validation this is
    /// total over expanded indices.
    pub fn collapsed_group_containing(&self, expanded_index: usize) -> Option<usize> {
        let exp = self.expanded.get(expanded_index)?;
        self.collapsed
            .iter()
            .position(|c| exp.values.is_subset(&c.values))
    }

    /// The mapping `expanded index → collapsed index`, in expanded order.
    pub fn collapse_map(&self) -> Vec<usize> {
        (0..self.expanded.len())
            .map(|i| self.collapsed_group_containing(i).unwrap_or(0))
            .collect()
    }
}

/// A grouping question: a question plus a single ordered list of response
/// groups (at least two).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupingQuestion {
    pub question: QuestionKey,
    pub response_groups: Vec<ResponseGroup>,
}

impl GroupingQuestion {
    /// Index of the response group covering `value`, if any.
    pub fn group_for(&self, value: i32) -> Option<usize> {
        self.response_groups.iter().position(|g| g.contains(value))
    }
}

// ── Layout parameters ──────────────────────────────────────────────────────

/// Geometry parameters of the segment-grid visualization, in point radii.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutParams {
    /// Minimum proportion-carrying width inside a segment group.
    pub min_group_available_width: f64,
    /// Minimum height of a segment group.
    pub min_group_height: f64,
    /// Horizontal gap between segment groups.
    pub group_gap_x: f64,
    /// Vertical gap between segment groups.
    pub group_gap_y: f64,
    /// Gap between segments inside a group.
    pub response_gap: f64,
    /// Width floor of every segment.
    pub base_segment_width: f64,
}

impl LayoutParams {
    fn validate(&self) -> Result<(), PollStreamError> {
        if self.min_group_available_width <= 0.0 {
            return Err(PollStreamError::ConfigInvalid(
                "minGroupAvailableWidth must be positive".into(),
            ));
        }
        if self.min_group_height <= 0.0 {
            return Err(PollStreamError::ConfigInvalid(
                "minGroupHeight must be positive".into(),
            ));
        }
        if self.base_segment_width <= 0.0 {
            return Err(PollStreamError::ConfigInvalid(
                "baseSegmentWidth must be positive".into(),
            ));
        }
        if self.group_gap_x < 0.0 || self.group_gap_y < 0.0 || self.response_gap < 0.0 {
            return Err(PollStreamError::ConfigInvalid(
                "gaps must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

// ── Visualization & session configuration ──────────────────────────────────

/// One visualization descriptor: a response question, grouping-question
/// axes, layout parameters, and the optional synthetic sample size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationConfig {
    /// Assigned at session creation; 0 until then.
    #[serde(default)]
    pub id: Id,
    pub response_question: ResponseQuestion,
    pub x: Vec<GroupingQuestion>,
    pub y: Vec<GroupingQuestion>,
    pub layout: LayoutParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_sample_size: Option<usize>,
}

impl VisualizationConfig {
    /// Grouping questions in lattice order: `x` axis first, then `y`.
    pub fn grouping_questions(&self) -> impl Iterator<Item = &GroupingQuestion> {
        self.x.iter().chain(self.y.iter())
    }

    /// Number of grouping questions across both axes.
    pub fn grouping_question_count(&self) -> usize {
        self.x.len() + self.y.len()
    }
}

/// Immutable configuration of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Questions asked of respondents, in presentation order.
    pub question_order: Vec<QuestionKey>,
    pub visualization: VisualizationConfig,
}

impl SessionConfig {
    /// Validate the configuration's structural invariants.
    ///
    /// Called once at session creation; a failure is fatal to the request.
    pub fn validate(&self) -> Result<(), PollStreamError> {
        let viz = &self.visualization;
        let order: HashSet<&QuestionKey> = self.question_order.iter().collect();

        // Grouping questions must appear in questionOrder.
        for gq in viz.grouping_questions() {
            if !order.contains(&gq.question) {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "grouping question {} referenced in visualizations but not in questionOrder",
                    gq.question
                )));
            }
        }

        // Axes must be disjoint.
        let x_keys: HashSet<&QuestionKey> = viz.x.iter().map(|g| &g.question).collect();
        for gq in &viz.y {
            if x_keys.contains(&gq.question) {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "grouping question {} appears on both axes",
                    gq.question
                )));
            }
        }

        // Each grouping question needs at least two pairwise-disjoint groups.
        for gq in viz.grouping_questions() {
            if gq.response_groups.len() < 2 {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "grouping question {} must have at least 2 response groups",
                    gq.question
                )));
            }
            validate_disjoint(&gq.response_groups, &gq.question)?;
        }

        // Response question: expanded groups disjoint, each contained in
        // exactly one collapsed group.
        let rq = &viz.response_question;
        if rq.expanded.is_empty() || rq.collapsed.is_empty() {
            return Err(PollStreamError::ConfigInvalid(format!(
                "response question {} must have expanded and collapsed groups",
                rq.question
            )));
        }
        validate_disjoint(&rq.expanded, &rq.question)?;
        for (i, exp) in rq.expanded.iter().enumerate() {
            if exp.values.is_empty() {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "expanded group '{}' of {} has no values",
                    exp.label, rq.question
                )));
            }
            let containers = rq
                .collapsed
                .iter()
                .filter(|c| exp.values.is_subset(&c.values))
                .count();
            if containers != 1 {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "expanded group '{}' (index {}) of {} must be contained in exactly \
                     one collapsed group, found {}",
                    exp.label, i, rq.question, containers
                )));
            }
        }

        viz.layout.validate()?;

        if let Some(n) = viz.synthetic_sample_size
            && n == 0
        {
            return Err(PollStreamError::ConfigInvalid(
                "syntheticSampleSize must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Validate a submission's answers against the configuration.
    ///
    /// Rejects unknown questions and duplicate answers; the whole
    /// submission fails. Missing answers are allowed: partial respondents
    /// are persisted, they just never move the visualization.
    pub fn validate_answers(&self, answers: &[Answer]) -> Result<(), PollStreamError> {
        let order: HashSet<&QuestionKey> = self.question_order.iter().collect();
        let mut seen: HashSet<&QuestionKey> = HashSet::new();
        for answer in answers {
            if !order.contains(&answer.question) {
                return Err(PollStreamError::IngestRejected(format!(
                    "unknown question {}",
                    answer.question
                )));
            }
            if !seen.insert(&answer.question) {
                return Err(PollStreamError::IngestRejected(format!(
                    "duplicate answer for question {}",
                    answer.question
                )));
            }
        }
        Ok(())
    }
}

// ── Respondents ────────────────────────────────────────────────────────────

/// One answer of a respondent. `response_index` is `None` when the
/// respondent skipped the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(flatten)]
    pub question: QuestionKey,
    pub response_index: Option<i32>,
}

impl Answer {
    pub fn new(question: QuestionKey, response_index: Option<i32>) -> Self {
        Self {
            question,
            response_index,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// One respondent's submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Respondent {
    pub id: Id,
    /// Sampling weight; defaults to 1.0.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub answers: Vec<Answer>,
}

impl Respondent {
    pub fn new(id: Id, answers: Vec<Answer>) -> Self {
        Self {
            id,
            weight: 1.0,
            answers,
        }
    }

    /// The respondent's answer to `question`, flattened: `None` when the
    /// question was skipped or not answered at all.
    pub fn response_to(&self, question: &QuestionKey) -> Option<i32> {
        self.answers
            .iter()
            .find(|a| &a.question == question)
            .and_then(|a| a.response_index)
    }
}

// ── Session record ─────────────────────────────────────────────────────────

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Id,
    /// Ten lowercase alphanumerics; the public submission handle.
    pub slug: String,
    pub description: String,
    pub is_open: bool,
    pub session_config: SessionConfig,
    pub created_at: DateTime<Utc>,
}

/// Generate a session slug: [`SLUG_LEN`] lowercase alphanumerics.
pub fn generate_slug<R: Rng>(rng: &mut R) -> String {
    (0..SLUG_LEN)
        .map(|_| SLUG_ALPHABET[rng.gen_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

/// Check that a list of response groups is pairwise disjoint.
fn validate_disjoint(groups: &[ResponseGroup], question: &QuestionKey) -> Result<(), PollStreamError> {
    let mut seen: BTreeSet<i32> = BTreeSet::new();
    for group in groups {
        for v in &group.values {
            if !seen.insert(*v) {
                return Err(PollStreamError::ConfigInvalid(format!(
                    "response value {} of {} appears in more than one group",
                    v, question
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn qk(name: &str) -> QuestionKey {
        QuestionKey::new(name, "battery", "")
    }

    fn grouping(name: &str, groups: &[(&str, &[i32])]) -> GroupingQuestion {
        GroupingQuestion {
            question: qk(name),
            response_groups: groups
                .iter()
                .map(|(label, values)| ResponseGroup::new(*label, values.iter().copied()))
                .collect(),
        }
    }

    fn layout() -> LayoutParams {
        LayoutParams {
            min_group_available_width: 40.0,
            min_group_height: 30.0,
            group_gap_x: 4.0,
            group_gap_y: 4.0,
            response_gap: 2.0,
            base_segment_width: 3.0,
        }
    }

    fn response_question() -> ResponseQuestion {
        ResponseQuestion {
            question: qk("satisfaction"),
            expanded: vec![
                ResponseGroup::new("very_low", [0]),
                ResponseGroup::new("low", [1]),
                ResponseGroup::new("mid", [2]),
                ResponseGroup::new("high", [3]),
                ResponseGroup::new("very_high", [4]),
            ],
            collapsed: vec![
                ResponseGroup::new("low", [0, 1]),
                ResponseGroup::new("mid", [2]),
                ResponseGroup::new("high", [3, 4]),
            ],
        }
    }

    fn valid_config() -> SessionConfig {
        SessionConfig {
            question_order: vec![qk("satisfaction"), qk("gender"), qk("race"), qk("age")],
            visualization: VisualizationConfig {
                id: 0,
                response_question: response_question(),
                x: vec![grouping("gender", &[("m", &[0]), ("f", &[1])])],
                y: vec![grouping("age", &[("young", &[0, 1]), ("old", &[2, 3])])],
                layout: layout(),
                synthetic_sample_size: None,
            },
        }
    }

    // ── QuestionKey identity ────────────────────────────────────────

    #[test]
    fn test_question_key_structural_equality() {
        let a = QuestionKey::new("q1", "b1", "s1");
        let b = QuestionKey::new("q1", "b1", "s1");
        let c = QuestionKey::new("q1", "b1", "s2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_question_key_serde_camel_case() {
        let key = QuestionKey::new("q", "b", "s");
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("varName"));
        assert!(json.contains("batteryName"));
        assert!(json.contains("subBattery"));
    }

    // ── Response groups ─────────────────────────────────────────────

    #[test]
    fn test_expanded_group_lookup() {
        let rq = response_question();
        assert_eq!(rq.expanded_group_for(0), Some(0));
        assert_eq!(rq.expanded_group_for(4), Some(4));
        assert_eq!(rq.expanded_group_for(5), None);
        assert_eq!(rq.expanded_group_for(-1), None);
    }

    #[test]
    fn test_collapsed_containment_lookup() {
        let rq = response_question();
        assert_eq!(rq.collapsed_group_containing(0), Some(0));
        assert_eq!(rq.collapsed_group_containing(1), Some(0));
        assert_eq!(rq.collapsed_group_containing(2), Some(1));
        assert_eq!(rq.collapsed_group_containing(3), Some(2));
        assert_eq!(rq.collapsed_group_containing(4), Some(2));
        assert_eq!(rq.collapsed_group_containing(5), None);
    }

    #[test]
    fn test_collapse_map() {
        let rq = response_question();
        assert_eq!(rq.collapse_map(), vec![0, 0, 1, 2, 2]);
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_grouping_question_missing_from_order() {
        let mut config = valid_config();
        config.question_order.retain(|q| q.var_name != "gender");
        let err = config.validate().unwrap_err();
        assert!(
            format!("{err}").contains("referenced in visualizations but not in questionOrder"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn test_axes_must_be_disjoint() {
        let mut config = valid_config();
        config.visualization.y = config.visualization.x.clone();
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("both axes"));
    }

    #[test]
    fn test_grouping_needs_two_groups() {
        let mut config = valid_config();
        config.visualization.x[0].response_groups.truncate(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grouping_groups_must_be_disjoint() {
        let mut config = valid_config();
        config.visualization.x[0] = grouping("gender", &[("m", &[0, 1]), ("f", &[1, 2])]);
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("more than one group"));
    }

    #[test]
    fn test_expanded_must_be_in_exactly_one_collapsed() {
        let mut config = valid_config();
        // Drop the collapsed group containing expanded value 2.
        config.visualization.response_question.collapsed =
            vec![ResponseGroup::new("low", [0, 1]), ResponseGroup::new("high", [3, 4])];
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("exactly"));
    }

    #[test]
    fn test_layout_params_ranges() {
        let mut config = valid_config();
        config.visualization.layout.base_segment_width = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.visualization.layout.response_gap = -1.0;
        assert!(config.validate().is_err());

        // responseGap of zero is accepted.
        let mut config = valid_config();
        config.visualization.layout.response_gap = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_synthetic_sample_rejected() {
        let mut config = valid_config();
        config.visualization.synthetic_sample_size = Some(0);
        assert!(config.validate().is_err());
    }

    // ── Answer validation ───────────────────────────────────────────

    #[test]
    fn test_unknown_question_rejected() {
        let config = valid_config();
        let err = config
            .validate_answers(&[Answer::new(qk("mystery"), Some(1))])
            .unwrap_err();
        assert!(matches!(err, PollStreamError::IngestRejected(_)));
    }

    #[test]
    fn test_duplicate_answer_rejected() {
        let config = valid_config();
        let answers = vec![
            Answer::new(qk("gender"), Some(0)),
            Answer::new(qk("gender"), Some(1)),
        ];
        let err = config.validate_answers(&answers).unwrap_err();
        assert!(format!("{err}").contains("duplicate"));
    }

    #[test]
    fn test_partial_answers_allowed() {
        let config = valid_config();
        config
            .validate_answers(&[Answer::new(qk("gender"), None)])
            .unwrap();
        config.validate_answers(&[]).unwrap();
    }

    // ── Respondent helpers ──────────────────────────────────────────

    #[test]
    fn test_response_to_flattens_missing_and_null() {
        let r = Respondent::new(
            1,
            vec![
                Answer::new(qk("gender"), Some(1)),
                Answer::new(qk("age"), None),
            ],
        );
        assert_eq!(r.response_to(&qk("gender")), Some(1));
        assert_eq!(r.response_to(&qk("age")), None);
        assert_eq!(r.response_to(&qk("race")), None);
        assert_eq!(r.weight, 1.0);
    }

    // ── Slug generation ─────────────────────────────────────────────

    #[test]
    fn test_slug_shape() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..50 {
            let slug = generate_slug(&mut rng);
            assert_eq!(slug.len(), SLUG_LEN);
            assert!(
                slug.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()),
                "bad slug: {slug}"
            );
        }
    }

    #[test]
    fn test_slug_deterministic_for_seed() {
        let mut a = SmallRng::seed_from_u64(42);
        let mut b = SmallRng::seed_from_u64(42);
        assert_eq!(generate_slug(&mut a), generate_slug(&mut b));
    }
}
