//! Shared fixtures for integration tests.
//!
//! The standard session asks four questions — satisfaction (the
//! visualized response question, expanded groups 0..4), gender, race,
//! and age (the grouping questions) — mirroring a typical live-polling
//! deployment.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pollstream::config::Settings;
use pollstream::model::{
    Answer, GroupingQuestion, LayoutParams, QuestionKey, ResponseGroup, ResponseQuestion,
    SessionConfig, VisualizationConfig,
};
use pollstream::registry::SessionRegistry;
use pollstream::store::MemoryStore;

pub fn qk(name: &str) -> QuestionKey {
    QuestionKey::new(name, "wave1", "")
}

pub fn satisfaction() -> ResponseQuestion {
    ResponseQuestion {
        question: qk("satisfaction"),
        expanded: (0..5)
            .map(|v| ResponseGroup::new(format!("sat{v}"), [v]))
            .collect(),
        collapsed: vec![
            ResponseGroup::new("dissatisfied", [0, 1]),
            ResponseGroup::new("neutral", [2]),
            ResponseGroup::new("satisfied", [3, 4]),
        ],
    }
}

pub fn grouping(name: &str, groups: &[(&str, &[i32])]) -> GroupingQuestion {
    GroupingQuestion {
        question: qk(name),
        response_groups: groups
            .iter()
            .map(|(label, values)| ResponseGroup::new(*label, values.iter().copied()))
            .collect(),
    }
}

pub fn layout_params() -> LayoutParams {
    LayoutParams {
        min_group_available_width: 40.0,
        min_group_height: 30.0,
        group_gap_x: 4.0,
        group_gap_y: 4.0,
        response_gap: 2.0,
        base_segment_width: 3.0,
    }
}

/// Four questions, one visualization: gender on x; race and age on y.
pub fn standard_config() -> SessionConfig {
    SessionConfig {
        question_order: vec![qk("satisfaction"), qk("gender"), qk("race"), qk("age")],
        visualization: VisualizationConfig {
            id: 0,
            response_question: satisfaction(),
            x: vec![grouping("gender", &[("man", &[0]), ("woman", &[1])])],
            y: vec![
                grouping("race", &[("white", &[0]), ("nonwhite", &[1])]),
                grouping("age", &[("young", &[0, 1]), ("older", &[2, 3])]),
            ],
            layout: layout_params(),
            synthetic_sample_size: None,
        },
    }
}

/// A complete in-range submission.
pub fn answers(sat: i32, gender: i32, race: i32, age: i32) -> Vec<Answer> {
    vec![
        Answer::new(qk("satisfaction"), Some(sat)),
        Answer::new(qk("gender"), Some(gender)),
        Answer::new(qk("race"), Some(race)),
        Answer::new(qk("age"), Some(age)),
    ]
}

/// Runtime settings with a fast tick for tests.
pub fn test_registry_settings() -> Settings {
    Settings::default()
        .with_batch_update_interval(Duration::from_millis(25))
        .with_session_idle_timeout(Duration::from_secs(3600))
}

/// Registry over a fresh memory store with a fast tick for tests.
pub fn test_registry() -> SessionRegistry<MemoryStore> {
    SessionRegistry::with_slug_seed(Arc::new(MemoryStore::new()), test_registry_settings(), 1234)
}
