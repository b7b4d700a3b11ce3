//! Graph and template fixtures.

use horde_core::ids::{StreamId, TemplateId};
use horde_core::job::{ChainedJobTemplate, Priority};
use horde_core::ports::{ChangeQuery, ConditionalChangeQuery, TemplateConfig};
use horde_scheduler::{NewGroup, NewLabel, NewNode, StartJobRequest};

pub const STREAM: &str = "//UE5/Main";

/// Factory for graphs used across the scenario tests.
pub struct GraphFixture;

impl GraphFixture {
    /// `[Step1]`, `[Step2 <- Step1, Step3 <- Step2]`.
    pub fn chain() -> Vec<NewGroup> {
        vec![
            NewGroup::new("Win64", vec![NewNode::new("Step1")]),
            NewGroup::new(
                "Win64",
                vec![
                    NewNode::new("Step2").after("Step1"),
                    NewNode::new("Step3").after("Step2"),
                ],
            ),
        ]
    }

    /// A typical editor and client build with a speculative cook.
    pub fn editor_and_client() -> Vec<NewGroup> {
        vec![
            NewGroup::new("Win64", vec![NewNode::new("Setup Build")]),
            NewGroup::new(
                "Win64",
                vec![
                    NewNode::new("Update Version Files"),
                    NewNode::new("Compile Editor").after("Update Version Files"),
                ],
            ),
            NewGroup::new(
                "Win64",
                vec![NewNode::new("Compile Client").after("Update Version Files")],
            ),
            NewGroup::new(
                "Win64",
                vec![
                    NewNode::new("Cook Client").after("Compile Editor").run_early(),
                    NewNode::new("Publish Client")
                        .after("Compile Client")
                        .after("Cook Client"),
                    NewNode::new("Post Publish").ordered_after("Publish Client"),
                ],
            ),
        ]
    }

    /// Two groups of two steps each.
    pub fn two_groups() -> Vec<NewGroup> {
        vec![
            NewGroup::new(
                "Win64",
                vec![NewNode::new("Compile Editor"), NewNode::new("Compile Tools")],
            ),
            NewGroup::new(
                "Win64",
                vec![
                    NewNode::new("Cook Game").after("Compile Editor"),
                    NewNode::new("Run Tests").after("Compile Tools"),
                ],
            ),
        ]
    }

    /// Labels spread over [`GraphFixture::two_groups`].
    pub fn two_group_labels() -> Vec<NewLabel> {
        vec![
            NewLabel::new("Editor", &["Compile Editor"]).with_category("Binaries"),
            NewLabel::new("Tools", &["Compile Tools"]).with_category("Binaries"),
            NewLabel::new("Game", &["Cook Game"])
                .with_category("Content")
                .including(&["Compile Editor", "Cook Game"]),
            NewLabel::new("Tests", &["Run Tests", "Cook Game"]).with_category("Tests"),
        ]
    }

    /// `[Setup]`, `[Split]`, `[Gather <- Split]`, `[Publish <- Gather]`.
    pub fn split_gather() -> Vec<NewGroup> {
        vec![
            NewGroup::new("Win64", vec![NewNode::new("Setup")]),
            NewGroup::new("Win64", vec![NewNode::new("Split").after("Setup")]),
            NewGroup::new("Win64", vec![NewNode::new("Gather").after("Split")]),
            NewGroup::new("Win64", vec![NewNode::new("Publish").after("Gather")]),
        ]
    }

    /// [`GraphFixture::split_gather`] with two cook groups fanned out between
    /// the split and the gather.
    pub fn split_cook_gather() -> Vec<NewGroup> {
        vec![
            NewGroup::new("Win64", vec![NewNode::new("Setup")]),
            NewGroup::new("Win64", vec![NewNode::new("Split").after("Setup")]),
            NewGroup::new("Win64", vec![NewNode::new("Cook Item 1").after("Split")]),
            NewGroup::new("Win64", vec![NewNode::new("Cook Item 2").after("Split")]),
            NewGroup::new(
                "Win64",
                vec![
                    NewNode::new("Gather")
                        .after("Split")
                        .after("Cook Item 1")
                        .after("Cook Item 2"),
                ],
            ),
            NewGroup::new("Win64", vec![NewNode::new("Publish").after("Gather")]),
        ]
    }
}

/// Templates registered with every [`crate::TestContext`].
pub struct TemplateFixture;

impl TemplateFixture {
    /// Starts from a setup node on a `Win64` agent and chains `tests` off the
    /// `Editor` label.
    pub const INCREMENTAL: &'static str = "incremental";
    /// Starts with an empty graph.
    pub const BARE: &'static str = "bare";
    pub const TESTS: &'static str = "tests";
    /// Builds the latest content change for jobs tagged `content-only`, and
    /// the latest code change otherwise.
    pub const PACKAGING: &'static str = "packaging";
    pub const CONTENT_ONLY_TAG: &'static str = "content-only";

    pub fn incremental() -> TemplateConfig {
        TemplateConfig {
            name: "Incremental Build".to_string(),
            initial_agent_type: Some("Win64".to_string()),
            priority: Priority::High,
            arguments: vec!["-Target=Editor".to_string()],
            chained_jobs: vec![ChainedJobTemplate {
                trigger: "Editor".to_string(),
                template_id: TemplateId::new(Self::TESTS),
            }],
            ..Default::default()
        }
    }

    pub fn bare() -> TemplateConfig {
        TemplateConfig {
            name: "Bare".to_string(),
            ..Default::default()
        }
    }

    pub fn packaging() -> TemplateConfig {
        TemplateConfig {
            name: "Packaging".to_string(),
            change_queries: vec![
                ConditionalChangeQuery {
                    tags: vec![Self::CONTENT_ONLY_TAG.to_string()],
                    query: ChangeQuery::LatestContent,
                },
                ConditionalChangeQuery {
                    tags: vec![],
                    query: ChangeQuery::LatestCode,
                },
            ],
            ..Default::default()
        }
    }

    pub fn tests() -> TemplateConfig {
        TemplateConfig {
            name: "Tests".to_string(),
            priority: Priority::Low,
            ..Default::default()
        }
    }

    pub fn request(template: &str) -> StartJobRequest {
        StartJobRequest {
            stream_id: StreamId::new(STREAM),
            template_id: TemplateId::new(template),
            ..Default::default()
        }
    }
}
