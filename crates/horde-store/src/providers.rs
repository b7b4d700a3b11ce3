//! Template and source-control providers backed by process memory.

use async_trait::async_trait;
use horde_core::ids::{StreamId, TemplateId};
use horde_core::ports::{ChangeQuery, CommitSource, ResolvedChange, TemplateConfig, TemplateProvider};
use horde_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// Templates shared by every stream.
#[derive(Debug, Default)]
pub struct MemoryTemplateProvider {
    templates: HashMap<TemplateId, TemplateConfig>,
}

impl MemoryTemplateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template_id: impl Into<TemplateId>, config: TemplateConfig) -> Self {
        self.templates.insert(template_id.into(), config);
        self
    }
}

impl FromIterator<(TemplateId, TemplateConfig)> for MemoryTemplateProvider {
    fn from_iter<I: IntoIterator<Item = (TemplateId, TemplateConfig)>>(iter: I) -> Self {
        Self {
            templates: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TemplateProvider for MemoryTemplateProvider {
    async fn get_template(
        &self,
        _stream_id: &StreamId,
        template_id: &TemplateId,
    ) -> Result<Option<TemplateConfig>> {
        Ok(self.templates.get(template_id).cloned())
    }
}

/// Kinds of file a submitted change touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeContents {
    pub code: bool,
    pub content: bool,
}

#[derive(Debug, Default)]
struct StreamHistory {
    changes: BTreeMap<u32, ChangeContents>,
    shelves: HashSet<u32>,
    successes: Vec<(TemplateId, Option<String>, u32)>,
}

impl StreamHistory {
    fn code_change_at(&self, change: u32) -> u32 {
        self.changes
            .range(..=change)
            .rev()
            .find(|(_, contents)| contents.code)
            .map(|(number, _)| *number)
            .unwrap_or(change)
    }

    fn latest_matching(
        &self,
        stream_id: &StreamId,
        what: &str,
        matches: impl Fn(&ChangeContents) -> bool,
    ) -> Result<u32> {
        self.changes
            .iter()
            .rev()
            .find(|(_, contents)| matches(contents))
            .map(|(number, _)| *number)
            .ok_or_else(|| Error::ChangeResolution(format!("no {what} changes in {stream_id}")))
    }
}

/// Change history for a set of streams.
#[derive(Debug, Default)]
pub struct MemoryCommitSource {
    streams: RwLock<HashMap<StreamId, StreamHistory>>,
}

impl MemoryCommitSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submitted change that touched either code or content.
    pub async fn submit(&self, stream_id: &StreamId, change: u32, touches_code: bool) {
        let contents = ChangeContents {
            code: touches_code,
            content: !touches_code,
        };
        self.submit_with_contents(stream_id, change, contents).await;
    }

    pub async fn submit_with_contents(
        &self,
        stream_id: &StreamId,
        change: u32,
        contents: ChangeContents,
    ) {
        let mut streams = self.streams.write().await;
        let history = streams.entry(stream_id.clone()).or_default();
        history.changes.insert(change, contents);
    }

    pub async fn shelve(&self, stream_id: &StreamId, change: u32) {
        let mut streams = self.streams.write().await;
        streams.entry(stream_id.clone()).or_default().shelves.insert(change);
    }

    pub async fn delete_shelf(&self, stream_id: &StreamId, change: u32) {
        if let Some(history) = self.streams.write().await.get_mut(stream_id) {
            history.shelves.remove(&change);
        }
    }

    /// Record that a template (or one of its targets) succeeded at a change.
    pub async fn record_success(
        &self,
        stream_id: &StreamId,
        template_id: &TemplateId,
        target: Option<&str>,
        change: u32,
    ) {
        let mut streams = self.streams.write().await;
        streams.entry(stream_id.clone()).or_default().successes.push((
            template_id.clone(),
            target.map(str::to_string),
            change,
        ));
    }
}

#[async_trait]
impl CommitSource for MemoryCommitSource {
    async fn resolve(&self, stream_id: &StreamId, query: &ChangeQuery) -> Result<ResolvedChange> {
        let streams = self.streams.read().await;
        let history = streams
            .get(stream_id)
            .ok_or_else(|| Error::ChangeResolution(format!("no changes in {stream_id}")))?;

        let change = match query {
            ChangeQuery::Latest => history.latest_matching(stream_id, "submitted", |_| true)?,
            ChangeQuery::LatestCode => history.latest_matching(stream_id, "code", |c| c.code)?,
            ChangeQuery::LatestContent => {
                history.latest_matching(stream_id, "content", |c| c.content)?
            }
            ChangeQuery::Fixed { change } => *change,
            ChangeQuery::LastSuccessful { template_id, target } => history
                .successes
                .iter()
                .filter(|(id, t, _)| id == template_id && t == target)
                .map(|(_, _, change)| *change)
                .max()
                .ok_or_else(|| {
                    Error::ChangeResolution(format!(
                        "no successful {template_id} job in {stream_id}"
                    ))
                })?,
        };

        Ok(ResolvedChange {
            change,
            code_change: history.code_change_at(change),
        })
    }

    async fn shelf_exists(&self, stream_id: &StreamId, change: u32) -> Result<bool> {
        Ok(self
            .streams
            .read()
            .await
            .get(stream_id)
            .is_some_and(|history| history.shelves.contains(&change)))
    }
}
