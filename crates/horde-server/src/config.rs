//! Server configuration.

use anyhow::Context;
use horde_core::ids::{StreamId, TemplateId};
use horde_core::ports::TemplateConfig;
use horde_scheduler::SchedulerConfig;
use horde_store::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Agent pools and the agent types they serve.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub templates: BTreeMap<TemplateId, TemplateConfig>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Events buffered for the dispatcher before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// A stream known to the server, with the change it starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    #[serde(default)]
    pub latest_change: u32,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horde_core::ids::PoolId;
    use horde_core::ports::ChangeQuery;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.notifications.queue_capacity, 1024);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
scheduler:
  max_incomplete_retries: 3
  tick_interval_secs: 2
logging:
  filter: "horde=debug"
  format: json
pools:
  - id: win-compile
    agent_types: [Win64]
    agents: 8
    online: 6
templates:
  incremental:
    name: Incremental Build
    initial_agent_type: Win64
    priority: high
    chained_jobs:
      - trigger: Editor
        template_id: tests
streams:
  - id: //UE5/Main
    latest_change: 1200
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.scheduler.max_incomplete_retries, 3);
        assert_eq!(config.scheduler.max_update_attempts, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pools[0].id, PoolId::new("win-compile"));
        assert_eq!(config.pools[0].online, 6);

        let template = &config.templates[&TemplateId::new("incremental")];
        assert_eq!(template.initial_agent_type.as_deref(), Some("Win64"));
        assert_eq!(template.chained_jobs[0].trigger, "Editor");
        assert_eq!(config.streams[0].latest_change, 1200);
    }

    #[test]
    fn test_example_config_parses() {
        let config = ServerConfig::from_yaml(include_str!("../../../config/horde.yaml")).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.templates.len(), 2);
        assert_eq!(config.streams[0].id, StreamId::new("//UE5/Main"));

        let incremental = &config.templates[&TemplateId::new("incremental")];
        let queries: Vec<&ChangeQuery> = incremental
            .change_queries
            .iter()
            .map(|query| &query.query)
            .collect();
        assert_eq!(queries, vec![&ChangeQuery::LatestContent, &ChangeQuery::LatestCode]);
        assert_eq!(incremental.change_queries[0].tags, vec!["content-only".to_string()]);
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/horde.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/horde.yaml"));
    }
}
