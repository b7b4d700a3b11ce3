//! Agent pools from static configuration.

use async_trait::async_trait;
use horde_core::Result;
use horde_core::ids::{PoolId, StreamId};
use horde_core::ports::{PoolDirectory, PoolLookup, PoolStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// A pool of agents and the agent types it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    #[serde(default)]
    pub agent_types: Vec<String>,
    /// Agents registered to the pool.
    #[serde(default)]
    pub agents: u32,
    /// Agents currently online.
    #[serde(default)]
    pub online: u32,
}

/// Resolves agent types against a fixed set of pools.
///
/// Agent type names are matched case-insensitively. The same mapping applies to
/// every stream.
pub struct StaticPoolDirectory {
    agent_types: HashMap<String, PoolId>,
    pools: RwLock<HashMap<PoolId, PoolStatus>>,
}

impl StaticPoolDirectory {
    pub fn new(pools: Vec<PoolConfig>) -> Self {
        let mut agent_types = HashMap::new();
        let mut statuses = HashMap::new();
        for pool in pools {
            for agent_type in &pool.agent_types {
                agent_types.insert(agent_type.to_lowercase(), pool.id.clone());
            }
            statuses.insert(
                pool.id,
                PoolStatus {
                    agents: pool.agents,
                    online: pool.online,
                },
            );
        }
        Self {
            agent_types,
            pools: RwLock::new(statuses),
        }
    }

    /// Map an agent type onto a pool, which need not exist.
    pub fn map_agent_type(mut self, agent_type: &str, pool_id: PoolId) -> Self {
        self.agent_types.insert(agent_type.to_lowercase(), pool_id);
        self
    }

    /// Record a change in the number of agents in a pool.
    pub async fn set_status(&self, pool_id: &PoolId, status: PoolStatus) {
        debug!(pool = %pool_id, agents = status.agents, online = status.online, "Pool status changed");
        self.pools.write().await.insert(pool_id.clone(), status);
    }
}

#[async_trait]
impl PoolDirectory for StaticPoolDirectory {
    async fn resolve_pool(&self, _stream_id: &StreamId, agent_type: &str) -> Result<PoolLookup> {
        let Some(pool_id) = self.agent_types.get(&agent_type.to_lowercase()) else {
            return Ok(PoolLookup::UnknownAgentType);
        };
        let pools = self.pools.read().await;
        Ok(match pools.get(pool_id) {
            Some(status) => PoolLookup::Pool {
                pool_id: pool_id.clone(),
                status: *status,
            },
            None => PoolLookup::UnknownPool(pool_id.clone()),
        })
    }
}
