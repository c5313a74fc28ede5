//! Connection manager: owns named tool-server connections, routes calls,
//! and load-balances capability pools.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionError, Timeouts};
use crate::history::HistoryStore;
use crate::protocol::{self, ToolDescriptor};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("tool server '{name}' not found")]
    ServerNotFound { name: String },
    #[error("no tool server advertises '{name}'")]
    ToolNotFound { name: String },
    #[error("capability pool '{pool}' has no live members")]
    EmptyPool { pool: String },
    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed { tool: String, message: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Seam between the execution engine and tool routing. The manager is the
/// production implementation; tests substitute scripted stubs.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Resolve and invoke a tool by bare name or `server/tool` compound.
    async fn dispatch_tool(&self, name: &str, arguments: Value) -> Result<String, ManagerError>;

    /// Serialized snapshot of every known tool descriptor, handed to
    /// spawned code through its environment.
    async fn descriptor_snapshot(&self) -> Value;
}

/// Named group of interchangeable connections with per-member in-flight
/// counters for least-loaded selection.
pub struct CapabilityPool {
    name: String,
    members: Vec<PoolMember>,
}

struct PoolMember {
    server: String,
    in_flight: AtomicUsize,
}

impl CapabilityPool {
    fn new(name: String, servers: Vec<String>) -> Self {
        let members = servers
            .into_iter()
            .map(|server| PoolMember {
                server,
                in_flight: AtomicUsize::new(0),
            })
            .collect();
        Self { name, members }
    }

    /// Pick the lowest-usage live member, ties broken by registration order,
    /// and increment its counter. The returned permit decrements exactly
    /// once on drop, on every completion path including process death.
    fn acquire(self: &Arc<Self>, live: &HashSet<String>) -> Option<PoolPermit> {
        let mut best: Option<(usize, usize)> = None;
        for (index, member) in self.members.iter().enumerate() {
            if !live.contains(&member.server) {
                continue;
            }
            let load = member.in_flight.load(Ordering::SeqCst);
            if best.map(|(lowest, _)| load < lowest).unwrap_or(true) {
                best = Some((load, index));
            }
        }
        let (_, index) = best?;
        self.members[index].in_flight.fetch_add(1, Ordering::SeqCst);
        Some(PoolPermit {
            pool: Arc::clone(self),
            index,
        })
    }

    fn usage(&self) -> Vec<usize> {
        self.members
            .iter()
            .map(|member| member.in_flight.load(Ordering::SeqCst))
            .collect()
    }
}

pub struct PoolPermit {
    pool: Arc<CapabilityPool>,
    index: usize,
}

impl PoolPermit {
    fn server(&self) -> &str {
        &self.pool.members[self.index].server
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.members[self.index]
            .in_flight
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// One tool as seen from the outside, attributed to its server.
#[derive(Debug, Clone, Serialize)]
pub struct AdvertisedTool {
    pub server: String,
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
}

pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Connection>>,
    order: Vec<String>,
    pools: HashMap<String, Arc<CapabilityPool>>,
    timeouts: Timeouts,
    history: Arc<HistoryStore>,
}

impl ConnectionManager {
    /// Start every configured server. A server that fails its handshake is
    /// excluded from routing with a warning; the rest stay usable.
    pub async fn start(
        servers: &[ServerConfig],
        timeouts: Timeouts,
        history: Arc<HistoryStore>,
    ) -> Self {
        let mut connections = HashMap::new();
        let mut order = Vec::new();
        let mut pool_members: HashMap<String, Vec<String>> = HashMap::new();

        for config in servers {
            match Connection::start(config.clone(), timeouts).await {
                Ok(connection) => {
                    info!(server = %config.name, "tool server ready");
                    order.push(config.name.clone());
                    if let Some(pool) = &config.pool {
                        pool_members
                            .entry(pool.clone())
                            .or_default()
                            .push(config.name.clone());
                    }
                    connections.insert(config.name.clone(), connection);
                }
                Err(err) => {
                    warn!(
                        server = %config.name,
                        %err,
                        "excluding tool server after failed handshake"
                    );
                }
            }
        }

        let pools = pool_members
            .into_iter()
            .map(|(name, members)| {
                let pool = Arc::new(CapabilityPool::new(name.clone(), members));
                (name, pool)
            })
            .collect();

        Self {
            connections: Mutex::new(connections),
            order,
            pools,
            timeouts,
            history,
        }
    }

    /// Invoke `tool` on a target that is either a connection name or a
    /// capability pool name. Single text-content results are unwrapped to
    /// plain strings; every call is recorded in the history store.
    pub async fn call(
        &self,
        target: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<String, ManagerError> {
        let (connection, server, _permit) = self.route(target)?;
        let outcome = connection
            .call_tool(tool, arguments.clone(), self.timeouts.call)
            .await;

        match outcome {
            Ok(value) => {
                let text = protocol::unwrap_text_content(&value);
                if value
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    self.history
                        .record_tool_call(&server, tool, &arguments, &format!("error: {text}"));
                    return Err(ManagerError::ToolFailed {
                        tool: tool.to_string(),
                        message: text,
                    });
                }
                self.history.record_tool_call(&server, tool, &arguments, &text);
                Ok(text)
            }
            Err(err) => {
                if matches!(err, ConnectionError::Closed { .. }) {
                    warn!(server = %server, "removing dead tool server from routing");
                    self.remove(&server);
                }
                self.history
                    .record_tool_call(&server, tool, &arguments, &format!("error: {err}"));
                Err(ManagerError::Connection(err))
            }
        }
    }

    /// Map a bare tool name (or `server/tool` compound) to its serving
    /// connection, searching catalogs in registration order.
    pub async fn resolve_tool(&self, name: &str) -> Result<(String, String), ManagerError> {
        if let Some((server, tool)) = name.split_once('/') {
            return Ok((server.to_string(), tool.to_string()));
        }
        for server in &self.order {
            let Some(connection) = self.lookup(server) else {
                continue;
            };
            if connection.tools().await.iter().any(|tool| tool.name == name) {
                return Ok((server.clone(), name.to_string()));
            }
        }
        Err(ManagerError::ToolNotFound {
            name: name.to_string(),
        })
    }

    pub async fn list_all_tools(&self) -> Vec<AdvertisedTool> {
        let mut tools = Vec::new();
        for server in &self.order {
            let Some(connection) = self.lookup(server) else {
                continue;
            };
            for descriptor in connection.tools().await {
                tools.push(AdvertisedTool {
                    server: server.clone(),
                    descriptor,
                });
            }
        }
        tools
    }

    /// In-flight usage counters of a pool, in registration order.
    pub fn pool_usage(&self, pool: &str) -> Option<Vec<usize>> {
        self.pools.get(pool).map(|pool| pool.usage())
    }

    /// Signal graceful termination to every child process.
    pub async fn shutdown(&self) {
        let connections: Vec<Connection> = {
            let registry = self.connections.lock().expect("connection registry lock");
            registry.values().cloned().collect()
        };
        futures::future::join_all(
            connections
                .iter()
                .map(|connection| connection.shutdown()),
        )
        .await;
    }

    fn route(&self, target: &str) -> Result<(Connection, String, Option<PoolPermit>), ManagerError> {
        if let Some(pool) = self.pools.get(target) {
            let live: HashSet<String> = {
                let registry = self.connections.lock().expect("connection registry lock");
                registry.keys().cloned().collect()
            };
            let permit = pool.acquire(&live).ok_or_else(|| ManagerError::EmptyPool {
                pool: pool.name.clone(),
            })?;
            let server = permit.server().to_string();
            let connection = self
                .lookup(&server)
                .ok_or_else(|| ManagerError::ServerNotFound {
                    name: server.clone(),
                })?;
            return Ok((connection, server, Some(permit)));
        }

        let connection = self
            .lookup(target)
            .ok_or_else(|| ManagerError::ServerNotFound {
                name: target.to_string(),
            })?;
        Ok((connection, target.to_string(), None))
    }

    fn lookup(&self, server: &str) -> Option<Connection> {
        let registry = self.connections.lock().expect("connection registry lock");
        registry.get(server).cloned()
    }

    fn remove(&self, server: &str) {
        let mut registry = self.connections.lock().expect("connection registry lock");
        registry.remove(server);
    }
}

#[async_trait]
impl ToolDispatcher for ConnectionManager {
    async fn dispatch_tool(&self, name: &str, arguments: Value) -> Result<String, ManagerError> {
        let (target, tool) = self.resolve_tool(name).await?;
        self.call(&target, &tool, arguments).await
    }

    async fn descriptor_snapshot(&self) -> Value {
        let tools = self.list_all_tools().await;
        json!(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(servers: &[&str]) -> Arc<CapabilityPool> {
        Arc::new(CapabilityPool::new(
            "workers".to_string(),
            servers.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn live(servers: &[&str]) -> HashSet<String> {
        servers.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn concurrent_acquires_stay_balanced() {
        let pool = pool(&["a", "b", "c"]);
        let live = live(&["a", "b", "c"]);

        let permits: Vec<PoolPermit> =
            (0..7).map(|_| pool.acquire(&live).expect("member")).collect();

        let usage = pool.usage();
        let max = usage.iter().max().copied().unwrap_or(0);
        let min = usage.iter().min().copied().unwrap_or(0);
        assert_eq!(usage.iter().sum::<usize>(), 7);
        assert!(max - min <= 1, "usage spread too wide: {usage:?}");

        drop(permits);
        assert_eq!(pool.usage(), vec![0, 0, 0]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let pool = pool(&["a", "b"]);
        let live = live(&["a", "b"]);
        let first = pool.acquire(&live).expect("member");
        assert_eq!(first.server(), "a");
        let second = pool.acquire(&live).expect("member");
        assert_eq!(second.server(), "b");
    }

    #[test]
    fn dead_members_are_skipped() {
        let pool = pool(&["a", "b"]);
        let only_b = live(&["b"]);
        let permit = pool.acquire(&only_b).expect("member");
        assert_eq!(permit.server(), "b");

        assert!(pool.acquire(&HashSet::new()).is_none());
    }

    #[test]
    fn permit_drop_decrements_once() {
        let pool = pool(&["a"]);
        let live = live(&["a"]);
        let permit = pool.acquire(&live).expect("member");
        assert_eq!(pool.usage(), vec![1]);
        drop(permit);
        assert_eq!(pool.usage(), vec![0]);
    }
}
