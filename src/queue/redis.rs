// Key-value store connections
//
// One factory per process hands out connections for the configured
// topology. Standalone and sentinel connections multiplex commands over a
// single socket; cluster connections route by key slot. All three are
// exposed through the same `ConnectionLike` handle.

use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{Cmd, Pipeline, RedisConnectionInfo, RedisFuture, Value as RedisValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::Mutex;

use super::types::{HealthStatus, StoreHealth};
use crate::config::{RedisConfig, RedisMode};
use crate::error::QueueError;

/// A live connection in any topology
#[derive(Clone)]
pub enum RedisConnection {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
    Sentinel(MultiplexedConnection),
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisConnection::Standalone(_) => f.write_str("RedisConnection::Standalone"),
            RedisConnection::Cluster(_) => f.write_str("RedisConnection::Cluster"),
            RedisConnection::Sentinel(_) => f.write_str("RedisConnection::Sentinel"),
        }
    }
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, RedisValue> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
            RedisConnection::Sentinel(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<RedisValue>> {
        match self {
            RedisConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Sentinel(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Standalone(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
            RedisConnection::Sentinel(conn) => conn.get_db(),
        }
    }
}

/// Creates and caches the store connection for one configuration
pub struct RedisConnectionFactory {
    config: RedisConfig,
    connection: Mutex<Option<RedisConnection>>,
    sentinel: Mutex<Option<SentinelClient>>,
}

impl fmt::Debug for RedisConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnectionFactory")
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

impl RedisConnectionFactory {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            sentinel: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> RedisMode {
        self.config.mode
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// The shared connection, established on first use within the
    /// configured connect timeout
    pub async fn get_connection(&self) -> Result<RedisConnection, QueueError> {
        let mut cached = self.connection.lock().await;
        if let Some(connection) = cached.as_ref() {
            return Ok(connection.clone());
        }

        let timeout = self.config.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| QueueError::Timeout(timeout))??;

        tracing::info!("Connected to {} store", self.config.mode);
        *cached = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the cached connection so the next call reconnects. In sentinel
    /// mode this re-resolves the current primary.
    pub async fn invalidate(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::warn!("Discarding {} store connection", self.config.mode);
        }
    }

    /// Release the connection
    pub async fn close(&self) {
        self.connection.lock().await.take();
        self.sentinel.lock().await.take();
    }

    async fn connect(&self) -> Result<RedisConnection, QueueError> {
        match self.config.mode {
            RedisMode::Standalone => self.connect_standalone().await,
            RedisMode::Cluster => self.connect_cluster().await,
            RedisMode::Sentinel => self.connect_sentinel().await,
        }
    }

    async fn connect_standalone(&self) -> Result<RedisConnection, QueueError> {
        tracing::debug!("Connecting to standalone store at {}", self.config.url);
        let client = redis::Client::open(self.config.url.as_str())?;

        // ConnectionManager retries forever on its own; check reachability first
        let mut ping_conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut ping_conn).await?;

        let manager = ConnectionManager::new(client).await?;
        Ok(RedisConnection::Standalone(manager))
    }

    async fn connect_cluster(&self) -> Result<RedisConnection, QueueError> {
        if self.config.cluster_nodes.is_empty() {
            return Err(QueueError::Config(
                "cluster mode requires at least one cluster node".to_string(),
            ));
        }
        let password = self.config.password.as_deref();
        let nodes: Vec<String> = self
            .config
            .cluster_nodes
            .iter()
            .map(|node| node.to_url(password))
            .collect();
        tracing::debug!("Connecting to cluster via {} seed nodes", nodes.len());

        let client = ClusterClient::new(nodes)?;
        let mut connection = client.get_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(RedisConnection::Cluster(connection))
    }

    async fn connect_sentinel(&self) -> Result<RedisConnection, QueueError> {
        if self.config.sentinel_hosts.is_empty() {
            return Err(QueueError::Config(
                "sentinel mode requires at least one sentinel host".to_string(),
            ));
        }

        let mut sentinel = self.sentinel.lock().await;
        if sentinel.is_none() {
            let password = self.config.password.as_deref();
            let sentinels: Vec<String> = self
                .config
                .sentinel_hosts
                .iter()
                .map(|host| host.to_url(password))
                .collect();
            let node_info = SentinelNodeConnectionInfo {
                tls_mode: None,
                redis_connection_info: Some(RedisConnectionInfo {
                    password: self.config.password.clone(),
                    ..Default::default()
                }),
            };
            tracing::debug!(
                "Resolving primary '{}' via {} sentinels",
                self.config.sentinel_master,
                sentinels.len()
            );
            *sentinel = Some(SentinelClient::build(
                sentinels,
                self.config.sentinel_master.clone(),
                Some(node_info),
                SentinelServerType::Master,
            )?);
        }

        let client = sentinel
            .as_mut()
            .ok_or_else(|| QueueError::Config("sentinel client unavailable".to_string()))?;
        let mut connection = client.get_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(RedisConnection::Sentinel(connection))
    }

    /// Health report: status and mode plus topology-specific fields
    pub async fn get_health(&self) -> StoreHealth {
        let mode = self.config.mode.to_string();
        let mut connection = match self.get_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                return StoreHealth {
                    status: HealthStatus::Unhealthy,
                    mode,
                    error: Some(e.to_string()),
                    details: BTreeMap::new(),
                }
            }
        };

        match self.collect_details(&mut connection).await {
            Ok(details) => StoreHealth {
                status: HealthStatus::Healthy,
                mode,
                error: None,
                details,
            },
            Err(e) => {
                self.invalidate().await;
                StoreHealth {
                    status: HealthStatus::Unhealthy,
                    mode,
                    error: Some(e.to_string()),
                    details: BTreeMap::new(),
                }
            }
        }
    }

    async fn collect_details(
        &self,
        connection: &mut RedisConnection,
    ) -> Result<BTreeMap<String, Value>, QueueError> {
        let mut details = BTreeMap::new();
        match self.config.mode {
            RedisMode::Standalone => {
                let info: String = redis::cmd("INFO").query_async(connection).await?;
                let info = parse_info(&info);
                details.insert("connected_clients".into(), info_value(&info, "connected_clients", 0.into()));
                details.insert("used_memory".into(), info_value(&info, "used_memory_human", "unknown".into()));
                details.insert("uptime_days".into(), info_value(&info, "uptime_in_days", 0.into()));
                details.insert("role".into(), info_value(&info, "role", "unknown".into()));
            }
            RedisMode::Cluster => {
                let info: String = redis::cmd("CLUSTER").arg("INFO").query_async(connection).await?;
                let nodes: String = redis::cmd("CLUSTER").arg("NODES").query_async(connection).await?;
                let info = parse_info(&info);
                let (masters, replicas) = count_cluster_roles(&nodes);
                details.insert("cluster_state".into(), info_value(&info, "cluster_state", "unknown".into()));
                details.insert(
                    "cluster_slots_assigned".into(),
                    info_value(&info, "cluster_slots_assigned", 0.into()),
                );
                details.insert("cluster_slots_ok".into(), info_value(&info, "cluster_slots_ok", 0.into()));
                details.insert(
                    "cluster_known_nodes".into(),
                    info_value(&info, "cluster_known_nodes", 0.into()),
                );
                details.insert("master_nodes".into(), masters.into());
                details.insert("replica_nodes".into(), replicas.into());
            }
            RedisMode::Sentinel => {
                let info: String = redis::cmd("INFO").query_async(connection).await?;
                let info = parse_info(&info);
                details.insert("connected_clients".into(), info_value(&info, "connected_clients", 0.into()));
                details.insert("used_memory".into(), info_value(&info, "used_memory_human", "unknown".into()));
                details.insert("role".into(), info_value(&info, "role", "unknown".into()));
                details.insert("master_name".into(), self.config.sentinel_master.clone().into());
                details.insert("connected_slaves".into(), info_value(&info, "connected_slaves", 0.into()));
            }
        }
        Ok(details)
    }
}

/// `key:value` lines of an INFO reply; section headers are skipped
fn parse_info(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// An INFO field as a JSON number when numeric
fn info_value(info: &BTreeMap<String, String>, key: &str, default: Value) -> Value {
    match info.get(key) {
        Some(raw) => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.clone())),
        None => default,
    }
}

/// (primaries, replicas) listed in a CLUSTER NODES reply
fn count_cluster_roles(nodes: &str) -> (usize, usize) {
    let mut masters = 0;
    let mut replicas = 0;
    for line in nodes.lines() {
        let Some(flags) = line.split_whitespace().nth(2) else {
            continue;
        };
        let flags: Vec<&str> = flags.split(',').collect();
        if flags.contains(&"master") {
            masters += 1;
        } else if flags.contains(&"slave") {
            replicas += 1;
        }
    }
    (masters, replicas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostPort;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_parse_info_sections() {
        let text = "# Server\r\nredis_version:7.2.4\r\nuptime_in_days:3\r\n\r\n# Clients\r\nconnected_clients:12\r\nused_memory_human:1.5M\r\n";
        let info = parse_info(text);
        assert_eq!(info_value(&info, "connected_clients", 0.into()), json!(12));
        assert_eq!(info_value(&info, "used_memory_human", "unknown".into()), json!("1.5M"));
        assert_eq!(info_value(&info, "role", "unknown".into()), json!("unknown"));
    }

    #[test]
    fn test_count_cluster_roles() {
        let nodes = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 myself,master - 0 1426238318243 3 connected 10923-16383
";
        assert_eq!(count_cluster_roles(nodes), (2, 1));
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_unhealthy() {
        let factory = RedisConnectionFactory::new(RedisConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            connect_timeout: Duration::from_millis(500),
            ..RedisConfig::default()
        });

        assert!(factory.get_connection().await.is_err());
        let health = factory.get_health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.mode, "standalone");
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn test_topologies_require_endpoints() {
        let cluster = RedisConnectionFactory::new(RedisConfig {
            mode: RedisMode::Cluster,
            ..RedisConfig::default()
        });
        assert!(matches!(cluster.get_connection().await, Err(QueueError::Config(_))));

        let sentinel = RedisConnectionFactory::new(RedisConfig {
            mode: RedisMode::Sentinel,
            sentinel_hosts: Vec::<HostPort>::new(),
            ..RedisConfig::default()
        });
        assert!(matches!(sentinel.get_connection().await, Err(QueueError::Config(_))));
    }
}
