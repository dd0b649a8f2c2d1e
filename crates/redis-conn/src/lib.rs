//! Redis connection plumbing shared by the rate limiter, the IP ledger
//! and the verdict cache. Supports a single node or a cluster, pools
//! connections via deadpool, and samples per-operation latency.
use anyhow::Context;
use deadpool::managed::{Manager, Metrics, Pool, RecycleError, RecycleResult};
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
pub use redis::{cmd, Cmd, FromRedisValue, Pipeline, RedisError, Value as RedisValue};
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisFuture};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static REDIS_LATENCY: LazyLock<prometheus::HistogramVec> = LazyLock::new(|| {
    prometheus::register_histogram_vec!(
        "redis_operation_latency",
        "The latency of an operation talking to Redis",
        &["service", "operation", "status"]
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    /// A single, non-clustered redis node
    Single(String),
    /// List of redis URLs for hosts in the cluster
    Cluster(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisParams {
    pub node: NodeSpec,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Force cluster mode on or off; inferred from `node` when omitted.
    #[serde(default)]
    pub cluster: Option<bool>,
    /// Enables reading from replicas for all new connections
    #[serde(default)]
    pub read_from_replicas: bool,
    /// Maximum number of pooled connections. Default is 10.
    #[serde(default = "RedisParams::default_pool_size")]
    pub pool_size: usize,
    #[serde(default, with = "duration_serde::opt")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "duration_serde::opt")]
    pub recycle_timeout: Option<Duration>,
    #[serde(default, with = "duration_serde::opt")]
    pub wait_timeout: Option<Duration>,
    #[serde(default, with = "duration_serde::opt")]
    pub response_timeout: Option<Duration>,
}

impl RedisParams {
    fn default_pool_size() -> usize {
        10
    }

    fn build_client(&self) -> anyhow::Result<ClientWrapper> {
        let cluster = self
            .cluster
            .unwrap_or(matches!(&self.node, NodeSpec::Cluster(_)));
        let nodes = match &self.node {
            NodeSpec::Single(node) => vec![node.to_string()],
            NodeSpec::Cluster(nodes) => nodes.clone(),
        };

        if cluster {
            let mut builder = ClusterClient::builder(nodes);
            if self.read_from_replicas {
                builder = builder.read_from_replicas();
            }
            if let Some(user) = &self.username {
                builder = builder.username(user.to_string());
            }
            if let Some(pass) = &self.password {
                builder = builder.password(pass.to_string());
            }
            if let Some(duration) = self.connect_timeout {
                builder = builder.connection_timeout(duration);
            }
            if let Some(duration) = self.response_timeout {
                builder = builder.response_timeout(duration);
            }

            Ok(ClientWrapper::Cluster(builder.build().with_context(
                || format!("building redis cluster client {self:?}"),
            )?))
        } else {
            let mut config = ConnectionManagerConfig::new();
            if let Some(duration) = self.connect_timeout {
                config = config.set_connection_timeout(duration);
            }
            if let Some(duration) = self.response_timeout {
                config = config.set_response_timeout(duration);
            }

            let mut info: ConnectionInfo = nodes[0]
                .as_str()
                .into_connection_info()
                .with_context(|| format!("building redis client {self:?}"))?;
            if let Some(user) = &self.username {
                info.redis.username.replace(user.to_string());
            }
            if let Some(pass) = &self.password {
                info.redis.password.replace(pass.to_string());
            }

            Ok(ClientWrapper::Single(
                Client::open(info).with_context(|| format!("building redis client {self:?}"))?,
                config,
            ))
        }
    }

    /// Open a pooled connection handle. The pool is owned by the
    /// returned handle; construct it once at startup and share clones.
    pub fn open(&self) -> anyhow::Result<RedisConnection> {
        let client = self.build_client()?;
        let builder = Pool::builder(ClientManager(client))
            .runtime(deadpool::Runtime::Tokio1)
            .create_timeout(self.connect_timeout)
            .recycle_timeout(self.recycle_timeout)
            .wait_timeout(self.wait_timeout)
            .max_size(self.pool_size);

        let pool = builder.build().context("building redis pool")?;
        Ok(RedisConnection {
            pool,
            label: self.metric_label(),
        })
    }

    /// A human readable label for metrics. The node list alone may not
    /// uniquely identify a configuration (auth and timeouts also
    /// distinguish them), so a crc of the full parameter set is
    /// appended.
    fn metric_label(&self) -> String {
        use crc32fast::Hasher;
        use std::hash::Hash;
        let mut hasher = Hasher::new();
        self.hash(&mut hasher);
        let crc = hasher.finalize();

        let mut label = String::new();
        if let Some(user) = &self.username {
            label.push_str(user);
            label.push('@');
        }
        match &self.node {
            NodeSpec::Single(node) => label.push_str(node),
            NodeSpec::Cluster(nodes) => {
                for (idx, node) in nodes.iter().enumerate() {
                    if idx > 0 {
                        label.push(',');
                    }
                    label.push_str(node);
                }
            }
        }
        label.push_str(&format!("-{crc:08x}"));
        label
    }
}

enum ClientWrapper {
    Single(Client, ConnectionManagerConfig),
    Cluster(ClusterClient),
}

impl ClientWrapper {
    async fn connect(&self) -> anyhow::Result<ConnectionWrapper> {
        match self {
            Self::Single(client, config) => Ok(ConnectionWrapper::Single(
                ConnectionManager::new_with_config(client.clone(), config.clone()).await?,
            )),
            Self::Cluster(c) => Ok(ConnectionWrapper::Cluster(c.get_async_connection().await?)),
        }
    }
}

pub enum ConnectionWrapper {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionWrapper {
    pub async fn ping(&mut self) -> anyhow::Result<()> {
        Ok(redis::cmd("PING").query_async(self).await?)
    }
}

impl ConnectionLike for ConnectionWrapper {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, RedisValue> {
        match self {
            Self::Single(c) => c.req_packed_command(cmd),
            Self::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<RedisValue>> {
        match self {
            Self::Single(c) => c.req_packed_commands(cmd, offset, count),
            Self::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(c) => c.get_db(),
            Self::Cluster(c) => c.get_db(),
        }
    }
}

pub struct ClientManager(ClientWrapper);

impl Manager for ClientManager {
    type Type = ConnectionWrapper;
    type Error = anyhow::Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.0.connect().await
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _metrics: &Metrics,
    ) -> RecycleResult<anyhow::Error> {
        conn.ping()
            .await
            .map_err(|err| RecycleError::message(format!("{err:#}")))
    }
}

#[derive(Clone)]
pub struct RedisConnection {
    pool: Pool<ClientManager>,
    label: String,
}

impl RedisConnection {
    async fn sample_latency<T, E>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let now = Instant::now();
        let result = fut.await;
        let elapsed = now.elapsed().as_secs_f64();
        let status = if result.is_ok() { "ok" } else { "error" };

        if let Ok(hist) =
            REDIS_LATENCY.get_metric_with_label_values(&[self.label.as_str(), operation, status])
        {
            hist.observe(elapsed);
        }

        result
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.sample_latency("ping", async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|err| anyhow::anyhow!("{err:#}"))?;
            conn.ping().await
        })
        .await
    }

    pub async fn query(&self, cmd: Cmd) -> anyhow::Result<RedisValue> {
        self.sample_latency("query", async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|err| anyhow::anyhow!("{err:#}"))?;
            Ok(cmd.query_async(&mut *conn).await?)
        })
        .await
    }

    /// Run a pipeline (use `.atomic()` for MULTI/EXEC semantics) and
    /// decode the result.
    pub async fn pipeline<T: FromRedisValue>(&self, pipe: &Pipeline) -> anyhow::Result<T> {
        self.sample_latency("pipeline", async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|err| anyhow::anyhow!("{err:#}"))?;
            Ok(pipe.query_async(&mut *conn).await?)
        })
        .await
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("RedisConnection")
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn params_from_toml_like_json() {
        let params: RedisParams = serde_json::from_str(
            r#"{
                "node": "redis://127.0.0.1:6379/0",
                "pool_size": 4,
                "connect_timeout": "2s"
            }"#,
        )
        .unwrap();
        assert_eq!(
            params.node,
            NodeSpec::Single("redis://127.0.0.1:6379/0".to_string())
        );
        assert_eq!(params.pool_size, 4);
        assert_eq!(params.connect_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn cluster_nodes_parse_as_list() {
        let params: RedisParams = serde_json::from_str(
            r#"{"node": ["redis://a:7000", "redis://b:7000"]}"#,
        )
        .unwrap();
        assert!(matches!(params.node, NodeSpec::Cluster(ref nodes) if nodes.len() == 2));
    }

    #[test]
    fn label_distinguishes_auth() {
        let a: RedisParams =
            serde_json::from_str(r#"{"node": "redis://h:6379"}"#).unwrap();
        let b: RedisParams =
            serde_json::from_str(r#"{"node": "redis://h:6379", "username": "svc"}"#).unwrap();
        assert_ne!(a.metric_label(), b.metric_label());
        assert!(b.metric_label().starts_with("svc@redis://h:6379-"));
    }
}
