//! Configuration for the shard distribution service.

use std::collections::HashSet;
use std::time::Duration;

/// Minimum allowed heartbeat interval for executors.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the distributor side: store connectivity, leader
/// election, reconciliation cadence, and the namespaces this distributor
/// serves.
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Backend store connectivity.
    pub store: StoreConfig,

    /// Leader election settings.
    pub election: ElectionConfig,

    /// Reconciler settings.
    pub reconcile: ReconcileConfig,

    /// Namespaces served by this distributor.
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            election: ElectionConfig::default(),
            reconcile: ReconcileConfig::default(),
            namespaces: Vec::new(),
        }
    }
}

impl DistributionConfig {
    /// Create a configuration with the given store prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                prefix: prefix.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Add a namespace with a fixed shard universe.
    pub fn with_fixed_namespace(mut self, name: impl Into<String>, shard_count: u32) -> Self {
        self.namespaces.push(NamespaceConfig {
            name: name.into(),
            kind: NamespaceKind::Fixed { shard_count },
        });
        self
    }

    /// Add a namespace whose shards are created on demand.
    pub fn with_ephemeral_namespace(mut self, name: impl Into<String>) -> Self {
        self.namespaces.push(NamespaceConfig {
            name: name.into(),
            kind: NamespaceKind::Ephemeral,
        });
        self
    }

    /// Set the election leader period (session TTL).
    pub fn with_leader_period(mut self, period: Duration) -> Self {
        self.election.leader_period = period;
        self
    }

    /// Set reconciler settings.
    pub fn with_reconcile_config(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.store.prefix.is_empty() {
            return Err("store prefix must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err("namespace name must not be empty".to_string());
            }
            if !seen.insert(ns.name.as_str()) {
                return Err(format!("namespace '{}' is configured twice", ns.name));
            }
            if let NamespaceKind::Fixed { shard_count } = ns.kind {
                if shard_count == 0 {
                    return Err(format!(
                        "namespace '{}': fixed shard count must be at least 1",
                        ns.name
                    ));
                }
            }
        }

        if self.election.leader_period.is_zero() {
            return Err("election leader_period must be positive".to_string());
        }
        if self.reconcile.executor_ttl.is_zero() {
            return Err("reconcile executor_ttl must be positive".to_string());
        }

        Ok(())
    }

    /// Look up a configured namespace by name.
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

/// Backend store connectivity.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend endpoints. Ignored by the in-memory backend.
    pub endpoints: Vec<String>,

    /// Dial timeout when connecting to the backend.
    pub dial_timeout: Duration,

    /// Key prefix under which all service state lives.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            prefix: "/shardherd".to_string(),
        }
    }
}

/// Leader election settings.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Session TTL for elections. Losing the session loses leadership.
    /// Must not be shorter than any executor heartbeat interval.
    pub leader_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_period: Duration::from_secs(10),
        }
    }
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Periodic sweep interval. Dead executors stop producing events, so
    /// the reconciler must also wake on a timer to expire them.
    pub interval: Duration,

    /// Debounce window after a change notification before reading state.
    pub debounce: Duration,

    /// Executors whose last heartbeat is older than this are deleted
    /// after their shards have been reassigned.
    pub executor_ttl: Duration,

    /// Maximum retries per wakeup when assignment hits a version conflict.
    pub max_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            debounce: Duration::from_millis(100),
            executor_ttl: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// A namespace served by the distributor.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Namespace name.
    pub name: String,

    /// How the namespace's shard universe is defined.
    pub kind: NamespaceKind,
}

/// How a namespace's shard universe is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    /// A fixed universe of shards keyed `"0"..shard_count`.
    Fixed { shard_count: u32 },

    /// Shards exist only once created on demand or reported by executors.
    Ephemeral,
}

/// Configuration for one executor-side control loop.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executor identity. Auto-generated (UUID v4) when `None`.
    pub executor_id: Option<String>,

    /// Namespace this executor participates in.
    pub namespace: String,

    /// Heartbeat interval. Must be at least [`MIN_HEARTBEAT_INTERVAL`].
    pub heartbeat_interval: Duration,

    /// Metadata advertised with every heartbeat (network address etc.).
    pub metadata: std::collections::HashMap<String, String>,
}

impl ExecutorConfig {
    /// Create an executor config for a namespace.
    pub fn new(namespace: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            executor_id: None,
            namespace: namespace.into(),
            heartbeat_interval,
            metadata: std::collections::HashMap::new(),
        }
    }

    /// Set an explicit executor ID.
    pub fn with_executor_id(mut self, id: impl Into<String>) -> Self {
        self.executor_id = Some(id.into());
        self
    }

    /// Add a metadata entry advertised with heartbeats.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Configuration for the executor manager: one executor per namespace.
#[derive(Debug, Clone, Default)]
pub struct ExecutorManagerConfig {
    /// Executor configurations, one per namespace.
    pub executors: Vec<ExecutorConfig>,
}

impl ExecutorManagerConfig {
    /// Create a manager config from executor configs.
    pub fn new(executors: Vec<ExecutorConfig>) -> Self {
        Self { executors }
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.executors.is_empty() {
            return Err("at least one executor configuration is required".to_string());
        }

        let mut namespaces = HashSet::new();
        for (i, executor) in self.executors.iter().enumerate() {
            if executor.namespace.is_empty() {
                return Err(format!("executor {i}: namespace is required"));
            }
            if executor.heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
                return Err(format!(
                    "executor {i}: heartbeat_interval must be at least {:?}",
                    MIN_HEARTBEAT_INTERVAL
                ));
            }
            if !namespaces.insert(executor.namespace.as_str()) {
                return Err(format!(
                    "namespace '{}' is configured for multiple executors",
                    executor.namespace
                ));
            }
        }

        Ok(())
    }

    /// Validate against the election settings: sessions shorter than a
    /// heartbeat interval would flap leadership on every tick.
    pub fn validate_against(&self, election: &ElectionConfig) -> Result<(), String> {
        self.validate()?;
        for executor in &self.executors {
            if election.leader_period < executor.heartbeat_interval {
                return Err(format!(
                    "election leader_period {:?} is shorter than heartbeat_interval {:?} for namespace '{}'",
                    election.leader_period, executor.heartbeat_interval, executor.namespace
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_config_builder() {
        let config = DistributionConfig::new("/test")
            .with_fixed_namespace("orders", 8)
            .with_ephemeral_namespace("sessions")
            .with_leader_period(Duration::from_secs(5));

        assert_eq!(config.store.prefix, "/test");
        assert_eq!(config.namespaces.len(), 2);
        assert_eq!(config.election.leader_period, Duration::from_secs(5));
        assert!(config.validate().is_ok());

        let orders = config.namespace("orders").unwrap();
        assert_eq!(orders.kind, NamespaceKind::Fixed { shard_count: 8 });
        assert!(config.namespace("missing").is_none());
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let config = DistributionConfig::new("/test")
            .with_fixed_namespace("orders", 8)
            .with_fixed_namespace("orders", 4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_shard_count_rejected() {
        let config = DistributionConfig::new("/test").with_fixed_namespace("orders", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_executor_config_minimum_heartbeat() {
        let config = ExecutorManagerConfig::new(vec![ExecutorConfig::new(
            "orders",
            Duration::from_millis(99),
        )]);
        let err = config.validate().unwrap_err();
        assert!(err.contains("heartbeat_interval"));

        let config = ExecutorManagerConfig::new(vec![ExecutorConfig::new(
            "orders",
            Duration::from_millis(100),
        )]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_executor_config_duplicate_namespace() {
        let config = ExecutorManagerConfig::new(vec![
            ExecutorConfig::new("orders", Duration::from_millis(200)),
            ExecutorConfig::new("orders", Duration::from_millis(300)),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.contains("multiple executors"));
    }

    #[test]
    fn test_executor_config_empty_namespace() {
        let config =
            ExecutorManagerConfig::new(vec![ExecutorConfig::new("", Duration::from_millis(200))]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_executor_list_rejected() {
        let config = ExecutorManagerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leader_period_shorter_than_heartbeat_rejected() {
        let config =
            ExecutorManagerConfig::new(vec![ExecutorConfig::new("orders", Duration::from_secs(2))]);
        let election = ElectionConfig {
            leader_period: Duration::from_secs(1),
        };
        assert!(config.validate_against(&election).is_err());

        let election = ElectionConfig {
            leader_period: Duration::from_secs(2),
        };
        assert!(config.validate_against(&election).is_ok());
    }
}
