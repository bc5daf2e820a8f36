use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub reconciler: ReconcilerConfig,
    pub resolver: ResolverConfig,
    pub cluster: ClusterConfig,
    pub targets: TargetsConfig,
    pub dead_letter: DeadLetterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            file_path: None,
        }
    }
}

/// Retry budget for a reconciliation task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Attempts per task before it is dead-lettered
    pub max_attempts: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_min_ms: 200,
            backoff_max_ms: 10_000,
            backoff_jitter: true,
        }
    }
}

/// Instance-metadata lookups (`aws ec2 describe-instances`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub aws_binary: String,
    /// Falls back to the CLI's own region resolution when unset
    pub region: Option<String>,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            aws_binary: "aws".to_string(),
            region: None,
            timeout_secs: 10,
            cache_ttl_secs: 60,
            cache_capacity: 10_000,
        }
    }
}

/// Cluster control plane (`kubectl`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubectl_binary: String,
    pub kubeconfig: String,
    pub timeout_secs: u64,
    /// Node label carrying the availability zone
    pub zone_label: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl_binary: "kubectl".to_string(),
            kubeconfig: "/etc/kubernetes/admin.conf".to_string(),
            timeout_secs: 15,
            zone_label: "topology.kubernetes.io/zone".to_string(),
        }
    }
}

/// Monitoring targets (Prometheus file-based service discovery)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    pub file_sd_path: String,
    /// Metrics port appended to each instance address
    pub port: u16,
    pub timeout_secs: u64,
    /// Delay before a leaving instance's target is removed (0 = immediate)
    pub removal_grace_secs: u64,
    /// Static labels added to every target group
    pub labels: HashMap<String, String>,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            file_sd_path: "/etc/prometheus/file_sd/nodes.json".to_string(),
            port: 9100,
            timeout_secs: 5,
            removal_grace_secs: 0,
            labels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// JSON-lines file receiving failed tasks; log-only when unset
    pub file_path: Option<String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NODESYNC__CLUSTER__KUBECONFIG=/path overrides cluster.kubeconfig
        builder = builder.add_source(
            Environment::with_prefix("NODESYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, reporting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.reconciler.max_attempts == 0 {
            errors.push("reconciler.max_attempts must be at least 1".to_string());
        }
        if self.reconciler.backoff_min_ms > self.reconciler.backoff_max_ms {
            errors.push("reconciler.backoff_min_ms must not exceed backoff_max_ms".to_string());
        }
        if self.resolver.aws_binary.is_empty() {
            errors.push("resolver.aws_binary must not be empty".to_string());
        }
        if self.resolver.timeout_secs == 0 {
            errors.push("resolver.timeout_secs must be positive".to_string());
        }
        if self.cluster.kubectl_binary.is_empty() {
            errors.push("cluster.kubectl_binary must not be empty".to_string());
        }
        if self.cluster.timeout_secs == 0 {
            errors.push("cluster.timeout_secs must be positive".to_string());
        }
        if self.targets.file_sd_path.is_empty() {
            errors.push("targets.file_sd_path must not be empty".to_string());
        }
        if self.targets.port == 0 {
            errors.push("targets.port must be positive".to_string());
        }
        if self.targets.timeout_secs == 0 {
            errors.push("targets.timeout_secs must be positive".to_string());
        }
        if self.targets.labels.contains_key("instance_id") {
            errors.push("targets.labels must not override the instance_id label".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
