use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `MAILFLOW__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

// ─── Executor Config ────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on instantaneous steps chained for one enrollment in one pass.
    #[serde(default = "default_max_steps_per_pass")]
    pub max_steps_per_pass: usize,
    /// Failed side-effect attempts tolerated on a single step before the
    /// enrollment is blocked for the flow owner.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// How often a condition waiting on engagement is re-checked before its
    /// timeout.
    #[serde(default = "default_condition_recheck_ms")]
    pub condition_recheck_ms: u64,
}

fn default_node_id() -> String {
    "worker-01".to_string()
}
fn default_executor_enabled() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    60_000
}
fn default_batch_size() -> usize {
    500
}
fn default_max_steps_per_pass() -> usize {
    32
}
fn default_max_attempts() -> u32 {
    5
}
fn default_condition_recheck_ms() -> u64 {
    60_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: default_executor_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_steps_per_pass: default_max_steps_per_pass(),
            max_attempts: default_max_attempts(),
            condition_recheck_ms: default_condition_recheck_ms(),
        }
    }
}

// ─── Segmentation Config ────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SegmentationConfig {
    /// Archival hint applied to segments registered without one.
    #[serde(default)]
    pub default_cleanup_days: Option<u32>,
}

// ─── Email Config ───────────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_unsubscribe_placeholder")]
    pub unsubscribe_placeholder: String,
}

fn default_from_email() -> String {
    "hello@mailflow.local".to_string()
}
fn default_from_name() -> String {
    "Mailflow".to_string()
}
fn default_unsubscribe_placeholder() -> String {
    "{{unsubscribe_url}}".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            unsubscribe_placeholder: default_unsubscribe_placeholder(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            executor: ExecutorConfig::default(),
            segmentation: SegmentationConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("MAILFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
