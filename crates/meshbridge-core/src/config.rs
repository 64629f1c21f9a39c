//! Configuration types for the bridge
//!
//! A deployment is described by one JSON document. Every section has
//! defaults so a minimal file only names its transports; durations are
//! written as humantime strings (`"10s"`, `"5m"`).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::persist;

/// Maximum on-air payload of a single radio packet
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Stream framing magic number (first 2 bytes of every serial/TCP frame)
pub const STREAM_MAGIC: u16 = 0x94C3;

/// Default baud rate for serial radios
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

/// Default TCP port radios listen on
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default chunk size in bytes
pub const DEFAULT_FRAME_SIZE: usize = 200;

/// Default maximum number of chunks per outbound message
pub const DEFAULT_MAX_CHUNKS: usize = 5;

/// Default marker prefixed to machine-generated text
pub const DEFAULT_MACHINE_MARKER: &str = "m@i- ";

/// Length of a generated command alias suffix
pub const ALIAS_SUFFIX_LEN: usize = 2;

/// Longest alias suffix accepted from configuration
pub const MAX_ALIAS_SUFFIX_LEN: usize = 8;

/// Main configuration for the bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Transports in priority order; the first healthy one wins
    #[serde(default)]
    pub transports: Vec<TransportConfig>,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Liveness monitor settings
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Outbound chunking and pacing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Command alias and reserved commands
    #[serde(default)]
    pub commands: CommandConfig,

    /// Bot-loop prevention
    #[serde(default)]
    pub loop_prevention: LoopPreventionConfig,

    /// When the bridge replies to inbound traffic
    #[serde(default)]
    pub response: ResponseConfig,

    /// Plugin host settings
    #[serde(default)]
    pub plugins: PluginHostConfig,

    /// Identity of this bridge node, used by built-in commands
    #[serde(default)]
    pub node: NodeConfig,
}

/// Physical connection to the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP connection to a radio with a network interface
    Tcp {
        /// Host address
        host: String,
        /// Port number
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    /// Serial port connection
    Serial {
        /// Path to serial port; auto-detected when absent
        #[serde(default)]
        port: Option<PathBuf>,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first retry of the full transport list
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the retry delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Growth factor applied after each failed round
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    /// Maximum number of reconnection rounds (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> u32 {
    2
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: 0, // Infinite
        }
    }
}

/// Liveness monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Interval between probes while connected
    #[serde(with = "humantime_serde", default = "default_liveness_interval")]
    pub interval: Duration,

    /// Time a single probe may take
    #[serde(with = "humantime_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    /// Consecutive link failures tolerated in the degraded state
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_degraded_threshold() -> u32 {
    2
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: default_liveness_interval(),
            probe_timeout: default_probe_timeout(),
            degraded_threshold: default_degraded_threshold(),
        }
    }
}

/// Outbound scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum bytes of text per chunk
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Delay between consecutive chunks
    #[serde(with = "humantime_serde", default = "default_chunk_delay")]
    pub chunk_delay: Duration,

    /// Chunks beyond this count are truncated
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    /// Requests buffered before the oldest normal request is dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_chunk_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_chunks() -> usize {
    DEFAULT_MAX_CHUNKS
}

fn default_queue_depth() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            chunk_delay: default_chunk_delay(),
            max_chunks: DEFAULT_MAX_CHUNKS,
            queue_depth: default_queue_depth(),
        }
    }
}

/// Command recognition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Per-deployment alias suffix (`/help-<suffix>`); generated when absent
    #[serde(default)]
    pub alias_suffix: Option<String>,

    /// Commands accepted without the alias suffix
    #[serde(default = "default_reserved")]
    pub reserved: Vec<String>,

    /// Commands that raise an emergency alert
    #[serde(default = "default_emergency")]
    pub emergency: Vec<String>,

    /// Canned-response commands
    #[serde(default)]
    pub custom: Vec<CustomCommand>,
}

fn default_reserved() -> Vec<String> {
    ["emergency", "911", "ping", "test"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_emergency() -> Vec<String> {
    vec!["emergency".to_string(), "911".to_string()]
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            alias_suffix: None,
            reserved: default_reserved(),
            emergency: default_emergency(),
            custom: Vec::new(),
        }
    }
}

/// A command answered with fixed text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCommand {
    /// Command name without slash or suffix
    pub command: String,
    /// Reply text
    pub response: String,
    /// Help text
    #[serde(default)]
    pub description: String,
}

/// Loop-prevention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPreventionConfig {
    /// Prefix marking machine-generated text
    #[serde(default = "default_machine_marker")]
    pub machine_marker: String,

    /// How long a node stays suppressed after emitting machine traffic
    #[serde(with = "humantime_serde", default = "default_suppression_ttl")]
    pub suppression_ttl: Duration,

    /// Maximum number of suppressed nodes tracked
    #[serde(default = "default_suppression_capacity")]
    pub suppression_capacity: usize,
}

fn default_machine_marker() -> String {
    DEFAULT_MACHINE_MARKER.to_string()
}

fn default_suppression_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_suppression_capacity() -> usize {
    256
}

impl Default for LoopPreventionConfig {
    fn default() -> Self {
        Self {
            machine_marker: default_machine_marker(),
            suppression_ttl: default_suppression_ttl(),
            suppression_capacity: default_suppression_capacity(),
        }
    }
}

/// Reply gating; never affects observers or emergency alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Reply to direct messages
    #[serde(default = "default_true")]
    pub respond_in_directs: bool,

    /// Reply to channel broadcasts
    #[serde(default = "default_true")]
    pub respond_in_channels: bool,

    /// Reply to broadcasts on the primary channel (index 0)
    #[serde(default)]
    pub respond_on_primary_channel: bool,

    /// Reply to traffic that arrived through a relay gateway
    #[serde(default)]
    pub respond_to_relayed: bool,

    /// Pause before a reply is queued
    #[serde(with = "humantime_serde", default = "default_reply_delay")]
    pub reply_delay: Duration,
}

fn default_reply_delay() -> Duration {
    Duration::ZERO
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            respond_in_directs: true,
            respond_in_channels: true,
            respond_on_primary_channel: false,
            respond_to_relayed: false,
            reply_delay: Duration::ZERO,
        }
    }
}

/// Plugin host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginHostConfig {
    /// Directory scanned for plugin subdirectories
    #[serde(default = "default_plugin_root")]
    pub root: PathBuf,

    /// Subdirectories starting with this prefix are templates
    #[serde(default = "default_template_prefix")]
    pub template_prefix: String,

    /// Time budget for a single hook call
    #[serde(with = "humantime_serde", default = "default_hook_timeout")]
    pub hook_timeout: Duration,

    /// Time the host waits for a plugin to stop on unload
    #[serde(with = "humantime_serde", default = "default_unload_timeout")]
    pub unload_timeout: Duration,

    /// Consecutive hook failures before a plugin is disabled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_plugin_root() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_template_prefix() -> String {
    "_".to_string()
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_unload_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            root: default_plugin_root(),
            template_prefix: default_template_prefix(),
            hook_timeout: default_hook_timeout(),
            unload_timeout: default_unload_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Identity of the bridge node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Free-form location description
    #[serde(default)]
    pub location: Option<String>,

    /// Message of the day
    #[serde(default = "default_motd")]
    pub motd: String,
}

fn default_node_name() -> String {
    "MeshBridge".to_string()
}

fn default_motd() -> String {
    "Welcome to the mesh.".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            location: None,
            motd: default_motd(),
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration document
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BridgeError::InvalidConfig(e.to_string()))
    }

    /// Load configuration from a file.
    ///
    /// When no alias suffix is configured one is generated and written
    /// back to the file so it survives restarts.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_json(&text)?;

        if config.commands.ensure_alias() {
            let mut document: serde_json::Value = serde_json::from_str(&text)?;
            if let Some(root) = document.as_object_mut() {
                let commands = root
                    .entry("commands")
                    .or_insert_with(|| serde_json::json!({}));
                if let Some(commands) = commands.as_object_mut() {
                    commands.insert(
                        "alias_suffix".to_string(),
                        serde_json::Value::String(config.commands.alias().to_string()),
                    );
                }
            }
            match persist::atomic_write_json(path, &document).await {
                Ok(()) => info!(
                    alias = config.commands.alias(),
                    "Generated command alias suffix"
                ),
                Err(e) => warn!(error = %e, "Could not persist generated alias suffix"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;
        if self.transports.is_empty() {
            return Err(BridgeError::MissingConfig("transports".to_string()));
        }
        Ok(())
    }

    /// Everything [`BridgeConfig::validate`] checks except the transport
    /// list, for bridges handed their transports directly
    pub(crate) fn validate_settings(&self) -> Result<()> {
        let max_text = LORA_MAX_PAYLOAD - crate::frame::HEADER_LEN;
        if self.scheduler.frame_size == 0 || self.scheduler.frame_size > max_text {
            return Err(BridgeError::InvalidConfig(format!(
                "scheduler.frame_size must be between 1 and {}",
                max_text
            )));
        }
        if self.scheduler.max_chunks == 0 {
            return Err(BridgeError::InvalidConfig(
                "scheduler.max_chunks must be at least 1".to_string(),
            ));
        }
        if self.scheduler.queue_depth == 0 {
            return Err(BridgeError::InvalidConfig(
                "scheduler.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.loop_prevention.machine_marker.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "loop_prevention.machine_marker must not be empty".to_string(),
            ));
        }
        if self.loop_prevention.suppression_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "loop_prevention.suppression_capacity must be at least 1".to_string(),
            ));
        }
        if self.plugins.failure_threshold == 0 {
            return Err(BridgeError::InvalidConfig(
                "plugins.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.reconnect.multiplier == 0 {
            return Err(BridgeError::InvalidConfig(
                "reconnect.multiplier must be at least 1".to_string(),
            ));
        }
        match self.commands.alias_suffix.as_deref() {
            None => {
                return Err(BridgeError::MissingConfig(
                    "commands.alias_suffix".to_string(),
                ))
            }
            Some(alias) if !is_valid_alias(alias) => {
                return Err(BridgeError::InvalidConfig(format!(
                    "commands.alias_suffix {:?} must be 1-{} lowercase letters or digits",
                    alias, MAX_ALIAS_SUFFIX_LEN
                )))
            }
            Some(_) => {}
        }
        Ok(())
    }
}

impl CommandConfig {
    /// The alias suffix, or an empty string before one is assigned
    pub fn alias(&self) -> &str {
        self.alias_suffix.as_deref().unwrap_or("")
    }

    /// Generate an alias suffix if none is configured. Returns true when
    /// a new one was generated.
    pub fn ensure_alias(&mut self) -> bool {
        if self.alias_suffix.as_deref().is_some_and(|s| !s.is_empty()) {
            return false;
        }
        self.alias_suffix = Some(generate_alias_suffix());
        true
    }

    /// Whether `name` is accepted without the alias suffix
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.iter().any(|r| r.eq_ignore_ascii_case(name))
    }

    /// Whether `name` raises an emergency alert
    pub fn is_emergency(&self, name: &str) -> bool {
        self.emergency.iter().any(|r| r.eq_ignore_ascii_case(name))
    }
}

/// Generate a random alias suffix of lowercase letters and digits
pub fn generate_alias_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..ALIAS_SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn is_valid_alias(alias: &str) -> bool {
    !alias.is_empty()
        && alias.len() <= MAX_ALIAS_SUFFIX_LEN
        && alias
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transport to the priority list
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transports.push(transport);
        self
    }

    /// Append a TCP transport
    pub fn tcp(self, host: impl Into<String>, port: u16) -> Self {
        self.transport(TransportConfig::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Append a serial transport
    pub fn serial(self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.transport(TransportConfig::Serial {
            port: Some(port.into()),
            baud_rate,
        })
    }

    /// Set the chunk size in bytes
    pub fn frame_size(mut self, size: usize) -> Self {
        self.config.scheduler.frame_size = size;
        self
    }

    /// Set the delay between chunks
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.config.scheduler.chunk_delay = delay;
        self
    }

    /// Set the maximum chunk count
    pub fn max_chunks(mut self, max: usize) -> Self {
        self.config.scheduler.max_chunks = max;
        self
    }

    /// Set the outbound queue depth
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.scheduler.queue_depth = depth;
        self
    }

    /// Set the command alias suffix
    pub fn alias_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.commands.alias_suffix = Some(suffix.into());
        self
    }

    /// Add a canned-response command
    pub fn custom_command(
        mut self,
        command: impl Into<String>,
        response: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.config.commands.custom.push(CustomCommand {
            command: command.into(),
            response: response.into(),
            description: description.into(),
        });
        self
    }

    /// Set the machine-origin marker
    pub fn machine_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.loop_prevention.machine_marker = marker.into();
        self
    }

    /// Set suppression TTL and capacity
    pub fn suppression(mut self, ttl: Duration, capacity: usize) -> Self {
        self.config.loop_prevention.suppression_ttl = ttl;
        self.config.loop_prevention.suppression_capacity = capacity;
        self
    }

    /// Set reconnect backoff bounds
    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_delay = initial;
        self.config.reconnect.max_delay = max;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set the liveness probe interval
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.config.liveness.interval = interval;
        self
    }

    /// Set the plugin root directory
    pub fn plugin_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.plugins.root = root.into();
        self
    }

    /// Set the per-hook time budget
    pub fn hook_timeout(mut self, timeout: Duration) -> Self {
        self.config.plugins.hook_timeout = timeout;
        self
    }

    /// Set the unload wait bound
    pub fn unload_timeout(mut self, timeout: Duration) -> Self {
        self.config.plugins.unload_timeout = timeout;
        self
    }

    /// Set consecutive failures before auto-disable
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.plugins.failure_threshold = threshold;
        self
    }

    /// Allow replies to broadcasts on the primary channel
    pub fn respond_on_primary_channel(mut self, enabled: bool) -> Self {
        self.config.response.respond_on_primary_channel = enabled;
        self
    }

    /// Allow replies to relayed traffic
    pub fn respond_to_relayed(mut self, enabled: bool) -> Self {
        self.config.response.respond_to_relayed = enabled;
        self
    }

    /// Set the node display name
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node.name = name.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.scheduler.frame_size, DEFAULT_FRAME_SIZE);
        assert_eq!(config.scheduler.max_chunks, 5);
        assert_eq!(config.scheduler.chunk_delay, Duration::from_secs(10));
        assert_eq!(config.loop_prevention.machine_marker, "m@i- ");
        assert!(config.reconnect.enabled);
        assert!(!config.response.respond_on_primary_channel);
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfigBuilder::new()
            .tcp("192.168.1.50", 4403)
            .serial("/dev/ttyACM0", 115_200)
            .frame_size(100)
            .alias_suffix("x7")
            .build();

        assert_eq!(config.transports.len(), 2);
        assert!(matches!(config.transports[0], TransportConfig::Tcp { .. }));
        assert_eq!(config.scheduler.frame_size, 100);
        assert_eq!(config.commands.alias(), "x7");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json_with_durations() {
        let json = r#"{
            "transports": [
                {"type": "tcp", "host": "radio.local"},
                {"type": "serial", "baud_rate": 115200}
            ],
            "scheduler": {"chunk_delay": "2s", "frame_size": 150},
            "commands": {"alias_suffix": "ab"},
            "plugins": {"hook_timeout": "500ms"}
        }"#;
        let config = BridgeConfig::from_json(json).unwrap();
        assert_eq!(
            config.transports[0],
            TransportConfig::Tcp {
                host: "radio.local".to_string(),
                port: DEFAULT_TCP_PORT
            }
        );
        assert_eq!(
            config.transports[1],
            TransportConfig::Serial {
                port: None,
                baud_rate: 115_200
            }
        );
        assert_eq!(config.scheduler.chunk_delay, Duration::from_secs(2));
        assert_eq!(config.scheduler.max_chunks, DEFAULT_MAX_CHUNKS);
        assert_eq!(config.plugins.hook_timeout, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors_are_configuration_class() {
        let config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .frame_size(0)
            .build();
        assert!(config.validate().unwrap_err().is_fatal());

        let config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .machine_marker("  ")
            .build();
        assert!(config.validate().unwrap_err().is_fatal());

        let config = BridgeConfigBuilder::new().alias_suffix("X-7").build();
        assert!(config.validate().unwrap_err().is_fatal());

        let config = BridgeConfigBuilder::new().build();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::MissingConfig(_))
        ));
    }

    #[test]
    fn test_empty_transport_list_rejected() {
        let config = BridgeConfigBuilder::new().alias_suffix("x7").build();
        assert!(config.transports.is_empty());
        let err = config.validate().unwrap_err();
        assert!(matches!(&err, BridgeError::MissingConfig(field) if field == "transports"));
        assert!(err.is_fatal());
        assert!(config.validate_settings().is_ok());

        let parsed = BridgeConfig::from_json(r#"{"transports": [], "commands": {"alias_suffix": "ab"}}"#).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_frame_size_bounded_by_radio_payload() {
        let config = BridgeConfigBuilder::new()
            .alias_suffix("x7")
            .frame_size(LORA_MAX_PAYLOAD)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_alias() {
        let mut commands = CommandConfig::default();
        assert!(commands.ensure_alias());
        assert_eq!(commands.alias().len(), ALIAS_SUFFIX_LEN);
        assert!(is_valid_alias(commands.alias()));
        assert!(!commands.ensure_alias());
    }

    #[test]
    fn test_reserved_and_emergency_lookup() {
        let commands = CommandConfig::default();
        assert!(commands.is_reserved("PING"));
        assert!(commands.is_reserved("911"));
        assert!(!commands.is_reserved("help"));
        assert!(commands.is_emergency("Emergency"));
        assert!(!commands.is_emergency("ping"));
    }

    #[tokio::test]
    async fn test_load_persists_generated_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"node": {"name": "Base"}}"#).unwrap();

        let config = BridgeConfig::load(&path).await.unwrap();
        let alias = config.commands.alias().to_string();
        assert_eq!(alias.len(), ALIAS_SUFFIX_LEN);

        let reloaded = BridgeConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.commands.alias(), alias);
        assert_eq!(reloaded.node.name, "Base");
    }
}
