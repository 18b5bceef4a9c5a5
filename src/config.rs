use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Client-facing listener and holding world settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// The backend server process and how to reach it
    pub backend: BackendConfig,

    /// Checkpoint/restore (hibernate) settings
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Per-entity-type reference encodings
    #[serde(default)]
    pub translation: TranslationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port players connect to (default: 25500)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Message of the day shown in the server list
    #[serde(default = "default_motd")]
    pub motd: String,

    /// Advertised player limit (default: 20)
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Usernames allowed to log in. When unset, everyone may join.
    pub whitelist: Option<Vec<String>>,

    /// Interval between proxy-originated keep-alives in seconds (default: 15)
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Directory of `<x>_<z>.bin` chunk files for the holding world
    pub holding_world_dir: Option<String>,

    /// View distance announced by the holding world (default: 10)
    #[serde(default = "default_view_distance")]
    pub view_distance: i32,

    /// PID file path; the file is locked while the proxy runs
    pub pid_file: Option<String>,
}

impl ProxyConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn is_whitelisted(&self, username: &str) -> bool {
        match &self.whitelist {
            Some(names) => names.iter().any(|n| n == username),
            None => true,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            motd: default_motd(),
            max_players: default_max_players(),
            whitelist: None,
            keep_alive_interval_secs: default_keep_alive_interval(),
            holding_world_dir: None,
            view_distance: default_view_distance(),
            pid_file: None,
        }
    }
}

/// Configuration for the backend server
///
/// # Security Warning
///
/// `executable` and `args` are executed directly with the permissions of the
/// proxy. Configuration files must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Address the backend listens on (default: 127.0.0.1)
    #[serde(default = "default_backend_address")]
    pub address: String,

    /// Port the backend listens on (default: 25565)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Program to run
    pub executable: String,

    /// Arguments to pass to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the program
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Regex matched against each output line; a match means the backend is ready
    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: String,

    /// Delay between the ready line and routing players to the backend
    #[serde(default)]
    pub warmup_ms: u64,

    /// Append-only log file to tail for readiness; stdout is used when unset
    pub log_file: Option<String>,

    /// Command written to stdin for a graceful stop; SIGTERM is sent when unset
    #[serde(default = "default_stop_command")]
    pub stop_command: Option<String>,

    /// Grace period in seconds between the stop request and SIGKILL (default: 30)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Seconds without players before the backend is stopped (default: 300)
    #[serde(default = "default_idle_shutdown")]
    pub idle_shutdown_secs: u64,
}

impl BackendConfig {
    /// Create a backend config with defaults for everything but the program
    pub fn new(executable: &str) -> Self {
        Self {
            address: default_backend_address(),
            port: default_backend_port(),
            executable: executable.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            ready_pattern: default_ready_pattern(),
            warmup_ms: 0,
            log_file: None,
            stop_command: default_stop_command(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            idle_shutdown_secs: default_idle_shutdown(),
        }
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    pub fn ready_regex(&self) -> anyhow::Result<Regex> {
        Regex::new(&self.ready_pattern)
            .map_err(|e| anyhow::anyhow!("Invalid backend.ready_pattern: {}", e))
    }

    /// Log file path resolved against the working directory
    pub fn log_path(&self) -> Option<PathBuf> {
        let file = self.log_file.as_ref()?;
        let path = PathBuf::from(file);
        match (&self.working_dir, path.is_relative()) {
            (Some(dir), true) => Some(Path::new(dir).join(path)),
            _ => Some(path),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    /// Hibernate the backend with checkpoint/restore instead of stopping it
    #[serde(default)]
    pub enabled: bool,

    /// Path to the checkpoint utility (default: criu)
    #[serde(default = "default_criu_path")]
    pub criu_path: String,

    /// Directory holding the checkpoint pointer record and image directories
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            criu_path: default_criu_path(),
            images_dir: default_images_dir(),
        }
    }
}

/// Which metadata entry of an entity type carries an optional entity reference
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct MetadataReference {
    pub entity_type: i32,
    pub key: u8,
}

/// Entity types whose spawn data or metadata embed other entity ids.
///
/// Type ids follow the 1.15 entity registry.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TranslationConfig {
    /// Types whose spawn `objectData` is a plain entity id
    #[serde(default = "default_direct_object_data_types")]
    pub direct_object_data_types: Vec<i32>,

    /// Types whose spawn `objectData` is `id + 1`, with 0 meaning none
    #[serde(default = "default_offset_object_data_types")]
    pub offset_object_data_types: Vec<i32>,

    /// Metadata entries holding `id + 1`, with 0 meaning none
    #[serde(default = "default_metadata_references")]
    pub metadata_references: Vec<MetadataReference>,
}

impl TranslationConfig {
    pub fn is_direct_object_data(&self, entity_type: i32) -> bool {
        self.direct_object_data_types.contains(&entity_type)
    }

    pub fn is_offset_object_data(&self, entity_type: i32) -> bool {
        self.offset_object_data_types.contains(&entity_type)
    }

    /// Metadata key carrying an embedded reference for this type
    pub fn metadata_reference_key(&self, entity_type: i32) -> Option<u8> {
        self.metadata_references
            .iter()
            .find(|r| r.entity_type == entity_type)
            .map(|r| r.key)
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            direct_object_data_types: default_direct_object_data_types(),
            offset_object_data_types: default_offset_object_data_types(),
            metadata_references: default_metadata_references(),
        }
    }
}

pub const ENTITY_ARROW: i32 = 2;
pub const ENTITY_DRAGON_FIREBALL: i32 = 15;
pub const ENTITY_FIREWORK_ROCKET: i32 = 26;
pub const ENTITY_FIREBALL: i32 = 37;
pub const ENTITY_SMALL_FIREBALL: i32 = 69;
pub const ENTITY_SPECTRAL_ARROW: i32 = 72;
pub const ENTITY_WITHER_SKULL: i32 = 92;
pub const ENTITY_TRIDENT: i32 = 94;
pub const ENTITY_FISHING_BOBBER: i32 = 102;

fn default_direct_object_data_types() -> Vec<i32> {
    vec![
        ENTITY_FISHING_BOBBER,
        ENTITY_FIREBALL,
        ENTITY_SMALL_FIREBALL,
        ENTITY_DRAGON_FIREBALL,
        ENTITY_WITHER_SKULL,
    ]
}

fn default_offset_object_data_types() -> Vec<i32> {
    vec![ENTITY_ARROW, ENTITY_SPECTRAL_ARROW, ENTITY_TRIDENT]
}

fn default_metadata_references() -> Vec<MetadataReference> {
    vec![
        MetadataReference {
            entity_type: ENTITY_FISHING_BOBBER,
            key: 7,
        },
        MetadataReference {
            entity_type: ENTITY_FIREWORK_ROCKET,
            key: 8,
        },
    ]
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    25500
}

fn default_motd() -> String {
    "A sleeping server".to_string()
}

fn default_max_players() -> u32 {
    20
}

fn default_keep_alive_interval() -> u64 {
    15
}

fn default_view_distance() -> i32 {
    10
}

fn default_backend_address() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    25565
}

fn default_ready_pattern() -> String {
    r#"INFO\]: Done \([0-9.]+s\)! For help, type "help""#.to_string()
}

fn default_stop_command() -> Option<String> {
    Some("stop".to_string())
}

fn default_shutdown_grace_period() -> u64 {
    30
}

fn default_idle_shutdown() -> u64 {
    300
}

fn default_criu_path() -> String {
    "criu".to_string()
}

fn default_images_dir() -> String {
    "./checkpoints".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.executable.trim().is_empty() {
            anyhow::bail!("backend.executable must not be empty");
        }

        self.backend.ready_regex()?;

        if self.checkpoint.enabled && self.backend.log_file.is_none() {
            anyhow::bail!(
                "checkpoint.enabled requires backend.log_file: a restored process prints no startup banner on stdout"
            );
        }

        if self.proxy.keep_alive_interval_secs == 0 {
            anyhow::bail!("proxy.keep_alive_interval_secs must be greater than zero");
        }

        Ok(())
    }
}
