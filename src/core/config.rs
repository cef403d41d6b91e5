//! Configuration - Engine settings loaded from `aleph.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-machine engine.

use super::types::{ConfigMap, WorkerSpec};
use super::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Per-component settings, keyed by component name
    #[serde(default)]
    pub components: BTreeMap<String, ConfigMap>,

    /// Workers created by `run` once the engine is up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Local slot processes to start (0 = one per available CPU)
    #[serde(default)]
    pub local_slots: usize,
    /// Max concurrent workers hosted by one slot
    #[serde(default = "default_workers_per_slot")]
    pub workers_per_slot: usize,
    /// Bound on a CreateWorker round trip
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Bound on a StopWorker round trip before the worker is declared lost
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// How long `create_worker` waits for a free slot (0 = fail fast)
    #[serde(default)]
    pub acquire_wait_ms: u64,
    /// A degraded local slot is terminated after this long
    #[serde(default = "default_degraded_timeout")]
    pub degraded_timeout_ms: u64,
    /// Holds `logs/`, `components/` and `keys.json`
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
}

fn default_workers_per_slot() -> usize {
    4
}
fn default_ack_timeout() -> u64 {
    5_000
}
fn default_stop_timeout() -> u64 {
    5_000
}
fn default_degraded_timeout() -> u64 {
    10_000
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("aleph-data")
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            local_slots: 0,
            workers_per_slot: default_workers_per_slot(),
            ack_timeout_ms: default_ack_timeout(),
            stop_timeout_ms: default_stop_timeout(),
            acquire_wait_ms: 0,
            degraded_timeout_ms: default_degraded_timeout(),
            root_dir: default_root_dir(),
        }
    }
}

impl EngineSection {
    /// Resolved local slot count.
    pub fn local_slot_count(&self) -> usize {
        if self.local_slots > 0 {
            return self.local_slots;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn acquire_wait(&self) -> Option<Duration> {
        (self.acquire_wait_ms > 0).then(|| Duration::from_millis(self.acquire_wait_ms))
    }

    pub fn degraded_timeout(&self) -> Duration {
        Duration::from_millis(self.degraded_timeout_ms)
    }
}

/// How local slots are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMode {
    /// One OS process per slot
    #[default]
    Process,
    /// Slots run as tasks inside the control process (tests, debugging)
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default)]
    pub mode: IpcMode,
    /// Loopback address slot processes connect back to
    #[serde(default = "default_ipc_listen")]
    pub listen: String,
    /// Shared secret presented by slot processes (generated when empty)
    #[serde(default)]
    pub auth_key: String,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_ms: u64,
    /// Executable used for slot processes (defaults to the running binary)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_binary: Option<PathBuf>,
}

fn default_ipc_listen() -> String {
    "127.0.0.1:0".to_string()
}
fn default_launch_timeout() -> u64 {
    10_000
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            mode: IpcMode::Process,
            listen: default_ipc_listen(),
            auth_key: String::new(),
            launch_timeout_ms: default_launch_timeout(),
            host_binary: None,
        }
    }
}

impl IpcConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gateway_listen")]
    pub listen: String,
    /// Shared token remote nodes must present
    #[serde(default)]
    pub token: String,
    /// Heartbeat period P
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
    /// Missed periods before a node's slots are degraded
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Total silence before a node's slots are terminated
    #[serde(default = "default_silence_window")]
    pub silence_window_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

fn default_gateway_listen() -> String {
    "0.0.0.0:7400".to_string()
}
fn default_heartbeat() -> u64 {
    1_000
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_silence_window() -> u64 {
    10_000
}
fn default_handshake_timeout() -> u64 {
    5_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_gateway_listen(),
            token: String::new(),
            heartbeat_ms: default_heartbeat(),
            missed_heartbeats: default_missed_heartbeats(),
            silence_window_ms: default_silence_window(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl EngineConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Self {
        let candidates = ["aleph.toml", concat!(env!("CARGO_MANIFEST_DIR"), "/aleph.toml")];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path);
                    return cfg;
                }
                Err(Error::Io(_)) => continue,
                Err(e) => tracing::warn!("⚠️ Ignoring {}: {}", path, e),
            }
        }

        tracing::warn!("⚠️ No aleph.toml found, using defaults");
        Self::default()
    }

    /// Apply `ALEPH_AUTH_KEY` / `ALEPH_GATEWAY_TOKEN` from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ALEPH_AUTH_KEY")
            && !key.is_empty()
        {
            self.ipc.auth_key = key;
        }
        if let Ok(token) = std::env::var("ALEPH_GATEWAY_TOKEN")
            && !token.is_empty()
        {
            self.gateway.token = token;
        }
    }

    /// Fill in a random local IPC key when none was configured.
    pub fn ensure_auth_key(&mut self) -> &str {
        if self.ipc.auth_key.is_empty() {
            self.ipc.auth_key = generate_auth_key();
        }
        &self.ipc.auth_key
    }

    pub fn component_config(&self, name: &str) -> ConfigMap {
        self.components.get(name).cloned().unwrap_or_default()
    }

    /// A default config file with comments.
    pub fn template() -> String {
        let d = Self::default();
        format!(
            r#"# AlephTX orchestrator configuration

[engine]
# Local slot processes (0 = one per CPU)
local_slots = {local_slots}
workers_per_slot = {workers_per_slot}
ack_timeout_ms = {ack}
stop_timeout_ms = {stop}
# 0 = fail fast with a placement error when every slot is full
acquire_wait_ms = {acquire}
degraded_timeout_ms = {degraded}
root_dir = "{root}"

[ipc]
# process | in_process
mode = "process"
listen = "{ipc_listen}"
# Leave empty to generate a random key at startup
auth_key = ""
launch_timeout_ms = {launch}

[gateway]
enabled = false
listen = "{gw_listen}"
token = ""
heartbeat_ms = {hb}
missed_heartbeats = {missed}
silence_window_ms = {silence}
handshake_timeout_ms = {handshake}

[components.api_keys]

[components.event_log]

# [[workers]]
# strategy = "debug"
# components = ["debug", "persistence"]
# config = {{ tick_ms = 1000 }}
"#,
            local_slots = d.engine.local_slots,
            workers_per_slot = d.engine.workers_per_slot,
            ack = d.engine.ack_timeout_ms,
            stop = d.engine.stop_timeout_ms,
            acquire = d.engine.acquire_wait_ms,
            degraded = d.engine.degraded_timeout_ms,
            root = d.engine.root_dir.display(),
            ipc_listen = d.ipc.listen,
            launch = d.ipc.launch_timeout_ms,
            gw_listen = d.gateway.listen,
            hb = d.gateway.heartbeat_ms,
            missed = d.gateway.missed_heartbeats,
            silence = d.gateway.silence_window_ms,
            handshake = d.gateway.handshake_timeout_ms,
        )
    }
}

/// 128 random bytes, hex encoded.
pub fn generate_auth_key() -> String {
    let bytes: Vec<u8> = (0..16)
        .flat_map(|_| rand::random::<u64>().to_le_bytes())
        .collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.engine.workers_per_slot, 4);
        assert_eq!(cfg.gateway.missed_heartbeats, 3);
        assert_eq!(cfg.ipc.mode, IpcMode::Process);
        assert!(cfg.engine.acquire_wait().is_none());
    }

    #[test]
    fn test_template_parses() {
        let cfg: EngineConfig = toml::from_str(&EngineConfig::template()).unwrap();
        assert!(cfg.components.contains_key("api_keys"));
        assert_eq!(cfg.gateway.heartbeat_ms, 1_000);
    }

    #[test]
    fn test_worker_entries() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [engine]
            local_slots = 2

            [[workers]]
            strategy = "debug"
            components = ["debug"]
            config = { tick_ms = 50 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.local_slot_count(), 2);
        assert_eq!(cfg.workers.len(), 1);
        assert_eq!(cfg.workers[0].config["tick_ms"], 50);
    }

    #[test]
    fn test_generated_key_length() {
        let mut cfg = EngineConfig::default();
        assert_eq!(cfg.ensure_auth_key().len(), 256);
        let first = cfg.ipc.auth_key.clone();
        assert_eq!(cfg.ensure_auth_key(), first);
    }
}
