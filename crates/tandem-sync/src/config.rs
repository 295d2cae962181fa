//! # Sync Settings
//!
//! `SyncConfig` is assembled in three layers, each overriding the last:
//!
//! ```text
//!   built-in defaults      memory:// store, 15 s health checks, port 18790
//!         │
//!         ▼
//!   sync.toml              <config dir>/sync.toml
//!         │                  Linux:  ~/.config/sync/sync.toml
//!         ▼                  macOS:  ~/Library/Application Support/com.tandem.sync/sync.toml
//!   TANDEM_* variables     TANDEM_DEVICE_NAME=Studio
//!                          TANDEM_STORE_URL=wss://sync.example.com/store
//! ```
//!
//! A typical file:
//!
//! ```toml
//! [device]
//! name = "Studio"
//! class = "desktop"
//!
//! [account]
//! id = "me@example.com"
//! zone = "TandemZone"
//!
//! [remote]
//! url = "wss://sync.example.com/store"
//!
//! [transport]
//! direct_endpoints = ["169.254.10.2:18790"]
//! vpn_hostnames = ["studio.tailnet.ts.net", "laptop.tailnet.ts.net"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use tandem_core::{DeviceClass, TransportKind, ZoneId, DEFAULT_PEER_PORT, MDNS_SERVICE_TYPE};

// =============================================================================
// [device]
// =============================================================================

/// Identity of this device.
///
/// The device id is normally generated once and kept in the local database.
/// Setting `id` here pins it instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Shown to other devices, e.g. "Studio" or "Pocket".
    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default)]
    pub class: DeviceClass,
}

fn default_device_name() -> String {
    "Tandem Device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: None,
            name: default_device_name(),
            class: DeviceClass::default(),
        }
    }
}

// =============================================================================
// [account]
// =============================================================================

/// The account whose devices share state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identifier. Peers advertising another account are ignored.
    #[serde(default = "default_account_id")]
    pub id: String,

    /// Zone holding this account's records.
    #[serde(default = "default_zone")]
    pub zone: String,

    /// Base64 AES-256 key. Records are stored unencrypted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

fn default_account_id() -> String {
    "local".to_string()
}

fn default_zone() -> String {
    tandem_core::DEFAULT_ZONE_NAME.to_string()
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            id: default_account_id(),
            zone: default_zone(),
            encryption_key: None,
        }
    }
}

// =============================================================================
// [remote]
// =============================================================================

/// Where the shared record store lives and how hard to try reaching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// `ws://` or `wss://` for a hosted store, `memory://` for an
    /// in-process store.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Seconds allowed for the WebSocket handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds to wait for the answer to one store request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// First redial delay in milliseconds; doubles per miss.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Ceiling on the redial delay in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Dials in a row without a session before the link gives up. 0 keeps
    /// dialing forever.
    #[serde(default)]
    pub max_retries: u32,

    /// Seconds between WebSocket pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Records requested per delta-fetch page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_store_url() -> String {
    "memory://".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}
fn default_page_size() -> u32 {
    200
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            url: default_store_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: 0,
            ping_interval_secs: default_ping_interval(),
            page_size: default_page_size(),
        }
    }
}

impl RemoteSettings {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

// =============================================================================
// [sync]
// =============================================================================

/// Batching, polling and retry knobs for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pending count that triggers an immediate flush.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,

    /// Interval between timer-driven flushes (seconds).
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Interval between polling delta syncs (seconds). Push notifications
    /// trigger syncs in between.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Merge-and-retry rounds before a conflict is surfaced.
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Failed pushes before a pending change is dropped.
    #[serde(default = "default_push_attempts")]
    pub max_push_attempts: u32,
}

fn default_true() -> bool {
    true
}
fn default_batch_threshold() -> usize {
    20
}
fn default_flush_interval() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    300
}
fn default_conflict_retries() -> u32 {
    tandem_core::MAX_CONFLICT_RETRIES
}
fn default_push_attempts() -> u32 {
    10
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled: true,
            batch_threshold: default_batch_threshold(),
            flush_interval_secs: default_flush_interval(),
            poll_interval_secs: default_poll_interval(),
            max_conflict_retries: default_conflict_retries(),
            max_push_attempts: default_push_attempts(),
        }
    }
}

// =============================================================================
// [transport]
// =============================================================================

/// Transport probing and health monitoring.
///
/// ## Probe Timeouts
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  Direct        250 ms   wired bridge, answers almost instantly          │
/// │  LocalNetwork 1000 ms   LAN peers found over mDNS                      │
/// │  VpnOverlay   2500 ms   overlay hostnames, may cross the internet       │
/// │  CloudRelay     never   always available, never blocks selection        │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// `host:port` addresses reachable over a direct link.
    #[serde(default)]
    pub direct_endpoints: Vec<String>,

    /// Per-device hostnames on the VPN overlay.
    #[serde(default)]
    pub vpn_hostnames: Vec<String>,

    /// TCP port probed on peers and served by the peer link.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    #[serde(default = "default_direct_timeout")]
    pub direct_timeout_ms: u64,

    #[serde(default = "default_local_timeout")]
    pub local_timeout_ms: u64,

    #[serde(default = "default_vpn_timeout")]
    pub vpn_timeout_ms: u64,

    /// Interval between health checks of the active transport (seconds).
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Consecutive failed health checks before failover.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Interval between probes of transports better than the active one
    /// (seconds).
    #[serde(default = "default_upgrade_interval")]
    pub upgrade_interval_secs: u64,
}

fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}
fn default_direct_timeout() -> u64 {
    250
}
fn default_local_timeout() -> u64 {
    1000
}
fn default_vpn_timeout() -> u64 {
    2500
}
fn default_health_interval() -> u64 {
    15
}
fn default_failure_threshold() -> u32 {
    tandem_core::FAILURE_THRESHOLD
}
fn default_upgrade_interval() -> u64 {
    60
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            direct_endpoints: Vec::new(),
            vpn_hostnames: Vec::new(),
            peer_port: default_peer_port(),
            direct_timeout_ms: default_direct_timeout(),
            local_timeout_ms: default_local_timeout(),
            vpn_timeout_ms: default_vpn_timeout(),
            health_interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            upgrade_interval_secs: default_upgrade_interval(),
        }
    }
}

impl TransportSettings {
    /// Probe timeout for a transport. `None` for the cloud relay, which is
    /// never probed.
    pub fn probe_timeout(&self, kind: TransportKind) -> Option<Duration> {
        match kind {
            TransportKind::Direct => Some(Duration::from_millis(self.direct_timeout_ms)),
            TransportKind::LocalNetwork => Some(Duration::from_millis(self.local_timeout_ms)),
            TransportKind::VpnOverlay => Some(Duration::from_millis(self.vpn_timeout_ms)),
            TransportKind::CloudRelay => None,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn upgrade_interval(&self) -> Duration {
        Duration::from_secs(self.upgrade_interval_secs)
    }
}

// =============================================================================
// [discovery], [peer], [database]
// =============================================================================

/// Local network discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,

    #[serde(default = "default_service_type")]
    pub service_type: String,
}

fn default_service_type() -> String {
    MDNS_SERVICE_TYPE.to_string()
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            mdns_enabled: true,
            service_type: default_service_type(),
        }
    }
}

/// The peer link server other devices push batches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interface the peer server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest accepted WebSocket message (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Time allowed for one push, handshake to ack (seconds).
    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}
fn default_push_timeout() -> u64 {
    5
}

impl Default for PeerSettings {
    fn default() -> Self {
        PeerSettings {
            enabled: true,
            bind_addr: default_bind_addr(),
            max_message_size: default_max_message_size(),
            push_timeout_secs: default_push_timeout(),
        }
    }
}

/// Local database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Defaults to `tandem.db` in the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// =============================================================================
// SyncConfig
// =============================================================================

/// Every section of `sync.toml`. Missing sections fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub peer: PeerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `sync.toml` (from `config_path` or the platform
    /// config dir) if present, then `TANDEM_*` variables. The result is
    /// validated before it is returned.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let file = config_path
            .or_else(Self::default_config_path)
            .filter(|path| path.exists());

        let mut config = match file {
            Some(path) => {
                info!(?path, "Reading sync.toml");
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
                })?;
                toml::from_str::<SyncConfig>(&raw)?
            }
            None => {
                debug!("No sync.toml found; starting from defaults");
                SyncConfig::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like [`SyncConfig::load`], but a broken file or bad override only
    /// costs a warning.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        match Self::load(config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring unusable sync config");
                Self::default()
            }
        }
    }

    /// Writes the config as pretty TOML, creating parent directories.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let Some(path) = config_path.or_else(Self::default_config_path) else {
            return Err(SyncError::ConfigSaveFailed("no config directory on this platform".into()));
        };
        let io_err =
            |e: std::io::Error| SyncError::ConfigSaveFailed(format!("{}: {}", path.display(), e));

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?).map_err(io_err)?;

        info!(?path, "Wrote sync.toml");
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.as_deref().is_some_and(str::is_empty) {
            return Err(SyncError::MissingDeviceId);
        }

        if !self.remote.is_memory() {
            let url = url::Url::parse(&self.remote.url)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "{} (expected ws://, wss:// or memory://)",
                    self.remote.url
                )));
            }
        }

        let checks = [
            (self.account.zone.trim().is_empty(), "account.zone is empty"),
            (self.sync.batch_threshold == 0, "sync.batch_threshold is 0"),
            (self.sync.max_conflict_retries == 0, "sync.max_conflict_retries is 0"),
            (self.transport.failure_threshold == 0, "transport.failure_threshold is 0"),
            (self.transport.health_interval_secs == 0, "transport.health_interval_secs is 0"),
            (self.transport.upgrade_interval_secs == 0, "transport.upgrade_interval_secs is 0"),
            (self.transport.peer_port == 0, "transport.peer_port is 0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(SyncError::InvalidConfig((*reason).to_string())),
            None => Ok(()),
        }
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// [`SyncConfig::load`]).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("TANDEM_DEVICE_ID") {
            debug!(device_id = %id, "TANDEM_DEVICE_ID pins the device id");
            self.device.id = Some(id);
        }

        if let Some(name) = lookup("TANDEM_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(class) = lookup("TANDEM_DEVICE_CLASS") {
            match class.parse() {
                Ok(parsed) => self.device.class = parsed,
                Err(_) => warn!(class = %class, "Unknown device class in environment"),
            }
        }

        if let Some(account) = lookup("TANDEM_ACCOUNT_ID") {
            self.account.id = account;
        }

        if let Some(zone) = lookup("TANDEM_ZONE") {
            self.account.zone = zone;
        }

        if let Some(key) = lookup("TANDEM_ENCRYPTION_KEY") {
            self.account.encryption_key = Some(key);
        }

        if let Some(url) = lookup("TANDEM_STORE_URL") {
            debug!(url = %url, "Overriding store URL from environment");
            self.remote.url = url;
        }

        if let Some(port) = lookup("TANDEM_PEER_PORT") {
            match port.parse::<u16>() {
                Ok(p) => {
                    debug!(port = p, "Overriding peer port from environment");
                    self.transport.peer_port = p;
                }
                Err(_) => warn!(port = %port, "Invalid peer port in environment"),
            }
        }

        if let Some(hosts) = lookup("TANDEM_VPN_HOSTNAMES") {
            self.transport.vpn_hostnames = split_list(&hosts);
        }

        if let Some(endpoints) = lookup("TANDEM_DIRECT_ENDPOINTS") {
            self.transport.direct_endpoints = split_list(&endpoints);
        }

        if let Some(path) = lookup("TANDEM_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(flag) = lookup("TANDEM_MDNS") {
            self.discovery.mdns_enabled = parse_flag(&flag, self.discovery.mdns_enabled);
        }
    }

    /// `<platform config dir>/sync.toml`, if the platform has one.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tandem", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Database path, falling back to the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "tandem", "sync")
                .map(|dirs| dirs.data_dir().join("tandem.db"))
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn zone(&self) -> ZoneId {
        ZoneId::new(self.account.zone.clone())
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync.enabled
    }

    pub fn peer_bind_address(&self) -> String {
        format!("{}:{}", self.peer.bind_addr, self.transport.peer_port)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(raw: &str, current: bool) -> bool {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.device.id.is_none());
        assert_eq!(config.account.zone, "TandemZone");
        assert_eq!(config.sync.batch_threshold, 20);
        assert_eq!(config.sync.max_conflict_retries, 3);
        assert_eq!(config.transport.peer_port, 18790);
        assert_eq!(config.transport.health_interval_secs, 15);
        assert_eq!(config.transport.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_probe_timeouts_widen_with_rank() {
        let transport = TransportSettings::default();
        let direct = transport.probe_timeout(TransportKind::Direct).unwrap();
        let local = transport.probe_timeout(TransportKind::LocalNetwork).unwrap();
        let vpn = transport.probe_timeout(TransportKind::VpnOverlay).unwrap();

        assert!(direct < local && local < vpn);
        assert_eq!(transport.probe_timeout(TransportKind::CloudRelay), None);
    }

    #[test]
    fn test_validation_rejects_unusable_settings() {
        let mut config = SyncConfig::new();

        config.device.id = Some(String::new());
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = Some("studio".to_string());
        config.remote.url = "http://invalid".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        config.remote.url = "wss://sync.example.com/store".to_string();
        assert!(config.validate().is_ok());

        config.sync.batch_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_DEVICE_CLASS", "iphone"),
            ("TANDEM_PEER_PORT", "19000"),
            ("TANDEM_VPN_HOSTNAMES", "studio.ts.net, laptop.ts.net,"),
            ("TANDEM_MDNS", "off"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.device.class, DeviceClass::Phone);
        assert_eq!(config.transport.peer_port, 19000);
        assert_eq!(config.transport.vpn_hostnames, vec!["studio.ts.net", "laptop.ts.net"]);
        assert!(!config.discovery.mdns_enabled);
    }

    #[test]
    fn test_toml_roundtrip_keeps_sections() {
        let rendered = toml::to_string_pretty(&SyncConfig::new()).unwrap();
        assert!(rendered.contains("[device]"));
        assert!(rendered.contains("[transport]"));

        let parsed: SyncConfig =
            toml::from_str("[device]\nname = \"Pocket\"\nclass = \"phone\"\n").unwrap();
        assert_eq!(parsed.device.name, "Pocket");
        assert_eq!(parsed.device.class, DeviceClass::Phone);
        assert_eq!(parsed.transport.peer_port, 18790);
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("tandem-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("sync.toml");

        let mut config = SyncConfig::new();
        config.device.name = "Studio".into();
        config.transport.vpn_hostnames = vec!["studio.ts.net".into()];
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.transport.vpn_hostnames, vec!["studio.ts.net"]);
        assert_eq!(loaded.account.zone, config.account.zone);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let path =
            std::env::temp_dir().join(format!("tandem-broken-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[sync\nbatch_threshold = ").unwrap();

        assert!(SyncConfig::load(Some(path.clone())).is_err());
        assert_eq!(SyncConfig::load_or_default(Some(path.clone())).sync.batch_threshold, 20);

        std::fs::remove_file(path).unwrap();
    }
}
