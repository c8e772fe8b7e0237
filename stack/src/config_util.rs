//! Config file reads for the HFP service.

use log::LevelFilter;
use serde_json::Value;

/// File holding the HFP service configuration.
const HFP_SERVICE_CONF: &str = "/var/lib/bluetooth/hfp_service.json";

/// In the absence of other values, allow this many simultaneous connections.
const DEFAULT_MAX_CONNECTED_DEVICES: usize = 5;

/// Default timeout for pending connection and audio transitions.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

pub fn read_config() -> std::io::Result<String> {
    std::fs::read_to_string(HFP_SERVICE_CONF)
}

pub fn get_log_level() -> Option<LevelFilter> {
    get_log_level_internal(read_config().ok()?)
}

fn get_log_level_internal(config: String) -> Option<LevelFilter> {
    serde_json::from_str::<Value>(config.as_str())
        .ok()?
        .get("log_level")?
        .as_str()?
        .parse::<LevelFilter>()
        .ok()
}

pub fn get_max_connected_devices() -> usize {
    read_config()
        .ok()
        .and_then(get_max_connected_devices_internal)
        .unwrap_or(DEFAULT_MAX_CONNECTED_DEVICES)
}

fn get_max_connected_devices_internal(config: String) -> Option<usize> {
    serde_json::from_str::<Value>(config.as_str())
        .ok()?
        .get("max_connected_devices")?
        .as_u64()
        .map(|v| v as usize)
}

pub fn get_connect_timeout_ms() -> u64 {
    read_config()
        .ok()
        .and_then(get_connect_timeout_ms_internal)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS)
}

fn get_connect_timeout_ms_internal(config: String) -> Option<u64> {
    serde_json::from_str::<Value>(config.as_str())
        .ok()?
        .get("connect_timeout_ms")?
        .as_u64()
}

/// Assembled service configuration with file overrides applied.
#[derive(Clone, Debug)]
pub struct HfpServiceConfig {
    /// How many devices may hold a non-disconnected machine at once.
    pub max_connected_devices: usize,
    /// Timeout for pending connection and audio transitions.
    pub connect_timeout_ms: u64,
    /// Whether audio may be routed to headsets at all.
    pub audio_route_allowed: bool,
    /// When set, SCO is brought up by an external audio server and the
    /// service only tracks state.
    pub sco_managed_by_audio: bool,
    /// Permit connections to devices that are not bonded.
    pub allow_unbonded: bool,
}

impl Default for HfpServiceConfig {
    fn default() -> Self {
        HfpServiceConfig {
            max_connected_devices: DEFAULT_MAX_CONNECTED_DEVICES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            audio_route_allowed: true,
            sco_managed_by_audio: false,
            allow_unbonded: false,
        }
    }
}

impl HfpServiceConfig {
    /// Loads overrides from the config file, falling back to defaults.
    pub fn load() -> Self {
        HfpServiceConfig {
            max_connected_devices: get_max_connected_devices(),
            connect_timeout_ms: get_connect_timeout_ms(),
            ..Default::default()
        }
    }
}
