//! Build a `BridgeConfig` from a TOML configuration file

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use bridge_proto::rewrite::Rule;

use super::bridge_config::{BridgeConfig, CfgIpsc, CfgIpscAuth, CfgMaster, ConfigError, LogLevel};

/// Parse and validate a TOML configuration string
pub fn from_toml_str(toml_str: &str) -> Result<BridgeConfig, ConfigError> {
    let root: TomlConfigRoot = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Reject anything we do not understand rather than silently ignoring it
    if !root.extra.is_empty() {
        return Err(ConfigError::UnrecognizedFields(format!("{:?}", sorted_keys(&root.extra))));
    }
    if !root.ipsc.extra.is_empty() {
        return Err(ConfigError::UnrecognizedFields(format!("ipsc::{:?}", sorted_keys(&root.ipsc.extra))));
    }
    if let Some(ref auth) = root.ipsc.auth {
        if !auth.extra.is_empty() {
            return Err(ConfigError::UnrecognizedFields(format!("ipsc.auth::{:?}", sorted_keys(&auth.extra))));
        }
    }
    for master in &root.master {
        if !master.extra.is_empty() {
            return Err(ConfigError::UnrecognizedFields(format!("master::{:?}", sorted_keys(&master.extra))));
        }
    }

    let auth = match root.ipsc.auth {
        Some(dto) => CfgIpscAuth {
            enabled: dto.enabled.unwrap_or(false),
            key: dto.key.unwrap_or_default(),
        },
        None => CfgIpscAuth { enabled: false, key: String::new() },
    };

    let cfg = BridgeConfig {
        log_level: root.log_level.unwrap_or(LogLevel::Info),
        log_file: root.log_file,
        id: root.id,
        stream_timeout_secs: root.stream_timeout_secs.unwrap_or(2),
        ipsc: CfgIpsc {
            interface: root.ipsc.interface,
            ip: root.ipsc.ip.unwrap_or_else(|| "10.10.250.1".to_string()),
            subnet_mask: root.ipsc.subnet_mask.unwrap_or(24),
            port: root.ipsc.port,
            peer_timeout_secs: root.ipsc.peer_timeout_secs.unwrap_or(60),
            auth,
        },
        masters: root.master.into_iter().map(|m| build_master(m, root.id)).collect(),
    };

    cfg.validate()?;
    Ok(cfg)
}

/// Build a `BridgeConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<BridgeConfig, ConfigError> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader
        .read_to_string(&mut contents)
        .map_err(|e| ConfigError::Io(e.to_string()))?;
    from_toml_str(&contents)
}

/// Build a `BridgeConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<BridgeConfig, ConfigError> {
    let f = File::open(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    from_reader(BufReader::new(f))
}

fn build_master(dto: MasterDto, default_id: u32) -> CfgMaster {
    CfgMaster {
        callsign: dto.callsign,
        id: dto.id.unwrap_or(default_id),
        host: dto.host,
        port: dto.port,
        password: dto.password,
        rx_freq: dto.rx_freq,
        tx_freq: dto.tx_freq,
        tx_power: dto.tx_power.unwrap_or(25),
        color_code: dto.color_code.unwrap_or(1),
        latitude: dto.latitude.unwrap_or(0.0),
        longitude: dto.longitude.unwrap_or(0.0),
        height: dto.height.unwrap_or(0),
        location: dto.location.unwrap_or_default(),
        description: dto.description.unwrap_or_default(),
        url: dto.url.unwrap_or_default(),
        slots: dto.slots.unwrap_or(3),
        rewrite_in: dto.rewrite_in,
        rewrite_out: dto.rewrite_out,
    }
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&str> {
    let mut v: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
    v.sort_unstable();
    v
}

/// ----------------------- DTOs for input shape -----------------------

#[derive(Deserialize)]
struct TomlConfigRoot {
    log_level: Option<LogLevel>,
    log_file: Option<String>,
    /// Local peer/repeater ID
    id: u32,
    stream_timeout_secs: Option<u64>,

    ipsc: IpscDto,

    #[serde(default)]
    master: Vec<MasterDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct IpscDto {
    interface: String,
    ip: Option<String>,
    subnet_mask: Option<u8>,
    port: u16,
    peer_timeout_secs: Option<u64>,

    #[serde(default)]
    auth: Option<IpscAuthDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct IpscAuthDto {
    enabled: Option<bool>,
    key: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct MasterDto {
    callsign: String,
    id: Option<u32>,
    host: String,
    port: u16,
    password: String,
    rx_freq: u32,
    tx_freq: u32,
    tx_power: Option<u8>,
    color_code: Option<u8>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    height: Option<u16>,
    location: Option<String>,
    description: Option<String>,
    url: Option<String>,
    slots: Option<u8>,

    #[serde(default)]
    rewrite_in: Vec<Rule>,
    #[serde(default)]
    rewrite_out: Vec<Rule>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}
