//! Validated runtime configuration for the bridge

use core::fmt;

use serde::Deserialize;

use bridge_proto::rewrite::Rule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The EnvFilter directive this level maps to
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub log_level: LogLevel,
    /// Optional verbose log file
    pub log_file: Option<String>,
    /// Local peer/repeater ID used on both sides of the bridge
    pub id: u32,
    /// Seconds before an idle call stream is dropped
    pub stream_timeout_secs: u64,
    pub ipsc: CfgIpsc,
    pub masters: Vec<CfgMaster>,
}

/// IPSC server settings. The virtual network interface named here must
/// already exist and carry `ip`; creating it is out of scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgIpsc {
    pub interface: String,
    pub ip: String,
    pub subnet_mask: u8,
    pub port: u16,
    /// Seconds without a keep-alive before a peer is evicted
    pub peer_timeout_secs: u64,
    pub auth: CfgIpscAuth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CfgIpscAuth {
    pub enabled: bool,
    /// Up to 40 hex characters; zero-padded on the left to 20 key bytes
    pub key: String,
}

/// One upstream MMDVM master connection
#[derive(Debug, Clone, PartialEq)]
pub struct CfgMaster {
    pub callsign: String,
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Receive frequency in Hz
    pub rx_freq: u32,
    /// Transmit frequency in Hz
    pub tx_freq: u32,
    /// Transmit power in dBm
    pub tx_power: u8,
    pub color_code: u8,
    /// North positive, [-90, +90]
    pub latitude: f64,
    /// East positive, [-180, +180]
    pub longitude: f64,
    /// Height in meters
    pub height: u16,
    pub location: String,
    pub description: String,
    pub url: String,
    /// Bitmask of slots carried to this master: bit 0 = TS1, bit 1 = TS2
    pub slots: u8,
    /// Rules applied to frames arriving from this master
    pub rewrite_in: Vec<Rule>,
    /// Rules applied to frames leaving for this master
    pub rewrite_out: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    UnrecognizedFields(String),
    NoMasters,
    InvalidCallsign,
    InvalidColorCode(u8),
    InvalidLatitude(f64),
    InvalidLongitude(f64),
    InvalidMasterHost,
    InvalidMasterPassword,
    InvalidSlotMask(u8),
    InvalidInterface,
    InvalidIp,
    InvalidSubnetMask(u8),
    InvalidAuthKey,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {}", e),
            Self::Parse(e) => write!(f, "config parse error: {}", e),
            Self::UnrecognizedFields(fields) => write!(f, "unrecognized config fields: {}", fields),
            Self::NoMasters => write!(f, "at least one [[master]] section is required"),
            Self::InvalidCallsign => write!(f, "invalid master callsign provided"),
            Self::InvalidColorCode(cc) => write!(f, "invalid color code {} (0-15)", cc),
            Self::InvalidLatitude(v) => write!(f, "invalid latitude {} (-90..90)", v),
            Self::InvalidLongitude(v) => write!(f, "invalid longitude {} (-180..180)", v),
            Self::InvalidMasterHost => write!(f, "invalid master host provided"),
            Self::InvalidMasterPassword => write!(f, "invalid master password provided"),
            Self::InvalidSlotMask(m) => write!(f, "invalid slot mask {:#04x} (1-3)", m),
            Self::InvalidInterface => write!(f, "invalid IPSC interface provided"),
            Self::InvalidIp => write!(f, "invalid IPSC IP address provided"),
            Self::InvalidSubnetMask(m) => write!(f, "invalid IPSC subnet mask {} (1-32)", m),
            Self::InvalidAuthKey => write!(f, "invalid IPSC authentication key provided"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn is_hex_key(key: &str) -> bool {
    key.len() <= 40 && key.chars().all(|c| c.is_ascii_hexdigit())
}

impl BridgeConfig {
    /// Check every invariant the bridge relies on. Called once before
    /// startup; any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.masters.is_empty() {
            return Err(ConfigError::NoMasters);
        }

        for master in &self.masters {
            if master.callsign.is_empty() {
                return Err(ConfigError::InvalidCallsign);
            }
            if master.color_code > 15 {
                return Err(ConfigError::InvalidColorCode(master.color_code));
            }
            if !(-90.0..=90.0).contains(&master.latitude) {
                return Err(ConfigError::InvalidLatitude(master.latitude));
            }
            if !(-180.0..=180.0).contains(&master.longitude) {
                return Err(ConfigError::InvalidLongitude(master.longitude));
            }
            if master.host.is_empty() {
                return Err(ConfigError::InvalidMasterHost);
            }
            if master.password.is_empty() {
                return Err(ConfigError::InvalidMasterPassword);
            }
            if master.slots == 0 || master.slots > 3 {
                return Err(ConfigError::InvalidSlotMask(master.slots));
            }
        }

        if self.ipsc.interface.is_empty() {
            return Err(ConfigError::InvalidInterface);
        }
        if self.ipsc.ip.is_empty() || self.ipsc.ip.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(ConfigError::InvalidIp);
        }
        if self.ipsc.subnet_mask < 1 || self.ipsc.subnet_mask > 32 {
            return Err(ConfigError::InvalidSubnetMask(self.ipsc.subnet_mask));
        }

        if self.ipsc.auth.enabled && self.ipsc.auth.key.is_empty() {
            return Err(ConfigError::InvalidAuthKey);
        }
        if !is_hex_key(&self.ipsc.auth.key) {
            return Err(ConfigError::InvalidAuthKey);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BridgeConfig {
        BridgeConfig {
            log_level: LogLevel::Info,
            log_file: None,
            id: 311860,
            stream_timeout_secs: 2,
            ipsc: CfgIpsc {
                interface: "ipsc0".into(),
                ip: "10.10.250.1".into(),
                subnet_mask: 24,
                port: 50000,
                peer_timeout_secs: 60,
                auth: CfgIpscAuth { enabled: false, key: String::new() },
            },
            masters: vec![CfgMaster {
                callsign: "N0CALL".into(),
                id: 311860,
                host: "master.example.com".into(),
                port: 62031,
                password: "s3cret".into(),
                rx_freq: 449_000_000,
                tx_freq: 444_000_000,
                tx_power: 50,
                color_code: 1,
                latitude: 35.0,
                longitude: -97.0,
                height: 30,
                location: "Oklahoma".into(),
                description: "Test Repeater".into(),
                url: "https://example.com".into(),
                slots: 3,
                rewrite_in: Vec::new(),
                rewrite_out: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_no_masters() {
        let mut cfg = valid_config();
        cfg.masters.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::NoMasters));
    }

    #[test]
    fn test_empty_callsign() {
        let mut cfg = valid_config();
        cfg.masters[0].callsign.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidCallsign));
    }

    #[test]
    fn test_color_code_bounds() {
        let mut cfg = valid_config();
        cfg.masters[0].color_code = 15;
        assert!(cfg.validate().is_ok());
        cfg.masters[0].color_code = 16;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidColorCode(16)));
    }

    #[test]
    fn test_latitude_bounds() {
        let mut cfg = valid_config();
        for ok in [-90.0, 0.0, 90.0] {
            cfg.masters[0].latitude = ok;
            assert!(cfg.validate().is_ok());
        }
        cfg.masters[0].latitude = 90.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidLatitude(_))));
        cfg.masters[0].latitude = -91.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidLatitude(_))));
    }

    #[test]
    fn test_longitude_bounds() {
        let mut cfg = valid_config();
        for ok in [-180.0, 0.0, 180.0] {
            cfg.masters[0].longitude = ok;
            assert!(cfg.validate().is_ok());
        }
        cfg.masters[0].longitude = 180.1;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidLongitude(_))));
    }

    #[test]
    fn test_empty_host_and_password() {
        let mut cfg = valid_config();
        cfg.masters[0].host.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidMasterHost));

        let mut cfg = valid_config();
        cfg.masters[0].password.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidMasterPassword));
    }

    #[test]
    fn test_slot_mask_bounds() {
        let mut cfg = valid_config();
        for ok in [1u8, 2, 3] {
            cfg.masters[0].slots = ok;
            assert!(cfg.validate().is_ok());
        }
        cfg.masters[0].slots = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSlotMask(0)));
        cfg.masters[0].slots = 4;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSlotMask(4)));
    }

    #[test]
    fn test_interface_and_ip() {
        let mut cfg = valid_config();
        cfg.ipsc.interface.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidInterface));

        let mut cfg = valid_config();
        cfg.ipsc.ip = "not-an-ip".into();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidIp));
    }

    #[test]
    fn test_subnet_mask_bounds() {
        let mut cfg = valid_config();
        for bad in [0u8, 33] {
            cfg.ipsc.subnet_mask = bad;
            assert_eq!(cfg.validate(), Err(ConfigError::InvalidSubnetMask(bad)));
        }
        for ok in [1u8, 24, 32] {
            cfg.ipsc.subnet_mask = ok;
            assert!(cfg.validate().is_ok());
        }
    }

    #[test]
    fn test_auth_key_required_when_enabled() {
        let mut cfg = valid_config();
        cfg.ipsc.auth.enabled = true;
        cfg.ipsc.auth.key = String::new();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidAuthKey));
    }

    #[test]
    fn test_auth_key_hex_only() {
        let mut cfg = valid_config();
        cfg.ipsc.auth.enabled = true;
        cfg.ipsc.auth.key = "xyz".into();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidAuthKey));

        cfg.ipsc.auth.key = "0123456789abcdefABCDEF".into();
        assert!(cfg.validate().is_ok());

        // 41 hex chars is one too many
        cfg.ipsc.auth.key = "0".repeat(41);
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidAuthKey));
        cfg.ipsc.auth.key = "0".repeat(40);
        assert!(cfg.validate().is_ok());
    }
}
