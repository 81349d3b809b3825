pub mod bridge_config;
pub mod toml_config;

pub use bridge_config::{BridgeConfig, CfgIpsc, CfgIpscAuth, CfgMaster, ConfigError, LogLevel};
