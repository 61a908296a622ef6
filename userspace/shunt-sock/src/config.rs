// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stack configuration. Every knob has a default; deployments override via
//! TOML fragments shipped next to the poll-loop bootstrap.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Process-wide stack configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackConfig {
    /// Shared-memory name prefix, mirroring the poll-mode driver's
    /// `--file-prefix` startup parameter.
    pub file_prefix: String,
    /// Poll loops (and tuple-index shards). One per dedicated core.
    pub cores: usize,
    /// Descriptor table capacity (sockets + epoll instances).
    pub max_descriptors: usize,
    /// The IPv4 address this stack answers for.
    pub local_ip: [u8; 4],
    pub local_mac: [u8; 6],
    /// Next-hop MAC for egress frames. Neighbor discovery is the bridge's
    /// problem, not the fast path's.
    pub gateway_mac: [u8; 6],
    /// Listen backlog applied when the caller passes 0.
    pub default_backlog: usize,
    /// Per-socket receive queue bound, bytes.
    pub recv_buf: usize,
    /// Per-connection send ring capacity, bytes.
    pub send_buf: usize,
    pub ephemeral_min: u16,
    pub ephemeral_max: u16,
    /// Frames pulled from a port per poll pass.
    pub rx_burst: usize,
    pub rto_initial_ms: u64,
    pub rto_max_ms: u64,
    pub max_retx: u32,
    pub time_wait_ms: u64,
    /// Keepalive defaults, seconds; per-socket options override.
    pub keepalive_idle_s: u32,
    pub keepalive_intvl_s: u32,
    pub keepalive_cnt: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            file_prefix: "shunt".to_string(),
            cores: 1,
            max_descriptors: 4096,
            local_ip: [10, 0, 0, 1],
            local_mac: [0x02, 0x53, 0x48, 0x4e, 0x54, 0x01],
            gateway_mac: [0x02, 0x53, 0x48, 0x4e, 0x54, 0xff],
            default_backlog: shunt_net::DEFAULT_BACKLOG,
            recv_buf: 256 * 1024,
            send_buf: 64 * 1024,
            ephemeral_min: 49152,
            ephemeral_max: 65535,
            rx_burst: 32,
            rto_initial_ms: 1000,
            rto_max_ms: 60_000,
            max_retx: 8,
            time_wait_ms: 2000,
            keepalive_idle_s: 7200,
            keepalive_intvl_s: 75,
            keepalive_cnt: 9,
        }
    }
}

impl StackConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: StackConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cores == 0 {
            return Err(ConfigError::Invalid("cores must be >= 1"));
        }
        if self.max_descriptors < 8 {
            return Err(ConfigError::Invalid("max_descriptors must be >= 8"));
        }
        if self.ephemeral_min == 0 || self.ephemeral_min >= self.ephemeral_max {
            return Err(ConfigError::Invalid("ephemeral port range is empty"));
        }
        if self.rx_burst == 0 {
            return Err(ConfigError::Invalid("rx_burst must be >= 1"));
        }
        if self.send_buf == 0 || self.recv_buf == 0 {
            return Err(ConfigError::Invalid("buffer bounds must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StackConfig::default().validate().expect("defaults");
    }

    #[test]
    fn toml_overrides_round_trip() {
        let cfg = StackConfig::from_toml_str(
            r#"
            file_prefix = "lane0"
            cores = 4
            local_ip = [192, 168, 7, 2]
            default_backlog = 128
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.file_prefix, "lane0");
        assert_eq!(cfg.cores, 4);
        assert_eq!(cfg.local_ip, [192, 168, 7, 2]);
        assert_eq!(cfg.default_backlog, 128);
        // untouched knobs keep defaults
        assert_eq!(cfg.max_descriptors, 4096);
    }

    #[test]
    fn zero_cores_rejected() {
        assert!(matches!(
            StackConfig::from_toml_str("cores = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            StackConfig::from_toml_str("lcores = 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
