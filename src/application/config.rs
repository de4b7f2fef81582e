use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub dns: DnsConfig,
    pub mysql: MysqlConfig,
    pub wireguard: WireguardConfig,
    pub alerting: AlertingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Persist drops and hits to disk; otherwise everything lives in memory.
    pub persistent: bool,
    /// Hits retained per token; oldest evicted beyond this.
    pub hit_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub bind: String,
    /// Domains this server is authoritative for; token queries arrive as
    /// subdomains of these.
    pub canary_domains: Vec<String>,
    /// Suffixes answered NXDOMAIN after a token hit (tokens that expect a
    /// negative answer).
    pub nxdomain_suffixes: Vec<String>,
    /// Address returned in dynamic A answers.
    pub public_ip: Ipv4Addr,
    pub ns_name: String,
    pub soa_email: String,
    /// TTL for apex/authoritative answers.
    pub apex_ttl: u32,
    /// TTL for token-bearing answers; short so repeat probes are not cached
    /// away.
    pub token_ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    pub bind: String,
    /// Hex-encoded X25519 private keys of the decoy devices. Fixed at
    /// startup; passed into the listener, never global.
    pub device_private_keys: Vec<String>,
    /// Handshake timestamps older or newer than this are replays.
    pub handshake_freshness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Consecutive delivery errors before a channel is disabled on a drop.
    pub failure_threshold: u32,
    /// Timeout applied to each outbound delivery call.
    pub send_timeout_secs: u64,
    pub smtp_relay: String,
    pub smtp_from: String,
    pub sms_gateway_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                db_path: PathBuf::from("drops.db"),
                persistent: true,
                hit_retention: 50,
            },
            dns: DnsConfig {
                bind: "0.0.0.0:5353".to_string(),
                canary_domains: vec!["canary.example.com".to_string()],
                nxdomain_suffixes: Vec::new(),
                public_ip: Ipv4Addr::new(127, 0, 0, 1),
                ns_name: "ns1.canary.example.com".to_string(),
                soa_email: "hostmaster.canary.example.com".to_string(),
                apex_ttl: 300,
                token_ttl: 10,
            },
            mysql: MysqlConfig {
                bind: "0.0.0.0:3306".to_string(),
            },
            wireguard: WireguardConfig {
                bind: "0.0.0.0:51820".to_string(),
                device_private_keys: Vec::new(),
                handshake_freshness_secs: 5,
            },
            alerting: AlertingConfig {
                failure_threshold: 5,
                send_timeout_secs: 10,
                smtp_relay: "localhost".to_string(),
                smtp_from: "alerts@canary.example.com".to_string(),
                sms_gateway_url: "http://localhost:9080/sms".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)?;
        let config = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    pub fn init_default(path: &Path) -> Result<Self> {
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }
}
