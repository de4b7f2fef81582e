use crate::core::token::Token;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::SystemTime;

/// One observed trigger event for a token. Immutable once built; the
/// sequence number is assigned by the store at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub token: Token,
    pub input_channel: String,
    pub src_ip: IpAddr,
    pub time: SystemTime,
    /// Store-assigned, monotonically increasing per token.
    #[serde(default)]
    pub seq: u64,
    /// Free-form forensic detail: user agent, decoded DNS sub-labels,
    /// MySQL client locale, WireGuard peer public key, and so on.
    #[serde(default)]
    pub additional_info: BTreeMap<String, String>,
}

impl Hit {
    pub fn new(token: Token, input_channel: &str, src_ip: IpAddr) -> Self {
        Self {
            token,
            input_channel: input_channel.to_string(),
            src_ip,
            time: SystemTime::now(),
            seq: 0,
            additional_info: BTreeMap::new(),
        }
    }

    pub fn with_info(mut self, key: &str, value: impl Into<String>) -> Self {
        self.additional_info.insert(key.to_string(), value.into());
        self
    }
}
