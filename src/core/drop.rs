use crate::core::error::{TrapError, TrapResult};
use crate::core::hit::Hit;
use crate::core::token::Token;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// What kind of decoy artifact the token is embedded in. Closed set; the
/// kind decides which listener forensics apply and which extra fields the
/// drop carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenKind {
    Dns,
    /// Web directory listing beacon; only meaningful with decoded context.
    DirectoryListing,
    /// Command-injection beacon; only meaningful with decoded context.
    CommandInjection,
    ClonedSite {
        domain: String,
    },
    Mysql,
    Wireguard {
        /// Hex-encoded X25519 public key of the decoy peer.
        peer_public_key: String,
    },
}

impl TokenKind {
    /// Kinds whose hits are suppressed when the forensic payload decodes to
    /// nothing: ordinary DNS chatter would false-positive them otherwise.
    pub fn requires_forensics(&self) -> bool {
        matches!(self, TokenKind::DirectoryListing | TokenKind::CommandInjection)
    }
}

/// Who owns the drop. Decides the default alert quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerTier {
    Anonymous,
    Registered,
}

impl OwnerTier {
    pub fn default_alert_limit(self) -> u32 {
        match self {
            OwnerTier::Anonymous => 5,
            OwnerTier::Registered => 120,
        }
    }

    pub fn default_alert_expiry(self) -> Duration {
        match self {
            OwnerTier::Anonymous => Duration::from_secs(60 * 60),
            OwnerTier::Registered => Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The closed set of notification channels a drop can fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannelKind {
    Email,
    Webhook,
    Sms,
}

impl fmt::Display for AlertChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertChannelKind::Email => f.write_str("email"),
            AlertChannelKind::Webhook => f.write_str("webhook"),
            AlertChannelKind::Sms => f.write_str("sms"),
        }
    }
}

/// The persisted configuration bound to one token: who to notify and how.
/// Single source of truth for dispatch; listeners never cache it beyond a
/// single hit's handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDrop {
    pub token: Token,
    pub created_at: SystemTime,
    /// Management access secret, hex.
    pub auth: String,
    pub memo: String,
    #[serde(flatten)]
    pub kind: TokenKind,
    pub tier: OwnerTier,

    /// Alert quota; counts within a rolling expiry window.
    pub alert_limit: u32,
    pub alert_expiry_secs: u64,

    pub alert_email_enabled: bool,
    pub alert_email_recipient: Option<String>,
    pub alert_webhook_enabled: bool,
    pub alert_webhook_url: Option<String>,
    pub alert_sms_enabled: bool,
    pub alert_sms_number: Option<String>,
}

impl TokenDrop {
    pub fn new(kind: TokenKind, memo: String, tier: OwnerTier) -> Self {
        let mut auth = [0u8; 20];
        OsRng.fill_bytes(&mut auth);
        Self {
            token: Token::generate(),
            created_at: SystemTime::now(),
            auth: hex::encode(auth),
            memo,
            kind,
            tier,
            alert_limit: tier.default_alert_limit(),
            alert_expiry_secs: tier.default_alert_expiry().as_secs(),
            alert_email_enabled: false,
            alert_email_recipient: None,
            alert_webhook_enabled: false,
            alert_webhook_url: None,
            alert_sms_enabled: false,
            alert_sms_number: None,
        }
    }

    pub fn alert_expiry(&self) -> Duration {
        Duration::from_secs(self.alert_expiry_secs)
    }

    /// Channels currently enabled and carrying a recipient.
    pub fn enabled_channels(&self) -> Vec<AlertChannelKind> {
        let mut channels = Vec::new();
        if self.alert_email_enabled && self.alert_email_recipient.is_some() {
            channels.push(AlertChannelKind::Email);
        }
        if self.alert_webhook_enabled && self.alert_webhook_url.is_some() {
            channels.push(AlertChannelKind::Webhook);
        }
        if self.alert_sms_enabled && self.alert_sms_number.is_some() {
            channels.push(AlertChannelKind::Sms);
        }
        channels
    }

    pub fn disable_channel(&mut self, channel: AlertChannelKind) {
        match channel {
            AlertChannelKind::Email => self.alert_email_enabled = false,
            AlertChannelKind::Webhook => self.alert_webhook_enabled = false,
            AlertChannelKind::Sms => self.alert_sms_enabled = false,
        }
    }

    /// Invariant checks applied after deserialization; a stored drop that
    /// fails these is treated as corrupt, not silently patched.
    pub fn validate(&self) -> TrapResult<()> {
        Token::parse(self.token.as_str())?;
        if self.alert_email_enabled && self.alert_email_recipient.is_none() {
            return Err(TrapError::DropValidationError(
                "email enabled without a recipient".into(),
            ));
        }
        if self.alert_webhook_enabled && self.alert_webhook_url.is_none() {
            return Err(TrapError::DropValidationError(
                "webhook enabled without a URL".into(),
            ));
        }
        if self.alert_sms_enabled && self.alert_sms_number.is_none() {
            return Err(TrapError::DropValidationError(
                "sms enabled without a number".into(),
            ));
        }
        if let TokenKind::Wireguard { peer_public_key } = &self.kind {
            let bytes = hex::decode(peer_public_key).map_err(|_| {
                TrapError::DropValidationError("peer public key is not hex".into())
            })?;
            if bytes.len() != 32 {
                return Err(TrapError::DropValidationError(
                    "peer public key must be 32 bytes".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Persistence boundary for drops, hit history and the counters the alert
/// gate reads. Counter mutations are atomic per token: listeners on
/// different sockets may report hits for one token concurrently.
#[async_trait::async_trait]
pub trait DropRepository: Send + Sync {
    async fn get(&self, token: &Token) -> TrapResult<Option<TokenDrop>>;
    async fn save(&self, drop: &TokenDrop) -> TrapResult<()>;
    async fn remove(&self, token: &Token) -> TrapResult<()>;
    async fn all(&self) -> TrapResult<Vec<TokenDrop>>;

    /// Appends to the bounded per-token history, assigning the next sequence
    /// number, and returns the stored hit. Oldest entries beyond the
    /// retention cap are evicted.
    async fn record_hit(&self, hit: Hit) -> TrapResult<Hit>;
    /// Stored hits in arrival order.
    async fn hits(&self, token: &Token) -> TrapResult<Vec<Hit>>;

    /// Bumps the rolling alert counter and returns the count inside the
    /// current window. The window restarts once `expiry` has elapsed since
    /// the first counted alert.
    async fn increment_accounting(&self, token: &Token, expiry: Duration) -> TrapResult<u32>;
    /// Current in-window alert count without bumping it.
    async fn accounting_count(&self, token: &Token, expiry: Duration) -> TrapResult<u32>;

    /// Bumps the consecutive-failure counter for one output channel and
    /// returns the new value.
    async fn record_delivery_failure(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<u32>;
    async fn clear_delivery_failures(
        &self,
        token: &Token,
        channel: AlertChannelKind,
    ) -> TrapResult<()>;
    /// Disables the channel on the stored drop and resets its failure count.
    async fn disable_channel(&self, token: &Token, channel: AlertChannelKind) -> TrapResult<()>;
}
