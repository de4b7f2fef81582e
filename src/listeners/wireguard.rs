use crate::application::config::WireguardConfig;
use crate::application::switchboard::Switchboard;
use crate::core::drop::{TokenDrop, TokenKind};
use crate::core::error::{TrapError, TrapResult};
use crate::core::hit::Hit;
use crate::core::token::Token;
use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::SimpleHmac;
use log::{debug, error, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use x25519_dalek::{PublicKey, StaticSecret};

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
const LABEL_MAC1: &[u8] = b"mac1----";

const MSG_INITIATION: u8 = 1;
/// type/reserved + sender + ephemeral + encrypted static + encrypted
/// timestamp + mac1 + mac2.
pub const INITIATION_LEN: usize = 4 + 4 + 32 + 48 + 28 + 16 + 16;
/// Everything covered by mac1.
const BODY_LEN: usize = INITIATION_LEN - 32;

/// TAI64 label of the unix epoch as sent by wireguard clients.
const TAI64_BASE: u64 = 0x4000_0000_0000_000a;

type HmacBlake2s = SimpleHmac<Blake2s256>;

fn blake2s(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

fn hmac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = <HmacBlake2s as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// HKDF over HMAC-BLAKE2s, first stage.
fn kdf1(ck: &[u8; 32], input: &[u8]) -> [u8; 32] {
    let t0 = hmac(ck, &[input]);
    hmac(&t0, &[&[0x01]])
}

/// HKDF over HMAC-BLAKE2s, two stages.
fn kdf2(ck: &[u8; 32], input: &[u8]) -> ([u8; 32], [u8; 32]) {
    let t0 = hmac(ck, &[input]);
    let t1 = hmac(&t0, &[&[0x01]]);
    let t2 = hmac(&t0, &[&t1[..], &[0x02]]);
    (t1, t2)
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce)
}

fn aead_open(key: &[u8; 32], counter: u64, ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &nonce_for(counter),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .ok()
}

#[cfg(test)]
fn aead_seal(key: &[u8; 32], counter: u64, plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            &nonce_for(counter),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("sealing cannot fail")
}

fn tai64n_unix_secs(timestamp: &[u8; 12]) -> i64 {
    let secs = u64::from_be_bytes(timestamp[..8].try_into().expect("fixed slice"));
    secs.wrapping_sub(TAI64_BASE) as i64
}

#[cfg(test)]
fn tai64n_at(unix_secs: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&(TAI64_BASE + unix_secs).to_be_bytes());
    out
}

/// One decoy device key-pair. The set is fixed at construction; nothing
/// mutates it while the listener runs.
pub struct Device {
    private: StaticSecret,
    public: PublicKey,
    mac1_key: [u8; 32],
}

impl Device {
    pub fn new(private_bytes: [u8; 32]) -> Self {
        let private = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&private);
        let mac1_key = blake2s(&[LABEL_MAC1, public.as_bytes()]);
        Self {
            private,
            public,
            mac1_key,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn mac1_matches(&self, body: &[u8], mac1: &[u8]) -> bool {
        let mut mac = <Blake2sMac<U16> as Mac>::new_from_slice(&self.mac1_key)
            .expect("mac key is 32 bytes");
        Mac::update(&mut mac, body);
        mac.verify_slice(mac1).is_ok()
    }
}

/// A successfully unsealed handshake initiation.
pub struct Initiation {
    pub sender_index: u32,
    pub peer_static: PublicKey,
    pub timestamp: [u8; 12],
}

/// Runs the responder half of the Noise IK initiation against each
/// candidate device: mac1 selects the device, then the two-stage key
/// derivation unseals the initiator's static key and timestamp. Any
/// mismatch returns `None`; the caller never answers either way.
pub fn consume_initiation(datagram: &[u8], devices: &[Device]) -> Option<(usize, Initiation)> {
    if datagram.len() != INITIATION_LEN
        || datagram[0] != MSG_INITIATION
        || datagram[1..4] != [0, 0, 0]
    {
        return None;
    }
    let body = &datagram[..BODY_LEN];
    let mac1 = &datagram[BODY_LEN..BODY_LEN + 16];
    let device_idx = devices.iter().position(|d| d.mac1_matches(body, mac1))?;
    let device = &devices[device_idx];

    let sender_index = u32::from_le_bytes(datagram[4..8].try_into().expect("fixed slice"));
    let ephemeral: [u8; 32] = datagram[8..40].try_into().expect("fixed slice");
    let encrypted_static = &datagram[40..88];
    let encrypted_timestamp = &datagram[88..116];

    let ck = blake2s(&[CONSTRUCTION]);
    let h = blake2s(&[&ck, IDENTIFIER]);
    let h = blake2s(&[&h, device.public.as_bytes()]);

    let ck = kdf1(&ck, &ephemeral);
    let h = blake2s(&[&h, &ephemeral]);

    let ephemeral_pub = PublicKey::from(ephemeral);
    let dh1 = device.private.diffie_hellman(&ephemeral_pub);
    let (ck, key) = kdf2(&ck, dh1.as_bytes());

    let peer_static: [u8; 32] = aead_open(&key, 0, encrypted_static, &h)?.try_into().ok()?;
    let h = blake2s(&[&h, encrypted_static]);

    let peer_static = PublicKey::from(peer_static);
    let dh2 = device.private.diffie_hellman(&peer_static);
    let (_ck, key) = kdf2(&ck, dh2.as_bytes());

    let timestamp: [u8; 12] = aead_open(&key, 0, encrypted_timestamp, &h)?.try_into().ok()?;

    Some((
        device_idx,
        Initiation {
            sender_index,
            peer_static,
            timestamp,
        },
    ))
}

/// UDP listener posing as a WireGuard endpoint. Stateless per datagram and
/// silent on the wire: a rejected handshake is indistinguishable from a
/// dropped packet.
pub struct WireguardListener {
    bind: String,
    freshness_secs: u64,
    devices: Vec<Device>,
    /// Initiator static public key to token, built from wireguard-kind
    /// drops at startup.
    peers: HashMap<[u8; 32], Token>,
    switchboard: Arc<Switchboard>,
}

impl WireguardListener {
    pub const CHANNEL: &'static str = "wireguard";

    pub fn new(
        config: &WireguardConfig,
        drops: &[TokenDrop],
        switchboard: Arc<Switchboard>,
    ) -> TrapResult<Self> {
        let mut devices = Vec::with_capacity(config.device_private_keys.len());
        for key_hex in &config.device_private_keys {
            let bytes: [u8; 32] = hex::decode(key_hex)
                .map_err(|_| TrapError::ConfigError("device key is not hex".into()))?
                .try_into()
                .map_err(|_| TrapError::ConfigError("device key must be 32 bytes".into()))?;
            devices.push(Device::new(bytes));
        }

        let mut peers = HashMap::new();
        for drop in drops {
            if let TokenKind::Wireguard { peer_public_key } = &drop.kind {
                let bytes: [u8; 32] = hex::decode(peer_public_key)
                    .map_err(|_| TrapError::DropValidationError("peer key is not hex".into()))?
                    .try_into()
                    .map_err(|_| {
                        TrapError::DropValidationError("peer key must be 32 bytes".into())
                    })?;
                peers.insert(bytes, drop.token.clone());
            }
        }

        Ok(Self {
            bind: config.bind.clone(),
            freshness_secs: config.handshake_freshness_secs,
            devices,
            peers,
            switchboard,
        })
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(&self.bind).await?;
        info!(
            "wireguard listener on {} ({} devices, {} peers)",
            socket.local_addr()?,
            self.devices.len(),
            self.peers.len()
        );
        let mut buf = [0u8; 2048];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let datagram = buf[..n].to_vec();
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Some(hit) = this.handle_datagram(&datagram, peer) {
                    if let Err(e) = this.switchboard.dispatch(hit).await {
                        error!("wireguard: dispatch failed: {}", e);
                    }
                }
            });
        }
    }

    /// Evaluates one datagram. No response is ever produced; the only
    /// observable effect of success is the returned hit.
    pub fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Option<Hit> {
        let (device_idx, initiation) = consume_initiation(datagram, &self.devices)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;
        let sent = tai64n_unix_secs(&initiation.timestamp);
        if (now - sent).unsigned_abs() > self.freshness_secs {
            debug!("wireguard: stale handshake timestamp from {}", peer);
            return None;
        }

        let token = self.peers.get(initiation.peer_static.as_bytes())?;
        let device = &self.devices[device_idx];
        Some(
            Hit::new(token.clone(), Self::CHANNEL, peer.ip())
                .with_info("src_port", peer.port().to_string())
                .with_info("peer_public_key", hex::encode(initiation.peer_static.as_bytes()))
                .with_info("device_public_key", hex::encode(device.public_key().as_bytes()))
                .with_info("sender_index", initiation.sender_index.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::switchboard::Switchboard;
    use crate::core::alert::{AlertSender, DeliveryOutcome};
    use crate::core::drop::{DropRepository, OwnerTier};
    use crate::infrastructure::repository::InMemoryDropRepository;
    use rand::rngs::OsRng;
    use std::time::Duration;

    struct NullSender;

    #[async_trait::async_trait]
    impl AlertSender for NullSender {
        async fn send_alert(&self, _drop: &TokenDrop, _hit: &Hit) -> DeliveryOutcome {
            DeliveryOutcome::Sent
        }
    }

    /// Builds a handshake initiation the way a real client would, signing
    /// it for `responder_pub` with the given static identity and timestamp.
    fn build_initiation(
        responder_pub: &PublicKey,
        initiator_static: &StaticSecret,
        timestamp: [u8; 12],
    ) -> Vec<u8> {
        let initiator_pub = PublicKey::from(initiator_static);
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);

        let ck = blake2s(&[CONSTRUCTION]);
        let h = blake2s(&[&ck, IDENTIFIER]);
        let h = blake2s(&[&h, responder_pub.as_bytes()]);

        let ck = kdf1(&ck, ephemeral_pub.as_bytes());
        let h = blake2s(&[&h, ephemeral_pub.as_bytes()]);

        let dh1 = ephemeral.diffie_hellman(responder_pub);
        let (ck, key) = kdf2(&ck, dh1.as_bytes());
        let encrypted_static = aead_seal(&key, 0, initiator_pub.as_bytes(), &h);
        let h = blake2s(&[&h, &encrypted_static]);

        let dh2 = initiator_static.diffie_hellman(responder_pub);
        let (_ck, key) = kdf2(&ck, dh2.as_bytes());
        let encrypted_timestamp = aead_seal(&key, 0, &timestamp, &h);

        let mut msg = Vec::with_capacity(INITIATION_LEN);
        msg.push(MSG_INITIATION);
        msg.extend_from_slice(&[0, 0, 0]);
        msg.extend_from_slice(&7u32.to_le_bytes()); // sender index
        msg.extend_from_slice(ephemeral_pub.as_bytes());
        msg.extend_from_slice(&encrypted_static);
        msg.extend_from_slice(&encrypted_timestamp);

        let mac1_key = blake2s(&[LABEL_MAC1, responder_pub.as_bytes()]);
        let mut mac = <Blake2sMac<U16> as Mac>::new_from_slice(&mac1_key).unwrap();
        Mac::update(&mut mac, &msg);
        let mac1: [u8; 16] = mac.finalize().into_bytes().into();
        msg.extend_from_slice(&mac1);
        msg.extend_from_slice(&[0u8; 16]); // mac2: no cookie
        assert_eq!(msg.len(), INITIATION_LEN);
        msg
    }

    fn now_unix() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn peer_addr() -> SocketAddr {
        "203.0.113.77:51820".parse().unwrap()
    }

    async fn listener_setup(
        device_keys: Vec<StaticSecret>,
        initiator_pub: &PublicKey,
    ) -> (WireguardListener, TokenDrop, Arc<InMemoryDropRepository>) {
        let repo = Arc::new(InMemoryDropRepository::new(50));
        let drop = TokenDrop::new(
            TokenKind::Wireguard {
                peer_public_key: hex::encode(initiator_pub.as_bytes()),
            },
            "vpn decoy".into(),
            OwnerTier::Registered,
        );
        repo.save(&drop).await.unwrap();

        let mut board = Switchboard::new(
            Arc::clone(&repo) as Arc<dyn DropRepository>,
            Arc::new(NullSender),
            Arc::new(NullSender),
            Arc::new(NullSender),
            5,
            Duration::from_secs(5),
        );
        board.register_input_channel(WireguardListener::CHANNEL);

        let config = WireguardConfig {
            bind: "127.0.0.1:0".into(),
            device_private_keys: device_keys
                .iter()
                .map(|k| hex::encode(k.to_bytes()))
                .collect(),
            handshake_freshness_secs: 5,
        };
        let listener =
            WireguardListener::new(&config, &[drop.clone()], Arc::new(board)).unwrap();
        (listener, drop, repo)
    }

    #[tokio::test]
    async fn valid_initiation_yields_a_hit() {
        let device = StaticSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&device);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, drop, _) = listener_setup(vec![device], &initiator_pub).await;

        let msg = build_initiation(&device_pub, &initiator, tai64n_at(now_unix()));
        let hit = listener.handle_datagram(&msg, peer_addr()).unwrap();

        assert_eq!(hit.token, drop.token);
        assert_eq!(
            hit.additional_info.get("peer_public_key").unwrap(),
            &hex::encode(initiator_pub.as_bytes())
        );
        assert_eq!(
            hit.additional_info.get("device_public_key").unwrap(),
            &hex::encode(device_pub.as_bytes())
        );
        assert_eq!(hit.additional_info.get("src_port").unwrap(), "51820");
    }

    #[tokio::test]
    async fn second_device_in_the_pool_still_matches() {
        let first = StaticSecret::random_from_rng(OsRng);
        let second = StaticSecret::random_from_rng(OsRng);
        let second_pub = PublicKey::from(&second);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, _, _) = listener_setup(vec![first, second], &initiator_pub).await;

        let msg = build_initiation(&second_pub, &initiator, tai64n_at(now_unix()));
        assert!(listener.handle_datagram(&msg, peer_addr()).is_some());
    }

    #[tokio::test]
    async fn stale_timestamp_is_dropped() {
        let device = StaticSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&device);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, _, _) = listener_setup(vec![device], &initiator_pub).await;

        // 10 seconds beyond the 5 second freshness window.
        let msg = build_initiation(&device_pub, &initiator, tai64n_at(now_unix() - 15));
        assert!(listener.handle_datagram(&msg, peer_addr()).is_none());
    }

    #[tokio::test]
    async fn tampered_mac1_is_dropped() {
        let device = StaticSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&device);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, _, _) = listener_setup(vec![device], &initiator_pub).await;

        let mut msg = build_initiation(&device_pub, &initiator, tai64n_at(now_unix()));
        msg[120] ^= 0xFF;
        assert!(listener.handle_datagram(&msg, peer_addr()).is_none());
    }

    #[tokio::test]
    async fn unknown_initiator_is_dropped() {
        let device = StaticSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&device);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, _, _) = listener_setup(vec![device], &initiator_pub).await;

        // A different identity handshakes the same device.
        let stranger = StaticSecret::random_from_rng(OsRng);
        let msg = build_initiation(&device_pub, &stranger, tai64n_at(now_unix()));
        assert!(listener.handle_datagram(&msg, peer_addr()).is_none());
    }

    #[tokio::test]
    async fn non_initiation_traffic_is_dropped() {
        let device = StaticSecret::random_from_rng(OsRng);
        let device_pub = PublicKey::from(&device);
        let initiator = StaticSecret::random_from_rng(OsRng);
        let initiator_pub = PublicKey::from(&initiator);
        let (listener, _, _) = listener_setup(vec![device], &initiator_pub).await;

        // Wrong length.
        assert!(listener.handle_datagram(&[1u8; 64], peer_addr()).is_none());
        // Right length, wrong type.
        let mut msg = build_initiation(&device_pub, &initiator, tai64n_at(now_unix()));
        msg[0] = 2;
        assert!(listener.handle_datagram(&msg, peer_addr()).is_none());
    }
}
