use crate::application::config::MysqlConfig;
use crate::application::switchboard::Switchboard;
use crate::core::error::{TrapError, TrapResult};
use crate::core::hit::Hit;
use crate::core::token::Token;
use log::{debug, error, info};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
const CLIENT_PLUGIN_AUTH_LENENC: u32 = 0x0020_0000;

/// Fixed-layout prefix of the handshake response: capabilities, max packet
/// size, charset and 23 reserved bytes. The username starts right after.
const RESPONSE_PREFIX_LEN: usize = 32;
/// Packet header plus prefix plus at least a NUL for the username.
const MIN_HANDSHAKE_LEN: usize = 4 + RESPONSE_PREFIX_LEN + 1;

const READ_DEADLINE: Duration = Duration::from_secs(5);
const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

/// The fixed greeting every connection receives, shaped like a generic
/// MySQL 8 banner. Identical bytes for every peer and every outcome.
pub fn greeting() -> Vec<u8> {
    let mut payload = Vec::with_capacity(80);
    payload.push(0x0a); // protocol version
    payload.extend_from_slice(b"8.0.28\0");
    payload.extend_from_slice(&28u32.to_le_bytes()); // thread id
    payload.extend_from_slice(b"abcdefgh\0"); // auth-plugin-data part 1
    payload.extend_from_slice(&[0xff, 0xf7]); // capabilities (lower)
    payload.push(0x21); // charset: utf8_general_ci
    payload.extend_from_slice(&2u16.to_le_bytes()); // status: autocommit
    payload.extend_from_slice(&[0xff, 0x81]); // capabilities (upper)
    payload.push(21); // auth plugin data length
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend_from_slice(b"ijklmnopqrst\0"); // auth-plugin-data part 2
    payload.extend_from_slice(b"mysql_native_password\0");

    let mut packet = Vec::with_capacity(payload.len() + 4);
    let len = payload.len() as u32;
    packet.extend_from_slice(&len.to_le_bytes()[..3]);
    packet.push(0); // sequence
    packet.extend_from_slice(&payload);
    packet
}

#[derive(Debug)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    /// Best-effort; empty when the client sent none or they failed to parse.
    pub attributes: BTreeMap<String, String>,
}

fn lenc_int(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    match first {
        0x00..=0xfa => Some(first as u64),
        0xfc => {
            let bytes = buf.get(*pos..*pos + 2)?;
            *pos += 2;
            Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
        }
        0xfd => {
            let bytes = buf.get(*pos..*pos + 3)?;
            *pos += 3;
            Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as u64)
        }
        0xfe => {
            let bytes = buf.get(*pos..*pos + 8)?;
            *pos += 8;
            Some(u64::from_le_bytes(bytes.try_into().ok()?))
        }
        _ => None,
    }
}

fn lenc_string(buf: &[u8], pos: &mut usize) -> Option<String> {
    let len = lenc_int(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Walks past the auth response and database name to the connection
/// attribute block. Any surprise returns `None`; attributes are optional
/// forensics, never a reason to abandon the hit.
fn parse_attributes(payload: &[u8], capabilities: u32, mut pos: usize) -> Option<BTreeMap<String, String>> {
    // Skip the auth response.
    if capabilities & CLIENT_PLUGIN_AUTH_LENENC != 0 {
        let len = lenc_int(payload, &mut pos)? as usize;
        pos = pos.checked_add(len)?;
    } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
        let len = *payload.get(pos)? as usize;
        pos = pos.checked_add(1 + len)?;
    } else {
        let end = payload[pos..].iter().position(|&b| b == 0)?;
        pos += end + 1;
    }
    if pos > payload.len() {
        return None;
    }
    if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        let end = payload[pos..].iter().position(|&b| b == 0)?;
        pos += end + 1;
    }
    if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        let end = payload[pos..].iter().position(|&b| b == 0)?;
        pos += end + 1;
    }
    if capabilities & CLIENT_CONNECT_ATTRS == 0 {
        return None;
    }

    let total = lenc_int(payload, &mut pos)? as usize;
    let block_end = pos.checked_add(total)?.min(payload.len());
    let mut attrs = BTreeMap::new();
    while pos < block_end {
        let key = lenc_string(payload, &mut pos)?;
        let value = lenc_string(payload, &mut pos)?;
        attrs.insert(key, value);
    }
    Some(attrs)
}

/// Exact byte-offset decode of the handshake-response packet. `buf` starts
/// at the 4-byte packet header.
pub fn parse_handshake(buf: &[u8]) -> TrapResult<HandshakeResponse> {
    let malformed = |what: &str| TrapError::MalformedProtocolInput(format!("mysql: {}", what));

    if buf.len() < MIN_HANDSHAKE_LEN {
        return Err(malformed("short handshake"));
    }
    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    let payload = &buf[4..buf.len().min(4 + payload_len)];
    if payload.len() < RESPONSE_PREFIX_LEN + 1 {
        return Err(malformed("short payload"));
    }

    let capabilities = u32::from_le_bytes(payload[0..4].try_into().expect("fixed slice"));
    let max_packet_size = u32::from_le_bytes(payload[4..8].try_into().expect("fixed slice"));
    let charset = payload[8];
    // payload[9..32] is reserved filler.

    let name_end = payload[RESPONSE_PREFIX_LEN..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("unterminated username"))?;
    let username =
        String::from_utf8_lossy(&payload[RESPONSE_PREFIX_LEN..RESPONSE_PREFIX_LEN + name_end])
            .into_owned();

    let attributes = parse_attributes(payload, capabilities, RESPONSE_PREFIX_LEN + name_end + 1)
        .unwrap_or_default();

    Ok(HandshakeResponse {
        capabilities,
        max_packet_size,
        charset,
        username,
        attributes,
    })
}

/// Poses as a MySQL server just long enough to read the login packet. The
/// username field carries the token; the connection is closed after one
/// exchange no matter what happened.
pub struct MysqlListener {
    config: MysqlConfig,
    switchboard: Arc<Switchboard>,
}

impl MysqlListener {
    pub const CHANNEL: &'static str = "mysql";

    pub fn new(config: MysqlConfig, switchboard: Arc<Switchboard>) -> Self {
        Self { config, switchboard }
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!("mysql listener on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_connection(stream, peer).await;
            });
        }
    }

    /// One exchange: greeting out, login packet in, connection closed.
    /// Every failure path is swallowed; the peer sees the same bytes
    /// whether or not a token was found.
    pub async fn handle_connection<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = stream.write_all(&greeting()).await {
            debug!("mysql: greeting to {} failed: {}", peer, e);
            return;
        }

        let buf = match tokio::time::timeout(READ_DEADLINE, read_handshake(&mut stream)).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                debug!("mysql: read from {} failed: {}", peer, e);
                let _ = stream.shutdown().await;
                return;
            }
            Err(_) => {
                debug!("mysql: {} sent nothing before the deadline", peer);
                let _ = stream.shutdown().await;
                return;
            }
        };
        let _ = stream.shutdown().await;

        let hit = match self.evaluate(&buf, peer) {
            Some(hit) => hit,
            None => return,
        };
        if let Err(e) = self.switchboard.dispatch(hit).await {
            error!("mysql: dispatch failed: {}", e);
        }
    }

    fn evaluate(&self, buf: &[u8], peer: SocketAddr) -> Option<Hit> {
        let handshake = parse_handshake(buf).ok()?;
        let token = Token::extract(&handshake.username).ok()?;

        let mut hit = Hit::new(token, Self::CHANNEL, peer.ip())
            .with_info("username", handshake.username.clone())
            .with_info("charset", handshake.charset.to_string())
            .with_info("max_packet_size", handshake.max_packet_size.to_string());
        for (key, value) in handshake.attributes {
            hit = hit.with_info(&key, value);
        }
        Some(hit)
    }
}

/// Buffers inbound bytes until the full login packet (or at least the
/// minimum handshake length) has arrived.
async fn read_handshake<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() >= 4 {
            let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
            if buf.len() >= 4 + payload_len || buf.len() >= MAX_HANDSHAKE_LEN {
                return Ok(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::switchboard::Switchboard;
    use crate::core::alert::{AlertSender, DeliveryOutcome};
    use crate::core::drop::{DropRepository, OwnerTier, TokenDrop, TokenKind};
    use crate::infrastructure::repository::InMemoryDropRepository;

    struct NullSender;

    #[async_trait::async_trait]
    impl AlertSender for NullSender {
        async fn send_alert(&self, _drop: &TokenDrop, _hit: &Hit) -> DeliveryOutcome {
            DeliveryOutcome::Sent
        }
    }

    fn lenc(bytes: &[u8], out: &mut Vec<u8>) {
        assert!(bytes.len() < 0xfb);
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }

    /// Builds a handshake-response packet the way a real client library
    /// would, with secure-auth response, plugin name and connect attrs.
    fn login_packet(username: &str, attrs: &[(&str, &str)]) -> Vec<u8> {
        let mut caps = CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        if !attrs.is_empty() {
            caps |= CLIENT_CONNECT_ATTRS;
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&caps.to_le_bytes());
        payload.extend_from_slice(&16_777_216u32.to_le_bytes());
        payload.push(0x21);
        payload.extend_from_slice(&[0u8; 23]);
        payload.extend_from_slice(username.as_bytes());
        payload.push(0);
        payload.push(20); // auth response length
        payload.extend_from_slice(&[0xAA; 20]);
        payload.extend_from_slice(b"mysql_native_password\0");
        if !attrs.is_empty() {
            let mut block = Vec::new();
            for (key, value) in attrs {
                lenc(key.as_bytes(), &mut block);
                lenc(value.as_bytes(), &mut block);
            }
            payload.push(block.len() as u8); // lenc total, small in tests
            payload.extend_from_slice(&block);
        }

        let mut packet = Vec::new();
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        packet.push(1);
        packet.extend_from_slice(&payload);
        packet
    }

    #[test]
    fn greeting_is_fixed_and_framed() {
        let first = greeting();
        assert_eq!(first, greeting());
        let payload_len = u32::from_le_bytes([first[0], first[1], first[2], 0]) as usize;
        assert_eq!(first.len(), payload_len + 4);
        assert_eq!(first[4], 0x0a);
    }

    #[test]
    fn parses_username_and_attributes() {
        let token = Token::generate();
        let packet = login_packet(
            token.as_str(),
            &[("_client_name", "libmysql"), ("_client_locale", "de_DE")],
        );
        let parsed = parse_handshake(&packet).unwrap();
        assert_eq!(parsed.username, token.as_str());
        assert_eq!(parsed.charset, 0x21);
        assert_eq!(parsed.max_packet_size, 16_777_216);
        assert_eq!(parsed.attributes.get("_client_name").unwrap(), "libmysql");
        assert_eq!(parsed.attributes.get("_client_locale").unwrap(), "de_DE");
    }

    #[test]
    fn attribute_garbage_does_not_block_the_username() {
        let token = Token::generate();
        let mut packet = login_packet(token.as_str(), &[("_client_name", "libmysql")]);
        // Chop the attribute block mid-way.
        let cut = packet.len() - 5;
        packet.truncate(cut);
        let fixed_len = (packet.len() - 4) as u32;
        packet[..3].copy_from_slice(&fixed_len.to_le_bytes()[..3]);

        let parsed = parse_handshake(&packet).unwrap();
        assert_eq!(parsed.username, token.as_str());
        assert!(parsed.attributes.is_empty());
    }

    #[test]
    fn short_buffers_are_malformed() {
        assert!(parse_handshake(&[0u8; 10]).is_err());
        assert!(parse_handshake(&[]).is_err());
    }

    #[tokio::test]
    async fn connection_gets_greeting_and_hit_is_recorded() {
        let repo = Arc::new(InMemoryDropRepository::new(50));
        let drop = TokenDrop::new(TokenKind::Mysql, "db".into(), OwnerTier::Registered);
        repo.save(&drop).await.unwrap();

        let mut board = Switchboard::new(
            Arc::clone(&repo) as Arc<dyn DropRepository>,
            Arc::new(NullSender),
            Arc::new(NullSender),
            Arc::new(NullSender),
            5,
            Duration::from_secs(5),
        );
        board.register_input_channel(MysqlListener::CHANNEL);
        let listener = MysqlListener::new(
            MysqlConfig {
                bind: "127.0.0.1:0".into(),
            },
            Arc::new(board),
        );

        let (mut client, server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "198.51.100.20:55555".parse().unwrap();
        let packet = login_packet(drop.token.as_str(), &[("_client_name", "libmysql")]);

        let serve = tokio::spawn(async move {
            listener.handle_connection(server, peer).await;
        });

        let mut banner = vec![0u8; greeting().len()];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(banner, greeting());
        client.write_all(&packet).await.unwrap();
        std::mem::drop(client);
        serve.await.unwrap();

        let hits = repo.hits(&drop.token).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].additional_info.get("_client_name").unwrap(), "libmysql");
    }
}
