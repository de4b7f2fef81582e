use crate::application::config::DnsConfig;
use crate::application::switchboard::Switchboard;
use crate::core::error::{TrapError, TrapResult};
use crate::core::hit::Hit;
use crate::core::token::Token;
use crate::core::drop::TokenKind;
use log::{debug, error, info};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_NS: u16 = 2;
pub const QTYPE_SOA: u16 = 6;

const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const MAX_DATAGRAM: usize = 1500;

/// One parsed DNS question. Only the first question is considered; labels
/// are lowercased at parse time.
#[derive(Debug)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub labels: Vec<String>,
    pub qtype: u16,
    pub qclass: u16,
    /// Raw question section, echoed back verbatim in responses.
    question: Vec<u8>,
}

impl DnsQuery {
    pub fn name(&self) -> String {
        self.labels.join(".")
    }
}

/// Decodes the header and first question of a query. Compression pointers
/// never appear in questions we care about and are treated as malformed.
pub fn parse_query(buf: &[u8]) -> TrapResult<DnsQuery> {
    let malformed = |what: &str| TrapError::MalformedProtocolInput(format!("dns: {}", what));

    if buf.len() < 12 {
        return Err(malformed("short header"));
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & FLAG_RESPONSE != 0 {
        return Err(malformed("not a query"));
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return Err(malformed("no question"));
    }

    let mut pos = 12;
    let mut labels = Vec::new();
    loop {
        let len = *buf.get(pos).ok_or_else(|| malformed("truncated name"))? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(malformed("compressed question name"));
        }
        let label = buf
            .get(pos..pos + len)
            .ok_or_else(|| malformed("truncated label"))?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
        if labels.len() > 127 {
            return Err(malformed("name too deep"));
        }
    }
    let rest = buf
        .get(pos..pos + 4)
        .ok_or_else(|| malformed("truncated question"))?;
    let qtype = u16::from_be_bytes([rest[0], rest[1]]);
    let qclass = u16::from_be_bytes([rest[2], rest[3]]);

    Ok(DnsQuery {
        id,
        flags,
        labels,
        qtype,
        qclass,
        question: buf[12..pos + 4].to_vec(),
    })
}

enum Rdata {
    A(Ipv4Addr),
    Ns(String),
    Soa { mname: String, rname: String, minimum: u32 },
}

struct Record {
    rdata: Rdata,
    ttl: u32,
}

fn encode_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(63) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(63)]);
    }
    out.push(0);
}

fn encode_record(record: &Record, rtype: u16, out: &mut Vec<u8>) {
    // Name is always a pointer to the question name at offset 12.
    out.extend_from_slice(&[0xC0, 0x0C]);
    out.extend_from_slice(&rtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // class IN
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.rdata {
        Rdata::A(ip) => rdata.extend_from_slice(&ip.octets()),
        Rdata::Ns(name) => encode_name(name, &mut rdata),
        Rdata::Soa { mname, rname, minimum } => {
            encode_name(mname, &mut rdata);
            encode_name(rname, &mut rdata);
            rdata.extend_from_slice(&1u32.to_be_bytes()); // serial
            rdata.extend_from_slice(&3600u32.to_be_bytes()); // refresh
            rdata.extend_from_slice(&600u32.to_be_bytes()); // retry
            rdata.extend_from_slice(&86400u32.to_be_bytes()); // expire
            rdata.extend_from_slice(&minimum.to_be_bytes());
        }
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
}

fn rtype_of(rdata: &Rdata) -> u16 {
    match rdata {
        Rdata::A(_) => QTYPE_A,
        Rdata::Ns(_) => QTYPE_NS,
        Rdata::Soa { .. } => QTYPE_SOA,
    }
}

fn build_response(
    query: &DnsQuery,
    rcode: u8,
    answers: &[Record],
    authority: &[Record],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + query.question.len());
    out.extend_from_slice(&query.id.to_be_bytes());
    let flags = FLAG_RESPONSE | FLAG_AA | (query.flags & FLAG_RD) | rcode as u16;
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    out.extend_from_slice(&(authority.len() as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&query.question);
    for record in answers {
        encode_record(record, rtype_of(&record.rdata), &mut out);
    }
    for record in authority {
        encode_record(record, rtype_of(&record.rdata), &mut out);
    }
    out
}

/// Decodes forensic sub-labels left of the token: each label is a
/// hex-encoded UTF-8 field. Labels that fail to decode are skipped rather
/// than aborting the hit.
fn decode_forensic_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .filter_map(|label| hex::decode(label).ok())
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .filter(|field| !field.is_empty())
        .collect()
}

/// Authoritative listener for the canary domains. One datagram, one
/// response; the hit (if any) is dispatched after the answer is on the
/// wire so a slow notification channel never delays the reply.
pub struct DnsListener {
    config: DnsConfig,
    switchboard: Arc<Switchboard>,
}

impl DnsListener {
    pub const CHANNEL: &'static str = "dns";

    pub fn new(config: DnsConfig, switchboard: Arc<Switchboard>) -> Self {
        Self { config, switchboard }
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(&self.config.bind).await?);
        info!("dns listener on {}", socket.local_addr()?);
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let datagram = buf[..n].to_vec();
            let listener = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some((response, hit)) = listener.handle_datagram(&datagram, peer).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        debug!("dns: failed to answer {}: {}", peer, e);
                    }
                    if let Some(hit) = hit {
                        if let Err(e) = listener.switchboard.dispatch(hit).await {
                            error!("dns: dispatch failed: {}", e);
                        }
                    }
                }
            });
        }
    }

    fn suffix_match(name: &str, suffixes: &[String]) -> bool {
        suffixes.iter().any(|suffix| {
            let suffix = suffix.trim_end_matches('.').to_ascii_lowercase();
            name == suffix || name.ends_with(&format!(".{}", suffix))
        })
    }

    /// Full per-datagram path. `None` means drop without answering
    /// (unparseable input). The response never depends on whether a hit
    /// was emitted.
    pub async fn handle_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
    ) -> Option<(Vec<u8>, Option<Hit>)> {
        let query = match parse_query(datagram) {
            Ok(query) => query,
            Err(_) => return None,
        };
        let name = query.name();
        let owned = Self::suffix_match(&name, &self.config.canary_domains);
        let nx = Self::suffix_match(&name, &self.config.nxdomain_suffixes);

        if !owned && !nx {
            return Some((build_response(&query, RCODE_REFUSED, &[], &[]), None));
        }

        if query.qtype == QTYPE_NS || query.qtype == QTYPE_SOA {
            return Some((self.authoritative(&query), None));
        }
        if query.qtype != QTYPE_A {
            return Some((build_response(&query, RCODE_NOERROR, &[], &[]), None));
        }

        // Any failure below falls through to the same dynamic answer with
        // no hit; a remote probe cannot tell the difference.
        let hit = self.evaluate_token(&query, peer).await;

        let response = if nx {
            let authority = [Record {
                rdata: Rdata::Soa {
                    mname: self.config.ns_name.clone(),
                    rname: self.config.soa_email.clone(),
                    minimum: self.config.token_ttl,
                },
                ttl: self.config.token_ttl,
            }];
            build_response(&query, RCODE_NXDOMAIN, &[], &authority)
        } else {
            let answers = [Record {
                rdata: Rdata::A(self.config.public_ip),
                ttl: self.config.token_ttl,
            }];
            build_response(&query, RCODE_NOERROR, &answers, &[])
        };
        Some((response, hit))
    }

    fn authoritative(&self, query: &DnsQuery) -> Vec<u8> {
        let record = if query.qtype == QTYPE_NS {
            Record {
                rdata: Rdata::Ns(self.config.ns_name.clone()),
                ttl: self.config.apex_ttl,
            }
        } else {
            Record {
                rdata: Rdata::Soa {
                    mname: self.config.ns_name.clone(),
                    rname: self.config.soa_email.clone(),
                    minimum: self.config.apex_ttl,
                },
                ttl: self.config.apex_ttl,
            }
        };
        build_response(query, RCODE_NOERROR, &[record], &[])
    }

    async fn evaluate_token(&self, query: &DnsQuery, peer: SocketAddr) -> Option<Hit> {
        let name = query.name();
        let token = Token::extract(&name).ok()?;
        let drop = self
            .switchboard
            .repository()
            .get(&token)
            .await
            .ok()
            .flatten()?;

        let token_idx = query
            .labels
            .iter()
            .position(|label| label.contains(token.as_str()))?;
        let decoded = decode_forensic_labels(&query.labels[..token_idx]);

        // Context-bearing token kinds fire only when the sub-labels carry
        // a payload; bare queries are ordinary DNS chatter.
        if drop.kind.requires_forensics() && decoded.is_empty() {
            return None;
        }

        let mut hit = Hit::new(token, Self::CHANNEL, peer.ip())
            .with_info("query_name", name)
            .with_info("query_type", "A");
        let field_names: &[&str] = match drop.kind {
            TokenKind::DirectoryListing => &["username", "hostname"],
            TokenKind::CommandInjection => &["user", "computer", "command"],
            _ => &[],
        };
        for (i, value) in decoded.into_iter().enumerate() {
            let key = field_names
                .get(i)
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("field{}", i));
            hit = hit.with_info(&key, value);
        }
        Some(hit)
    }
}
