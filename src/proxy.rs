//! Request dispatcher: hijack evaluation, cache lookup and upstream fan-out.
//!
//! Dispatch is two-tiered, so transports can answer hijacked names and fresh
//! cache hits without spawning: [`Proxy::handle_packet_fast`] runs
//! synchronously on the receive loop, [`Proxy::handle_packet`] is the full
//! async path taken on a miss.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use tracing::{info, warn};

use crate::cache::{fingerprint, Cache};
use crate::hijack::Hijacker;
use crate::resolver::Client;

/// Header id plus the first question, pulled out of a packet without a full
/// message parse. The name comes back lowercased without a trailing dot.
pub(crate) struct QueryOutline {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// 只解析头部和第一个问题，足够做指纹和劫持判断
/// Parses just enough of the packet for fingerprinting and hijack checks.
/// Returns None for anything unusual (no question, non-ASCII labels,
/// malformed compression); callers fall back to the full parser.
pub(crate) fn parse_outline(packet: &[u8]) -> Option<QueryOutline> {
    if packet.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut name = String::with_capacity(32);
    let mut after_name = 12usize;
    let mut cursor = 12usize;
    let mut jumped = false;
    let mut hops = 0u8;
    loop {
        let len = usize::from(*packet.get(cursor)?);
        if len == 0 {
            if !jumped {
                after_name = cursor + 1;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer into an earlier part of the packet.
            let low = usize::from(*packet.get(cursor + 1)?);
            if !jumped {
                after_name = cursor + 2;
                jumped = true;
            }
            cursor = (len & 0x3F) << 8 | low;
            hops += 1;
            if hops > 8 {
                return None;
            }
            continue;
        }
        let label = packet.get(cursor + 1..cursor + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &byte in label {
            if !byte.is_ascii() {
                return None;
            }
            name.push(byte.to_ascii_lowercase() as char);
        }
        if name.len() > 253 {
            return None;
        }
        cursor += 1 + len;
    }

    let qtype = u16::from_be_bytes([*packet.get(after_name)?, *packet.get(after_name + 1)?]);
    let qclass = u16::from_be_bytes([*packet.get(after_name + 2)?, *packet.get(after_name + 3)?]);
    Some(QueryOutline {
        id,
        name,
        qtype,
        qclass,
    })
}

pub struct Proxy {
    cache: Arc<Cache>,
    client: Client,
    hijacker: Arc<Hijacker>,
}

impl Proxy {
    pub fn new(cache: Arc<Cache>, client: Client, hijacker: Arc<Hijacker>) -> Self {
        Self {
            cache,
            client,
            hijacker,
        }
    }

    /// Synchronous fast path: hijacked names and cache hits are answered
    /// in place. None means the caller must take [`Proxy::handle_packet`].
    /// Never blocks on the cache's background queue.
    pub fn handle_packet_fast(&self, packet: &[u8]) -> Option<Bytes> {
        let outline = parse_outline(packet)?;
        let qtype = RecordType::from(outline.qtype);
        let qclass = DNSClass::from(outline.qclass);

        if let Some(reply) = self
            .hijacker
            .maybe_hijack(outline.id, &outline.name, qtype, qclass)
        {
            let bytes = encode(&reply).ok()?;
            info!(
                event = "dns_response",
                source = "hijack",
                qname = %outline.name,
                qtype = ?qtype,
                "hijacked"
            );
            return Some(bytes);
        }

        let key = fingerprint(&outline.name, outline.qtype, outline.qclass);
        // The clone is ours to mutate; the cached message is never touched.
        let mut cached = self.cache.get(key)?;
        cached.set_id(outline.id);
        let bytes = encode(&cached).ok()?;
        info!(
            event = "dns_response",
            source = "cache",
            qname = %outline.name,
            qtype = ?qtype,
            rcode = ?cached.response_code(),
            "cache hit"
        );
        Some(bytes)
    }

    /// Full dispatch: hijack, cache, then resolver fan-out. Resolver failures
    /// come back as SERVFAIL so the client never hangs.
    pub async fn handle_packet(&self, packet: &[u8]) -> Result<Bytes> {
        let start = Instant::now();
        let req = Message::from_bytes(packet).context("parse request")?;
        let question = req.queries().first().cloned().context("empty question")?;
        let qname = question.name().to_string();
        let qtype = question.query_type();
        let qclass = question.query_class();

        if let Some(reply) = self
            .hijacker
            .maybe_hijack(req.id(), &qname, qtype, qclass)
        {
            info!(
                event = "dns_response",
                source = "hijack",
                qname = %qname,
                qtype = ?qtype,
                latency_ms = start.elapsed().as_millis() as u64,
                "hijacked"
            );
            return encode(&reply);
        }

        let key = fingerprint(&qname, u16::from(qtype), u16::from(qclass));
        if let Some(mut cached) = self.cache.get(key) {
            cached.set_id(req.id());
            info!(
                event = "dns_response",
                source = "cache",
                qname = %qname,
                qtype = ?qtype,
                rcode = ?cached.response_code(),
                latency_ms = start.elapsed().as_millis() as u64,
                "cache hit"
            );
            return encode(&cached);
        }

        match self.client.exchange(&req).await {
            Ok(mut reply) => {
                self.cache.set(key, reply.clone());
                reply.set_id(req.id());
                info!(
                    event = "dns_response",
                    source = "upstream",
                    qname = %qname,
                    qtype = ?qtype,
                    rcode = ?reply.response_code(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "forwarded"
                );
                encode(&reply)
            }
            Err(err) => {
                warn!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?qtype,
                    error = %err,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "upstream failed"
                );
                build_response(&req, ResponseCode::ServFail)
            }
        }
    }
}

/// Builds an answerless reply mirroring the request's question.
fn build_response(req: &Message, rcode: ResponseCode) -> Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    let queries: Vec<Query> = req.queries().to_vec();
    msg.add_queries(queries);
    encode(&msg)
}

fn encode(msg: &Message) -> Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).context("encode response")?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hijack::HijackMode;
    use crate::hosts::Hosts;
    use crate::resolver::Exchanger;
    use anyhow::bail;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchanger {
        calls: Arc<AtomicUsize>,
        reply: Option<Message>,
    }

    #[async_trait]
    impl Exchanger for CountingExchanger {
        async fn exchange(&self, msg: &Message, _address: &str) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(reply) => {
                    let mut reply = reply.clone();
                    reply.set_id(msg.id());
                    Ok(reply)
                }
                None => bail!("connection refused"),
            }
        }
    }

    fn reply_a(name: &str, addr: Ipv4Addr, ttl: u32) -> Message {
        let name = Name::from_str(name).expect("name");
        let mut query = Query::new();
        query.set_name(name.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(query);
        msg.add_answer(Record::from_rdata(name, ttl, RData::A(A(addr))));
        msg
    }

    fn query_packet(name: &str, qtype: RecordType, id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(Name::from_str(name).expect("name"));
        query.set_query_type(qtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg.to_vec().expect("encode query")
    }

    fn proxy_with(
        reply: Option<Message>,
        mode: HijackMode,
        hosts: Hosts,
    ) -> (Proxy, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let exchanger = CountingExchanger {
            calls: Arc::clone(&calls),
            reply,
        };
        let client = Client::with_exchanger(Arc::new(exchanger), vec!["stub:53".to_string()]);
        let cache = Arc::new(Cache::new(16, None));
        let hijacker = Arc::new(Hijacker::new(mode));
        hijacker.install(hosts);
        (Proxy::new(cache, client, hijacker), calls)
    }

    #[test]
    fn outline_parses_an_encoded_query() {
        let packet = query_packet("Example.COM.", RecordType::AAAA, 0x1234);
        let outline = parse_outline(&packet).expect("outline");
        assert_eq!(outline.id, 0x1234);
        assert_eq!(outline.name, "example.com");
        assert_eq!(outline.qtype, u16::from(RecordType::AAAA));
        assert_eq!(outline.qclass, u16::from(DNSClass::IN));
    }

    #[test]
    fn outline_rejects_truncated_and_questionless_packets() {
        assert!(parse_outline(&[0u8; 4]).is_none());
        // Valid header, zero questions.
        let mut packet = vec![0u8; 12];
        packet[0] = 0xab;
        assert!(parse_outline(&packet).is_none());
    }

    #[tokio::test]
    async fn miss_forwards_upstream_and_caches_the_reply() {
        let upstream = reply_a("example.com.", Ipv4Addr::new(9, 9, 9, 9), 300);
        let (proxy, calls) = proxy_with(Some(upstream), HijackMode::Zero, Hosts::new());

        let reply = proxy
            .handle_packet(&query_packet("example.com.", RecordType::A, 7))
            .await
            .expect("reply");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 7);
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second query with a different id is served from cache.
        let reply = proxy
            .handle_packet(&query_packet("example.com.", RecordType::A, 8))
            .await
            .expect("reply");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hijacked_names_never_reach_upstream() {
        let hosts = Hosts::parse("1.2.3.4 ads.example\n");
        let (proxy, calls) = proxy_with(None, HijackMode::Hosts, hosts);

        let reply = proxy
            .handle_packet(&query_packet("ads.example.", RecordType::A, 5))
            .await
            .expect("reply");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 5);
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_failure_becomes_servfail() {
        let (proxy, calls) = proxy_with(None, HijackMode::Zero, Hosts::new());

        let reply = proxy
            .handle_packet(&query_packet("example.com.", RecordType::A, 3))
            .await
            .expect("reply");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 3);
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(msg.queries().len(), 1);
    }

    #[tokio::test]
    async fn malformed_packets_are_an_error() {
        let (proxy, _calls) = proxy_with(None, HijackMode::Zero, Hosts::new());
        assert!(proxy.handle_packet(&[0u8; 3]).await.is_err());
    }

    #[tokio::test]
    async fn fast_path_answers_hits_and_hijacks_only() {
        let upstream = reply_a("example.com.", Ipv4Addr::new(9, 9, 9, 9), 300);
        let hosts = Hosts::parse("1.2.3.4 ads.example\n");
        let (proxy, _calls) = proxy_with(Some(upstream), HijackMode::Hosts, hosts);

        // Unknown name: nothing cached yet, fast path defers.
        let miss = query_packet("example.com.", RecordType::A, 1);
        assert!(proxy.handle_packet_fast(&miss).is_none());

        // Populate the cache through the slow path, then hit it fast.
        proxy.handle_packet(&miss).await.expect("reply");
        let hit = query_packet("example.com.", RecordType::A, 2);
        let reply = proxy.handle_packet_fast(&hit).expect("fast hit");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 2);

        let blocked = query_packet("ads.example.", RecordType::A, 3);
        let reply = proxy.handle_packet_fast(&blocked).expect("fast hijack");
        let msg = Message::from_bytes(&reply).expect("parse reply");
        assert_eq!(msg.id(), 3);
        assert_eq!(msg.answers().len(), 1);
    }
}
