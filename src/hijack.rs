//! Local answers for blocklisted names. Only A and AAAA queries are eligible;
//! everything else passes through to the resolver untouched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use serde::Deserialize;

use crate::hosts::Hosts;

const HIJACK_TTL: u32 = 3600;

/// 命中过滤列表时的应答方式 / how a matching query is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HijackMode {
    /// 返回全零地址 / the all-zero address of the matching family
    Zero,
    /// 返回空答案 / NOERROR with an empty answer section
    Empty,
    /// 返回 hosts 中配置的地址 / the addresses configured for the name
    Hosts,
}

/// Evaluates queries against the hosts map and synthesizes replies.
///
/// The map sits behind an [`ArcSwap`]: lookups are lock-free shared reads,
/// reloads replace the whole map atomically.
pub struct Hijacker {
    mode: HijackMode,
    hosts: ArcSwap<Hosts>,
}

impl Hijacker {
    pub fn new(mode: HijackMode) -> Self {
        Self {
            mode,
            hosts: ArcSwap::from_pointee(Hosts::new()),
        }
    }

    /// Swaps in a freshly loaded hosts map.
    pub fn install(&self, hosts: Hosts) {
        self.hosts.store(Arc::new(hosts));
    }

    pub fn hosts_len(&self) -> usize {
        self.hosts.load().len()
    }

    /// Returns a locally synthesized reply for blocklisted A/AAAA queries,
    /// or None when the query should be resolved normally.
    pub fn maybe_hijack(
        &self,
        id: u16,
        qname: &str,
        qtype: RecordType,
        qclass: DNSClass,
    ) -> Option<Message> {
        if qtype != RecordType::A && qtype != RecordType::AAAA {
            return None;
        }
        let hosts = self.hosts.load();
        let addrs = hosts.get(qname)?;
        let name = Name::from_str(qname).ok()?;

        let answers = match self.mode {
            HijackMode::Zero => match qtype {
                RecordType::A => vec![a_record(&name, Ipv4Addr::UNSPECIFIED)],
                _ => vec![aaaa_record(&name, Ipv6Addr::UNSPECIFIED)],
            },
            HijackMode::Empty => Vec::new(),
            HijackMode::Hosts => addrs
                .iter()
                .filter_map(|addr| match (qtype, addr) {
                    (RecordType::A, IpAddr::V4(v4)) => Some(a_record(&name, *v4)),
                    (RecordType::AAAA, IpAddr::V6(v6)) => Some(aaaa_record(&name, *v6)),
                    // The other family yields no answers for this qtype.
                    _ => None,
                })
                .collect(),
        };
        Some(reply(id, name, qtype, qclass, answers))
    }
}

fn a_record(name: &Name, addr: Ipv4Addr) -> Record {
    Record::from_rdata(name.clone(), HIJACK_TTL, RData::A(A(addr)))
}

fn aaaa_record(name: &Name, addr: Ipv6Addr) -> Record {
    Record::from_rdata(name.clone(), HIJACK_TTL, RData::AAAA(AAAA(addr)))
}

/// Replies reuse the request id, are flagged as responses with recursion
/// available and carry the original question.
fn reply(id: u16, name: Name, qtype: RecordType, qclass: DNSClass, answers: Vec<Record>) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(qtype);
    query.set_query_class(qclass);
    msg.add_query(query);
    for answer in answers {
        msg.add_answer(answer);
    }
    msg
}
