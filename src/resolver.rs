//! Upstream resolver client. A query is fanned out to every configured
//! resolver in parallel and the first successful reply wins; the transport
//! (UDP, TCP or DNS-over-HTTPS) is fixed at construction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Protocol;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// A single exchange against one upstream address.
#[async_trait]
pub trait Exchanger: Send + Sync {
    async fn exchange(&self, msg: &Message, address: &str) -> Result<Message>;
}

/// Resolver client holding an exchanger and the upstream address list.
#[derive(Clone)]
pub struct Client {
    exchanger: Arc<dyn Exchanger>,
    addresses: Vec<String>,
}

impl Client {
    pub fn new(protocol: Protocol, timeout: Duration, addresses: Vec<String>) -> Result<Self> {
        let exchanger: Arc<dyn Exchanger> = match protocol {
            Protocol::Udp => Arc::new(UdpExchanger { timeout }),
            Protocol::Tcp => Arc::new(TcpExchanger { timeout }),
            Protocol::Https => Arc::new(DohExchanger::new(timeout)?),
        };
        Ok(Self {
            exchanger,
            addresses,
        })
    }

    pub fn with_exchanger(exchanger: Arc<dyn Exchanger>, addresses: Vec<String>) -> Self {
        Self {
            exchanger,
            addresses,
        }
    }

    /// Queries every resolver in parallel and returns the first successful
    /// reply. Slower attempts run to completion and are discarded. When all
    /// attempts fail the last failure is returned.
    pub async fn exchange(&self, msg: &Message) -> Result<Message> {
        if self.addresses.is_empty() {
            bail!("no resolvers configured");
        }
        let (results_tx, mut results) = mpsc::channel(self.addresses.len());
        for address in &self.addresses {
            let exchanger = Arc::clone(&self.exchanger);
            let msg = msg.clone();
            let address = address.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let result = exchanger
                    .exchange(&msg, &address)
                    .await
                    .with_context(|| format!("resolver {address} failed"));
                let _ = results_tx.send(result).await;
            });
        }
        drop(results_tx);

        let mut last_err = None;
        while let Some(result) = results.recv().await {
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    debug!(event = "resolver_attempt_failed", error = %err, "upstream attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no resolvers configured")))
    }
}

struct UdpExchanger {
    timeout: Duration,
}

#[async_trait]
impl Exchanger for UdpExchanger {
    async fn exchange(&self, msg: &Message, address: &str) -> Result<Message> {
        let addr: SocketAddr = address.parse().context("invalid resolver address")?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await.context("bind udp socket")?;
        socket.connect(addr).await.context("connect udp socket")?;
        let packet = msg.to_vec().context("encode query")?;
        socket.send(&packet).await.context("send query")?;

        let mut buf = [0u8; 4096];
        let reply = timeout(self.timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // 校验事务 ID，丢弃串包 / drop datagrams whose transaction id differs
                if len >= 2 && buf[..2] == packet[..2] {
                    return Ok::<_, anyhow::Error>(Message::from_bytes(&buf[..len])?);
                }
            }
        })
        .await
        .map_err(|_| anyhow!("udp exchange timed out"))??;
        Ok(reply)
    }
}

struct TcpExchanger {
    timeout: Duration,
}

#[async_trait]
impl Exchanger for TcpExchanger {
    async fn exchange(&self, msg: &Message, address: &str) -> Result<Message> {
        let addr: SocketAddr = address.parse().context("invalid resolver address")?;
        let packet = msg.to_vec().context("encode query")?;
        if packet.len() > usize::from(u16::MAX) {
            bail!("query too large for tcp framing");
        }
        let reply = timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream
                .write_all(&(packet.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&packet).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
            stream.read_exact(&mut buf).await?;
            Ok::<_, anyhow::Error>(Message::from_bytes(&buf)?)
        })
        .await
        .map_err(|_| anyhow!("tcp exchange timed out"))??;
        Ok(reply)
    }
}

/// RFC 8484 DNS-over-HTTPS exchanger; addresses are full endpoint URLs.
struct DohExchanger {
    client: reqwest::Client,
}

impl DohExchanger {
    fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .context("build doh http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Exchanger for DohExchanger {
    async fn exchange(&self, msg: &Message, address: &str) -> Result<Message> {
        let packet = msg.to_vec().context("encode query")?;
        let response = self
            .client
            .post(address)
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(packet)
            .send()
            .await
            .context("doh post failed")?;
        if !response.status().is_success() {
            bail!("doh server returned status {}", response.status());
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(DNS_MESSAGE_CONTENT_TYPE) {
            bail!("doh server returned unexpected content type: {content_type}");
        }
        let body = response.bytes().await.context("read doh response")?;
        Ok(Message::from_bytes(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn reply_a(name: &str, addr: Ipv4Addr) -> Message {
        let name = Name::from_str(name).expect("name");
        let mut query = Query::new();
        query.set_name(name.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(DNSClass::IN);
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(query);
        msg.add_answer(Record::from_rdata(name, 300, RData::A(A(addr))));
        msg
    }

    enum Outcome {
        Reply(Message, Duration),
        Fail(Duration),
    }

    struct ScriptedExchanger {
        outcomes: HashMap<String, Outcome>,
    }

    #[async_trait]
    impl Exchanger for ScriptedExchanger {
        async fn exchange(&self, _msg: &Message, address: &str) -> Result<Message> {
            match self.outcomes.get(address) {
                Some(Outcome::Reply(reply, delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(reply.clone())
                }
                Some(Outcome::Fail(delay)) => {
                    tokio::time::sleep(*delay).await;
                    bail!("connection refused")
                }
                None => bail!("unexpected address {address}"),
            }
        }
    }

    fn scripted(outcomes: HashMap<String, Outcome>) -> Client {
        let addresses = outcomes.keys().cloned().collect();
        Client::with_exchanger(Arc::new(ScriptedExchanger { outcomes }), addresses)
    }

    fn query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).expect("name"));
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    #[tokio::test]
    async fn first_successful_reply_wins_over_faster_failures() {
        let slow_ok = reply_a("example.com.", Ipv4Addr::new(1, 2, 3, 4));
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "a:53".to_string(),
            Outcome::Reply(slow_ok, Duration::from_millis(50)),
        );
        outcomes.insert(
            "b:53".to_string(),
            Outcome::Fail(Duration::from_millis(10)),
        );
        let client = scripted(outcomes);

        let reply = client.exchange(&query("example.com.")).await.expect("reply");
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn all_failures_surface_the_last_error() {
        let mut outcomes = HashMap::new();
        outcomes.insert("a:53".to_string(), Outcome::Fail(Duration::ZERO));
        outcomes.insert("b:53".to_string(), Outcome::Fail(Duration::ZERO));
        let client = scripted(outcomes);

        let err = client
            .exchange(&query("example.com."))
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("failed"), "got: {err:#}");
    }

    #[tokio::test]
    async fn empty_address_list_is_an_error() {
        let client = Client::with_exchanger(
            Arc::new(ScriptedExchanger {
                outcomes: HashMap::new(),
            }),
            Vec::new(),
        );
        let err = client
            .exchange(&query("example.com."))
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("no resolvers"));
    }
}
