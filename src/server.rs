//! Serving loops and filter-list maintenance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Filter};
use crate::hijack::Hijacker;
use crate::hosts::Hosts;
use crate::proxy::Proxy;

const MAX_TCP_FRAME: usize = 64 * 1024;

/// Loads the configured filter sources and keeps the hijacker's hosts map
/// fresh, on a timer and on SIGHUP.
pub struct FilterLoader {
    hijacker: Arc<Hijacker>,
    filters: Vec<Filter>,
    refresh: Option<Duration>,
    http: reqwest::Client,
}

impl FilterLoader {
    pub fn new(hijacker: Arc<Hijacker>, config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build filter http client")?;
        let refresh = (config.dns.filter_refresh_secs > 0)
            .then(|| Duration::from_secs(config.dns.filter_refresh_secs));
        Ok(Self {
            hijacker,
            filters: config.filters.clone(),
            refresh,
            http,
        })
    }

    /// Reads every source in order and swaps the merged map into the
    /// hijacker. A source that fails to load is skipped, keeping whatever
    /// the other sources produced.
    pub async fn load(&self) {
        let mut hosts = Hosts::new();
        for filter in &self.filters {
            let contents = match self.read_source(&filter.url).await {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(
                        event = "filter_load_failed",
                        url = %filter.url,
                        error = %err,
                        "failed to read filter source"
                    );
                    continue;
                }
            };
            let parsed = Hosts::parse(&contents);
            apply_filter(&mut hosts, parsed, filter.reject, &filter.url);
        }
        info!(event = "filter_installed", total = hosts.len(), "hosts map installed");
        self.hijacker.install(hosts);
    }

    async fn read_source(&self, url: &str) -> Result<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read {path}"));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self.http.get(url).send().await?.error_for_status()?;
            return Ok(response.text().await?);
        }
        bail!("invalid filter scheme: {url}")
    }

    /// 定时刷新 + SIGHUP 触发重载 / periodic refresh plus SIGHUP reload
    pub fn spawn_reload(self: Arc<Self>) {
        if let Some(interval) = self.refresh {
            let loader = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick fires immediately; the initial load already ran.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    loader.load().await;
                }
            });
        }
        #[cfg(unix)]
        {
            let loader = self;
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let mut hangup = match signal(SignalKind::hangup()) {
                    Ok(hangup) => hangup,
                    Err(err) => {
                        error!(error = %err, "failed to install SIGHUP handler");
                        return;
                    }
                };
                while hangup.recv().await.is_some() {
                    info!(event = "filter_reload", reason = "sighup", "reloading filters");
                    loader.load().await;
                }
            });
        }
    }
}

/// Reject sources add to the accumulated map; allow sources remove names
/// that earlier sources contributed.
fn apply_filter(hosts: &mut Hosts, parsed: Hosts, reject: bool, source: &str) {
    if reject {
        info!(event = "filter_loaded", url = %source, hosts = parsed.len(), "loaded hosts");
        hosts.extend(parsed);
    } else {
        let names: Vec<String> = parsed.names().map(str::to_owned).collect();
        let mut removed = 0;
        for name in names {
            if hosts.del(&name) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(event = "filter_loaded", url = %source, removed, "removed allowed hosts");
        }
    }
}

/// UDP receive loop. Hijacks and fresh cache hits are answered inline; the
/// rest is spawned onto the async path so the loop never waits on upstream.
pub async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    proxy: Arc<Proxy>,
) -> Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!(worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);

        if let Some(reply) = proxy.handle_packet_fast(&packet) {
            let _ = socket.send_to(&reply, peer).await;
            continue;
        }

        let proxy = Arc::clone(&proxy);
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match proxy.handle_packet(&packet).await {
                Ok(reply) => {
                    let _ = socket.send_to(&reply, peer).await;
                }
                Err(err) => debug!(peer = %peer, error = %err, "dropping unanswerable query"),
            }
        });
    }
}

pub async fn run_tcp(listener: TcpListener, proxy: Arc<Proxy>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, proxy).await {
                debug!(peer = %peer, error = %err, "tcp connection ended");
            }
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, proxy: Arc<Proxy>) -> Result<()> {
    let mut len_buf = [0u8; 2];
    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(err.into());
        }
        let frame_len = usize::from(u16::from_be_bytes(len_buf));
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }
        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let reply = match proxy.handle_packet(&buf).await {
            Ok(reply) => reply,
            Err(_) => return Ok(()),
        };
        if reply.len() <= usize::from(u16::MAX) {
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&reply).await?;
        }
    }
}

/// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket，worker 各持一个；
/// 其他平台返回普通绑定的 socket，由调用方共享。
pub fn bind_udp_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_reuse_address(true).context("set reuse address")?;
    #[cfg(unix)]
    {
        use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
        use std::os::unix::io::AsRawFd;
        let val: c_int = 1;
        let ret = unsafe {
            setsockopt(
                socket.as_raw_fd(),
                SOL_SOCKET,
                SO_REUSEPORT,
                &val as *const _ as *const c_void,
                std::mem::size_of_val(&val) as socklen_t,
            )
        };
        if ret != 0 {
            // Kernel distribution is unavailable; workers still share the port.
            warn!("SO_REUSEPORT unavailable, continuing without it");
        }
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    Ok(socket.into())
}
