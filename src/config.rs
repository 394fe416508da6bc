use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::hijack::HijackMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub resolver: ResolverSettings,
    /// 过滤源按声明顺序应用 / filter sources applied in declaration order
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_listen")]
    pub listen_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_listen")]
    pub listen_tcp: String,
    /// UDP worker 数量，0 表示使用 CPU 核心数。
    #[serde(default)]
    pub udp_workers: usize,
    /// 缓存容量（条目数），0 关闭缓存。
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// 过期条目后台预取而非淘汰。
    #[serde(default)]
    pub cache_prefetch: bool,
    /// 缓存持久化文件路径，缺省不持久化。
    #[serde(default)]
    pub cache_persist_path: Option<PathBuf>,
    /// 命中过滤列表时的应答方式：zero/empty/hosts。
    #[serde(default = "default_hijack_mode")]
    pub hijack_mode: HijackMode,
    /// 过滤列表刷新间隔秒数，0 关闭定时刷新。
    #[serde(default)]
    pub filter_refresh_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            listen_udp: default_listen(),
            listen_tcp: default_listen(),
            udp_workers: 0,
            cache_capacity: default_cache_capacity(),
            cache_prefetch: false,
            cache_persist_path: None,
            hijack_mode: default_hijack_mode(),
            filter_refresh_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSettings {
    /// 上游地址列表；https 协议时为完整 DoH URL。
    #[serde(default)]
    pub addresses: Vec<String>,
    /// 上游传输协议。
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// 单次上游交换超时（毫秒）。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ResolverSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            protocol: default_protocol(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Https,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    /// file:// 或 http(s):// 来源。
    pub url: String,
    /// true 加入拦截列表；false 从已累积的列表移除（白名单）。
    #[serde(default = "default_reject")]
    pub reject: bool,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    validate(&cfg)?;
    info!(
        target = "config",
        resolvers = cfg.resolver.addresses.len(),
        filters = cfg.filters.len(),
        cache_capacity = cfg.dns.cache_capacity,
        "config loaded"
    );
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.resolver.addresses.is_empty() {
        anyhow::bail!("no resolvers configured");
    }
    for address in &cfg.resolver.addresses {
        match cfg.resolver.protocol {
            Protocol::Udp | Protocol::Tcp => {
                address
                    .parse::<std::net::SocketAddr>()
                    .with_context(|| format!("invalid resolver address: {address}"))?;
            }
            Protocol::Https => {
                if !address.starts_with("https://") {
                    anyhow::bail!("doh resolver must be an https:// url: {address}");
                }
            }
        }
    }
    for filter in &cfg.filters {
        let url = &filter.url;
        if !url.starts_with("file://") && !url.starts_with("http://") && !url.starts_with("https://")
        {
            anyhow::bail!("invalid filter scheme: {url}");
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_hijack_mode() -> HijackMode {
    HijackMode::Zero
}

fn default_protocol() -> Protocol {
    Protocol::Udp
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_reject() -> bool {
    true
}
