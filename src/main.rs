mod cache;
mod config;
mod hijack;
mod hosts;
mod persist;
mod proxy;
mod resolver;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{Backend, Cache, NullBackend};
use crate::config::load_config;
use crate::hijack::Hijacker;
use crate::persist::FileBackend;
use crate::proxy::Proxy;
use crate::resolver::Client;
use crate::server::FilterLoader;

#[derive(Parser, Debug)]
#[command(author, version, about = "veildns caching and filtering DNS proxy", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/veildns.json")]
    config: PathBuf,
    /// UDP worker 数量，覆盖配置文件（0 表示不覆盖）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg.dns.listen_udp.parse().context("parse udp listen address")?;
    let bind_tcp: SocketAddr = cfg.dns.listen_tcp.parse().context("parse tcp listen address")?;

    let client = Client::new(
        cfg.resolver.protocol,
        cfg.resolver.timeout(),
        cfg.resolver.addresses.clone(),
    )
    .context("build resolver client")?;

    let backend: Arc<dyn Backend> = match &cfg.dns.cache_persist_path {
        Some(path) => Arc::new(FileBackend::open(path).context("open cache store")?),
        None => Arc::new(NullBackend),
    };
    // 仅在开启预取时把上游客户端交给缓存 / the cache only refreshes when prefetch is on
    let prefetch_client = cfg.dns.cache_prefetch.then(|| client.clone());
    let cache = Arc::new(Cache::with_backend(
        cfg.dns.cache_capacity,
        prefetch_client,
        backend,
    ));

    let hijacker = Arc::new(Hijacker::new(cfg.dns.hijack_mode));
    let loader = Arc::new(FilterLoader::new(Arc::clone(&hijacker), &cfg)?);
    loader.load().await;
    Arc::clone(&loader).spawn_reload();

    let proxy = Arc::new(Proxy::new(Arc::clone(&cache), client, hijacker));

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else if cfg.dns.udp_workers > 0 {
        cfg.dns.udp_workers
    } else {
        num_cpus::get()
    };
    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, udp_workers, "dns server started");

    #[cfg(unix)]
    {
        // SO_REUSEPORT 下每个 worker 独享 socket，由内核分流
        for worker_id in 0..udp_workers {
            let std_socket = server::bind_udp_socket(bind_udp)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                if let Err(err) = server::run_udp_worker(worker_id, socket, proxy).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }
    #[cfg(not(unix))]
    {
        // Without SO_REUSEPORT the workers share one socket.
        let std_socket = server::bind_udp_socket(bind_udp).context("create udp socket")?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        for worker_id in 0..udp_workers {
            let socket = Arc::clone(&socket);
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                if let Err(err) = server::run_udp_worker(worker_id, socket, proxy).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if let Err(err) = server::run_tcp(tcp_listener, proxy).await {
                error!(error = %err, "tcp server exited");
            }
        });
    }

    shutdown_signal().await;
    info!("shutting down, draining cache tasks");
    cache.close().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
