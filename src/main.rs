//! tdnsd: an authoritative name server with online signing, SIG(0)
//! dynamic updates and a zone refresh/notify control plane.

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tdnsd::comms::{self, Queues, RefreshRequest, Shutdown};
use tdnsd::config::Config;
use tdnsd::dns::edns::EdnsView;
use tdnsd::error::Result;
use tdnsd::keydb::KeyDb;
use tdnsd::query::QueryResponder;
use tdnsd::refresh::RefreshEngine;
use tdnsd::resign::Resigner;
use tdnsd::server::{ServerContext, run_tcp_listener, run_udp_listener};
use tdnsd::transport::{load_tls_config, run_doh_listener, run_doq_listener, run_dot_listener,
                       tls_material_present};
use tdnsd::update::{UpdatePipeline, run_update_pipeline};
use tdnsd::zone::registry::ZoneRegistry;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tdnsd", about = "authoritative DNS server", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "tdnsd.yaml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    if let Err(e) = runtime.block_on(run(args)) {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;
    info!(config = %args.config.display(), zones = config.zones.len(), "configuration loaded");

    // Fatal when the key database is unusable.
    let keydb = Arc::new(KeyDb::open(&config.server.keydb)?);
    let policies = config.dnssec_policies()?;

    let registry = Arc::new(ZoneRegistry::new());
    let shutdown = Shutdown::new();
    let (queues, receivers) = comms::queues();

    // --- engines ---------------------------------------------------

    let server_id = config
        .server
        .server_id
        .as_deref()
        .map(tdnsd::dns::name::Name::parse)
        .transpose()?
        .unwrap_or_else(tdnsd::dns::name::Name::root);

    let expected: HashSet<String> = config
        .zones
        .keys()
        .filter_map(|name| tdnsd::dns::name::Name::parse(name).ok())
        .map(|name| name.key())
        .collect();

    let engine = RefreshEngine::new(
        registry.clone(),
        keydb.clone(),
        queues.notify.clone(),
        queues.resign.clone(),
        queues.sync.clone(),
        expected,
        config.server.max_refresh,
        config.enabled_transports(),
        server_id,
        config.server.agent_mode,
    );
    tokio::spawn(engine.run(receivers.refresh, receivers.bump, shutdown.clone()));

    let pipeline = UpdatePipeline::new(
        registry.clone(),
        keydb.clone(),
        Some(queues.validator.clone()),
        config.server.agent_mode,
    );
    tokio::spawn(run_update_pipeline(
        pipeline,
        receivers.dns_update,
        queues.update_cmd.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(tdnsd::update::apply::run_zone_update_actor(
        registry.clone(),
        keydb.clone(),
        receivers.update_cmd,
        queues.notify.clone(),
        queues.resign.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(tdnsd::notify::run_notify_responder(
        registry.clone(),
        receivers.dns_notify,
        queues.refresh.clone(),
        queues.scan.clone(),
        shutdown.clone(),
    ));

    tokio::spawn(tdnsd::notify::run_notifier(
        registry.clone(),
        receivers.notify,
        shutdown.clone(),
    ));

    let resigner = Resigner::new(
        registry.clone(),
        keydb.clone(),
        policies,
        config.server.resign_interval,
    );
    tokio::spawn(resigner.run(receivers.resign, shutdown.clone()));

    tokio::spawn(tdnsd::query::run_auth_query_actor(
        registry.clone(),
        receivers.auth_query,
        shutdown.clone(),
    ));

    // The scanner, delegation-sync and validator engines live outside
    // this core; their queues are drained here so senders never stall.
    drain_queue(receivers.scan, "scan", shutdown.clone());
    drain_queue(receivers.sync, "sync", shutdown.clone());
    tokio::spawn(answer_validator_queue(receivers.validator, shutdown.clone()));

    // --- zone admission --------------------------------------------

    enqueue_zone_refreshes(&config, &queues).await;

    // --- listeners -------------------------------------------------

    let ctx = Arc::new(ServerContext {
        responder: QueryResponder::new(
            registry.clone(),
            config.server.identity.to_identity(),
            config.server.agent_mode,
        ),
        queues: queues.clone(),
        shutdown: shutdown.clone(),
    });

    let started = start_listeners(&config, ctx).await;
    if started == 0 {
        return Err(tdnsd::error::TdnsError::InvalidListenAddress(
            "no listener could be started".to_string(),
        ));
    }

    // --- signal loop -----------------------------------------------

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP: reloading zones");
                match Config::load(&args.config) {
                    Ok(reloaded) => {
                        remove_stale_zones(&reloaded, &registry);
                        enqueue_zone_refreshes(&reloaded, &queues).await;
                    }
                    Err(e) => warn!(error = %e, "reload failed, keeping current zones"),
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT: shutting down");
                break;
            }
        }
    }

    shutdown.trigger();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("goodbye");
    Ok(())
}

/// Hand every configured zone to the refresh engine for (re-)admission.
async fn enqueue_zone_refreshes(config: &Config, queues: &Queues) {
    for (name, entry) in &config.zones {
        match entry.to_descriptor(name) {
            Ok(descriptor) => {
                let request = RefreshRequest {
                    name: descriptor.name.clone(),
                    store: descriptor.store,
                    edns: EdnsView::default(),
                    force: false,
                    descriptor: Some(descriptor),
                    respond: None,
                };
                if queues.refresh.send(request).await.is_err() {
                    warn!(zone = %name, "refresh engine gone, zone not admitted");
                }
            }
            Err(e) => warn!(zone = %name, error = %e, "bad zone entry skipped"),
        }
    }
}

/// Drop zones that vanished from the configuration, unless they were
/// created automatically at runtime.
fn remove_stale_zones(config: &Config, registry: &ZoneRegistry) {
    use tdnsd::zone::options::ZoneOption;
    let configured: HashSet<String> = config
        .zones
        .keys()
        .filter_map(|name| tdnsd::dns::name::Name::parse(name).ok())
        .map(|name| name.key())
        .collect();
    for (key, zone) in registry.items() {
        if !configured.contains(&key) && !zone.has_option(ZoneOption::AutomaticZone) {
            info!(zone = %key, "zone removed from configuration");
            registry.remove(&zone.name);
        }
    }
}

async fn start_listeners(config: &Config, ctx: Arc<ServerContext>) -> usize {
    let mut started = 0;

    for addr_str in &config.server.listen.do53 {
        let addr: std::net::SocketAddr = match addr_str.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(addr = %addr_str, "bad do53 listen address, skipping");
                continue;
            }
        };
        match tokio::net::UdpSocket::bind(addr).await {
            Ok(socket) => {
                let udp_ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_udp_listener(udp_ctx, socket).await {
                        error!(addr = %addr, error = %e, "UDP listener failed");
                    }
                });
                started += 1;
            }
            Err(e) => warn!(addr = %addr, error = %e, "UDP bind failed"),
        }
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                let tcp_ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_tcp_listener(tcp_ctx, listener).await {
                        error!(addr = %addr, error = %e, "TCP listener failed");
                    }
                });
                started += 1;
            }
            Err(e) => warn!(addr = %addr, error = %e, "TCP bind failed"),
        }
    }

    // The encrypted transports silently skip startup without certs.
    let (cert, key) = match (&config.server.cert_file, &config.server.key_file) {
        (Some(cert), Some(key)) if tls_material_present(cert, key) => (cert.clone(), key.clone()),
        _ => {
            if !config.server.listen.dot.is_empty()
                || !config.server.listen.doh.is_empty()
                || !config.server.listen.doq.is_empty()
            {
                info!("TLS material missing, skipping dot/doh/doq listeners");
            }
            return started;
        }
    };

    type Spawner = fn(Arc<ServerContext>, std::net::SocketAddr, Arc<rustls::ServerConfig>);
    let transports: [(&[String], Spawner, &[u8]); 3] = [
        (&config.server.listen.dot, spawn_dot, b"dot".as_slice()),
        (&config.server.listen.doh, spawn_doh, b"h2".as_slice()),
        (&config.server.listen.doq, spawn_doq, b"doq".as_slice()),
    ];

    for (addrs, spawner, alpn) in transports {
        if addrs.is_empty() {
            continue;
        }
        let tls = match load_tls_config(&cert, &key, &[alpn]) {
            Ok(tls) => tls,
            Err(e) => {
                warn!(error = %e, "TLS setup failed, skipping transport");
                continue;
            }
        };
        for addr_str in addrs {
            match addr_str.parse() {
                Ok(addr) => {
                    spawner(ctx.clone(), addr, tls.clone());
                    started += 1;
                }
                Err(_) => warn!(addr = %addr_str, "bad listen address, skipping"),
            }
        }
    }

    started
}

fn spawn_dot(ctx: Arc<ServerContext>, addr: std::net::SocketAddr, tls: Arc<rustls::ServerConfig>) {
    tokio::spawn(async move {
        if let Err(e) = run_dot_listener(ctx, addr, tls).await {
            error!(addr = %addr, error = %e, "DoT listener failed");
        }
    });
}

fn spawn_doh(ctx: Arc<ServerContext>, addr: std::net::SocketAddr, tls: Arc<rustls::ServerConfig>) {
    tokio::spawn(async move {
        if let Err(e) = run_doh_listener(ctx, addr, tls).await {
            error!(addr = %addr, error = %e, "DoH listener failed");
        }
    });
}

fn spawn_doq(ctx: Arc<ServerContext>, addr: std::net::SocketAddr, tls: Arc<rustls::ServerConfig>) {
    tokio::spawn(async move {
        if let Err(e) = run_doq_listener(ctx, addr, tls).await {
            error!(addr = %addr, error = %e, "DoQ listener failed");
        }
    });
}

/// Log-and-drop consumer for the queues whose engines live outside
/// this process core.
fn drain_queue<T: std::fmt::Debug + Send + 'static>(
    mut rx: tokio::sync::mpsc::Receiver<T>,
    name: &'static str,
    shutdown: Shutdown,
) {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                request = rx.recv() => {
                    let Some(request) = request else { break };
                    info!(queue = name, request = ?request, "handed to external engine");
                }
            }
        }
    });
}

/// Without an external validator the conservative answer is "no".
async fn answer_validator_queue(
    mut rx: tokio::sync::mpsc::Receiver<comms::ValidatorRequest>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = rx.recv() => {
                let Some(request) = request else { break };
                warn!(owner = %request.owner, "no validator engine configured, rejecting");
                let _ = request.respond.send(false);
            }
        }
    }
}
