//! DNS-over-TLS listener (RFC 7858).
//!
//! Same length-framed stream protocol as plain TCP, behind a TLS
//! accept.

use crate::error::Result;
use crate::server::{ServerContext, serve_stream};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

pub async fn run_dot_listener(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "DoT listener up");
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(addr = %addr, "DoT listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(e) = serve_stream(ctx, tls_stream, peer).await {
                                debug!(peer = %peer, error = %e, "DoT connection ended");
                            }
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    }
                });
            }
        }
    }
    Ok(())
}
