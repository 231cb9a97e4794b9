//! DNS-over-QUIC listener (RFC 9250).
//!
//! One DNS message per bidirectional stream, with the same 2-byte
//! length prefix the stream transports use.

use crate::error::{Result, TdnsError};
use crate::server::{ServerContext, dispatch_stream_message};
use quinn::crypto::rustls::QuicServerConfig;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn run_doq_listener(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
) -> Result<()> {
    let quic_config = QuicServerConfig::try_from(tls.as_ref().clone())
        .map_err(|e| TdnsError::CertificateParse(e.to_string()))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    let endpoint = quinn::Endpoint::server(server_config, addr)
        .map_err(|e| TdnsError::Io(e.to_string()))?;
    info!(addr = %addr, "DoQ listener up");
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(addr = %addr, "DoQ listener stopping");
                endpoint.close(0u32.into(), b"shutdown");
                break;
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => serve_connection(ctx, connection).await,
                        Err(e) => debug!(error = %e, "QUIC handshake failed"),
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_connection(ctx: Arc<ServerContext>, connection: quinn::Connection) {
    let peer = connection.remote_address();
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(pair) => pair,
            Err(_) => break, // connection closed
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_quic_stream(ctx, send, recv, peer).await {
                debug!(peer = %peer, error = %e, "DoQ stream ended");
            }
        });
    }
}

async fn serve_quic_stream(
    ctx: Arc<ServerContext>,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| TdnsError::Io(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut wire = vec![0u8; len];
    recv.read_exact(&mut wire)
        .await
        .map_err(|e| TdnsError::Io(e.to_string()))?;

    if let Some(response) = dispatch_stream_message(ctx, wire, peer).await? {
        send.write_all(&(response.len() as u16).to_be_bytes())
            .await
            .map_err(|e| TdnsError::Io(e.to_string()))?;
        send.write_all(&response)
            .await
            .map_err(|e| TdnsError::Io(e.to_string()))?;
        send.finish().map_err(|e| TdnsError::Io(e.to_string()))?;
    }
    Ok(())
}
