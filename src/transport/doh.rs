//! DNS-over-HTTPS listener (RFC 8484).
//!
//! Accepts POST bodies and GET `?dns=` base64url payloads on
//! /dns-query, answering with application/dns-message. The DNS
//! handling behind it is the same router every other transport uses.

use crate::error::Result;
use crate::server::{ServerContext, dispatch_stream_message};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

const DNS_MESSAGE: &str = "application/dns-message";

pub async fn run_doh_listener(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "DoH listener up");
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(addr = %addr, "DoH listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |request| {
                        let ctx = ctx.clone();
                        async move { serve_http(ctx, request, peer).await }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "DoH connection ended");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_http<B>(
    ctx: Arc<ServerContext>,
    request: Request<B>,
    peer: SocketAddr,
) -> std::result::Result<Response<Full<Bytes>>, B::Error>
where
    B: hyper::body::Body,
{
    if request.uri().path() != "/dns-query" {
        return Ok(status(StatusCode::NOT_FOUND));
    }

    let method = request.method().clone();
    let wire = if method == Method::POST {
        request.into_body().collect().await?.to_bytes().to_vec()
    } else if method == Method::GET {
        let encoded = request.uri().query().and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("dns=").map(str::to_string))
        });
        match encoded.and_then(|value| URL_SAFE_NO_PAD.decode(value).ok()) {
            Some(wire) => wire,
            None => return Ok(status(StatusCode::BAD_REQUEST)),
        }
    } else {
        return Ok(status(StatusCode::METHOD_NOT_ALLOWED));
    };

    match dispatch_stream_message(ctx, wire, peer).await {
        Ok(Some(response)) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(Full::new(Bytes::from(response)))
            .expect("static response builds")),
        Ok(None) => Ok(status(StatusCode::GATEWAY_TIMEOUT)),
        Err(_) => Ok(status(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::new(Bytes::new()))
        .expect("static response builds")
}
