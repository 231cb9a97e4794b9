//! DNS listeners and the per-message router.
//!
//! Every transport funnels into the same [`handle_message`]: QUERY is
//! answered synchronously, NOTIFY and UPDATE are enqueued with a bound
//! response writer and answered by their consumers, anything else gets
//! NOTIMP. The UDP receive buffer is sized to the maximum DNS message
//! so UPDATE bodies larger than typical queries fit.

use crate::comms::{DnsNotifyRequest, DnsUpdateRequest, Queues, ResponseWriter, Shutdown};
use crate::dns::edns::EdnsView;
use crate::dns::enums::{Opcode, Rcode};
use crate::dns::packet::Message;
use crate::error::Result;
use crate::query::QueryResponder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Maximum DNS message size we accept over UDP.
pub const MAX_UDP_MESSAGE: usize = 4096;

/// How long a stream connection waits for a queued NOTIFY/UPDATE
/// consumer to produce its response.
const STREAM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerContext {
    pub responder: QueryResponder,
    pub queues: Queues,
    pub shutdown: Shutdown,
}

/// Route one inbound message. The writer is consumed either here (for
/// synchronous answers) or by the queue consumer.
pub async fn handle_message(
    ctx: Arc<ServerContext>,
    wire: Vec<u8>,
    writer: ResponseWriter,
) -> Result<()> {
    let msg = match Message::parse(&wire) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "dropping unparseable message");
            return Ok(());
        }
    };
    let edns: EdnsView = msg.edns.as_ref().map(|opt| opt.view()).unwrap_or_default();

    match msg.opcode() {
        Some(Opcode::Query) => {
            let response = ctx.responder.respond(&msg, &edns);
            writer.write(response.serialize()?).await
        }
        Some(Opcode::Notify) => {
            let request = DnsNotifyRequest {
                message: msg,
                edns,
                writer,
            };
            let mut shutdown_rx = ctx.shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                sent = ctx.queues.dns_notify.send(request) => {
                    if let Err(e) = sent {
                        // Consumer gone; answer SERVFAIL ourselves
                        let response = e.0.message.response().with_rcode(Rcode::ServFail);
                        e.0.writer.write(response.serialize()?).await?;
                    }
                    Ok(())
                }
            }
        }
        Some(Opcode::Update) => {
            let request = DnsUpdateRequest {
                message: msg,
                edns,
                writer,
            };
            let mut shutdown_rx = ctx.shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                sent = ctx.queues.dns_update.send(request) => {
                    if let Err(e) = sent {
                        let response = e.0.message.response().with_rcode(Rcode::ServFail);
                        e.0.writer.write(response.serialize()?).await?;
                    }
                    Ok(())
                }
            }
        }
        _ => {
            debug!(opcode = msg.header.opcode, "unimplemented opcode");
            let response = msg.response().with_rcode(Rcode::NotImp);
            writer.write(response.serialize()?).await
        }
    }
}

/// The do53 UDP listener. The socket is bound by the caller so bind
/// failures surface at startup.
pub async fn run_udp_listener(ctx: Arc<ServerContext>, socket: UdpSocket) -> Result<()> {
    let addr = socket.local_addr()?;
    let socket = Arc::new(socket);
    info!(addr = %addr, "UDP listener up");
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(addr = %addr, "UDP listener stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                buf.truncate(len);
                let writer = ResponseWriter::Udp {
                    socket: socket.clone(),
                    peer,
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_message(ctx, buf, writer).await {
                        debug!(peer = %peer, error = %e, "message handling failed");
                    }
                });
            }
        }
    }
    Ok(())
}

/// The do53 TCP listener. Bound by the caller, like UDP.
pub async fn run_tcp_listener(ctx: Arc<ServerContext>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "TCP listener up");
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(addr = %addr, "TCP listener stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(ctx, stream, peer).await {
                        debug!(peer = %peer, error = %e, "TCP connection ended");
                    }
                });
            }
        }
    }
    Ok(())
}

/// Serve length-framed DNS messages on any async stream. Shared by
/// TCP, DoT and (with quinn's stream types) DoQ.
pub async fn serve_stream<S>(ctx: Arc<ServerContext>, mut stream: S, peer: SocketAddr) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(_) => break, // peer closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }
        let mut wire = vec![0u8; len];
        stream.read_exact(&mut wire).await?;

        let response = dispatch_stream_message(ctx.clone(), wire, peer).await?;
        if let Some(response) = response {
            stream
                .write_all(&(response.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&response).await?;
        }
    }
    Ok(())
}

/// Run one stream-framed message through the router and wait for
/// whichever consumer writes the response.
pub async fn dispatch_stream_message(
    ctx: Arc<ServerContext>,
    wire: Vec<u8>,
    peer: SocketAddr,
) -> Result<Option<Vec<u8>>> {
    let (tx, rx) = oneshot::channel();
    handle_message(ctx, wire, ResponseWriter::Stream(tx)).await?;
    match timeout(STREAM_RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(response)) => Ok(Some(response)),
        Ok(Err(_)) => {
            debug!(peer = %peer, "no response produced for stream message");
            Ok(None)
        }
        Err(_) => {
            warn!(peer = %peer, "stream response timeout");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::queues;
    use crate::dns::enums::{RrClass, RrType};
    use crate::dns::name::Name;
    use crate::dns::question::Question;
    use crate::query::ServerIdentity;
    use crate::zone::registry::ZoneRegistry;
    use crate::zone::zone::testutil::sample_zone;

    fn context() -> (Arc<ServerContext>, crate::comms::QueueReceivers) {
        let registry = Arc::new(ZoneRegistry::new());
        registry.set(Arc::new(sample_zone("example.com.")));
        let (queues_tx, receivers) = queues();
        let ctx = ServerContext {
            responder: QueryResponder::new(registry, ServerIdentity::default(), false),
            queues: queues_tx,
            shutdown: Shutdown::new(),
        };
        (Arc::new(ctx), receivers)
    }

    fn message(opcode: Opcode, qname: &str, qtype: RrType) -> Vec<u8> {
        let mut msg = Message::default();
        msg.header.id = 77;
        msg.header.opcode = opcode.to_u8();
        msg.questions.push(Question::new(
            Name::parse(qname).unwrap(),
            qtype,
            RrClass::In,
        ));
        msg.serialize().unwrap()
    }

    #[tokio::test]
    async fn test_query_answered_synchronously() {
        let (ctx, _receivers) = context();
        let (writer, slot) = ResponseWriter::sink();
        handle_message(ctx, message(Opcode::Query, "www.example.com.", RrType::A), writer)
            .await
            .unwrap();

        let wire = slot.lock().clone().expect("response written");
        let response = Message::parse(&wire).unwrap();
        assert_eq!(response.rcode(), Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_enqueued_not_answered_inline() {
        let (ctx, mut receivers) = context();
        let (writer, slot) = ResponseWriter::sink();
        handle_message(
            ctx,
            message(Opcode::Notify, "example.com.", RrType::Soa),
            writer,
        )
        .await
        .unwrap();

        // Router wrote nothing; the consumer owns the writer now
        assert!(slot.lock().is_none());
        let queued = receivers.dns_notify.try_recv().unwrap();
        assert_eq!(queued.message.opcode(), Some(Opcode::Notify));
    }

    #[tokio::test]
    async fn test_update_enqueued() {
        let (ctx, mut receivers) = context();
        let (writer, _slot) = ResponseWriter::sink();
        handle_message(
            ctx,
            message(Opcode::Update, "example.com.", RrType::Soa),
            writer,
        )
        .await
        .unwrap();
        assert!(receivers.dns_update.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_opcode_notimp() {
        let (ctx, _receivers) = context();
        let mut msg = Message::default();
        msg.header.id = 5;
        msg.header.opcode = 9;
        let (writer, slot) = ResponseWriter::sink();
        handle_message(ctx, msg.serialize().unwrap(), writer)
            .await
            .unwrap();

        let wire = slot.lock().clone().expect("response written");
        let response = Message::parse(&wire).unwrap();
        assert_eq!(response.rcode(), Rcode::NotImp);
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let (ctx, _receivers) = context();
        let (writer, slot) = ResponseWriter::sink();
        handle_message(ctx, vec![0xFF; 5], writer).await.unwrap();
        assert!(slot.lock().is_none());
    }
}
