//! NOTIFY handling, both directions.
//!
//! Inbound NOTIFY messages are classified by qtype and fanned into the
//! refresh or scan queues; the reply goes out once the request is
//! safely enqueued. Outbound, the notifier task sends NOTIFY(SOA) to a
//! zone's downstreams whenever its content changes.

use crate::comms::{
    DnsNotifyRequest, NotifyRequest, RefreshRequest, ScanRequest, Shutdown,
};
use crate::dns::enums::{Opcode, Rcode, RrClass, RrType};
use crate::dns::header::Header;
use crate::dns::name::Name;
use crate::dns::packet::Message;
use crate::dns::question::Question;
use crate::error::Result;
use crate::zone::registry::ZoneRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const NOTIFY_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The inbound NOTIFY responder actor.
pub async fn run_notify_responder(
    registry: Arc<ZoneRegistry>,
    mut intake: mpsc::Receiver<DnsNotifyRequest>,
    refresh: mpsc::Sender<RefreshRequest>,
    scan: mpsc::Sender<ScanRequest>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("notify responder stopping");
                break;
            }
            request = intake.recv() => {
                let Some(request) = request else { break };
                let response =
                    handle_notify(&registry, &refresh, &scan, &request, &shutdown).await;
                match response.serialize() {
                    Ok(wire) => {
                        if let Err(e) = request.writer.write(wire).await {
                            warn!(error = %e, "failed to write NOTIFY response");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize NOTIFY response"),
                }
            }
        }
    }
}

async fn handle_notify(
    registry: &ZoneRegistry,
    refresh: &mpsc::Sender<RefreshRequest>,
    scan: &mpsc::Sender<ScanRequest>,
    request: &DnsNotifyRequest,
    shutdown: &Shutdown,
) -> Message {
    let mut shutdown_rx = shutdown.subscribe();
    let msg = &request.message;
    let Some(question) = msg.zone() else {
        return msg.response().with_rcode(Rcode::FormErr);
    };

    // The qname must name a zone we host exactly; a child of one of
    // our delegations is not ours to refresh.
    let Some(zone) = registry.get(&question.qname) else {
        debug!(qname = %question.qname, "NOTIFY for unknown zone");
        return msg.response().with_rcode(Rcode::Refused);
    };

    let enqueued = match question.qtype {
        RrType::Soa => {
            let outbound = RefreshRequest {
                name: zone.name.clone(),
                store: zone.store,
                edns: request.edns.clone(),
                force: false,
                descriptor: None,
                respond: None,
            };
            tokio::select! {
                _ = shutdown_rx.recv() => Err(()),
                sent = refresh.send(outbound) => sent.map_err(|_| ()),
            }
        }
        RrType::Cds | RrType::Csync | RrType::Dnskey => {
            let outbound = ScanRequest {
                zone: zone.name.clone(),
                qtype: question.qtype,
            };
            tokio::select! {
                _ = shutdown_rx.recv() => Err(()),
                sent = scan.send(outbound) => sent.map_err(|_| ()),
            }
        }
        other => {
            info!(qname = %question.qname, qtype = %other, "NOTIFY of unhandled qtype, acknowledging");
            Ok(())
        }
    };

    match enqueued {
        Ok(()) => {
            let mut response = msg.response();
            response.header.aa = true;
            response
        }
        Err(()) => msg.response().with_rcode(Rcode::ServFail),
    }
}

/// Build the NOTIFY(SOA) message announcing a zone change.
fn notify_message(zone_name: &Name, soa: Option<crate::dns::record::Record>) -> Message {
    let mut msg = Message {
        header: Header {
            id: rand::random(),
            qr: false,
            opcode: Opcode::Notify.to_u8(),
            aa: true,
            ..Header::default()
        },
        questions: vec![Question::new(zone_name.clone(), RrType::Soa, RrClass::In)],
        answers: Vec::new(),
        authorities: Vec::new(),
        additionals: Vec::new(),
        edns: None,
    };
    if let Some(soa) = soa {
        msg.answers.push(soa);
    }
    msg
}

/// The outbound notifier actor: consumes NotifyDownstreams requests.
pub async fn run_notifier(
    registry: Arc<ZoneRegistry>,
    mut intake: mpsc::Receiver<NotifyRequest>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("notifier stopping");
                break;
            }
            request = intake.recv() => {
                let Some(request) = request else { break };
                if let Err(e) = notify_downstreams(&registry, &request.zone).await {
                    warn!(zone = %request.zone, error = %e, "downstream NOTIFY failed");
                }
            }
        }
    }
}

async fn notify_downstreams(registry: &ZoneRegistry, zone_name: &Name) -> Result<()> {
    let Some(zone) = registry.get(zone_name) else {
        debug!(zone = %zone_name, "cannot notify for unregistered zone");
        return Ok(());
    };
    if zone.downstreams.is_empty() {
        return Ok(());
    }

    let msg = notify_message(zone_name, zone.soa());
    let wire = msg.serialize()?;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    info!(zone = %zone_name, targets = zone.downstreams.len(), "sending NOTIFY downstream");
    for target in &zone.downstreams {
        if let Err(e) = socket.send_to(&wire, target).await {
            warn!(target = %target, error = %e, "NOTIFY send failed");
            continue;
        }
        let mut buf = [0u8; 512];
        match timeout(NOTIFY_REPLY_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if from == *target => match Message::parse(&buf[..len]) {
                Ok(reply) if reply.header.id == msg.header.id => {
                    debug!(target = %target, rcode = reply.header.rcode, "NOTIFY acknowledged");
                }
                Ok(_) => debug!(target = %target, "mismatched NOTIFY reply"),
                Err(e) => warn!(target = %target, error = %e, "bad NOTIFY reply"),
            },
            Ok(Ok(_)) => debug!(target = %target, "NOTIFY reply from unexpected peer"),
            Ok(Err(e)) => warn!(target = %target, error = %e, "NOTIFY reply receive failed"),
            Err(_) => debug!(target = %target, "NOTIFY reply timeout"),
        }
    }
    Ok(())
}
