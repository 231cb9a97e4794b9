//! The typed queue fabric between long-lived actors.
//!
//! Every inter-component queue carries exactly one message type.
//! Request/reply pairs use a oneshot carried inside the request; all
//! blocking sends happen inside a `select!` against shutdown.

use crate::dns::edns::EdnsView;
use crate::dns::enums::RrType;
use crate::dns::name::Name;
use crate::dns::packet::Message;
use crate::dns::record::Record;
use crate::error::Result;
use crate::update::policy::UpdatePolicy;
use crate::zone::options::ZoneOptionSet;
use crate::zone::zone::{ZoneRole, ZoneStoreKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Queue depths. These are tuning parameters, not correctness knobs.
pub const REFRESH_QUEUE_DEPTH: usize = 64;
pub const UPDATE_QUEUE_DEPTH: usize = 64;
pub const NOTIFY_QUEUE_DEPTH: usize = 64;
pub const SCAN_QUEUE_DEPTH: usize = 32;
pub const RESIGN_QUEUE_DEPTH: usize = 32;
pub const SYNC_QUEUE_DEPTH: usize = 32;
pub const VALIDATOR_QUEUE_DEPTH: usize = 16;
pub const AUTH_QUERY_QUEUE_DEPTH: usize = 32;

/// Everything the refresh engine needs to admit a zone it has not
/// seen before.
#[derive(Clone, Debug)]
pub struct ZoneDescriptor {
    pub name: Name,
    pub role: ZoneRole,
    pub store: ZoneStoreKind,
    pub upstream: Option<SocketAddr>,
    pub downstreams: Vec<SocketAddr>,
    pub zonefile: Option<PathBuf>,
    pub options: ZoneOptionSet,
    pub update_policy: UpdatePolicy,
    pub dnssec_policy: Option<String>,
    pub multi_signer: Option<String>,
    pub reset_soa_serial: bool,
}

impl ZoneDescriptor {
    pub fn new(name: Name, role: ZoneRole, store: ZoneStoreKind) -> Self {
        Self {
            name,
            role,
            store,
            upstream: None,
            downstreams: Vec::new(),
            zonefile: None,
            options: ZoneOptionSet::new(),
            update_policy: UpdatePolicy::default(),
            dnssec_policy: None,
            multi_signer: None,
            reset_soa_serial: false,
        }
    }
}

/// Ask the refresh engine to refresh (or admit) a zone.
#[derive(Debug)]
pub struct RefreshRequest {
    pub name: Name,
    pub store: ZoneStoreKind,
    pub edns: EdnsView,
    pub force: bool,
    /// Present when the zone is not yet registered.
    pub descriptor: Option<ZoneDescriptor>,
    pub respond: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

/// Ask the refresh engine to bump a zone's published serial.
#[derive(Debug)]
pub struct BumpRequest {
    pub name: Name,
    pub respond: oneshot::Sender<std::result::Result<u32, String>>,
}

/// An inbound DNS UPDATE handed from the router to the pipeline.
#[derive(Debug)]
pub struct DnsUpdateRequest {
    pub message: Message,
    pub edns: EdnsView,
    pub writer: ResponseWriter,
}

/// An inbound NOTIFY handed from the router to the notify responder.
#[derive(Debug)]
pub struct DnsNotifyRequest {
    pub message: Message,
    pub edns: EdnsView,
    pub writer: ResponseWriter,
}

/// The mutation command an approved UPDATE produces.
#[derive(Clone, Debug)]
pub enum UpdateCmd {
    ZoneUpdate {
        zone: Name,
        updates: Vec<Record>,
    },
    ChildUpdate {
        zone: Name,
        updates: Vec<Record>,
    },
    TrustStoreUpdate {
        zone: Name,
        child: Name,
        key_rr: Record,
        trusted: bool,
    },
}

/// Tell the notifier to send NOTIFY to a zone's downstreams.
#[derive(Clone, Debug)]
pub struct NotifyRequest {
    pub zone: Name,
}

/// Hand a child zone to the scanner.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub zone: Name,
    pub qtype: RrType,
}

/// Queue a zone for periodic re-signing.
#[derive(Clone, Debug)]
pub struct ResignRequest {
    pub zone: Name,
}

/// Ask the delegation-sync machinery to reconcile with the parent or
/// children.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub zone: Name,
    pub to_parent: bool,
}

/// Ask the validator whether an uploaded key validates via DNSSEC.
#[derive(Debug)]
pub struct ValidatorRequest {
    pub owner: Name,
    pub key_tag: u16,
    pub respond: oneshot::Sender<bool>,
}

/// In-process authoritative lookup, for engines that need zone data
/// without going through the wire.
#[derive(Debug)]
pub struct AuthQueryRequest {
    pub qname: Name,
    pub qtype: RrType,
    pub respond: oneshot::Sender<Vec<Record>>,
}

/// Where a response goes. UDP answers go straight to the socket; the
/// stream transports (tcp/dot/doh/doq) wait on a oneshot held by the
/// connection task.
#[derive(Debug)]
pub enum ResponseWriter {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Stream(oneshot::Sender<Vec<u8>>),
    /// Tests look at the bytes instead of a socket.
    #[cfg(test)]
    Sink(std::sync::Arc<parking_lot::Mutex<Option<Vec<u8>>>>),
}

impl ResponseWriter {
    pub async fn write(self, wire: Vec<u8>) -> Result<()> {
        match self {
            ResponseWriter::Udp { socket, peer } => {
                socket.send_to(&wire, peer).await?;
                Ok(())
            }
            ResponseWriter::Stream(tx) => {
                // The connection task may have gone away; nothing to do then.
                let _ = tx.send(wire);
                Ok(())
            }
            #[cfg(test)]
            ResponseWriter::Sink(slot) => {
                *slot.lock() = Some(wire);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub fn sink() -> (Self, std::sync::Arc<parking_lot::Mutex<Option<Vec<u8>>>>) {
        let slot = std::sync::Arc::new(parking_lot::Mutex::new(None));
        (ResponseWriter::Sink(slot.clone()), slot)
    }
}

/// The send halves handed to producers.
#[derive(Clone)]
pub struct Queues {
    pub refresh: mpsc::Sender<RefreshRequest>,
    pub bump: mpsc::Sender<BumpRequest>,
    pub dns_update: mpsc::Sender<DnsUpdateRequest>,
    pub dns_notify: mpsc::Sender<DnsNotifyRequest>,
    pub update_cmd: mpsc::Sender<UpdateCmd>,
    pub notify: mpsc::Sender<NotifyRequest>,
    pub scan: mpsc::Sender<ScanRequest>,
    pub resign: mpsc::Sender<ResignRequest>,
    pub sync: mpsc::Sender<SyncRequest>,
    pub validator: mpsc::Sender<ValidatorRequest>,
    pub auth_query: mpsc::Sender<AuthQueryRequest>,
}

/// The receive halves handed to the consuming actors.
pub struct QueueReceivers {
    pub refresh: mpsc::Receiver<RefreshRequest>,
    pub bump: mpsc::Receiver<BumpRequest>,
    pub dns_update: mpsc::Receiver<DnsUpdateRequest>,
    pub dns_notify: mpsc::Receiver<DnsNotifyRequest>,
    pub update_cmd: mpsc::Receiver<UpdateCmd>,
    pub notify: mpsc::Receiver<NotifyRequest>,
    pub scan: mpsc::Receiver<ScanRequest>,
    pub resign: mpsc::Receiver<ResignRequest>,
    pub sync: mpsc::Receiver<SyncRequest>,
    pub validator: mpsc::Receiver<ValidatorRequest>,
    pub auth_query: mpsc::Receiver<AuthQueryRequest>,
}

pub fn queues() -> (Queues, QueueReceivers) {
    let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
    let (bump_tx, bump_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
    let (dns_update_tx, dns_update_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
    let (dns_notify_tx, dns_notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let (update_cmd_tx, update_cmd_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
    let (resign_tx, resign_rx) = mpsc::channel(RESIGN_QUEUE_DEPTH);
    let (sync_tx, sync_rx) = mpsc::channel(SYNC_QUEUE_DEPTH);
    let (validator_tx, validator_rx) = mpsc::channel(VALIDATOR_QUEUE_DEPTH);
    let (auth_query_tx, auth_query_rx) = mpsc::channel(AUTH_QUERY_QUEUE_DEPTH);

    (
        Queues {
            refresh: refresh_tx,
            bump: bump_tx,
            dns_update: dns_update_tx,
            dns_notify: dns_notify_tx,
            update_cmd: update_cmd_tx,
            notify: notify_tx,
            scan: scan_tx,
            resign: resign_tx,
            sync: sync_tx,
            validator: validator_tx,
            auth_query: auth_query_tx,
        },
        QueueReceivers {
            refresh: refresh_rx,
            bump: bump_rx,
            dns_update: dns_update_rx,
            dns_notify: dns_notify_rx,
            update_cmd: update_cmd_rx,
            notify: notify_rx,
            scan: scan_rx,
            resign: resign_rx,
            sync: sync_rx,
            validator: validator_rx,
            auth_query: auth_query_rx,
        },
    )
}

/// Shutdown fan-out. Every actor loop holds a receiver and exits when
/// it fires.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_fabric_wires_up() {
        let (queues, mut receivers) = queues();
        queues
            .scan
            .send(ScanRequest {
                zone: Name::parse("child.example.").unwrap(),
                qtype: RrType::Cds,
            })
            .await
            .unwrap();
        let request = receivers.scan.recv().await.unwrap();
        assert_eq!(request.qtype, RrType::Cds);
    }

    #[tokio::test]
    async fn test_shutdown_fanout() {
        let shutdown = Shutdown::new();
        let mut rx1 = shutdown.subscribe();
        let mut rx2 = shutdown.subscribe();
        shutdown.trigger();
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_writer() {
        let (writer, slot) = ResponseWriter::sink();
        writer.write(vec![1, 2, 3]).await.unwrap();
        assert_eq!(slot.lock().clone(), Some(vec![1, 2, 3]));
    }
}
