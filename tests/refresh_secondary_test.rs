//! Secondary-zone lifecycle against a stub upstream: admission by the
//! refresh engine, then a NOTIFY-triggered refresh picking up a new
//! serial.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tdnsd::comms::{self, RefreshRequest, Shutdown, ZoneDescriptor};
use tdnsd::dns::edns::EdnsView;
use tdnsd::dns::enums::{Opcode, Rcode, RrClass, RrType};
use tdnsd::dns::name::Name;
use tdnsd::dns::packet::Message;
use tdnsd::dns::question::Question;
use tdnsd::dns::record::{Record, SoaRdata};
use tdnsd::keydb::KeyDb;
use tdnsd::refresh::RefreshEngine;
use tdnsd::zone::registry::ZoneRegistry;
use tdnsd::zone::zone::{ZoneRole, ZoneStoreKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

fn soa_record(zone: &Name, serial: u32) -> Record {
    let rdata = SoaRdata {
        mname: zone.prepend("ns1"),
        rname: zone.prepend("hostmaster"),
        serial,
        refresh: 1800,
        retry: 900,
        expire: 604800,
        minimum: 86400,
    };
    Record::new(zone.clone(), RrType::Soa, RrClass::In, 3600, rdata.to_wire())
}

fn zone_contents(zone: &Name, serial: u32) -> Vec<Record> {
    let mut ns_rdata = Vec::new();
    zone.prepend("ns1").to_wire(&mut ns_rdata);
    vec![
        soa_record(zone, serial),
        Record::new(zone.clone(), RrType::Ns, RrClass::In, 3600, ns_rdata),
        Record::new(
            zone.prepend("www"),
            RrType::A,
            RrClass::In,
            300,
            vec![192, 0, 2, serial as u8],
        ),
    ]
}

/// A stub primary answering SOA probes over UDP and AXFR over TCP,
/// serving whatever serial the shared counter holds.
async fn stub_upstream(zone: Name, serial: Arc<AtomicU32>) -> SocketAddr {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let udp = UdpSocket::bind(addr).await.unwrap();

    let probe_zone = zone.clone();
    let probe_serial = serial.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                break;
            };
            let Ok(query) = Message::parse(&buf[..len]) else {
                continue;
            };
            let mut response = query.response();
            response.header.aa = true;
            response
                .answers
                .push(soa_record(&probe_zone, probe_serial.load(Ordering::SeqCst)));
            let _ = udp
                .send_to(&response.serialize().unwrap(), peer)
                .await;
        }
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else {
                break;
            };
            let zone = zone.clone();
            let serial = serial.clone();
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let mut wire = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                if stream.read_exact(&mut wire).await.is_err() {
                    return;
                }
                let Ok(query) = Message::parse(&wire) else {
                    return;
                };

                let mut response = query.response();
                response.header.aa = true;
                response.answers = zone_contents(&zone, serial.load(Ordering::SeqCst));
                // Closing SOA
                response
                    .answers
                    .push(soa_record(&zone, serial.load(Ordering::SeqCst)));
                let body = response.serialize().unwrap();
                let _ = stream.write_all(&(body.len() as u16).to_be_bytes()).await;
                let _ = stream.write_all(&body).await;
            });
        }
    });

    addr
}

struct Harness {
    registry: Arc<ZoneRegistry>,
    queues: comms::Queues,
    dns_notify_tx: tokio::sync::mpsc::Sender<comms::DnsNotifyRequest>,
    _shutdown: Shutdown,
}

async fn harness() -> Harness {
    let registry = Arc::new(ZoneRegistry::new());
    let keydb = Arc::new(KeyDb::open_in_memory().unwrap());
    let shutdown = Shutdown::new();
    let (queues, receivers) = comms::queues();

    let engine = RefreshEngine::new(
        registry.clone(),
        keydb,
        queues.notify.clone(),
        queues.resign.clone(),
        queues.sync.clone(),
        HashSet::from(["example.com.".to_string()]),
        7200,
        vec!["do53".to_string()],
        Name::parse("ns1.example.com.").unwrap(),
        false,
    );
    tokio::spawn(engine.run(receivers.refresh, receivers.bump, shutdown.clone()));

    tokio::spawn(tdnsd::notify::run_notify_responder(
        registry.clone(),
        receivers.dns_notify,
        queues.refresh.clone(),
        queues.scan.clone(),
        shutdown.clone(),
    ));

    Harness {
        registry,
        dns_notify_tx: queues.dns_notify.clone(),
        queues,
        _shutdown: shutdown,
    }
}

async fn wait_for_serial(harness: &Harness, zone: &Name, serial: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(state) = harness.registry.get(zone) {
            if state.incoming_serial() == serial {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "serial {} never observed",
            serial
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn secondary_admission_transfers_from_upstream() {
    let zone = Name::parse("example.com.").unwrap();
    let serial = Arc::new(AtomicU32::new(2));
    let upstream = stub_upstream(zone.clone(), serial).await;
    let harness = harness().await;

    let mut descriptor = ZoneDescriptor::new(zone.clone(), ZoneRole::Secondary, ZoneStoreKind::Map);
    descriptor.upstream = Some(upstream);

    let (tx, rx) = tokio::sync::oneshot::channel();
    harness
        .queues
        .refresh
        .send(RefreshRequest {
            name: zone.clone(),
            store: ZoneStoreKind::Map,
            edns: EdnsView::default(),
            force: false,
            descriptor: Some(descriptor),
            respond: Some(tx),
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    wait_for_serial(&harness, &zone, 2).await;
    let state = harness.registry.get(&zone).unwrap();
    assert_eq!(state.refresh_count(), 1);
    assert!(state.rrset(&zone.prepend("www"), RrType::A).is_some());
}

#[tokio::test]
async fn notify_triggers_refresh_to_new_serial() {
    let zone = Name::parse("example.com.").unwrap();
    let serial = Arc::new(AtomicU32::new(2));
    let upstream = stub_upstream(zone.clone(), serial.clone()).await;
    let harness = harness().await;

    // Admit at serial 2
    let mut descriptor = ZoneDescriptor::new(zone.clone(), ZoneRole::Secondary, ZoneStoreKind::Map);
    descriptor.upstream = Some(upstream);
    let (tx, rx) = tokio::sync::oneshot::channel();
    harness
        .queues
        .refresh
        .send(RefreshRequest {
            name: zone.clone(),
            store: ZoneStoreKind::Map,
            edns: EdnsView::default(),
            force: false,
            descriptor: Some(descriptor),
            respond: Some(tx),
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();
    wait_for_serial(&harness, &zone, 2).await;

    // The primary moves to serial 3 and sends NOTIFY(SOA)
    serial.store(3, Ordering::SeqCst);
    let mut notify = Message::default();
    notify.header.id = 555;
    notify.header.opcode = Opcode::Notify.to_u8();
    notify.header.aa = true;
    notify
        .questions
        .push(Question::new(zone.clone(), RrType::Soa, RrClass::In));

    let (response_tx, response_rx) = tokio::sync::oneshot::channel();
    harness
        .dns_notify_tx
        .send(comms::DnsNotifyRequest {
            message: notify,
            edns: EdnsView::default(),
            writer: comms::ResponseWriter::Stream(response_tx),
        })
        .await
        .unwrap();

    let wire = tokio::time::timeout(Duration::from_secs(1), response_rx)
        .await
        .expect("NOTIFY answered within a second")
        .unwrap();
    let response = Message::parse(&wire).unwrap();
    assert_eq!(response.rcode(), Rcode::NoError);
    assert!(response.header.aa);

    // The refresh engine picks the request up and transfers serial 3
    wait_for_serial(&harness, &zone, 3).await;
}
