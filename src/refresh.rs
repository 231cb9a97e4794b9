//! The refresh engine.
//!
//! One task owns zone admission, the per-zone refresh counters, the
//! 1 Hz tick and serial bumps. Refreshes of already-registered zones
//! run as spawned subroutines; admission refreshes run inline so the
//! end-of-bulk barrier sees zones in order.

use crate::comms::{
    BumpRequest, NotifyRequest, RefreshRequest, ResignRequest, Shutdown, SyncRequest,
    ZoneDescriptor,
};
use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::record::{KeyRdata, Record, SvcbRdata};
use crate::dnssec::{KeyRole, SigningKey};
use crate::error::{ErrorKind, Result, TdnsError};
use crate::keydb::{DnssecKeyRow, KeyDb};
use crate::zone::options::ZoneOption;
use crate::zone::parser::ZoneParser;
use crate::zone::registry::ZoneRegistry;
use crate::zone::transfer;
use crate::zone::zone::{ZoneRole, ZoneState};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Primaries reload from file on a fixed day cadence, not the SOA.
const PRIMARY_REFRESH_SECS: u32 = 86400;

/// Per-zone refresh bookkeeping.
#[derive(Clone, Debug)]
pub struct RefreshCounter {
    pub interval: u32,
    pub countdown: u32,
    pub incoming_serial: u32,
    pub upstream: Option<SocketAddr>,
    pub downstreams: Vec<SocketAddr>,
}

pub struct RefreshEngine {
    registry: Arc<ZoneRegistry>,
    keydb: Arc<KeyDb>,
    notify: mpsc::Sender<NotifyRequest>,
    resign: mpsc::Sender<ResignRequest>,
    sync: mpsc::Sender<SyncRequest>,
    counters: HashMap<String, RefreshCounter>,
    /// Names still awaited before the cross-zone post-pass runs.
    expected: HashSet<String>,
    postpass_done: bool,
    max_refresh: u32,
    /// alpn values advertised by the transport-signal post-pass.
    transports: Vec<String>,
    server_id: Name,
    agent_mode: bool,
}

impl RefreshEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ZoneRegistry>,
        keydb: Arc<KeyDb>,
        notify: mpsc::Sender<NotifyRequest>,
        resign: mpsc::Sender<ResignRequest>,
        sync: mpsc::Sender<SyncRequest>,
        expected: HashSet<String>,
        max_refresh: u32,
        transports: Vec<String>,
        server_id: Name,
        agent_mode: bool,
    ) -> Self {
        Self {
            registry,
            keydb,
            notify,
            resign,
            sync,
            counters: HashMap::new(),
            expected,
            postpass_done: false,
            max_refresh,
            transports,
            server_id,
            agent_mode,
        }
    }

    pub async fn run(
        mut self,
        mut refresh_rx: mpsc::Receiver<RefreshRequest>,
        mut bump_rx: mpsc::Receiver<BumpRequest>,
        shutdown: Shutdown,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("refresh engine stopping");
                    break;
                }
                request = refresh_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle_refresh_request(request).await;
                }
                request = bump_rx.recv() => {
                    let Some(request) = request else { break };
                    self.handle_bump(request);
                }
                _ = tick.tick() => {
                    self.tick_once();
                }
            }
        }
    }

    async fn handle_refresh_request(&mut self, request: RefreshRequest) {
        let reply = match self.registry.get(&request.name) {
            Some(zone) => self.refresh_known(zone, request.force),
            None => match request.descriptor.clone() {
                Some(descriptor) => self.admit(descriptor, request.force).await,
                None => Err(format!("zone {} not registered", request.name)),
            },
        };
        if let Some(respond) = request.respond {
            let _ = respond.send(reply);
        }
    }

    /// Refresh a registered zone: gate on error/dirty state, then run
    /// the per-zone subroutine concurrently.
    fn refresh_known(
        &mut self,
        zone: Arc<ZoneState>,
        force: bool,
    ) -> std::result::Result<(), String> {
        if let Some(error) = zone.error() {
            if error.kind != ErrorKind::Refresh {
                return Err(format!("zone {} in {} state: {}", zone.name, error.kind, error.message));
            }
        }
        if zone.is_dirty() && zone.role == ZoneRole::Primary {
            return Err(format!(
                "zone {} has local changes, reload not possible",
                zone.name
            ));
        }

        let notify = self.notify.clone();
        let counters_serial = zone.incoming_serial();
        let name_key = zone.name.key();
        tokio::spawn(async move {
            if let Err(e) = refresh_zone(zone.clone(), force, notify).await {
                warn!(zone = %zone.name, error = %e, "refresh failed");
            }
        });
        // Tick bookkeeping keeps the last serial it saw; the refresh
        // subroutine updates zone state itself.
        if let Some(counter) = self.counters.get_mut(&name_key) {
            counter.incoming_serial = counters_serial;
        }
        Ok(())
    }

    /// Admit a zone the registry has never seen.
    async fn admit(
        &mut self,
        descriptor: ZoneDescriptor,
        force: bool,
    ) -> std::result::Result<(), String> {
        let name = descriptor.name.clone();
        info!(zone = %name, role = ?descriptor.role, store = ?descriptor.store, "admitting zone");

        let mut state = ZoneState::new(name.clone(), descriptor.store, descriptor.role)
            .with_options(descriptor.options.clone());
        state.upstream = descriptor.upstream;
        state.downstreams = descriptor.downstreams.clone();
        state.zonefile = descriptor.zonefile.clone();
        state.update_policy = descriptor.update_policy.clone();
        state.dnssec_policy = descriptor.dnssec_policy.clone();
        state.multi_signer = descriptor.multi_signer.clone();
        state.reset_soa_serial = descriptor.reset_soa_serial;
        let zone = Arc::new(state);

        // First refresh; failure leaves the zone registered in error
        // state so queries answer SERVFAIL instead of REFUSED.
        if let Err(e) = refresh_zone(zone.clone(), force, self.notify.clone()).await {
            warn!(zone = %name, error = %e, "initial refresh failed");
        }

        if !self.agent_mode {
            if let Err(e) = self.setup_zone_signing(&zone).await {
                warn!(zone = %name, error = %e, "signing setup failed");
                zone.set_error(ErrorKind::Dnssec, e.to_string());
            }
        }

        let interval = zone
            .soa_refresh_interval()
            .unwrap_or(3600)
            .min(self.max_refresh);
        let interval = match zone.role {
            ZoneRole::Primary => PRIMARY_REFRESH_SECS,
            ZoneRole::Secondary => interval,
        };
        self.counters.insert(
            name.key(),
            RefreshCounter {
                interval,
                countdown: interval,
                incoming_serial: zone.incoming_serial(),
                upstream: zone.upstream,
                downstreams: zone.downstreams.clone(),
            },
        );

        self.registry.set(zone.clone());

        if zone.has_option(ZoneOption::DelegationSyncChild) {
            let _ = self.sync.try_send(SyncRequest {
                zone: name.clone(),
                to_parent: true,
            });
        } else if zone.has_option(ZoneOption::DelegationSyncParent) {
            let _ = self.sync.try_send(SyncRequest {
                zone: name.clone(),
                to_parent: false,
            });
        }

        // End-of-bulk barrier
        self.expected.remove(&name.key());
        if self.expected.is_empty() && !self.postpass_done {
            self.run_transport_signal_postpass();
            self.postpass_done = true;
        }
        Ok(())
    }

    /// Seed signing material: make sure a CSK exists, publish its
    /// DNSKEY unless suppressed, and queue the zone for re-signing.
    async fn setup_zone_signing(&self, zone: &Arc<ZoneState>) -> Result<()> {
        if !zone.has_option(ZoneOption::OnlineSigning) {
            return Ok(());
        }
        let policy_name = zone.dnssec_policy.clone().unwrap_or_default();
        if policy_name == "none" {
            return Ok(());
        }

        let existing = self.keydb.dnssec_keys_for_zone(&zone.name.key())?;
        let key_row = match existing.into_iter().find(|k| k.role == KeyRole::Csk) {
            Some(row) => row,
            None => {
                let (key, pkcs8) =
                    SigningKey::generate(zone.name.clone(), crate::dnssec::ALG_ED25519, 257)?;
                let row = DnssecKeyRow {
                    zone: zone.name.key(),
                    role: KeyRole::Csk,
                    key_tag: key.key_tag,
                    algorithm: key.algorithm,
                    pkcs8,
                    public_key: key.public_key.clone(),
                };
                self.keydb.store_dnssec_key(&row)?;
                info!(zone = %zone.name, key_tag = key.key_tag, "generated CSK");
                row
            }
        };

        if !zone.has_option(ZoneOption::DontPublishKey) {
            let rdata = KeyRdata {
                flags: 257,
                protocol: 3,
                algorithm: key_row.algorithm,
                public_key: key_row.public_key.clone(),
            };
            zone.add_rr(Record::new(
                zone.name.clone(),
                RrType::Dnskey,
                RrClass::In,
                3600,
                rdata.to_wire(),
            ));
        }

        self.resign
            .send(ResignRequest {
                zone: zone.name.clone(),
            })
            .await
            .map_err(|_| TdnsError::ServerShutdown)?;
        Ok(())
    }

    /// Synthesise the transport-signalling SVCB RRset and plant it in
    /// every zone that asked for it. Runs once, when the expected zone
    /// set drains.
    fn run_transport_signal_postpass(&self) {
        if self.transports.is_empty() {
            return;
        }
        let owner = self.server_id.prepend("_dns");
        let rdata = SvcbRdata {
            priority: 1,
            target: self.server_id.clone(),
            alpn: self.transports.clone(),
        }
        .to_wire();

        let mut planted = 0;
        for (_, zone) in self.registry.items() {
            if zone.has_option(ZoneOption::AddTransportSignal) {
                zone.add_rr(Record::new(
                    owner.clone(),
                    RrType::Svcb,
                    RrClass::In,
                    3600,
                    rdata.clone(),
                ));
                planted += 1;
            }
            // server-svcb publishes the signal under the zone's own apex
            if zone.has_option(ZoneOption::ServerSvcb) {
                zone.add_rr(Record::new(
                    zone.name.prepend("_dns"),
                    RrType::Svcb,
                    RrClass::In,
                    3600,
                    rdata.clone(),
                ));
                planted += 1;
            }
        }
        info!(owner = %owner, zones = planted, "transport-signal post-pass complete");
    }

    /// One second of counter time. Returns the zones dispatched, which
    /// the tests inspect.
    pub fn tick_once(&mut self) -> Vec<String> {
        let mut due = Vec::new();
        for (name, counter) in self.counters.iter_mut() {
            counter.countdown = counter.countdown.saturating_sub(1);
            if counter.countdown == 0 {
                counter.countdown = counter.interval.min(self.max_refresh).max(1);
                due.push(name.clone());
            }
        }

        for name in &due {
            let Ok(parsed) = Name::parse(name) else { continue };
            let Some(zone) = self.registry.get(&parsed) else {
                continue;
            };
            if zone.error().is_some() {
                debug!(zone = %zone.name, "skipping timed refresh for zone in error");
                continue;
            }
            let notify = self.notify.clone();
            tokio::spawn(async move {
                if let Err(e) = refresh_zone(zone.clone(), false, notify).await {
                    warn!(zone = %zone.name, error = %e, "timed refresh failed");
                }
            });
        }
        due
    }

    fn handle_bump(&mut self, request: BumpRequest) {
        let reply = match self.registry.get(&request.name) {
            Some(zone) => {
                if let Some(error) = zone.error() {
                    Err(format!("zone {} in error state: {}", zone.name, error.message))
                } else {
                    match zone.bump_serial() {
                        Ok(serial) => {
                            let _ = self.notify.try_send(NotifyRequest {
                                zone: zone.name.clone(),
                            });
                            Ok(serial)
                        }
                        Err(e) => Err(e.to_string()),
                    }
                }
            }
            None => Err(format!("zone {} not registered", request.name)),
        };
        let _ = request.respond.send(reply);
    }

    #[cfg(test)]
    pub fn counter(&self, name: &str) -> Option<&RefreshCounter> {
        self.counters.get(name)
    }
}

/// The per-zone refresh subroutine: AXFR for secondaries, zonefile
/// reload for primaries. Notifies downstreams when content changed.
pub async fn refresh_zone(
    zone: Arc<ZoneState>,
    force: bool,
    notify: mpsc::Sender<NotifyRequest>,
) -> Result<()> {
    let outcome = match zone.role {
        ZoneRole::Secondary => {
            let upstream = zone.upstream.ok_or_else(|| {
                TdnsError::TransferFailed(format!("zone {} has no upstream", zone.name))
            })?;
            match transfer::refresh_from_upstream(upstream, &zone.name, zone.incoming_serial(), force)
                .await
            {
                Ok(Some(records)) => zone.load_records(records).map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            }
        }
        ZoneRole::Primary => {
            let path = zone.zonefile.clone().ok_or_else(|| {
                TdnsError::ZoneParse(format!("zone {} has no zonefile", zone.name))
            })?;
            let mut parser = ZoneParser::new(zone.name.clone());
            parser.parse_file(&path).and_then(|records| {
                zone.load_records(records).map(Some)
            })
        }
    };

    match outcome {
        Ok(changed) => {
            zone.mark_refreshed();
            if zone.reset_soa_serial && zone.role == ZoneRole::Secondary {
                let serial = zone.reset_serial_to_now()?;
                debug!(zone = %zone.name, serial, "serial reset to wall clock");
            }
            if changed == Some(true) {
                info!(zone = %zone.name, serial = zone.incoming_serial(), "zone content changed");
                if notify
                    .send(NotifyRequest {
                        zone: zone.name.clone(),
                    })
                    .await
                    .is_err()
                {
                    debug!("notifier gone, skipping downstream NOTIFY");
                }
            }
            Ok(())
        }
        Err(e) => {
            error!(zone = %zone.name, error = %e, "refresh failed");
            zone.set_error(ErrorKind::Refresh, e.to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::queues;
    use crate::zone::zone::ZoneStoreKind;
    use std::io::Write;

    fn zonefile(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const PRIMARY_ZONE: &str = "\
$ORIGIN example.com.\n\
$TTL 3600\n\
@ IN SOA ns1.example.com. hostmaster.example.com. 7 1200 900 604800 86400\n\
@ IN NS ns1.example.com.\n\
www IN A 192.0.2.1\n";

    fn engine(expected: &[&str]) -> (RefreshEngine, crate::comms::QueueReceivers) {
        let (queues_tx, receivers) = queues();
        let engine = RefreshEngine::new(
            Arc::new(ZoneRegistry::new()),
            Arc::new(KeyDb::open_in_memory().unwrap()),
            queues_tx.notify.clone(),
            queues_tx.resign.clone(),
            queues_tx.sync.clone(),
            expected.iter().map(|s| s.to_string()).collect(),
            7200,
            vec!["do53".to_string(), "dot".to_string()],
            Name::parse("ns1.example.com.").unwrap(),
            false,
        );
        (engine, receivers)
    }

    fn descriptor_for(file: &tempfile::NamedTempFile, options: &[&str]) -> ZoneDescriptor {
        let mut descriptor = ZoneDescriptor::new(
            Name::parse("example.com.").unwrap(),
            ZoneRole::Primary,
            ZoneStoreKind::Map,
        );
        descriptor.zonefile = Some(file.path().to_path_buf());
        descriptor.options = crate::zone::options::ZoneOptionSet::parse(
            &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        descriptor
    }

    #[tokio::test]
    async fn test_admission_registers_and_seeds_counter() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, _receivers) = engine(&["example.com."]);

        engine
            .admit(descriptor_for(&file, &[]), false)
            .await
            .unwrap();

        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        assert_eq!(zone.incoming_serial(), 7);
        assert_eq!(zone.refresh_count(), 1);

        let counter = engine.counter("example.com.").unwrap();
        // Primaries are pinned to the daily reload cadence
        assert_eq!(counter.interval, PRIMARY_REFRESH_SECS);
    }

    #[tokio::test]
    async fn test_admission_failure_registers_error_zone() {
        let (mut engine, _receivers) = engine(&["example.com."]);
        let mut descriptor = ZoneDescriptor::new(
            Name::parse("example.com.").unwrap(),
            ZoneRole::Primary,
            ZoneStoreKind::Map,
        );
        descriptor.zonefile = Some(std::path::PathBuf::from("/nonexistent/zone.db"));

        engine.admit(descriptor, false).await.unwrap();

        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        assert_eq!(zone.refresh_count(), 0);
        assert_eq!(zone.error().unwrap().kind, ErrorKind::Refresh);
    }

    #[tokio::test]
    async fn test_online_signing_seeds_key_and_resign_queue() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, mut receivers) = engine(&["example.com."]);

        engine
            .admit(descriptor_for(&file, &["online-signing"]), false)
            .await
            .unwrap();

        let request = receivers.resign.try_recv().unwrap();
        assert_eq!(request.zone.key(), "example.com.");

        let keys = engine.keydb.dnssec_keys_for_zone("example.com.").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].role, KeyRole::Csk);

        // DNSKEY published at the apex
        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        assert!(
            zone.rrset(&zone.name, RrType::Dnskey).is_some(),
            "CSK should be published"
        );
    }

    #[tokio::test]
    async fn test_dont_publish_key_respected() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, _receivers) = engine(&["example.com."]);

        engine
            .admit(
                descriptor_for(&file, &["online-signing", "dont-publish-key"]),
                false,
            )
            .await
            .unwrap();

        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        assert!(zone.rrset(&zone.name, RrType::Dnskey).is_none());
    }

    #[tokio::test]
    async fn test_barrier_runs_svcb_postpass() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, _receivers) = engine(&["example.com."]);

        engine
            .admit(descriptor_for(&file, &["add-transport-signal"]), false)
            .await
            .unwrap();

        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        let owner = Name::parse("_dns.ns1.example.com.").unwrap();
        let rrset = zone.rrset(&owner, RrType::Svcb).expect("SVCB planted");
        assert_eq!(rrset.records.len(), 1);
    }

    #[tokio::test]
    async fn test_counters_decrement_and_reset() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, _receivers) = engine(&["example.com."]);
        engine
            .admit(descriptor_for(&file, &[]), false)
            .await
            .unwrap();

        // Force a short countdown so the test does not loop for a day
        engine
            .counters
            .get_mut("example.com.")
            .unwrap()
            .countdown = 2;

        assert!(engine.tick_once().is_empty());
        let fired = engine.tick_once();
        assert_eq!(fired, vec!["example.com.".to_string()]);
        // Counter reset to min(interval, max_refresh)
        let counter = engine.counter("example.com.").unwrap();
        assert_eq!(counter.countdown, PRIMARY_REFRESH_SECS.min(7200));
    }

    #[tokio::test]
    async fn test_dirty_primary_refuses_reload() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, _receivers) = engine(&["example.com."]);
        engine
            .admit(descriptor_for(&file, &[]), false)
            .await
            .unwrap();

        let zone = engine
            .registry
            .get(&Name::parse("example.com.").unwrap())
            .unwrap();
        zone.set_dirty(true);

        let err = engine.refresh_known(zone, false).unwrap_err();
        assert!(err.contains("reload not possible"));
    }

    #[tokio::test]
    async fn test_bump_increments_serial_and_notifies() {
        let file = zonefile(PRIMARY_ZONE);
        let (mut engine, mut receivers) = engine(&["example.com."]);
        engine
            .admit(descriptor_for(&file, &[]), false)
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.handle_bump(BumpRequest {
            name: Name::parse("example.com.").unwrap(),
            respond: tx,
        });
        let serial = rx.await.unwrap().unwrap();
        assert_eq!(serial, 8);
        assert_eq!(
            receivers.notify.try_recv().unwrap().zone.key(),
            "example.com."
        );
    }

    #[tokio::test]
    async fn test_bump_unknown_zone_errors() {
        let (mut engine, _receivers) = engine(&[]);
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.handle_bump(BumpRequest {
            name: Name::parse("ghost.example.").unwrap(),
            respond: tx,
        });
        assert!(rx.await.unwrap().is_err());
    }
}
