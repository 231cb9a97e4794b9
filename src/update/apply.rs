//! The zone-update actor.
//!
//! All approved mutation commands funnel through this single task, so
//! writes to any one zone's data are serialised. Zone and child
//! updates bump the published serial and wake the downstream
//! notifier; trust-store updates only touch the key database.

use crate::comms::{NotifyRequest, ResignRequest, Shutdown, UpdateCmd};
use crate::error::{Result, TdnsError};
use crate::keydb::{KeyDb, TrustRecord};
use crate::zone::options::ZoneOption;
use crate::zone::registry::ZoneRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of applying one command, used to decide follow-up work.
#[derive(Debug)]
pub struct Applied {
    pub zone: Option<crate::dns::name::Name>,
    pub new_serial: Option<u32>,
    pub wants_resign: bool,
}

/// Apply a single mutation command against registry and key store.
pub fn apply_cmd(registry: &ZoneRegistry, keydb: &KeyDb, cmd: &UpdateCmd) -> Result<Applied> {
    match cmd {
        UpdateCmd::ZoneUpdate { zone, updates } | UpdateCmd::ChildUpdate { zone, updates } => {
            let state = registry
                .get(zone)
                .ok_or_else(|| TdnsError::ZoneNotFound(zone.to_string()))?;
            for rr in updates {
                state.apply_update_rr(rr);
            }
            let serial = state.bump_serial()?;
            state.set_dirty(true);
            info!(zone = %zone, serial, records = updates.len(), "zone mutated by UPDATE");
            Ok(Applied {
                zone: Some(zone.clone()),
                new_serial: Some(serial),
                wants_resign: state.has_option(ZoneOption::OnlineSigning),
            })
        }
        UpdateCmd::TrustStoreUpdate {
            zone,
            child,
            key_rr,
            trusted,
        } => {
            let key = key_rr.key()?;
            keydb.store_trust_record(&TrustRecord {
                zone: zone.key(),
                child: child.clone(),
                key_tag: key.key_tag(),
                algorithm: key.algorithm,
                public_key: key.public_key.clone(),
                trusted: *trusted,
            })?;
            info!(
                zone = %zone,
                child = %child,
                key_tag = key.key_tag(),
                trusted,
                "trust store updated"
            );
            Ok(Applied {
                zone: None,
                new_serial: None,
                wants_resign: false,
            })
        }
    }
}

pub async fn run_zone_update_actor(
    registry: Arc<ZoneRegistry>,
    keydb: Arc<KeyDb>,
    mut intake: mpsc::Receiver<UpdateCmd>,
    notify: mpsc::Sender<NotifyRequest>,
    resign: mpsc::Sender<ResignRequest>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("zone-update actor stopping");
                break;
            }
            cmd = intake.recv() => {
                let Some(cmd) = cmd else { break };
                match apply_cmd(&registry, &keydb, &cmd) {
                    Ok(applied) => {
                        if let Some(zone) = applied.zone {
                            let mut dispatch_shutdown = shutdown.subscribe();
                            let request = NotifyRequest { zone: zone.clone() };
                            tokio::select! {
                                _ = dispatch_shutdown.recv() => break,
                                sent = notify.send(request) => {
                                    if sent.is_err() {
                                        debug!("notifier gone, skipping downstream NOTIFY");
                                    }
                                }
                            }
                            if applied.wants_resign {
                                let request = ResignRequest { zone };
                                tokio::select! {
                                    _ = dispatch_shutdown.recv() => break,
                                    sent = resign.send(request) => {
                                        if sent.is_err() {
                                            debug!("resigner gone, skipping resign request");
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "mutation command failed"),
                }
            }
        }
    }
}
