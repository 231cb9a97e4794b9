//! The resigner: periodic re-signing of zones under online-signing
//! policy.
//!
//! A single task keeps the set of zones to maintain, populated from
//! the resign queue. Every tick it re-signs whatever is missing or
//! expiring. A failing zone is logged and retried on the next tick,
//! never dropped.

use crate::comms::{ResignRequest, Shutdown};
use crate::dnssec::{DnssecPolicy, KeyRole, SigningKey, sign_zone};
use crate::error::Result;
use crate::keydb::KeyDb;
use crate::zone::registry::ZoneRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const MIN_RESIGN_INTERVAL_SECS: u64 = 60;
pub const MAX_RESIGN_INTERVAL_SECS: u64 = 3600;

pub struct Resigner {
    registry: Arc<ZoneRegistry>,
    keydb: Arc<KeyDb>,
    policies: HashMap<String, DnssecPolicy>,
    interval: Duration,
    zones: HashSet<String>,
}

impl Resigner {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        keydb: Arc<KeyDb>,
        policies: HashMap<String, DnssecPolicy>,
        interval_secs: u64,
    ) -> Self {
        let clamped = interval_secs.clamp(MIN_RESIGN_INTERVAL_SECS, MAX_RESIGN_INTERVAL_SECS);
        Self {
            registry,
            keydb,
            policies,
            interval: Duration::from_secs(clamped),
            zones: HashSet::new(),
        }
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval.as_secs()
    }

    pub async fn run(mut self, mut intake: mpsc::Receiver<ResignRequest>, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("resigner stopping");
                    break;
                }
                request = intake.recv() => {
                    let Some(request) = request else { break };
                    debug!(zone = %request.zone, "zone queued for re-signing");
                    self.zones.insert(request.zone.key());
                }
                _ = tick.tick() => {
                    self.resign_all();
                }
            }
        }
    }

    fn resign_all(&self) {
        for name in &self.zones {
            if let Err(e) = self.resign_one(name) {
                // Errors never evict the zone; the next tick retries.
                warn!(zone = %name, error = %e, "re-signing failed");
            }
        }
    }

    fn resign_one(&self, name: &str) -> Result<usize> {
        let parsed = crate::dns::name::Name::parse(name)?;
        let Some(zone) = self.registry.get(&parsed) else {
            debug!(zone = %name, "zone no longer registered, skipping");
            return Ok(0);
        };

        let key = self.signing_key_for(name)?;
        let validity = self.validity_for(&zone.dnssec_policy);
        sign_zone(&zone, &key, validity)
    }

    fn signing_key_for(&self, zone: &str) -> Result<SigningKey> {
        let rows = self.keydb.dnssec_keys_for_zone(zone)?;
        let row = rows
            .into_iter()
            .find(|row| row.role == KeyRole::Csk)
            .ok_or_else(|| {
                crate::error::TdnsError::SigningFailed(format!("no CSK for zone {}", zone))
            })?;
        SigningKey::from_pkcs8(
            crate::dns::name::Name::parse(&row.zone)?,
            row.algorithm,
            257,
            &row.pkcs8,
        )
    }

    fn validity_for(&self, policy_name: &Option<String>) -> u64 {
        policy_name
            .as_ref()
            .and_then(|name| self.policies.get(name))
            .map(|policy| policy.csk.sig_validity_secs)
            .unwrap_or_else(|| DnssecPolicy::default().csk.sig_validity_secs)
    }
}
