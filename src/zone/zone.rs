//! Per-zone state: owner index, RRsets, serials, options, policies.
//!
//! All mutation goes through the refresh engine (during refresh) or
//! the zone-update actor (approved UPDATE commands); readers take the
//! interior lock for the duration of one RRset and see a consistent
//! snapshot of it, nothing more.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::record::{Record, SoaRdata};
use crate::error::{ErrorKind, Result, TdnsError, ZoneErrorState};
use crate::update::policy::UpdatePolicy;
use crate::zone::options::{ZoneOption, ZoneOptionSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::debug;

/// How the zone's data is held in-process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZoneStoreKind {
    /// Transfer-only; data is not available for in-process lookups.
    Xfr,
    #[default]
    Map,
    Slice,
}

impl ZoneStoreKind {
    /// Unknown store names silently fall back to `map`.
    pub fn parse(s: &str) -> Self {
        match s {
            "xfr" => ZoneStoreKind::Xfr,
            "slice" => ZoneStoreKind::Slice,
            "map" => ZoneStoreKind::Map,
            other => {
                debug!(store = other, "unknown zone store, defaulting to map");
                ZoneStoreKind::Map
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZoneRole {
    #[default]
    Primary,
    Secondary,
}

/// An RRset plus the signatures covering it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RrSet {
    pub records: Vec<Record>,
    pub signatures: Vec<Record>,
}

impl RrSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One owner name and its RRsets.
#[derive(Clone, Debug, Default)]
pub struct Owner {
    pub name: Name,
    pub rrsets: HashMap<RrType, RrSet>,
}

/// Result of a lookup inside one zone.
#[derive(Clone, Debug)]
pub enum Lookup {
    Answer(RrSet),
    NoData { soa: Option<Record> },
    NxDomain { soa: Option<Record> },
    Delegation { owner: Name, ns: RrSet },
}

/// The mutable interior of a zone.
#[derive(Debug, Default)]
pub struct ZoneData {
    owners: Vec<Owner>,
    index: HashMap<String, usize>,
    pub incoming_serial: u32,
    pub current_serial: u32,
    pub dirty: bool,
    pub frozen: bool,
    pub error: Option<ZoneErrorState>,
    pub refresh_count: u64,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl ZoneData {
    fn owner(&self, name: &Name) -> Option<&Owner> {
        self.index.get(&name.key()).map(|&i| &self.owners[i])
    }

    fn owner_mut(&mut self, name: &Name) -> &mut Owner {
        let key = name.key();
        if let Some(&i) = self.index.get(&key) {
            return &mut self.owners[i];
        }
        self.owners.push(Owner {
            name: name.clone(),
            rrsets: HashMap::new(),
        });
        let i = self.owners.len() - 1;
        self.index.insert(key, i);
        &mut self.owners[i]
    }
}

/// Zone State: one registered zone and everything the engines need to
/// serve, refresh, update and sign it.
pub struct ZoneState {
    pub name: Name,
    pub store: ZoneStoreKind,
    pub role: ZoneRole,
    pub upstream: Option<SocketAddr>,
    pub downstreams: Vec<SocketAddr>,
    pub zonefile: Option<PathBuf>,
    pub options: ZoneOptionSet,
    pub update_policy: UpdatePolicy,
    pub dnssec_policy: Option<String>,
    pub multi_signer: Option<String>,
    /// Publish unix-now as the serial after each upstream refresh.
    pub reset_soa_serial: bool,
    data: RwLock<ZoneData>,
}

impl ZoneState {
    pub fn new(name: Name, store: ZoneStoreKind, role: ZoneRole) -> Self {
        Self {
            name,
            store,
            role,
            upstream: None,
            downstreams: Vec::new(),
            zonefile: None,
            options: ZoneOptionSet::new(),
            update_policy: UpdatePolicy::default(),
            dnssec_policy: None,
            multi_signer: None,
            reset_soa_serial: false,
            data: RwLock::new(ZoneData {
                current_serial: 1,
                ..ZoneData::default()
            }),
        }
    }

    /// Apply the option set, seeding the dirty/frozen runtime flags.
    pub fn with_options(mut self, options: ZoneOptionSet) -> Self {
        {
            let mut data = self.data.write();
            data.dirty = options.contains(ZoneOption::Dirty);
            data.frozen = options.contains(ZoneOption::Frozen);
        }
        self.options = options;
        self
    }

    pub fn has_option(&self, option: ZoneOption) -> bool {
        self.options.contains(option)
    }

    // --- flags and error state ------------------------------------

    pub fn is_frozen(&self) -> bool {
        self.data.read().frozen
    }

    pub fn is_dirty(&self) -> bool {
        self.data.read().dirty
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.data.write().dirty = dirty;
    }

    pub fn error(&self) -> Option<ZoneErrorState> {
        self.data.read().error.clone()
    }

    pub fn set_error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.data.write().error = Some(ZoneErrorState::new(kind, message));
    }

    pub fn clear_error(&self) {
        self.data.write().error = None;
    }

    pub fn refresh_count(&self) -> u64 {
        self.data.read().refresh_count
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.data.read().last_refreshed
    }

    // --- serials ---------------------------------------------------

    pub fn incoming_serial(&self) -> u32 {
        self.data.read().incoming_serial
    }

    pub fn current_serial(&self) -> u32 {
        self.data.read().current_serial
    }

    /// Bump the published serial, rewriting the apex SOA. Strictly
    /// monotonic.
    pub fn bump_serial(&self) -> Result<u32> {
        let mut data = self.data.write();
        let next = data.current_serial.wrapping_add(1).max(1);
        data.current_serial = next;
        Self::rewrite_soa_serial(&mut data, next)?;
        Ok(next)
    }

    /// reset-soa-serial policy: publish unix-now, but never step
    /// backwards relative to what we already published.
    pub fn reset_serial_to_now(&self) -> Result<u32> {
        let mut data = self.data.write();
        let now = Utc::now().timestamp() as u32;
        let next = now.max(data.current_serial.wrapping_add(1));
        data.current_serial = next;
        Self::rewrite_soa_serial(&mut data, next)?;
        Ok(next)
    }

    fn rewrite_soa_serial(data: &mut ZoneData, serial: u32) -> Result<()> {
        let apex_key = data
            .owners
            .first()
            .map(|o| o.name.key())
            .unwrap_or_default();
        if let Some(&i) = data.index.get(&apex_key) {
            if let Some(rrset) = data.owners[i].rrsets.get_mut(&RrType::Soa) {
                if let Some(soa_rr) = rrset.records.first_mut() {
                    let mut soa = SoaRdata::from_wire(&soa_rr.rdata)?;
                    soa.serial = serial;
                    soa_rr.rdata = soa.to_wire();
                }
            }
        }
        Ok(())
    }

    // --- content ---------------------------------------------------

    /// Replace the zone content wholesale after a refresh. Returns
    /// whether the content changed, judged by the upstream serial.
    pub fn load_records(&self, records: Vec<Record>) -> Result<bool> {
        let mut soa_serial = None;
        let mut owners: Vec<Owner> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        // The apex owner goes first so serial rewrites can find it.
        owners.push(Owner {
            name: self.name.clone(),
            rrsets: HashMap::new(),
        });
        index.insert(self.name.key(), 0);

        for rr in records {
            if rr.rtype == RrType::Soa && rr.name == self.name {
                soa_serial = Some(rr.soa()?.serial);
            }
            let key = rr.name.key();
            let i = match index.get(&key) {
                Some(&i) => i,
                None => {
                    owners.push(Owner {
                        name: rr.name.clone(),
                        rrsets: HashMap::new(),
                    });
                    let i = owners.len() - 1;
                    index.insert(key, i);
                    i
                }
            };
            let slot = match rr.rtype {
                RrType::Rrsig => {
                    let covered = RrType::from(rr.sig()?.type_covered);
                    owners[i]
                        .rrsets
                        .entry(covered)
                        .or_default()
                        .signatures
                        .push(rr);
                    continue;
                }
                rtype => owners[i].rrsets.entry(rtype).or_default(),
            };
            slot.records.push(rr);
        }

        let serial = soa_serial.ok_or(TdnsError::MissingSoa)?;

        let mut data = self.data.write();
        let changed = data.refresh_count == 0 || data.incoming_serial != serial;
        data.owners = owners;
        data.index = index;
        data.incoming_serial = serial;
        data.current_serial = serial.max(1);
        Ok(changed)
    }

    pub fn mark_refreshed(&self) {
        let mut data = self.data.write();
        data.refresh_count += 1;
        data.last_refreshed = Some(Utc::now());
        data.error = None;
    }

    pub fn soa(&self) -> Option<Record> {
        let data = self.data.read();
        data.owner(&self.name)
            .and_then(|o| o.rrsets.get(&RrType::Soa))
            .and_then(|set| set.records.first())
            .cloned()
    }

    pub fn soa_refresh_interval(&self) -> Option<u32> {
        self.soa().and_then(|rr| rr.soa().ok()).map(|s| s.refresh)
    }

    pub fn rrset(&self, name: &Name, rtype: RrType) -> Option<RrSet> {
        let data = self.data.read();
        data.owner(name).and_then(|o| o.rrsets.get(&rtype)).cloned()
    }

    pub fn owner_names(&self) -> Vec<Name> {
        self.data
            .read()
            .owners
            .iter()
            .map(|o| o.name.clone())
            .collect()
    }

    /// All RRsets, cloned: the resigner walks this outside the lock.
    pub fn rrset_snapshot(&self) -> Vec<(Name, RrType, RrSet)> {
        let data = self.data.read();
        let mut out = Vec::new();
        for owner in &data.owners {
            for (rtype, rrset) in &owner.rrsets {
                if !rrset.is_empty() {
                    out.push((owner.name.clone(), *rtype, rrset.clone()));
                }
            }
        }
        out
    }

    /// Install freshly generated signatures for one RRset.
    pub fn set_signatures(&self, name: &Name, rtype: RrType, signatures: Vec<Record>) {
        let mut data = self.data.write();
        let owner = data.owner_mut(name);
        if let Some(rrset) = owner.rrsets.get_mut(&rtype) {
            rrset.signatures = signatures;
        }
    }

    // --- lookups ---------------------------------------------------

    /// Is this name a delegation point of the zone (an NS owner below
    /// the apex)?
    pub fn is_delegation_point(&self, name: &Name) -> bool {
        if *name == self.name {
            return false;
        }
        let data = self.data.read();
        data.owner(name)
            .map(|o| o.rrsets.contains_key(&RrType::Ns))
            .unwrap_or(false)
    }

    /// The delegation point covering `name`, walking up towards the
    /// apex, exclusive.
    pub fn delegation_covering(&self, name: &Name) -> Option<Name> {
        let mut candidate = name.clone();
        while candidate.is_below(&self.name) {
            if self.is_delegation_point(&candidate) {
                return Some(candidate);
            }
            candidate = candidate.parent();
        }
        None
    }

    /// Resolve a query inside this zone. With the `slice` store the
    /// owner list is scanned in order; `map` uses the name index.
    pub fn lookup(&self, qname: &Name, qtype: RrType) -> Lookup {
        // A delegation below the apex shadows everything under it.
        if let Some(cut) = self.delegation_covering(qname) {
            if cut != *qname || qtype != RrType::Ds {
                let ns = self
                    .rrset(&cut, RrType::Ns)
                    .unwrap_or_default();
                return Lookup::Delegation { owner: cut, ns };
            }
        }

        let data = self.data.read();
        let owner = match self.store {
            ZoneStoreKind::Slice => data.owners.iter().find(|o| o.name == *qname),
            _ => data.owner(qname),
        };

        match owner {
            Some(owner) => match owner.rrsets.get(&qtype) {
                Some(rrset) if !rrset.is_empty() => Lookup::Answer(rrset.clone()),
                _ => Lookup::NoData {
                    soa: data
                        .owner(&self.name)
                        .and_then(|o| o.rrsets.get(&RrType::Soa))
                        .and_then(|s| s.records.first())
                        .cloned(),
                },
            },
            None => {
                let soa = data
                    .owner(&self.name)
                    .and_then(|o| o.rrsets.get(&RrType::Soa))
                    .and_then(|s| s.records.first())
                    .cloned();
                // black-lies zones never admit a name does not exist
                if self.options.contains(ZoneOption::BlackLies) {
                    Lookup::NoData { soa }
                } else {
                    Lookup::NxDomain { soa }
                }
            }
        }
    }

    // --- mutation (zone-update actor only) -------------------------

    /// Add one record, deduplicating identical rdata.
    pub fn add_rr(&self, rr: Record) {
        let mut data = self.data.write();
        let owner = data.owner_mut(&rr.name);
        let rrset = owner.rrsets.entry(rr.rtype).or_default();
        if !rrset
            .records
            .iter()
            .any(|existing| existing.rdata == rr.rdata)
        {
            rrset.records.push(rr);
            // Existing signatures no longer cover the set
            rrset.signatures.clear();
        }
    }

    /// Delete the specific record matching type and rdata.
    pub fn delete_rr(&self, name: &Name, rtype: RrType, rdata: &[u8]) {
        let mut data = self.data.write();
        let owner = data.owner_mut(name);
        let now_empty = match owner.rrsets.get_mut(&rtype) {
            Some(rrset) => {
                rrset.records.retain(|rr| rr.rdata != rdata);
                rrset.signatures.clear();
                rrset.records.is_empty()
            }
            None => false,
        };
        if now_empty {
            owner.rrsets.remove(&rtype);
        }
    }

    pub fn delete_rrset(&self, name: &Name, rtype: RrType) {
        let mut data = self.data.write();
        let owner = data.owner_mut(name);
        owner.rrsets.remove(&rtype);
    }

    pub fn delete_name(&self, name: &Name) {
        let mut data = self.data.write();
        let owner = data.owner_mut(name);
        owner.rrsets.clear();
    }

    /// Apply one update-section record with RFC 2136 class semantics.
    pub fn apply_update_rr(&self, rr: &Record) {
        match (rr.class, rr.rtype) {
            (RrClass::Any, RrType::Any) => self.delete_name(&rr.name),
            (RrClass::Any, rtype) => self.delete_rrset(&rr.name, rtype),
            (RrClass::None, rtype) => self.delete_rr(&rr.name, rtype, &rr.rdata),
            (_, _) => {
                let mut add = rr.clone();
                add.class = RrClass::In;
                self.add_rr(add);
            }
        }
    }
}

impl std::fmt::Debug for ZoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneState")
            .field("name", &self.name.to_string())
            .field("store", &self.store)
            .field("role", &self.role)
            .field("current_serial", &self.current_serial())
            .finish()
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::dns::record::txt_rdata;

    /// A minimal primary zone with SOA, apex NS and one A record.
    pub fn sample_zone(name: &str) -> ZoneState {
        let apex = Name::parse(name).unwrap();
        let zone = ZoneState::new(apex.clone(), ZoneStoreKind::Map, ZoneRole::Primary);
        zone.load_records(sample_records(name)).unwrap();
        zone.mark_refreshed();
        zone
    }

    pub fn sample_records(name: &str) -> Vec<Record> {
        let apex = Name::parse(name).unwrap();
        let soa = SoaRdata {
            mname: apex.prepend("ns1"),
            rname: apex.prepend("hostmaster"),
            serial: 2,
            refresh: 3600,
            retry: 900,
            expire: 604800,
            minimum: 86400,
        };
        vec![
            Record::new(apex.clone(), RrType::Soa, RrClass::In, 3600, soa.to_wire()),
            Record::new(apex.clone(), RrType::Ns, RrClass::In, 3600, {
                let mut out = Vec::new();
                apex.prepend("ns1").to_wire(&mut out);
                out
            }),
            Record::new(
                apex.prepend("www"),
                RrType::A,
                RrClass::In,
                300,
                vec![192, 0, 2, 1],
            ),
            Record::new(
                apex.prepend("www"),
                RrType::Txt,
                RrClass::In,
                300,
                txt_rdata("hello"),
            ),
        ]
    }
}
