//! Process-wide zone registry.
//!
//! A concurrent map from fully-qualified zone name to Zone State.
//! Reads never block writers; `items` is a point-in-time snapshot and
//! may miss zones inserted while it runs.

use crate::dns::name::Name;
use crate::zone::zone::ZoneState;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ZoneRegistry {
    zones: DashMap<String, Arc<ZoneState>>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &Name) -> Option<Arc<ZoneState>> {
        self.zones.get(&name.key()).map(|entry| entry.clone())
    }

    /// Insert or replace; idempotent on name.
    pub fn set(&self, zone: Arc<ZoneState>) {
        self.zones.insert(zone.name.key(), zone);
    }

    pub fn remove(&self, name: &Name) -> Option<Arc<ZoneState>> {
        self.zones.remove(&name.key()).map(|(_, zone)| zone)
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.zones.contains_key(&name.key())
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.zones.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn items(&self) -> Vec<(String, Arc<ZoneState>)> {
        self.zones
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Longest-suffix match: strip leading labels off `qname` until a
    /// registered zone is hit.
    pub fn find_zone(&self, qname: &Name) -> Option<Arc<ZoneState>> {
        let mut candidate = qname.clone();
        loop {
            if let Some(zone) = self.get(&candidate) {
                return Some(zone);
            }
            if candidate.is_root() {
                return None;
            }
            candidate = candidate.parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::zone::{ZoneRole, ZoneStoreKind};

    fn zone(name: &str) -> Arc<ZoneState> {
        Arc::new(ZoneState::new(
            Name::parse(name).unwrap(),
            ZoneStoreKind::Map,
            ZoneRole::Primary,
        ))
    }

    #[test]
    fn test_insert_idempotent_on_name() {
        let registry = ZoneRegistry::new();
        registry.set(zone("example.com."));
        registry.set(zone("Example.COM."));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&Name::parse("example.com.").unwrap()));
    }

    #[test]
    fn test_longest_suffix_match() {
        let registry = ZoneRegistry::new();
        registry.set(zone("example.com."));
        registry.set(zone("sub.example.com."));

        let hit = registry
            .find_zone(&Name::parse("www.sub.example.com.").unwrap())
            .unwrap();
        assert_eq!(hit.name.key(), "sub.example.com.");

        let hit = registry
            .find_zone(&Name::parse("www.other.example.com.").unwrap())
            .unwrap();
        assert_eq!(hit.name.key(), "example.com.");

        assert!(
            registry
                .find_zone(&Name::parse("foo.unknown.").unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_remove_and_snapshot() {
        let registry = ZoneRegistry::new();
        registry.set(zone("a.example."));
        registry.set(zone("b.example."));

        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec!["a.example.", "b.example."]);

        assert!(registry.remove(&Name::parse("a.example.").unwrap()).is_some());
        assert_eq!(registry.items().len(), 1);
        assert!(registry.remove(&Name::parse("a.example.").unwrap()).is_none());
    }
}
