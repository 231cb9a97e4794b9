//! The closed enumeration of per-zone options.

use crate::error::{Result, TdnsError};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ZoneOption {
    AllowUpdates,
    AllowChildUpdates,
    AllowCombine,
    DelegationSyncParent,
    DelegationSyncChild,
    OnlineSigning,
    MultiSigner,
    FoldCase,
    BlackLies,
    DontPublishKey,
    ServerSvcb,
    Dirty,
    Frozen,
    AutomaticZone,
    AddTransportSignal,
}

impl ZoneOption {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow-updates" => Ok(ZoneOption::AllowUpdates),
            "allow-child-updates" => Ok(ZoneOption::AllowChildUpdates),
            "allow-combine" => Ok(ZoneOption::AllowCombine),
            "delegation-sync-parent" => Ok(ZoneOption::DelegationSyncParent),
            "delegation-sync-child" => Ok(ZoneOption::DelegationSyncChild),
            "online-signing" => Ok(ZoneOption::OnlineSigning),
            "multi-signer" => Ok(ZoneOption::MultiSigner),
            "fold-case" => Ok(ZoneOption::FoldCase),
            "black-lies" => Ok(ZoneOption::BlackLies),
            "dont-publish-key" => Ok(ZoneOption::DontPublishKey),
            "server-svcb" => Ok(ZoneOption::ServerSvcb),
            "dirty" => Ok(ZoneOption::Dirty),
            "frozen" => Ok(ZoneOption::Frozen),
            "automatic-zone" => Ok(ZoneOption::AutomaticZone),
            "add-transport-signal" => Ok(ZoneOption::AddTransportSignal),
            other => Err(TdnsError::UnknownZoneOption(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneOption::AllowUpdates => "allow-updates",
            ZoneOption::AllowChildUpdates => "allow-child-updates",
            ZoneOption::AllowCombine => "allow-combine",
            ZoneOption::DelegationSyncParent => "delegation-sync-parent",
            ZoneOption::DelegationSyncChild => "delegation-sync-child",
            ZoneOption::OnlineSigning => "online-signing",
            ZoneOption::MultiSigner => "multi-signer",
            ZoneOption::FoldCase => "fold-case",
            ZoneOption::BlackLies => "black-lies",
            ZoneOption::DontPublishKey => "dont-publish-key",
            ZoneOption::ServerSvcb => "server-svcb",
            ZoneOption::Dirty => "dirty",
            ZoneOption::Frozen => "frozen",
            ZoneOption::AutomaticZone => "automatic-zone",
            ZoneOption::AddTransportSignal => "add-transport-signal",
        }
    }
}

/// A zone's option set, parsed from configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneOptionSet {
    options: BTreeSet<ZoneOption>,
}

impl ZoneOptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown option names are an error; the zone enters config-error
    /// state rather than silently dropping the name.
    pub fn parse(names: &[String]) -> Result<Self> {
        let mut options = BTreeSet::new();
        for name in names {
            options.insert(ZoneOption::from_str(name)?);
        }
        Ok(Self { options })
    }

    pub fn insert(&mut self, option: ZoneOption) {
        self.options.insert(option);
    }

    pub fn contains(&self, option: ZoneOption) -> bool {
        self.options.contains(&option)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZoneOption> {
        self.options.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all() {
        for name in [
            "allow-updates",
            "allow-child-updates",
            "allow-combine",
            "delegation-sync-parent",
            "delegation-sync-child",
            "online-signing",
            "multi-signer",
            "fold-case",
            "black-lies",
            "dont-publish-key",
            "server-svcb",
            "dirty",
            "frozen",
            "automatic-zone",
            "add-transport-signal",
        ] {
            let option = ZoneOption::from_str(name).unwrap();
            assert_eq!(option.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(ZoneOption::from_str("no-such-option").is_err());
    }

    #[test]
    fn test_set_parse() {
        let set =
            ZoneOptionSet::parse(&["allow-updates".to_string(), "frozen".to_string()]).unwrap();
        assert!(set.contains(ZoneOption::AllowUpdates));
        assert!(set.contains(ZoneOption::Frozen));
        assert!(!set.contains(ZoneOption::OnlineSigning));
    }
}
