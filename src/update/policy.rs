//! Update-policy evaluation for the two policy scopes.
//!
//! The `zone` scope governs authoritative data, the `child` scope
//! governs delegation-owner data held by the parent. Both carry a name
//! discipline (self / selfsub / none) and an RRTYPE allow-list; the
//! child scope additionally decides how new SIG(0) keys may be
//! uploaded.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::record::Record;
use std::collections::HashSet;
use tracing::debug;

/// The name discipline of a policy scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyType {
    /// "self": the owner name must equal the signer name.
    SelfName,
    /// "selfsub": the owner name must be at or below the signer name.
    SelfSub,
    /// "none": all updates rejected.
    NoneAllowed,
    /// Not configured; rejects like "none" but reports it as such.
    #[default]
    Unset,
}

impl PolicyType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self" => Some(PolicyType::SelfName),
            "selfsub" => Some(PolicyType::SelfSub),
            "none" => Some(PolicyType::NoneAllowed),
            "" => Some(PolicyType::Unset),
            _ => None,
        }
    }
}

/// How the child scope accepts SIG(0) key uploads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyUploadMode {
    Unvalidated,
    Validated,
    #[default]
    Disabled,
}

impl KeyUploadMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unvalidated" => Some(KeyUploadMode::Unvalidated),
            "validated" => Some(KeyUploadMode::Validated),
            "none" | "" => Some(KeyUploadMode::Disabled),
            _ => None,
        }
    }
}

/// One policy scope: name discipline plus RRTYPE allow-list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopePolicy {
    pub ptype: PolicyType,
    pub rrtypes: HashSet<RrType>,
}

impl ScopePolicy {
    pub fn new(ptype: PolicyType, rrtypes: impl IntoIterator<Item = RrType>) -> Self {
        Self {
            ptype,
            rrtypes: rrtypes.into_iter().collect(),
        }
    }
}

/// The child scope with its key-upload settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChildPolicy {
    pub scope: ScopePolicy,
    pub key_upload: KeyUploadMode,
    /// Bootstrap method names, interpreted by name
    /// (strict-manual, dnssec-validated, consistent-lookup).
    pub key_bootstrap: Vec<String>,
}

impl ChildPolicy {
    pub fn bootstrap_includes(&self, method: &str) -> bool {
        self.key_bootstrap.iter().any(|m| m == method)
    }
}

/// The full update policy carried on a zone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdatePolicy {
    pub zone: ScopePolicy,
    pub child: ChildPolicy,
}

/// Why a policy check refused an update.
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyViolation {
    TypeNotAllowed { owner: String, rtype: RrType },
    NameMismatch { owner: String, signer: String },
    AllRejected,
    NotConfigured,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::TypeNotAllowed { owner, rtype } => {
                write!(f, "type {} not permitted at {}", rtype, owner)
            }
            PolicyViolation::NameMismatch { owner, signer } => {
                write!(f, "owner {} not permitted for signer {}", owner, signer)
            }
            PolicyViolation::AllRejected => write!(f, "policy rejects all updates"),
            PolicyViolation::NotConfigured => write!(f, "no update policy configured"),
        }
    }
}

impl ScopePolicy {
    /// Check every record in the update section against this scope.
    /// Additions, specific deletes (class NONE) and RRset deletes
    /// (class ANY) are all held to the same discipline.
    pub fn check(&self, signer: &Name, updates: &[Record]) -> Result<(), PolicyViolation> {
        match self.ptype {
            PolicyType::NoneAllowed => return Err(PolicyViolation::AllRejected),
            PolicyType::Unset => return Err(PolicyViolation::NotConfigured),
            PolicyType::SelfName | PolicyType::SelfSub => {}
        }

        for rr in updates {
            // Whole-name deletes (class ANY, type ANY) carry no concrete
            // type to check; everything else must be on the allow-list.
            if rr.rtype != RrType::Any && !self.rrtypes.contains(&rr.rtype) {
                debug!(owner = %rr.name, rtype = %rr.rtype, "rrtype not in policy set");
                return Err(PolicyViolation::TypeNotAllowed {
                    owner: rr.name.to_string(),
                    rtype: rr.rtype,
                });
            }

            let name_ok = match self.ptype {
                PolicyType::SelfName => rr.name == *signer,
                PolicyType::SelfSub => rr.name.ends_with(signer),
                _ => unreachable!(),
            };
            if !name_ok {
                return Err(PolicyViolation::NameMismatch {
                    owner: rr.name.to_string(),
                    signer: signer.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// True when the update is the shape the unvalidated-key-upload rule
/// accepts: exactly one KEY record, not a delete.
pub fn is_single_key_upload(updates: &[Record]) -> bool {
    updates.len() == 1
        && updates[0].rtype == RrType::Key
        && updates[0].class != RrClass::None
        && updates[0].class != RrClass::Any
}
