//! DNSSEC policy and online signing.
//!
//! A DNSSEC policy names an algorithm and per-role lifetimes; the
//! signer turns a zone's RRsets into RRSIGs with ring. Only signing is
//! done here — SIG(0) transaction verification lives in the update
//! pipeline.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::record::{Record, SigRdata, key_tag};
use crate::error::{Result, TdnsError};
use crate::zone::zone::ZoneState;
use chrono::Utc;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair};
use tracing::{debug, warn};

/// Algorithm numbers the signer supports.
pub const ALG_RSASHA256: u8 = 8;
pub const ALG_ECDSA_P256: u8 = 13;
pub const ALG_ED25519: u8 = 15;

/// Lifetime sentinel for "forever".
pub const LIFETIME_FOREVER: u64 = u64::MAX / 2;

/// Inception is backdated to absorb clock skew between validators.
const INCEPTION_SKEW_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRole {
    Ksk,
    Zsk,
    Csk,
}

impl KeyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Ksk => "KSK",
            KeyRole::Zsk => "ZSK",
            KeyRole::Csk => "CSK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "KSK" => Some(KeyRole::Ksk),
            "ZSK" => Some(KeyRole::Zsk),
            "CSK" => Some(KeyRole::Csk),
            _ => None,
        }
    }
}

/// (active lifetime, signature validity), both in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyLifetime {
    pub active_secs: u64,
    pub sig_validity_secs: u64,
}

impl KeyLifetime {
    /// Parse a lifetime word: "forever", "none", or plain seconds.
    pub fn parse_word(s: &str) -> Option<u64> {
        match s {
            "forever" => Some(LIFETIME_FOREVER),
            "none" => Some(0),
            other => other.parse().ok(),
        }
    }
}

impl Default for KeyLifetime {
    fn default() -> Self {
        Self {
            active_secs: LIFETIME_FOREVER,
            sig_validity_secs: 14 * 86400,
        }
    }
}

/// A named DNSSEC policy from configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct DnssecPolicy {
    pub name: String,
    pub algorithm: u8,
    pub ksk: KeyLifetime,
    pub zsk: KeyLifetime,
    pub csk: KeyLifetime,
}

impl Default for DnssecPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            algorithm: ALG_ED25519,
            ksk: KeyLifetime::default(),
            zsk: KeyLifetime::default(),
            csk: KeyLifetime::default(),
        }
    }
}

impl DnssecPolicy {
    pub fn lifetime(&self, role: KeyRole) -> KeyLifetime {
        match role {
            KeyRole::Ksk => self.ksk,
            KeyRole::Zsk => self.zsk,
            KeyRole::Csk => self.csk,
        }
    }
}

enum SignerPair {
    Ed25519(Ed25519KeyPair),
    EcdsaP256(EcdsaKeyPair),
}

/// A private key ready to sign, with the identity fields RRSIGs carry.
pub struct SigningKey {
    pub signer: Name,
    pub algorithm: u8,
    pub key_tag: u16,
    pub public_key: Vec<u8>,
    pair: SignerPair,
}

impl SigningKey {
    /// Generate a fresh keypair; returns the key and its PKCS#8 blob
    /// for the key database.
    pub fn generate(signer: Name, algorithm: u8, flags: u16) -> Result<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();
        let pkcs8 = match algorithm {
            ALG_ED25519 => Ed25519KeyPair::generate_pkcs8(&rng)
                .map_err(|_| TdnsError::SigningFailed("keygen failed".to_string()))?
                .as_ref()
                .to_vec(),
            ALG_ECDSA_P256 => EcdsaKeyPair::generate_pkcs8(
                &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING,
                &rng,
            )
            .map_err(|_| TdnsError::SigningFailed("keygen failed".to_string()))?
            .as_ref()
            .to_vec(),
            other => return Err(TdnsError::UnsupportedAlgorithm(other)),
        };
        let key = Self::from_pkcs8(signer, algorithm, flags, &pkcs8)?;
        Ok((key, pkcs8))
    }

    /// Reconstruct a signer from a stored PKCS#8 blob.
    pub fn from_pkcs8(signer: Name, algorithm: u8, flags: u16, pkcs8: &[u8]) -> Result<Self> {
        let (pair, public_key) = match algorithm {
            ALG_ED25519 => {
                let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
                    .map_err(|_| TdnsError::SigningFailed("bad PKCS#8 blob".to_string()))?;
                let public = pair.public_key().as_ref().to_vec();
                (SignerPair::Ed25519(pair), public)
            }
            ALG_ECDSA_P256 => {
                let rng = SystemRandom::new();
                let pair = EcdsaKeyPair::from_pkcs8(
                    &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING,
                    pkcs8,
                    &rng,
                )
                .map_err(|_| TdnsError::SigningFailed("bad PKCS#8 blob".to_string()))?;
                // DNSKEY rdata carries the raw point without the SEC1 prefix
                let public = pair.public_key().as_ref()[1..].to_vec();
                (SignerPair::EcdsaP256(pair), public)
            }
            other => return Err(TdnsError::UnsupportedAlgorithm(other)),
        };
        let tag = key_tag(flags, 3, algorithm, &public_key);
        Ok(Self {
            signer,
            algorithm,
            key_tag: tag,
            public_key,
            pair,
        })
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match &self.pair {
            SignerPair::Ed25519(pair) => Ok(pair.sign(data).as_ref().to_vec()),
            SignerPair::EcdsaP256(pair) => {
                let rng = SystemRandom::new();
                pair.sign(&rng, data)
                    .map(|sig| sig.as_ref().to_vec())
                    .map_err(|_| TdnsError::SigningFailed("ECDSA sign failed".to_string()))
            }
        }
    }
}

/// Canonical RRset wire form as RRSIG signatures cover it: owner
/// lowercased, records ordered by rdata.
fn canonical_rrset(owner: &Name, rtype: RrType, ttl: u32, records: &[Record]) -> Vec<u8> {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| a.rdata.cmp(&b.rdata));

    let owner_lc = owner.to_lowercase();
    let mut out = Vec::new();
    for rr in sorted {
        owner_lc.to_wire(&mut out);
        out.extend_from_slice(&u16::from(rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(RrClass::In).to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&(rr.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rr.rdata);
    }
    out
}

/// Produce one RRSIG over an RRset.
pub fn sign_rrset(
    key: &SigningKey,
    owner: &Name,
    rtype: RrType,
    records: &[Record],
    validity_secs: u64,
) -> Result<Record> {
    let ttl = records.first().map(|rr| rr.ttl).unwrap_or(0);
    let now = Utc::now().timestamp();
    let mut rdata = SigRdata {
        type_covered: u16::from(rtype),
        algorithm: key.algorithm,
        labels: owner.label_count() as u8,
        original_ttl: ttl,
        expiration: (now + validity_secs as i64) as u32,
        inception: (now - INCEPTION_SKEW_SECS) as u32,
        key_tag: key.key_tag,
        signer_name: key.signer.clone(),
        signature: Vec::new(),
    };

    let mut data = rdata.to_wire_unsigned();
    data.extend_from_slice(&canonical_rrset(owner, rtype, ttl, records));
    rdata.signature = key.sign(&data)?;

    Ok(Record::new(
        owner.clone(),
        RrType::Rrsig,
        RrClass::In,
        ttl,
        rdata.to_wire(),
    ))
}

/// Does the RRset need fresh signatures? True when none exist or any
/// expires inside the window.
pub fn needs_resign(signatures: &[Record], window_secs: u64) -> bool {
    if signatures.is_empty() {
        return true;
    }
    let deadline = Utc::now().timestamp() + window_secs as i64;
    signatures.iter().any(|sig| match sig.sig() {
        Ok(rdata) => (rdata.expiration as i64) < deadline,
        Err(_) => true,
    })
}

/// Re-sign every RRset in the zone whose signature is missing or
/// expiring. Returns how many RRsets were signed.
pub fn sign_zone(zone: &ZoneState, key: &SigningKey, validity_secs: u64) -> Result<usize> {
    let window = (validity_secs / 4).max(3600);
    let mut signed = 0;

    for (owner, rtype, rrset) in zone.rrset_snapshot() {
        if rtype == RrType::Rrsig {
            continue;
        }
        // Delegation NS sets are not signed by the parent
        if rtype == RrType::Ns && owner != zone.name {
            continue;
        }
        if !needs_resign(&rrset.signatures, window) {
            continue;
        }
        match sign_rrset(key, &owner, rtype, &rrset.records, validity_secs) {
            Ok(sig) => {
                zone.set_signatures(&owner, rtype, vec![sig]);
                signed += 1;
            }
            Err(e) => {
                warn!(zone = %zone.name, owner = %owner, rtype = %rtype, error = %e,
                      "failed to sign RRset");
                return Err(e);
            }
        }
    }
    if signed > 0 {
        debug!(zone = %zone.name, signed, "zone re-signed");
    }
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::zone::testutil::sample_zone;

    fn test_key() -> SigningKey {
        SigningKey::generate(Name::parse("example.com.").unwrap(), ALG_ED25519, 257)
            .unwrap()
            .0
    }

    #[test]
    fn test_lifetime_words() {
        assert_eq!(KeyLifetime::parse_word("forever"), Some(LIFETIME_FOREVER));
        assert_eq!(KeyLifetime::parse_word("none"), Some(0));
        assert_eq!(KeyLifetime::parse_word("86400"), Some(86400));
        assert_eq!(KeyLifetime::parse_word("soon"), None);
    }

    #[test]
    fn test_keygen_roundtrip() {
        let signer = Name::parse("example.com.").unwrap();
        let (key, pkcs8) = SigningKey::generate(signer.clone(), ALG_ED25519, 257).unwrap();
        let restored = SigningKey::from_pkcs8(signer, ALG_ED25519, 257, &pkcs8).unwrap();
        assert_eq!(key.key_tag, restored.key_tag);
        assert_eq!(key.public_key, restored.public_key);
    }

    #[test]
    fn test_sign_rrset_shape() {
        let key = test_key();
        let zone = sample_zone("example.com.");
        let owner = Name::parse("www.example.com.").unwrap();
        let rrset = zone.rrset(&owner, RrType::A).unwrap();

        let sig = sign_rrset(&key, &owner, RrType::A, &rrset.records, 86400).unwrap();
        assert_eq!(sig.rtype, RrType::Rrsig);
        let rdata = sig.sig().unwrap();
        assert_eq!(rdata.type_covered, u16::from(RrType::A));
        assert_eq!(rdata.key_tag, key.key_tag);
        assert!(rdata.expiration > rdata.inception);
        assert_eq!(rdata.labels, 3);
    }

    #[test]
    fn test_needs_resign() {
        let key = test_key();
        let zone = sample_zone("example.com.");
        let owner = Name::parse("www.example.com.").unwrap();
        let rrset = zone.rrset(&owner, RrType::A).unwrap();

        assert!(needs_resign(&[], 3600));
        let fresh = sign_rrset(&key, &owner, RrType::A, &rrset.records, 14 * 86400).unwrap();
        assert!(!needs_resign(std::slice::from_ref(&fresh), 3600));
        // A window wider than the validity forces a re-sign
        assert!(needs_resign(&[fresh], 30 * 86400));
    }

    #[test]
    fn test_sign_zone_covers_rrsets() {
        let key = test_key();
        let zone = sample_zone("example.com.");
        let signed = sign_zone(&zone, &key, 86400).unwrap();
        // SOA + apex NS + www A + www TXT
        assert_eq!(signed, 4);

        let www = Name::parse("www.example.com.").unwrap();
        let rrset = zone.rrset(&www, RrType::A).unwrap();
        assert_eq!(rrset.signatures.len(), 1);

        // A second pass finds everything fresh
        assert_eq!(sign_zone(&zone, &key, 86400).unwrap(), 0);
    }
}
