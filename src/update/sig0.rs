//! SIG(0) transaction signatures (RFC 2931).
//!
//! A SIG(0) is a SIG record in the additional section with type
//! covered zero, signing the whole request with an asymmetric key.
//! The signed data is the SIG rdata with the signature field left off,
//! followed by the message as it looked before the SIG was appended.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::packet::Message;
use crate::dns::record::{KeyRdata, Record, SigRdata};
use crate::dnssec::{ALG_ECDSA_P256, ALG_ED25519, ALG_RSASHA256, SigningKey};
use crate::error::{Result, TdnsError};
use chrono::Utc;
use ring::signature::{
    ECDSA_P256_SHA256_FIXED, ED25519, RSA_PKCS1_2048_8192_SHA256, RsaPublicKeyComponents,
    UnparsedPublicKey,
};
use tracing::debug;

/// Clock slack accepted around a SIG(0) validity window.
const SIG0_VALIDITY_SECS: i64 = 300;

/// Pull the SIG(0) records out of the additional section.
pub fn extract_sigs(msg: &Message) -> Vec<(Record, SigRdata)> {
    msg.additionals
        .iter()
        .filter(|rr| rr.rtype == RrType::Sig)
        .filter_map(|rr| rr.sig().ok().map(|rdata| (rr.clone(), rdata)))
        .filter(|(_, rdata)| rdata.type_covered == 0)
        .collect()
}

/// The message bytes a SIG(0) covers: the request serialized without
/// any SIG record in the additional section.
fn message_without_sigs(msg: &Message) -> Result<Vec<u8>> {
    let mut stripped = msg.clone();
    stripped
        .additionals
        .retain(|rr| rr.rtype != RrType::Sig);
    stripped.serialize()
}

fn signed_data(msg: &Message, sig: &SigRdata) -> Result<Vec<u8>> {
    let mut data = sig.to_wire_unsigned();
    data.extend_from_slice(&message_without_sigs(msg)?);
    Ok(data)
}

/// Verify one SIG(0) against a public key. Checks the validity window
/// and the signature itself.
pub fn verify(msg: &Message, sig: &SigRdata, key: &KeyRdata) -> Result<()> {
    let now = Utc::now().timestamp();
    if (sig.inception as i64) - SIG0_VALIDITY_SECS > now {
        return Err(TdnsError::Sig0Verify("signature not yet valid".to_string()));
    }
    if (sig.expiration as i64) + SIG0_VALIDITY_SECS < now {
        return Err(TdnsError::Sig0Verify("signature expired".to_string()));
    }
    if sig.algorithm != key.algorithm {
        return Err(TdnsError::Sig0Verify(format!(
            "algorithm mismatch: SIG says {}, key is {}",
            sig.algorithm, key.algorithm
        )));
    }

    let data = signed_data(msg, sig)?;
    match key.algorithm {
        ALG_ED25519 => UnparsedPublicKey::new(&ED25519, &key.public_key)
            .verify(&data, &sig.signature)
            .map_err(|_| TdnsError::Sig0Verify("bad Ed25519 signature".to_string())),
        ALG_ECDSA_P256 => {
            // DNSKEY wire format strips the SEC1 point prefix
            let mut point = Vec::with_capacity(65);
            point.push(0x04);
            point.extend_from_slice(&key.public_key);
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &point)
                .verify(&data, &sig.signature)
                .map_err(|_| TdnsError::Sig0Verify("bad ECDSA signature".to_string()))
        }
        ALG_RSASHA256 => {
            let (e, n) = rsa_components(&key.public_key)?;
            RsaPublicKeyComponents { n, e }
                .verify(&RSA_PKCS1_2048_8192_SHA256, &data, &sig.signature)
                .map_err(|_| TdnsError::Sig0Verify("bad RSA signature".to_string()))
        }
        other => Err(TdnsError::UnsupportedAlgorithm(other)),
    }
}

/// Split a DNSKEY-format RSA public key into (exponent, modulus).
fn rsa_components(material: &[u8]) -> Result<(&[u8], &[u8])> {
    let first = *material
        .first()
        .ok_or_else(|| TdnsError::Sig0Verify("empty RSA key".to_string()))?;
    let (e_len, offset) = if first == 0 {
        let bytes = material
            .get(1..3)
            .ok_or_else(|| TdnsError::Sig0Verify("short RSA key".to_string()))?;
        (u16::from_be_bytes([bytes[0], bytes[1]]) as usize, 3)
    } else {
        (first as usize, 1)
    };
    let e = material
        .get(offset..offset + e_len)
        .ok_or_else(|| TdnsError::Sig0Verify("short RSA exponent".to_string()))?;
    let n = material
        .get(offset + e_len..)
        .ok_or_else(|| TdnsError::Sig0Verify("short RSA modulus".to_string()))?;
    Ok((e, n))
}

/// Append a SIG(0) over the message. Used by tests and by outbound
/// signed requests.
pub fn sign_message(msg: &mut Message, key: &SigningKey) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut rdata = SigRdata {
        type_covered: 0,
        algorithm: key.algorithm,
        labels: 0,
        original_ttl: 0,
        expiration: (now + SIG0_VALIDITY_SECS) as u32,
        inception: (now - SIG0_VALIDITY_SECS) as u32,
        key_tag: key.key_tag,
        signer_name: key.signer.clone(),
        signature: Vec::new(),
    };

    let mut data = rdata.to_wire_unsigned();
    data.extend_from_slice(&message_without_sigs(msg)?);
    rdata.signature = key.sign(&data)?;
    debug!(signer = %key.signer, key_tag = key.key_tag, "message signed with SIG(0)");

    msg.additionals.push(Record::new(
        Name::root(),
        RrType::Sig,
        RrClass::Any,
        0,
        rdata.to_wire(),
    ));
    Ok(())
}
