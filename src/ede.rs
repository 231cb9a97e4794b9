//! Error-response catalog: internal failure kinds mapped to an RCODE,
//! an Extended DNS Error in the private-use range and operator text.

use crate::dns::{Message, Rcode};
use crate::error::ErrorKind;

/// Standard EDE code for "Not Ready" (RFC 8914).
pub const EDE_NOT_READY: u16 = 14;

/// Private-use EDE codes (>= 512).
pub const EDE_SIG0_KEY_NOT_KNOWN: u16 = 513;
pub const EDE_SIG0_KEY_NOT_TRUSTED: u16 = 514;
pub const EDE_DELEGATION_SYNC_UNSUPPORTED: u16 = 515;
pub const EDE_ZONE_FROZEN: u16 = 516;
pub const EDE_ZONE_NOT_FOUND: u16 = 517;
pub const EDE_UPDATES_NOT_ALLOWED: u16 = 518;

/// The failure kinds per-message handling can surface.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseError {
    ZoneNotFound,
    ZoneFrozen,
    UpdatesNotAllowed,
    Sig0KeyNotKnown,
    Sig0KeyNotTrusted,
    DelegationSyncUnsupported,
    /// Zone known but never successfully refreshed.
    NotReady,
    /// Zone in an error state of the given kind.
    ZoneError(ErrorKind),
    PolicyRefused(String),
}

/// What goes on the wire for a failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub rcode: Rcode,
    pub ede_code: Option<u16>,
    pub text: String,
}

impl ResponseError {
    pub fn response(&self) -> ErrorResponse {
        match self {
            ResponseError::ZoneNotFound => ErrorResponse {
                rcode: Rcode::Refused,
                ede_code: Some(EDE_ZONE_NOT_FOUND),
                text: "zone not found".to_string(),
            },
            ResponseError::ZoneFrozen => ErrorResponse {
                rcode: Rcode::Refused,
                ede_code: Some(EDE_ZONE_FROZEN),
                text: "zone is frozen; updates not possible".to_string(),
            },
            ResponseError::UpdatesNotAllowed => ErrorResponse {
                rcode: Rcode::Refused,
                ede_code: Some(EDE_UPDATES_NOT_ALLOWED),
                text: "zone does not allow UPDATE".to_string(),
            },
            ResponseError::Sig0KeyNotKnown => ErrorResponse {
                rcode: Rcode::NotAuth,
                ede_code: Some(EDE_SIG0_KEY_NOT_KNOWN),
                text: "SIG(0) key not known".to_string(),
            },
            ResponseError::Sig0KeyNotTrusted => ErrorResponse {
                rcode: Rcode::NotAuth,
                ede_code: Some(EDE_SIG0_KEY_NOT_TRUSTED),
                text: "SIG(0) key known but not trusted".to_string(),
            },
            ResponseError::DelegationSyncUnsupported => ErrorResponse {
                rcode: Rcode::Refused,
                ede_code: Some(EDE_DELEGATION_SYNC_UNSUPPORTED),
                text: "delegation sync via UPDATE not supported".to_string(),
            },
            ResponseError::NotReady => ErrorResponse {
                rcode: Rcode::ServFail,
                ede_code: Some(EDE_NOT_READY),
                text: "zone not ready".to_string(),
            },
            ResponseError::ZoneError(kind) => ErrorResponse {
                rcode: Rcode::ServFail,
                ede_code: Some(EDE_NOT_READY),
                text: format!("zone in error state: {}", kind),
            },
            ResponseError::PolicyRefused(msg) => ErrorResponse {
                rcode: Rcode::Refused,
                ede_code: None,
                text: msg.clone(),
            },
        }
    }

    /// Apply the catalog entry to a response message. An OPT record is
    /// created when none is present so the EDE always fits.
    pub fn apply(&self, msg: &mut Message) {
        let entry = self.response();
        msg.header.rcode = entry.rcode.to_u8();
        if let Some(code) = entry.ede_code {
            msg.ensure_edns().add_ede(code, &entry.text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::edns::OPT_CODE_EDE;

    #[test]
    fn test_catalog_codes() {
        assert_eq!(
            ResponseError::ZoneFrozen.response().ede_code,
            Some(EDE_ZONE_FROZEN)
        );
        assert_eq!(ResponseError::ZoneFrozen.response().rcode, Rcode::Refused);
        assert_eq!(
            ResponseError::Sig0KeyNotKnown.response().rcode,
            Rcode::NotAuth
        );
        assert_eq!(
            ResponseError::Sig0KeyNotTrusted.response().ede_code,
            Some(EDE_SIG0_KEY_NOT_TRUSTED)
        );
    }

    #[test]
    fn test_apply_creates_opt() {
        let mut msg = Message::default();
        assert!(msg.edns.is_none());
        ResponseError::ZoneNotFound.apply(&mut msg);
        assert_eq!(msg.rcode(), Rcode::Refused);
        let opt = msg.edns.expect("OPT created");
        let ede = opt.find_option(OPT_CODE_EDE).unwrap();
        assert_eq!(u16::from_be_bytes([ede.data[0], ede.data[1]]), 517);
    }
}
