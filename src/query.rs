//! Query responder dispatch.
//!
//! Finds the owning zone by longest-suffix match, applies the
//! error/freeze/un-refreshed gating, answers the CHAOS `*.server.`
//! identity queries, and otherwise hands off to the per-zone
//! responder.

use crate::dns::edns::EdnsView;
use crate::dns::enums::{Rcode, RrClass, RrType};
use crate::dns::packet::Message;
use crate::dns::record::{Record, txt_rdata};
use crate::ede::ResponseError;
use crate::error::ErrorKind;
use crate::zone::registry::ZoneRegistry;
use crate::zone::responder;
use crate::zone::zone::ZoneStoreKind;
use std::sync::Arc;
use tracing::debug;

/// Operator-configured answers for the CHAOS identity names.
#[derive(Clone, Debug, Default)]
pub struct ServerIdentity {
    pub id: Option<String>,
    pub version: Option<String>,
    pub authors: Option<String>,
    pub hostname: Option<String>,
}

pub const DEFAULT_IDENTITY: &str =
    "tdnsd - an authoritative name server for experiments and POCs";

impl ServerIdentity {
    fn answer_for(&self, qname_key: &str) -> Option<String> {
        match qname_key {
            "id.server." => Some(
                self.id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IDENTITY.to_string()),
            ),
            "version.server." => Some(
                self.version
                    .clone()
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            ),
            "authors.server." => self.authors.clone().or_else(|| Some("tdnsd".to_string())),
            "hostname.server." => Some(self.hostname.clone().unwrap_or_else(|| {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            })),
            _ => None,
        }
    }
}

pub struct QueryResponder {
    registry: Arc<ZoneRegistry>,
    identity: ServerIdentity,
    agent_mode: bool,
}

impl QueryResponder {
    pub fn new(registry: Arc<ZoneRegistry>, identity: ServerIdentity, agent_mode: bool) -> Self {
        Self {
            registry,
            identity,
            agent_mode,
        }
    }

    pub fn respond(&self, msg: &Message, edns: &EdnsView) -> Message {
        let Some(question) = msg.zone() else {
            return msg.response().with_rcode(Rcode::FormErr);
        };
        let qname = &question.qname;

        let Some(zone) = self.registry.find_zone(qname) else {
            if let Some(reply) = self.chaos_identity(msg) {
                return reply;
            }
            debug!(qname = %qname, "no owning zone, refusing");
            return msg.response().with_rcode(Rcode::Refused);
        };

        // Transfer-only zones have no in-process data; agents answer
        // nothing at all for data zones.
        if zone.store == ZoneStoreKind::Xfr || self.agent_mode {
            return msg.response().with_rcode(Rcode::Refused);
        }

        if let Some(error) = zone.error() {
            if error.kind != ErrorKind::Refresh {
                let mut response = msg.response();
                ResponseError::ZoneError(error.kind).apply(&mut response);
                return response;
            }
        }

        if zone.refresh_count() == 0 {
            let mut response = msg.response();
            ResponseError::NotReady.apply(&mut response);
            return response;
        }

        responder::respond(&zone, msg, edns.dnssec_ok)
    }

    /// The four identity names under the CHAOS pseudo-TLD `server.`.
    fn chaos_identity(&self, msg: &Message) -> Option<Message> {
        let question = msg.zone()?;
        if question.qclass != RrClass::Chaos {
            return None;
        }
        if !matches!(question.qtype, RrType::Txt | RrType::Any) {
            return None;
        }
        let text = self.identity.answer_for(&question.qname.key())?;

        let mut response = msg.response();
        response.header.aa = true;
        response.answers.push(Record::new(
            question.qname.clone(),
            RrType::Txt,
            RrClass::Chaos,
            0,
            txt_rdata(&text),
        ));
        Some(response)
    }
}

/// Answer in-process authoritative lookups for the other engines,
/// without a round-trip through the wire.
pub async fn run_auth_query_actor(
    registry: Arc<ZoneRegistry>,
    mut intake: tokio::sync::mpsc::Receiver<crate::comms::AuthQueryRequest>,
    shutdown: crate::comms::Shutdown,
) {
    use crate::zone::zone::Lookup;
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = intake.recv() => {
                let Some(request) = request else { break };
                let records = registry
                    .find_zone(&request.qname)
                    .map(|zone| match zone.lookup(&request.qname, request.qtype) {
                        Lookup::Answer(rrset) => rrset.records,
                        _ => Vec::new(),
                    })
                    .unwrap_or_default();
                let _ = request.respond.send(records);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::Opcode;
    use crate::dns::name::Name;
    use crate::dns::question::Question;
    use crate::zone::zone::testutil::sample_zone;
    use crate::zone::zone::{ZoneRole, ZoneState};

    fn responder_with(zone: Option<ZoneState>) -> QueryResponder {
        let registry = Arc::new(ZoneRegistry::new());
        if let Some(zone) = zone {
            registry.set(Arc::new(zone));
        }
        QueryResponder::new(registry, ServerIdentity::default(), false)
    }

    fn query(qname: &str, qtype: RrType, qclass: RrClass) -> Message {
        let mut msg = Message::default();
        msg.header.id = 11;
        msg.header.opcode = Opcode::Query.to_u8();
        msg.questions
            .push(Question::new(Name::parse(qname).unwrap(), qtype, qclass));
        msg
    }

    #[test]
    fn test_unknown_zone_refused() {
        let responder = responder_with(None);
        let response = responder.respond(
            &query("foo.unknown.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::Refused);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_chaos_identity_default() {
        let responder = responder_with(None);
        let response = responder.respond(
            &query("id.server.", RrType::Txt, RrClass::Chaos),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
        let rdata = &response.answers[0].rdata;
        assert_eq!(&rdata[1..], DEFAULT_IDENTITY.as_bytes());
    }

    #[test]
    fn test_chaos_wrong_class_refused() {
        let responder = responder_with(None);
        let response = responder.respond(
            &query("id.server.", RrType::Txt, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::Refused);
    }

    #[test]
    fn test_answer_from_zone() {
        let responder = responder_with(Some(sample_zone("example.com.")));
        let response = responder.respond(
            &query("www.example.com.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::NoError);
        assert!(response.header.aa);
        assert_eq!(response.answers.len(), 1);
    }

    #[test]
    fn test_unrefreshed_zone_servfail() {
        let zone = ZoneState::new(
            Name::parse("cold.example.").unwrap(),
            ZoneStoreKind::Map,
            ZoneRole::Secondary,
        );
        let responder = responder_with(Some(zone));
        let response = responder.respond(
            &query("www.cold.example.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::ServFail);
    }

    #[test]
    fn test_zone_error_state_servfail() {
        let zone = sample_zone("example.com.");
        zone.set_error(ErrorKind::Dnssec, "signing failed");
        let responder = responder_with(Some(zone));
        let response = responder.respond(
            &query("www.example.com.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::ServFail);
    }

    #[test]
    fn test_refresh_error_still_serves() {
        let zone = sample_zone("example.com.");
        zone.set_error(ErrorKind::Refresh, "upstream down");
        let responder = responder_with(Some(zone));
        let response = responder.respond(
            &query("www.example.com.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        // Last-good data keeps serving through refresh errors
        assert_eq!(response.rcode(), Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
    }

    #[test]
    fn test_xfr_store_refused() {
        let zone = ZoneState::new(
            Name::parse("xfr.example.").unwrap(),
            ZoneStoreKind::Xfr,
            ZoneRole::Secondary,
        );
        zone.mark_refreshed();
        let responder = responder_with(Some(zone));
        let response = responder.respond(
            &query("www.xfr.example.", RrType::A, RrClass::In),
            &EdnsView::default(),
        );
        assert_eq!(response.rcode(), Rcode::Refused);
    }
}
