//! Authoritative response generation from one zone's data.

use crate::dns::enums::Rcode;
use crate::dns::packet::Message;
use crate::dns::record::Record;
use crate::zone::options::ZoneOption;
use crate::zone::zone::{Lookup, RrSet, ZoneState};
use tracing::debug;

/// Answer a query that has already been routed to its owning zone.
pub fn respond(zone: &ZoneState, query: &Message, dnssec_ok: bool) -> Message {
    let mut response = query.response();
    response.header.aa = true;
    if let Some(edns) = &query.edns {
        let mut opt = crate::dns::edns::EdnsOpt::new();
        opt.set_do_flag(edns.do_flag());
        response.edns = Some(opt);
    }

    let question = match query.zone() {
        Some(q) => q.clone(),
        None => {
            response.header.rcode = Rcode::FormErr.to_u8();
            return response;
        }
    };

    let qname = if zone.has_option(ZoneOption::FoldCase) {
        question.qname.to_lowercase()
    } else {
        question.qname.clone()
    };

    match zone.lookup(&qname, question.qtype) {
        Lookup::Answer(rrset) => {
            debug!(qname = %qname, qtype = %question.qtype, "authoritative answer");
            push_rrset(&mut response.answers, rrset, dnssec_ok, zone);
        }
        Lookup::NoData { soa } => {
            if let Some(soa) = soa {
                response.authorities.push(fold(zone, soa));
            }
        }
        Lookup::NxDomain { soa } => {
            response.header.rcode = Rcode::NxDomain.to_u8();
            if let Some(soa) = soa {
                response.authorities.push(fold(zone, soa));
            }
        }
        Lookup::Delegation { owner, ns } => {
            debug!(qname = %qname, cut = %owner, "referral below zone cut");
            response.header.aa = false;
            push_rrset(&mut response.authorities, ns, dnssec_ok, zone);
        }
    }
    response
}

fn push_rrset(section: &mut Vec<Record>, rrset: RrSet, dnssec_ok: bool, zone: &ZoneState) {
    for rr in rrset.records {
        section.push(fold(zone, rr));
    }
    if dnssec_ok {
        for sig in rrset.signatures {
            section.push(fold(zone, sig));
        }
    }
}

fn fold(zone: &ZoneState, mut rr: Record) -> Record {
    if zone.has_option(ZoneOption::FoldCase) {
        rr.name = rr.name.to_lowercase();
    }
    rr
}
