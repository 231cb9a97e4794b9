//! DNS message parse/serialize.
//!
//! The same structure carries queries, NOTIFY and UPDATE: for UPDATE
//! the question section is the Zone section, the answer section holds
//! prerequisites and the authority section holds the update records.
//! The parser deliberately accepts OPCODE=UPDATE messages, which some
//! stacks reject for lacking a plain question.

use crate::dns::edns::EdnsOpt;
use crate::dns::enums::{Opcode, Rcode, RrClass, RrType};
use crate::dns::header::{HEADER_LEN, Header};
use crate::dns::name::Name;
use crate::dns::question::Question;
use crate::dns::record::Record;
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
    pub edns: Option<EdnsOpt>,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = Header::from_wire(buf)?;
        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            questions.push(Question::from_wire(buf, &mut pos)?);
        }

        let mut read_section = |count: u16| -> Result<Vec<Record>> {
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                records.push(Record::from_wire(buf, &mut pos)?);
            }
            Ok(records)
        };

        let answers = read_section(header.ancount)?;
        let authorities = read_section(header.nscount)?;
        let mut additionals = read_section(header.arcount)?;

        // Lift the OPT pseudo-record out of the additional section
        let mut edns = None;
        if let Some(idx) = additionals.iter().position(|rr| rr.rtype == RrType::Opt) {
            let opt = additionals.remove(idx);
            edns = Some(EdnsOpt::from_resource(
                u16::from(opt.class),
                opt.ttl,
                &opt.rdata,
            )?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
            edns,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16 + self.edns.is_some() as u16;
        header.to_wire(&mut out)?;

        for q in &self.questions {
            q.to_wire(&mut out);
        }
        for rr in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            rr.to_wire(&mut out);
        }
        if let Some(edns) = &self.edns {
            let (class, ttl, rdata) = edns.to_resource();
            let opt = Record::new(Name::root(), RrType::Opt, RrClass::from(class), ttl, rdata);
            opt.to_wire(&mut out);
        }
        Ok(out)
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.header.opcode)
    }

    pub fn rcode(&self) -> Rcode {
        Rcode::from_u8(self.header.rcode)
    }

    /// The Zone section entry of an UPDATE (or the question of a query).
    pub fn zone(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// UPDATE prerequisite records.
    pub fn prerequisites(&self) -> &[Record] {
        &self.answers
    }

    /// UPDATE update-section records.
    pub fn updates(&self) -> &[Record] {
        &self.authorities
    }

    /// How large a UDP response the requestor can take.
    pub fn max_udp_payload_size(&self) -> u16 {
        self.edns
            .as_ref()
            .map(|e| e.udp_payload_size.max(512))
            .unwrap_or(512)
    }

    /// Build a response skeleton echoing id, opcode and question.
    pub fn response(&self) -> Message {
        Message {
            header: Header {
                id: self.header.id,
                qr: true,
                opcode: self.header.opcode,
                aa: false,
                tc: false,
                rd: self.header.rd,
                ra: false,
                z: 0,
                rcode: Rcode::NoError.to_u8(),
                ..Header::default()
            },
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            edns: None,
        }
    }

    pub fn with_rcode(mut self, rcode: Rcode) -> Message {
        self.header.rcode = rcode.to_u8();
        self
    }

    /// The OPT record, created on demand so an EDE can always attach.
    pub fn ensure_edns(&mut self) -> &mut EdnsOpt {
        self.edns.get_or_insert_with(EdnsOpt::new)
    }
}
