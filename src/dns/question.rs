//! Question (and UPDATE Zone) section entries.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::error::{Result, TdnsError};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Question {
    pub qname: Name,
    pub qtype: RrType,
    pub qclass: RrClass,
}

impl Question {
    pub fn new(qname: Name, qtype: RrType, qclass: RrClass) -> Self {
        Self {
            qname,
            qtype,
            qclass,
        }
    }

    pub fn from_wire(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let qname = Name::from_wire(buf, pos)?;
        let rest = buf
            .get(*pos..*pos + 4)
            .ok_or(TdnsError::InvalidQuestionSection)?;
        let qtype = u16::from_be_bytes([rest[0], rest[1]]).into();
        let qclass = u16::from_be_bytes([rest[2], rest[3]]).into();
        *pos += 4;
        Ok(Self {
            qname,
            qtype,
            qclass,
        })
    }

    pub fn to_wire(&self, out: &mut Vec<u8>) {
        self.qname.to_wire(out);
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
    }
}
