//! Resource records and the typed rdata the server interprets.
//!
//! Rdata is carried as wire bytes; SOA, SIG/RRSIG, KEY/DNSKEY and SVCB
//! get typed views because the refresh engine, the update pipeline and
//! the signer have to look inside them.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::error::{Result, TdnsError};

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub name: Name,
    pub rtype: RrType,
    pub class: RrClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    pub fn new(name: Name, rtype: RrType, class: RrClass, ttl: u32, rdata: Vec<u8>) -> Self {
        Self {
            name,
            rtype,
            class,
            ttl,
            rdata,
        }
    }

    pub fn from_wire(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let name = Name::from_wire(buf, pos)?;
        let fixed = buf
            .get(*pos..*pos + 10)
            .ok_or(TdnsError::InvalidRecordSection)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]).into();
        let class = u16::from_be_bytes([fixed[2], fixed[3]]).into();
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        *pos += 10;
        let rdata = buf
            .get(*pos..*pos + rdlength)
            .ok_or(TdnsError::InvalidRecordSection)?
            .to_vec();
        *pos += rdlength;
        Ok(Self {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }

    pub fn to_wire(&self, out: &mut Vec<u8>) {
        self.name.to_wire(out);
        out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.class).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&(self.rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.rdata);
    }

    pub fn soa(&self) -> Result<SoaRdata> {
        SoaRdata::from_wire(&self.rdata)
    }

    pub fn sig(&self) -> Result<SigRdata> {
        SigRdata::from_wire(&self.rdata)
    }

    pub fn key(&self) -> Result<KeyRdata> {
        KeyRdata::from_wire(&self.rdata)
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:?} {} ({} octets)",
            self.name,
            self.ttl,
            self.class,
            self.rtype,
            self.rdata.len()
        )
    }
}

/// SOA rdata. The refresh engine reads REFRESH and SERIAL; serial
/// bumping rewrites SERIAL in place.
#[derive(Clone, Debug, PartialEq)]
pub struct SoaRdata {
    pub mname: Name,
    pub rname: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl SoaRdata {
    pub fn from_wire(rdata: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let mname = Name::from_wire(rdata, &mut pos)?;
        let rname = Name::from_wire(rdata, &mut pos)?;
        let rest = rdata
            .get(pos..pos + 20)
            .ok_or(TdnsError::InvalidRecordSection)?;
        let word = |i: usize| u32::from_be_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
        Ok(Self {
            mname,
            rname,
            serial: word(0),
            refresh: word(4),
            retry: word(8),
            expire: word(12),
            minimum: word(16),
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.mname.wire_len() + self.rname.wire_len() + 20);
        self.mname.to_wire(&mut out);
        self.rname.to_wire(&mut out);
        out.extend_from_slice(&self.serial.to_be_bytes());
        out.extend_from_slice(&self.refresh.to_be_bytes());
        out.extend_from_slice(&self.retry.to_be_bytes());
        out.extend_from_slice(&self.expire.to_be_bytes());
        out.extend_from_slice(&self.minimum.to_be_bytes());
        out
    }
}

/// SIG and RRSIG share this rdata layout. For SIG(0) the type covered
/// is zero and the owner of the record is the root.
#[derive(Clone, Debug, PartialEq)]
pub struct SigRdata {
    pub type_covered: u16,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer_name: Name,
    pub signature: Vec<u8>,
}

impl SigRdata {
    pub fn from_wire(rdata: &[u8]) -> Result<Self> {
        let fixed = rdata.get(..18).ok_or(TdnsError::InvalidRecordSection)?;
        let mut pos = 18;
        let signer_name = Name::from_wire(rdata, &mut pos)?;
        let signature = rdata
            .get(pos..)
            .ok_or(TdnsError::InvalidRecordSection)?
            .to_vec();
        Ok(Self {
            type_covered: u16::from_be_bytes([fixed[0], fixed[1]]),
            algorithm: fixed[2],
            labels: fixed[3],
            original_ttl: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            expiration: u32::from_be_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]),
            inception: u32::from_be_bytes([fixed[12], fixed[13], fixed[14], fixed[15]]),
            key_tag: u16::from_be_bytes([fixed[16], fixed[17]]),
            signer_name,
            signature,
        })
    }

    /// The rdata with the signature field left off. This prefix is the
    /// first part of the data a SIG(0) or RRSIG signature covers.
    pub fn to_wire_unsigned(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.signer_name.wire_len());
        out.extend_from_slice(&self.type_covered.to_be_bytes());
        out.push(self.algorithm);
        out.push(self.labels);
        out.extend_from_slice(&self.original_ttl.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.inception.to_be_bytes());
        out.extend_from_slice(&self.key_tag.to_be_bytes());
        self.signer_name.to_wire(&mut out);
        out
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = self.to_wire_unsigned();
        out.extend_from_slice(&self.signature);
        out
    }
}

/// KEY and DNSKEY share this rdata layout.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRdata {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

impl KeyRdata {
    pub fn from_wire(rdata: &[u8]) -> Result<Self> {
        let fixed = rdata.get(..4).ok_or(TdnsError::InvalidRecordSection)?;
        Ok(Self {
            flags: u16::from_be_bytes([fixed[0], fixed[1]]),
            protocol: fixed[2],
            algorithm: fixed[3],
            public_key: rdata[4..].to_vec(),
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.public_key.len());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.push(self.protocol);
        out.push(self.algorithm);
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn key_tag(&self) -> u16 {
        key_tag(self.flags, self.protocol, self.algorithm, &self.public_key)
    }
}

/// Minimal SVCB rdata: priority, target, and an alpn parameter. This
/// is all the transport-signal post-pass publishes.
#[derive(Clone, Debug, PartialEq)]
pub struct SvcbRdata {
    pub priority: u16,
    pub target: Name,
    pub alpn: Vec<String>,
}

impl SvcbRdata {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.priority.to_be_bytes());
        self.target.to_wire(&mut out);
        if !self.alpn.is_empty() {
            // SvcParamKey alpn = 1
            let mut value = Vec::new();
            for proto in &self.alpn {
                value.push(proto.len() as u8);
                value.extend_from_slice(proto.as_bytes());
            }
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(&value);
        }
        out
    }
}

/// Encode presentation strings into TXT rdata (one character-string
/// per chunk of 255 octets).
pub fn txt_rdata(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    for chunk in text.as_bytes().chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    if text.is_empty() {
        out.push(0);
    }
    out
}

/// RFC 4034 appendix B key tag over KEY/DNSKEY rdata.
pub fn key_tag(flags: u16, protocol: u8, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(protocol);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    let mut accumulator: u32 = 0;
    for (i, &byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            accumulator += u32::from(byte) << 8;
        } else {
            accumulator += u32::from(byte);
        }
    }
    accumulator += accumulator >> 16;
    (accumulator & 0xFFFF) as u16
}
