//! EDNS(0) OPT pseudo-record handling.
//!
//! Beyond the standard DO flag the server honours the Extended DNS
//! Error option and two private OTS codepoints carrying the reporting
//! preference, plus the Report option used by the notify reporter.

use crate::error::{Result, TdnsError};

/// EDNS option code for Extended DNS Errors (RFC 8914).
pub const OPT_CODE_EDE: u16 = 15;
/// Private codepoint: OTS reporting opt-in.
pub const OPT_CODE_OTS_IN: u16 = 65312;
/// Private codepoint: OTS reporting opt-out.
pub const OPT_CODE_OTS_OUT: u16 = 65313;
/// Private codepoint: Report payload for the notify reporter.
pub const OPT_CODE_REPORT: u16 = 65314;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdnsOpt {
    pub udp_payload_size: u16,
    pub extended_rcode: u8,
    pub version: u8,
    pub flags: u16,
    pub options: Vec<EdnsOption>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// The OTS reporting preference carried in a private codepoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtsMode {
    OptIn,
    OptOut,
}

/// The decoded per-message view the router hands downstream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EdnsView {
    pub dnssec_ok: bool,
    pub ots: Option<OtsMode>,
    pub report: Option<Vec<u8>>,
}

impl EdnsOpt {
    pub fn new() -> Self {
        Self {
            udp_payload_size: 4096,
            extended_rcode: 0,
            version: 0,
            flags: 0,
            options: Vec::new(),
        }
    }

    pub fn do_flag(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn set_do_flag(&mut self, value: bool) {
        if value {
            self.flags |= 0x8000;
        } else {
            self.flags &= !0x8000;
        }
    }

    pub fn add_option(&mut self, code: u16, data: Vec<u8>) {
        self.options.push(EdnsOption { code, data });
    }

    pub fn find_option(&self, code: u16) -> Option<&EdnsOption> {
        self.options.iter().find(|opt| opt.code == code)
    }

    /// Append an EDE option with the given info-code and text.
    pub fn add_ede(&mut self, info_code: u16, text: &str) {
        let mut data = Vec::with_capacity(2 + text.len());
        data.extend_from_slice(&info_code.to_be_bytes());
        data.extend_from_slice(text.as_bytes());
        self.add_option(OPT_CODE_EDE, data);
    }

    /// The OPT record is carried as (class, ttl, rdata) in the
    /// additional section: class holds the payload size, ttl packs
    /// extended rcode, version and flags.
    pub fn from_resource(class: u16, ttl: u32, rdata: &[u8]) -> Result<Self> {
        let mut options = Vec::new();
        let mut pos = 0;
        while pos + 4 <= rdata.len() {
            let code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
            let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
            pos += 4;
            let data = rdata
                .get(pos..pos + len)
                .ok_or(TdnsError::InvalidRecordSection)?
                .to_vec();
            pos += len;
            options.push(EdnsOption { code, data });
        }
        Ok(Self {
            udp_payload_size: class,
            extended_rcode: ((ttl >> 24) & 0xFF) as u8,
            version: ((ttl >> 16) & 0xFF) as u8,
            flags: (ttl & 0xFFFF) as u16,
            options,
        })
    }

    pub fn to_resource(&self) -> (u16, u32, Vec<u8>) {
        let ttl = ((self.extended_rcode as u32) << 24)
            | ((self.version as u32) << 16)
            | (self.flags as u32);
        let mut rdata = Vec::new();
        for option in &self.options {
            rdata.extend_from_slice(&option.code.to_be_bytes());
            rdata.extend_from_slice(&(option.data.len() as u16).to_be_bytes());
            rdata.extend_from_slice(&option.data);
        }
        (self.udp_payload_size, ttl, rdata)
    }

    /// Decode the options the router cares about.
    pub fn view(&self) -> EdnsView {
        let ots = if self.find_option(OPT_CODE_OTS_IN).is_some() {
            Some(OtsMode::OptIn)
        } else if self.find_option(OPT_CODE_OTS_OUT).is_some() {
            Some(OtsMode::OptOut)
        } else {
            None
        };
        EdnsView {
            dnssec_ok: self.do_flag(),
            ots,
            report: self
                .find_option(OPT_CODE_REPORT)
                .map(|opt| opt.data.clone()),
        }
    }
}
