//! Wire-level enumerations: record types, classes, opcodes, response codes.

/// DNS resource record types used by the server. Types we do not
/// interpret still round-trip through `Unknown`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RrType {
    #[default]
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
    Ds,
    Dnskey,
    Rrsig,
    Nsec,
    Opt,
    Sig,
    Key,
    Cds,
    Cdnskey,
    Csync,
    Svcb,
    Https,
    Axfr,
    Ixfr,
    Any,
    Unknown(u16),
}

impl From<u16> for RrType {
    fn from(value: u16) -> Self {
        match value {
            1 => RrType::A,
            2 => RrType::Ns,
            5 => RrType::Cname,
            6 => RrType::Soa,
            12 => RrType::Ptr,
            15 => RrType::Mx,
            16 => RrType::Txt,
            24 => RrType::Sig,
            25 => RrType::Key,
            28 => RrType::Aaaa,
            33 => RrType::Srv,
            41 => RrType::Opt,
            43 => RrType::Ds,
            46 => RrType::Rrsig,
            47 => RrType::Nsec,
            48 => RrType::Dnskey,
            59 => RrType::Cds,
            60 => RrType::Cdnskey,
            62 => RrType::Csync,
            64 => RrType::Svcb,
            65 => RrType::Https,
            251 => RrType::Ixfr,
            252 => RrType::Axfr,
            255 => RrType::Any,
            other => RrType::Unknown(other),
        }
    }
}

impl From<RrType> for u16 {
    fn from(rtype: RrType) -> Self {
        match rtype {
            RrType::A => 1,
            RrType::Ns => 2,
            RrType::Cname => 5,
            RrType::Soa => 6,
            RrType::Ptr => 12,
            RrType::Mx => 15,
            RrType::Txt => 16,
            RrType::Sig => 24,
            RrType::Key => 25,
            RrType::Aaaa => 28,
            RrType::Srv => 33,
            RrType::Opt => 41,
            RrType::Ds => 43,
            RrType::Rrsig => 46,
            RrType::Nsec => 47,
            RrType::Dnskey => 48,
            RrType::Cds => 59,
            RrType::Cdnskey => 60,
            RrType::Csync => 62,
            RrType::Svcb => 64,
            RrType::Https => 65,
            RrType::Ixfr => 251,
            RrType::Axfr => 252,
            RrType::Any => 255,
            RrType::Unknown(other) => other,
        }
    }
}

impl RrType {
    /// Parse the presentation-format mnemonic used in zone files and
    /// update-policy rrtype lists.
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Some(RrType::A),
            "NS" => Some(RrType::Ns),
            "CNAME" => Some(RrType::Cname),
            "SOA" => Some(RrType::Soa),
            "PTR" => Some(RrType::Ptr),
            "MX" => Some(RrType::Mx),
            "TXT" => Some(RrType::Txt),
            "AAAA" => Some(RrType::Aaaa),
            "SRV" => Some(RrType::Srv),
            "DS" => Some(RrType::Ds),
            "DNSKEY" => Some(RrType::Dnskey),
            "RRSIG" => Some(RrType::Rrsig),
            "NSEC" => Some(RrType::Nsec),
            "SIG" => Some(RrType::Sig),
            "KEY" => Some(RrType::Key),
            "CDS" => Some(RrType::Cds),
            "CDNSKEY" => Some(RrType::Cdnskey),
            "CSYNC" => Some(RrType::Csync),
            "SVCB" => Some(RrType::Svcb),
            "HTTPS" => Some(RrType::Https),
            "ANY" => Some(RrType::Any),
            _ => None,
        }
    }
}

impl std::fmt::Display for RrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RrType::A => write!(f, "A"),
            RrType::Ns => write!(f, "NS"),
            RrType::Cname => write!(f, "CNAME"),
            RrType::Soa => write!(f, "SOA"),
            RrType::Ptr => write!(f, "PTR"),
            RrType::Mx => write!(f, "MX"),
            RrType::Txt => write!(f, "TXT"),
            RrType::Aaaa => write!(f, "AAAA"),
            RrType::Srv => write!(f, "SRV"),
            RrType::Ds => write!(f, "DS"),
            RrType::Dnskey => write!(f, "DNSKEY"),
            RrType::Rrsig => write!(f, "RRSIG"),
            RrType::Nsec => write!(f, "NSEC"),
            RrType::Opt => write!(f, "OPT"),
            RrType::Sig => write!(f, "SIG"),
            RrType::Key => write!(f, "KEY"),
            RrType::Cds => write!(f, "CDS"),
            RrType::Cdnskey => write!(f, "CDNSKEY"),
            RrType::Csync => write!(f, "CSYNC"),
            RrType::Svcb => write!(f, "SVCB"),
            RrType::Https => write!(f, "HTTPS"),
            RrType::Axfr => write!(f, "AXFR"),
            RrType::Ixfr => write!(f, "IXFR"),
            RrType::Any => write!(f, "ANY"),
            RrType::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// DNS classes. NONE and ANY carry UPDATE semantics (delete specific
/// RR / delete RRset) in the Update Section.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RrClass {
    #[default]
    In,
    Chaos,
    None,
    Any,
    Unknown(u16),
}

impl From<u16> for RrClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RrClass::In,
            3 => RrClass::Chaos,
            254 => RrClass::None,
            255 => RrClass::Any,
            other => RrClass::Unknown(other),
        }
    }
}

impl From<RrClass> for u16 {
    fn from(class: RrClass) -> Self {
        match class {
            RrClass::In => 1,
            RrClass::Chaos => 3,
            RrClass::None => 254,
            RrClass::Any => 255,
            RrClass::Unknown(other) => other,
        }
    }
}

/// DNS opcodes the router dispatches on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Query = 0,
    IQuery = 1,
    Status = 2,
    Notify = 4,
    Update = 5,
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Query),
            1 => Some(Opcode::IQuery),
            2 => Some(Opcode::Status),
            4 => Some(Opcode::Notify),
            5 => Some(Opcode::Update),
            _ => None,
        }
    }
}

/// DNS response codes, including the UPDATE-specific ones.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rcode {
    #[default]
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    NotImp = 4,
    Refused = 5,
    YxDomain = 6,
    YxRrset = 7,
    NxRrset = 8,
    NotAuth = 9,
    NotZone = 10,
}

impl Rcode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            6 => Rcode::YxDomain,
            7 => Rcode::YxRrset,
            8 => Rcode::NxRrset,
            9 => Rcode::NotAuth,
            10 => Rcode::NotZone,
            _ => Rcode::ServFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrtype_roundtrip() {
        for value in [1u16, 6, 24, 25, 46, 48, 62, 64, 252, 255] {
            let rtype = RrType::from(value);
            assert_eq!(u16::from(rtype), value);
        }
        // Unknown types survive a round trip
        assert_eq!(u16::from(RrType::from(4711)), 4711);
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(RrType::from_mnemonic("a"), Some(RrType::A));
        assert_eq!(RrType::from_mnemonic("KEY"), Some(RrType::Key));
        assert_eq!(RrType::from_mnemonic("bogus"), None);
    }

    #[test]
    fn test_opcode() {
        assert_eq!(Opcode::from_u8(5), Some(Opcode::Update));
        assert_eq!(Opcode::from_u8(4), Some(Opcode::Notify));
        assert_eq!(Opcode::from_u8(9), None);
        assert_eq!(Opcode::Update.to_u8(), 5);
    }

    #[test]
    fn test_rcode() {
        assert_eq!(Rcode::from_u8(5), Rcode::Refused);
        assert_eq!(Rcode::NotAuth.to_u8(), 9);
    }
}
