//! DNS message header wire codec.

use bitstream_io::{BE, BitRead, BitReader, BitWrite, BitWriter};

use crate::error::{Result, TdnsError};

pub const HEADER_LEN: usize = 12;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(TdnsError::InvalidHeader);
        }
        let mut reader = BitReader::<_, BE>::new(&buf[..HEADER_LEN]);
        let read = |r: &mut BitReader<&[u8], BE>| -> std::io::Result<Header> {
            Ok(Header {
                id: r.read_var::<u16>(16)?,
                qr: r.read_var::<u8>(1)? == 1,
                opcode: r.read_var::<u8>(4)?,
                aa: r.read_var::<u8>(1)? == 1,
                tc: r.read_var::<u8>(1)? == 1,
                rd: r.read_var::<u8>(1)? == 1,
                ra: r.read_var::<u8>(1)? == 1,
                z: r.read_var::<u8>(3)?,
                rcode: r.read_var::<u8>(4)?,
                qdcount: r.read_var::<u16>(16)?,
                ancount: r.read_var::<u16>(16)?,
                nscount: r.read_var::<u16>(16)?,
                arcount: r.read_var::<u16>(16)?,
            })
        };
        read(&mut reader).map_err(|_| TdnsError::InvalidHeader)
    }

    pub fn to_wire(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut writer = BitWriter::<_, BE>::new(out);
        let write = |w: &mut BitWriter<&mut Vec<u8>, BE>| -> std::io::Result<()> {
            w.write_var::<u16>(16, self.id)?;
            w.write_var::<u8>(1, self.qr as u8)?;
            w.write_var::<u8>(4, self.opcode)?;
            w.write_var::<u8>(1, self.aa as u8)?;
            w.write_var::<u8>(1, self.tc as u8)?;
            w.write_var::<u8>(1, self.rd as u8)?;
            w.write_var::<u8>(1, self.ra as u8)?;
            w.write_var::<u8>(3, self.z)?;
            w.write_var::<u8>(4, self.rcode)?;
            w.write_var::<u16>(16, self.qdcount)?;
            w.write_var::<u16>(16, self.ancount)?;
            w.write_var::<u16>(16, self.nscount)?;
            w.write_var::<u16>(16, self.arcount)?;
            Ok(())
        };
        write(&mut writer).map_err(|e| TdnsError::InvalidBitStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            id: 0xBEEF,
            qr: true,
            opcode: 5,
            aa: true,
            tc: false,
            rd: false,
            ra: false,
            z: 0,
            rcode: 9,
            qdcount: 1,
            ancount: 0,
            nscount: 2,
            arcount: 1,
        };
        let mut wire = Vec::new();
        header.to_wire(&mut wire).unwrap();
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(Header::from_wire(&wire).unwrap(), header);
    }

    #[test]
    fn test_short_buffer() {
        assert!(Header::from_wire(&[0u8; 4]).is_err());
    }
}
