//! Upstream zone transfer client.
//!
//! The refresh engine owns all upstream XFR I/O: a UDP SOA probe to
//! compare serials, and a TCP AXFR with 2-byte length framing that
//! accumulates records until the closing SOA.

use crate::dns::enums::{Opcode, Rcode, RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::packet::Message;
use crate::dns::question::Question;
use crate::dns::record::Record;
use crate::error::{Result, TdnsError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

const XFR_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn soa_query(zone: &Name) -> Message {
    let mut msg = Message::default();
    msg.header.id = rand::random();
    msg.header.opcode = Opcode::Query.to_u8();
    msg.questions
        .push(Question::new(zone.clone(), RrType::Soa, RrClass::In));
    msg
}

/// Ask the upstream for the zone's SOA and return its serial.
pub async fn probe_serial(upstream: SocketAddr, zone: &Name) -> Result<u32> {
    let query = soa_query(zone);
    let wire = query.serialize()?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.send_to(&wire, upstream).await?;

    let mut buf = vec![0u8; 4096];
    let (len, _) = timeout(PROBE_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| TdnsError::UpstreamTimeout(upstream.to_string()))??;

    let response = Message::parse(&buf[..len])?;
    if response.header.id != query.header.id || response.rcode() != Rcode::NoError {
        return Err(TdnsError::TransferFailed(format!(
            "SOA probe for {} answered {:?}",
            zone,
            response.rcode()
        )));
    }
    response
        .answers
        .iter()
        .find(|rr| rr.rtype == RrType::Soa)
        .ok_or_else(|| TdnsError::TransferFailed(format!("no SOA in probe answer for {}", zone)))?
        .soa()
        .map(|soa| soa.serial)
}

/// Full zone transfer. Returns every record between (and including)
/// the opening SOA and the record before the closing SOA.
pub async fn axfr(upstream: SocketAddr, zone: &Name) -> Result<Vec<Record>> {
    let mut query = soa_query(zone);
    query.questions[0].qtype = RrType::Axfr;
    let wire = query.serialize()?;

    let mut stream = timeout(XFR_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| TdnsError::UpstreamTimeout(upstream.to_string()))??;

    stream
        .write_all(&(wire.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(&wire).await?;

    let mut records: Vec<Record> = Vec::new();
    let mut soa_seen = 0u8;

    'messages: loop {
        let mut len_buf = [0u8; 2];
        timeout(XFR_TIMEOUT, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| TdnsError::UpstreamTimeout(upstream.to_string()))??;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(TdnsError::TransferFailed("empty XFR message".to_string()));
        }

        let mut buf = vec![0u8; len];
        timeout(XFR_TIMEOUT, stream.read_exact(&mut buf))
            .await
            .map_err(|_| TdnsError::UpstreamTimeout(upstream.to_string()))??;

        let message = Message::parse(&buf)?;
        if message.rcode() != Rcode::NoError {
            return Err(TdnsError::TransferFailed(format!(
                "upstream answered {:?} to AXFR of {}",
                message.rcode(),
                zone
            )));
        }

        for rr in message.answers {
            if rr.rtype == RrType::Soa {
                soa_seen += 1;
                if soa_seen == 1 {
                    records.push(rr);
                    continue;
                }
                // The closing SOA ends the stream and is not kept twice
                break 'messages;
            }
            if soa_seen == 0 {
                return Err(TdnsError::TransferFailed(
                    "AXFR stream did not start with SOA".to_string(),
                ));
            }
            records.push(rr);
        }
    }

    debug!(zone = %zone, records = records.len(), "AXFR complete");
    Ok(records)
}

/// Serial comparison wrapper: probe first, transfer only when the
/// upstream is ahead (or `force` is set). Returns None when the zone
/// is already current.
pub async fn refresh_from_upstream(
    upstream: SocketAddr,
    zone: &Name,
    known_serial: u32,
    force: bool,
) -> Result<Option<Vec<Record>>> {
    if !force {
        match probe_serial(upstream, zone).await {
            Ok(serial) if serial_not_newer(serial, known_serial) => {
                debug!(zone = %zone, serial, known_serial, "upstream not newer, skipping transfer");
                return Ok(None);
            }
            Ok(serial) => {
                debug!(zone = %zone, serial, known_serial, "upstream ahead, transferring");
            }
            Err(e) => {
                warn!(zone = %zone, error = %e, "SOA probe failed, attempting transfer anyway");
            }
        }
    }
    axfr(upstream, zone).await.map(Some)
}

/// RFC 1982 serial arithmetic, reduced to the "has it moved forward"
/// question the refresh path asks.
fn serial_not_newer(upstream: u32, known: u32) -> bool {
    upstream == known || upstream.wrapping_sub(known) > u32::MAX / 2
}
