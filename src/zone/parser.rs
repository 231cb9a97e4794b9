//! Master-file zone parser.
//!
//! Handles the subset of RFC 1035 presentation syntax the server
//! needs: `$ORIGIN`, `$TTL`, comments, parenthesised continuations,
//! `@`, relative owner names and the common rdata types.

use crate::dns::enums::{RrClass, RrType};
use crate::dns::name::Name;
use crate::dns::record::{KeyRdata, Record, SoaRdata, txt_rdata};
use crate::error::{Result, TdnsError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::debug;

pub struct ZoneParser {
    origin: Name,
    default_ttl: u32,
    last_owner: Option<Name>,
}

impl ZoneParser {
    pub fn new(origin: Name) -> Self {
        Self {
            origin,
            default_ttl: 3600,
            last_owner: None,
        }
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<Vec<Record>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TdnsError::ZoneParse(format!("{}: {}", path.display(), e)))?;
        self.parse_str(&content)
    }

    pub fn parse_str(&mut self, content: &str) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for line in join_parentheses(content) {
            if let Some(record) = self.parse_line(&line)? {
                records.push(record);
            }
        }
        debug!(count = records.len(), origin = %self.origin, "zone file parsed");
        Ok(records)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<Record>> {
        let line = strip_comment(line);
        if line.trim().is_empty() {
            return Ok(None);
        }

        if let Some(rest) = line.trim().strip_prefix("$ORIGIN") {
            self.origin = Name::parse(rest.trim())?;
            return Ok(None);
        }
        if let Some(rest) = line.trim().strip_prefix("$TTL") {
            self.default_ttl = rest
                .trim()
                .parse()
                .map_err(|_| TdnsError::ZoneParse(format!("bad $TTL: {}", rest.trim())))?;
            return Ok(None);
        }

        // Leading whitespace means "same owner as the previous record"
        let starts_blank = line.starts_with(' ') || line.starts_with('\t');
        let mut tokens = line.split_whitespace();

        let owner = if starts_blank {
            self.last_owner
                .clone()
                .ok_or_else(|| TdnsError::ZoneParse("no previous owner".to_string()))?
        } else {
            let token = tokens
                .next()
                .ok_or_else(|| TdnsError::ZoneParse("empty record line".to_string()))?;
            self.owner_name(token)?
        };
        self.last_owner = Some(owner.clone());

        // [ttl] [class] type rdata...
        let mut ttl = self.default_ttl;
        let mut class = RrClass::In;
        let rtype;
        loop {
            let token = tokens
                .next()
                .ok_or_else(|| TdnsError::ZoneParse(format!("truncated record at {}", owner)))?;
            if let Ok(value) = token.parse::<u32>() {
                ttl = value;
            } else if token.eq_ignore_ascii_case("IN") {
                class = RrClass::In;
            } else if token.eq_ignore_ascii_case("CH") {
                class = RrClass::Chaos;
            } else if let Some(t) = RrType::from_mnemonic(token) {
                rtype = t;
                break;
            } else {
                return Err(TdnsError::ZoneParse(format!(
                    "unrecognised token {:?} at {}",
                    token, owner
                )));
            }
        }

        let rdata_tokens: Vec<&str> = tokens.collect();
        let rdata = self.encode_rdata(rtype, &rdata_tokens)?;
        Ok(Some(Record::new(owner, rtype, class, ttl, rdata)))
    }

    fn owner_name(&self, token: &str) -> Result<Name> {
        if token == "@" {
            return Ok(self.origin.clone());
        }
        if token.ends_with('.') {
            return Name::parse(token);
        }
        // Relative: append the origin
        let mut labels: Vec<String> = token.split('.').map(|s| s.to_string()).collect();
        labels.extend(self.origin.labels().iter().cloned());
        Ok(Name::from_labels(labels))
    }

    fn rdata_name(&self, token: &str) -> Result<Name> {
        self.owner_name(token)
    }

    fn encode_rdata(&self, rtype: RrType, tokens: &[&str]) -> Result<Vec<u8>> {
        let need = |n: usize| -> Result<()> {
            if tokens.len() < n {
                Err(TdnsError::ZoneParse(format!(
                    "{} rdata needs {} fields, got {}",
                    rtype,
                    n,
                    tokens.len()
                )))
            } else {
                Ok(())
            }
        };

        match rtype {
            RrType::A => {
                need(1)?;
                let addr: Ipv4Addr = tokens[0]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad IPv4: {}", tokens[0])))?;
                Ok(addr.octets().to_vec())
            }
            RrType::Aaaa => {
                need(1)?;
                let addr: Ipv6Addr = tokens[0]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad IPv6: {}", tokens[0])))?;
                Ok(addr.octets().to_vec())
            }
            RrType::Ns | RrType::Cname | RrType::Ptr => {
                need(1)?;
                let mut out = Vec::new();
                self.rdata_name(tokens[0])?.to_wire(&mut out);
                Ok(out)
            }
            RrType::Mx => {
                need(2)?;
                let pref: u16 = tokens[0]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad MX pref: {}", tokens[0])))?;
                let mut out = pref.to_be_bytes().to_vec();
                self.rdata_name(tokens[1])?.to_wire(&mut out);
                Ok(out)
            }
            RrType::Txt => {
                need(1)?;
                let text = tokens.join(" ");
                Ok(txt_rdata(text.trim_matches('"')))
            }
            RrType::Soa => {
                need(7)?;
                let word = |i: usize| -> Result<u32> {
                    tokens[i].parse().map_err(|_| {
                        TdnsError::ZoneParse(format!("bad SOA field: {}", tokens[i]))
                    })
                };
                let soa = SoaRdata {
                    mname: self.rdata_name(tokens[0])?,
                    rname: self.rdata_name(tokens[1])?,
                    serial: word(2)?,
                    refresh: word(3)?,
                    retry: word(4)?,
                    expire: word(5)?,
                    minimum: word(6)?,
                };
                Ok(soa.to_wire())
            }
            RrType::Srv => {
                need(4)?;
                let short = |i: usize| -> Result<u16> {
                    tokens[i].parse().map_err(|_| {
                        TdnsError::ZoneParse(format!("bad SRV field: {}", tokens[i]))
                    })
                };
                let mut out = Vec::new();
                out.extend_from_slice(&short(0)?.to_be_bytes());
                out.extend_from_slice(&short(1)?.to_be_bytes());
                out.extend_from_slice(&short(2)?.to_be_bytes());
                self.rdata_name(tokens[3])?.to_wire(&mut out);
                Ok(out)
            }
            RrType::Key | RrType::Dnskey => {
                need(4)?;
                let flags: u16 = tokens[0]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad key flags: {}", tokens[0])))?;
                let protocol: u8 = tokens[1]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad protocol: {}", tokens[1])))?;
                let algorithm: u8 = tokens[2]
                    .parse()
                    .map_err(|_| TdnsError::ZoneParse(format!("bad algorithm: {}", tokens[2])))?;
                let public_key = BASE64
                    .decode(tokens[3..].concat())
                    .map_err(|e| TdnsError::ZoneParse(format!("bad key material: {}", e)))?;
                Ok(KeyRdata {
                    flags,
                    protocol,
                    algorithm,
                    public_key,
                }
                .to_wire())
            }
            other => Err(TdnsError::ZoneParse(format!(
                "unsupported type in zone file: {}",
                other
            ))),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    // Quoted strings may contain ';'; scan outside quotes only
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Merge parenthesised continuations into single logical lines.
fn join_parentheses(content: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut depth = 0usize;

    for raw in content.lines() {
        let line = strip_comment(raw);
        depth += line.matches('(').count();
        let closing = line.matches(')').count();

        let cleaned = line.replace(['(', ')'], " ");
        if depth > 0 {
            if pending.is_empty() {
                pending = cleaned;
            } else {
                pending.push(' ');
                pending.push_str(cleaned.trim());
            }
            depth = depth.saturating_sub(closing);
            if depth == 0 {
                lines.push(std::mem::take(&mut pending));
            }
        } else {
            lines.push(cleaned);
        }
    }
    if !pending.is_empty() {
        lines.push(pending);
    }
    lines
}
