//! Domain-name handling: label storage, suffix matching, wire codec.
//!
//! Names are stored as label vectors without the trailing root label;
//! presentation form always carries the trailing dot. Comparisons are
//! ASCII case-insensitive as the protocol requires; zones with the
//! fold-case option additionally lower-case what they publish.

use crate::error::{Result, TdnsError};

/// Maximum pointer hops while decompressing a name.
const MAX_POINTER_HOPS: usize = 16;

#[derive(Clone, Debug, Default, Eq)]
pub struct Name {
    labels: Vec<String>,
}

impl Name {
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Parse presentation form. A trailing dot is accepted and not
    /// required; the empty string and "." are the root.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut labels = Vec::new();
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(TdnsError::InvalidLabel);
            }
            labels.push(label.to_string());
        }
        Ok(Self { labels })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// The name with the leftmost label stripped; root stays root.
    pub fn parent(&self) -> Name {
        if self.labels.is_empty() {
            Name::root()
        } else {
            Name {
                labels: self.labels[1..].to_vec(),
            }
        }
    }

    /// Prepend a label, as when synthesising `_dns.<server-id>`.
    pub fn prepend(&self, label: &str) -> Name {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(label.to_string());
        labels.extend_from_slice(&self.labels);
        Name { labels }
    }

    /// True when `self` ends with all the labels of `suffix`.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let offset = self.labels.len() - suffix.labels.len();
        self.labels[offset..]
            .iter()
            .zip(suffix.labels.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// True when `self` is a strict descendant of `ancestor`.
    pub fn is_below(&self, ancestor: &Name) -> bool {
        self.labels.len() > ancestor.labels.len() && self.ends_with(ancestor)
    }

    pub fn to_lowercase(&self) -> Name {
        Name {
            labels: self.labels.iter().map(|l| l.to_lowercase()).collect(),
        }
    }

    /// Canonical lowercase presentation form, used as a map key.
    pub fn key(&self) -> String {
        if self.labels.is_empty() {
            return ".".to_string();
        }
        let mut s = self
            .labels
            .iter()
            .map(|l| l.to_lowercase())
            .collect::<Vec<_>>()
            .join(".");
        s.push('.');
        s
    }

    /// Uncompressed wire encoding.
    pub fn to_wire(&self, out: &mut Vec<u8>) {
        for label in &self.labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Decode a possibly-compressed name from `buf` starting at `*pos`.
    /// `*pos` is advanced past the name as it appears in place;
    /// compression pointers are chased into earlier parts of `buf`.
    pub fn from_wire(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let mut labels = Vec::new();
        let mut cursor = *pos;
        let mut jumped = false;
        let mut hops = 0;

        loop {
            let len = *buf.get(cursor).ok_or(TdnsError::InvalidLabel)? as usize;
            if len == 0 {
                cursor += 1;
                if !jumped {
                    *pos = cursor;
                }
                break;
            }
            if len & 0xC0 == 0xC0 {
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(TdnsError::InvalidLabel);
                }
                let low = *buf.get(cursor + 1).ok_or(TdnsError::InvalidLabel)? as usize;
                let target = ((len & 0x3F) << 8) | low;
                if target >= cursor {
                    // Pointers must point backwards
                    return Err(TdnsError::InvalidLabel);
                }
                if !jumped {
                    *pos = cursor + 2;
                    jumped = true;
                }
                cursor = target;
                continue;
            }
            if len > 63 {
                return Err(TdnsError::InvalidLabel);
            }
            let end = cursor + 1 + len;
            let bytes = buf.get(cursor + 1..end).ok_or(TdnsError::InvalidLabel)?;
            labels.push(String::from_utf8_lossy(bytes).into_owned());
            cursor = end;
            if labels.len() > 127 {
                return Err(TdnsError::InvalidLabel);
            }
        }

        Ok(Self { labels })
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl std::hash::Hash for Name {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for label in &self.labels {
            label.to_lowercase().hash(state);
        }
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.labels.is_empty() {
            return f.write_str(".");
        }
        for label in &self.labels {
            write!(f, "{}.", label)?;
        }
        Ok(())
    }
}
