//! YAML configuration: server settings, zones, templates, includes.
//!
//! Includes are merged depth-first with a depth cap; on key collision
//! the included value wins for scalars and sequences, maps merge
//! recursively. Templates expand into zones field by field; template
//! parent chains form a DAG and any cycle is dropped with a log line.

use crate::comms::ZoneDescriptor;
use crate::dns::enums::RrType;
use crate::dns::name::Name;
use crate::dnssec::{ALG_ECDSA_P256, ALG_ED25519, ALG_RSASHA256, DnssecPolicy, KeyLifetime};
use crate::error::{Result, TdnsError};
use crate::query::ServerIdentity;
use crate::update::policy::{
    ChildPolicy, KeyUploadMode, PolicyType, ScopePolicy, UpdatePolicy,
};
use crate::zone::options::ZoneOptionSet;
use crate::zone::zone::{ZoneRole, ZoneStoreKind};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAX_INCLUDE_DEPTH: usize = 10;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub server: ServerSection,
    pub zones: BTreeMap<String, ZoneEntry>,
    pub templates: BTreeMap<String, ZoneEntry>,
    pub dnssec_policies: BTreeMap<String, DnssecPolicyEntry>,
    #[serde(skip)]
    pub include: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerSection {
    pub listen: ListenSection,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub keydb: PathBuf,
    pub identity: IdentitySection,
    pub server_id: Option<String>,
    pub max_refresh: u32,
    pub resign_interval: u64,
    pub agent_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: ListenSection::default(),
            cert_file: None,
            key_file: None,
            keydb: PathBuf::from("tdns.db"),
            identity: IdentitySection::default(),
            server_id: None,
            max_refresh: 7200,
            resign_interval: 300,
            agent_mode: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenSection {
    pub do53: Vec<String>,
    pub dot: Vec<String>,
    pub doh: Vec<String>,
    pub doq: Vec<String>,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            do53: vec!["0.0.0.0:53".to_string()],
            dot: Vec::new(),
            doh: Vec::new(),
            doq: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdentitySection {
    pub id: Option<String>,
    pub version: Option<String>,
    pub authors: Option<String>,
    pub hostname: Option<String>,
}

impl IdentitySection {
    pub fn to_identity(&self) -> ServerIdentity {
        ServerIdentity {
            id: self.id.clone(),
            version: self.version.clone(),
            authors: self.authors.clone(),
            hostname: self.hostname.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ZoneEntry {
    #[serde(rename = "type")]
    pub zone_type: Option<String>,
    pub store: Option<String>,
    pub primary: Option<String>,
    pub notify: Vec<String>,
    pub zonefile: Option<String>,
    pub options: Vec<String>,
    pub dnssec_policy: Option<String>,
    pub multi_signer: Option<String>,
    pub template: Option<String>,
    pub reset_soa_serial: Option<bool>,
    pub update_policy: Option<UpdatePolicyEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UpdatePolicyEntry {
    pub zone: Option<ScopeEntry>,
    pub child: Option<ChildScopeEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScopeEntry {
    #[serde(rename = "type")]
    pub policy_type: Option<String>,
    pub rrtypes: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChildScopeEntry {
    #[serde(rename = "type")]
    pub policy_type: Option<String>,
    pub rrtypes: Vec<String>,
    pub key_upload: Option<String>,
    pub key_bootstrap: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DnssecPolicyEntry {
    pub algorithm: Option<String>,
    pub ksk: Vec<String>,
    pub zsk: Vec<String>,
    pub csk: Vec<String>,
}

impl Config {
    /// Read a config file, merging its include chain.
    pub fn load(path: &Path) -> Result<Self> {
        let value = load_value(path, 0)?;
        let mut config: Config = serde_yaml::from_value(value)
            .map_err(|e| TdnsError::ConfigParse(e.to_string()))?;
        config.expand_templates();
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| TdnsError::ConfigParse(e.to_string()))?;
        let mut config: Config = serde_yaml::from_value(value)
            .map_err(|e| TdnsError::ConfigParse(e.to_string()))?;
        config.expand_templates();
        Ok(config)
    }

    /// Expand template references into the zone entries. Cyclic
    /// template chains are removed entirely, leaving no partial state.
    pub fn expand_templates(&mut self) {
        let cyclic = find_cyclic_templates(&self.templates);
        for name in &cyclic {
            warn!(template = %name, "template cycle dropped");
            self.templates.remove(name);
        }

        let templates = self.templates.clone();
        for (zone_name, entry) in self.zones.iter_mut() {
            let mut chain = Vec::new();
            let mut next = entry.template.clone();
            let mut seen = HashSet::new();
            while let Some(template_name) = next {
                if !seen.insert(template_name.clone()) {
                    break;
                }
                match templates.get(&template_name) {
                    Some(template) => {
                        next = template.template.clone();
                        chain.push(template.clone());
                    }
                    None => {
                        debug!(zone = %zone_name, template = %template_name, "unknown template");
                        break;
                    }
                }
            }
            for template in chain {
                merge_zone_entry(entry, &template);
            }
        }
    }

    /// Typed DNSSEC policies, with a "default" entry guaranteed.
    pub fn dnssec_policies(&self) -> Result<HashMap<String, DnssecPolicy>> {
        let mut policies = HashMap::new();
        for (name, entry) in &self.dnssec_policies {
            policies.insert(name.clone(), entry.to_policy(name)?);
        }
        policies
            .entry("default".to_string())
            .or_insert_with(DnssecPolicy::default);
        Ok(policies)
    }

    /// The alpn names of transports that will actually start.
    pub fn enabled_transports(&self) -> Vec<String> {
        let mut transports = Vec::new();
        if !self.server.listen.do53.is_empty() {
            transports.push("do53".to_string());
        }
        let tls_ready = match (&self.server.cert_file, &self.server.key_file) {
            (Some(cert), Some(key)) => {
                crate::transport::tls_material_present(cert, key)
            }
            _ => false,
        };
        if tls_ready {
            if !self.server.listen.dot.is_empty() {
                transports.push("dot".to_string());
            }
            if !self.server.listen.doh.is_empty() {
                transports.push("h2".to_string());
            }
            if !self.server.listen.doq.is_empty() {
                transports.push("doq".to_string());
            }
        }
        transports
    }
}

impl ZoneEntry {
    /// Turn the YAML entry into the descriptor the refresh engine
    /// admits zones from.
    pub fn to_descriptor(&self, name: &str) -> Result<ZoneDescriptor> {
        let zone_name = Name::parse(name)?;
        let role = match self.zone_type.as_deref() {
            Some("primary") => ZoneRole::Primary,
            Some("secondary") => ZoneRole::Secondary,
            Some(other) => {
                return Err(TdnsError::ConfigParse(format!(
                    "zone {}: unknown type {:?}",
                    name, other
                )));
            }
            None => {
                return Err(TdnsError::ConfigParse(format!(
                    "zone {}: type is required",
                    name
                )));
            }
        };
        let store = ZoneStoreKind::parse(self.store.as_deref().unwrap_or("map"));

        let mut descriptor = ZoneDescriptor::new(zone_name, role, store);
        descriptor.upstream = match &self.primary {
            Some(host) => Some(parse_host_port(host)?),
            None => None,
        };
        descriptor.downstreams = self
            .notify
            .iter()
            .map(|host| parse_host_port(host))
            .collect::<Result<Vec<_>>>()?;
        descriptor.zonefile = self.zonefile.as_ref().map(PathBuf::from);
        descriptor.options = ZoneOptionSet::parse(&self.options)?;
        descriptor.dnssec_policy = self
            .dnssec_policy
            .clone()
            .filter(|policy| policy != "none");
        descriptor.multi_signer = self.multi_signer.clone();
        descriptor.reset_soa_serial = self.reset_soa_serial.unwrap_or(false);
        if let Some(policy) = &self.update_policy {
            descriptor.update_policy = policy.to_policy(name)?;
        }
        Ok(descriptor)
    }
}

impl UpdatePolicyEntry {
    pub fn to_policy(&self, zone: &str) -> Result<UpdatePolicy> {
        let parse_scope = |entry: &ScopeEntry| -> Result<ScopePolicy> {
            let ptype = PolicyType::parse(entry.policy_type.as_deref().unwrap_or(""))
                .ok_or_else(|| {
                    TdnsError::InvalidUpdatePolicy(format!(
                        "zone {}: bad policy type {:?}",
                        zone, entry.policy_type
                    ))
                })?;
            let rrtypes = entry
                .rrtypes
                .iter()
                .map(|s| {
                    RrType::from_mnemonic(s).ok_or_else(|| {
                        TdnsError::InvalidUpdatePolicy(format!(
                            "zone {}: unknown rrtype {:?}",
                            zone, s
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ScopePolicy::new(ptype, rrtypes))
        };

        let zone_scope = match &self.zone {
            Some(entry) => parse_scope(entry)?,
            None => ScopePolicy::default(),
        };
        let child = match &self.child {
            Some(entry) => {
                let scope = parse_scope(&ScopeEntry {
                    policy_type: entry.policy_type.clone(),
                    rrtypes: entry.rrtypes.clone(),
                })?;
                let key_upload = KeyUploadMode::parse(entry.key_upload.as_deref().unwrap_or(""))
                    .ok_or_else(|| {
                        TdnsError::InvalidUpdatePolicy(format!(
                            "zone {}: bad key-upload {:?}",
                            zone, entry.key_upload
                        ))
                    })?;
                ChildPolicy {
                    scope,
                    key_upload,
                    key_bootstrap: entry.key_bootstrap.clone(),
                }
            }
            None => ChildPolicy::default(),
        };
        Ok(UpdatePolicy {
            zone: zone_scope,
            child,
        })
    }
}

impl DnssecPolicyEntry {
    pub fn to_policy(&self, name: &str) -> Result<DnssecPolicy> {
        let algorithm = match self.algorithm.as_deref() {
            None | Some("ed25519") => ALG_ED25519,
            Some("ecdsa-p256") => ALG_ECDSA_P256,
            Some("rsasha256") => ALG_RSASHA256,
            Some(other) => {
                return Err(TdnsError::ConfigParse(format!(
                    "dnssec policy {}: unknown algorithm {:?}",
                    name, other
                )));
            }
        };
        let lifetime = |words: &[String], which: &str| -> Result<KeyLifetime> {
            if words.is_empty() {
                return Ok(KeyLifetime::default());
            }
            if words.len() != 2 {
                return Err(TdnsError::ConfigParse(format!(
                    "dnssec policy {}: {} needs [active, validity]",
                    name, which
                )));
            }
            let active = KeyLifetime::parse_word(&words[0]).ok_or_else(|| {
                TdnsError::ConfigParse(format!("dnssec policy {}: bad lifetime {}", name, words[0]))
            })?;
            let validity = KeyLifetime::parse_word(&words[1]).ok_or_else(|| {
                TdnsError::ConfigParse(format!("dnssec policy {}: bad lifetime {}", name, words[1]))
            })?;
            Ok(KeyLifetime {
                active_secs: active,
                sig_validity_secs: validity,
            })
        };
        Ok(DnssecPolicy {
            name: name.to_string(),
            algorithm,
            ksk: lifetime(&self.ksk, "ksk")?,
            zsk: lifetime(&self.zsk, "zsk")?,
            csk: lifetime(&self.csk, "csk")?,
        })
    }
}

/// Append the default DNS port when the address carries none.
pub fn parse_host_port(host: &str) -> Result<SocketAddr> {
    let with_port = if host.contains(':') && !host.starts_with('[') {
        host.to_string()
    } else if host.starts_with('[') && !host.contains("]:") {
        format!("{}:53", host)
    } else if !host.contains(':') {
        format!("{}:53", host)
    } else {
        host.to_string()
    };
    with_port
        .parse()
        .map_err(|_| TdnsError::InvalidUpstream(host.to_string()))
}

/// Load a YAML file and fold its includes in, depth-first.
fn load_value(path: &Path, depth: usize) -> Result<serde_yaml::Value> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(TdnsError::IncludeDepthExceeded(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| TdnsError::ConfigParse(format!("{}: {}", path.display(), e)))?;
    let mut value: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| TdnsError::ConfigParse(e.to_string()))?;

    let include_key = serde_yaml::Value::from("include");
    let includes: Vec<String> = value
        .as_mapping()
        .and_then(|map| map.get(&include_key))
        .and_then(|seq| seq.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if let Some(map) = value.as_mapping_mut() {
        map.remove(&include_key);
    }

    let base = path.parent().unwrap_or(Path::new("."));
    for include in includes {
        let include_path = base.join(&include);
        let included = load_value(&include_path, depth + 1)?;
        merge_values(&mut value, included);
    }
    Ok(value)
}

/// Merge `incoming` into `base`: maps merge recursively, everything
/// else prefers the incoming value.
fn merge_values(base: &mut serde_yaml::Value, incoming: serde_yaml::Value) {
    match (base, incoming) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(incoming_map)) => {
            for (key, incoming_value) in incoming_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, incoming_value),
                    None => {
                        base_map.insert(key, incoming_value);
                    }
                }
            }
        }
        (base_slot, incoming_value) => *base_slot = incoming_value,
    }
}

/// Field-by-field template application: only unset zone fields take
/// the template's value.
fn merge_zone_entry(entry: &mut ZoneEntry, template: &ZoneEntry) {
    if entry.zone_type.is_none() {
        entry.zone_type = template.zone_type.clone();
    }
    if entry.store.is_none() {
        entry.store = template.store.clone();
    }
    if entry.primary.is_none() {
        entry.primary = template.primary.clone();
    }
    if entry.notify.is_empty() {
        entry.notify = template.notify.clone();
    }
    if entry.zonefile.is_none() {
        entry.zonefile = template.zonefile.clone();
    }
    if entry.options.is_empty() {
        entry.options = template.options.clone();
    }
    if entry.dnssec_policy.is_none() {
        entry.dnssec_policy = template.dnssec_policy.clone();
    }
    if entry.multi_signer.is_none() {
        entry.multi_signer = template.multi_signer.clone();
    }
    if entry.reset_soa_serial.is_none() {
        entry.reset_soa_serial = template.reset_soa_serial;
    }
    if entry.update_policy.is_none() {
        entry.update_policy = template.update_policy.clone();
    }
}

/// Templates whose parent chain loops back on itself.
fn find_cyclic_templates(templates: &BTreeMap<String, ZoneEntry>) -> Vec<String> {
    let mut cyclic = Vec::new();
    for start in templates.keys() {
        let mut seen = HashSet::new();
        let mut current = Some(start.clone());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                cyclic.push(start.clone());
                break;
            }
            current = templates.get(&name).and_then(|t| t.template.clone());
        }
    }
    cyclic
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"
server:
  listen:
    do53: ["127.0.0.1:5300"]
  keydb: /tmp/test-keys.db
zones:
  example.com.:
    type: primary
    store: map
    zonefile: /var/zones/example.com
    options: [allow-updates, online-signing]
    update-policy:
      zone:
        type: self
        rrtypes: [A, AAAA, TXT]
  child.example.org.:
    type: secondary
    primary: 192.0.2.53
    notify: ["192.0.2.54:5353"]
"#;

    #[test]
    fn test_basic_parse_and_descriptor() {
        let config = Config::from_str(BASIC).unwrap();
        assert_eq!(config.zones.len(), 2);

        let entry = &config.zones["example.com."];
        let descriptor = entry.to_descriptor("example.com.").unwrap();
        assert_eq!(descriptor.role, ZoneRole::Primary);
        assert_eq!(descriptor.store, ZoneStoreKind::Map);
        assert!(
            descriptor
                .options
                .contains(crate::zone::options::ZoneOption::OnlineSigning)
        );
        assert_eq!(descriptor.update_policy.zone.rrtypes.len(), 3);

        let secondary = config.zones["child.example.org."]
            .to_descriptor("child.example.org.")
            .unwrap();
        // Default port appended
        assert_eq!(secondary.upstream.unwrap().port(), 53);
        assert_eq!(secondary.downstreams[0].port(), 5353);
    }

    #[test]
    fn test_unknown_store_defaults_to_map() {
        let mut entry = ZoneEntry {
            zone_type: Some("primary".to_string()),
            store: Some("btree".to_string()),
            ..ZoneEntry::default()
        };
        entry.zonefile = Some("/tmp/zone".to_string());
        let descriptor = entry.to_descriptor("example.com.").unwrap();
        assert_eq!(descriptor.store, ZoneStoreKind::Map);
    }

    #[test]
    fn test_missing_type_rejected() {
        let entry = ZoneEntry::default();
        assert!(entry.to_descriptor("example.com.").is_err());
    }

    #[test]
    fn test_template_expansion() {
        let config = Config::from_str(
            r#"
templates:
  base:
    type: secondary
    primary: 192.0.2.53
    options: [fold-case]
zones:
  a.example.:
    template: base
  b.example.:
    template: base
    options: [allow-updates]
"#,
        )
        .unwrap();
        let a = &config.zones["a.example."];
        assert_eq!(a.zone_type.as_deref(), Some("secondary"));
        assert_eq!(a.options, vec!["fold-case"]);
        // Explicit zone fields beat the template
        let b = &config.zones["b.example."];
        assert_eq!(b.options, vec!["allow-updates"]);
        assert_eq!(b.primary.as_deref(), Some("192.0.2.53"));
    }

    #[test]
    fn test_template_chain() {
        let config = Config::from_str(
            r#"
templates:
  grandparent:
    store: slice
  parent:
    template: grandparent
    type: secondary
zones:
  a.example.:
    template: parent
"#,
        )
        .unwrap();
        let a = &config.zones["a.example."];
        assert_eq!(a.zone_type.as_deref(), Some("secondary"));
        assert_eq!(a.store.as_deref(), Some("slice"));
    }

    #[test]
    fn test_template_cycle_dropped() {
        let config = Config::from_str(
            r#"
templates:
  loop-a:
    template: loop-b
    type: primary
  loop-b:
    template: loop-a
  standalone:
    type: secondary
zones:
  a.example.:
    template: loop-a
"#,
        )
        .unwrap();
        // The cyclic chain is gone, the innocent template stays
        assert!(!config.templates.contains_key("loop-a"));
        assert!(!config.templates.contains_key("loop-b"));
        assert!(config.templates.contains_key("standalone"));
        // The zone referencing the dropped chain picked up nothing
        assert!(config.zones["a.example."].zone_type.is_none());
    }

    #[test]
    fn test_self_cycle_dropped_idempotently() {
        let mut config = Config::from_str(
            r#"
templates:
  selfish:
    template: selfish
    type: primary
"#,
        )
        .unwrap();
        assert!(config.templates.is_empty());
        // A second expansion is a no-op
        config.expand_templates();
        assert!(config.templates.is_empty());
    }

    #[test]
    fn test_include_merge() {
        let dir = tempfile::tempdir().unwrap();
        let included = dir.path().join("extra.yaml");
        let mut file = std::fs::File::create(&included).unwrap();
        writeln!(
            file,
            "zones:\n  extra.example.:\n    type: primary\n    zonefile: /tmp/extra\nserver:\n  max-refresh: 1234\n"
        )
        .unwrap();

        let main = dir.path().join("main.yaml");
        let mut file = std::fs::File::create(&main).unwrap();
        writeln!(
            file,
            "include: [extra.yaml]\nserver:\n  max-refresh: 9999\nzones:\n  main.example.:\n    type: primary\n    zonefile: /tmp/main\n"
        )
        .unwrap();

        let config = Config::load(&main).unwrap();
        assert!(config.zones.contains_key("main.example."));
        assert!(config.zones.contains_key("extra.example."));
        // Included scalar wins on collision
        assert_eq!(config.server.max_refresh, 1234);
    }

    #[test]
    fn test_include_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.yaml");
        std::fs::write(&path, "include: [loop.yaml]\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, TdnsError::IncludeDepthExceeded(_)));
    }

    #[test]
    fn test_host_port_parsing() {
        assert_eq!(parse_host_port("192.0.2.1").unwrap().port(), 53);
        assert_eq!(parse_host_port("192.0.2.1:9053").unwrap().port(), 9053);
        assert!(parse_host_port("not a host").is_err());
    }

    #[test]
    fn test_dnssec_policy_parse() {
        let config = Config::from_str(
            r#"
dnssec-policies:
  online:
    algorithm: ed25519
    csk: [forever, "1209600"]
"#,
        )
        .unwrap();
        let policies = config.dnssec_policies().unwrap();
        let online = &policies["online"];
        assert_eq!(online.algorithm, ALG_ED25519);
        assert_eq!(online.csk.sig_validity_secs, 1209600);
        assert_eq!(
            online.csk.active_secs,
            crate::dnssec::LIFETIME_FOREVER
        );
        // The default policy is always present
        assert!(policies.contains_key("default"));
    }

    #[test]
    fn test_bad_update_policy_type() {
        let entry = UpdatePolicyEntry {
            zone: Some(ScopeEntry {
                policy_type: Some("everyone".to_string()),
                rrtypes: vec![],
            }),
            child: None,
        };
        assert!(entry.to_policy("example.com.").is_err());
    }

    #[test]
    fn test_reload_same_config_same_zone_set() {
        let first = Config::from_str(BASIC).unwrap();
        let second = Config::from_str(BASIC).unwrap();
        let names_first: Vec<_> = first.zones.keys().collect();
        let names_second: Vec<_> = second.zones.keys().collect();
        assert_eq!(names_first, names_second);
    }
}
