//! Persistent key database.
//!
//! SQLite holds SIG(0) keypairs, DNSSEC keys and the trust store of
//! child SIG(0) keys. At most one transaction is open per database
//! object; it is tracked by a context string so nested use fails
//! loudly instead of deadlocking. Three in-memory caches keyed by zone
//! name serve the hot lookups.

use crate::dns::name::Name;
use crate::dns::record::KeyRdata;
use crate::dnssec::KeyRole;
use crate::error::{Result, TdnsError};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;
use tracing::{debug, info};

/// A SIG(0) key as the update pipeline sees it.
#[derive(Clone, Debug)]
pub struct Sig0Key {
    pub zone: String,
    pub owner: Name,
    pub key_tag: u16,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
    pub private_key: Option<Vec<u8>>,
    pub trusted: bool,
}

impl Sig0Key {
    pub fn rdata(&self) -> KeyRdata {
        KeyRdata {
            flags: 0x0100,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: self.public_key.clone(),
        }
    }
}

/// A child key in the trust store.
#[derive(Clone, Debug)]
pub struct TrustRecord {
    pub zone: String,
    pub child: Name,
    pub key_tag: u16,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
    pub trusted: bool,
}

/// A DNSSEC signing key row.
#[derive(Clone, Debug)]
pub struct DnssecKeyRow {
    pub zone: String,
    pub role: KeyRole,
    pub key_tag: u16,
    pub algorithm: u8,
    pub pkcs8: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug)]
pub struct KeyDb {
    conn: Mutex<Connection>,
    tx_context: Mutex<Option<String>>,
    sig0_cache: DashMap<String, Vec<Sig0Key>>,
    dnssec_cache: DashMap<String, Vec<DnssecKeyRow>>,
    trust_cache: DashMap<String, Vec<TrustRecord>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sig0_keys (
    zone       TEXT NOT NULL,
    owner      TEXT NOT NULL,
    keytag     INTEGER NOT NULL,
    algorithm  INTEGER NOT NULL,
    pubkey     BLOB NOT NULL,
    privkey    BLOB,
    trusted    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (owner, keytag)
);
CREATE TABLE IF NOT EXISTS dnssec_keys (
    zone       TEXT NOT NULL,
    role       TEXT NOT NULL,
    keytag     INTEGER NOT NULL,
    algorithm  INTEGER NOT NULL,
    pkcs8      BLOB NOT NULL,
    pubkey     BLOB NOT NULL,
    PRIMARY KEY (zone, role, keytag)
);
CREATE TABLE IF NOT EXISTS trust_store (
    zone       TEXT NOT NULL,
    child      TEXT NOT NULL,
    keytag     INTEGER NOT NULL,
    algorithm  INTEGER NOT NULL,
    pubkey     BLOB NOT NULL,
    trusted    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (child, keytag)
);
"#;

impl KeyDb {
    /// Open (or create) the database. Paths containing `..` are
    /// refused outright.
    pub fn open(path: &Path) -> Result<Self> {
        if path.components().any(|c| c.as_os_str() == "..") {
            return Err(TdnsError::KeyDbPathRefused(path.display().to_string()));
        }
        let conn =
            Connection::open(path).map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        info!(path = %path.display(), "key database open");
        Ok(Self {
            conn: Mutex::new(conn),
            tx_context: Mutex::new(None),
            sig0_cache: DashMap::new(),
            dnssec_cache: DashMap::new(),
            trust_cache: DashMap::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            tx_context: Mutex::new(None),
            sig0_cache: DashMap::new(),
            dnssec_cache: DashMap::new(),
            trust_cache: DashMap::new(),
        })
    }

    // --- transactions ---------------------------------------------

    /// Begin a transaction, recording who holds it.
    pub fn begin(&self, context: &str) -> Result<()> {
        let mut tx = self.tx_context.lock();
        if let Some(holder) = tx.as_ref() {
            return Err(TdnsError::TxAlreadyOpen(holder.clone()));
        }
        self.conn
            .lock()
            .execute_batch("BEGIN")
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        *tx = Some(context.to_string());
        debug!(context, "key database transaction open");
        Ok(())
    }

    pub fn commit(&self, context: &str) -> Result<()> {
        self.finish(context, "COMMIT")
    }

    pub fn rollback(&self, context: &str) -> Result<()> {
        self.finish(context, "ROLLBACK")
    }

    fn finish(&self, context: &str, verb: &str) -> Result<()> {
        let mut tx = self.tx_context.lock();
        match tx.as_ref() {
            Some(holder) if holder == context => {}
            Some(holder) => return Err(TdnsError::TxAlreadyOpen(holder.clone())),
            None => return Err(TdnsError::KeyDb("no transaction open".to_string())),
        }
        self.conn
            .lock()
            .execute_batch(verb)
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        *tx = None;
        Ok(())
    }

    // --- SIG(0) keys ----------------------------------------------

    pub fn store_sig0_key(&self, key: &Sig0Key) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO sig0_keys \
                 (zone, owner, keytag, algorithm, pubkey, privkey, trusted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key.zone,
                    key.owner.key(),
                    key.key_tag,
                    key.algorithm,
                    key.public_key,
                    key.private_key,
                    key.trusted as i64,
                ],
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        self.sig0_cache.remove(&key.zone);
        Ok(())
    }

    /// Find the key matching (signer name, key tag), any zone.
    pub fn find_sig0_key(&self, owner: &Name, key_tag: u16) -> Result<Option<Sig0Key>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT zone, owner, keytag, algorithm, pubkey, privkey, trusted \
                 FROM sig0_keys WHERE owner = ?1 AND keytag = ?2",
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        let mut rows = stmt
            .query(params![owner.key(), key_tag])
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        match rows.next().map_err(|e| TdnsError::KeyDb(e.to_string()))? {
            Some(row) => Ok(Some(Self::sig0_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Active SIG(0) keys for a zone, via the cache.
    pub fn sig0_keys_for_zone(&self, zone: &str) -> Result<Vec<Sig0Key>> {
        if let Some(hit) = self.sig0_cache.get(zone) {
            return Ok(hit.clone());
        }
        let keys = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT zone, owner, keytag, algorithm, pubkey, privkey, trusted \
                     FROM sig0_keys WHERE zone = ?1",
                )
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut rows = stmt
                .query(params![zone])
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next().map_err(|e| TdnsError::KeyDb(e.to_string()))? {
                keys.push(Self::sig0_from_row(row)?);
            }
            keys
        };
        self.sig0_cache.insert(zone.to_string(), keys.clone());
        Ok(keys)
    }

    fn sig0_from_row(row: &rusqlite::Row<'_>) -> Result<Sig0Key> {
        let owner: String = row.get(1).map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        Ok(Sig0Key {
            zone: row.get(0).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            owner: Name::parse(&owner)?,
            key_tag: row.get(2).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            algorithm: row.get(3).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            public_key: row.get(4).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            private_key: row.get(5).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            trusted: row.get::<_, i64>(6).map_err(|e| TdnsError::KeyDb(e.to_string()))? != 0,
        })
    }

    // --- trust store ----------------------------------------------

    pub fn store_trust_record(&self, record: &TrustRecord) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO trust_store \
                 (zone, child, keytag, algorithm, pubkey, trusted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.zone,
                    record.child.key(),
                    record.key_tag,
                    record.algorithm,
                    record.public_key,
                    record.trusted as i64,
                ],
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        self.trust_cache.remove(&record.zone);
        Ok(())
    }

    pub fn delete_trust_record(&self, child: &Name, key_tag: u16) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM trust_store WHERE child = ?1 AND keytag = ?2",
                params![child.key(), key_tag],
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        self.trust_cache.clear();
        Ok(())
    }

    pub fn get_trust_record(&self, child: &Name, key_tag: u16) -> Result<Option<TrustRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT zone, child, keytag, algorithm, pubkey, trusted \
                 FROM trust_store WHERE child = ?1 AND keytag = ?2",
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        let mut rows = stmt
            .query(params![child.key(), key_tag])
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        match rows.next().map_err(|e| TdnsError::KeyDb(e.to_string()))? {
            Some(row) => Ok(Some(Self::trust_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Child SIG(0) trust records for a zone, via the cache.
    pub fn trust_records_for_zone(&self, zone: &str) -> Result<Vec<TrustRecord>> {
        if let Some(hit) = self.trust_cache.get(zone) {
            return Ok(hit.clone());
        }
        let records = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT zone, child, keytag, algorithm, pubkey, trusted \
                     FROM trust_store WHERE zone = ?1",
                )
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut rows = stmt
                .query(params![zone])
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(|e| TdnsError::KeyDb(e.to_string()))? {
                records.push(Self::trust_from_row(row)?);
            }
            records
        };
        self.trust_cache.insert(zone.to_string(), records.clone());
        Ok(records)
    }

    fn trust_from_row(row: &rusqlite::Row<'_>) -> Result<TrustRecord> {
        let child: String = row.get(1).map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        Ok(TrustRecord {
            zone: row.get(0).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            child: Name::parse(&child)?,
            key_tag: row.get(2).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            algorithm: row.get(3).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            public_key: row.get(4).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
            trusted: row.get::<_, i64>(5).map_err(|e| TdnsError::KeyDb(e.to_string()))? != 0,
        })
    }

    // --- DNSSEC keys ----------------------------------------------

    pub fn store_dnssec_key(&self, row: &DnssecKeyRow) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO dnssec_keys \
                 (zone, role, keytag, algorithm, pkcs8, pubkey) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.zone,
                    row.role.as_str(),
                    row.key_tag,
                    row.algorithm,
                    row.pkcs8,
                    row.public_key,
                ],
            )
            .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
        self.dnssec_cache.remove(&row.zone);
        Ok(())
    }

    /// DNSSEC key set for a zone, via the cache.
    pub fn dnssec_keys_for_zone(&self, zone: &str) -> Result<Vec<DnssecKeyRow>> {
        if let Some(hit) = self.dnssec_cache.get(zone) {
            return Ok(hit.clone());
        }
        let keys = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT zone, role, keytag, algorithm, pkcs8, pubkey \
                     FROM dnssec_keys WHERE zone = ?1",
                )
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut rows = stmt
                .query(params![zone])
                .map_err(|e| TdnsError::KeyDb(e.to_string()))?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next().map_err(|e| TdnsError::KeyDb(e.to_string()))? {
                let role: String = row.get(1).map_err(|e| TdnsError::KeyDb(e.to_string()))?;
                keys.push(DnssecKeyRow {
                    zone: row.get(0).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
                    role: KeyRole::parse(&role)
                        .ok_or_else(|| TdnsError::KeyDb(format!("bad key role {}", role)))?,
                    key_tag: row.get(2).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
                    algorithm: row.get(3).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
                    pkcs8: row.get(4).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
                    public_key: row.get(5).map_err(|e| TdnsError::KeyDb(e.to_string()))?,
                });
            }
            keys
        };
        self.dnssec_cache.insert(zone.to_string(), keys.clone());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnssec::{ALG_ED25519, SigningKey};

    fn db() -> KeyDb {
        KeyDb::open_in_memory().unwrap()
    }

    #[test]
    fn test_path_with_dotdot_refused() {
        let err = KeyDb::open(Path::new("/tmp/../etc/keys.db")).unwrap_err();
        assert!(matches!(err, TdnsError::KeyDbPathRefused(_)));
    }

    #[test]
    fn test_single_transaction_tracked_by_context() {
        let db = db();
        db.begin("refresher").unwrap();
        let err = db.begin("updater").unwrap_err();
        assert!(matches!(err, TdnsError::TxAlreadyOpen(ctx) if ctx == "refresher"));
        // Only the holder can finish it
        assert!(db.commit("updater").is_err());
        db.commit("refresher").unwrap();
        db.begin("updater").unwrap();
        db.rollback("updater").unwrap();
    }

    #[test]
    fn test_sig0_key_roundtrip() {
        let db = db();
        let owner = Name::parse("alice.example.com.").unwrap();
        let key = Sig0Key {
            zone: "example.com.".to_string(),
            owner: owner.clone(),
            key_tag: 12345,
            algorithm: ALG_ED25519,
            public_key: vec![7; 32],
            private_key: None,
            trusted: true,
        };
        db.store_sig0_key(&key).unwrap();

        let found = db.find_sig0_key(&owner, 12345).unwrap().unwrap();
        assert!(found.trusted);
        assert_eq!(found.public_key, vec![7; 32]);
        assert!(db.find_sig0_key(&owner, 1).unwrap().is_none());

        let cached = db.sig0_keys_for_zone("example.com.").unwrap();
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn test_trust_store_untrusted_upload() {
        let db = db();
        let child = Name::parse("child.parent.example.").unwrap();
        db.store_trust_record(&TrustRecord {
            zone: "parent.example.".to_string(),
            child: child.clone(),
            key_tag: 999,
            algorithm: ALG_ED25519,
            public_key: vec![1; 32],
            trusted: false,
        })
        .unwrap();

        let record = db.get_trust_record(&child, 999).unwrap().unwrap();
        assert!(!record.trusted);

        let all = db.trust_records_for_zone("parent.example.").unwrap();
        assert_eq!(all.len(), 1);

        db.delete_trust_record(&child, 999).unwrap();
        assert!(db.get_trust_record(&child, 999).unwrap().is_none());
    }

    #[test]
    fn test_dnssec_key_storage() {
        let db = db();
        let signer = Name::parse("example.com.").unwrap();
        let (key, pkcs8) = SigningKey::generate(signer, ALG_ED25519, 257).unwrap();
        db.store_dnssec_key(&DnssecKeyRow {
            zone: "example.com.".to_string(),
            role: KeyRole::Csk,
            key_tag: key.key_tag,
            algorithm: key.algorithm,
            pkcs8,
            public_key: key.public_key.clone(),
        })
        .unwrap();

        let keys = db.dnssec_keys_for_zone("example.com.").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].role, KeyRole::Csk);
        assert_eq!(keys[0].key_tag, key.key_tag);
    }

    #[test]
    fn test_cache_invalidated_on_write() {
        let db = db();
        let owner = Name::parse("alice.example.com.").unwrap();
        assert!(db.sig0_keys_for_zone("example.com.").unwrap().is_empty());
        db.store_sig0_key(&Sig0Key {
            zone: "example.com.".to_string(),
            owner,
            key_tag: 1,
            algorithm: ALG_ED25519,
            public_key: vec![0; 32],
            private_key: None,
            trusted: false,
        })
        .unwrap();
        assert_eq!(db.sig0_keys_for_zone("example.com.").unwrap().len(), 1);
    }
}
