//! The authenticated UPDATE pipeline.
//!
//! One UPDATE moves through six phases: zone admission,
//! classification, SIG(0) validation, trust evaluation, policy
//! approval and finally response + dispatch. The evolving state lives
//! in an [`UpdateStatus`]; no authoritative data is touched until
//! `approved` is true, and the DNS response is always written before
//! the mutation command is dispatched.

pub mod apply;
pub mod policy;
pub mod sig0;

use crate::comms::{DnsUpdateRequest, Shutdown, UpdateCmd, ValidatorRequest};
use crate::dns::enums::{Rcode, RrType};
use crate::dns::name::Name;
use crate::dns::packet::Message;
use crate::dns::record::Record;
use crate::ede::ResponseError;
use crate::error::ErrorKind;
use crate::keydb::{KeyDb, Sig0Key};
use crate::zone::options::ZoneOption;
use crate::zone::registry::ZoneRegistry;
use crate::zone::zone::ZoneState;
use policy::{KeyUploadMode, is_single_key_upload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How an UPDATE is classified after phase 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateClass {
    Zone,
    Child,
    TrustStore,
}

/// One candidate signer found in the additional section.
#[derive(Clone, Debug)]
pub struct SignerEntry {
    pub name: Name,
    pub key_tag: u16,
    pub validated: bool,
    pub trusted: bool,
    /// The key-store row that matched, absent for self-signed uploads.
    pub key: Option<Sig0Key>,
}

/// The evolving record carried through the pipeline.
#[derive(Debug, Default)]
pub struct UpdateStatus {
    pub classification: Option<UpdateClass>,
    pub signers: Vec<SignerEntry>,
    pub validated: bool,
    pub validated_by_trusted_key: bool,
    pub approved: bool,
    /// False when an approval only touches the trust store.
    pub update_zone: bool,
    pub messages: Vec<String>,
}

impl UpdateStatus {
    fn note(&mut self, msg: impl Into<String>) {
        self.messages.push(msg.into());
    }
}

pub struct UpdatePipeline {
    registry: Arc<ZoneRegistry>,
    keydb: Arc<KeyDb>,
    validator: Option<mpsc::Sender<ValidatorRequest>>,
    agent_mode: bool,
}

enum Rejection {
    Catalog(ResponseError),
    Rcode(Rcode, String),
}

impl UpdatePipeline {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        keydb: Arc<KeyDb>,
        validator: Option<mpsc::Sender<ValidatorRequest>>,
        agent_mode: bool,
    ) -> Self {
        Self {
            registry,
            keydb,
            validator,
            agent_mode,
        }
    }

    /// Run one UPDATE through the pipeline. Returns the response to
    /// write and, when approved, exactly one mutation command.
    pub async fn evaluate(&self, msg: &Message) -> (Message, Option<UpdateCmd>) {
        let mut status = UpdateStatus::default();
        match self.run_phases(msg, &mut status).await {
            Ok(cmd) => {
                let mut response = msg.response();
                response.header.rcode = Rcode::NoError.to_u8();
                info!(
                    zone = %msg.zone().map(|q| q.qname.to_string()).unwrap_or_default(),
                    class = ?status.classification,
                    update_zone = status.update_zone,
                    "UPDATE approved"
                );
                (response, Some(cmd))
            }
            Err(rejection) => {
                let mut response = msg.response();
                match rejection {
                    Rejection::Catalog(err) => err.apply(&mut response),
                    Rejection::Rcode(rcode, text) => {
                        response.header.rcode = rcode.to_u8();
                        status.note(text);
                    }
                }
                if status.validated {
                    // Operators diagnosing policy drift want to see
                    // rejected-but-validated updates with their history.
                    info!(
                        rcode = response.header.rcode,
                        trail = ?status.messages,
                        "validated UPDATE rejected"
                    );
                } else {
                    debug!(rcode = response.header.rcode, trail = ?status.messages, "UPDATE rejected");
                }
                (response, None)
            }
        }
    }

    async fn run_phases(
        &self,
        msg: &Message,
        status: &mut UpdateStatus,
    ) -> Result<UpdateCmd, Rejection> {
        // Phase 1: zone admission
        let zone_section = msg
            .zone()
            .ok_or_else(|| Rejection::Rcode(Rcode::FormErr, "no zone section".to_string()))?;
        let zone = self
            .registry
            .find_zone(&zone_section.qname)
            .ok_or(Rejection::Catalog(ResponseError::ZoneNotFound))?;

        if let Some(error) = zone.error() {
            if error.kind != ErrorKind::Refresh {
                status.note(format!("zone in {} state", error.kind));
                return Err(Rejection::Catalog(ResponseError::ZoneError(error.kind)));
            }
        }
        if zone.is_frozen() {
            return Err(Rejection::Catalog(ResponseError::ZoneFrozen));
        }
        if self.agent_mode && zone.name != zone_section.qname {
            // Agent mode only accepts updates for its own identity zone
            return Err(Rejection::Catalog(ResponseError::ZoneNotFound));
        }

        let updates = msg.updates();
        if updates.is_empty() {
            return Err(Rejection::Rcode(
                Rcode::FormErr,
                "empty update section".to_string(),
            ));
        }
        let first_owner = &updates[0].name;
        if *first_owner != zone.name && !first_owner.is_below(&zone.name) {
            return Err(Rejection::Rcode(
                Rcode::NotZone,
                format!("{} outside zone {}", first_owner, zone.name),
            ));
        }

        // Phase 2: classification
        let classification = self.classify(&zone, updates, status)?;
        status.classification = Some(classification);

        // Phase 3: SIG(0) validation
        self.validate_signatures(msg, updates, status)?;

        // Phase 4: trust evaluation
        self.evaluate_trust(status);

        // Phase 5: policy approval; phase 6 dispatch happens in the caller
        self.approve(&zone, updates, classification, status).await
    }

    fn classify(
        &self,
        zone: &ZoneState,
        updates: &[Record],
        status: &mut UpdateStatus,
    ) -> Result<UpdateClass, Rejection> {
        let owner = &updates[0].name;

        if *owner == zone.name {
            if !zone.has_option(ZoneOption::AllowUpdates) {
                return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
            }
            return Ok(UpdateClass::Zone);
        }

        if zone.is_delegation_point(owner) {
            if is_single_key_upload(updates) {
                status.note("single KEY at delegation point, trust-store update");
                return Ok(UpdateClass::TrustStore);
            }
            if !zone.has_option(ZoneOption::AllowChildUpdates) {
                return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
            }
            return Ok(UpdateClass::Child);
        }

        // In-zone but neither apex nor delegation point
        if !zone.has_option(ZoneOption::AllowUpdates) {
            return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
        }
        Ok(UpdateClass::Zone)
    }

    fn validate_signatures(
        &self,
        msg: &Message,
        updates: &[Record],
        status: &mut UpdateStatus,
    ) -> Result<(), Rejection> {
        let sigs = sig0::extract_sigs(msg);
        if sigs.is_empty() {
            return Err(Rejection::Rcode(
                Rcode::Refused,
                "UPDATE carries no SIG(0)".to_string(),
            ));
        }

        let mut any_key_known = false;
        for (_, sig) in &sigs {
            let mut entry = SignerEntry {
                name: sig.signer_name.clone(),
                key_tag: sig.key_tag,
                validated: false,
                trusted: false,
                key: None,
            };

            match self.keydb.find_sig0_key(&sig.signer_name, sig.key_tag) {
                Ok(Some(key)) => {
                    any_key_known = true;
                    match sig0::verify(msg, sig, &key.rdata()) {
                        Ok(()) => {
                            entry.validated = true;
                            entry.trusted = key.trusted;
                            entry.key = Some(key);
                        }
                        Err(e) => status.note(format!("signature by {} failed: {}", sig.signer_name, e)),
                    }
                }
                Ok(None) => {
                    // Self-signed key upload: the verifying key may be the
                    // KEY record inside the update itself.
                    if let Some(candidate) = self.uploaded_key_matching(updates, sig) {
                        if sig0::verify(msg, sig, &candidate).is_ok() {
                            any_key_known = true;
                            entry.validated = true;
                            status.note(format!(
                                "self-signed upload by {} keytag {}",
                                sig.signer_name, sig.key_tag
                            ));
                        }
                    } else {
                        status.note(format!(
                            "no key for {} keytag {}",
                            sig.signer_name, sig.key_tag
                        ));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "key database lookup failed");
                    status.note(format!("key lookup failed: {}", e));
                }
            }
            // Keys living in a zone we serve are implicitly trusted
            if entry.validated && !entry.trusted && self.key_in_served_zone(&entry) {
                entry.trusted = true;
                status.note(format!("{} implicitly trusted (key in served zone)", entry.name));
            }
            status.signers.push(entry);
        }

        status.validated = status.signers.iter().any(|s| s.validated);
        if !status.validated {
            if any_key_known {
                return Err(Rejection::Rcode(
                    Rcode::NotAuth,
                    "SIG(0) did not verify".to_string(),
                ));
            }
            return Err(Rejection::Catalog(ResponseError::Sig0KeyNotKnown));
        }
        Ok(())
    }

    fn uploaded_key_matching(
        &self,
        updates: &[Record],
        sig: &crate::dns::record::SigRdata,
    ) -> Option<crate::dns::record::KeyRdata> {
        if !is_single_key_upload(updates) {
            return None;
        }
        let rr = &updates[0];
        if rr.name != sig.signer_name {
            return None;
        }
        let key = rr.key().ok()?;
        (key.key_tag() == sig.key_tag).then_some(key)
    }

    fn key_in_served_zone(&self, entry: &SignerEntry) -> bool {
        let Some(zone) = self.registry.find_zone(&entry.name) else {
            return false;
        };
        zone.rrset(&entry.name, RrType::Key)
            .map(|rrset| {
                rrset
                    .records
                    .iter()
                    .filter_map(|rr| rr.key().ok())
                    .any(|key| key.key_tag() == entry.key_tag)
            })
            .unwrap_or(false)
    }

    fn evaluate_trust(&self, status: &mut UpdateStatus) {
        status.validated_by_trusted_key = status.signers.iter().any(|s| s.validated && s.trusted);
    }

    /// The signer whose identity the name discipline runs against:
    /// prefer a trusted verifying signer, fall back to any verifying one.
    fn policy_signer(status: &UpdateStatus) -> Option<&SignerEntry> {
        status
            .signers
            .iter()
            .find(|s| s.validated && s.trusted)
            .or_else(|| status.signers.iter().find(|s| s.validated))
    }

    async fn approve(
        &self,
        zone: &ZoneState,
        updates: &[Record],
        classification: UpdateClass,
        status: &mut UpdateStatus,
    ) -> Result<UpdateCmd, Rejection> {
        match classification {
            UpdateClass::Zone => {
                if !status.validated_by_trusted_key {
                    return Err(Rejection::Catalog(ResponseError::Sig0KeyNotTrusted));
                }
                let signer = Self::policy_signer(status).expect("validated signer");
                if let Err(violation) = zone.update_policy.zone.check(&signer.name, updates) {
                    status.note(violation.to_string());
                    return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
                }
                // Deleting the apex SOA would make the zone unservable
                if updates.iter().any(|rr| {
                    rr.name == zone.name
                        && rr.rtype == RrType::Soa
                        && rr.class != crate::dns::enums::RrClass::In
                }) {
                    return Err(Rejection::Catalog(ResponseError::PolicyRefused(
                        "apex SOA may not be deleted".to_string(),
                    )));
                }
                status.approved = true;
                status.update_zone = true;
                Ok(UpdateCmd::ZoneUpdate {
                    zone: zone.name.clone(),
                    updates: updates.to_vec(),
                })
            }

            UpdateClass::Child => {
                // Delegation data under sync management is not mutated
                // through UPDATE; the sync machinery owns it.
                if zone.has_option(ZoneOption::DelegationSyncParent) {
                    return Err(Rejection::Catalog(ResponseError::DelegationSyncUnsupported));
                }
                if !status.validated_by_trusted_key {
                    return self.key_upload_fallback(zone, updates, status).await;
                }
                let signer = Self::policy_signer(status).expect("validated signer");
                if let Err(violation) = zone.update_policy.child.scope.check(&signer.name, updates)
                {
                    status.note(violation.to_string());
                    return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
                }
                status.approved = true;
                status.update_zone = true;
                Ok(UpdateCmd::ChildUpdate {
                    zone: zone.name.clone(),
                    updates: updates.to_vec(),
                })
            }

            UpdateClass::TrustStore => {
                if !is_single_key_upload(updates) {
                    return Err(Rejection::Rcode(
                        Rcode::FormErr,
                        "trust-store update must be a single KEY".to_string(),
                    ));
                }
                if !status.validated_by_trusted_key {
                    return self.key_upload_fallback(zone, updates, status).await;
                }
                // A trusted submitter is still held to the child discipline
                let signer = Self::policy_signer(status).expect("validated signer");
                if let Err(violation) = zone.update_policy.child.scope.check(&signer.name, updates)
                {
                    status.note(violation.to_string());
                    return Err(Rejection::Catalog(ResponseError::UpdatesNotAllowed));
                }
                status.approved = true;
                status.update_zone = false;
                Ok(UpdateCmd::TrustStoreUpdate {
                    zone: zone.name.clone(),
                    child: updates[0].name.clone(),
                    key_rr: updates[0].clone(),
                    trusted: true,
                })
            }
        }
    }

    /// The unvalidated-key-upload rule: an untrusted submitter may
    /// still plant one KEY in the trust store, never in the zone.
    async fn key_upload_fallback(
        &self,
        zone: &ZoneState,
        updates: &[Record],
        status: &mut UpdateStatus,
    ) -> Result<UpdateCmd, Rejection> {
        if !is_single_key_upload(updates) {
            return Err(Rejection::Catalog(ResponseError::Sig0KeyNotTrusted));
        }
        if zone.update_policy.child.bootstrap_includes("strict-manual") {
            status.note("strict-manual bootstrap forbids key upload");
            return Err(Rejection::Catalog(ResponseError::Sig0KeyNotTrusted));
        }

        match zone.update_policy.child.key_upload {
            KeyUploadMode::Unvalidated => {
                status.approved = true;
                status.update_zone = false;
                status.classification = Some(UpdateClass::TrustStore);
                status.note("unvalidated key upload accepted");
                Ok(UpdateCmd::TrustStoreUpdate {
                    zone: zone.name.clone(),
                    child: updates[0].name.clone(),
                    key_rr: updates[0].clone(),
                    trusted: false,
                })
            }
            KeyUploadMode::Validated => {
                let validated = self.ask_validator(&updates[0]).await;
                if !validated {
                    status.note("validator rejected uploaded key");
                    return Err(Rejection::Catalog(ResponseError::Sig0KeyNotTrusted));
                }
                status.approved = true;
                status.update_zone = false;
                status.classification = Some(UpdateClass::TrustStore);
                Ok(UpdateCmd::TrustStoreUpdate {
                    zone: zone.name.clone(),
                    child: updates[0].name.clone(),
                    key_rr: updates[0].clone(),
                    trusted: true,
                })
            }
            KeyUploadMode::Disabled => Err(Rejection::Catalog(ResponseError::Sig0KeyNotTrusted)),
        }
    }

    async fn ask_validator(&self, key_rr: &Record) -> bool {
        let Some(validator) = &self.validator else {
            return false;
        };
        let Ok(key) = key_rr.key() else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        let request = ValidatorRequest {
            owner: key_rr.name.clone(),
            key_tag: key.key_tag(),
            respond: tx,
        };
        if validator.send(request).await.is_err() {
            return false;
        }
        matches!(
            tokio::time::timeout(Duration::from_secs(5), rx).await,
            Ok(Ok(true))
        )
    }
}

/// The pipeline consumer task: reads DNS UPDATE requests, writes the
/// response, then dispatches the mutation command.
pub async fn run_update_pipeline(
    pipeline: UpdatePipeline,
    mut intake: mpsc::Receiver<DnsUpdateRequest>,
    update_cmd: mpsc::Sender<UpdateCmd>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("update pipeline stopping");
                break;
            }
            request = intake.recv() => {
                let Some(request) = request else { break };
                let (response, cmd) = pipeline.evaluate(&request.message).await;
                // Response first, mutation second: the responder never
                // blocks on the zone-update actor.
                match response.serialize() {
                    Ok(wire) => {
                        if let Err(e) = request.writer.write(wire).await {
                            warn!(error = %e, "failed to write UPDATE response");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize UPDATE response"),
                }
                if let Some(cmd) = cmd {
                    let mut dispatch_shutdown = shutdown.subscribe();
                    tokio::select! {
                        _ = dispatch_shutdown.recv() => break,
                        sent = update_cmd.send(cmd) => {
                            if sent.is_err() {
                                warn!("zone-update actor gone, dropping command");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::edns::OPT_CODE_EDE;
    use crate::dns::enums::{Opcode, RrClass};
    use crate::dns::question::Question;
    use crate::dnssec::{ALG_ED25519, SigningKey};
    use crate::update::policy::{ChildPolicy, PolicyType, ScopePolicy, UpdatePolicy};
    use crate::zone::options::ZoneOptionSet;
    use crate::zone::zone::testutil::sample_records;
    use crate::zone::zone::{ZoneRole, ZoneStoreKind};

    fn update_msg(zone: &str, rr: Record) -> Message {
        let mut msg = Message::default();
        msg.header.id = 7;
        msg.header.opcode = Opcode::Update.to_u8();
        msg.questions.push(Question::new(
            Name::parse(zone).unwrap(),
            RrType::Soa,
            RrClass::In,
        ));
        msg.authorities.push(rr);
        msg
    }

    fn a_rr(owner: &str) -> Record {
        Record::new(
            Name::parse(owner).unwrap(),
            RrType::A,
            RrClass::In,
            300,
            vec![192, 0, 2, 1],
        )
    }

    fn policy_self_a() -> UpdatePolicy {
        UpdatePolicy {
            zone: ScopePolicy::new(PolicyType::SelfName, [RrType::A]),
            child: ChildPolicy::default(),
        }
    }

    struct Fixture {
        registry: Arc<ZoneRegistry>,
        keydb: Arc<KeyDb>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(ZoneRegistry::new()),
                keydb: Arc::new(KeyDb::open_in_memory().unwrap()),
            }
        }

        fn add_zone(&self, name: &str, options: &[&str], policy: UpdatePolicy) -> Arc<ZoneState> {
            let apex = Name::parse(name).unwrap();
            let mut zone = ZoneState::new(apex, ZoneStoreKind::Map, ZoneRole::Primary)
                .with_options(
                    ZoneOptionSet::parse(
                        &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    )
                    .unwrap(),
                );
            zone.update_policy = policy;
            let zone = Arc::new(zone);
            zone.load_records(sample_records(name)).unwrap();
            zone.mark_refreshed();
            self.registry.set(zone.clone());
            zone
        }

        fn trusted_key(&self, signer: &str, zone: &str) -> SigningKey {
            let key = SigningKey::generate(Name::parse(signer).unwrap(), ALG_ED25519, 0x0100)
                .unwrap()
                .0;
            self.keydb
                .store_sig0_key(&Sig0Key {
                    zone: zone.to_string(),
                    owner: key.signer.clone(),
                    key_tag: key.key_tag,
                    algorithm: key.algorithm,
                    public_key: key.public_key.clone(),
                    private_key: None,
                    trusted: true,
                })
                .unwrap();
            key
        }

        fn pipeline(&self) -> UpdatePipeline {
            UpdatePipeline::new(self.registry.clone(), self.keydb.clone(), None, false)
        }
    }

    fn ede_code(response: &Message) -> Option<u16> {
        response
            .edns
            .as_ref()
            .and_then(|opt| opt.find_option(OPT_CODE_EDE))
            .map(|opt| u16::from_be_bytes([opt.data[0], opt.data[1]]))
    }

    #[tokio::test]
    async fn test_unknown_zone_refused_with_ede_517() {
        let fixture = Fixture::new();
        let msg = update_msg("unknown.example.", a_rr("www.unknown.example."));
        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert_eq!(ede_code(&response), Some(517));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_frozen_zone_refused_with_ede_516() {
        let fixture = Fixture::new();
        fixture.add_zone(
            "example.net.",
            &["allow-updates", "frozen"],
            policy_self_a(),
        );
        let key = fixture.trusted_key("alice.example.net.", "example.net.");
        let mut msg = update_msg("example.net.", a_rr("alice.example.net."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert_eq!(ede_code(&response), Some(516));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_updates_not_allowed_ede_518() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &[], policy_self_a());
        let key = fixture.trusted_key("alice.example.com.", "example.com.");
        let mut msg = update_msg("example.com.", a_rr("alice.example.com."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert_eq!(ede_code(&response), Some(518));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_trusted_self_update_approved() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &["allow-updates"], policy_self_a());
        let key = fixture.trusted_key("alice.example.com.", "example.com.");
        let mut msg = update_msg("example.com.", a_rr("alice.example.com."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::NoError);
        match cmd {
            Some(UpdateCmd::ZoneUpdate { zone, updates }) => {
                assert_eq!(zone.key(), "example.com.");
                assert_eq!(updates.len(), 1);
            }
            other => panic!("expected zone update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_policy_self_rejects_cross_name() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &["allow-updates"], policy_self_a());
        let key = fixture.trusted_key("alice.example.com.", "example.com.");
        // Alice signs an update for Bob's name
        let mut msg = update_msg("example.com.", a_rr("bob.example.com."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert_eq!(ede_code(&response), Some(518));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_unknown_key_notauth_ede_513() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &["allow-updates"], policy_self_a());
        // Signed with a key the store has never seen, updating an A
        // record (not a key upload, so no self-signed path)
        let key = SigningKey::generate(
            Name::parse("ghost.example.com.").unwrap(),
            ALG_ED25519,
            0x0100,
        )
        .unwrap()
        .0;
        let mut msg = update_msg("example.com.", a_rr("ghost.example.com."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::NotAuth);
        assert_eq!(ede_code(&response), Some(513));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_untrusted_key_notauth_ede_514() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &["allow-updates"], policy_self_a());
        let key = SigningKey::generate(
            Name::parse("carol.example.com.").unwrap(),
            ALG_ED25519,
            0x0100,
        )
        .unwrap()
        .0;
        fixture
            .keydb
            .store_sig0_key(&Sig0Key {
                zone: "example.com.".to_string(),
                owner: key.signer.clone(),
                key_tag: key.key_tag,
                algorithm: key.algorithm,
                public_key: key.public_key.clone(),
                private_key: None,
                trusted: false,
            })
            .unwrap();
        let mut msg = update_msg("example.com.", a_rr("carol.example.com."));
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::NotAuth);
        assert_eq!(ede_code(&response), Some(514));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_unvalidated_key_upload_accepted() {
        let fixture = Fixture::new();
        let policy = UpdatePolicy {
            zone: ScopePolicy::default(),
            child: ChildPolicy {
                scope: ScopePolicy::new(PolicyType::SelfSub, [RrType::Key, RrType::Ns]),
                key_upload: KeyUploadMode::Unvalidated,
                key_bootstrap: vec!["consistent-lookup".to_string()],
            },
        };
        let parent = fixture.add_zone("parent.example.", &["allow-child-updates"], policy);

        // Make child.parent.example. a delegation point
        let child = Name::parse("child.parent.example.").unwrap();
        let mut ns_rdata = Vec::new();
        Name::parse("ns1.child.parent.example.")
            .unwrap()
            .to_wire(&mut ns_rdata);
        parent.add_rr(Record::new(
            child.clone(),
            RrType::Ns,
            RrClass::In,
            3600,
            ns_rdata,
        ));

        // The child self-signs an upload of its own new key
        let (signer, _) = SigningKey::generate(child.clone(), ALG_ED25519, 0x0100).unwrap();
        let key_rr = Record::new(
            child.clone(),
            RrType::Key,
            RrClass::In,
            3600,
            crate::dns::record::KeyRdata {
                flags: 0x0100,
                protocol: 3,
                algorithm: ALG_ED25519,
                public_key: signer.public_key.clone(),
            }
            .to_wire(),
        );
        let mut msg = update_msg("parent.example.", key_rr);
        sig0::sign_message(&mut msg, &signer).unwrap();

        let serial_before = parent.current_serial();
        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::NoError);
        match cmd {
            Some(UpdateCmd::TrustStoreUpdate { child: c, trusted, .. }) => {
                assert_eq!(c, child);
                assert!(!trusted);
            }
            other => panic!("expected trust-store update, got {:?}", other),
        }
        // The zone itself is untouched by a trust-store approval
        assert_eq!(parent.current_serial(), serial_before);
        assert!(parent.rrset(&child, RrType::Key).is_none());
    }

    #[tokio::test]
    async fn test_strict_manual_blocks_key_upload() {
        let fixture = Fixture::new();
        let policy = UpdatePolicy {
            zone: ScopePolicy::default(),
            child: ChildPolicy {
                scope: ScopePolicy::new(PolicyType::SelfSub, [RrType::Key]),
                key_upload: KeyUploadMode::Unvalidated,
                key_bootstrap: vec!["strict-manual".to_string()],
            },
        };
        let parent = fixture.add_zone("parent.example.", &["allow-child-updates"], policy);
        let child = Name::parse("child.parent.example.").unwrap();
        let mut ns_rdata = Vec::new();
        Name::parse("ns1.child.parent.example.")
            .unwrap()
            .to_wire(&mut ns_rdata);
        parent.add_rr(Record::new(
            child.clone(),
            RrType::Ns,
            RrClass::In,
            3600,
            ns_rdata,
        ));

        let (signer, _) = SigningKey::generate(child.clone(), ALG_ED25519, 0x0100).unwrap();
        let key_rr = Record::new(
            child.clone(),
            RrType::Key,
            RrClass::In,
            3600,
            crate::dns::record::KeyRdata {
                flags: 0x0100,
                protocol: 3,
                algorithm: ALG_ED25519,
                public_key: signer.public_key.clone(),
            }
            .to_wire(),
        );
        let mut msg = update_msg("parent.example.", key_rr);
        sig0::sign_message(&mut msg, &signer).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::NotAuth);
        assert_eq!(ede_code(&response), Some(514));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_delegation_sync_zone_rejects_child_update() {
        let fixture = Fixture::new();
        let policy = UpdatePolicy {
            zone: ScopePolicy::default(),
            child: ChildPolicy {
                scope: ScopePolicy::new(PolicyType::SelfSub, [RrType::Ns, RrType::A]),
                key_upload: KeyUploadMode::Disabled,
                key_bootstrap: vec![],
            },
        };
        let parent = fixture.add_zone(
            "parent.example.",
            &["allow-child-updates", "delegation-sync-parent"],
            policy,
        );
        let child = Name::parse("child.parent.example.").unwrap();
        let mut ns_rdata = Vec::new();
        Name::parse("ns1.child.parent.example.")
            .unwrap()
            .to_wire(&mut ns_rdata);
        parent.add_rr(Record::new(
            child.clone(),
            RrType::Ns,
            RrClass::In,
            3600,
            ns_rdata.clone(),
        ));

        let key = fixture.trusted_key("child.parent.example.", "parent.example.");
        let mut msg = update_msg(
            "parent.example.",
            Record::new(child, RrType::Ns, RrClass::In, 3600, ns_rdata),
        );
        sig0::sign_message(&mut msg, &key).unwrap();

        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert_eq!(ede_code(&response), Some(515));
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn test_unsigned_update_refused() {
        let fixture = Fixture::new();
        fixture.add_zone("example.com.", &["allow-updates"], policy_self_a());
        let msg = update_msg("example.com.", a_rr("alice.example.com."));
        let (response, cmd) = fixture.pipeline().evaluate(&msg).await;
        assert_eq!(response.rcode(), Rcode::Refused);
        assert!(cmd.is_none());
    }
}
