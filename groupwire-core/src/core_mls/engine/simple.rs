//! Reference group engine
//!
//! A compact epoch-secret scheme used to run and test the session layer
//! without a full MLS stack:
//!
//! - Key packages carry an x25519 init key signed with the owner's ed25519 key
//! - Every commit seals a fresh 32-byte commit secret under a key derived
//!   from the current epoch secret; the next epoch secret is
//!   `HKDF(salt = old secret, ikm = commit secret)`
//! - Welcomes are sealed to the candidate's init key (ephemeral x25519 DH,
//!   HKDF-SHA256, ChaCha20-Poly1305)
//! - Application messages are ChaCha20-Poly1305 under a per-epoch key and
//!   signed by the sender
//!
//! It is not RFC 9420: there is no ratchet tree, so a removed member who kept
//! the previous epoch secret can still open the removal commit.

use crate::core_mls::engine::crypto::{
    derive, open, random_secret, seal, LABEL_APPLICATION_KEY, LABEL_COMMIT_KEY,
    LABEL_EPOCH, LABEL_WELCOME_KEY,
};
use crate::core_mls::engine::wire::{
    decode, encode, ApplicationBody, CommitBody, GroupSecrets, InitSecret, KeyPackageBody,
    ServiceSecrets, SignedApplication, SignedCommit, SignedKeyPackage, StoredGroup,
    StoredGroupRef, WelcomeEnvelope, WelcomeSecrets, WIRE_VERSION,
};
use crate::core_mls::errors::{EngineError, EngineResult};
use crate::core_mls::identity::{verify_signature, Identity};
use crate::core_mls::traits::engine::CryptoGroupEngine;
use crate::core_mls::types::{
    unix_timestamp, AddMemberOutput, CommitOutput, DecryptedMessage, GroupId, GroupState,
    KeyPackage, PublicKey,
};
use crate::metrics::{record_counter, Timer};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey as InitPublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const PROTOCOL_VERSION: &str = "1.0";
pub const CIPHERSUITE: &str = "x25519-chacha20poly1305-sha256-ed25519";
pub const CLIENT_NAME: &str = "groupwire";

const DEFAULT_MAX_OUTSTANDING_KEY_PACKAGES: usize = 16;
const DEFAULT_RETAINED_EPOCHS: usize = 4;

pub struct SimpleGroupEngine {
    service: RwLock<ServiceSecrets>,
    max_outstanding: usize,
    retained_epochs: usize,
}

impl SimpleGroupEngine {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_OUTSTANDING_KEY_PACKAGES, DEFAULT_RETAINED_EPOCHS)
    }

    /// # Arguments
    /// * `max_outstanding` - Init keys kept per identity; the oldest are dropped first
    /// * `retained_epochs` - Past epoch secrets kept for late application messages
    pub fn with_limits(max_outstanding: usize, retained_epochs: usize) -> Self {
        Self {
            service: RwLock::new(ServiceSecrets {
                version: WIRE_VERSION,
                ..Default::default()
            }),
            max_outstanding: max_outstanding.max(1),
            retained_epochs,
        }
    }

    /// Number of key packages whose init key is still held
    pub async fn outstanding_key_packages(&self) -> usize {
        self.service.read().await.init_keys.len()
    }

    fn verify_key_package(content: &[u8]) -> EngineResult<KeyPackageBody> {
        let signed: SignedKeyPackage = decode(content, "key package")?;
        if signed.body.version != WIRE_VERSION {
            return Err(EngineError::InvalidMessage(format!(
                "unsupported key package version {}",
                signed.body.version
            )));
        }

        let signed_bytes = encode(&signed.body)?;
        if !verify_signature(&signed.body.owner, &signed_bytes, &signed.signature) {
            return Err(EngineError::VerifyFailed(
                "key package signature invalid".to_string(),
            ));
        }
        Ok(signed.body)
    }

    /// Decode `state.material` and check it agrees with the readable fields
    fn read_secrets(state: &GroupState) -> EngineResult<GroupSecrets> {
        let secrets: GroupSecrets = bincode::deserialize(&state.material)
            .map_err(|e| EngineError::InvalidState(format!("unreadable key material: {}", e)))?;

        let crypto_members: BTreeSet<PublicKey> =
            state.members.difference(&state.local_only).copied().collect();

        if secrets.group_id != state.group_id
            || secrets.epoch != state.epoch
            || secrets.roster != crypto_members
        {
            return Err(EngineError::InvalidState(
                "group state does not match its key material".to_string(),
            ));
        }
        Ok(secrets)
    }

    fn project(secrets: &GroupSecrets, local_only: &BTreeSet<PublicKey>) -> EngineResult<GroupState> {
        let local_only: BTreeSet<PublicKey> =
            local_only.difference(&secrets.roster).copied().collect();
        let members = secrets.roster.union(&local_only).copied().collect();

        Ok(GroupState {
            group_id: secrets.group_id.clone(),
            name: secrets.name.clone(),
            epoch: secrets.epoch,
            members,
            local_only,
            material: encode(secrets)?,
        })
    }

    fn epoch_context(group_id: &GroupId, epoch: u64) -> Vec<u8> {
        let mut context = group_id.as_bytes().to_vec();
        context.extend_from_slice(&epoch.to_be_bytes());
        context
    }

    fn commit_aad(
        group_id: &GroupId,
        from_epoch: u64,
        committer: &PublicKey,
        added: &[PublicKey],
        removed: &[PublicKey],
    ) -> EngineResult<Vec<u8>> {
        encode(&(group_id, from_epoch, committer, added, removed))
    }

    /// Next epoch's secrets after applying a membership change
    fn advance(
        &self,
        current: &GroupSecrets,
        commit_secret: &[u8; 32],
        added: &[PublicKey],
        removed: &[PublicKey],
    ) -> EngineResult<GroupSecrets> {
        let next_epoch = current.epoch + 1;
        let next_secret = derive(
            commit_secret,
            Some(current.epoch_secret.as_slice()),
            LABEL_EPOCH,
            &Self::epoch_context(&current.group_id, next_epoch),
        )?;

        let mut roster = current.roster.clone();
        roster.extend(added.iter().copied());
        for member in removed {
            roster.remove(member);
        }

        let mut retained = current.retained.clone();
        retained.push((current.epoch, current.epoch_secret));
        let excess = retained.len().saturating_sub(self.retained_epochs);
        retained.drain(..excess);

        Ok(GroupSecrets {
            version: WIRE_VERSION,
            group_id: current.group_id.clone(),
            name: current.name.clone(),
            epoch: next_epoch,
            roster,
            epoch_secret: *next_secret,
            retained,
        })
    }

    /// Author a commit as `identity`
    fn build_commit(
        &self,
        identity: &Identity,
        current: &GroupSecrets,
        added: Vec<PublicKey>,
        removed: Vec<PublicKey>,
    ) -> EngineResult<(GroupSecrets, Vec<u8>)> {
        let committer = identity.public_key();
        if !current.roster.contains(&committer) {
            return Err(EngineError::InvalidState(
                "local identity is not a member of this group".to_string(),
            ));
        }

        let commit_secret = random_secret();
        let sealing_key = derive(
            &current.epoch_secret,
            None,
            LABEL_COMMIT_KEY,
            &Self::epoch_context(&current.group_id, current.epoch),
        )?;
        let aad = Self::commit_aad(&current.group_id, current.epoch, &committer, &added, &removed)?;
        let (nonce, sealed_secret) = seal(&sealing_key, &aad, commit_secret.as_ref())?;

        let next = self.advance(current, &commit_secret, &added, &removed)?;

        let body = CommitBody {
            version: WIRE_VERSION,
            group_id: current.group_id.clone(),
            from_epoch: current.epoch,
            committer,
            added,
            removed,
            nonce,
            sealed_secret,
        };
        let signature = identity.sign(&encode(&body)?);
        let commit = encode(&SignedCommit { body, signature })?;

        record_counter("engine.commits.created", 1);
        Ok((next, commit))
    }

    fn seal_welcome(
        package: &KeyPackageBody,
        secrets: &WelcomeSecrets,
    ) -> EngineResult<Vec<u8>> {
        let ephemeral = StaticSecret::from(*random_secret());
        let ephemeral_key = InitPublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&InitPublicKey::from(package.init_key));

        let key = derive(
            shared.as_bytes(),
            None,
            LABEL_WELCOME_KEY,
            &Self::welcome_context(&package.package_id, &ephemeral_key, &package.init_key),
        )?;

        let plaintext = Zeroizing::new(encode(secrets)?);
        let (nonce, ciphertext) = seal(&key, &package.package_id, &plaintext)?;

        encode(&WelcomeEnvelope {
            version: WIRE_VERSION,
            package_id: package.package_id,
            ephemeral_key,
            nonce,
            ciphertext,
        })
    }

    fn welcome_context(package_id: &[u8; 16], ephemeral_key: &[u8; 32], init_key: &[u8; 32]) -> Vec<u8> {
        let mut context = Vec::with_capacity(16 + 32 + 32);
        context.extend_from_slice(package_id);
        context.extend_from_slice(ephemeral_key);
        context.extend_from_slice(init_key);
        context
    }
}

impl Default for SimpleGroupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CryptoGroupEngine for SimpleGroupEngine {
    async fn generate_key_package(&self, identity: &Identity) -> EngineResult<KeyPackage> {
        let owner = identity.public_key();
        let init_secret = random_secret();
        let init_key = InitPublicKey::from(&StaticSecret::from(*init_secret)).to_bytes();
        let package_id = *uuid::Uuid::new_v4().as_bytes();
        let created_at = unix_timestamp();

        let body = KeyPackageBody {
            version: WIRE_VERSION,
            owner,
            init_key,
            package_id,
            created_at,
        };
        let signature = identity.sign(&encode(&body)?);
        let content = encode(&SignedKeyPackage { body, signature })?;

        {
            let mut service = self.service.write().await;
            service.init_keys.insert(
                hex::encode(package_id),
                InitSecret {
                    owner,
                    created_at,
                    secret: *init_secret,
                },
            );

            let mut owned: Vec<(u64, String)> = service
                .init_keys
                .iter()
                .filter(|(_, init)| init.owner == owner)
                .map(|(id, init)| (init.created_at, id.clone()))
                .collect();
            if owned.len() > self.max_outstanding {
                owned.sort();
                let excess = owned.len() - self.max_outstanding;
                for (_, id) in owned.into_iter().filter(|(_, id)| *id != hex::encode(package_id)).take(excess) {
                    service.init_keys.remove(&id);
                }
            }
        }

        debug!(owner = %owner.short(), package_id = %hex::encode(package_id), "generated key package");

        Ok(KeyPackage {
            content,
            tags: vec![
                ("mls_protocol_version".to_string(), vec![PROTOCOL_VERSION.to_string()]),
                ("ciphersuite".to_string(), vec![CIPHERSUITE.to_string()]),
                ("client".to_string(), vec![CLIENT_NAME.to_string()]),
            ],
        })
    }

    fn validate_key_package(&self, content: &[u8]) -> EngineResult<PublicKey> {
        Self::verify_key_package(content).map(|body| body.owner)
    }

    async fn create_group(&self, identity: &Identity, name: &str) -> EngineResult<GroupState> {
        let epoch_secret = random_secret();
        let secrets = GroupSecrets {
            version: WIRE_VERSION,
            group_id: GroupId::random(),
            name: name.to_string(),
            epoch: 0,
            roster: [identity.public_key()].into_iter().collect(),
            epoch_secret: *epoch_secret,
            retained: Vec::new(),
        };

        info!(group_id = %secrets.group_id, name, "group created");
        Self::project(&secrets, &BTreeSet::new())
    }

    async fn add_member(
        &self,
        identity: &Identity,
        state: &GroupState,
        key_package: &[u8],
    ) -> EngineResult<AddMemberOutput> {
        let package = Self::verify_key_package(key_package)?;
        let current = Self::read_secrets(state)?;
        if current.roster.contains(&package.owner) {
            return Err(EngineError::AlreadyMember(package.owner));
        }

        let (next, commit) = self.build_commit(identity, &current, vec![package.owner], Vec::new())?;

        let welcome_secrets = WelcomeSecrets {
            group_id: next.group_id.clone(),
            name: next.name.clone(),
            epoch: next.epoch,
            roster: next.roster.clone(),
            inviter: identity.public_key(),
            epoch_secret: next.epoch_secret,
        };
        let welcome = Self::seal_welcome(&package, &welcome_secrets)?;

        debug!(
            group_id = %next.group_id,
            member = %package.owner.short(),
            epoch = next.epoch,
            "add-member commit created"
        );

        Ok(AddMemberOutput {
            state: Self::project(&next, &state.local_only)?,
            commit,
            welcome,
        })
    }

    async fn remove_member(
        &self,
        identity: &Identity,
        state: &GroupState,
        member: &PublicKey,
    ) -> EngineResult<CommitOutput> {
        let current = Self::read_secrets(state)?;
        if !current.roster.contains(member) {
            return Err(EngineError::MemberNotFound(*member));
        }

        let (next, commit) = self.build_commit(identity, &current, Vec::new(), vec![*member])?;
        Ok(CommitOutput {
            state: Self::project(&next, &state.local_only)?,
            commit,
        })
    }

    async fn self_update(&self, identity: &Identity, state: &GroupState) -> EngineResult<CommitOutput> {
        let current = Self::read_secrets(state)?;
        let (next, commit) = self.build_commit(identity, &current, Vec::new(), Vec::new())?;
        Ok(CommitOutput {
            state: Self::project(&next, &state.local_only)?,
            commit,
        })
    }

    async fn process_welcome(
        &self,
        identity: &Identity,
        welcome: &[u8],
        wrapper_id: &str,
    ) -> EngineResult<GroupState> {
        let _timer = Timer::new("engine.welcome.duration_ms");
        let envelope: WelcomeEnvelope = decode(welcome, "welcome")?;
        if envelope.version != WIRE_VERSION {
            return Err(EngineError::InvalidMessage(format!(
                "unsupported welcome version {}",
                envelope.version
            )));
        }

        let package_hex = hex::encode(envelope.package_id);
        let init = {
            let service = self.service.read().await;
            service.init_keys.get(&package_hex).cloned()
        };
        let init = match init {
            Some(init) if init.owner == identity.public_key() => init,
            _ => return Err(EngineError::UnknownKeyPackage(package_hex)),
        };

        let init_secret = StaticSecret::from(init.secret);
        let init_key = InitPublicKey::from(&init_secret).to_bytes();
        let shared = init_secret.diffie_hellman(&InitPublicKey::from(envelope.ephemeral_key));
        let key = derive(
            shared.as_bytes(),
            None,
            LABEL_WELCOME_KEY,
            &Self::welcome_context(&envelope.package_id, &envelope.ephemeral_key, &init_key),
        )?;

        let plaintext = Zeroizing::new(open(
            &key,
            &envelope.nonce,
            &envelope.package_id,
            &envelope.ciphertext,
        )?);
        let secrets: WelcomeSecrets = decode(&plaintext, "welcome secrets")?;

        if !secrets.roster.contains(&identity.public_key()) {
            return Err(EngineError::InvalidMessage(
                "welcome roster does not include the recipient".to_string(),
            ));
        }
        if !secrets.roster.contains(&secrets.inviter) {
            return Err(EngineError::InvalidMessage(
                "welcome inviter is not a member".to_string(),
            ));
        }

        let group = GroupSecrets {
            version: WIRE_VERSION,
            group_id: secrets.group_id.clone(),
            name: secrets.name.clone(),
            epoch: secrets.epoch,
            roster: secrets.roster.clone(),
            epoch_secret: secrets.epoch_secret,
            retained: Vec::new(),
        };

        debug!(
            group_id = %group.group_id,
            epoch = group.epoch,
            wrapper_id,
            inviter = %secrets.inviter.short(),
            "welcome opened"
        );
        record_counter("engine.welcomes.processed", 1);
        Self::project(&group, &BTreeSet::new())
    }

    async fn process_commit(&self, state: &GroupState, commit: &[u8]) -> EngineResult<GroupState> {
        let current = Self::read_secrets(state)?;
        let signed: SignedCommit = decode(commit, "commit")?;
        let body = &signed.body;

        if body.version != WIRE_VERSION {
            return Err(EngineError::InvalidMessage(format!(
                "unsupported commit version {}",
                body.version
            )));
        }
        if body.group_id != current.group_id {
            return Err(EngineError::WrongGroup);
        }
        if body.from_epoch != current.epoch {
            return Err(EngineError::EpochMismatch {
                expected: current.epoch,
                actual: body.from_epoch,
            });
        }
        if !current.roster.contains(&body.committer) {
            return Err(EngineError::VerifyFailed(
                "committer is not a member".to_string(),
            ));
        }
        if !verify_signature(&body.committer, &encode(body)?, &signed.signature) {
            return Err(EngineError::VerifyFailed("commit signature invalid".to_string()));
        }

        let added: BTreeSet<PublicKey> = body.added.iter().copied().collect();
        let removed: BTreeSet<PublicKey> = body.removed.iter().copied().collect();
        if added.len() != body.added.len()
            || removed.len() != body.removed.len()
            || added.iter().any(|member| current.roster.contains(member))
            || removed.iter().any(|member| !current.roster.contains(member))
        {
            return Err(EngineError::InvalidMessage(
                "commit membership changes are inconsistent with the roster".to_string(),
            ));
        }

        let sealing_key = derive(
            &current.epoch_secret,
            None,
            LABEL_COMMIT_KEY,
            &Self::epoch_context(&current.group_id, current.epoch),
        )?;
        let aad = Self::commit_aad(
            &body.group_id,
            body.from_epoch,
            &body.committer,
            &body.added,
            &body.removed,
        )?;
        let opened = Zeroizing::new(open(&sealing_key, &body.nonce, &aad, &body.sealed_secret)?);
        let commit_secret: Zeroizing<[u8; 32]> = Zeroizing::new(
            opened
                .as_slice()
                .try_into()
                .map_err(|_| EngineError::InvalidMessage("commit secret has wrong length".to_string()))?,
        );

        let next = self.advance(&current, &commit_secret, &body.added, &body.removed)?;
        debug!(
            group_id = %next.group_id,
            epoch = next.epoch,
            committer = %body.committer.short(),
            added = body.added.len(),
            removed = body.removed.len(),
            "commit applied"
        );
        record_counter("engine.commits.processed", 1);
        Self::project(&next, &state.local_only)
    }

    async fn encrypt(
        &self,
        identity: &Identity,
        state: &GroupState,
        plaintext: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let _timer = Timer::new("engine.encrypt.duration_ms");
        let secrets = Self::read_secrets(state)?;
        let sender = identity.public_key();
        if !secrets.roster.contains(&sender) {
            return Err(EngineError::InvalidState(
                "local identity is not a member of this group".to_string(),
            ));
        }

        let key = derive(
            &secrets.epoch_secret,
            None,
            LABEL_APPLICATION_KEY,
            &Self::epoch_context(&secrets.group_id, secrets.epoch),
        )?;
        let aad = encode(&(&secrets.group_id, secrets.epoch, &sender))?;
        let (nonce, ciphertext) = seal(&key, &aad, plaintext)?;

        let body = ApplicationBody {
            version: WIRE_VERSION,
            group_id: secrets.group_id.clone(),
            epoch: secrets.epoch,
            sender,
            nonce,
            ciphertext,
        };
        let signature = identity.sign(&encode(&body)?);
        record_counter("engine.messages.encrypted", 1);
        encode(&SignedApplication { body, signature })
    }

    async fn decrypt(&self, state: &GroupState, ciphertext: &[u8]) -> EngineResult<DecryptedMessage> {
        let _timer = Timer::new("engine.decrypt.duration_ms");
        let secrets = Self::read_secrets(state)?;
        let signed: SignedApplication = decode(ciphertext, "application message")?;
        let body = &signed.body;

        if body.version != WIRE_VERSION {
            return Err(EngineError::InvalidMessage(format!(
                "unsupported message version {}",
                body.version
            )));
        }
        if body.group_id != secrets.group_id {
            return Err(EngineError::WrongGroup);
        }
        let epoch_secret = secrets
            .secret_for_epoch(body.epoch)
            .ok_or(EngineError::EpochUnavailable(body.epoch))?;
        if body.epoch == secrets.epoch && !secrets.roster.contains(&body.sender) {
            return Err(EngineError::VerifyFailed("sender is not a member".to_string()));
        }
        if !verify_signature(&body.sender, &encode(body)?, &signed.signature) {
            return Err(EngineError::VerifyFailed("message signature invalid".to_string()));
        }

        let key = derive(
            epoch_secret,
            None,
            LABEL_APPLICATION_KEY,
            &Self::epoch_context(&body.group_id, body.epoch),
        )?;
        let aad = encode(&(&body.group_id, body.epoch, &body.sender))?;
        let plaintext = open(&key, &body.nonce, &aad, &body.ciphertext)?;

        record_counter("engine.messages.decrypted", 1);
        Ok(DecryptedMessage {
            sender: body.sender,
            plaintext,
            epoch: body.epoch,
        })
    }

    fn export_state(&self, state: &GroupState) -> EngineResult<Vec<u8>> {
        encode(&StoredGroupRef {
            version: WIRE_VERSION,
            state,
        })
    }

    fn import_state(&self, bytes: &[u8]) -> EngineResult<GroupState> {
        let stored: StoredGroup = bincode::deserialize(bytes)
            .map_err(|e| EngineError::InvalidState(format!("unreadable group snapshot: {}", e)))?;
        if stored.version != WIRE_VERSION {
            return Err(EngineError::InvalidState(format!(
                "unsupported snapshot version {}",
                stored.version
            )));
        }

        Self::read_secrets(&stored.state)?;
        Ok(stored.state)
    }

    async fn export_service_state(&self) -> EngineResult<Vec<u8>> {
        let service = self.service.read().await;
        encode(&*service)
    }

    async fn import_service_state(&self, bytes: &[u8]) -> EngineResult<()> {
        let imported: ServiceSecrets = bincode::deserialize(bytes)
            .map_err(|e| EngineError::InvalidState(format!("unreadable service state: {}", e)))?;
        if imported.version != WIRE_VERSION {
            return Err(EngineError::InvalidState(format!(
                "unsupported service state version {}",
                imported.version
            )));
        }

        let count = imported.init_keys.len();
        *self.service.write().await = imported;
        debug!(init_keys = count, "service state imported");
        Ok(())
    }

    async fn clear_service_state(&self) {
        let mut service = self.service.write().await;
        let dropped = service.init_keys.len();
        service.init_keys.clear();
        if dropped > 0 {
            warn!(init_keys = dropped, "discarded outstanding key package secrets");
        }
    }
}
