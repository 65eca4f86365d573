//! Group Engine Trait
//!
//! Opaque capability performing all group keying math. The session layer
//! hands it serialized state and gets new state back; it never reaches into
//! the engine's material.

use crate::core_mls::errors::EngineResult;
use crate::core_mls::identity::Identity;
use crate::core_mls::types::{
    AddMemberOutput, CommitOutput, DecryptedMessage, GroupState, KeyPackage, PublicKey,
};
use async_trait::async_trait;

/// Key agreement engine
///
/// Implementations must ensure:
/// - Transitions are all-or-nothing: on error nothing changed and the
///   caller keeps its input state
/// - `decrypt` is a pure function of (state, ciphertext)
/// - `local_only` members of the input state are carried into the output
///   state, minus any that became cryptographic members
#[async_trait]
pub trait CryptoGroupEngine: Send + Sync {
    /// Produce a new key package for `identity` and remember its private
    /// init material as part of the service state.
    ///
    /// # Returns
    /// The package with the engine's own tags (protocol version, ciphersuite)
    async fn generate_key_package(&self, identity: &Identity) -> EngineResult<KeyPackage>;

    /// Structural and signature validation of a fetched key package.
    ///
    /// # Returns
    /// The public key of the package owner
    fn validate_key_package(&self, content: &[u8]) -> EngineResult<PublicKey>;

    /// Create a group whose only member is `identity`, at epoch 0.
    async fn create_group(&self, identity: &Identity, name: &str) -> EngineResult<GroupState>;

    /// Add the owner of `key_package` to the group.
    ///
    /// # Arguments
    /// * `identity` - The committer (must be a member)
    /// * `state` - Current local state
    /// * `key_package` - Content bytes of the candidate's key package
    ///
    /// # Returns
    /// The state at `epoch + 1`, the commit for existing members and the
    /// welcome for the new member
    async fn add_member(
        &self,
        identity: &Identity,
        state: &GroupState,
        key_package: &[u8],
    ) -> EngineResult<AddMemberOutput>;

    /// Remove a cryptographic member, advancing the epoch.
    async fn remove_member(
        &self,
        identity: &Identity,
        state: &GroupState,
        member: &PublicKey,
    ) -> EngineResult<CommitOutput>;

    /// Rotate the group secret without membership changes.
    async fn self_update(&self, identity: &Identity, state: &GroupState)
        -> EngineResult<CommitOutput>;

    /// Derive group state from a welcome addressed to `identity`.
    ///
    /// # Arguments
    /// * `wrapper_id` - Transport id of the event carrying the welcome
    async fn process_welcome(
        &self,
        identity: &Identity,
        welcome: &[u8],
        wrapper_id: &str,
    ) -> EngineResult<GroupState>;

    /// Apply a commit authored by another member.
    async fn process_commit(&self, state: &GroupState, commit: &[u8]) -> EngineResult<GroupState>;

    /// Encrypt an application message as `identity`.
    async fn encrypt(
        &self,
        identity: &Identity,
        state: &GroupState,
        plaintext: &[u8],
    ) -> EngineResult<Vec<u8>>;

    /// Decrypt an application message.
    async fn decrypt(&self, state: &GroupState, ciphertext: &[u8]) -> EngineResult<DecryptedMessage>;

    /// Serialize a group state for the snapshot store
    fn export_state(&self, state: &GroupState) -> EngineResult<Vec<u8>>;

    /// Inverse of `export_state`, rejecting corrupt snapshots
    fn import_state(&self, bytes: &[u8]) -> EngineResult<GroupState>;

    /// Serialize identity-level material (outstanding key packages)
    async fn export_service_state(&self) -> EngineResult<Vec<u8>>;

    /// Replace identity-level material with a previous export
    async fn import_service_state(&self, bytes: &[u8]) -> EngineResult<()>;

    /// Forget identity-level material (logout)
    async fn clear_service_state(&self);
}
