//! Type definitions shared by the group engine, the stores and the session layer

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a textual key or identifier was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("expected 64 hex characters, got {0}")]
    InvalidLength(usize),

    #[error("not a hex string")]
    InvalidHex,
}

/// A member's long-term public key (ed25519, 32 bytes).
///
/// The canonical text form is 64 lowercase hex characters. Parsing trims
/// surrounding whitespace and accepts upper case input.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse any accepted textual form into the canonical key.
    pub fn parse(input: &str) -> Result<Self, KeyParseError> {
        let normalized = input.trim().to_ascii_lowercase();
        if normalized.len() != 64 {
            return Err(KeyParseError::InvalidLength(normalized.len()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&normalized, &mut bytes).map_err(|_| KeyParseError::InvalidHex)?;
        Ok(Self(bytes))
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for PublicKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        PublicKey::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Group identifier (opaque bytes, 32 for groups created locally)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generate a random group ID
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.trim()).map(Self::new)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "GroupId({})", &hex[..hex.len().min(12)])
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for GroupId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GroupId::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Local view of one group.
///
/// `members` is the full membership as seen locally, including members that
/// were added through the local-only fallback (those are also listed in
/// `local_only` and hold no key material). `material` is owned by the engine
/// and never interpreted outside it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub group_id: GroupId,
    pub name: String,
    pub epoch: u64,
    pub members: BTreeSet<PublicKey>,
    pub local_only: BTreeSet<PublicKey>,
    pub material: Vec<u8>,
}

impl GroupState {
    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.contains(key)
    }

    /// Member that went through a cryptographic join (not local-only)
    pub fn is_crypto_member(&self, key: &PublicKey) -> bool {
        self.members.contains(key) && !self.local_only.contains(key)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl fmt::Debug for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupState")
            .field("group_id", &self.group_id)
            .field("name", &self.name)
            .field("epoch", &self.epoch)
            .field("members", &self.members)
            .field("local_only", &self.local_only)
            .field("material_len", &self.material.len())
            .finish()
    }
}

/// Published credential that lets others invite its owner.
///
/// `content` is the engine's encoding; `tags` are ordered (name, values)
/// pairs carried next to it on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackage {
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    pub tags: Vec<(String, Vec<String>)>,
}

impl KeyPackage {
    /// Values of the first tag with this name
    pub fn tag(&self, name: &str) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|(tag, _)| tag == name)
            .map(|(_, values)| values.as_slice())
    }

    /// JSON form `{"content": "<hex>", "tags": [[name, [values..]], ..]}`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Plaintext recovered from an application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub sender: PublicKey,
    pub plaintext: Vec<u8>,
    pub epoch: u64,
}

/// Result of a commit the local member authored
#[derive(Debug, Clone)]
pub struct CommitOutput {
    pub state: GroupState,
    pub commit: Vec<u8>,
}

/// Result of adding a member: the commit for existing members plus the
/// welcome for the new one
#[derive(Debug, Clone)]
pub struct AddMemberOutput {
    pub state: GroupState,
    pub commit: Vec<u8>,
    pub welcome: Vec<u8>,
}

/// Seconds since the Unix epoch (0 if the clock is before it)
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_public_key_normalization() {
        let upper = format!("  {}  ", "AB".repeat(32));
        let key = PublicKey::parse(&upper).unwrap();
        assert_eq!(key.to_hex(), "ab".repeat(32));
        assert_eq!(key.short(), "abababab");
    }

    #[test]
    fn test_public_key_rejects_malformed() {
        assert_eq!(
            PublicKey::parse("abc"),
            Err(KeyParseError::InvalidLength(3))
        );
        assert_eq!(
            PublicKey::parse(&"zz".repeat(32)),
            Err(KeyParseError::InvalidHex)
        );
        assert!(PublicKey::parse("").is_err());
    }

    #[test]
    fn test_group_id_hex() {
        let id = GroupId::random();
        assert_eq!(id.as_bytes().len(), 32);
        assert_eq!(GroupId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_group_state_json_uses_hex() {
        let member = PublicKey::from_bytes([7u8; 32]);
        let state = GroupState {
            group_id: GroupId::new(vec![1, 2, 3]),
            name: "Test".to_string(),
            epoch: 4,
            members: [member].into_iter().collect(),
            local_only: BTreeSet::new(),
            material: vec![9, 9],
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"010203\""));
        assert!(json.contains(&member.to_hex()));

        let back: GroupState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_key_package_tag_lookup() {
        let package = KeyPackage {
            content: vec![0xde, 0xad],
            tags: vec![
                ("mls_protocol_version".to_string(), vec!["1.0".to_string()]),
                ("relays".to_string(), vec!["wss://a".to_string(), "wss://b".to_string()]),
            ],
        };

        assert_eq!(package.tag("relays").map(|v| v.len()), Some(2));
        assert!(package.tag("missing").is_none());
        assert!(package.to_json().unwrap().contains("\"dead\""));
    }

    proptest! {
        #[test]
        fn prop_public_key_parse_is_case_and_space_insensitive(bytes in any::<[u8; 32]>(), pad in 0usize..4) {
            let key = PublicKey::from_bytes(bytes);
            let noisy = format!("{}{}{}", " ".repeat(pad), key.to_hex().to_uppercase(), "\t".repeat(pad));
            prop_assert_eq!(PublicKey::parse(&noisy).unwrap(), key);
        }
    }
}
