//! Session registry.
//!
//! Grants are keyed by the session signer's public key and stored through an
//! injected [`KeyValueStore`] under the `@cartridge/` prefix. Expiry is lazy:
//! every read compares `expires_at` against the [`Clock`], and a stale entry
//! simply reads as absent.

mod clock;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::channel::Origin;
use crate::error::{PolicyError, StorageError};
use crate::gateway::{AccountIdentity, Fee};
use crate::policy::{ContractAddress, Policy, PolicySet, deterministic_hash};
use crate::storage::KeyValueStore;

pub use self::clock::{Clock, ManualClock, SystemClock};

pub const KEY_PREFIX: &str = "@cartridge/";
const ACTIVE_KEY: &str = "@cartridge/active";

fn account_key(address: &ContractAddress) -> String {
    format!("{KEY_PREFIX}account/{address}")
}

/// Public keys are hex felts; storage and tombstones use one spelling.
fn key_id(public_key: &str) -> String {
    public_key.trim().to_ascii_lowercase()
}

fn session_key(public_key: &str) -> String {
    format!("{KEY_PREFIX}session/{}", key_id(public_key))
}

fn policies_key(public_key: &str) -> String {
    format!("{KEY_PREFIX}policies/{}", key_id(public_key))
}

fn signer_key(public_key: &str) -> String {
    format!("{KEY_PREFIX}signer/{}", key_id(public_key))
}

/// A granted session. Never mutated after creation; a new consent replaces
/// it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub public_key: String,
    pub address: ContractAddress,
    pub username: String,
    pub owner_guid: String,
    /// Origin the consent was given to.
    pub origin: Origin,
    /// Fingerprint of the requested policy set.
    pub policy_fingerprint: String,
    pub allowed_policies_root: String,
    /// Authorized scope: the requested policies the user left switched on.
    pub policies: Vec<Policy>,
    /// Unix seconds; the session is dead from this instant on.
    pub expires_at: u64,
    pub session_key_guid: String,
    pub guardian_key_guid: String,
    pub metadata_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee: Option<Fee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    pub created_at: u64,
}

impl Session {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Stored alongside a session so the signer can be matched to its grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerRecord {
    pub public_key: String,
    pub session_key_guid: String,
    pub guardian_key_guid: String,
}

impl From<&Session> for SignerRecord {
    fn from(session: &Session) -> Self {
        Self {
            public_key: session.public_key.clone(),
            session_key_guid: session.session_key_guid.clone(),
            guardian_key_guid: session.guardian_key_guid.clone(),
        }
    }
}

/// What the active pointer currently resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveSession {
    None,
    Expired(Session),
    Live(Session),
}

impl ActiveSession {
    pub fn live(self) -> Option<Session> {
        match self {
            Self::Live(session) => Some(session),
            Self::None | Self::Expired(_) => None,
        }
    }
}

/// GUID of a session signer, derived from its public key.
pub fn session_key_guid(public_key: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"session-key");
    hasher.update(key_id(public_key).as_bytes());
    format!("0x{}", hasher.finalize().to_hex())
}

/// Hash of the session metadata (origin and verification flag).
pub fn metadata_hash(origin: &Origin, verified: bool) -> Result<String, PolicyError> {
    let digest = deterministic_hash(&serde_json::json!({
        "origin": origin,
        "verified": verified,
    }))?;
    Ok(format!("0x{digest}"))
}

pub struct SessionRegistry {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    /// Keys invalidated in this process, mapped to when the revoked grant
    /// would have expired. Until then reads for them return nothing even if
    /// a storage replica still serves the old entry.
    revoked: RwLock<HashMap<String, u64>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            revoked: RwLock::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// The session for `public_key` if it was granted for exactly this
    /// policy fingerprint and has not expired.
    pub async fn lookup(
        &self,
        public_key: &str,
        fingerprint: &str,
    ) -> Result<Option<Session>, StorageError> {
        let Some(session) = self.load(public_key).await? else {
            return Ok(None);
        };
        if session.policy_fingerprint != fingerprint {
            tracing::debug!(public_key, "Stored session covers a different policy set");
            return Ok(None);
        }
        if session.is_expired_at(self.now()) {
            tracing::debug!(public_key, expires_at = session.expires_at, "Stored session expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Resolve the active pointer, distinguishing expired from absent.
    pub async fn active_status(&self) -> Result<ActiveSession, StorageError> {
        let Some(public_key) = self.store.get(ACTIVE_KEY).await? else {
            return Ok(ActiveSession::None);
        };
        match self.load(&public_key).await? {
            None => Ok(ActiveSession::None),
            Some(session) if session.is_expired_at(self.now()) => {
                Ok(ActiveSession::Expired(session))
            }
            Some(session) => Ok(ActiveSession::Live(session)),
        }
    }

    /// The active, unexpired session.
    pub async fn active(&self) -> Result<Option<Session>, StorageError> {
        Ok(self.active_status().await?.live())
    }

    /// Store `session`, replacing any previous grant for its key, and make
    /// it the active session.
    pub async fn insert(&self, session: &Session, requested: &PolicySet) -> Result<(), StorageError> {
        self.revoked.write().await.remove(&key_id(&session.public_key));

        self.write_json(&session_key(&session.public_key), session)
            .await?;
        self.write_json(&policies_key(&session.public_key), &requested.normalize())
            .await?;
        self.write_json(&signer_key(&session.public_key), &SignerRecord::from(session))
            .await?;
        self.store.set(ACTIVE_KEY, &key_id(&session.public_key)).await?;

        tracing::info!(
            public_key = %session.public_key,
            origin = %session.origin,
            expires_at = session.expires_at,
            policies = session.policies.len(),
            "Session stored"
        );
        Ok(())
    }

    /// Forget the grant for `public_key`.
    pub async fn invalidate(&self, public_key: &str) -> Result<(), StorageError> {
        self.revoke(public_key).await?;

        self.store.remove(&session_key(public_key)).await?;
        self.store.remove(&policies_key(public_key)).await?;
        self.store.remove(&signer_key(public_key)).await?;
        if let Some(active) = self.store.get(ACTIVE_KEY).await?
            && key_id(&active) == key_id(public_key)
        {
            self.store.remove(ACTIVE_KEY).await?;
        }
        tracing::info!(public_key, "Session invalidated");
        Ok(())
    }

    /// Remove everything under the keychain prefix. Other keys stay.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let keys = self.store.keys().await?;
        let mut removed = 0usize;
        for key in keys.iter().filter(|k| k.starts_with(KEY_PREFIX)) {
            if let Some(public_key) = key.strip_prefix(&format!("{KEY_PREFIX}session/")) {
                self.revoke(public_key).await?;
            }
            self.store.remove(key).await?;
            removed += 1;
        }
        tracing::info!(removed, "Keychain storage cleared");
        Ok(())
    }

    /// Policies originally requested for `public_key`, before toggles.
    pub async fn requested_policies(&self, public_key: &str) -> Result<Option<PolicySet>, StorageError> {
        if self.is_revoked(public_key).await {
            return Ok(None);
        }
        self.read_json(&policies_key(public_key)).await
    }

    /// Every stored grant, expired ones included.
    pub async fn sessions(&self) -> Result<Vec<Session>, StorageError> {
        let prefix = format!("{KEY_PREFIX}session/");
        let mut keys: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();

        let mut sessions = Vec::new();
        for key in keys {
            if let Some(public_key) = key.strip_prefix(&prefix)
                && let Some(session) = self.load(public_key).await?
            {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    pub async fn save_account(&self, identity: &AccountIdentity) -> Result<(), StorageError> {
        self.write_json(&account_key(&identity.address), identity)
            .await
    }

    pub async fn account(
        &self,
        address: &ContractAddress,
    ) -> Result<Option<AccountIdentity>, StorageError> {
        self.read_json(&account_key(address)).await
    }

    async fn load(&self, public_key: &str) -> Result<Option<Session>, StorageError> {
        if self.is_revoked(public_key).await {
            return Ok(None);
        }
        self.read_json(&session_key(public_key)).await
    }

    /// Tombstone `public_key` until its stored grant would have expired,
    /// dropping tombstones that have outlived their grants.
    async fn revoke(&self, public_key: &str) -> Result<(), StorageError> {
        let until = self
            .read_json::<Session>(&session_key(public_key))
            .await?
            .map_or(u64::MAX, |session| session.expires_at);
        let now = self.now();
        let mut revoked = self.revoked.write().await;
        revoked.retain(|_, expires_at| now < *expires_at);
        revoked.insert(key_id(public_key), until);
        Ok(())
    }

    async fn is_revoked(&self, public_key: &str) -> bool {
        self.revoked
            .read()
            .await
            .get(&key_id(public_key))
            .is_some_and(|expires_at| self.now() < *expires_at)
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring unreadable stored entry");
                Ok(None)
            }
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.store.set(key, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::policy::merkle_root;
    use crate::storage::MemoryStore;

    const GAME: &str = "0xabc";

    fn requested() -> PolicySet {
        PolicySet::new(vec![
            Policy::call(GAME, "move").unwrap(),
            Policy::call(GAME, "attack").unwrap(),
        ])
    }

    fn session(public_key: &str, expires_at: u64) -> Session {
        let requested = requested();
        let policies = requested.authorized_only().policies;
        let origin = Origin::parse("https://game.example").unwrap();
        Session {
            public_key: public_key.to_string(),
            address: ContractAddress::parse("0x123").unwrap(),
            username: "player".to_string(),
            owner_guid: "0x0123".to_string(),
            metadata_hash: metadata_hash(&origin, false).unwrap(),
            origin,
            policy_fingerprint: requested.fingerprint().unwrap(),
            allowed_policies_root: merkle_root(&policies).unwrap(),
            policies,
            expires_at,
            session_key_guid: session_key_guid(public_key),
            guardian_key_guid: "0x0".to_string(),
            max_fee: None,
            transaction_hash: None,
            created_at: 1_000,
        }
    }

    fn registry() -> (SessionRegistry, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = SessionRegistry::new(store.clone(), clock.clone());
        (registry, store, clock)
    }

    #[tokio::test]
    async fn lookup_requires_matching_fingerprint() {
        let (registry, _, _) = registry();
        registry
            .insert(&session("0x5e55", 2_000), &requested())
            .await
            .unwrap();

        let fingerprint = requested().fingerprint().unwrap();
        assert!(registry.lookup("0x5e55", &fingerprint).await.unwrap().is_some());
        assert!(registry.lookup("0x5e55", "other").await.unwrap().is_none());
        assert!(registry.lookup("0xdead", &fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_is_lazy_and_exclusive() {
        let (registry, _, clock) = registry();
        registry
            .insert(&session("0x5e55", 2_000), &requested())
            .await
            .unwrap();
        let fingerprint = requested().fingerprint().unwrap();

        clock.set(1_999);
        assert!(registry.lookup("0x5e55", &fingerprint).await.unwrap().is_some());
        assert!(registry.active().await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(registry.lookup("0x5e55", &fingerprint).await.unwrap().is_none());
        assert!(registry.active().await.unwrap().is_none());
        assert!(matches!(
            registry.active_status().await.unwrap(),
            ActiveSession::Expired(_)
        ));
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_absent() {
        let (registry, store, _) = registry();
        store.set(ACTIVE_KEY, "0x5e55").await.unwrap();
        store
            .set(&session_key("0x5e55"), "{not json")
            .await
            .unwrap();

        assert_eq!(registry.active_status().await.unwrap(), ActiveSession::None);
        assert!(registry.lookup("0x5e55", "fp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_consent_wins() {
        let (registry, _, _) = registry();
        registry
            .insert(&session("0xaaa", 2_000), &requested())
            .await
            .unwrap();
        let mut replacement = session("0xaaa", 5_000);
        replacement.transaction_hash = Some("0x77".to_string());
        registry.insert(&replacement, &requested()).await.unwrap();
        registry
            .insert(&session("0xbbb", 3_000), &requested())
            .await
            .unwrap();

        let fingerprint = requested().fingerprint().unwrap();
        let stored = registry.lookup("0xaaa", &fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, 5_000);
        assert_eq!(stored.transaction_hash.as_deref(), Some("0x77"));
        assert_eq!(registry.active().await.unwrap().unwrap().public_key, "0xbbb");
        assert_eq!(registry.sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalidate_wipes_keychain_entries_but_keeps_features() {
        let (registry, store, _) = registry();
        store.set("features", r#"{"beta":true}"#).await.unwrap();
        let granted = session("0x5e55", 2_000);
        registry.insert(&granted, &requested()).await.unwrap();

        registry.invalidate("0x5e55").await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["features".to_string()]);
        assert_eq!(
            store.get("features").await.unwrap().as_deref(),
            Some(r#"{"beta":true}"#)
        );

        // A replica still serving the old entry does not resurrect it.
        store
            .set(&session_key("0x5e55"), &serde_json::to_string(&granted).unwrap())
            .await
            .unwrap();
        let fingerprint = requested().fingerprint().unwrap();
        assert!(registry.lookup("0x5e55", &fingerprint).await.unwrap().is_none());

        // A fresh consent for the same key lifts the tombstone.
        registry.insert(&granted, &requested()).await.unwrap();
        assert!(registry.lookup("0x5e55", &fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_removes_only_prefixed_keys() {
        let (registry, store, _) = registry();
        store.set("features", "{}").await.unwrap();
        registry
            .insert(&session("0x5e55", 2_000), &requested())
            .await
            .unwrap();
        registry
            .save_account(&AccountIdentity {
                username: "player".to_string(),
                address: ContractAddress::parse("0x123").unwrap(),
                owner_guid: "0x0123".to_string(),
            })
            .await
            .unwrap();

        registry.clear().await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["features".to_string()]);
        assert!(registry.active().await.unwrap().is_none());
        assert!(registry.requested_policies("0x5e55").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn public_key_casing_does_not_split_grants() {
        let (registry, store, _) = registry();
        registry
            .insert(&session("0x5E55AB", 2_000), &requested())
            .await
            .unwrap();

        let fingerprint = requested().fingerprint().unwrap();
        assert!(registry.lookup("0x5e55ab", &fingerprint).await.unwrap().is_some());
        assert!(store.get(&format!("{KEY_PREFIX}session/0x5e55ab")).await.unwrap().is_some());
        assert_eq!(store.get(ACTIVE_KEY).await.unwrap().as_deref(), Some("0x5e55ab"));

        registry.invalidate("0x5e55ab").await.unwrap();
        assert!(registry.lookup("0x5E55AB", &fingerprint).await.unwrap().is_none());
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tombstones_lapse_with_their_grants() {
        let (registry, _, clock) = registry();
        registry
            .insert(&session("0xaaa", 2_000), &requested())
            .await
            .unwrap();
        registry.invalidate("0xaaa").await.unwrap();
        assert!(registry.revoked.read().await.contains_key("0xaaa"));

        clock.set(2_000);
        registry
            .insert(&session("0xbbb", 5_000), &requested())
            .await
            .unwrap();
        registry.invalidate("0xbbb").await.unwrap();

        let revoked = registry.revoked.read().await;
        assert!(!revoked.contains_key("0xaaa"));
        assert_eq!(revoked.get("0xbbb"), Some(&5_000));
        drop(revoked);

        registry
            .insert(&session("0xbbb", 5_000), &requested())
            .await
            .unwrap();
        assert!(registry.revoked.read().await.is_empty());
    }

    #[test]
    fn derived_guids_are_stable_and_distinct() {
        assert_eq!(session_key_guid("0xABC"), session_key_guid("0xabc"));
        assert_ne!(session_key_guid("0xabc"), session_key_guid("0xabd"));
        assert!(session_key_guid("0xabc").starts_with("0x"));
    }
}
