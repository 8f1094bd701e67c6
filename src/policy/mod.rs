//! Session policy model.
//!
//! A [`Policy`] is an allow-rule a session may act on: a contract call
//! `(target, method)` or an off-chain typed-data message scope. A
//! [`PolicySet`] is compared by its normalized form, so ordering, address
//! formatting and duplicates never change its [`fingerprint`](PolicySet::fingerprint).

mod address;
pub mod merkle;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PolicyError;

pub use self::address::ContractAddress;
pub use self::merkle::{merkle_proof, merkle_root, verify_proof};

/// Hash any serializable value into a stable 64-char lowercase hex digest.
pub fn deterministic_hash<T: Serialize>(value: &T) -> Result<String, PolicyError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn stringish<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn optional_stringish<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// SNIP-12 typed-data domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDataDomain {
    pub name: String,
    #[serde(deserialize_with = "stringish")]
    pub version: String,
    #[serde(deserialize_with = "stringish")]
    pub chain_id: String,
    #[serde(
        default,
        deserialize_with = "optional_stringish",
        skip_serializing_if = "Option::is_none"
    )]
    pub revision: Option<String>,
}

/// Permission to invoke `method` on the contract at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPolicy {
    pub target: ContractAddress,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Permission to sign typed-data messages of one domain and primary type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePolicy {
    pub domain: TypedDataDomain,
    pub primary_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Policy {
    Call(CallPolicy),
    TypedData(MessagePolicy),
}

/// Identity of a policy: what two policies must share to be "the same".
///
/// Metadata such as `authorized` and `description` is not part of identity.
/// The derived ordering sorts calls before messages, then by target and
/// method, which is the normalized order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyId {
    Call {
        target: ContractAddress,
        method: String,
    },
    TypedData {
        domain: TypedDataDomain,
        primary_type: String,
    },
}

impl Policy {
    pub fn call(target: &str, method: &str) -> Result<Self, PolicyError> {
        let method = method.trim();
        if method.is_empty() {
            return Err(PolicyError::EmptyMethod);
        }
        Ok(Self::Call(CallPolicy {
            target: ContractAddress::parse(target)?,
            method: method.to_string(),
            authorized: None,
            description: None,
        }))
    }

    pub fn message(domain: TypedDataDomain, primary_type: impl Into<String>) -> Self {
        Self::TypedData(MessagePolicy {
            domain,
            primary_type: primary_type.into(),
            authorized: None,
            description: None,
        })
    }

    pub fn id(&self) -> PolicyId {
        match self {
            Self::Call(call) => PolicyId::Call {
                target: call.target.clone(),
                method: call.method.trim().to_string(),
            },
            Self::TypedData(message) => PolicyId::TypedData {
                domain: message.domain.clone(),
                primary_type: message.primary_type.trim().to_string(),
            },
        }
    }

    /// A policy is granted unless the user explicitly switched it off.
    pub fn is_authorized(&self) -> bool {
        self.authorized() != Some(false)
    }

    pub fn authorized(&self) -> Option<bool> {
        match self {
            Self::Call(call) => call.authorized,
            Self::TypedData(message) => message.authorized,
        }
    }

    pub fn with_authorized(mut self, authorized: bool) -> Self {
        match &mut self {
            Self::Call(call) => call.authorized = Some(authorized),
            Self::TypedData(message) => message.authorized = Some(authorized),
        }
        self
    }

    fn canonical(&self) -> Self {
        let mut policy = self.clone();
        match &mut policy {
            Self::Call(call) => call.method = call.method.trim().to_string(),
            Self::TypedData(message) => {
                message.primary_type = message.primary_type.trim().to_string()
            }
        }
        policy
    }

    /// Human-readable one-liner for consent prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Call(call) => format!("call {} on {}", call.method, call.target.short()),
            Self::TypedData(message) => format!(
                "sign {} messages for {} v{} ({})",
                message.primary_type,
                message.domain.name,
                message.domain.version,
                message.domain.chain_id
            ),
        }
    }
}

/// An order-irrelevant set of policies plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub verified: bool,
}

impl PolicySet {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies,
            verified: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Sort by identity and drop duplicates.
    ///
    /// When duplicates disagree on `authorized`, an explicit `false` wins.
    pub fn normalize(&self) -> PolicySet {
        let mut by_id: BTreeMap<PolicyId, Policy> = BTreeMap::new();
        for policy in &self.policies {
            let policy = policy.canonical();
            match by_id.entry(policy.id()) {
                Entry::Vacant(slot) => {
                    slot.insert(policy);
                }
                Entry::Occupied(mut slot) => {
                    if !policy.is_authorized() {
                        let existing = slot.get().clone();
                        slot.insert(existing.with_authorized(false));
                    }
                }
            }
        }
        PolicySet {
            policies: by_id.into_values().collect(),
            verified: self.verified,
        }
    }

    pub fn ids(&self) -> Vec<PolicyId> {
        self.normalize().policies.iter().map(Policy::id).collect()
    }

    /// Stable content hash of the normalized identities.
    ///
    /// Independent of ordering, duplicates, `authorized` flags and `verified`.
    pub fn fingerprint(&self) -> Result<String, PolicyError> {
        deterministic_hash(&self.ids())
    }

    /// The normalized subset the user left switched on.
    pub fn authorized_only(&self) -> PolicySet {
        let normalized = self.normalize();
        PolicySet {
            policies: normalized
                .policies
                .into_iter()
                .filter(Policy::is_authorized)
                .collect(),
            verified: normalized.verified,
        }
    }

    /// Apply the user's per-policy `authorized` toggles from `edited`.
    ///
    /// Policies absent from `edited` keep their current flag; policies in
    /// `edited` that were never requested are ignored.
    pub fn with_toggles(&self, edited: &PolicySet) -> PolicySet {
        let toggles: BTreeMap<PolicyId, Option<bool>> = edited
            .policies
            .iter()
            .map(|p| (p.id(), p.authorized()))
            .collect();
        let policies = self
            .normalize()
            .policies
            .into_iter()
            .map(|policy| match toggles.get(&policy.id()) {
                Some(Some(flag)) => policy.with_authorized(*flag),
                _ => policy,
            })
            .collect();
        PolicySet {
            policies,
            verified: self.verified,
        }
    }
}

/// Requested policies not covered by `granted`.
///
/// Comparison is by identity; granted policies switched off by the user do
/// not count. The result is normalized. An empty request is always covered.
pub fn diff(requested: &[Policy], granted: &[Policy]) -> Vec<Policy> {
    let granted: BTreeSet<PolicyId> = granted
        .iter()
        .filter(|p| p.is_authorized())
        .map(Policy::id)
        .collect();

    PolicySet::new(requested.to_vec())
        .normalize()
        .policies
        .into_iter()
        .filter(|p| !granted.contains(&p.id()))
        .collect()
}

/// Method entry of the grouped wire form.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodPolicy {
    pub entrypoint: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub authorized: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractPolicy {
    #[serde(default)]
    pub methods: Vec<MethodPolicy>,
}

/// Grouped policy form games send: `{ contracts: { addr: { methods } }, messages }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionPolicies {
    #[serde(default)]
    pub contracts: BTreeMap<ContractAddress, ContractPolicy>,
    #[serde(default)]
    pub messages: Vec<MessagePolicy>,
    #[serde(default)]
    pub verified: bool,
}

impl From<SessionPolicies> for PolicySet {
    fn from(grouped: SessionPolicies) -> Self {
        let mut policies = Vec::new();
        for (target, contract) in grouped.contracts {
            for method in contract.methods {
                policies.push(Policy::Call(CallPolicy {
                    target: target.clone(),
                    method: method.entrypoint,
                    authorized: method.authorized,
                    description: method.description,
                }));
            }
        }
        policies.extend(grouped.messages.into_iter().map(Policy::TypedData));
        PolicySet {
            policies,
            verified: grouped.verified,
        }
    }
}

/// Any of the accepted policy encodings on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PolicyInput {
    List(Vec<Policy>),
    Set(PolicySet),
    Grouped(SessionPolicies),
}

impl Default for PolicyInput {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<PolicyInput> for PolicySet {
    fn from(input: PolicyInput) -> Self {
        match input {
            PolicyInput::List(policies) => PolicySet::new(policies),
            PolicyInput::Set(set) => set,
            PolicyInput::Grouped(grouped) => grouped.into(),
        }
    }
}

/// A single contract invocation in an `execute` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub contract_address: ContractAddress,
    pub entrypoint: String,
    #[serde(default)]
    pub calldata: Vec<String>,
}

impl Call {
    /// The policy a session needs to make this call.
    pub fn required_policy(&self) -> Policy {
        Policy::Call(CallPolicy {
            target: self.contract_address.clone(),
            method: self.entrypoint.trim().to_string(),
            authorized: None,
            description: None,
        })
    }
}

/// An off-chain SNIP-12 message, kept verbatim so signing never alters it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedData(pub serde_json::Value);

impl TypedData {
    /// The message policy a session needs to sign this message.
    pub fn required_policy(&self) -> Result<Policy, PolicyError> {
        let domain = self
            .0
            .get("domain")
            .cloned()
            .ok_or_else(|| PolicyError::InvalidTypedData("missing domain".to_string()))?;
        let domain: TypedDataDomain = serde_json::from_value(domain)
            .map_err(|e| PolicyError::InvalidTypedData(format!("invalid domain: {e}")))?;
        let primary_type = self
            .0
            .get("primaryType")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PolicyError::InvalidTypedData("missing primaryType".to_string()))?;
        Ok(Policy::message(domain, primary_type))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn call(target: &str, method: &str) -> Policy {
        Policy::call(target, method).unwrap()
    }

    fn domain() -> TypedDataDomain {
        TypedDataDomain {
            name: "Dojo".to_string(),
            version: "1".to_string(),
            chain_id: "SN_MAIN".to_string(),
            revision: Some("1".to_string()),
        }
    }

    #[test]
    fn fingerprint_is_order_insensitive() {
        let a = PolicySet::new(vec![
            call("0xAAA", "transfer"),
            call("0xbbb", "mint"),
            Policy::message(domain(), "Move"),
        ]);
        let b = PolicySet::new(vec![
            Policy::message(domain(), "Move"),
            call("0x0bbb", "mint"),
            call("0xaaa", "transfer"),
            call("0xaaa", "transfer"),
        ]);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn fingerprint_ignores_metadata() {
        let plain = PolicySet::new(vec![call("0xaaa", "transfer")]);
        let mut annotated = PolicySet::new(vec![call("0xaaa", " transfer ").with_authorized(false)]);
        annotated.verified = true;
        assert_eq!(
            plain.fingerprint().unwrap(),
            annotated.fingerprint().unwrap()
        );
    }

    #[test]
    fn fingerprint_changes_with_contents() {
        let a = PolicySet::new(vec![call("0xaaa", "transfer")]);
        let b = PolicySet::new(vec![call("0xaaa", "approve")]);
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn normalize_sorts_and_dedupes() {
        let set = PolicySet::new(vec![
            call("0xbbb", "mint"),
            call("0xaaa", "transfer"),
            call("0xAAA", "approve"),
            call("0xaaa", "transfer"),
        ]);
        let ids: Vec<String> = set
            .normalize()
            .policies
            .iter()
            .map(|p| match p {
                Policy::Call(c) => format!("{}:{}", c.target.short(), c.method),
                Policy::TypedData(_) => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["0xaaa:approve", "0xaaa:transfer", "0xbbb:mint"]);
    }

    #[test]
    fn normalize_keeps_explicit_deauthorization() {
        let set = PolicySet::new(vec![
            call("0xaaa", "transfer"),
            call("0xaaa", "transfer").with_authorized(false),
        ]);
        let normalized = set.normalize();
        assert_eq!(normalized.policies.len(), 1);
        assert!(!normalized.policies[0].is_authorized());
        assert!(set.authorized_only().is_empty());
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let granted = vec![call("0xaaa", "transfer"), Policy::message(domain(), "Move")];
        assert!(diff(&granted, &granted).is_empty());
    }

    #[test]
    fn diff_of_subset_is_empty() {
        let granted = vec![call("0xaaa", "transfer"), call("0xbbb", "mint")];
        let requested = vec![call("0x0BBB", "mint")];
        assert!(diff(&requested, &granted).is_empty());
        assert!(diff(&[], &granted).is_empty());
    }

    #[test]
    fn diff_returns_exactly_the_missing_policies() {
        let granted = vec![call("0xaaa", "transfer")];
        let requested = vec![
            call("0xaaa", "transfer"),
            call("0xbbb", "mint"),
            call("0xbbb", "mint"),
        ];
        assert_eq!(diff(&requested, &granted), vec![call("0xbbb", "mint")]);
    }

    #[test]
    fn diff_treats_deauthorized_grants_as_missing() {
        let granted = vec![call("0xaaa", "transfer").with_authorized(false)];
        let requested = vec![call("0xaaa", "transfer")];
        assert_eq!(diff(&requested, &granted), requested);
    }

    #[test]
    fn with_toggles_applies_user_choices() {
        let requested = PolicySet::new(vec![call("0xaaa", "transfer"), call("0xbbb", "mint")]);
        let edited = PolicySet::new(vec![call("0xbbb", "mint").with_authorized(false)]);
        let granted = requested.with_toggles(&edited).authorized_only();
        assert_eq!(granted.policies, vec![call("0xaaa", "transfer")]);
    }

    #[test]
    fn grouped_wire_form_converts_to_set() {
        let input: PolicyInput = serde_json::from_value(json!({
            "contracts": {
                "0xAAA": {
                    "methods": [
                        { "entrypoint": "transfer" },
                        { "entrypoint": "approve", "authorized": false }
                    ]
                }
            },
            "messages": [{
                "domain": { "name": "Dojo", "version": 1, "chainId": "SN_MAIN", "revision": 1 },
                "primaryType": "Move"
            }],
            "verified": true
        }))
        .unwrap();
        let set: PolicySet = input.into();
        assert!(set.verified);
        assert_eq!(set.policies.len(), 3);
        assert_eq!(set.authorized_only().policies.len(), 2);
        assert!(set.policies.contains(&Policy::message(domain(), "Move")));
    }

    #[test]
    fn list_wire_form_parses_calls_and_messages() {
        let input: PolicyInput = serde_json::from_value(json!([
            { "target": "0xaaa", "method": "transfer" },
            {
                "domain": { "name": "Dojo", "version": "1", "chainId": "SN_MAIN", "revision": "1" },
                "primaryType": "Move"
            }
        ]))
        .unwrap();
        let set: PolicySet = input.into();
        assert_eq!(
            set.policies,
            vec![call("0xaaa", "transfer"), Policy::message(domain(), "Move")]
        );
    }

    #[test]
    fn calls_and_messages_map_to_required_policies() {
        let c = Call {
            contract_address: ContractAddress::parse("0xBBB").unwrap(),
            entrypoint: "mint".to_string(),
            calldata: vec!["0x1".to_string()],
        };
        assert_eq!(c.required_policy(), call("0xbbb", "mint"));

        let typed = TypedData(json!({
            "types": {},
            "primaryType": "Move",
            "domain": { "name": "Dojo", "version": "1", "chainId": "SN_MAIN", "revision": "1" },
            "message": { "x": 1 }
        }));
        assert_eq!(
            typed.required_policy().unwrap(),
            Policy::message(domain(), "Move")
        );
        assert!(TypedData(json!({ "message": {} })).required_policy().is_err());
    }
}
