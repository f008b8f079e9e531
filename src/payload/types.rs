/// Block payload types for RelayChain
use crate::crypto::{sha256_hex, NodeIdentity, SignatureScheme};
use crate::error::ChainError;
use crate::keyring::Keyring;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type tag of the heartbeat payload.
pub const EMPTY_TYPE: &str = "Empty";

/// Envelope shared by every payload that can carry a signature.
///
/// Variant specific fields are kept in `extra`. `serde_json::Map` keeps its keys
/// sorted, so serializing a `Signable` always yields canonical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signable {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Signable {
    pub fn new(kind: &str, data: String) -> Self {
        Signable {
            kind: kind.to_string(),
            data,
            sign: String::new(),
            pubkey: String::new(),
            extra: Map::new(),
        }
    }

    /// Heartbeat payload used by idle block generation.
    pub fn empty() -> Self {
        Self::new(EMPTY_TYPE, String::new())
    }

    pub fn is_signed(&self) -> bool {
        !self.sign.is_empty()
    }

    /// Parses a block's `data` string. Anything that is not a JSON object with a
    /// string `type` is not a data block.
    pub fn parse(raw: &str) -> Result<Self, ChainError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.get("type").map(Value::is_string).unwrap_or(false) {
            return Err(ChainError::SerializationError(
                "payload has no type tag".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Canonical (sorted keys) JSON, the form stored in `Block::data`.
    pub fn to_canonical_json(&self) -> Result<String, ChainError> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }

    pub fn sign_with(&mut self, identity: &NodeIdentity) -> Result<(), ChainError> {
        self.sign = identity.sign(&self.data)?;
        self.pubkey = identity.public_key_hex();
        Ok(())
    }

    pub fn verify(&self, scheme: &dyn SignatureScheme) -> bool {
        self.is_signed() && scheme.verify(&self.data, &self.sign, &self.pubkey)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// A concrete payload shape that travels inside a [`Signable`].
pub trait PayloadKind: Serialize + DeserializeOwned {
    const TYPE: &'static str;

    /// Deterministic content that gets signed.
    fn generate_data(&self) -> String;

    fn to_signable(&self) -> Result<Signable, ChainError> {
        let Value::Object(extra) = serde_json::to_value(self)? else {
            return Err(ChainError::SerializationError(format!(
                "{} payload must serialize to an object",
                Self::TYPE
            )));
        };
        Ok(Signable {
            extra,
            ..Signable::new(Self::TYPE, self.generate_data())
        })
    }

    fn from_signable(signable: &Signable) -> Result<Self, ChainError> {
        if signable.kind != Self::TYPE {
            return Err(ChainError::SerializationError(format!(
                "expected {} payload, got {}",
                Self::TYPE,
                signable.kind
            )));
        }
        Ok(serde_json::from_value(Value::Object(signable.extra.clone()))?)
    }
}

fn canonical(value: &Value) -> String {
    // Value objects are BTreeMap-backed; serializing cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

/// Issues a new key for the key-based permission model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIssue {
    pub public_key: String,
    pub key_type: String,
}

impl PayloadKind for KeyIssue {
    const TYPE: &'static str = "KO-KEY-ISSUE";

    fn generate_data(&self) -> String {
        format!(
            "{}{}",
            Self::TYPE,
            sha256_hex(&format!("{}{}", self.public_key, self.key_type))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDelete {
    pub public_key: String,
}

impl PayloadKind for KeyDelete {
    const TYPE: &'static str = "KO-KEY-DELETE";

    fn generate_data(&self) -> String {
        format!("{}{}", Self::TYPE, sha256_hex(&self.public_key))
    }
}

/// Calls a method of a deployed contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub address: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub state: Value,
}

impl PayloadKind for ContractCall {
    const TYPE: &'static str = "ContractCallBlock";

    fn generate_data(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}{}{}",
            Self::TYPE,
            self.address,
            canonical(&self.state),
            canonical(&self.args),
            self.method
        ))
    }
}

/// Deploys contract code. `state.codeHash` is filled in by [`ContractDeploy::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDeploy {
    pub ecma_code: String,
    pub state: Value,
}

impl ContractDeploy {
    pub fn new(ecma_code: String, state: Value) -> Self {
        let mut state = match state {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        state.insert("codeHash".to_string(), Value::String(sha256_hex(&ecma_code)));
        ContractDeploy {
            ecma_code,
            state: Value::Object(state),
        }
    }
}

impl PayloadKind for ContractDeploy {
    const TYPE: &'static str = "ContractDeploy";

    fn generate_data(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}",
            Self::TYPE,
            self.ecma_code,
            canonical(&self.state)
        ))
    }
}

/// Known payload kinds, plus an open case for externally handled types.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Keyring(Keyring),
    KeyIssue(KeyIssue),
    KeyDelete(KeyDelete),
    ContractCall(ContractCall),
    ContractDeploy(ContractDeploy),
    Empty,
    Other(String),
}

impl Payload {
    /// Classifies a parsed envelope. Malformed known kinds are an error.
    pub fn classify(signable: &Signable) -> Result<Payload, ChainError> {
        Ok(match signable.kind.as_str() {
            Keyring::TYPE => Payload::Keyring(Keyring::from_signable(signable)?),
            KeyIssue::TYPE => Payload::KeyIssue(KeyIssue::from_signable(signable)?),
            KeyDelete::TYPE => Payload::KeyDelete(KeyDelete::from_signable(signable)?),
            ContractCall::TYPE => Payload::ContractCall(ContractCall::from_signable(signable)?),
            ContractDeploy::TYPE => {
                Payload::ContractDeploy(ContractDeploy::from_signable(signable)?)
            }
            EMPTY_TYPE => Payload::Empty,
            other => Payload::Other(other.to_string()),
        })
    }

    pub fn type_name(&self) -> &str {
        match self {
            Payload::Keyring(_) => Keyring::TYPE,
            Payload::KeyIssue(_) => KeyIssue::TYPE,
            Payload::KeyDelete(_) => KeyDelete::TYPE,
            Payload::ContractCall(_) => ContractCall::TYPE,
            Payload::ContractDeploy(_) => ContractDeploy::TYPE,
            Payload::Empty => EMPTY_TYPE,
            Payload::Other(kind) => kind,
        }
    }
}
