//! Contract-query collaborator used by stake-delegated consensus
//!
//! Eligibility, whitelist and fee rules live in an external master contract.
//! [`ContractGateway`] wraps whatever runtime answers those queries and turns
//! "contract does not exist" into a plain `false`.

use crate::blockchain::Block;
use crate::crypto::SignatureScheme;
use crate::error::ChainError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CHECK_BLOCK_SIGN: &str = "checkBlockSign";
pub const GET_FEE_FROM_BLOCK: &str = "getFeeFromBlock";
pub const CHECK_IS_NODE_CAN_VALIDATE: &str = "checkIsNodeCanValidate";

#[async_trait]
pub trait ContractQuery: Send + Sync {
    async fn contract_exists(&self, address: &str) -> Result<bool, ChainError>;

    /// Calls `method` without persisting any state change.
    async fn call_method(
        &self,
        address: &str,
        method: &str,
        args: Vec<Value>,
        state: Value,
    ) -> Result<Value, ChainError>;
}

/// No contract runtime at all. Every contract is missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContracts;

#[async_trait]
impl ContractQuery for NoContracts {
    async fn contract_exists(&self, _address: &str) -> Result<bool, ChainError> {
        Ok(false)
    }

    async fn call_method(
        &self,
        address: &str,
        method: &str,
        _args: Vec<Value>,
        _state: Value,
    ) -> Result<Value, ChainError> {
        Err(ChainError::ContractError(format!(
            "No contract at {} to call {}",
            address, method
        )))
    }
}

/// Master contract backed by a static whitelist of validator public keys.
///
/// `checkIsNodeCanValidate` accepts a whitelisted key or bus address,
/// `checkBlockSign` verifies against every whitelisted key and
/// `getFeeFromBlock` returns the configured flat fee.
pub struct WhitelistContract {
    address: String,
    validators: RwLock<HashSet<String>>,
    flat_fee: Option<String>,
    scheme: Arc<dyn SignatureScheme>,
}

impl WhitelistContract {
    pub fn new(address: &str, validators: Vec<String>, scheme: Arc<dyn SignatureScheme>) -> Self {
        WhitelistContract {
            address: address.to_string(),
            validators: RwLock::new(validators.into_iter().collect()),
            flat_fee: None,
            scheme,
        }
    }

    pub fn with_flat_fee(mut self, fee: &str) -> Self {
        self.flat_fee = Some(fee.to_string());
        self
    }

    pub fn allow(&self, validator: &str) {
        self.validators.write().insert(validator.to_string());
    }

    pub fn revoke(&self, validator: &str) {
        self.validators.write().remove(validator);
    }

    fn check_block_sign(&self, hash: &str, sign: &str) -> bool {
        self.validators
            .read()
            .iter()
            .any(|key| self.scheme.verify(hash, sign, key))
    }
}

fn arg_str(args: &[Value], at: usize) -> &str {
    args.get(at).and_then(Value::as_str).unwrap_or_default()
}

#[async_trait]
impl ContractQuery for WhitelistContract {
    async fn contract_exists(&self, address: &str) -> Result<bool, ChainError> {
        Ok(address == self.address)
    }

    async fn call_method(
        &self,
        address: &str,
        method: &str,
        args: Vec<Value>,
        _state: Value,
    ) -> Result<Value, ChainError> {
        if address != self.address {
            return Err(ChainError::ContractError(format!("Unknown contract {}", address)));
        }
        match method {
            CHECK_IS_NODE_CAN_VALIDATE => {
                Ok(Value::Bool(self.validators.read().contains(arg_str(&args, 0))))
            }
            CHECK_BLOCK_SIGN => Ok(Value::Bool(
                self.check_block_sign(arg_str(&args, 0), arg_str(&args, 1)),
            )),
            GET_FEE_FROM_BLOCK => Ok(self
                .flat_fee
                .as_ref()
                .map(|fee| Value::String(fee.clone()))
                .unwrap_or(Value::Null)),
            other => Err(ChainError::ContractError(format!("Unknown method {}", other))),
        }
    }
}

/// Caching front for a [`ContractQuery`].
pub struct ContractGateway {
    inner: Arc<dyn ContractQuery>,
    known: RwLock<HashSet<String>>,
}

impl ContractGateway {
    pub fn new(inner: Arc<dyn ContractQuery>) -> Self {
        ContractGateway {
            inner,
            known: RwLock::new(HashSet::new()),
        }
    }

    /// Existing contracts are remembered; missing ones are asked again next time.
    pub async fn contract_exists(&self, address: &str) -> bool {
        if self.known.read().contains(address) {
            return true;
        }
        match self.inner.contract_exists(address).await {
            Ok(true) => {
                self.known.write().insert(address.to_string());
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Contract lookup for {} failed: {}", address, e);
                false
            }
        }
    }

    /// Rollback call. A missing contract answers `false`.
    pub async fn call_rollback(&self, address: &str, method: &str, args: Vec<Value>) -> Result<Value, ChainError> {
        if !self.contract_exists(address).await {
            debug!("Contract {} missing, {} answers false", address, method);
            return Ok(Value::Bool(false));
        }
        self.inner.call_method(address, method, args, json!({})).await
    }

    async fn call_bool(&self, address: &str, method: &str, args: Vec<Value>) -> bool {
        match self.call_rollback(address, method, args).await {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(e) => {
                warn!("{} on {} failed: {}", method, address, e);
                false
            }
        }
    }

    pub async fn check_block_sign(&self, master: &str, block: &Block) -> bool {
        self.call_bool(master, CHECK_BLOCK_SIGN, vec![json!(block.hash), json!(block.sign)])
            .await
    }

    pub async fn can_validate(&self, master: &str, candidate: &str, online: &[String]) -> bool {
        self.call_bool(master, CHECK_IS_NODE_CAN_VALIDATE, vec![json!(candidate), json!(online)])
            .await
    }

    /// Fee the contract computes for `block`, as a decimal string.
    pub async fn fee_from_block(&self, master: &str, block: &Block) -> Result<Option<String>, ChainError> {
        let value = self
            .call_rollback(master, GET_FEE_FROM_BLOCK, vec![serde_json::to_value(block)?])
            .await?;
        Ok(match value {
            Value::String(fee) => Some(fee),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NodeIdentity, Secp256k1Scheme};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLookup {
        lookups: AtomicUsize,
        exists: bool,
    }

    #[async_trait]
    impl ContractQuery for CountingLookup {
        async fn contract_exists(&self, _address: &str) -> Result<bool, ChainError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.exists)
        }

        async fn call_method(&self, _: &str, _: &str, _: Vec<Value>, _: Value) -> Result<Value, ChainError> {
            Ok(Value::Bool(true))
        }
    }

    #[tokio::test]
    async fn test_existing_contract_is_cached() {
        let lookup = Arc::new(CountingLookup {
            lookups: AtomicUsize::new(0),
            exists: true,
        });
        let gateway = ContractGateway::new(lookup.clone());
        assert!(gateway.contract_exists("master").await);
        assert!(gateway.contract_exists("master").await);
        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_contract_degrades_to_false() {
        let gateway = ContractGateway::new(Arc::new(NoContracts));
        assert!(!gateway.can_validate("master", "key", &[]).await);
        assert_eq!(
            gateway.call_rollback("master", CHECK_BLOCK_SIGN, vec![]).await.unwrap(),
            Value::Bool(false)
        );
    }

    #[tokio::test]
    async fn test_whitelist_contract() {
        let validator = NodeIdentity::generate();
        let contract = WhitelistContract::new(
            "master",
            vec![validator.public_key_hex()],
            Arc::new(Secp256k1Scheme),
        )
        .with_flat_fee("10");
        let gateway = ContractGateway::new(Arc::new(contract));

        assert!(gateway.can_validate("master", &validator.public_key_hex(), &[]).await);
        assert!(!gateway.can_validate("master", "stranger", &[]).await);

        let block = Block::new(3, "p".into(), 1_700_000_000_000, 1_700_000_000_000, "{}".into());
        let signed = block.clone().with_signature(validator.sign(&block.hash).unwrap());
        assert!(gateway.check_block_sign("master", &signed).await);
        assert!(!gateway.check_block_sign("master", &block.with_signature("00".into())).await);
        assert_eq!(gateway.fee_from_block("master", &signed).await.unwrap(), Some("10".to_string()));
    }
}
