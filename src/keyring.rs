//! Keyring: the bootstrap set of public keys trusted to sign blocks
//!
//! A keyring is emitted once, in one of the first blocks of the chain, and
//! persisted next to the node's other local state as a JSON array of keys.

use crate::crypto::{KeyPair, NodeIdentity};
use crate::error::ChainError;
use crate::payload::PayloadKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the installed keyring inside the work dir.
pub const KEYRING_FILE: &str = "keyring.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyring {
    pub keys: Vec<String>,
    pub initiator: String,
}

/// One generated key pair as written to the emission keyfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedKey {
    pub public: String,
    pub private: String,
}

impl Keyring {
    pub fn new(keys: Vec<String>, initiator: String) -> Self {
        Keyring { keys, initiator }
    }

    /// Builds a keyring of `count` keys: the local node's key first, then fresh
    /// pairs. Every pair, the local one included, is written to `keyfile`.
    pub fn generate(count: usize, identity: &NodeIdentity, keyfile: &Path) -> Result<Self, ChainError> {
        info!("Keyring: Generating keys for emission");
        let local = identity.keypair();
        let mut emitted = vec![EmittedKey {
            public: local.public_key_hex(),
            private: local.secret_hex(),
        }];
        for _ in 1..count {
            let pair = KeyPair::generate();
            emitted.push(EmittedKey {
                public: pair.public_key_hex(),
                private: pair.secret_hex(),
            });
        }

        std::fs::write(keyfile, serde_json::to_string(&emitted)?)?;
        info!("Keyring: Saving generated keys to {}", keyfile.display());

        Ok(Keyring {
            keys: emitted.into_iter().map(|k| k.public).collect(),
            initiator: identity.public_key_hex(),
        })
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.keys.iter().any(|k| k == public_key)
    }
}

impl PayloadKind for Keyring {
    const TYPE: &'static str = "Keyring";

    fn generate_data(&self) -> String {
        let keys = serde_json::to_string(&self.keys).unwrap_or_default();
        format!("{}{}{}", Self::TYPE, keys, self.initiator)
    }
}

/// On-disk copy of the installed keyring.
#[derive(Debug, Clone)]
pub struct KeyringFile {
    path: PathBuf,
}

impl KeyringFile {
    pub fn in_dir(work_dir: &Path) -> Self {
        KeyringFile {
            path: work_dir.join(KEYRING_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Installed keys, empty when the file is missing or unreadable.
    pub fn load(&self) -> Vec<String> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring unreadable keyring file {}: {}", self.path.display(), e);
            Vec::new()
        })
    }

    pub fn save(&self, keys: &[String]) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string(keys)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_writes_keyfile() {
        let dir = TempDir::new().unwrap();
        let keyfile = dir.path().join("emission.json");
        let identity = NodeIdentity::generate();

        let keyring = Keyring::generate(3, &identity, &keyfile).unwrap();
        assert_eq!(keyring.keys.len(), 3);
        assert_eq!(keyring.keys[0], identity.public_key_hex());
        assert!(keyring.contains(&identity.public_key_hex()));

        let emitted: Vec<EmittedKey> =
            serde_json::from_str(&std::fs::read_to_string(&keyfile).unwrap()).unwrap();
        assert_eq!(emitted.len(), 3);
        let restored = KeyPair::from_secret_hex(&emitted[2].private).unwrap();
        assert_eq!(restored.public_key_hex(), keyring.keys[2]);
    }

    #[test]
    fn test_keyring_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = KeyringFile::in_dir(dir.path());
        assert!(file.load().is_empty());

        file.save(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(file.load(), vec!["a".to_string(), "b".to_string()]);

        std::fs::write(file.path(), "not json").unwrap();
        assert!(file.load().is_empty());
    }
}
