/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Key references and the key-retrieval collaborator.
use crate::connection::command::KeyRef;
use crate::core::asset::{AssetHandle, AssetId, AssetPolicy};
use crate::core::error::{HsmError, HsmResult};
use crate::core::lock::EngineSession;
use log::{debug, error, warn};
use std::fmt::{self, Debug};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Aes,
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Mac,
    Aead,
    Sign,
}

/// Key supplied by the caller of a driver operation.
#[derive(Clone)]
pub enum CryptoKey {
    /// Raw bytes in host memory
    Plaintext(Zeroizing<Vec<u8>>),
    /// Slot held by the key store
    KeyStore { id: u32 },
    /// Derived inside the engine from an existing asset; never visible to the host
    Derived {
        source: AssetId,
        label: Vec<u8>,
        size: usize,
    },
}

impl CryptoKey {
    pub fn plaintext(bytes: &[u8]) -> Self {
        CryptoKey::Plaintext(Zeroizing::new(bytes.to_vec()))
    }

    pub fn key_store(id: u32) -> Self {
        CryptoKey::KeyStore { id }
    }

    pub fn derived(source: AssetId, label: &[u8], size: usize) -> Self {
        CryptoKey::Derived {
            source,
            label: label.to_vec(),
            size,
        }
    }
}

impl Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoKey::Plaintext(k) => write!(f, "Plaintext({} bytes)", k.len()),
            CryptoKey::KeyStore { id } => write!(f, "KeyStore({})", id),
            CryptoKey::Derived { source, size, .. } => {
                write!(f, "Derived({} -> {} bytes)", source, size)
            }
        }
    }
}

#[derive(Clone)]
pub enum KeyMaterial {
    Plaintext(Zeroizing<Vec<u8>>),
    /// Asset owned by the key store. The driver must never free it.
    Asset(AssetId),
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Plaintext(k) => write!(f, "Plaintext({} bytes)", k.len()),
            KeyMaterial::Asset(id) => write!(f, "Asset({})", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedKey {
    pub material: KeyMaterial,
    pub usage: KeyUsage,
    pub algorithm: KeyAlgorithm,
}

/// Source of keys that are not passed in by value.
#[async_trait::async_trait]
pub trait KeyStore: Send + Sync + Debug {
    async fn retrieve(&self, id: u32, usage: KeyUsage) -> HsmResult<RetrievedKey>;
}

/// Key resolved outside of the engine lock, ready to be materialized.
#[derive(Clone)]
pub(crate) enum KeySource {
    Bytes(Zeroizing<Vec<u8>>),
    Asset(AssetId),
    Derived {
        source: AssetId,
        label: Vec<u8>,
        size: usize,
    },
}

impl KeySource {
    /// Looks up `key` and checks it is usable for `usage` with `algorithm`.
    /// `sizes` lists the accepted key lengths in bytes.
    pub async fn fetch(
        key: &CryptoKey,
        key_store: Option<&Arc<dyn KeyStore>>,
        usage: KeyUsage,
        algorithm: KeyAlgorithm,
        sizes: &[usize],
    ) -> HsmResult<Self> {
        let check_size = |len: usize| {
            if sizes.contains(&len) {
                Ok(())
            } else {
                Err(HsmError::invalid(format!("unsupported key length {}", len)))
            }
        };

        match key {
            CryptoKey::Plaintext(bytes) => {
                check_size(bytes.len())?;
                Ok(KeySource::Bytes(bytes.clone()))
            }
            CryptoKey::Derived {
                source,
                label,
                size,
            } => {
                check_size(*size)?;
                if label.is_empty() || source.is_none() {
                    return Err(HsmError::invalid("derivation needs a source asset and a label"));
                }
                Ok(KeySource::Derived {
                    source: *source,
                    label: label.clone(),
                    size: *size,
                })
            }
            CryptoKey::KeyStore { id } => {
                let store = key_store
                    .ok_or_else(|| HsmError::NotSupported("no key store configured".into()))?;
                let retrieved = store.retrieve(*id, usage).await.map_err(|e| match e {
                    HsmError::KeyStore(_) => e,
                    other => HsmError::KeyStore(other.to_string()),
                })?;

                if retrieved.algorithm != algorithm || retrieved.usage != usage {
                    error!(
                        "Key {} is a {:?}/{:?} key, wanted {:?}/{:?}",
                        id, retrieved.algorithm, retrieved.usage, algorithm, usage
                    );
                    return Err(HsmError::NotSupported(format!(
                        "key {} cannot be used for {:?} with {:?}",
                        id, usage, algorithm
                    )));
                }

                match retrieved.material {
                    KeyMaterial::Plaintext(bytes) => {
                        check_size(bytes.len())?;
                        Ok(KeySource::Bytes(bytes))
                    }
                    KeyMaterial::Asset(asset) if asset.is_none() => {
                        Err(HsmError::KeyStore(format!("key {} has no asset", id)))
                    }
                    KeyMaterial::Asset(asset) => {
                        debug!("Key {} resolved to store asset {}", id, asset);
                        Ok(KeySource::Asset(asset))
                    }
                }
            }
        }
    }
}

/// Key as referenced from a token.
#[derive(Debug)]
pub(crate) enum ResolvedKey {
    Inline(KeyRef),
    Asset(AssetHandle),
}

impl EngineSession {
    /// Puts `source` where the engine can use it. Plaintext keys are loaded into
    /// a new asset unless `inline` allows carrying them in the token.
    pub(crate) async fn materialize_key(
        &mut self,
        source: &KeySource,
        policy: AssetPolicy,
        inline: bool,
    ) -> HsmResult<ResolvedKey> {
        match source {
            KeySource::Bytes(bytes) if inline => {
                Ok(ResolvedKey::Inline(KeyRef::Inline(bytes.clone())))
            }
            KeySource::Bytes(bytes) => {
                let asset = self.create_asset(policy, bytes.len()).await?;
                if let Err(e) = self.load_plaintext(&asset, bytes).await {
                    self.discard_key_asset(asset).await;
                    return Err(e);
                }
                Ok(ResolvedKey::Asset(asset))
            }
            KeySource::Asset(id) => Ok(ResolvedKey::Asset(AssetHandle::borrowed(*id))),
            KeySource::Derived {
                source,
                label,
                size,
            } => {
                let asset = self.create_asset(policy, *size).await?;
                if let Err(e) = self.load_derived(&asset, *source, label).await {
                    self.discard_key_asset(asset).await;
                    return Err(e);
                }
                Ok(ResolvedKey::Asset(asset))
            }
        }
    }

    /// Frees a key asset whose load failed. The load error is what the caller
    /// sees, so a failed delete is only logged.
    async fn discard_key_asset(&mut self, asset: AssetHandle) {
        let id = asset.id();
        if let Err(e) = self.free_asset(asset).await {
            warn!("Failed to free key asset {} after a failed load: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TokenEngine;
    use crate::connection::command::{ResultCode, Subcode};
    use crate::core::lock::EngineLock;
    use crate::sim::SimEngine;
    use std::time::Duration;

    #[derive(Debug)]
    struct FixedStore;

    #[async_trait::async_trait]
    impl KeyStore for FixedStore {
        async fn retrieve(&self, id: u32, _usage: KeyUsage) -> HsmResult<RetrievedKey> {
            match id {
                1 => Ok(RetrievedKey {
                    material: KeyMaterial::Asset(AssetId(0x9000)),
                    usage: KeyUsage::Mac,
                    algorithm: KeyAlgorithm::Aes,
                }),
                2 => Ok(RetrievedKey {
                    material: KeyMaterial::Plaintext(Zeroizing::new(vec![0u8; 32])),
                    usage: KeyUsage::Sign,
                    algorithm: KeyAlgorithm::Ed25519,
                }),
                _ => Err(HsmError::KeyStore(format!("no key {}", id))),
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_from_store() {
        let store: Arc<dyn KeyStore> = Arc::new(FixedStore);
        let source = KeySource::fetch(
            &CryptoKey::key_store(1),
            Some(&store),
            KeyUsage::Mac,
            KeyAlgorithm::Aes,
            &[16, 24, 32],
        )
        .await
        .unwrap();
        assert!(matches!(source, KeySource::Asset(AssetId(0x9000))));

        let wrong = KeySource::fetch(
            &CryptoKey::key_store(2),
            Some(&store),
            KeyUsage::Mac,
            KeyAlgorithm::Aes,
            &[16],
        )
        .await;
        assert!(matches!(wrong, Err(HsmError::NotSupported(_))));

        let missing = KeySource::fetch(
            &CryptoKey::key_store(3),
            Some(&store),
            KeyUsage::Mac,
            KeyAlgorithm::Aes,
            &[16],
        )
        .await;
        assert_eq!(missing.err(), Some(HsmError::KeyStore("no key 3".into())));
    }

    #[tokio::test]
    async fn test_plaintext_length_checked() {
        let res = KeySource::fetch(
            &CryptoKey::plaintext(&[0u8; 15]),
            None,
            KeyUsage::Aead,
            KeyAlgorithm::Aes,
            &[16],
        )
        .await;
        assert!(matches!(res, Err(HsmError::InvalidArgument(_))));
        assert_eq!(
            format!("{:?}", CryptoKey::plaintext(&[1u8; 16])),
            "Plaintext(16 bytes)"
        );
    }

    async fn sim_session(sim: &SimEngine) -> EngineSession {
        let mut engine = TokenEngine::new(Box::new(sim.mailbox()), Duration::from_secs(2));
        engine.link().await.unwrap();
        EngineLock::new(engine).acquire(None).await.unwrap()
    }

    #[tokio::test]
    async fn test_failed_load_frees_key_asset() {
        let sim = SimEngine::new();
        let mut session = sim_session(&sim).await;
        let source = KeySource::Bytes(Zeroizing::new(vec![0x11u8; 16]));

        let policy = AssetPolicy::SYM_AES_MAC;
        let rejected = HsmError::HardwareError(ResultCode::InvalidAsset as i8);

        sim.fail_next(Subcode::AssetLoadPlaintext, ResultCode::InvalidAsset)
            .await;
        let res = session.materialize_key(&source, policy, false).await;
        assert_eq!(res.err(), Some(rejected));

        let stats = sim.stats().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.freed, 1);
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_load_error() {
        let sim = SimEngine::new();
        let mut session = sim_session(&sim).await;
        let source = KeySource::Derived {
            source: sim.root_key(),
            label: b"aead key".to_vec(),
            size: 16,
        };

        let policy = AssetPolicy::SYM_AES_MAC;
        let rejected = HsmError::HardwareError(ResultCode::InvalidAsset as i8);

        sim.fail_next(Subcode::AssetLoadDerive, ResultCode::InvalidAsset)
            .await;
        sim.fail_next(Subcode::AssetDelete, ResultCode::InvalidState)
            .await;
        let res = session.materialize_key(&source, policy, false).await;
        assert_eq!(res.err(), Some(rejected));
        assert_eq!(sim.token_count(Subcode::AssetDelete).await, 1);
        assert_eq!(sim.live_assets().await.len(), 1);
    }
}
