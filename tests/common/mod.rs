/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#![allow(dead_code)]

use hsm_driver::core::key::{KeyAlgorithm, KeyMaterial, KeyStore, KeyUsage, RetrievedKey};
use hsm_driver::sim::assets::AssetStats;
use hsm_driver::{Callback, DriverConfig, Hsm, HsmError, HsmResult, OperationKind, SimEngine};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

pub const SIM_CAPACITY: usize = 64;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Bench {
    pub sim: SimEngine,
    pub hsm: Hsm,
}

impl Bench {
    pub async fn stats(&self) -> AssetStats {
        self.sim.stats().await
    }

    /// Every asset created through the mailbox has been freed again.
    pub async fn assert_balanced(&self) {
        let stats = self.sim.stats().await;
        assert_eq!(
            stats.created,
            stats.freed,
            "leaked assets: {:?}",
            self.sim.live_assets().await
        );
        assert_eq!(stats.live, 0);
        assert!(!self.hsm.is_locked(), "engine lock still held");
    }
}

pub async fn bench(config: DriverConfig) -> Bench {
    init_logger();
    let sim = SimEngine::with_limits(SIM_CAPACITY, config.max_transfer_len);
    let hsm = Hsm::init(Box::new(sim.mailbox()), config)
        .await
        .expect("engine init");
    Bench { sim, hsm }
}

pub async fn default_bench() -> Bench {
    bench(DriverConfig::default()).await
}

pub async fn bench_with_store(config: DriverConfig, store: Arc<StaticKeyStore>) -> Bench {
    init_logger();
    let sim = SimEngine::with_limits(SIM_CAPACITY, config.max_transfer_len);
    let hsm = Hsm::init_with_key_store(Box::new(sim.mailbox()), config, store)
        .await
        .expect("engine init");
    Bench { sim, hsm }
}

/// Key store backed by a fixed table that counts its lookups.
#[derive(Debug, Default)]
pub struct StaticKeyStore {
    keys: HashMap<u32, (KeyMaterial, KeyUsage, KeyAlgorithm)>,
    lookups: AtomicUsize,
}

impl StaticKeyStore {
    pub fn with_key(
        mut self,
        id: u32,
        material: KeyMaterial,
        usage: KeyUsage,
        algorithm: KeyAlgorithm,
    ) -> Self {
        self.keys.insert(id, (material, usage, algorithm));
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl KeyStore for StaticKeyStore {
    async fn retrieve(&self, id: u32, _usage: KeyUsage) -> HsmResult<RetrievedKey> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let (material, usage, algorithm) = self
            .keys
            .get(&id)
            .cloned()
            .ok_or_else(|| HsmError::KeyStore(format!("no key {}", id)))?;
        Ok(RetrievedKey {
            material,
            usage,
            algorithm,
        })
    }
}

pub type Delivery = (OperationKind, HsmResult<Vec<u8>>);

/// Callback forwarding every delivery into a channel.
pub fn channel_callback() -> (Callback, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |kind, res| {
        let _ = tx.send((kind, res));
    });
    (callback, rx)
}

pub fn unhex(s: &str) -> Vec<u8> {
    hex::decode(s).expect("valid hex")
}

/// Deterministic test message.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}
