/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::connection::TokenEngine;
use crate::connection::port::MailboxPort;
use crate::core::config::DriverConfig;
use crate::core::error::HsmResult;
use crate::core::key::KeyStore;
use crate::core::lock::{EngineLock, EngineSession};
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct HsmInner {
    lock: EngineLock,
    config: DriverConfig,
    key_store: Option<Arc<dyn KeyStore>>,
}

/// Shared handle to one engine. Clones refer to the same engine and lock.
#[derive(Clone, Debug)]
pub struct Hsm {
    inner: Arc<HsmInner>,
}

impl Hsm {
    pub async fn init(port: Box<dyn MailboxPort>, config: DriverConfig) -> HsmResult<Self> {
        Self::build(port, config, None).await
    }

    pub async fn init_with_key_store(
        port: Box<dyn MailboxPort>,
        config: DriverConfig,
        key_store: Arc<dyn KeyStore>,
    ) -> HsmResult<Self> {
        Self::build(port, config, Some(key_store)).await
    }

    async fn build(
        port: Box<dyn MailboxPort>,
        config: DriverConfig,
        key_store: Option<Arc<dyn KeyStore>>,
    ) -> HsmResult<Self> {
        config.validate()?;

        let mut engine = TokenEngine::new(port, config.result_timeout);
        engine.link().await?;
        info!(
            "Engine ready ({:?}, max transfer {} bytes)",
            config.return_behavior, config.max_transfer_len
        );

        Ok(Hsm {
            inner: Arc::new(HsmInner {
                lock: EngineLock::new(engine),
                config,
                key_store,
            }),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn key_store(&self) -> Option<&Arc<dyn KeyStore>> {
        self.inner.key_store.as_ref()
    }

    /// Acquires the engine with the configured lock timeout.
    pub async fn lock(&self) -> HsmResult<EngineSession> {
        let timeout = self.inner.config.lock_timeout;
        self.inner.lock.acquire(timeout).await
    }

    pub async fn lock_with_timeout(&self, timeout: Option<Duration>) -> HsmResult<EngineSession> {
        self.inner.lock.acquire(timeout).await
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock.is_locked()
    }

    /// Waits for the engine to go idle and unlinks the mailbox.
    pub async fn shutdown(&self) -> HsmResult<()> {
        let mut session = self.lock().await?;
        session.engine().unlink().await?;
        info!("Engine unlinked");
        Ok(())
    }
}
