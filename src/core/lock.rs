/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::connection::TokenEngine;
use crate::connection::command::{CommandToken, ResultToken};
use crate::core::config::ReturnBehavior;
use crate::core::error::{HsmError, HsmResult};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared cancellation request, checked by a session before every token.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutual exclusion over the single engine. Holding an [`EngineSession`] is the
/// only way to reach the mailbox.
#[derive(Debug, Clone)]
pub struct EngineLock {
    engine: Arc<Mutex<TokenEngine>>,
}

impl EngineLock {
    pub fn new(engine: TokenEngine) -> Self {
        EngineLock {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Waits up to `timeout` for the engine. `None` waits forever and a zero
    /// timeout tries exactly once.
    pub async fn acquire(&self, timeout: Option<Duration>) -> HsmResult<EngineSession> {
        let guard = match timeout {
            Some(t) if t.is_zero() => self
                .engine
                .clone()
                .try_lock_owned()
                .map_err(|_| HsmError::ResourceUnavailable)?,
            Some(t) => tokio::time::timeout(t, self.engine.clone().lock_owned())
                .await
                .map_err(|_| {
                    debug!("Engine lock not acquired within {:?}", t);
                    HsmError::ResourceUnavailable
                })?,
            None => self.engine.clone().lock_owned().await,
        };

        Ok(EngineSession {
            engine: guard,
            cancel: CancelFlag::new(),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.engine.try_lock().is_err()
    }
}

/// Scoped ownership of the engine. Dropping the session releases the lock.
#[derive(Debug)]
pub struct EngineSession {
    engine: OwnedMutexGuard<TokenEngine>,
    cancel: CancelFlag,
}

impl EngineSession {
    pub fn set_behavior(&mut self, behavior: ReturnBehavior) {
        // Callback operations run their whole sequence on a completion task,
        // where each token is awaited like a blocking call.
        let token_behavior = match behavior {
            ReturnBehavior::Polling => ReturnBehavior::Polling,
            ReturnBehavior::Blocking | ReturnBehavior::Callback => ReturnBehavior::Blocking,
        };
        self.engine.set_behavior(token_behavior);
    }

    pub fn attach_cancel(&mut self, cancel: CancelFlag) {
        self.cancel = cancel;
    }

    pub fn engine(&mut self) -> &mut TokenEngine {
        &mut self.engine
    }

    /// Submits `token` and waits for its result, unless cancellation has been
    /// requested. The token already in flight is never abandoned.
    pub async fn exchange(&mut self, token: CommandToken) -> HsmResult<ResultToken> {
        if self.cancel.is_requested() {
            debug!("Cancellation requested, not submitting {:?}", token.subcode);
            return Err(HsmError::Cancelled);
        }
        self.drain_stale().await?;
        self.engine.transact(token).await
    }

    /// Like [`exchange`](Self::exchange) but ignores cancellation. Used by
    /// cleanup paths.
    pub async fn exchange_uncancellable(&mut self, token: CommandToken) -> HsmResult<ResultToken> {
        self.drain_stale().await?;
        self.engine.transact(token).await
    }

    /// A result left over from a timed out exchange must be consumed before
    /// the mailbox takes another token.
    async fn drain_stale(&mut self) -> HsmResult<()> {
        if self.engine.has_pending() {
            warn!("Draining outstanding result before the next token");
            self.engine.drain().await?;
        }
        Ok(())
    }
}
