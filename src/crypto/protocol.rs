/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Completion plumbing shared by all operation contexts.
use crate::connection::command::{ResultCode, ResultToken};
use crate::core::config::ReturnBehavior;
use crate::core::device::Hsm;
use crate::core::error::{HsmError, HsmResult};
use crate::core::lock::{CancelFlag, EngineSession};
use log::{debug, error, warn};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    MacSign,
    MacVerify,
    MacSetup,
    MacUpdate,
    MacFinalize,
    AeadEncrypt,
    AeadDecrypt,
    AeadSetup,
    AeadUpdate,
    AeadFinalize,
    Sign,
    Verify,
    GeneratePublicKey,
}

/// Result of a driver call. `Pending` means the outcome goes to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Done(T),
    Pending,
}

impl<T> Completion<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Completion::Done(v) => Some(v),
            Completion::Pending => None,
        }
    }
}

/// Callback invoked with the outcome of an operation in callback mode. Outputs
/// are flattened to bytes; operations without output report an empty buffer.
pub type Callback = Arc<dyn Fn(OperationKind, HsmResult<Vec<u8>>) + Send + Sync>;

/// Output that can be handed to a [`Callback`].
pub trait Payload: Send + 'static {
    fn into_payload(self) -> Vec<u8>;
}

impl Payload for () {
    fn into_payload(self) -> Vec<u8> {
        Vec::new()
    }
}

impl Payload for Vec<u8> {
    fn into_payload(self) -> Vec<u8> {
        self
    }
}

impl<const N: usize> Payload for [u8; N] {
    fn into_payload(self) -> Vec<u8> {
        self.to_vec()
    }
}

/// Per-context completion settings plus the engine handle.
#[derive(Clone)]
pub struct Dispatcher {
    hsm: Hsm,
    behavior: ReturnBehavior,
    callback: Option<Callback>,
    cancel: CancelFlag,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("behavior", &self.behavior)
            .field("callback", &self.callback.is_some())
            .field("cancel", &self.cancel.is_requested())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(hsm: &Hsm) -> Self {
        let behavior = match hsm.config().return_behavior {
            // No callback yet. `set_callback` switches over.
            ReturnBehavior::Callback => {
                debug!("Callback behavior configured, blocking until a callback is set");
                ReturnBehavior::Blocking
            }
            other => other,
        };
        Dispatcher {
            hsm: hsm.clone(),
            behavior,
            callback: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn hsm(&self) -> &Hsm {
        &self.hsm
    }

    pub fn behavior(&self) -> ReturnBehavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: ReturnBehavior) -> HsmResult<()> {
        if behavior == ReturnBehavior::Callback && self.callback.is_none() {
            return Err(HsmError::invalid("callback behavior requires a callback"));
        }
        self.behavior = behavior;
        Ok(())
    }

    /// Registers `callback` and switches to callback behavior.
    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
        self.behavior = ReturnBehavior::Callback;
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Locks the engine for one token sequence of this context.
    pub async fn session(&self) -> HsmResult<EngineSession> {
        let mut session = self.hsm.lock().await?;
        session.set_behavior(self.behavior);
        session.attach_cancel(self.cancel.clone());
        Ok(session)
    }

    /// Runs an accepted token sequence. In callback behavior the sequence is
    /// moved to a task and its outcome is delivered to the callback.
    pub async fn complete<T, F>(&self, kind: OperationKind, sequence: F) -> HsmResult<Completion<T>>
    where
        T: Payload,
        F: Future<Output = HsmResult<T>> + Send + 'static,
    {
        match (&self.callback, self.behavior) {
            (Some(callback), ReturnBehavior::Callback) => {
                let callback = callback.clone();
                tokio::spawn(async move {
                    let res = sequence.await;
                    if let Err(e) = &res {
                        debug!("{:?} finished with {}", kind, e);
                    }
                    callback(kind, res.map(Payload::into_payload));
                });
                Ok(Completion::Pending)
            }
            _ => sequence.await.map(Completion::Done),
        }
    }

    /// Reports `err` through the callback, if one is registered and in use.
    pub fn notify_error(&self, kind: OperationKind, err: HsmError) {
        match (&self.callback, self.behavior) {
            (Some(callback), ReturnBehavior::Callback) => callback(kind, Err(err)),
            _ => warn!("{:?} ended with {} and no callback to report it", kind, err),
        }
    }
}

/// Maps a negative engine result to an error.
pub(crate) fn expect_success(res: &ResultToken, what: &str) -> HsmResult<()> {
    if res.is_success() {
        return Ok(());
    }
    error!("{} failed with engine code {}", what, res.masked());
    Err(HsmError::HardwareError(res.masked()))
}

/// Checks the size of an engine output. Anything else than `expected` is an
/// engine fault, not a caller mistake.
pub(crate) fn expect_len(actual: usize, expected: usize, what: &str) -> HsmResult<()> {
    if actual == expected {
        return Ok(());
    }
    error!("{} returned {} bytes, expected {}", what, actual, expected);
    Err(HsmError::HardwareError(ResultCode::InvalidLength as i8))
}

/// Engine output of a fixed size.
pub(crate) fn fixed_output<const N: usize>(out: &[u8], what: &str) -> HsmResult<[u8; N]> {
    expect_len(out.len(), N, what)?;
    out.try_into()
        .map_err(|_| HsmError::HardwareError(ResultCode::InvalidLength as i8))
}
