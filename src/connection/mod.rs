/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod backend;
pub mod command;
pub mod port;
use crate::connection::command::{CommandToken, RESULT_MASK, ResultToken};
use crate::connection::port::MailboxPort;
use crate::core::config::ReturnBehavior;
use crate::core::error::{HsmError, HsmResult};
use log::{debug, error, info};
use std::time::Duration;
use tokio::time::Instant;

/// Drives the command/result token exchange over a [`MailboxPort`].
///
/// At most one token is in flight. In polling behavior `submit_token` spins on
/// the mailbox until the result is in; in blocking behavior it only places the
/// token and [`wait_for_result`](Self::wait_for_result) suspends the caller.
#[derive(Debug)]
pub struct TokenEngine {
    port: Box<dyn MailboxPort>,
    behavior: ReturnBehavior,
    result_timeout: Duration,
    pending: bool,
    polled: Option<ResultToken>,
    last_code: i32,
}

impl TokenEngine {
    pub fn new(port: Box<dyn MailboxPort>, result_timeout: Duration) -> Self {
        TokenEngine {
            port,
            behavior: ReturnBehavior::Blocking,
            result_timeout,
            pending: false,
            polled: None,
            last_code: 0,
        }
    }

    /// Links the mailbox and checks the engine answers a version token.
    pub async fn link(&mut self) -> HsmResult<()> {
        info!("Linking engine mailbox {}", self.port.get_port_name());
        self.port.link().await?;

        let res = self.transact(CommandToken::version()).await?;
        if !res.is_success() {
            error!("Version token failed with code {}", res.masked());
            return Err(HsmError::HardwareError(res.masked()));
        }

        match res.output.as_slice() {
            [major, minor, patch, ..] => {
                info!("Engine firmware version {}.{}.{}", major, minor, patch)
            }
            _ => debug!("Engine did not report a firmware version"),
        }
        Ok(())
    }

    pub async fn unlink(&mut self) -> HsmResult<()> {
        self.drain().await?;
        self.port.unlink().await
    }

    pub fn is_linked(&self) -> bool {
        self.port.is_linked()
    }

    pub fn behavior(&self) -> ReturnBehavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: ReturnBehavior) {
        self.behavior = behavior;
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    pub async fn submit_token(&mut self, token: CommandToken) -> HsmResult<()> {
        if self.pending {
            return Err(HsmError::ResourceError("token already in flight".into()));
        }
        if self.behavior == ReturnBehavior::Callback {
            return Err(HsmError::NotSupported(
                "callback completion is handled above the token engine".into(),
            ));
        }

        debug!(
            "[TX] {:?}/{:?} mode={:?} key={:?} target={} len={}",
            token.opcode,
            token.subcode,
            token.mode,
            token.key,
            token.target,
            token.transfer_len()
        );
        self.polled = None;
        self.port.write_token(token).await?;
        self.pending = true;

        if self.behavior == ReturnBehavior::Polling {
            let deadline = Instant::now() + self.result_timeout;
            loop {
                if let Some(res) = self.port.try_read_result().await? {
                    self.record(&res);
                    self.polled = Some(res);
                    break;
                }
                if Instant::now() >= deadline {
                    error!("No result after polling for {:?}", self.result_timeout);
                    return Err(HsmError::Timeout);
                }
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Single synchronization point after [`submit_token`](Self::submit_token).
    pub async fn wait_for_result(&mut self) -> HsmResult<ResultToken> {
        if let Some(res) = self.polled.take() {
            return Ok(res);
        }
        if !self.pending {
            return Err(HsmError::BadState("idle"));
        }

        let res = tokio::time::timeout(self.result_timeout, self.port.read_result())
            .await
            .map_err(|_| {
                error!("No result within {:?}", self.result_timeout);
                HsmError::Timeout
            })??;
        self.record(&res);
        Ok(res)
    }

    /// Masked code of the most recent result token.
    pub fn result_code(&self) -> i8 {
        (self.last_code & RESULT_MASK) as u8 as i8
    }

    /// Submits `token` and waits for its result. Negative engine results are
    /// returned as-is; only transport problems are errors here.
    pub async fn transact(&mut self, token: CommandToken) -> HsmResult<ResultToken> {
        self.submit_token(token).await?;
        let res = self.wait_for_result().await?;
        debug!(
            "[RX] code={} asset={} out={} tag={}",
            res.masked(),
            res.asset_id,
            hex::encode(&res.output),
            hex::encode(&res.tag)
        );
        Ok(res)
    }

    /// Waits out and discards a result left behind by an interrupted exchange.
    pub async fn drain(&mut self) -> HsmResult<()> {
        self.polled = None;
        if !self.pending {
            return Ok(());
        }
        let res = tokio::time::timeout(self.result_timeout, self.port.read_result())
            .await
            .map_err(|_| HsmError::Timeout)??;
        debug!("Drained stale result with code {}", res.masked());
        self.record(&res);
        Ok(())
    }

    fn record(&mut self, res: &ResultToken) {
        self.pending = false;
        self.last_code = res.code;
    }
}
