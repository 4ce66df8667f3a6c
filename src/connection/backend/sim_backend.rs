/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::connection::command::{CommandToken, ResultToken};
use crate::connection::port::MailboxPort;
use crate::core::error::{HsmError, HsmResult};
use log::{debug, error, info};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Mailbox backed by a pair of channels to an in-process engine task.
#[derive(Debug)]
pub struct SimMailbox {
    name: String,
    cmd_tx: mpsc::Sender<CommandToken>,
    res_rx: mpsc::Receiver<ResultToken>,
    linked: bool,
}

impl SimMailbox {
    pub fn new(
        name: impl Into<String>,
        cmd_tx: mpsc::Sender<CommandToken>,
        res_rx: mpsc::Receiver<ResultToken>,
    ) -> Self {
        SimMailbox {
            name: name.into(),
            cmd_tx,
            res_rx,
            linked: false,
        }
    }

    fn ensure_linked(&self) -> HsmResult<()> {
        if !self.linked {
            return Err(HsmError::ResourceError(format!("{} is not linked", self.name)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MailboxPort for SimMailbox {
    async fn link(&mut self) -> HsmResult<()> {
        if self.cmd_tx.is_closed() {
            error!("Engine behind {} is not running", self.name);
            return Err(HsmError::ResourceError("engine not running".into()));
        }
        if !self.linked {
            self.linked = true;
            info!("Linked mailbox {}", self.name);
        }
        Ok(())
    }

    async fn unlink(&mut self) -> HsmResult<()> {
        if self.linked {
            self.linked = false;
            info!("Unlinked mailbox {}", self.name);
        }
        Ok(())
    }

    fn is_linked(&self) -> bool {
        self.linked
    }

    async fn write_token(&mut self, token: CommandToken) -> HsmResult<()> {
        self.ensure_linked()?;
        match self.cmd_tx.try_send(token) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Mailbox {} is occupied", self.name);
                Err(HsmError::ResourceError("mailbox busy".into()))
            }
            Err(TrySendError::Closed(_)) => {
                self.linked = false;
                Err(HsmError::ResourceError("engine went away".into()))
            }
        }
    }

    async fn try_read_result(&mut self) -> HsmResult<Option<ResultToken>> {
        self.ensure_linked()?;
        match self.res_rx.try_recv() {
            Ok(res) => Ok(Some(res)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.linked = false;
                Err(HsmError::ResourceError("engine went away".into()))
            }
        }
    }

    async fn read_result(&mut self) -> HsmResult<ResultToken> {
        self.ensure_linked()?;
        match self.res_rx.recv().await {
            Some(res) => Ok(res),
            None => {
                self.linked = false;
                Err(HsmError::ResourceError("engine went away".into()))
            }
        }
    }

    fn get_port_name(&self) -> String {
        self.name.clone()
    }
}
