/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::connection::command::{CommandToken, ResultToken};
use crate::core::error::HsmResult;
use std::fmt::Debug;

/// A single command/result mailbox in front of the engine.
///
/// Implementations only move tokens. Interpreting result codes is left to the
/// [`TokenEngine`](crate::connection::TokenEngine).
#[async_trait::async_trait]
pub trait MailboxPort: Send + Debug {
    async fn link(&mut self) -> HsmResult<()>;
    async fn unlink(&mut self) -> HsmResult<()>;
    fn is_linked(&self) -> bool;

    /// Places `token` in the mailbox. Fails with `ResourceError` if the
    /// mailbox is occupied, not linked, or the engine is gone.
    async fn write_token(&mut self, token: CommandToken) -> HsmResult<()>;

    /// Returns the result token if one is ready, without waiting.
    async fn try_read_result(&mut self) -> HsmResult<Option<ResultToken>>;

    /// Waits until the engine posts a result token.
    async fn read_result(&mut self) -> HsmResult<ResultToken>;

    fn get_port_name(&self) -> String;
}
