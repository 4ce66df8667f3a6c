/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! AES-CMAC and raw CBC-MAC over the engine's CBC-MAC primitive.
//!
//! The engine only chains blocks. Subkey derivation and the final-block rule
//! of CMAC run on the host: the final block is XORed with K1 when the message
//! is a positive multiple of the block size, and padded with `0x80` and XORed
//! with K2 otherwise.
use crate::connection::command::{CommandToken, KeyRef, Opcode, Subcode, TokenMode};
use crate::core::asset::{AssetHandle, AssetId, AssetPolicy, AssetRole, AssetSet};
use crate::core::config::ReturnBehavior;
use crate::core::device::Hsm;
use crate::core::error::{HsmError, HsmResult};
use crate::core::key::{CryptoKey, KeyAlgorithm, KeySource, KeyUsage, ResolvedKey};
use crate::core::lock::EngineSession;
use crate::core::utilities::{constant_time_eq, xor_in_place};
use crate::crypto::protocol::{
    Callback, Completion, Dispatcher, OperationKind, expect_success, fixed_output,
};
use crate::crypto::segment::{AES_BLOCK, BlockBuffer, chunk_len, plan_chunks};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::{Zeroize, Zeroizing};

pub const AES_KEY_SIZES: [usize; 3] = [16, 24, 32];
pub const MAX_MAC_LEN: usize = 16;
const RB: u8 = 0x87;

/// Doubles `block` in GF(2^128).
pub fn double_block(block: &[u8; AES_BLOCK]) -> [u8; AES_BLOCK] {
    let mut out = [0u8; AES_BLOCK];
    let mut carry = 0u8;
    for i in (0..AES_BLOCK).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if block[0] & 0x80 != 0 {
        out[AES_BLOCK - 1] ^= RB;
    }
    out
}

pub struct Subkeys {
    pub k1: [u8; AES_BLOCK],
    pub k2: [u8; AES_BLOCK],
}

impl Drop for Subkeys {
    fn drop(&mut self) {
        self.k1.zeroize();
        self.k2.zeroize();
    }
}

/// K1 and K2 from `l`, the encryption of the zero block.
pub fn derive_subkeys(l: &[u8; AES_BLOCK]) -> Subkeys {
    let k1 = double_block(l);
    let k2 = double_block(&k1);
    Subkeys { k1, k2 }
}

/// Final CMAC block from the last 0..=16 message bytes.
pub fn prepare_final_block(last: &[u8], subkeys: &Subkeys) -> [u8; AES_BLOCK] {
    let mut block = [0u8; AES_BLOCK];
    if last.len() == AES_BLOCK {
        block.copy_from_slice(last);
        xor_in_place(&mut block, &subkeys.k1);
    } else {
        block[..last.len()].copy_from_slice(last);
        block[last.len()] = 0x80;
        xor_in_place(&mut block, &subkeys.k2);
    }
    block
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacMode {
    Cmac,
    CbcMac,
}

impl MacMode {
    fn key_policy(&self, direction: MacDirection) -> AssetPolicy {
        let mode = match self {
            MacMode::Cmac => AssetPolicy::MODE_CMAC,
            MacMode::CbcMac => AssetPolicy::MODE_CBC_MAC,
        };
        let dir = match direction {
            MacDirection::Sign => AssetPolicy::DIR_ENC_GEN,
            MacDirection::Verify => AssetPolicy::DIR_DEC_VRFY,
        };
        AssetPolicy::SYM_AES_MAC | mode | dir
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacDirection {
    Sign,
    Verify,
}

/// Whether the engine already holds chaining state for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Fresh,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacPhase {
    Init,
    Setup { direction: MacDirection },
    Updating {
        direction: MacDirection,
        stream: Stream,
    },
}

impl MacPhase {
    fn name(&self) -> &'static str {
        match self {
            MacPhase::Init => "init",
            MacPhase::Setup { .. } => "setup",
            MacPhase::Updating { .. } => "updating",
        }
    }

    fn direction(&self) -> Option<MacDirection> {
        match self {
            MacPhase::Init => None,
            MacPhase::Setup { direction } | MacPhase::Updating { direction, .. } => {
                Some(*direction)
            }
        }
    }
}

struct MacState {
    phase: MacPhase,
    assets: AssetSet,
    subkeys: Option<Subkeys>,
    buffer: BlockBuffer,
}

impl MacState {
    fn new() -> Self {
        MacState {
            phase: MacPhase::Init,
            assets: AssetSet::new(),
            subkeys: None,
            buffer: BlockBuffer::new(),
        }
    }

    fn key_id(&self) -> AssetId {
        self.assets.get(AssetRole::Key)
    }

    fn keep(&mut self, role: AssetRole, handle: AssetHandle) -> HsmResult<()> {
        self.assets
            .insert(role, handle)
            .map_err(|_| HsmError::BadState("asset slot already in use"))
    }

    async fn setup(
        &mut self,
        session: &mut EngineSession,
        mode: MacMode,
        key: &KeySource,
        direction: MacDirection,
    ) -> HsmResult<()> {
        let ResolvedKey::Asset(handle) = session
            .materialize_key(key, mode.key_policy(direction), false)
            .await?
        else {
            return Err(HsmError::BadState("key not in an asset"));
        };
        let key_ref = KeyRef::Asset(handle.id());
        self.keep(AssetRole::Key, handle)?;

        if mode == MacMode::Cmac {
            let token = CommandToken::new(Opcode::Crypto, Subcode::Ecb)
                .with_key(key_ref)
                .with_data(&[0u8; AES_BLOCK]);
            let res = session.exchange(token).await?;
            expect_success(&res, "Subkey derivation")?;

            let l: Zeroizing<[u8; AES_BLOCK]> =
                Zeroizing::new(fixed_output(&res.output, "Subkey derivation")?);
            self.subkeys = Some(derive_subkeys(&l));
        }

        self.phase = MacPhase::Setup { direction };
        debug!("{:?} setup done with key {}", mode, self.key_id());
        Ok(())
    }

    async fn temp_asset(&mut self, session: &mut EngineSession) -> HsmResult<AssetId> {
        if !self.assets.contains(AssetRole::Temp) {
            let temp = session
                .create_asset(AssetPolicy::SYM_AES_MAC | AssetPolicy::TEMPORARY, AES_BLOCK)
                .await?;
            self.keep(AssetRole::Temp, temp)?;
        }
        Ok(self.assets.get(AssetRole::Temp))
    }

    async fn absorb(
        &mut self,
        session: &mut EngineSession,
        chunk: usize,
        data: &[u8],
    ) -> HsmResult<()> {
        let Some(direction) = self.phase.direction() else {
            return Err(HsmError::BadState(self.phase.name()));
        };
        let mut stream = match self.phase {
            MacPhase::Updating { stream, .. } => stream,
            _ => Stream::Fresh,
        };

        let ready = self.buffer.push(data);
        if !ready.is_empty() {
            let temp = self.temp_asset(session).await?;
            for range in plan_chunks(ready.len(), chunk) {
                let token = CommandToken::new(Opcode::Mac, Subcode::CbcMac)
                    .with_key(KeyRef::Asset(self.key_id()))
                    .with_mode(TokenMode::from_flags(stream == Stream::Fresh, false))
                    .with_target(temp)
                    .with_data(&ready[range]);
                let res = session.exchange(token).await?;
                expect_success(&res, "MAC update")?;
                stream = Stream::Open;
            }
        }

        self.phase = MacPhase::Updating { direction, stream };
        Ok(())
    }

    async fn finish(
        &mut self,
        session: &mut EngineSession,
        mode: MacMode,
    ) -> HsmResult<[u8; AES_BLOCK]> {
        let stream = match self.phase {
            MacPhase::Updating { stream, .. } => stream,
            MacPhase::Setup { .. } => Stream::Fresh,
            MacPhase::Init => return Err(HsmError::BadState(self.phase.name())),
        };

        let last = self.buffer.take();
        let final_block: Zeroizing<Vec<u8>> = match (mode, &self.subkeys) {
            (MacMode::Cmac, Some(subkeys)) => {
                Zeroizing::new(prepare_final_block(&last, subkeys).to_vec())
            }
            (MacMode::Cmac, None) => return Err(HsmError::BadState("subkeys missing")),
            (MacMode::CbcMac, _) => last,
        };

        let target = match stream {
            Stream::Open => self.assets.get(AssetRole::Temp),
            Stream::Fresh => AssetId::NONE,
        };
        let token = CommandToken::new(Opcode::Mac, Subcode::CbcMac)
            .with_key(KeyRef::Asset(self.key_id()))
            .with_mode(TokenMode::from_flags(stream == Stream::Fresh, true))
            .with_target(target)
            .with_data(&final_block);
        let res = session.exchange(token).await?;
        expect_success(&res, "MAC final")?;

        fixed_output(&res.output, "MAC final")
    }

    /// Frees every asset and returns to `Init`.
    async fn release(&mut self, session: &mut EngineSession) -> HsmResult<()> {
        self.phase = MacPhase::Init;
        self.subkeys = None;
        self.buffer.reset();
        self.assets.release_all(session).await
    }

    /// Runs cleanup after a step. Errors tear the operation down; a cleanup
    /// failure on an otherwise successful final step is reported.
    async fn settle<T>(
        &mut self,
        session: &mut EngineSession,
        res: HsmResult<T>,
        terminal: bool,
    ) -> HsmResult<T> {
        match res {
            Ok(v) if terminal => {
                self.release(session).await?;
                Ok(v)
            }
            Ok(v) => Ok(v),
            Err(e) => {
                if let Err(free_err) = self.release(session).await {
                    warn!("Cleanup after {} also failed: {}", e, free_err);
                }
                Err(e)
            }
        }
    }
}

fn check_mac_len(len: usize) -> HsmResult<()> {
    if !(1..=MAX_MAC_LEN).contains(&len) {
        return Err(HsmError::invalid(format!(
            "MAC length must be 1..={}, got {}",
            MAX_MAC_LEN, len
        )));
    }
    Ok(())
}

/// One MAC operation, one-shot or segmented. A context runs one operation at a
/// time and can be reused once it is back in its initial phase.
pub struct MacContext {
    dispatch: Dispatcher,
    mode: MacMode,
    state: Arc<Mutex<MacState>>,
}

impl MacContext {
    pub fn new(hsm: &Hsm, mode: MacMode) -> Self {
        MacContext {
            dispatch: Dispatcher::new(hsm),
            mode,
            state: Arc::new(Mutex::new(MacState::new())),
        }
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.dispatch.set_callback(callback);
        self
    }

    pub fn set_return_behavior(&mut self, behavior: ReturnBehavior) -> HsmResult<()> {
        self.dispatch.set_behavior(behavior)
    }

    pub fn mode(&self) -> MacMode {
        self.mode
    }

    fn chunk(&self) -> usize {
        chunk_len(self.dispatch.hsm().config().max_transfer_len)
    }

    async fn fetch_key(&self, key: &CryptoKey) -> HsmResult<KeySource> {
        KeySource::fetch(
            key,
            self.dispatch.hsm().key_store(),
            KeyUsage::Mac,
            KeyAlgorithm::Aes,
            &AES_KEY_SIZES,
        )
        .await
    }

    fn check_cbc_mac_len(&self, len: u64) -> HsmResult<()> {
        if self.mode == MacMode::CbcMac && (len == 0 || len % AES_BLOCK as u64 != 0) {
            return Err(HsmError::invalid("CBC-MAC input must be a non-empty multiple of 16 bytes"));
        }
        Ok(())
    }

    /// Computes a `mac_len` byte MAC over `message` in one call.
    pub async fn sign(
        &self,
        key: &CryptoKey,
        message: &[u8],
        mac_len: usize,
    ) -> HsmResult<Completion<Vec<u8>>> {
        check_mac_len(mac_len)?;
        self.check_cbc_mac_len(message.len() as u64)?;
        let source = self.fetch_key(key).await?;

        let mut state = self.state.clone().lock_owned().await;
        if state.phase != MacPhase::Init {
            return Err(HsmError::BadState(state.phase.name()));
        }
        let mut session = self.dispatch.session().await?;
        let (mode, chunk, message) = (self.mode, self.chunk(), Zeroizing::new(message.to_vec()));

        self.dispatch
            .complete(OperationKind::MacSign, async move {
                let res = async {
                    state
                        .setup(&mut session, mode, &source, MacDirection::Sign)
                        .await?;
                    if !message.is_empty() {
                        state.absorb(&mut session, chunk, &message).await?;
                    }
                    state.finish(&mut session, mode).await
                }
                .await;
                let mac = state.settle(&mut session, res, true).await?;
                Ok(mac[..mac_len].to_vec())
            })
            .await
    }

    /// Checks `mac` over `message` in one call.
    pub async fn verify(
        &self,
        key: &CryptoKey,
        message: &[u8],
        mac: &[u8],
    ) -> HsmResult<Completion<()>> {
        check_mac_len(mac.len())?;
        self.check_cbc_mac_len(message.len() as u64)?;
        let source = self.fetch_key(key).await?;

        let mut state = self.state.clone().lock_owned().await;
        if state.phase != MacPhase::Init {
            return Err(HsmError::BadState(state.phase.name()));
        }
        let mut session = self.dispatch.session().await?;
        let (mode, chunk) = (self.mode, self.chunk());
        let (message, expected) = (Zeroizing::new(message.to_vec()), mac.to_vec());

        self.dispatch
            .complete(OperationKind::MacVerify, async move {
                let res = async {
                    state
                        .setup(&mut session, mode, &source, MacDirection::Verify)
                        .await?;
                    if !message.is_empty() {
                        state.absorb(&mut session, chunk, &message).await?;
                    }
                    state.finish(&mut session, mode).await
                }
                .await;
                let computed = state.settle(&mut session, res, true).await?;
                if !constant_time_eq(&computed[..expected.len()], &expected) {
                    return Err(HsmError::MacInvalid);
                }
                Ok(())
            })
            .await
    }

    pub async fn sign_setup(&self, key: &CryptoKey) -> HsmResult<Completion<()>> {
        self.setup(key, MacDirection::Sign).await
    }

    pub async fn verify_setup(&self, key: &CryptoKey) -> HsmResult<Completion<()>> {
        self.setup(key, MacDirection::Verify).await
    }

    async fn setup(&self, key: &CryptoKey, direction: MacDirection) -> HsmResult<Completion<()>> {
        let source = self.fetch_key(key).await?;

        let mut state = self.state.clone().lock_owned().await;
        if state.phase != MacPhase::Init {
            return Err(HsmError::BadState(state.phase.name()));
        }
        let mut session = self.dispatch.session().await?;
        let mode = self.mode;

        self.dispatch
            .complete(OperationKind::MacSetup, async move {
                let res = state.setup(&mut session, mode, &source, direction).await;
                state.settle(&mut session, res, false).await
            })
            .await
    }

    /// Feeds more message bytes. Whole blocks go to the engine at once; the
    /// final block is held back for [`sign_finish`](Self::sign_finish) or
    /// [`verify_finish`](Self::verify_finish).
    pub async fn update(&self, data: &[u8]) -> HsmResult<Completion<()>> {
        if data.is_empty() {
            return Err(HsmError::invalid("update needs at least one byte"));
        }

        let mut state = self.state.clone().lock_owned().await;
        if state.phase == MacPhase::Init {
            return Err(HsmError::BadState(state.phase.name()));
        }
        let mut session = self.dispatch.session().await?;
        let (chunk, data) = (self.chunk(), Zeroizing::new(data.to_vec()));

        self.dispatch
            .complete(OperationKind::MacUpdate, async move {
                let res = state.absorb(&mut session, chunk, &data).await;
                state.settle(&mut session, res, false).await
            })
            .await
    }

    /// Feeds the last `data` (may be empty) and returns the MAC.
    pub async fn sign_finish(&self, data: &[u8], mac_len: usize) -> HsmResult<Completion<Vec<u8>>> {
        check_mac_len(mac_len)?;

        let mut state = self.state.clone().lock_owned().await;
        if state.phase.direction() != Some(MacDirection::Sign) {
            return Err(HsmError::BadState(state.phase.name()));
        }
        self.check_cbc_mac_len(state.buffer.total() + data.len() as u64)?;
        let mut session = self.dispatch.session().await?;
        let (mode, chunk, data) = (self.mode, self.chunk(), Zeroizing::new(data.to_vec()));

        self.dispatch
            .complete(OperationKind::MacFinalize, async move {
                let res = async {
                    if !data.is_empty() {
                        state.absorb(&mut session, chunk, &data).await?;
                    }
                    state.finish(&mut session, mode).await
                }
                .await;
                let mac = state.settle(&mut session, res, true).await?;
                Ok(mac[..mac_len].to_vec())
            })
            .await
    }

    /// Feeds the last `data` (may be empty) and checks `mac`.
    pub async fn verify_finish(&self, data: &[u8], mac: &[u8]) -> HsmResult<Completion<()>> {
        check_mac_len(mac.len())?;

        let mut state = self.state.clone().lock_owned().await;
        if state.phase.direction() != Some(MacDirection::Verify) {
            return Err(HsmError::BadState(state.phase.name()));
        }
        self.check_cbc_mac_len(state.buffer.total() + data.len() as u64)?;
        let mut session = self.dispatch.session().await?;
        let (mode, chunk) = (self.mode, self.chunk());
        let (data, expected) = (Zeroizing::new(data.to_vec()), mac.to_vec());

        self.dispatch
            .complete(OperationKind::MacFinalize, async move {
                let res = async {
                    if !data.is_empty() {
                        state.absorb(&mut session, chunk, &data).await?;
                    }
                    state.finish(&mut session, mode).await
                }
                .await;
                let computed = state.settle(&mut session, res, true).await?;
                if !constant_time_eq(&computed[..expected.len()], &expected) {
                    return Err(HsmError::MacInvalid);
                }
                Ok(())
            })
            .await
    }

    /// Abandons the running operation. Waits for a token sequence in flight,
    /// frees the operation's assets and resets the context. The callback hears
    /// about it only if message data had been submitted.
    pub async fn cancel(&self) -> HsmResult<()> {
        self.dispatch.cancel_flag().request();
        let mut state = self.state.lock().await;

        let res = match state.phase {
            MacPhase::Init => Ok(()),
            phase => match self.dispatch.session().await {
                Ok(mut session) => {
                    let freed = state.release(&mut session).await;
                    if matches!(phase, MacPhase::Updating { .. }) {
                        self.dispatch
                            .notify_error(OperationKind::MacUpdate, HsmError::Cancelled);
                    }
                    freed
                }
                Err(e) => Err(e),
            },
        };

        self.dispatch.cancel_flag().clear();
        res
    }

    /// True when no operation is set up on this context.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.phase == MacPhase::Init
    }
}
