/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! AES-CCM and AES-GCM.
//!
//! A segmented operation goes through
//! `setup -> set_lengths -> set_nonce -> update_aad* -> update* -> finish | verify`.
//! The declared lengths are binding: every call is checked against the totals
//! accumulated before it, and the closing call fails unless both totals match
//! exactly.
use crate::connection::command::{CommandToken, Direction, KeyRef, Opcode, Subcode, TokenMode};
use crate::core::asset::{AssetPolicy, AssetRole, AssetSet};
use crate::core::config::ReturnBehavior;
use crate::core::device::Hsm;
use crate::core::error::{HsmError, HsmResult};
use crate::core::key::{CryptoKey, KeyAlgorithm, KeySource, KeyUsage, ResolvedKey};
use crate::core::lock::EngineSession;
use crate::core::utilities::constant_time_eq;
use crate::crypto::cmac::AES_KEY_SIZES;
use crate::crypto::protocol::{
    Callback, Completion, Dispatcher, OperationKind, Payload, expect_len, expect_success,
};
use crate::crypto::segment::{AES_BLOCK, BlockBuffer, chunk_len, plan_chunks};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use zeroize::{Zeroize, Zeroizing};

/// Size of the temporary asset holding the running AEAD state
const AEAD_STATE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadMode {
    Ccm,
    Gcm,
}

impl AeadMode {
    fn subcode(&self) -> Subcode {
        match self {
            AeadMode::Ccm => Subcode::Ccm,
            AeadMode::Gcm => Subcode::Gcm,
        }
    }

    fn policy(&self, direction: Direction) -> AssetPolicy {
        let mode = match self {
            AeadMode::Ccm => AssetPolicy::MODE_CCM,
            AeadMode::Gcm => AssetPolicy::MODE_GCM,
        };
        let dir = match direction {
            Direction::Encrypt => AssetPolicy::DIR_ENC_GEN,
            Direction::Decrypt => AssetPolicy::DIR_DEC_VRFY,
        };
        AssetPolicy::SYM_AES_AUTH | mode | dir
    }

    pub fn check_nonce(&self, len: usize) -> HsmResult<()> {
        let ok = match self {
            AeadMode::Ccm => (7..=13).contains(&len),
            AeadMode::Gcm => len == 12,
        };
        if !ok {
            return Err(HsmError::invalid(format!("{:?} does not take a {} byte nonce", self, len)));
        }
        Ok(())
    }

    /// CCM encodes the payload length in the `15 - nonce_len` bytes left
    /// over by the nonce.
    pub fn check_payload(&self, nonce_len: usize, data_len: usize) -> HsmResult<()> {
        if *self != AeadMode::Ccm {
            return Ok(());
        }
        let field_bits = 8 * (15 - nonce_len.min(13)) as u32;
        if field_bits < usize::BITS && data_len >> field_bits != 0 {
            return Err(HsmError::invalid(format!(
                "{} byte payload does not fit a CCM length field of {} bytes",
                data_len,
                field_bits / 8
            )));
        }
        Ok(())
    }

    pub fn check_tag(&self, len: usize) -> HsmResult<()> {
        let ok = match self {
            AeadMode::Ccm => (4..=16).contains(&len) && len % 2 == 0,
            AeadMode::Gcm => matches!(len, 4 | 8 | 12..=16),
        };
        if !ok {
            return Err(HsmError::invalid(format!("{:?} does not take a {} byte tag", self, len)));
        }
        Ok(())
    }
}

/// Ciphertext and tag of an encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl Payload for Sealed {
    fn into_payload(mut self) -> Vec<u8> {
        self.ciphertext.append(&mut self.tag);
        self.ciphertext
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Fresh,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AeadPhase {
    Init,
    Setup,
    LengthsSet,
    NonceSet,
    Aad,
    Data,
}

impl AeadPhase {
    fn name(&self) -> &'static str {
        match self {
            AeadPhase::Init => "init",
            AeadPhase::Setup => "setup",
            AeadPhase::LengthsSet => "lengths-set",
            AeadPhase::NonceSet => "nonce-set",
            AeadPhase::Aad => "aad",
            AeadPhase::Data => "data",
        }
    }

    /// True once the caller has fed input into the operation.
    fn has_input(&self) -> bool {
        matches!(self, AeadPhase::Aad | AeadPhase::Data)
    }
}

struct AeadState {
    phase: AeadPhase,
    direction: Direction,
    stream: Stream,
    key: KeyRef,
    assets: AssetSet,
    aad_len: usize,
    data_len: usize,
    tag_len: usize,
    nonce: Vec<u8>,
    aad: BlockBuffer,
    data: BlockBuffer,
}

impl AeadState {
    fn new() -> Self {
        AeadState {
            phase: AeadPhase::Init,
            direction: Direction::Encrypt,
            stream: Stream::Fresh,
            key: KeyRef::None,
            assets: AssetSet::new(),
            aad_len: 0,
            data_len: 0,
            tag_len: 0,
            nonce: Vec::new(),
            aad: BlockBuffer::new(),
            data: BlockBuffer::new(),
        }
    }

    fn require(&self, allowed: &[AeadPhase]) -> HsmResult<()> {
        if !allowed.contains(&self.phase) {
            return Err(HsmError::BadState(self.phase.name()));
        }
        Ok(())
    }

    async fn setup(
        &mut self,
        session: &mut EngineSession,
        mode: AeadMode,
        key: &KeySource,
        direction: Direction,
    ) -> HsmResult<()> {
        let policy = mode.policy(direction);
        match session.materialize_key(key, policy, true).await? {
            ResolvedKey::Inline(key) => self.key = key,
            ResolvedKey::Asset(handle) => {
                self.key = KeyRef::Asset(handle.id());
                self.assets
                    .insert(AssetRole::Key, handle)
                    .map_err(|_| HsmError::BadState("key slot in use"))?;
            }
        }
        self.direction = direction;
        self.phase = AeadPhase::Setup;
        Ok(())
    }

    async fn create_temp(&mut self, session: &mut EngineSession, mode: AeadMode) -> HsmResult<()> {
        let policy = mode.policy(self.direction) | AssetPolicy::TEMPORARY;
        let temp = session.create_asset(policy, AEAD_STATE_SIZE).await?;
        debug!("AEAD state asset {}", temp.id());
        self.assets
            .insert(AssetRole::Temp, temp)
            .map_err(|_| HsmError::BadState("temp slot in use"))
    }

    fn token(&self, mode: AeadMode, token_mode: TokenMode) -> CommandToken {
        let mut token = CommandToken::new(Opcode::Crypto, mode.subcode())
            .with_mode(token_mode)
            .with_target(self.assets.get(AssetRole::Temp));
        token.direction = self.direction;
        if token_mode.is_new() {
            token.key = self.key.clone();
            token.nonce = self.nonce.clone();
            token.tag_len = self.tag_len;
            token.total_aad_len = self.aad_len as u64;
            token.total_data_len = self.data_len as u64;
        }
        token
    }

    async fn absorb_aad(
        &mut self,
        session: &mut EngineSession,
        mode: AeadMode,
        chunk: usize,
        aad: &[u8],
    ) -> HsmResult<()> {
        let ready = self.aad.push(aad);
        for range in plan_chunks(ready.len(), chunk) {
            let mut token = self.token(mode, TokenMode::aad_only(self.stream == Stream::Fresh));
            token.aad = ready[range].to_vec();
            let res = session.exchange(token).await?;
            expect_success(&res, "AEAD associated data")?;
            self.stream = Stream::Open;
        }
        self.phase = AeadPhase::Aad;
        Ok(())
    }

    async fn absorb_data(
        &mut self,
        session: &mut EngineSession,
        mode: AeadMode,
        chunk: usize,
        data: &[u8],
    ) -> HsmResult<Vec<u8>> {
        let ready = self.data.push(data);
        let mut out = Vec::with_capacity(ready.len());
        for (i, range) in plan_chunks(ready.len(), chunk).into_iter().enumerate() {
            let fresh = self.stream == Stream::Fresh;
            let mut token = self.token(mode, TokenMode::from_flags(fresh, false));
            if i == 0 {
                // Held-back associated data rides on the first payload token.
                token.aad = self.aad.take().to_vec();
            }
            token.data = ready[range].to_vec();
            let res = session.exchange(token).await?;
            expect_success(&res, "AEAD update")?;
            out.extend_from_slice(&res.output);
            self.stream = Stream::Open;
        }
        self.phase = AeadPhase::Data;
        Ok(out)
    }

    /// Sends the closing token and returns the last output bytes and the tag.
    async fn close(
        &mut self,
        session: &mut EngineSession,
        mode: AeadMode,
        aad: &[u8],
        data: &[u8],
    ) -> HsmResult<(Vec<u8>, Vec<u8>)> {
        let fresh = self.stream == Stream::Fresh;
        let mut token = self.token(mode, TokenMode::from_flags(fresh, true));
        token.aad = aad.to_vec();
        token.data = data.to_vec();
        let res = session.exchange(token).await?;
        expect_success(&res, "AEAD final")?;

        expect_len(res.tag.len(), self.tag_len, "AEAD tag")?;
        Ok((res.output, res.tag))
    }

    async fn finish(
        &mut self,
        session: &mut EngineSession,
        mode: AeadMode,
    ) -> HsmResult<(Vec<u8>, Vec<u8>)> {
        let aad = self.aad.take();
        let data = self.data.take();
        self.close(session, mode, &aad, &data).await
    }

    /// Totals must match the declared lengths once `extra` more payload
    /// bytes are in.
    fn check_totals(&self, extra: usize) -> HsmResult<()> {
        let (aad, data) = (self.aad.total() as usize, self.data.total() as usize + extra);
        if aad != self.aad_len || data != self.data_len {
            return Err(HsmError::invalid(format!(
                "declared {}/{} bytes of aad/data, got {}/{}",
                self.aad_len, self.data_len, aad, data
            )));
        }
        Ok(())
    }

    async fn release(&mut self, session: &mut EngineSession) -> HsmResult<()> {
        self.phase = AeadPhase::Init;
        self.stream = Stream::Fresh;
        self.key = KeyRef::None;
        self.nonce.zeroize();
        self.aad.reset();
        self.data.reset();
        self.assets.release_all(session).await
    }

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

fn check_declared(aad_len: usize, data_len: usize) -> HsmResult<()> {
    if aad_len == 0 && data_len == 0 {
        return Err(HsmError::invalid("nothing to authenticate"));
    }
    Ok(())
}

/// One AEAD operation, one-shot or segmented.
pub struct AeadContext {
    dispatch: Dispatcher,
    mode: AeadMode,
    state: Arc<Mutex<AeadState>>,
}

impl AeadContext {
    pub fn new(hsm: &Hsm, mode: AeadMode) -> Self {
        AeadContext {
            dispatch: Dispatcher::new(hsm),
            mode,
            state: Arc::new(Mutex::new(AeadState::new())),
        }
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.dispatch.set_callback(callback);
        self
    }

    pub fn set_return_behavior(&mut self, behavior: ReturnBehavior) -> HsmResult<()> {
        self.dispatch.set_behavior(behavior)
    }

    pub fn mode(&self) -> AeadMode {
        self.mode
    }

    fn max_transfer(&self) -> usize {
        self.dispatch.hsm().config().max_transfer_len
    }

    /// Payload per token, leaving room for one block of held-back
    /// associated data.
    fn chunk(&self) -> usize {
        chunk_len(self.max_transfer() - AES_BLOCK)
    }

    async fn fetch_key(&self, key: &CryptoKey) -> HsmResult<KeySource> {
        KeySource::fetch(
            key,
            self.dispatch.hsm().key_store(),
            KeyUsage::Aead,
            KeyAlgorithm::Aes,
            &AES_KEY_SIZES,
        )
        .await
    }

    async fn lock_state(&self, allowed: &[AeadPhase]) -> HsmResult<OwnedMutexGuard<AeadState>> {
        let state = self.state.clone().lock_owned().await;
        state.require(allowed)?;
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    async fn one_shot(
        state: &mut AeadState,
        session: &mut EngineSession,
        mode: AeadMode,
        source: &KeySource,
        direction: Direction,
        nonce: &[u8],
        aad: &[u8],
        data: &[u8],
        tag_len: usize,
        max_transfer: usize,
        chunk: usize,
    ) -> HsmResult<(Vec<u8>, Vec<u8>)> {
        state.setup(session, mode, source, direction).await?;
        state.aad_len = aad.len();
        state.data_len = data.len();
        state.tag_len = tag_len;
        state.nonce = nonce.to_vec();

        if aad.len() + data.len() <= max_transfer {
            return state.close(session, mode, aad, data).await;
        }

        debug!(
            "{:?} input of {} bytes needs several tokens",
            mode,
            aad.len() + data.len()
        );
        state.create_temp(session, mode).await?;
        if !aad.is_empty() {
            state.absorb_aad(session, mode, chunk, aad).await?;
        }
        Self::close_with(state, session, mode, chunk, data).await
    }

    pub async fn encrypt(
        &self,
        key: &CryptoKey,
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        tag_len: usize,
    ) -> HsmResult<Completion<Sealed>> {
        self.mode.check_nonce(nonce.len())?;
        self.mode.check_tag(tag_len)?;
        self.mode.check_payload(nonce.len(), plaintext.len())?;
        check_declared(aad.len(), plaintext.len())?;
        let source = self.fetch_key(key).await?;

        let mut state = self.lock_state(&[AeadPhase::Init]).await?;
        let mut session = self.dispatch.session().await?;
        let (mode, max_transfer, chunk) = (self.mode, self.max_transfer(), self.chunk());
        let (nonce, aad) = (nonce.to_vec(), aad.to_vec());
        let plaintext = Zeroizing::new(plaintext.to_vec());

        self.dispatch
            .complete(OperationKind::AeadEncrypt, async move {
                let res = Self::one_shot(
                    &mut state,
                    &mut session,
                    mode,
                    &source,
                    Direction::Encrypt,
                    &nonce,
                    &aad,
                    &plaintext,
                    tag_len,
                    max_transfer,
                    chunk,
                )
                .await;
                let (ciphertext, tag) = state.settle(&mut session, res, true).await?;
                Ok(Sealed { ciphertext, tag })
            })
            .await
    }

    /// Decrypts and authenticates in one call. No plaintext is returned
    /// unless the tag matches.
    pub async fn decrypt(
        &self,
        key: &CryptoKey,
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> HsmResult<Completion<Vec<u8>>> {
        self.mode.check_nonce(nonce.len())?;
        self.mode.check_tag(tag.len())?;
        self.mode.check_payload(nonce.len(), ciphertext.len())?;
        check_declared(aad.len(), ciphertext.len())?;
        let source = self.fetch_key(key).await?;

        let mut state = self.lock_state(&[AeadPhase::Init]).await?;
        let mut session = self.dispatch.session().await?;
        let (mode, max_transfer, chunk) = (self.mode, self.max_transfer(), self.chunk());
        let (nonce, aad) = (nonce.to_vec(), aad.to_vec());
        let (ciphertext, expected) = (ciphertext.to_vec(), tag.to_vec());

        self.dispatch
            .complete(OperationKind::AeadDecrypt, async move {
                let res = Self::one_shot(
                    &mut state,
                    &mut session,
                    mode,
                    &source,
                    Direction::Decrypt,
                    &nonce,
                    &aad,
                    &ciphertext,
                    expected.len(),
                    max_transfer,
                    chunk,
                )
                .await;
                let (mut plaintext, computed) = state.settle(&mut session, res, true).await?;
                if !constant_time_eq(&computed, &expected) {
                    plaintext.zeroize();
                    return Err(HsmError::MacInvalid);
                }
                Ok(plaintext)
            })
            .await
    }

    pub async fn encrypt_setup(&self, key: &CryptoKey) -> HsmResult<Completion<()>> {
        self.setup(key, Direction::Encrypt).await
    }

    pub async fn decrypt_setup(&self, key: &CryptoKey) -> HsmResult<Completion<()>> {
        self.setup(key, Direction::Decrypt).await
    }

    async fn setup(&self, key: &CryptoKey, direction: Direction) -> HsmResult<Completion<()>> {
        let source = self.fetch_key(key).await?;

        let mut state = self.lock_state(&[AeadPhase::Init]).await?;
        let mut session = self.dispatch.session().await?;
        let mode = self.mode;

        self.dispatch
            .complete(OperationKind::AeadSetup, async move {
                let res = async {
                    state.setup(&mut session, mode, &source, direction).await?;
                    state.create_temp(&mut session, mode).await
                }
                .await;
                state.settle(&mut session, res, false).await
            })
            .await
    }

    /// Declares the total associated data, payload and tag lengths.
    pub async fn set_lengths(
        &self,
        aad_len: usize,
        data_len: usize,
        tag_len: usize,
    ) -> HsmResult<()> {
        check_declared(aad_len, data_len)?;
        self.mode.check_tag(tag_len)?;

        let mut state = self.lock_state(&[AeadPhase::Setup]).await?;
        state.aad_len = aad_len;
        state.data_len = data_len;
        state.tag_len = tag_len;
        state.phase = AeadPhase::LengthsSet;
        Ok(())
    }

    pub async fn set_nonce(&self, nonce: &[u8]) -> HsmResult<()> {
        self.mode.check_nonce(nonce.len())?;

        let mut state = self.lock_state(&[AeadPhase::LengthsSet]).await?;
        self.mode.check_payload(nonce.len(), state.data_len)?;
        state.nonce = nonce.to_vec();
        state.phase = AeadPhase::NonceSet;
        Ok(())
    }

    pub async fn update_aad(&self, aad: &[u8]) -> HsmResult<Completion<()>> {
        if aad.is_empty() {
            return Err(HsmError::invalid("update_aad needs at least one byte"));
        }

        let mut state = self
            .lock_state(&[AeadPhase::NonceSet, AeadPhase::Aad])
            .await?;
        if state.aad.total() as usize + aad.len() > state.aad_len {
            return Err(HsmError::invalid(format!(
                "associated data exceeds the declared {} bytes",
                state.aad_len
            )));
        }
        let mut session = self.dispatch.session().await?;
        let (mode, chunk, aad) = (self.mode, self.chunk(), aad.to_vec());

        self.dispatch
            .complete(OperationKind::AeadUpdate, async move {
                let res = state.absorb_aad(&mut session, mode, chunk, &aad).await;
                state.settle(&mut session, res, false).await
            })
            .await
    }

    /// Feeds payload bytes and returns the output for every whole block the
    /// engine has processed. The last block is held back until
    /// [`finish`](Self::finish) or [`verify`](Self::verify).
    pub async fn update(&self, data: &[u8]) -> HsmResult<Completion<Vec<u8>>> {
        if data.is_empty() {
            return Err(HsmError::invalid("update needs at least one byte"));
        }

        let mut state = self
            .lock_state(&[AeadPhase::NonceSet, AeadPhase::Aad, AeadPhase::Data])
            .await?;
        if state.aad.total() as usize != state.aad_len {
            return Err(HsmError::invalid(format!(
                "{} of {} bytes of associated data supplied before the payload",
                state.aad.total(),
                state.aad_len
            )));
        }
        if state.data.total() as usize + data.len() > state.data_len {
            return Err(HsmError::invalid(format!(
                "payload exceeds the declared {} bytes",
                state.data_len
            )));
        }
        let mut session = self.dispatch.session().await?;
        let (mode, chunk, data) = (self.mode, self.chunk(), Zeroizing::new(data.to_vec()));

        self.dispatch
            .complete(OperationKind::AeadUpdate, async move {
                let res = state.absorb_data(&mut session, mode, chunk, &data).await;
                state.settle(&mut session, res, false).await
            })
            .await
    }

    /// Feeds the last `data` (may be empty) and closes an encryption,
    /// returning the remaining ciphertext and the tag.
    pub async fn finish(&self, data: &[u8]) -> HsmResult<Completion<Sealed>> {
        let mut state = self
            .lock_state(&[AeadPhase::NonceSet, AeadPhase::Aad, AeadPhase::Data])
            .await?;
        if state.direction != Direction::Encrypt {
            return Err(HsmError::BadState("decrypting"));
        }
        state.check_totals(data.len())?;
        let mut session = self.dispatch.session().await?;
        let (mode, chunk, data) = (self.mode, self.chunk(), Zeroizing::new(data.to_vec()));

        self.dispatch
            .complete(OperationKind::AeadFinalize, async move {
                let res = Self::close_with(&mut state, &mut session, mode, chunk, &data).await;
                let (ciphertext, tag) = state.settle(&mut session, res, true).await?;
                Ok(Sealed { ciphertext, tag })
            })
            .await
    }

    /// Feeds the last `data` (may be empty), closes a decryption and checks
    /// `tag`, returning the remaining plaintext.
    pub async fn verify(&self, data: &[u8], tag: &[u8]) -> HsmResult<Completion<Vec<u8>>> {
        let mut state = self
            .lock_state(&[AeadPhase::NonceSet, AeadPhase::Aad, AeadPhase::Data])
            .await?;
        if state.direction != Direction::Decrypt {
            return Err(HsmError::BadState("encrypting"));
        }
        if tag.len() != state.tag_len {
            return Err(HsmError::invalid(format!(
                "expected a {} byte tag, got {}",
                state.tag_len,
                tag.len()
            )));
        }
        state.check_totals(data.len())?;
        let mut session = self.dispatch.session().await?;
        let (mode, chunk) = (self.mode, self.chunk());
        let (data, expected) = (data.to_vec(), tag.to_vec());

        self.dispatch
            .complete(OperationKind::AeadFinalize, async move {
                let res = Self::close_with(&mut state, &mut session, mode, chunk, &data).await;
                let (mut plaintext, computed) = state.settle(&mut session, res, true).await?;
                if !constant_time_eq(&computed, &expected) {
                    plaintext.zeroize();
                    return Err(HsmError::MacInvalid);
                }
                Ok(plaintext)
            })
            .await
    }

    async fn close_with(
        state: &mut AeadState,
        session: &mut EngineSession,
        mode: AeadMode,
        chunk: usize,
        data: &[u8],
    ) -> HsmResult<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        if !data.is_empty() {
            out = state.absorb_data(session, mode, chunk, data).await?;
        }
        let (rest, tag) = state.finish(session, mode).await?;
        out.extend_from_slice(&rest);
        Ok((out, tag))
    }

    /// Abandons the running operation. Same rules as
    /// [`MacContext::cancel`](crate::crypto::cmac::MacContext::cancel).
    pub async fn cancel(&self) -> HsmResult<()> {
        self.dispatch.cancel_flag().request();
        let mut state = self.state.lock().await;

        let res = match state.phase {
            AeadPhase::Init => Ok(()),
            phase => match self.dispatch.session().await {
                Ok(mut session) => {
                    let freed = state.release(&mut session).await;
                    if phase.has_input() {
                        self.dispatch
                            .notify_error(OperationKind::AeadUpdate, HsmError::Cancelled);
                    }
                    freed
                }
                Err(e) => Err(e),
            },
        };

        self.dispatch.cancel_flag().clear();
        res
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.phase == AeadPhase::Init
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(AeadMode::Ccm, 7, true)]
    #[case(AeadMode::Ccm, 13, true)]
    #[case(AeadMode::Ccm, 14, false)]
    #[case(AeadMode::Ccm, 6, false)]
    #[case(AeadMode::Gcm, 12, true)]
    #[case(AeadMode::Gcm, 16, false)]
    fn test_nonce_lengths(#[case] mode: AeadMode, #[case] len: usize, #[case] ok: bool) {
        assert_eq!(mode.check_nonce(len).is_ok(), ok);
    }

    #[rstest]
    #[case(AeadMode::Ccm, 4, true)]
    #[case(AeadMode::Ccm, 5, false)]
    #[case(AeadMode::Ccm, 16, true)]
    #[case(AeadMode::Ccm, 18, false)]
    #[case(AeadMode::Gcm, 8, true)]
    #[case(AeadMode::Gcm, 10, false)]
    #[case(AeadMode::Gcm, 13, true)]
    fn test_tag_lengths(#[case] mode: AeadMode, #[case] len: usize, #[case] ok: bool) {
        assert_eq!(mode.check_tag(len).is_ok(), ok);
    }

    #[rstest]
    #[case(AeadMode::Ccm, 13, 0xFFFF, true)]
    #[case(AeadMode::Ccm, 13, 0x1_0000, false)]
    #[case(AeadMode::Ccm, 12, 0x1_0000, true)]
    #[case(AeadMode::Ccm, 7, usize::MAX, true)]
    #[case(AeadMode::Gcm, 12, 0x1_0000, true)]
    fn test_ccm_length_field(
        #[case] mode: AeadMode,
        #[case] nonce: usize,
        #[case] len: usize,
        #[case] ok: bool,
    ) {
        assert_eq!(mode.check_payload(nonce, len).is_ok(), ok);
    }

    #[test]
    fn test_sealed_payload_layout() {
        let sealed = Sealed {
            ciphertext: vec![1, 2, 3],
            tag: vec![9, 9],
        };
        assert_eq!(sealed.into_payload(), vec![1, 2, 3, 9, 9]);
    }
}
