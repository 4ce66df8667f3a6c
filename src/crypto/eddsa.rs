/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Ed25519 over the engine's phased signature primitive.
//!
//! Each phase accepts a bounded amount of message. Longer messages are pushed
//! through the intermediate-hash token first, which feeds whole SHA-512 blocks
//! into the running hash held in the temporary asset. Signing hashes the
//! message twice (once for the nonce, once for the challenge):
//!
//! ```text
//! sign:   INITIAL -> HASH* -> UPDATE -> HASH* -> FINALIZE
//! verify: INITIAL -> HASH* -> FINALIZE
//! ```
use crate::connection::command::{CommandToken, KeyRef, Opcode, ResultCode, ResultToken, Subcode};
use crate::core::asset::{AssetHandle, AssetId, AssetPolicy, AssetRole, AssetSet};
use crate::core::config::ReturnBehavior;
use crate::core::device::Hsm;
use crate::core::error::{HsmError, HsmResult};
use crate::core::key::{CryptoKey, KeyAlgorithm, KeySource, KeyUsage, ResolvedKey};
use crate::core::lock::EngineSession;
use crate::core::utilities::align_down;
use crate::crypto::protocol::{
    Callback, Completion, Dispatcher, OperationKind, expect_len, expect_success, fixed_output,
};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Message bytes carried by the initial signing token
pub const SIGN_INITIAL_MAX: usize = 96;
/// Message bytes carried by an update or finalize token
pub const UPDATE_MAX: usize = 4095;
/// Message head re-hashed after the nonce is known
pub const SIGN_FINALIZE_MAX: usize = 64;
/// Message bytes carried by the initial verification token
pub const VERIFY_INITIAL_MAX: usize = 64;
pub const HASH_BLOCK: usize = 128;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
const SEED_LEN: usize = 32;
const HASH_STATE_SIZE: usize = 2 * HASH_BLOCK;

/// Edwards25519 domain parameters as the engine expects them: the field prime,
/// the group order, the curve constant `d` and the base point, each 32 bytes
/// little endian.
pub const ED25519_CURVE_PARAMS: [u8; 128] = curve_params();

/// Low half of the group order l
const ORDER_LOW: [u8; 16] = [
    0xED, 0xD3, 0xF5, 0x5C, 0x1A, 0x63, 0x12, 0x58, 0xD6, 0x9C, 0xF7, 0xA2, 0xDE, 0xF9, 0xDE, 0x14,
];
/// d = -121665/121666
const CURVE_D: [u8; 32] = [
    0xA3, 0x78, 0x59, 0x13, 0xCA, 0x4D, 0xEB, 0x75, 0xAB, 0xD8, 0x41, 0x41, 0x4D, 0x0A, 0x70, 0x00,
    0x98, 0xE8, 0x79, 0x77, 0x79, 0x40, 0xC7, 0x8C, 0x73, 0xFE, 0x6F, 0x2B, 0xEE, 0x6C, 0x03, 0x52,
];

const fn curve_params() -> [u8; 128] {
    let mut out = [0u8; 128];

    // p = 2^255 - 19
    out[0] = 0xED;
    let mut i = 1;
    while i < 31 {
        out[i] = 0xFF;
        i += 1;
    }
    out[31] = 0x7F;

    // l = 2^252 + 27742317777372353535851937790883648493
    i = 0;
    while i < ORDER_LOW.len() {
        out[32 + i] = ORDER_LOW[i];
        i += 1;
    }
    out[63] = 0x10;

    i = 0;
    while i < CURVE_D.len() {
        out[64 + i] = CURVE_D[i];
        i += 1;
    }

    // y coordinate of the base point, 4/5
    out[96] = 0x58;
    i = 97;
    while i < 128 {
        out[i] = 0x66;
        i += 1;
    }
    out
}

/// Most message bytes a closing phase takes in one token.
pub fn tail_limit(max_transfer: usize) -> usize {
    UPDATE_MAX.min(max_transfer)
}

/// Bytes to push through one intermediate-hash token when `remaining` bytes
/// are left. Two hash blocks are always kept for the closing phase.
pub fn intermediate_len(remaining: usize, max_transfer: usize) -> usize {
    let mut len = remaining - 2 * HASH_BLOCK;
    if len > max_transfer {
        len = max_transfer - 4 * HASH_BLOCK;
    }
    align_down(len, HASH_BLOCK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignStep {
    Initial,
    NonceHash { offset: usize },
    Update { offset: usize },
    ChallengeHash { offset: usize },
    Finalize { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyStep {
    Initial,
    Hash { offset: usize },
    Finalize { offset: usize },
}

enum Next<S, T> {
    Step(S),
    Done(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Idle,
    PublicKey,
    Signing(SignStep),
    Verifying(VerifyStep),
}

struct EddsaState {
    activity: Activity,
    assets: AssetSet,
}

fn map_initial(res: &ResultToken) -> HsmResult<()> {
    match res.status() {
        Some(ResultCode::InvalidAsset) => Err(HsmError::PublicKeyNotOnCurve),
        _ => expect_success(res, "EdDSA initial"),
    }
}

impl EddsaState {
    fn new() -> Self {
        EddsaState {
            activity: Activity::Idle,
            assets: AssetSet::new(),
        }
    }

    fn keep(&mut self, role: AssetRole, handle: AssetHandle) -> HsmResult<AssetId> {
        let id = handle.id();
        self.assets
            .insert(role, handle)
            .map_err(|_| HsmError::BadState("asset slot already in use"))?;
        Ok(id)
    }

    async fn load_private(
        &mut self,
        session: &mut EngineSession,
        key: &KeySource,
    ) -> HsmResult<AssetId> {
        let policy = AssetPolicy::ASYM_EDDSA | AssetPolicy::DIR_ENC_GEN;
        match session.materialize_key(key, policy, false).await? {
            ResolvedKey::Asset(handle) => self.keep(AssetRole::PrivateKey, handle),
            ResolvedKey::Inline(_) => Err(HsmError::BadState("private key not in an asset")),
        }
    }

    async fn load_param(&mut self, session: &mut EngineSession) -> HsmResult<AssetId> {
        let param = session
            .create_asset(AssetPolicy::ASYM_CURVE, ED25519_CURVE_PARAMS.len())
            .await?;
        let id = self.keep(AssetRole::Param, param)?;
        let handle_ref = AssetHandle::borrowed(id);
        session
            .load_plaintext(&handle_ref, &ED25519_CURVE_PARAMS)
            .await?;
        Ok(id)
    }

    async fn create_public(
        &mut self,
        session: &mut EngineSession,
        policy: AssetPolicy,
    ) -> HsmResult<AssetId> {
        let public = session.create_asset(policy, PUBLIC_KEY_LEN).await?;
        self.keep(AssetRole::PublicKey, public)
    }

    async fn create_temp(&mut self, session: &mut EngineSession) -> HsmResult<AssetId> {
        let policy = AssetPolicy::SYM_HASH_MAC | AssetPolicy::TEMPORARY;
        let temp = session.create_asset(policy, HASH_STATE_SIZE).await?;
        self.keep(AssetRole::Temp, temp)
    }

    async fn derive_public(&mut self, session: &mut EngineSession) -> HsmResult<Vec<u8>> {
        let mut token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaGenPublicKey)
            .with_key(KeyRef::Asset(self.assets.get(AssetRole::PrivateKey)))
            .with_target(self.assets.get(AssetRole::PublicKey));
        token.param = self.assets.get(AssetRole::Param);
        let res = session.exchange(token).await?;
        expect_success(&res, "EdDSA public key")?;
        expect_len(res.output.len(), PUBLIC_KEY_LEN, "EdDSA public key")?;
        Ok(res.output)
    }

    async fn hash_chunk(&mut self, session: &mut EngineSession, chunk: &[u8]) -> HsmResult<()> {
        let token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaIntermediateHash)
            .with_target(self.assets.get(AssetRole::Temp))
            .with_data(chunk);
        let res = session.exchange(token).await?;
        expect_success(&res, "EdDSA intermediate hash")
    }

    /// Step after message bytes up to `offset` went into the running hash.
    fn after_prefix(
        message: &[u8],
        offset: usize,
        tail_max: usize,
        hash: SignStep,
        close: SignStep,
    ) -> SignStep {
        if message.len() - offset > tail_max {
            hash
        } else {
            close
        }
    }

    async fn sign_step(
        &mut self,
        session: &mut EngineSession,
        step: SignStep,
        message: &[u8],
        max_transfer: usize,
    ) -> HsmResult<Next<SignStep, [u8; SIGNATURE_LEN]>> {
        self.activity = Activity::Signing(step);
        let temp = self.assets.get(AssetRole::Temp);

        let next = match step {
            SignStep::Initial => {
                let head = message.len().min(SIGN_INITIAL_MAX);
                let mut token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaSignInitial)
                    .with_key(KeyRef::Asset(self.assets.get(AssetRole::PrivateKey)))
                    .with_target(temp)
                    .with_data(&message[..head]);
                token.public_key = self.assets.get(AssetRole::PublicKey);
                token.param = self.assets.get(AssetRole::Param);

                let res = session.exchange(token).await?;
                map_initial(&res)?;
                if res.asset_id.is_none() {
                    return Err(HsmError::ResourceError("engine returned no signing state".into()));
                }
                self.keep(AssetRole::State, AssetHandle::created(res.asset_id))?;

                Self::after_prefix(
                    message,
                    head,
                    tail_limit(max_transfer),
                    SignStep::NonceHash { offset: head },
                    SignStep::Update { offset: head },
                )
            }
            SignStep::NonceHash { offset } | SignStep::ChallengeHash { offset } => {
                let len = intermediate_len(message.len() - offset, max_transfer);
                let chunk = &message[offset..offset + len];
                self.hash_chunk(session, chunk).await?;
                let offset = offset + len;

                if matches!(step, SignStep::NonceHash { .. }) {
                    Self::after_prefix(
                        message,
                        offset,
                        tail_limit(max_transfer),
                        SignStep::NonceHash { offset },
                        SignStep::Update { offset },
                    )
                } else {
                    Self::after_prefix(
                        message,
                        offset,
                        tail_limit(max_transfer),
                        SignStep::ChallengeHash { offset },
                        SignStep::Finalize { offset },
                    )
                }
            }
            SignStep::Update { offset } => {
                let head = message.len().min(SIGN_FINALIZE_MAX);
                let mut token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaSignUpdate)
                    .with_target(temp)
                    .with_data(&message[offset..]);
                token.state = self.assets.get(AssetRole::State);
                token.aux = message[..head].to_vec();

                let res = session.exchange(token).await?;
                expect_success(&res, "EdDSA update")?;

                Self::after_prefix(
                    message,
                    head,
                    tail_limit(max_transfer),
                    SignStep::ChallengeHash { offset: head },
                    SignStep::Finalize { offset: head },
                )
            }
            SignStep::Finalize { offset } => {
                let mut token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaSignFinalize)
                    .with_target(temp)
                    .with_data(&message[offset..]);
                token.state = self.assets.get(AssetRole::State);

                let res = session.exchange(token).await?;
                expect_success(&res, "EdDSA finalize")?;
                // The engine drops the signing state once it has produced R || S.
                if let Some(state) = self.assets.take(AssetRole::State) {
                    state.consumed_by_engine();
                }

                let sig: [u8; SIGNATURE_LEN] = fixed_output(&res.output, "EdDSA finalize")?;
                return Ok(Next::Done(sig));
            }
        };
        Ok(Next::Step(next))
    }

    async fn verify_step(
        &mut self,
        session: &mut EngineSession,
        step: VerifyStep,
        message: &[u8],
        signature: &[u8],
        max_transfer: usize,
    ) -> HsmResult<Next<VerifyStep, ()>> {
        self.activity = Activity::Verifying(step);
        let temp = self.assets.get(AssetRole::Temp);

        let offset = match step {
            VerifyStep::Initial => {
                let head = message.len().min(VERIFY_INITIAL_MAX);
                let mut token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaVerifyInitial)
                    .with_target(temp)
                    .with_data(&message[..head]);
                token.public_key = self.assets.get(AssetRole::PublicKey);
                token.param = self.assets.get(AssetRole::Param);
                token.aux = signature.to_vec();

                let res = session.exchange(token).await?;
                map_initial(&res)?;
                head
            }
            VerifyStep::Hash { offset } => {
                let len = intermediate_len(message.len() - offset, max_transfer);
                let chunk = &message[offset..offset + len];
                self.hash_chunk(session, chunk).await?;
                offset + len
            }
            VerifyStep::Finalize { offset } => {
                let token = CommandToken::new(Opcode::PublicKey, Subcode::EddsaVerifyFinalize)
                    .with_target(temp)
                    .with_data(&message[offset..]);
                let res = session.exchange(token).await?;
                return match res.status() {
                    Some(ResultCode::VerifyError) => Err(HsmError::InvalidSignature),
                    _ => expect_success(&res, "EdDSA verify").map(Next::Done),
                };
            }
        };

        if message.len() - offset > tail_limit(max_transfer) {
            Ok(Next::Step(VerifyStep::Hash { offset }))
        } else {
            Ok(Next::Step(VerifyStep::Finalize { offset }))
        }
    }

    async fn run_sign(
        &mut self,
        session: &mut EngineSession,
        message: &[u8],
        max_transfer: usize,
    ) -> HsmResult<[u8; SIGNATURE_LEN]> {
        let mut step = SignStep::Initial;
        loop {
            match self.sign_step(session, step, message, max_transfer).await? {
                Next::Step(next) => step = next,
                Next::Done(sig) => return Ok(sig),
            }
        }
    }

    async fn run_verify(
        &mut self,
        session: &mut EngineSession,
        message: &[u8],
        signature: &[u8],
        max_transfer: usize,
    ) -> HsmResult<()> {
        let mut step = VerifyStep::Initial;
        loop {
            let next = self
                .verify_step(session, step, message, signature, max_transfer)
                .await?;
            match next {
                Next::Step(next) => step = next,
                Next::Done(()) => return Ok(()),
            }
        }
    }

    async fn release(&mut self, session: &mut EngineSession) -> HsmResult<()> {
        self.activity = Activity::Idle;
        self.assets.release_all(session).await
    }

    async fn settle<T>(&mut self, session: &mut EngineSession, res: HsmResult<T>) -> HsmResult<T> {
        let at = self.activity;
        match res {
            Ok(v) => {
                self.release(session).await?;
                Ok(v)
            }
            Err(e) => {
                if !e.is_verification_failure() {
                    warn!("EdDSA failed during {:?}: {}", at, e);
                }
                if let Err(free_err) = self.release(session).await {
                    warn!("Cleanup after {} also failed: {}", e, free_err);
                }
                Err(e)
            }
        }
    }
}

fn check_message(message: &[u8]) -> HsmResult<()> {
    if message.is_empty() {
        return Err(HsmError::invalid("message must not be empty"));
    }
    Ok(())
}

/// Ed25519 signing, verification and public key derivation.
pub struct EddsaContext {
    dispatch: Dispatcher,
    state: Arc<Mutex<EddsaState>>,
}

impl EddsaContext {
    pub fn new(hsm: &Hsm) -> Self {
        EddsaContext {
            dispatch: Dispatcher::new(hsm),
            state: Arc::new(Mutex::new(EddsaState::new())),
        }
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.dispatch.set_callback(callback);
        self
    }

    pub fn set_return_behavior(&mut self, behavior: ReturnBehavior) -> HsmResult<()> {
        self.dispatch.set_behavior(behavior)
    }

    fn max_transfer(&self) -> usize {
        self.dispatch.hsm().config().max_transfer_len
    }

    async fn fetch_private(&self, key: &CryptoKey) -> HsmResult<KeySource> {
        KeySource::fetch(
            key,
            self.dispatch.hsm().key_store(),
            KeyUsage::Sign,
            KeyAlgorithm::Ed25519,
            &[SEED_LEN],
        )
        .await
    }

    pub async fn generate_public_key(
        &self,
        private: &CryptoKey,
    ) -> HsmResult<Completion<[u8; PUBLIC_KEY_LEN]>> {
        let source = self.fetch_private(private).await?;

        let mut state = self.state.clone().lock_owned().await;
        let mut session = self.dispatch.session().await?;

        self.dispatch
            .complete(OperationKind::GeneratePublicKey, async move {
                let res = async {
                    state.activity = Activity::PublicKey;
                    state.load_private(&mut session, &source).await?;
                    state.load_param(&mut session).await?;
                    let policy = AssetPolicy::ASYM_EDDSA | AssetPolicy::DIR_DEC_VRFY;
                    state.create_public(&mut session, policy).await?;
                    state.derive_public(&mut session).await
                }
                .await;
                let public = state.settle(&mut session, res).await?;

                let mut out = [0u8; PUBLIC_KEY_LEN];
                out.copy_from_slice(&public);
                Ok(out)
            })
            .await
    }

    pub async fn sign(
        &self,
        private: &CryptoKey,
        message: &[u8],
    ) -> HsmResult<Completion<[u8; SIGNATURE_LEN]>> {
        check_message(message)?;
        let source = self.fetch_private(private).await?;

        let mut state = self.state.clone().lock_owned().await;
        let mut session = self.dispatch.session().await?;
        let (max_transfer, message) = (self.max_transfer(), message.to_vec());

        self.dispatch
            .complete(OperationKind::Sign, async move {
                let res = async {
                    state.load_private(&mut session, &source).await?;
                    state.load_param(&mut session).await?;
                    let policy = AssetPolicy::ASYM_EDDSA | AssetPolicy::DIR_ENC_GEN;
                    state.create_public(&mut session, policy).await?;
                    state.create_temp(&mut session).await?;
                    state.derive_public(&mut session).await?;

                    state.run_sign(&mut session, &message, max_transfer).await
                }
                .await;
                let sig = state.settle(&mut session, res).await?;
                info!("Signed {} byte message", message.len());
                Ok(sig)
            })
            .await
    }

    /// Checks `signature` over `message` under the 32 byte `public_key`.
    pub async fn verify(
        &self,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> HsmResult<Completion<()>> {
        check_message(message)?;
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(HsmError::invalid(format!("public key must be {} bytes", PUBLIC_KEY_LEN)));
        }
        if signature.len() != SIGNATURE_LEN {
            return Err(HsmError::invalid(format!("signature must be {} bytes", SIGNATURE_LEN)));
        }

        let mut state = self.state.clone().lock_owned().await;
        let mut session = self.dispatch.session().await?;
        let max_transfer = self.max_transfer();
        let public_key = public_key.to_vec();
        let (message, signature) = (message.to_vec(), signature.to_vec());

        self.dispatch
            .complete(OperationKind::Verify, async move {
                let res = async {
                    let policy = AssetPolicy::ASYM_EDDSA | AssetPolicy::DIR_DEC_VRFY;
                    let public = state.create_public(&mut session, policy).await?;
                    session
                        .load_plaintext(&AssetHandle::borrowed(public), &public_key)
                        .await?;
                    state.load_param(&mut session).await?;
                    state.create_temp(&mut session).await?;

                    state
                        .run_verify(&mut session, &message, &signature, max_transfer)
                        .await
                }
                .await;
                state.settle(&mut session, res).await
            })
            .await
    }

    /// Stops a running sign or verify after its current token. The callback
    /// reports `Cancelled`; with nothing running this does nothing.
    pub async fn cancel(&self) -> HsmResult<()> {
        self.dispatch.cancel_flag().request();
        let state = self.state.lock().await;
        debug!("EdDSA cancel found context in {:?}", state.activity);
        drop(state);
        self.dispatch.cancel_flag().clear();
        Ok(())
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.activity == Activity::Idle
    }
}
