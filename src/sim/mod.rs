/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! In-process engine that answers tokens the way the hardware does.
//!
//! The engine runs as a tokio task behind a [`SimMailbox`]. Its asset table
//! counts every create and release so tests can check that operations leave
//! nothing behind. Faults and latency can be injected per token.
pub mod assets;
pub mod eddsa;
pub mod symmetric;

use crate::connection::backend::SimMailbox;
use crate::connection::command::{
    CommandToken, KeyRef, Opcode, RESULT_FLAG_APPROVED, ResultCode, ResultToken, Subcode,
};
use crate::core::asset::{AssetClass, AssetId, AssetPolicy};
use crate::core::config::DMA_MAX_LENGTH;
use crate::core::error::{HsmError, HsmResult};
use crate::crypto::eddsa::{
    ED25519_CURVE_PARAMS, SIGN_INITIAL_MAX, UPDATE_MAX, VERIFY_INITIAL_MAX,
};
use assets::{AssetTable, Owner};
use eddsa::{HashState, SignState};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use symmetric::AeadState;
use tokio::sync::{Mutex, mpsc};
use zeroize::Zeroizing;

pub use assets::AssetStats;

/// Version reported in reply to a version token
pub const FIRMWARE_VERSION: [u8; 3] = [1, 4, 2];
const DEFAULT_CAPACITY: usize = 64;
const ROOT_KEY: [u8; 32] = [0x5A; 32];

/// Operation state parked in a temporary or engine-owned asset.
pub(crate) enum EngineState {
    Mac([u8; symmetric::BLOCK]),
    Aead(Box<AeadState>),
    Hash(HashState),
    Sign(Box<SignState>),
}

struct SimState {
    assets: AssetTable,
    max_transfer: usize,
    latency: Duration,
    faults: Vec<(Subcode, ResultCode)>,
    truncations: Vec<Subcode>,
    seen: Vec<Subcode>,
}

fn approved() -> ResultToken {
    ResultToken {
        code: RESULT_FLAG_APPROVED,
        ..Default::default()
    }
}

impl SimState {
    fn process(&mut self, token: CommandToken) -> ResultToken {
        self.seen.push(token.subcode);

        let fault = self.faults.iter().position(|f| f.0 == token.subcode);
        if let Some(pos) = fault {
            let (_, code) = self.faults.remove(pos);
            warn!("sim: injecting {:?} into {:?}", code, token.subcode);
            return ResultToken::failure(code);
        }
        if token.transfer_len() > self.max_transfer {
            return ResultToken::failure(ResultCode::InvalidLength);
        }

        match self.dispatch(&token) {
            Ok(mut res) => {
                let truncate = self.truncations.iter().position(|s| *s == token.subcode);
                if let Some(pos) = truncate {
                    self.truncations.remove(pos);
                    warn!("sim: truncating the result of {:?}", token.subcode);
                    res.output.pop();
                    res.tag.pop();
                }
                res
            }
            Err(code) => {
                debug!("sim: {:?} failed with {:?}", token.subcode, code);
                ResultToken::failure(code)
            }
        }
    }

    fn dispatch(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        match (token.opcode, token.subcode) {
            (Opcode::System, Subcode::Version) => Ok(ResultToken {
                output: FIRMWARE_VERSION.to_vec(),
                ..Default::default()
            }),
            (Opcode::Asset, Subcode::AssetCreate) => {
                let id = self.assets.create(token.policy, token.size, Owner::Driver)?;
                Ok(ResultToken {
                    asset_id: id,
                    ..Default::default()
                })
            }
            (Opcode::Asset, Subcode::AssetLoadPlaintext) => {
                self.assets.load(token.target, &token.data)?;
                Ok(ResultToken::success())
            }
            (Opcode::Asset, Subcode::AssetLoadDerive) => {
                let KeyRef::Asset(source) = token.key else {
                    return Err(ResultCode::InvalidParameter);
                };
                self.assets.load_derived(token.target, source, &token.aux)?;
                Ok(ResultToken::success())
            }
            (Opcode::Asset, Subcode::AssetDelete) => {
                self.assets.delete(token.target)?;
                Ok(ResultToken::success())
            }
            (Opcode::Crypto, Subcode::Ecb) => {
                let key = self.key_bytes(&token.key)?;
                Ok(ResultToken {
                    output: symmetric::ecb(&key, token)?,
                    ..approved()
                })
            }
            (Opcode::Mac, Subcode::CbcMac) => self.cbc_mac(token),
            (Opcode::Crypto, Subcode::Ccm | Subcode::Gcm) => self.aead(token),
            (Opcode::PublicKey, Subcode::EddsaGenPublicKey) => self.eddsa_public_key(token),
            (Opcode::PublicKey, Subcode::EddsaSignInitial) => self.eddsa_sign_initial(token),
            (Opcode::PublicKey, Subcode::EddsaIntermediateHash) => self.eddsa_hash(token),
            (Opcode::PublicKey, Subcode::EddsaSignUpdate) => self.eddsa_sign_update(token),
            (Opcode::PublicKey, Subcode::EddsaSignFinalize) => self.eddsa_sign_finalize(token),
            (Opcode::PublicKey, Subcode::EddsaVerifyInitial) => self.eddsa_verify_initial(token),
            (Opcode::PublicKey, Subcode::EddsaVerifyFinalize) => self.eddsa_verify_finalize(token),
            _ => Err(ResultCode::InvalidToken),
        }
    }

    fn key_bytes(&self, key: &KeyRef) -> Result<Zeroizing<Vec<u8>>, ResultCode> {
        match key {
            KeyRef::None => Err(ResultCode::InvalidParameter),
            KeyRef::Inline(bytes) => Ok(bytes.clone()),
            KeyRef::Asset(id) => {
                if self.assets.get(*id)?.policy.class() == AssetClass::TemporaryState {
                    return Err(ResultCode::InvalidAsset);
                }
                Ok(Zeroizing::new(self.assets.material(*id)?.to_vec()))
            }
        }
    }

    fn temp_state(&mut self, id: AssetId) -> Result<EngineState, ResultCode> {
        self.assets.take_state(id)?.ok_or(ResultCode::InvalidState)
    }

    fn park(&mut self, id: AssetId, state: EngineState) -> Result<(), ResultCode> {
        self.assets.put_state(id, state)
    }

    fn cbc_mac(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        let key = self.key_bytes(&token.key)?;
        let chain = if token.mode.is_new() {
            [0u8; symmetric::BLOCK]
        } else {
            match self.temp_state(token.target)? {
                EngineState::Mac(chain) => chain,
                _ => return Err(ResultCode::InvalidState),
            }
        };

        let chain = symmetric::cbc_mac(&key, &chain, &token.data)?;
        if token.mode.is_final() {
            return Ok(ResultToken {
                output: chain.to_vec(),
                ..approved()
            });
        }
        self.park(token.target, EngineState::Mac(chain))?;
        Ok(approved())
    }

    fn aead(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        let mut state = if token.mode.is_new() {
            AeadState::start(token, self.key_bytes(&token.key)?)?
        } else {
            match self.temp_state(token.target)? {
                EngineState::Aead(state) if state.matches(token) => *state,
                _ => return Err(ResultCode::InvalidState),
            }
        };

        let output = state.absorb(token)?;
        if token.mode.is_final() {
            let tag = state.finish()?;
            return Ok(ResultToken {
                output,
                tag,
                ..approved()
            });
        }
        self.park(token.target, EngineState::Aead(Box::new(state)))?;
        Ok(ResultToken {
            output,
            ..approved()
        })
    }

    fn check_curve(&self, param: AssetId) -> Result<(), ResultCode> {
        if self.assets.material(param)? != ED25519_CURVE_PARAMS.as_slice() {
            return Err(ResultCode::InvalidParameter);
        }
        Ok(())
    }

    fn private_key(&self, token: &CommandToken) -> Result<eddsa::Expanded, ResultCode> {
        let KeyRef::Asset(id) = token.key else {
            return Err(ResultCode::InvalidParameter);
        };
        eddsa::expand(self.assets.material(id)?)
    }

    fn eddsa_public_key(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        self.check_curve(token.param)?;
        let expanded = self.private_key(token)?;
        if !token.target.is_none() {
            self.assets.load(token.target, &expanded.public)?;
        }
        Ok(ResultToken {
            output: expanded.public.to_vec(),
            ..approved()
        })
    }

    fn eddsa_sign_initial(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.len() > SIGN_INITIAL_MAX {
            return Err(ResultCode::InvalidLength);
        }
        self.check_curve(token.param)?;
        let expanded = self.private_key(token)?;
        if self.assets.material(token.public_key)? != expanded.public.as_slice() {
            return Err(ResultCode::InvalidAsset);
        }

        let (sign, hash) = eddsa::sign_initial(&expanded, &token.data);
        self.park(token.target, EngineState::Hash(hash))?;
        let policy = AssetPolicy::ASYM_EDDSA | AssetPolicy::TEMPORARY;
        let state = self.assets.create(policy, 64, Owner::Engine)?;
        self.park(state, EngineState::Sign(Box::new(sign)))?;

        Ok(ResultToken {
            asset_id: state,
            ..approved()
        })
    }

    fn eddsa_hash(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.is_empty() || token.data.len() % eddsa::HASH_BLOCK != 0 {
            return Err(ResultCode::InvalidLength);
        }
        let EngineState::Hash(mut hash) = self.temp_state(token.target)? else {
            return Err(ResultCode::InvalidState);
        };
        hash.update(&token.data);
        self.park(token.target, EngineState::Hash(hash))?;
        Ok(approved())
    }

    fn eddsa_sign_update(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.len() > UPDATE_MAX || token.aux.len() > VERIFY_INITIAL_MAX {
            return Err(ResultCode::InvalidLength);
        }
        let EngineState::Sign(mut sign) = self.temp_state(token.state)? else {
            return Err(ResultCode::InvalidState);
        };
        let hash = match self.temp_state(token.target) {
            Ok(EngineState::Hash(hash)) => hash,
            _ => {
                self.park(token.state, EngineState::Sign(sign))?;
                return Err(ResultCode::InvalidState);
            }
        };

        let next = eddsa::sign_update(&mut sign, hash, &token.data, &token.aux);
        self.park(token.state, EngineState::Sign(sign))?;
        self.park(token.target, EngineState::Hash(next?))?;
        Ok(approved())
    }

    fn eddsa_sign_finalize(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.len() > UPDATE_MAX {
            return Err(ResultCode::InvalidLength);
        }
        let EngineState::Hash(hash) = self.temp_state(token.target)? else {
            return Err(ResultCode::InvalidState);
        };
        let sig = match &self.assets.get(token.state)?.state {
            Some(EngineState::Sign(sign)) => eddsa::sign_finalize(sign, hash, &token.data)?,
            _ => return Err(ResultCode::InvalidState),
        };

        self.assets.consume(token.state);
        Ok(ResultToken {
            output: sig,
            ..approved()
        })
    }

    fn eddsa_verify_initial(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.len() > VERIFY_INITIAL_MAX {
            return Err(ResultCode::InvalidLength);
        }
        self.check_curve(token.param)?;
        let public = self.assets.material(token.public_key)?;
        let hash = eddsa::verify_initial(public, &token.aux, &token.data)?;
        self.park(token.target, EngineState::Hash(hash))?;
        Ok(approved())
    }

    fn eddsa_verify_finalize(&mut self, token: &CommandToken) -> Result<ResultToken, ResultCode> {
        if token.data.len() > UPDATE_MAX {
            return Err(ResultCode::InvalidLength);
        }
        let EngineState::Hash(hash) = self.temp_state(token.target)? else {
            return Err(ResultCode::InvalidState);
        };
        eddsa::verify_finalize(hash, &token.data)?;
        Ok(approved())
    }
}

/// Handle to a simulated engine. Clones share the same engine.
#[derive(Clone)]
pub struct SimEngine {
    state: Arc<Mutex<SimState>>,
    root_key: AssetId,
}

impl Default for SimEngine {
    fn default() -> Self {
        SimEngine::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        SimEngine::with_limits(DEFAULT_CAPACITY, DMA_MAX_LENGTH)
    }

    /// Engine holding at most `capacity` assets and accepting at most
    /// `max_transfer` payload bytes per token.
    pub fn with_limits(capacity: usize, max_transfer: usize) -> Self {
        let mut assets = AssetTable::new(capacity + 1);
        let policy = AssetPolicy::SYM_HASH_MAC | AssetPolicy::NON_MODIFIABLE;
        let root_key = assets
            .create(policy, ROOT_KEY.len(), Owner::Provisioned)
            .and_then(|id| assets.load(id, &ROOT_KEY).map(|_| id))
            .unwrap_or(AssetId::NONE);

        SimEngine {
            state: Arc::new(Mutex::new(SimState {
                assets,
                max_transfer,
                latency: Duration::ZERO,
                faults: Vec::new(),
                truncations: Vec::new(),
                seen: Vec::new(),
            })),
            root_key,
        }
    }

    /// Starts an engine task and returns the mailbox in front of it. Must be
    /// called from within a tokio runtime.
    pub fn mailbox(&self) -> SimMailbox {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<CommandToken>(1);
        let (res_tx, res_rx) = mpsc::channel::<ResultToken>(1);
        let state = self.state.clone();

        tokio::spawn(async move {
            while let Some(token) = cmd_rx.recv().await {
                let latency = state.lock().await.latency;
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let res = state.lock().await.process(token);
                if res_tx.send(res).await.is_err() {
                    break;
                }
            }
            debug!("sim: engine task stopped");
        });

        SimMailbox::new("sim-engine", cmd_tx, res_rx)
    }

    /// Device-unique key usable as a derivation source.
    pub fn root_key(&self) -> AssetId {
        self.root_key
    }

    pub async fn stats(&self) -> AssetStats {
        self.state.lock().await.assets.stats()
    }

    /// Counted assets still present in the table.
    pub async fn live_assets(&self) -> Vec<AssetId> {
        self.state.lock().await.assets.live_ids()
    }

    /// Makes the next token with `subcode` fail with `code` without being
    /// executed.
    pub async fn fail_next(&self, subcode: Subcode, code: ResultCode) {
        self.state.lock().await.faults.push((subcode, code));
    }

    /// Executes the next token with `subcode` but drops the last byte of its
    /// output and tag.
    pub async fn truncate_next(&self, subcode: Subcode) {
        self.state.lock().await.truncations.push(subcode);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Number of tokens with `subcode` the engine has received.
    pub async fn token_count(&self, subcode: Subcode) -> usize {
        self.state
            .lock()
            .await
            .seen
            .iter()
            .filter(|s| **s == subcode)
            .count()
    }

    /// Installs key material outside of the mailbox, the way a key store
    /// provisions its slots. Such assets are not counted.
    pub async fn provision_key(&self, policy: AssetPolicy, material: &[u8]) -> HsmResult<AssetId> {
        let mut state = self.state.lock().await;
        let id = state
            .assets
            .create(policy, material.len(), Owner::Provisioned)
            .map_err(|code| HsmError::HardwareError(code as i8))?;
        state
            .assets
            .load(id, material)
            .map_err(|code| HsmError::HardwareError(code as i8))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TokenEngine;
    use crate::connection::command::TokenMode;

    async fn linked_engine(sim: &SimEngine) -> TokenEngine {
        let mut engine = TokenEngine::new(Box::new(sim.mailbox()), Duration::from_secs(2));
        engine.link().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_version_handshake() {
        let sim = SimEngine::new();
        let _engine = linked_engine(&sim).await;
        assert_eq!(sim.token_count(Subcode::Version).await, 1);
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let sim = SimEngine::new();
        let mut engine = linked_engine(&sim).await;
        sim.fail_next(Subcode::AssetCreate, ResultCode::Full).await;

        let token = CommandToken::asset_create(AssetPolicy::SYM_AES_MAC, 16);
        let res = engine.transact(token.clone()).await.unwrap();
        assert_eq!(res.status(), Some(ResultCode::Full));
        assert_eq!(engine.result_code(), ResultCode::Full as i8);

        let res = engine.transact(token).await.unwrap();
        assert!(res.is_success());
        assert_eq!(res.asset_id, AssetId(assets::FIRST_ASSET_ID + 1));
    }

    #[tokio::test]
    async fn test_oversized_token_rejected() {
        let sim = SimEngine::with_limits(8, 1024);
        let mut engine = linked_engine(&sim).await;
        let token = CommandToken::new(Opcode::Mac, Subcode::CbcMac)
            .with_key(KeyRef::Inline(Zeroizing::new(vec![0u8; 16])))
            .with_mode(TokenMode::InitToFinal)
            .with_data(&[0u8; 1040]);
        let res = engine.transact(token).await.unwrap();
        assert_eq!(res.status(), Some(ResultCode::InvalidLength));
    }

    #[tokio::test]
    async fn test_polling_and_blocking_agree() {
        let sim = SimEngine::new();
        let mut engine = linked_engine(&sim).await;
        let token = CommandToken::new(Opcode::Crypto, Subcode::Ecb)
            .with_key(KeyRef::Inline(Zeroizing::new(vec![0x2Bu8; 16])))
            .with_data(&[0u8; 16]);

        let blocking = engine.transact(token.clone()).await.unwrap();
        engine.set_behavior(crate::core::config::ReturnBehavior::Polling);
        let polled = engine.transact(token).await.unwrap();
        assert_eq!(blocking.output, polled.output);
        assert!(polled.is_success());
    }
}
