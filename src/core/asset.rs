/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Hardware-resident assets and the client that provisions them.
//!
//! Every asset the driver creates is represented by an [`AssetHandle`]. Handles
//! are move-only and [`EngineSession::free_asset`] consumes them, so an id can
//! only be released once. Handles for assets owned by the key store carry
//! `driver_created == false` and are never sent to the engine for deletion.
use crate::connection::command::{CommandToken, ResultCode, ResultToken};
use crate::core::error::{HsmError, HsmResult};
use crate::core::lock::EngineSession;
use log::{debug, error, warn};
use std::fmt;
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AssetId(pub u32);

impl AssetId {
    pub const NONE: AssetId = AssetId(0);

    pub fn is_none(&self) -> bool {
        *self == AssetId::NONE
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssetPolicy(pub u32);

impl AssetPolicy {
    pub const SYM_HASH_MAC: AssetPolicy = AssetPolicy(0x0001_2800);
    pub const SYM_AES_MAC: AssetPolicy = AssetPolicy(0x0002_2800);
    pub const SYM_AES_BULK: AssetPolicy = AssetPolicy(0x0003_2800);
    pub const SYM_AES_AUTH: AssetPolicy = AssetPolicy(0x0004_2800);
    pub const ASYM_EDDSA: AssetPolicy = AssetPolicy(0x0008_4000);
    pub const ASYM_CURVE: AssetPolicy = AssetPolicy(0x0009_4000);

    pub const NON_MODIFIABLE: AssetPolicy = AssetPolicy(0x0000_0001);
    pub const TEMPORARY: AssetPolicy = AssetPolicy(0x0000_0002);

    pub const DIR_ENC_GEN: AssetPolicy = AssetPolicy(0x0010_0000);
    pub const DIR_DEC_VRFY: AssetPolicy = AssetPolicy(0x0020_0000);

    pub const MODE_ECB: AssetPolicy = AssetPolicy(0x0000_0000);
    pub const MODE_CMAC: AssetPolicy = AssetPolicy(0x0000_0000);
    pub const MODE_CBC_MAC: AssetPolicy = AssetPolicy(0x0800_0000);
    pub const MODE_CCM: AssetPolicy = AssetPolicy(0x0000_0000);
    pub const MODE_GCM: AssetPolicy = AssetPolicy(0x0800_0000);

    const FAMILY_MASK: u32 = 0x000F_F800;

    pub fn contains(&self, other: AssetPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    /// Algorithm family bits, without direction, mode or persistence flags.
    pub fn family(&self) -> AssetPolicy {
        AssetPolicy(self.0 & Self::FAMILY_MASK)
    }

    pub fn class(&self) -> AssetClass {
        if self.contains(AssetPolicy::TEMPORARY) {
            AssetClass::TemporaryState
        } else if self.family() == AssetPolicy::ASYM_CURVE {
            AssetClass::CurveParameter
        } else {
            AssetClass::Key
        }
    }
}

impl BitOr for AssetPolicy {
    type Output = AssetPolicy;

    fn bitor(self, rhs: AssetPolicy) -> AssetPolicy {
        AssetPolicy(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    Key,
    TemporaryState,
    CurveParameter,
}

/// Owned reference to an engine asset.
#[derive(Debug)]
pub struct AssetHandle {
    id: AssetId,
    driver_created: bool,
    released: bool,
}

impl AssetHandle {
    pub(crate) fn created(id: AssetId) -> Self {
        AssetHandle {
            id,
            driver_created: true,
            released: false,
        }
    }

    /// Wraps an asset owned by someone else, typically the key store.
    pub fn borrowed(id: AssetId) -> Self {
        AssetHandle {
            id,
            driver_created: false,
            released: false,
        }
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn driver_created(&self) -> bool {
        self.driver_created
    }

    /// Hands ownership of the id to the engine, which releases it on its own.
    pub(crate) fn consumed_by_engine(mut self) {
        self.released = true;
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        if self.driver_created && !self.released {
            warn!("Asset {} dropped without being freed", self.id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    Key,
    PrivateKey,
    PublicKey,
    Param,
    Temp,
    State,
}

/// Scratch assets of a single operation, one per role.
#[derive(Debug, Default)]
pub struct AssetSet {
    slots: Vec<(AssetRole, AssetHandle)>,
}

impl AssetSet {
    pub fn new() -> Self {
        AssetSet::default()
    }

    /// Stores `handle` under `role`. A role holds at most one asset; an
    /// occupied slot hands the new handle back to the caller.
    pub fn insert(&mut self, role: AssetRole, handle: AssetHandle) -> Result<(), AssetHandle> {
        if self.contains(role) {
            return Err(handle);
        }
        self.slots.push((role, handle));
        Ok(())
    }

    pub fn contains(&self, role: AssetRole) -> bool {
        self.slots.iter().any(|(r, _)| *r == role)
    }

    /// Id held under `role`, or [`AssetId::NONE`].
    pub fn get(&self, role: AssetRole) -> AssetId {
        self.slots
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, h)| h.id())
            .unwrap_or(AssetId::NONE)
    }

    pub fn take(&mut self, role: AssetRole) -> Option<AssetHandle> {
        let pos = self.slots.iter().position(|(r, _)| *r == role)?;
        Some(self.slots.remove(pos).1)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Frees every asset in the set, continuing past failures. Returns the
    /// first error seen.
    pub async fn release_all(&mut self, session: &mut EngineSession) -> HsmResult<()> {
        let mut first_err = None;
        for (role, handle) in self.slots.drain(..) {
            let id = handle.id();
            if let Err(e) = session.free_asset(handle).await {
                error!("Failed to free {:?} asset {}: {}", role, id, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl EngineSession {
    pub async fn create_asset(
        &mut self,
        policy: AssetPolicy,
        size: usize,
    ) -> HsmResult<AssetHandle> {
        if size == 0 {
            return Err(HsmError::invalid("asset size must be non-zero"));
        }

        let res = self
            .exchange(CommandToken::asset_create(policy, size))
            .await?;

        if !res.is_success() {
            error!("Asset create failed with code {}", res.masked());
            return Err(HsmError::ResourceError(format!(
                "asset create failed with code {}",
                res.masked()
            )));
        }
        if res.asset_id.is_none() {
            return Err(HsmError::ResourceError("engine returned no asset id".into()));
        }

        debug!(
            "Created asset {} ({:?}, {} bytes)",
            res.asset_id,
            policy.class(),
            size
        );
        Ok(AssetHandle::created(res.asset_id))
    }

    pub async fn load_plaintext(&mut self, asset: &AssetHandle, data: &[u8]) -> HsmResult<()> {
        if data.is_empty() {
            return Err(HsmError::invalid("cannot load an empty buffer"));
        }

        let res = self
            .exchange(CommandToken::asset_load_plaintext(asset.id(), data))
            .await?;
        check_asset_result(&res, "load")
    }

    /// Derives key material for `dest` from `source` inside the engine.
    pub async fn load_derived(
        &mut self,
        dest: &AssetHandle,
        source: AssetId,
        label: &[u8],
    ) -> HsmResult<()> {
        if label.is_empty() {
            return Err(HsmError::invalid("derivation label must not be empty"));
        }
        if source.is_none() {
            return Err(HsmError::invalid("derivation source is not an asset"));
        }

        let res = self
            .exchange(CommandToken::asset_load_derive(dest.id(), source, label))
            .await?;
        check_asset_result(&res, "derive")
    }

    /// Releases `asset`. Assets the driver did not create are left alone.
    pub async fn free_asset(&mut self, mut asset: AssetHandle) -> HsmResult<()> {
        if !asset.driver_created {
            return Ok(());
        }
        // Deletes go through even when the session has been cancelled.
        let res = self
            .exchange_uncancellable(CommandToken::asset_delete(asset.id()))
            .await?;
        check_asset_result(&res, "delete")?;

        asset.released = true;
        debug!("Freed asset {}", asset.id());
        Ok(())
    }
}

fn check_asset_result(res: &ResultToken, what: &str) -> HsmResult<()> {
    if res.is_success() {
        return Ok(());
    }
    let code = res.masked();
    if res.status() == Some(ResultCode::InvalidAsset) {
        error!("Asset {} rejected: unknown or mismatched asset", what);
    } else {
        error!("Asset {} failed with code {}", what, code);
    }
    Err(HsmError::HardwareError(code))
}
