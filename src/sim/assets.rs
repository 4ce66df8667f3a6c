/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::connection::command::ResultCode;
use crate::core::asset::{AssetClass, AssetId, AssetPolicy};
use crate::sim::EngineState;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// First id handed out by the simulated asset store
pub const FIRST_ASSET_ID: u32 = 0x5000;

/// Asset accounting. Only assets created through the mailbox are counted;
/// provisioned keys are outside of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssetStats {
    pub created: usize,
    pub freed: usize,
    pub live: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    /// Created by a create-asset token
    Driver,
    /// Created by the engine as the side effect of an operation token
    Engine,
    /// Installed out of band, like a key store slot
    Provisioned,
}

impl Owner {
    fn counted(self) -> bool {
        self != Owner::Provisioned
    }
}

pub(crate) struct SimAsset {
    pub policy: AssetPolicy,
    pub size: usize,
    pub owner: Owner,
    pub material: Option<Zeroizing<Vec<u8>>>,
    pub state: Option<EngineState>,
}

pub(crate) struct AssetTable {
    next_id: u32,
    capacity: usize,
    assets: HashMap<AssetId, SimAsset>,
    stats: AssetStats,
}

impl AssetTable {
    pub fn new(capacity: usize) -> Self {
        AssetTable {
            next_id: FIRST_ASSET_ID,
            capacity,
            assets: HashMap::new(),
            stats: AssetStats::default(),
        }
    }

    pub fn stats(&self) -> AssetStats {
        self.stats
    }

    pub fn live_ids(&self) -> Vec<AssetId> {
        let mut ids: Vec<AssetId> = self
            .assets
            .iter()
            .filter(|(_, a)| a.owner.counted())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn create(
        &mut self,
        policy: AssetPolicy,
        size: usize,
        owner: Owner,
    ) -> Result<AssetId, ResultCode> {
        if size == 0 {
            return Err(ResultCode::InvalidLength);
        }
        if self.assets.len() >= self.capacity {
            return Err(ResultCode::Full);
        }

        let id = AssetId(self.next_id);
        self.next_id += 1;
        self.assets.insert(
            id,
            SimAsset {
                policy,
                size,
                owner,
                material: None,
                state: None,
            },
        );
        if owner.counted() {
            self.stats.created += 1;
            self.stats.live += 1;
        }
        debug!(
            "sim: created {} {:?} ({} bytes, {:?})",
            id,
            policy.class(),
            size,
            owner
        );
        Ok(id)
    }

    pub fn load(&mut self, id: AssetId, data: &[u8]) -> Result<(), ResultCode> {
        let asset = self.get_mut(id)?;
        if asset.policy.class() == AssetClass::TemporaryState {
            return Err(ResultCode::InvalidAsset);
        }
        if data.len() != asset.size {
            return Err(ResultCode::InvalidLength);
        }
        if asset.material.is_some() && asset.policy.contains(AssetPolicy::NON_MODIFIABLE) {
            return Err(ResultCode::AccessError);
        }
        asset.material = Some(Zeroizing::new(data.to_vec()));
        Ok(())
    }

    /// Fills `dest` from `source` and `label` without the material ever
    /// leaving the table.
    pub fn load_derived(
        &mut self,
        dest: AssetId,
        source: AssetId,
        label: &[u8],
    ) -> Result<(), ResultCode> {
        let secret = Zeroizing::new(self.material(source)?.to_vec());
        let size = self.get(dest)?.size;

        let mut derived = Zeroizing::new(Vec::with_capacity(size));
        let mut counter: u32 = 1;
        while derived.len() < size {
            let block = Sha256::new()
                .chain_update(counter.to_be_bytes())
                .chain_update(secret.as_slice())
                .chain_update(label)
                .finalize();
            let take = (size - derived.len()).min(block.len());
            derived.extend_from_slice(&block[..take]);
            counter += 1;
        }
        self.load(dest, &derived)
    }

    pub fn delete(&mut self, id: AssetId) -> Result<(), ResultCode> {
        match self.assets.get(&id) {
            None => Err(ResultCode::InvalidAsset),
            Some(a) if a.owner == Owner::Provisioned => Err(ResultCode::AccessError),
            Some(_) => {
                self.remove(id);
                Ok(())
            }
        }
    }

    /// Drops an engine-owned asset at the end of the operation that made it.
    pub fn consume(&mut self, id: AssetId) {
        self.remove(id);
    }

    fn remove(&mut self, id: AssetId) {
        if let Some(asset) = self.assets.remove(&id) {
            if asset.owner.counted() {
                self.stats.freed += 1;
                self.stats.live -= 1;
            }
            debug!("sim: released {}", id);
        }
    }

    pub fn get(&self, id: AssetId) -> Result<&SimAsset, ResultCode> {
        self.assets.get(&id).ok_or(ResultCode::InvalidAsset)
    }

    pub fn get_mut(&mut self, id: AssetId) -> Result<&mut SimAsset, ResultCode> {
        self.assets.get_mut(&id).ok_or(ResultCode::InvalidAsset)
    }

    /// Loaded bytes of a key or parameter asset.
    pub fn material(&self, id: AssetId) -> Result<&[u8], ResultCode> {
        self.get(id)?
            .material
            .as_deref()
            .map(|m| m.as_slice())
            .ok_or(ResultCode::InvalidAsset)
    }

    /// Takes the operation state out of a temporary asset.
    pub fn take_state(&mut self, id: AssetId) -> Result<Option<EngineState>, ResultCode> {
        let asset = self.get_mut(id)?;
        if asset.policy.class() != AssetClass::TemporaryState && asset.owner != Owner::Engine {
            return Err(ResultCode::InvalidAsset);
        }
        Ok(asset.state.take())
    }

    pub fn put_state(&mut self, id: AssetId, state: EngineState) -> Result<(), ResultCode> {
        self.get_mut(id)?.state = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_follow_create_and_delete() {
        let mut table = AssetTable::new(4);
        let a = table
            .create(AssetPolicy::SYM_AES_MAC, 16, Owner::Driver)
            .unwrap();
        let b = table
            .create(AssetPolicy::ASYM_CURVE, 128, Owner::Provisioned)
            .unwrap();
        assert_eq!(a, AssetId(FIRST_ASSET_ID));

        table.delete(a).unwrap();
        assert_eq!(table.delete(a), Err(ResultCode::InvalidAsset));
        assert_eq!(table.delete(b), Err(ResultCode::AccessError));
        assert_eq!(
            table.stats(),
            AssetStats {
                created: 1,
                freed: 1,
                live: 0,
            }
        );
    }

    #[test]
    fn test_capacity_and_sizes() {
        let mut table = AssetTable::new(1);
        let mac = AssetPolicy::SYM_AES_MAC;
        let a = table.create(mac, 16, Owner::Driver).unwrap();
        assert_eq!(table.create(mac, 16, Owner::Driver), Err(ResultCode::Full));
        assert_eq!(table.load(a, &[0u8; 15]), Err(ResultCode::InvalidLength));
        assert!(table.load(a, &[0u8; 16]).is_ok());
    }

    #[test]
    fn test_derivation_depends_on_label() {
        let mut table = AssetTable::new(8);
        let root = table
            .create(AssetPolicy::SYM_HASH_MAC, 32, Owner::Provisioned)
            .unwrap();
        table.load(root, &[0x5A; 32]).unwrap();

        let mac = AssetPolicy::SYM_AES_MAC;
        let x = table.create(mac, 48, Owner::Driver).unwrap();
        let y = table.create(mac, 48, Owner::Driver).unwrap();
        table.load_derived(x, root, b"alpha").unwrap();
        table.load_derived(y, root, b"beta").unwrap();
        assert_eq!(table.material(x).unwrap().len(), 48);
        assert_ne!(table.material(x).unwrap(), table.material(y).unwrap());
    }
}
