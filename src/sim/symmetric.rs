/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! AES based primitives of the simulated engine.
use crate::connection::command::{CommandToken, Direction, ResultCode, Subcode};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{AeadInPlace, KeyInit as AeadKeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use cipher::consts::{U12, U16};
use cipher::generic_array::GenericArray;
use cipher::{BlockCipher, BlockEncrypt, BlockEncryptMut, BlockSizeUser, KeyInit, KeyIvInit};
use zeroize::Zeroizing;

pub const BLOCK: usize = 16;

pub(crate) enum BlockKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockKey {
    pub fn new(key: &[u8]) -> Result<Self, ResultCode> {
        let cipher = match key.len() {
            16 => Aes128::new_from_slice(key).map(BlockKey::Aes128),
            24 => Aes192::new_from_slice(key).map(BlockKey::Aes192),
            32 => Aes256::new_from_slice(key).map(BlockKey::Aes256),
            _ => return Err(ResultCode::InvalidKeySize),
        };
        cipher.map_err(|_| ResultCode::InvalidKeySize)
    }

    pub fn encrypt(&self, block: &mut [u8; BLOCK]) {
        let block = GenericArray::from_mut_slice(&mut block[..]);
        match self {
            BlockKey::Aes128(c) => c.encrypt_block(block),
            BlockKey::Aes192(c) => c.encrypt_block(block),
            BlockKey::Aes256(c) => c.encrypt_block(block),
        }
    }
}

/// Encrypts whole blocks independently.
pub(crate) fn ecb(key: &[u8], token: &CommandToken) -> Result<Vec<u8>, ResultCode> {
    if token.direction != Direction::Encrypt {
        return Err(ResultCode::InvalidParameter);
    }
    if token.data.is_empty() || token.data.len() % BLOCK != 0 {
        return Err(ResultCode::InvalidLength);
    }
    let cipher = BlockKey::new(key)?;
    let mut out = token.data.clone();
    for chunk in out.chunks_exact_mut(BLOCK) {
        let mut block = [0u8; BLOCK];
        block.copy_from_slice(chunk);
        cipher.encrypt(&mut block);
        chunk.copy_from_slice(&block);
    }
    Ok(out)
}

fn cbc_chain<C>(key: &[u8], iv: &[u8; BLOCK], data: &[u8]) -> Result<[u8; BLOCK], ResultCode>
where
    C: BlockCipher + BlockEncryptMut + KeyInit + BlockSizeUser<BlockSize = U16>,
{
    let mut enc =
        cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(|_| ResultCode::InvalidKeySize)?;
    let mut last = *iv;
    for chunk in data.chunks_exact(BLOCK) {
        let mut block = GenericArray::clone_from_slice(chunk);
        enc.encrypt_block_mut(&mut block);
        last.copy_from_slice(&block);
    }
    Ok(last)
}

/// Continues a CBC-MAC from `chain` over block-aligned `data`.
pub(crate) fn cbc_mac(
    key: &[u8],
    chain: &[u8; BLOCK],
    data: &[u8],
) -> Result<[u8; BLOCK], ResultCode> {
    if data.is_empty() || data.len() % BLOCK != 0 {
        return Err(ResultCode::InvalidLength);
    }
    match key.len() {
        16 => cbc_chain::<Aes128>(key, chain, data),
        24 => cbc_chain::<Aes192>(key, chain, data),
        32 => cbc_chain::<Aes256>(key, chain, data),
        _ => Err(ResultCode::InvalidKeySize),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AeadAlgorithm {
    Ccm,
    Gcm,
}

/// Running AEAD operation. Associated data and plaintext are kept until the
/// final token so the tag can be computed in one go.
pub(crate) struct AeadState {
    algorithm: AeadAlgorithm,
    direction: Direction,
    key: Zeroizing<Vec<u8>>,
    nonce: Vec<u8>,
    tag_len: usize,
    total_aad: usize,
    total_data: usize,
    aad: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
}

impl AeadState {
    pub fn start(token: &CommandToken, key: Zeroizing<Vec<u8>>) -> Result<Self, ResultCode> {
        let algorithm = match token.subcode {
            Subcode::Ccm => AeadAlgorithm::Ccm,
            Subcode::Gcm => AeadAlgorithm::Gcm,
            _ => return Err(ResultCode::InvalidToken),
        };

        let nonce_ok = match algorithm {
            AeadAlgorithm::Ccm => (7..=13).contains(&token.nonce.len()),
            AeadAlgorithm::Gcm => token.nonce.len() == 12,
        };
        let tag_ok = match algorithm {
            AeadAlgorithm::Ccm => (4..=16).contains(&token.tag_len) && token.tag_len % 2 == 0,
            AeadAlgorithm::Gcm => matches!(token.tag_len, 4 | 8 | 12..=16),
        };
        if !nonce_ok || !tag_ok {
            return Err(ResultCode::InvalidParameter);
        }
        BlockKey::new(&key)?;

        Ok(AeadState {
            algorithm,
            direction: token.direction,
            key,
            nonce: token.nonce.clone(),
            tag_len: token.tag_len,
            total_aad: token.total_aad_len as usize,
            total_data: token.total_data_len as usize,
            aad: Vec::new(),
            plaintext: Zeroizing::new(Vec::new()),
        })
    }

    pub fn matches(&self, token: &CommandToken) -> bool {
        let algorithm = match token.subcode {
            Subcode::Ccm => AeadAlgorithm::Ccm,
            Subcode::Gcm => AeadAlgorithm::Gcm,
            _ => return false,
        };
        algorithm == self.algorithm && token.direction == self.direction
    }

    /// Absorbs the associated data and payload of one token and returns the
    /// transformed payload.
    pub fn absorb(&mut self, token: &CommandToken) -> Result<Vec<u8>, ResultCode> {
        if self.aad.len() + token.aad.len() > self.total_aad {
            return Err(ResultCode::DataOverrun);
        }
        self.aad.extend_from_slice(&token.aad);

        if token.data.is_empty() {
            return Ok(Vec::new());
        }
        // Payload is only accepted once all associated data is in.
        if self.aad.len() != self.total_aad {
            return Err(ResultCode::InvalidState);
        }
        let offset = self.plaintext.len();
        if offset + token.data.len() > self.total_data {
            return Err(ResultCode::DataOverrun);
        }
        if offset % BLOCK != 0 {
            return Err(ResultCode::InvalidLength);
        }

        let out = self.apply_keystream(offset, &token.data)?;
        match self.direction {
            Direction::Encrypt => self.plaintext.extend_from_slice(&token.data),
            Direction::Decrypt => self.plaintext.extend_from_slice(&out),
        }
        Ok(out)
    }

    /// Computes the tag. All declared bytes must have been absorbed.
    pub fn finish(&self) -> Result<Vec<u8>, ResultCode> {
        if self.aad.len() != self.total_aad || self.plaintext.len() != self.total_data {
            return Err(ResultCode::InvalidLength);
        }
        let mut tag = match self.algorithm {
            AeadAlgorithm::Ccm => self.ccm_tag()?,
            AeadAlgorithm::Gcm => self.gcm_tag()?,
        };
        tag.truncate(self.tag_len);
        Ok(tag)
    }

    fn counter_block(&self, index: usize) -> [u8; BLOCK] {
        let mut block = [0u8; BLOCK];
        match self.algorithm {
            AeadAlgorithm::Gcm => {
                block[..12].copy_from_slice(&self.nonce);
                block[12..].copy_from_slice(&(2 + index as u32).to_be_bytes());
            }
            AeadAlgorithm::Ccm => {
                let q = 15 - self.nonce.len();
                block[0] = (q - 1) as u8;
                block[1..1 + self.nonce.len()].copy_from_slice(&self.nonce);
                let ctr = ((index + 1) as u64).to_be_bytes();
                block[16 - q..].copy_from_slice(&ctr[8 - q..]);
            }
        }
        block
    }

    fn apply_keystream(&self, offset: usize, data: &[u8]) -> Result<Vec<u8>, ResultCode> {
        let cipher = BlockKey::new(&self.key)?;
        let mut out = data.to_vec();
        for (i, chunk) in out.chunks_mut(BLOCK).enumerate() {
            let mut ks = self.counter_block(offset / BLOCK + i);
            cipher.encrypt(&mut ks);
            chunk.iter_mut().zip(ks.iter()).for_each(|(b, k)| *b ^= k);
        }
        Ok(out)
    }

    fn ccm_tag(&self) -> Result<Vec<u8>, ResultCode> {
        let cipher = BlockKey::new(&self.key)?;
        let n = self.nonce.len();
        let q = 15 - n;

        let mut b0 = [0u8; BLOCK];
        let adata = if self.aad.is_empty() { 0 } else { 0x40 };
        b0[0] = adata | ((((self.tag_len - 2) / 2) as u8) << 3) | (q - 1) as u8;
        b0[1..1 + n].copy_from_slice(&self.nonce);
        let len = (self.plaintext.len() as u64).to_be_bytes();
        b0[16 - q..].copy_from_slice(&len[8 - q..]);

        let mut mac_input = Vec::with_capacity(BLOCK * 2 + self.aad.len() + self.plaintext.len());
        mac_input.extend_from_slice(&b0);
        if !self.aad.is_empty() {
            if self.aad.len() < 0xFF00 {
                mac_input.extend_from_slice(&(self.aad.len() as u16).to_be_bytes());
            } else {
                mac_input.extend_from_slice(&[0xFF, 0xFE]);
                mac_input.extend_from_slice(&(self.aad.len() as u32).to_be_bytes());
            }
            mac_input.extend_from_slice(&self.aad);
            pad_to_block(&mut mac_input);
        }
        mac_input.extend_from_slice(&self.plaintext);
        pad_to_block(&mut mac_input);

        let mac = cbc_mac(&self.key, &[0u8; BLOCK], &mac_input)?;

        let mut s0 = [0u8; BLOCK];
        s0[0] = (q - 1) as u8;
        s0[1..1 + n].copy_from_slice(&self.nonce);
        cipher.encrypt(&mut s0);

        Ok(mac.iter().zip(s0.iter()).map(|(m, s)| m ^ s).collect())
    }

    fn gcm_tag(&self) -> Result<Vec<u8>, ResultCode> {
        let (key, nonce, aad, data) = (&self.key, &self.nonce, &self.aad, &self.plaintext);
        match key.len() {
            16 => gcm_tag_with::<Aes128Gcm>(key, nonce, aad, data),
            24 => gcm_tag_with::<AesGcm<Aes192, U12>>(key, nonce, aad, data),
            32 => gcm_tag_with::<Aes256Gcm>(key, nonce, aad, data),
            _ => Err(ResultCode::InvalidKeySize),
        }
    }
}

fn gcm_tag_with<A>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, ResultCode>
where
    A: AeadInPlace + AeadKeyInit,
{
    let gcm = A::new_from_slice(key).map_err(|_| ResultCode::InvalidKeySize)?;
    let mut buf = Zeroizing::new(plaintext.to_vec());
    let tag = gcm
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buf.as_mut_slice())
        .map_err(|_| ResultCode::InvalidLength)?;
    Ok(tag.to_vec())
}

fn pad_to_block(buf: &mut Vec<u8>) {
    let rem = buf.len() % BLOCK;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK - rem, 0);
    }
}
