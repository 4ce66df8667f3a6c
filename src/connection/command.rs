/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::core::asset::{AssetId, AssetPolicy};
use std::fmt;
use zeroize::Zeroizing;

/// Low byte of a result word. Upper bits carry engine flags.
pub const RESULT_MASK: i32 = 0xFF;
/// Flag the engine sets on results of approved-mode operations
pub const RESULT_FLAG_APPROVED: i32 = 0x0100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Opcode {
    #[default]
    Nop = 0x00,
    Crypto = 0x01,
    Mac = 0x03,
    Asset = 0x07,
    PublicKey = 0x09,
    System = 0x0F,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subcode {
    #[default]
    None = 0x00,

    // Asset management
    AssetCreate = 0x01,
    AssetLoadPlaintext = 0x02,
    AssetLoadDerive = 0x03,
    AssetDelete = 0x04,

    // Symmetric
    Ecb = 0x10,
    CbcMac = 0x11,
    Ccm = 0x12,
    Gcm = 0x13,

    // EdDSA phases
    EddsaSignInitial = 0x20,
    EddsaSignUpdate = 0x21,
    EddsaSignFinalize = 0x22,
    EddsaVerifyInitial = 0x23,
    EddsaVerifyFinalize = 0x24,
    EddsaIntermediateHash = 0x25,
    EddsaGenPublicKey = 0x26,

    Version = 0x30,
}

/// Continuation mode of a token within a multi-token operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenMode {
    #[default]
    InitToFinal,
    InitToContinue,
    ContinueToContinue,
    ContinueToFinal,
    AadInit,
    AadContinue,
}

impl TokenMode {
    pub fn from_flags(is_new: bool, is_final: bool) -> Self {
        match (is_new, is_final) {
            (true, true) => TokenMode::InitToFinal,
            (true, false) => TokenMode::InitToContinue,
            (false, false) => TokenMode::ContinueToContinue,
            (false, true) => TokenMode::ContinueToFinal,
        }
    }

    pub fn aad_only(is_new: bool) -> Self {
        if is_new {
            TokenMode::AadInit
        } else {
            TokenMode::AadContinue
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            TokenMode::InitToFinal | TokenMode::InitToContinue | TokenMode::AadInit
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TokenMode::InitToFinal | TokenMode::ContinueToFinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Encrypt,
    Decrypt,
}

/// Key material carried by a token: inline bytes or an asset reference.
#[derive(Clone, Default)]
pub enum KeyRef {
    #[default]
    None,
    Inline(Zeroizing<Vec<u8>>),
    Asset(AssetId),
}

impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRef::None => write!(f, "None"),
            KeyRef::Inline(key) => write!(f, "Inline({} bytes)", key.len()),
            KeyRef::Asset(id) => write!(f, "Asset({})", id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandToken {
    pub opcode: Opcode,
    pub subcode: Subcode,
    pub mode: TokenMode,
    pub direction: Direction,
    pub key: KeyRef,
    pub policy: AssetPolicy,
    pub size: usize,
    /// Asset being loaded or freed, or the temporary state of a chained operation
    pub target: AssetId,
    pub param: AssetId,
    pub public_key: AssetId,
    pub state: AssetId,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
    pub data: Vec<u8>,
    pub aux: Vec<u8>,
    pub tag_len: usize,
    pub total_aad_len: u64,
    pub total_data_len: u64,
}

impl CommandToken {
    pub fn new(opcode: Opcode, subcode: Subcode) -> Self {
        CommandToken {
            opcode,
            subcode,
            ..Default::default()
        }
    }

    pub fn asset_create(policy: AssetPolicy, size: usize) -> Self {
        CommandToken {
            policy,
            size,
            ..Self::new(Opcode::Asset, Subcode::AssetCreate)
        }
    }

    pub fn asset_load_plaintext(target: AssetId, data: &[u8]) -> Self {
        CommandToken {
            target,
            data: data.to_vec(),
            ..Self::new(Opcode::Asset, Subcode::AssetLoadPlaintext)
        }
    }

    pub fn asset_load_derive(target: AssetId, source: AssetId, label: &[u8]) -> Self {
        CommandToken {
            target,
            key: KeyRef::Asset(source),
            aux: label.to_vec(),
            ..Self::new(Opcode::Asset, Subcode::AssetLoadDerive)
        }
    }

    pub fn asset_delete(target: AssetId) -> Self {
        CommandToken {
            target,
            ..Self::new(Opcode::Asset, Subcode::AssetDelete)
        }
    }

    pub fn version() -> Self {
        Self::new(Opcode::System, Subcode::Version)
    }

    pub fn with_key(mut self, key: KeyRef) -> Self {
        self.key = key;
        self
    }

    pub fn with_mode(mut self, mode: TokenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_target(mut self, target: AssetId) -> Self {
        self.target = target;
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Bytes the engine moves over DMA for this token
    pub fn transfer_len(&self) -> usize {
        self.aad.len() + self.data.len()
    }
}

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    InvalidToken = -1,
    InvalidParameter = -2,
    InvalidKeySize = -3,
    InvalidLength = -4,
    InvalidLocation = -5,
    ClockError = -6,
    AccessError = -7,
    UnwrapError = -10,
    DataOverrun = -11,
    AssetChecksum = -12,
    InvalidAsset = -13,
    Full = -14,
    InvalidAddress = -15,
    InvalidModulus = -17,
    VerifyError = -18,
    InvalidState = -19,
    Panic = -64,
}

impl ResultCode {
    pub fn from_raw(raw: i8) -> Option<Self> {
        let code = match raw {
            0 => ResultCode::Success,
            -1 => ResultCode::InvalidToken,
            -2 => ResultCode::InvalidParameter,
            -3 => ResultCode::InvalidKeySize,
            -4 => ResultCode::InvalidLength,
            -5 => ResultCode::InvalidLocation,
            -6 => ResultCode::ClockError,
            -7 => ResultCode::AccessError,
            -10 => ResultCode::UnwrapError,
            -11 => ResultCode::DataOverrun,
            -12 => ResultCode::AssetChecksum,
            -13 => ResultCode::InvalidAsset,
            -14 => ResultCode::Full,
            -15 => ResultCode::InvalidAddress,
            -17 => ResultCode::InvalidModulus,
            -18 => ResultCode::VerifyError,
            -19 => ResultCode::InvalidState,
            -64 => ResultCode::Panic,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultToken {
    pub code: i32,
    pub asset_id: AssetId,
    pub output: Vec<u8>,
    pub tag: Vec<u8>,
}

impl ResultToken {
    pub fn success() -> Self {
        ResultToken::default()
    }

    pub fn failure(code: ResultCode) -> Self {
        ResultToken {
            code: code as i32,
            ..Default::default()
        }
    }

    /// Result code with the engine flag bits stripped.
    pub fn masked(&self) -> i8 {
        (self.code & RESULT_MASK) as u8 as i8
    }

    pub fn status(&self) -> Option<ResultCode> {
        ResultCode::from_raw(self.masked())
    }

    pub fn is_success(&self) -> bool {
        self.masked() == ResultCode::Success as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_masks_flags() {
        let res = ResultToken {
            code: RESULT_FLAG_APPROVED,
            ..Default::default()
        };
        assert!(res.is_success());

        let res = ResultToken::failure(ResultCode::VerifyError);
        assert_eq!(res.masked(), -18);
        assert_eq!(res.status(), Some(ResultCode::VerifyError));

        let res = ResultToken {
            code: ResultCode::InvalidAsset as i32 | RESULT_FLAG_APPROVED,
            ..Default::default()
        };
        assert_eq!(res.status(), Some(ResultCode::InvalidAsset));
    }

    #[test]
    fn test_token_mode_flags() {
        assert_eq!(TokenMode::from_flags(true, true), TokenMode::InitToFinal);
        assert_eq!(
            TokenMode::from_flags(false, true),
            TokenMode::ContinueToFinal
        );
        assert!(TokenMode::InitToContinue.is_new());
        assert!(!TokenMode::ContinueToContinue.is_final());
        assert!(TokenMode::aad_only(true).is_new());
    }

    #[test]
    fn test_key_ref_debug_hides_material() {
        let key = KeyRef::Inline(Zeroizing::new(vec![0xAA; 16]));
        assert_eq!(format!("{:?}", key), "Inline(16 bytes)");
    }
}
