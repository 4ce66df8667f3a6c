/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod connection;
pub mod core;
pub mod crypto;
pub mod sim;

pub use crate::core::config::{DriverConfig, ReturnBehavior};
pub use crate::core::device::Hsm;
pub use crate::core::error::{HsmError, HsmResult};
pub use crate::core::key::{CryptoKey, KeyStore};
pub use crate::crypto::aead::{AeadContext, AeadMode, Sealed};
pub use crate::crypto::cmac::{MacContext, MacMode};
pub use crate::crypto::eddsa::EddsaContext;
pub use crate::crypto::protocol::{Callback, Completion, OperationKind};
pub use sim::SimEngine;
