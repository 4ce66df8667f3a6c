/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod asset;
pub mod config;
pub mod device;
pub mod error;
pub mod key;
pub mod lock;
pub mod utilities;
