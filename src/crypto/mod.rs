/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod aead;
pub mod cmac;
pub mod eddsa;
pub mod protocol;
pub mod segment;
