// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Stack model, validation rules and the ports (traits) the operator drives.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and traits with no I/O of their own

pub mod credentials;
pub mod history;
pub mod operator_config;
pub mod runtime;
pub mod runtime_spec;
pub mod stack;
pub mod validation;
