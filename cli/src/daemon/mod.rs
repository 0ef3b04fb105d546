// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Handles:
//! - Wiring the operator from configuration
//! - Serving the HTTP / JSON-RPC control surface
//! - Graceful shutdown

pub mod client;
pub mod server;

pub use client::DaemonClient;
pub use server::{build_operator, serve, ServeOverrides};
