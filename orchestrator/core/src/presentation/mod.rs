// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`stackpilot-core`)
//!
//! HTTP surface that translates external requests into [`crate::application::Operator`]
//! calls. No business logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | REST endpoints, error mapping, router assembly |
//! | [`mcp`] | JSON-RPC over HTTP | tool-calling protocol for autonomous agents |
//! | [`middleware`] | HTTP (Axum) | bearer auth, CORS allowlist, panic recovery |

pub mod api;
pub mod mcp;
pub mod middleware;
