// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport: the SSE streaming surface and status endpoints.
//!
//! The broader REST API (full request models, OpenAPI, CORS policy) is an
//! external collaborator; only what the control plane itself must expose
//! lives here.

pub mod http;

pub use http::{router, AppState};
