// Copyright 2026 The Towline Project
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod message;
pub mod pipeline;
pub mod sanitize;
pub mod server;
pub mod stream;
pub mod upstream;
