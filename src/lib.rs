// Copyright 2026 Optout Contributors
// SPDX-License-Identifier: Apache-2.0

//! Optout library — hybrid data-broker deletion agent.
//!
//! This library crate exposes the core modules for integration testing.

#![allow(
    dead_code,
    unused_imports,
    clippy::new_without_default,
    clippy::should_implement_trait
)]

pub mod auth;
pub mod browser;
pub mod captcha;
pub mod config;
pub mod error;
pub mod fallback;
pub mod llm;
pub mod mailbox;
pub mod mapper;
pub mod orchestrator;
pub mod submit;
pub mod template;
pub mod userdata;
