//! Lite-mode implementations of `pictask-core` interfaces.
//!
//! This module provides an in-process queue, a minimal Postgres-backed queue, and an HS256 commit
//! capability signer for local development and single-host deployments.

pub mod jwt;
pub mod memqueue;
pub mod pgqueue;
