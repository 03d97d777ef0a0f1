//! Shared fixtures for integration tests
//!
//! - `fixtures`: engine, registry and provisioner wired to a simulated cloud
//! - `doubles`: recording notifier and counting validation check
//! - `assertions`: ordering helpers for release logs
#![allow(dead_code)]

pub mod assertions;
pub mod doubles;
pub mod fixtures;
