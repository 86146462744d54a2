//! Multi-hop privacy transfer engine.
//!
//! Plans hop paths through ephemeral wallets, executes them as a durable
//! resumable state machine, and scores wallet traceability risk.

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
