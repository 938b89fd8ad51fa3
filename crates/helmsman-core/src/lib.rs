//! Core types, agent configuration, errors, and token substitution for Helmsman.

pub mod config;
pub mod error;
pub mod tokens;
pub mod types;
