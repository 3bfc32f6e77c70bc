//! ChainSight library interface
//!
//! Exposes core modules for use by binaries and tests.

pub mod config;
pub mod correlation;
pub mod fields;
pub mod matcher;
pub mod models;
pub mod proctree;
pub mod rules;
pub mod utils;
