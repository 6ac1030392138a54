//! falco-triage library interface
//!
//! Exposes the triage modules for use by binaries and tests.

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod oracle;
pub mod pipeline;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod utils;
pub mod validator;
