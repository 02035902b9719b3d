//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use std::time::Duration;

/// Upper bound for a pipeline that should settle quickly
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Enable log output for a test run (`RUST_LOG` controls the filter)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
