// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process-wide `tracing` subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs a compact fmt subscriber.
///
/// `force_level` wins over `RUST_LOG`; without either, [`DEFAULT_LOG_LEVEL`] applies.
/// Calling it a second time is a no-op.
pub fn setup(force_level: Option<&str>) {
    let filter = match force_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into()),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}
