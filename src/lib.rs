// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod otel;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod topology;

#[cfg(test)]
mod testing;
