// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// How many times, and how far apart, to retry a lost store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, no delay in between.
    Immediate(u32),
    /// Number of attempts and the delay between them in milliseconds.
    LinearBackoff(u32, u64),
}

pub const DEFAULT_CONNECTION_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(DEFAULT_CONNECTION_RETRIES, DEFAULT_RETRY_BACKOFF_MS)
    }
}

impl RetryStrategy {
    /// Builds a strategy from an attempt count and a backoff; a zero backoff retries immediately.
    #[must_use]
    pub fn from_settings(attempts: u32, backoff_ms: u64) -> Self {
        if backoff_ms == 0 {
            RetryStrategy::Immediate(attempts)
        } else {
            RetryStrategy::LinearBackoff(attempts, backoff_ms)
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                *attempts
            }
        }
    }

    /// Delay to wait after a failed attempt before the next one.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, ms) => Some(Duration::from_millis(*ms)),
        }
    }
}
