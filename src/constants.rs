//! Copyright (c) 2026, resguard developers
//!
//! Apache-2.0 License
//!
//! Centralized configuration defaults for resguard.
//!
//! All documented default values live here with their purpose and usage
//! context, so the rest of the crate never carries magic numbers.

use std::time::Duration;

// ============================================================================
// Breaker Constants
// ============================================================================

/// Default failure rate threshold in percent.
///
/// When the ring buffer is full and the failure rate reaches this value,
/// the breaker transitions from closed (or half-open) to open.
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f32 = 50.0;

/// Default ring buffer size in the closed state.
pub const DEFAULT_RING_BUFFER_SIZE_CLOSED: usize = 100;

/// Default ring buffer size in the half-open state.
///
/// Deliberately small: recovery probing needs far fewer samples.
pub const DEFAULT_RING_BUFFER_SIZE_HALF_OPEN: usize = 10;

/// Default wait duration in the open state before half-open probing (60s).
pub const DEFAULT_WAIT_DURATION_OPEN: Duration = Duration::from_secs(60);

// ============================================================================
// Rate Limiter Constants
// ============================================================================

/// Default permit count per refresh period.
///
/// `u64::MAX` means "effectively unlimited" until an operator configures a
/// real limit.
pub const DEFAULT_LIMIT_FOR_PERIOD: u64 = u64::MAX;

/// Default refresh period for the fixed window (1s).
pub const DEFAULT_LIMIT_REFRESH_PERIOD: Duration = Duration::from_secs(1);

// ============================================================================
// Concurrency Limiter Constants
// ============================================================================

/// Default concurrency threshold.
///
/// `u64::MAX` means "effectively unlimited" until configured.
pub const DEFAULT_CONCURRENCY_THRESHOLD: u64 = u64::MAX;

// ============================================================================
// Retry Constants
// ============================================================================

/// Default maximum retry attempts (including the first call).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default initial backoff delay between attempts (0: retry immediately).
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::ZERO;

/// Default backoff delay cap (30s).
pub const DEFAULT_BACKOFF_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.0;

// ============================================================================
// Guard Creation Limiter Constants
// ============================================================================

/// Default budget of argument-qualified guards per (resource, guard type).
pub const DEFAULT_MAX_SIZE_LIMIT: u64 = 100;

/// Environment variable consulted for the global creation budget.
pub const MAX_SIZE_LIMIT_ENV: &str = "RESGUARD_MAX_SIZE_LIMIT";
