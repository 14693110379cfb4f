//! Copyright (c) 2026, resguard developers
//!
//! Apache-2.0 License
//!
//! Resguard - In-Process Service Protection Layer
//!
//! Wraps calls to fragile downstream dependencies with composable guards:
//! circuit breaking, rate limiting, concurrency limiting, retry and fallback.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use resguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Keeper`] - Facade: register resources, invoke protected calls, push configs
//! - [`CompositeConfig`] - Immutable per-resource baseline configuration
//! - [`ExternalConfig`] - Sparse operational overlay, pushed at runtime
//! - [`ResguardError`] - Error types
//!
//! ## Guards
//!
//! Low-level guard primitives: circuit breaker, fixed-window rate limiter,
//! concurrency limiter. Evaluated per attempt in a fixed order.
//!
//! ## Dynamic Reconfiguration
//!
//! Full-replacement config pushes add, remove or reconfigure guards in place
//! without losing accumulated statistics. Pattern (regex) keys fan one config
//! out to every matching resource; group configs are inherited by members and
//! overridden field by field.
//!
//! # Examples
//!
//! ```rust
//! use resguard::prelude::*;
//! use std::time::Duration;
//!
//! let keeper = Keeper::new();
//! keeper.register(
//!     "user.get",
//!     CompositeConfig::builder()
//!         .rate(RateConfig::new(100, Duration::from_secs(1)))
//!         .breaker(BreakerConfig::default())
//!         .build(),
//! ).unwrap();
//!
//! let result = keeper.invoke("user.get", || Ok::<_, Fault>("profile"));
//! assert_eq!(result.unwrap(), "profile");
//! ```
//!
//! # Features
//!
//! - **Composable guards**: Each resource carries any subset of breaker, rate
//!   limiter and concurrency limiter, plus retry and fallback
//! - **Dynamic reconfiguration**: Push sparse overlays at runtime, in place,
//!   stats preserved
//! - **Argument-level protection**: Derive guards per argument value, bounded
//!   by a creation budget
//! - **Async support**: Synchronous guard evaluation with manual-completion
//!   handles for in-flight async calls

pub mod prelude;

pub mod cluster;
pub mod config;
pub mod constants;
pub mod creation_limiter;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod guards;
pub mod keeper;
pub mod merge;
pub mod pattern_cache;
pub mod resource;
pub mod retry;
pub mod source;

// 重新导出常用类型
pub use cluster::{AsyncEntry, GuardCluster};
pub use config::{
    BackoffConfig, BreakerConfig, CompositeConfig, ConcurrencyConfig, ExternalConfig,
    FallbackConfig, ForcedState, GroupExternalConfig, PredicateKind, RateConfig, RetryConfig,
};
pub use creation_limiter::{CreationLimiter, SizeLimitConfig};
pub use engine::ReconfigEngine;
pub use error::{
    BreakerState, BreakerStats, ConcurrencyStats, Fault, RateStats, ResguardError,
};
pub use fallback::{FallbackContext, FallbackRegistry};
pub use guards::{
    Breaker, CallOutcome, ConcurrencyLimitGuard, Guard, GuardType, PredicateRegistry,
    RateLimitGuard,
};
pub use keeper::{Keeper, ResourceStats};
pub use resource::{GroupId, ResourceId};
pub use retry::RetryExecutor;
pub use source::{ConfigSource, GroupSource};
