//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Resguard,
//! allowing users to import them with a single `use resguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::{
    BreakerConfig, CompositeConfig, ConcurrencyConfig, ExternalConfig, FallbackConfig,
    GroupExternalConfig, RateConfig, RetryConfig,
};
pub use crate::error::{BreakerState, Fault, ResguardError};
pub use crate::keeper::Keeper;
pub use crate::resource::ResourceId;

// Async entry handle
pub use crate::cluster::AsyncEntry;

// External config sources
pub use crate::source::{ConfigSource, GroupSource};
