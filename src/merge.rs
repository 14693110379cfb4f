//! 配置合并模块
//!
//! 把运维外部配置（稀疏覆盖层）叠加到不可变基线之上，
//! 得到一个资源的有效组合配置。
//!
//! 合并规则：
//! - 外部字段有值则覆盖基线/默认值；
//! - 外部字段为空则继承基线；
//! - 某守卫类型在两侧都没有触发字段时，该守卫不创建；
//! - 两侧均为空时合并结果为 `None`，不会创建集群。

use crate::config::{
    parse_duration, BreakerConfig, CompositeConfig, ConcurrencyConfig, ExternalConfig,
    FallbackConfig, ForcedState, RateConfig, RetryConfig,
};
use crate::error::ResguardError;

/// 合并不可变基线与外部配置
///
/// 任一时长字段解析失败立即返回 `ConfigError`，调用方保证
/// 此时不改动既有集群状态（先合并校验、后应用）。
pub fn combine(
    immutable: Option<&CompositeConfig>,
    external: Option<&ExternalConfig>,
) -> Result<Option<CompositeConfig>, ResguardError> {
    let merged = match (immutable, external) {
        (None, None) => return Ok(None),
        (Some(base), None) => base.clone(),
        (base, Some(ext)) => CompositeConfig {
            concurrency: combine_concurrency(base.and_then(|c| c.concurrency.as_ref()), ext),
            rate: combine_rate(base.and_then(|c| c.rate.as_ref()), ext)?,
            breaker: combine_breaker(base.and_then(|c| c.breaker.as_ref()), ext)?,
            retry: combine_retry(base.and_then(|c| c.retry.as_ref()), ext)?,
            fallback: combine_fallback(base.and_then(|c| c.fallback.as_ref()), ext),
        },
    };

    if merged.is_empty() {
        return Ok(None);
    }
    merged.validate()?;
    Ok(Some(merged))
}

fn combine_concurrency(
    base: Option<&ConcurrencyConfig>,
    ext: &ExternalConfig,
) -> Option<ConcurrencyConfig> {
    match ext.max_concurrency_limit {
        Some(threshold) => Some(ConcurrencyConfig::new(threshold)),
        None => base.copied(),
    }
}

fn combine_rate(
    base: Option<&RateConfig>,
    ext: &ExternalConfig,
) -> Result<Option<RateConfig>, ResguardError> {
    if !ext.has_rate_fields() {
        return Ok(base.cloned());
    }
    let mut rate = base.cloned().unwrap_or_default();
    if let Some(limit) = ext.limit_for_period {
        rate.limit_for_period = limit;
    }
    if let Some(period) = &ext.limit_refresh_period {
        rate.limit_refresh_period = parse_duration(period)?;
    }
    Ok(Some(rate))
}

fn combine_breaker(
    base: Option<&BreakerConfig>,
    ext: &ExternalConfig,
) -> Result<Option<BreakerConfig>, ResguardError> {
    if !ext.has_breaker_fields() {
        return Ok(base.cloned());
    }
    let mut breaker = base.cloned().unwrap_or_default();
    if let Some(threshold) = ext.failure_rate_threshold {
        breaker.failure_rate_threshold = threshold;
    }
    if let Some(size) = ext.ring_buffer_size_closed {
        breaker.ring_buffer_size_closed = size;
    }
    if let Some(size) = ext.ring_buffer_size_half_open {
        breaker.ring_buffer_size_half_open = size;
    }
    if let Some(wait) = &ext.wait_duration_open {
        breaker.wait_duration_open = parse_duration(wait)?;
    }
    if let Some(ms) = ext.max_spend_time_ms {
        breaker.max_spend_time_ms = Some(ms);
    }
    if let Some(ignored) = &ext.ignore_exceptions {
        breaker.ignore_exceptions = ignored.clone();
    }
    if let Some(predicate) = &ext.predicate {
        breaker.predicate = predicate.clone();
    }
    breaker.forced = combine_forced(breaker.forced, ext);
    Ok(Some(breaker))
}

/// 强制状态合并
///
/// forced_disabled=true 优先于 forced_open=true；显式 false 清除强制标记；
/// 两者均缺省时继承基线。
fn combine_forced(base: Option<ForcedState>, ext: &ExternalConfig) -> Option<ForcedState> {
    match (ext.forced_disabled, ext.forced_open) {
        (Some(true), _) => Some(ForcedState::Disabled),
        (_, Some(true)) => Some(ForcedState::Open),
        (Some(false), _) | (_, Some(false)) => None,
        (None, None) => base,
    }
}

fn combine_retry(
    base: Option<&RetryConfig>,
    ext: &ExternalConfig,
) -> Result<Option<RetryConfig>, ResguardError> {
    if !ext.has_retry_fields() {
        return Ok(base.cloned());
    }
    let mut retry = base.cloned().unwrap_or_default();
    if let Some(attempts) = ext.max_attempts {
        retry.max_attempts = attempts;
    }
    if let Some(include) = &ext.include_exceptions {
        retry.include_exceptions = include.clone();
    }
    if let Some(exclude) = &ext.exclude_exceptions {
        retry.exclude_exceptions = exclude.clone();
    }
    if let Some(delay) = &ext.backoff_delay {
        retry.backoff.delay = parse_duration(delay)?;
    }
    if let Some(max_delay) = &ext.backoff_max_delay {
        retry.backoff.max_delay = parse_duration(max_delay)?;
    }
    if let Some(multiplier) = ext.backoff_multiplier {
        retry.backoff.multiplier = multiplier;
    }
    Ok(Some(retry))
}

fn combine_fallback(
    base: Option<&FallbackConfig>,
    ext: &ExternalConfig,
) -> Option<FallbackConfig> {
    if !ext.has_fallback_fields() && ext.apply_to_business_error.is_none() {
        return base.cloned();
    }
    let mut fallback = base.cloned().unwrap_or_default();
    if let Some(function) = &ext.fallback_function {
        fallback.target_function = Some(function.clone());
    }
    if let Some(value) = &ext.fallback_value {
        fallback.literal_value = Some(value.clone());
    }
    if let Some(kind) = &ext.fallback_error_kind {
        fallback.error_kind = Some(kind.clone());
    }
    if let Some(apply) = ext.apply_to_business_error {
        fallback.apply_to_business_error = apply;
    }
    if fallback.has_target() {
        Some(fallback)
    } else {
        base.cloned()
    }
}
