//! 配置模块
//!
//! 定义各守卫的不可变配置、运维外部配置（ExternalConfig）以及相关校验。
//!
//! 不可变配置一经构建不再变化；守卫内部持有可原子替换的配置单元，
//! 动态更新时整体换入新的配置快照，读者永远不会看到撕裂的配置。

use crate::constants::*;
use crate::error::ResguardError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// 判定策略
// ============================================================================

/// 成功/失败判定策略
///
/// 熔断器按此策略把一次完成的调用归类为成功或失败。
/// 自定义策略通过 [`crate::guards::breaker::PredicateRegistry`] 按名注册。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateKind {
    /// 按异常类型判定：调用出错且错误 kind 不在忽略列表内记为失败
    ByException,
    /// 按耗时判定：耗时超过 max_spend_time_ms 记为失败
    ByLatency,
    /// 异常与耗时任一命中即记为失败
    ByBoth,
    /// 已注册的自定义判定回调
    Custom(String),
}

impl Default for PredicateKind {
    fn default() -> Self {
        PredicateKind::ByException
    }
}

/// 运维强制状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcedState {
    /// 强制打开（永不放行）
    Open,
    /// 强制关闭（永远放行，不统计）
    Disabled,
}

// ============================================================================
// 各守卫的不可变配置
// ============================================================================

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// 失败率阈值（百分比）
    pub failure_rate_threshold: f32,
    /// 关闭状态环形缓冲容量
    pub ring_buffer_size_closed: usize,
    /// 半开状态环形缓冲容量
    pub ring_buffer_size_half_open: usize,
    /// 打开状态的等待时长，超时后允许半开试探
    pub wait_duration_open: Duration,
    /// 按耗时判定的上限（毫秒）
    pub max_spend_time_ms: Option<u64>,
    /// 不计入失败的错误 kind 列表
    pub ignore_exceptions: Vec<String>,
    /// 判定策略
    pub predicate: PredicateKind,
    /// 运维强制状态
    pub forced: Option<ForcedState>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            ring_buffer_size_closed: DEFAULT_RING_BUFFER_SIZE_CLOSED,
            ring_buffer_size_half_open: DEFAULT_RING_BUFFER_SIZE_HALF_OPEN,
            wait_duration_open: DEFAULT_WAIT_DURATION_OPEN,
            max_spend_time_ms: None,
            ignore_exceptions: Vec::new(),
            predicate: PredicateKind::default(),
            forced: None,
        }
    }
}

impl BreakerConfig {
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::default()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), ResguardError> {
        if !(0.0..=100.0).contains(&self.failure_rate_threshold) {
            return Err(ResguardError::ConfigError(format!(
                "失败率阈值必须位于 [0, 100]: {}",
                self.failure_rate_threshold
            )));
        }
        if self.ring_buffer_size_closed == 0 || self.ring_buffer_size_half_open == 0 {
            return Err(ResguardError::ConfigError(
                "环形缓冲容量必须大于 0".to_string(),
            ));
        }
        if matches!(self.predicate, PredicateKind::ByLatency | PredicateKind::ByBoth)
            && self.max_spend_time_ms.is_none()
        {
            return Err(ResguardError::ConfigError(
                "按耗时判定需要设置 max_spend_time_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// 熔断器配置构建器
#[derive(Debug, Default)]
pub struct BreakerConfigBuilder {
    failure_rate_threshold: Option<f32>,
    ring_buffer_size_closed: Option<usize>,
    ring_buffer_size_half_open: Option<usize>,
    wait_duration_open: Option<Duration>,
    max_spend_time_ms: Option<u64>,
    ignore_exceptions: Vec<String>,
    predicate: Option<PredicateKind>,
    forced: Option<ForcedState>,
}

impl BreakerConfigBuilder {
    pub fn failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.failure_rate_threshold = Some(threshold);
        self
    }

    pub fn ring_buffer_size_closed(mut self, size: usize) -> Self {
        self.ring_buffer_size_closed = Some(size);
        self
    }

    pub fn ring_buffer_size_half_open(mut self, size: usize) -> Self {
        self.ring_buffer_size_half_open = Some(size);
        self
    }

    pub fn wait_duration_open(mut self, wait: Duration) -> Self {
        self.wait_duration_open = Some(wait);
        self
    }

    pub fn max_spend_time_ms(mut self, ms: u64) -> Self {
        self.max_spend_time_ms = Some(ms);
        self
    }

    pub fn ignore_exception(mut self, kind: impl Into<String>) -> Self {
        self.ignore_exceptions.push(kind.into());
        self
    }

    pub fn predicate(mut self, predicate: PredicateKind) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn forced(mut self, forced: ForcedState) -> Self {
        self.forced = Some(forced);
        self
    }

    pub fn build(self) -> BreakerConfig {
        let defaults = BreakerConfig::default();
        BreakerConfig {
            failure_rate_threshold: self
                .failure_rate_threshold
                .unwrap_or(defaults.failure_rate_threshold),
            ring_buffer_size_closed: self
                .ring_buffer_size_closed
                .unwrap_or(defaults.ring_buffer_size_closed),
            ring_buffer_size_half_open: self
                .ring_buffer_size_half_open
                .unwrap_or(defaults.ring_buffer_size_half_open),
            wait_duration_open: self.wait_duration_open.unwrap_or(defaults.wait_duration_open),
            max_spend_time_ms: self.max_spend_time_ms,
            ignore_exceptions: self.ignore_exceptions,
            predicate: self.predicate.unwrap_or_default(),
            forced: self.forced,
        }
    }
}

/// 速率限制配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// 每个刷新周期内的许可数
    pub limit_for_period: u64,
    /// 刷新周期
    pub limit_refresh_period: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            limit_for_period: DEFAULT_LIMIT_FOR_PERIOD,
            limit_refresh_period: DEFAULT_LIMIT_REFRESH_PERIOD,
        }
    }
}

impl RateConfig {
    pub fn new(limit_for_period: u64, limit_refresh_period: Duration) -> Self {
        Self {
            limit_for_period,
            limit_refresh_period,
        }
    }

    pub fn validate(&self) -> Result<(), ResguardError> {
        if self.limit_refresh_period.is_zero() {
            return Err(ResguardError::ConfigError(
                "刷新周期必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 并发限制配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// 最大并发数
    pub threshold: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONCURRENCY_THRESHOLD,
        }
    }
}

impl ConcurrencyConfig {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

/// 退避配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// 初始延迟
    pub delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
    /// 每次重试的延迟倍率
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_BACKOFF_DELAY,
            max_delay: DEFAULT_BACKOFF_MAX_DELAY,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl BackoffConfig {
    /// 第 attempt 次失败后的退避时长（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次调用）
    pub max_attempts: u32,
    /// 可重试的错误 kind 列表，空表示全部可重试
    pub include_exceptions: Vec<String>,
    /// 不重试的错误 kind 列表
    pub exclude_exceptions: Vec<String>,
    /// 退避配置
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            include_exceptions: Vec::new(),
            exclude_exceptions: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ResguardError> {
        if self.max_attempts == 0 {
            return Err(ResguardError::ConfigError(
                "最大尝试次数必须大于 0".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ResguardError::ConfigError(format!(
                "退避倍率必须不小于 1.0: {}",
                self.backoff.multiplier
            )));
        }
        Ok(())
    }
}

/// 降级配置
///
/// 降级目标三选一：已注册的降级函数、字面量返回值、合成错误。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// 已注册降级函数名
    pub target_function: Option<String>,
    /// 字面量返回值
    pub literal_value: Option<String>,
    /// 以该 kind 合成一个错误作为降级结果
    pub error_kind: Option<String>,
    /// 是否对业务异常也应用降级（默认仅守卫拒绝时降级）
    pub apply_to_business_error: bool,
}

impl FallbackConfig {
    /// 是否配置了任一降级目标
    pub fn has_target(&self) -> bool {
        self.target_function.is_some() || self.literal_value.is_some() || self.error_kind.is_some()
    }
}

// ============================================================================
// 组合配置
// ============================================================================

/// 一个资源的不可变基线配置
///
/// 每种守卫均可选，未配置的守卫不会被创建。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeConfig {
    pub concurrency: Option<ConcurrencyConfig>,
    pub rate: Option<RateConfig>,
    pub breaker: Option<BreakerConfig>,
    pub retry: Option<RetryConfig>,
    pub fallback: Option<FallbackConfig>,
}

impl CompositeConfig {
    pub fn builder() -> CompositeConfigBuilder {
        CompositeConfigBuilder::default()
    }

    /// 是否没有任何触发项
    pub fn is_empty(&self) -> bool {
        self.concurrency.is_none()
            && self.rate.is_none()
            && self.breaker.is_none()
            && self.retry.is_none()
            && self.fallback.is_none()
    }

    pub fn validate(&self) -> Result<(), ResguardError> {
        if let Some(breaker) = &self.breaker {
            breaker.validate()?;
        }
        if let Some(rate) = &self.rate {
            rate.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// 组合配置构建器
#[derive(Debug, Default)]
pub struct CompositeConfigBuilder {
    config: CompositeConfig,
}

impl CompositeConfigBuilder {
    pub fn concurrency(mut self, config: ConcurrencyConfig) -> Self {
        self.config.concurrency = Some(config);
        self
    }

    pub fn rate(mut self, config: RateConfig) -> Self {
        self.config.rate = Some(config);
        self
    }

    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.config.breaker = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = Some(config);
        self
    }

    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.config.fallback = Some(config);
        self
    }

    pub fn build(self) -> CompositeConfig {
        self.config
    }
}

// ============================================================================
// 外部配置
// ============================================================================

/// 运维外部配置（稀疏覆盖层）
///
/// 所有字段可空：有值的字段覆盖基线，空字段继承基线或默认值。
/// 时长类字段以人类可读字符串表达（"500ms"、"60s"、"5m"），
/// 在配置应用阶段解析，解析失败立即报错且不影响既有集群状态。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    // ---- 并发限制 ----
    pub max_concurrency_limit: Option<u64>,

    // ---- 速率限制 ----
    pub limit_for_period: Option<u64>,
    pub limit_refresh_period: Option<String>,

    // ---- 熔断 ----
    pub failure_rate_threshold: Option<f32>,
    pub ring_buffer_size_closed: Option<usize>,
    pub ring_buffer_size_half_open: Option<usize>,
    pub wait_duration_open: Option<String>,
    pub max_spend_time_ms: Option<u64>,
    pub ignore_exceptions: Option<Vec<String>>,
    pub predicate: Option<PredicateKind>,
    pub forced_open: Option<bool>,
    pub forced_disabled: Option<bool>,

    // ---- 重试 ----
    pub max_attempts: Option<u32>,
    pub include_exceptions: Option<Vec<String>>,
    pub exclude_exceptions: Option<Vec<String>>,
    pub backoff_delay: Option<String>,
    pub backoff_max_delay: Option<String>,
    pub backoff_multiplier: Option<f64>,

    // ---- 降级 ----
    pub fallback_function: Option<String>,
    pub fallback_value: Option<String>,
    pub fallback_error_kind: Option<String>,
    pub apply_to_business_error: Option<bool>,
}

impl ExternalConfig {
    /// 是否含有触发并发限制的字段
    pub fn has_concurrency_fields(&self) -> bool {
        self.max_concurrency_limit.is_some()
    }

    /// 是否含有触发速率限制的字段
    pub fn has_rate_fields(&self) -> bool {
        self.limit_for_period.is_some() || self.limit_refresh_period.is_some()
    }

    /// 是否含有触发熔断的字段
    pub fn has_breaker_fields(&self) -> bool {
        self.failure_rate_threshold.is_some()
            || self.ring_buffer_size_closed.is_some()
            || self.ring_buffer_size_half_open.is_some()
            || self.wait_duration_open.is_some()
            || self.max_spend_time_ms.is_some()
            || self.ignore_exceptions.is_some()
            || self.predicate.is_some()
            || self.forced_open.is_some()
            || self.forced_disabled.is_some()
    }

    /// 是否含有触发重试的字段
    pub fn has_retry_fields(&self) -> bool {
        self.max_attempts.is_some()
            || self.include_exceptions.is_some()
            || self.exclude_exceptions.is_some()
            || self.backoff_delay.is_some()
            || self.backoff_max_delay.is_some()
            || self.backoff_multiplier.is_some()
    }

    /// 是否含有触发降级的字段
    pub fn has_fallback_fields(&self) -> bool {
        self.fallback_function.is_some()
            || self.fallback_value.is_some()
            || self.fallback_error_kind.is_some()
    }

    /// 字段级覆盖：self 有值的字段保留，空字段取 base 的值
    ///
    /// 用于"资源专属外部配置覆盖分组外部配置"。
    pub fn overlay(&self, base: &ExternalConfig) -> ExternalConfig {
        macro_rules! pick {
            ($field:ident) => {
                self.$field.clone().or_else(|| base.$field.clone())
            };
        }
        ExternalConfig {
            max_concurrency_limit: pick!(max_concurrency_limit),
            limit_for_period: pick!(limit_for_period),
            limit_refresh_period: pick!(limit_refresh_period),
            failure_rate_threshold: pick!(failure_rate_threshold),
            ring_buffer_size_closed: pick!(ring_buffer_size_closed),
            ring_buffer_size_half_open: pick!(ring_buffer_size_half_open),
            wait_duration_open: pick!(wait_duration_open),
            max_spend_time_ms: pick!(max_spend_time_ms),
            ignore_exceptions: pick!(ignore_exceptions),
            predicate: pick!(predicate),
            forced_open: pick!(forced_open),
            forced_disabled: pick!(forced_disabled),
            max_attempts: pick!(max_attempts),
            include_exceptions: pick!(include_exceptions),
            exclude_exceptions: pick!(exclude_exceptions),
            backoff_delay: pick!(backoff_delay),
            backoff_max_delay: pick!(backoff_max_delay),
            backoff_multiplier: pick!(backoff_multiplier),
            fallback_function: pick!(fallback_function),
            fallback_value: pick!(fallback_value),
            fallback_error_kind: pick!(fallback_error_kind),
            apply_to_business_error: pick!(apply_to_business_error),
        }
    }
}

/// 分组外部配置：覆盖层 + 显式成员集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupExternalConfig {
    /// 分组共享的覆盖层
    pub config: ExternalConfig,
    /// 分组成员（普通资源名）
    pub members: Vec<String>,
}

// ============================================================================
// 时长字符串解析
// ============================================================================

/// 解析人类可读的时长字符串
///
/// 支持 `ms`/`s`/`m`/`h` 后缀；无后缀按毫秒解释。
pub fn parse_duration(text: &str) -> Result<Duration, ResguardError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ResguardError::ConfigError("时长字符串为空".to_string()));
    }

    let (digits, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => text.split_at(pos),
        None => (text, "ms"),
    };

    let value: u64 = digits.parse().map_err(|_| {
        ResguardError::ConfigError(format!("无法解析时长: {}", text))
    })?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(ResguardError::ConfigError(format!(
            "未知的时长单位 '{}': {}",
            other, text
        ))),
    }
}
