//! Copyright (c) 2026, resguard developers
//!
//! Apache-2.0 License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。

use std::sync::Arc;
use thiserror::Error;

/// Resguard 错误类型
#[derive(Error, Debug, Clone)]
pub enum ResguardError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 并发数超过阈值，请求被拒绝
    #[error("并发限制拒绝: resource={resource}")]
    RejectedByConcurrencyLimit {
        /// 被保护的资源名
        resource: String,
    },

    /// 周期内许可耗尽，请求被拒绝
    #[error("速率限制拒绝: resource={resource}")]
    RejectedByRateLimit {
        /// 被保护的资源名
        resource: String,
    },

    /// 熔断器未放行，请求被拒绝
    #[error("熔断器拒绝: resource={resource}, state={state:?}")]
    RejectedByBreaker {
        /// 被保护的资源名
        resource: String,
        /// 拒绝时的熔断器状态
        state: BreakerState,
    },

    /// 重试次数耗尽
    #[error("重试次数耗尽: resource={resource}, attempts={attempts}")]
    RetryExhausted {
        /// 被保护的资源名
        resource: String,
        /// 已执行的尝试次数
        attempts: u32,
    },

    /// 降级处理器构建失败（配置期错误，不在调用路径上产生）
    #[error("降级处理器构建失败: {0}")]
    FallbackConstructionFailed(String),

    /// 降级处理器执行失败，内部携带原始拒绝/异常
    #[error("降级处理器执行失败: {reason}")]
    FallbackInvocationFailed {
        /// 失败原因
        reason: String,
        /// 触发降级的原始错误
        #[source]
        cause: Box<ResguardError>,
    },

    /// 业务调用失败
    #[error("业务调用失败: {0}")]
    Business(#[from] Fault),
}

impl ResguardError {
    /// 是否为守卫拒绝类错误（并发/速率/熔断）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResguardError::RejectedByConcurrencyLimit { .. }
                | ResguardError::RejectedByRateLimit { .. }
                | ResguardError::RejectedByBreaker { .. }
        )
    }

    /// 若为业务失败，返回其 Fault
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            ResguardError::Business(fault) => Some(fault),
            _ => None,
        }
    }
}

/// 业务失败载体
///
/// 以字符串 kind 标识失败类型（通常取自错误类型名），
/// 供熔断/重试的按异常类型判定策略使用。
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Fault {
    kind: String,
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Fault {
    /// 以显式 kind 构造
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// 从具体错误类型构造，kind 取该类型的类型名
    pub fn of<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: short_type_name::<E>().to_string(),
            message: err.to_string(),
            cause: Some(Arc::new(err)),
        }
    }

    /// 失败类型标识
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// 失败描述
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 原始错误（若由具体错误构造）
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.cause.as_deref()
    }
}

/// 取类型名的最后一段（去掉模块路径）
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    /// 关闭状态（正常放行，统计失败率）
    Closed,
    /// 打开状态（全部拒绝，等待恢复窗口）
    Open,
    /// 半开状态（试探性放行）
    HalfOpen,
    /// 强制打开（运维指令，永不放行）
    ForcedOpen,
    /// 强制关闭（运维指令，永远放行，不统计）
    ForcedDisabled,
}

impl BreakerState {
    /// 是否为运维强制状态
    pub fn is_forced(&self) -> bool {
        matches!(self, BreakerState::ForcedOpen | BreakerState::ForcedDisabled)
    }
}

/// 熔断器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BreakerStats {
    /// 当前状态
    pub state: BreakerState,
    /// 当前环形缓冲内的失败数
    pub failure_count: u64,
    /// 当前环形缓冲内已记录的调用数
    pub buffered_calls: u64,
    /// 环形缓冲容量
    pub buffer_capacity: u64,
    /// 总调用次数
    pub total_calls: u64,
    /// 总拒绝次数
    pub not_permitted_calls: u64,
    /// 最后状态变更时间
    pub last_state_change: Option<chrono::DateTime<chrono::Utc>>,
}

/// 速率限制器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateStats {
    /// 当前窗口已消耗的许可数
    pub used_in_window: u64,
    /// 每窗口许可上限
    pub limit_for_period: u64,
    /// 总拒绝次数
    pub rejected_calls: u64,
}

/// 并发限制器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConcurrencyStats {
    /// 当前在途调用数
    pub in_flight: u64,
    /// 并发阈值
    pub threshold: u64,
    /// 总拒绝次数
    pub rejected_calls: u64,
}
