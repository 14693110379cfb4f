//! 守卫模块
//!
//! 三种保护原语：熔断器、速率限制器、并发限制器。
//! 每个守卫都是线程安全的有状态决策单元，自带统计信息，
//! 并持有可原子替换的配置单元以支持动态重配。

pub mod breaker;
pub mod concurrency;
pub mod rate_limiter;

pub use breaker::{Breaker, PredicateRegistry};
pub use concurrency::ConcurrencyLimitGuard;
pub use rate_limiter::RateLimitGuard;

use crate::error::{Fault, ResguardError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 守卫类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardType {
    /// 并发限制
    Concurrency,
    /// 速率限制
    Rate,
    /// 熔断
    Breaker,
}

impl GuardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardType::Concurrency => "concurrency",
            GuardType::Rate => "rate",
            GuardType::Breaker => "breaker",
        }
    }
}

/// 一次已完成调用的结果视图
///
/// 熔断器据此做成功/失败判定。
#[derive(Debug)]
pub struct CallOutcome<'a> {
    /// 调用耗时
    pub elapsed: Duration,
    /// 业务失败（成功调用为 None）
    pub fault: Option<&'a Fault>,
}

impl<'a> CallOutcome<'a> {
    pub fn success(elapsed: Duration) -> Self {
        Self {
            elapsed,
            fault: None,
        }
    }

    pub fn failure(elapsed: Duration, fault: &'a Fault) -> Self {
        Self {
            elapsed,
            fault: Some(fault),
        }
    }
}

/// 守卫统一接口
///
/// 执行链对每次物理调用先依序 `try_permit`，完成后依序 `release`。
pub trait Guard: Send + Sync {
    /// 守卫类型
    fn guard_type(&self) -> GuardType;

    /// 申请放行；拒绝时返回携带资源标识的类型化错误
    fn try_permit(&self) -> Result<(), ResguardError>;

    /// 放行后的完成通知
    ///
    /// `outcome` 为 `None` 表示后续守卫拒绝、受保护调用未执行；
    /// 每次成功的 `try_permit` 必须恰好对应一次 `release`。
    fn release(&self, outcome: Option<&CallOutcome<'_>>);
}
