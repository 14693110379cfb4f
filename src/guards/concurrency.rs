//! 并发限制器
//!
//! 原子在途计数。申请即判定，超过阈值立即拒绝；
//! 每次成功申请对应恰好一次释放（含异常与取消路径），
//! 该对称性是避免许可泄漏的硬性要求。

use crate::config::ConcurrencyConfig;
use crate::error::{ConcurrencyStats, ResguardError};
use crate::guards::{CallOutcome, Guard, GuardType};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// 并发限制守卫
pub struct ConcurrencyLimitGuard {
    resource: String,
    /// 并发阈值（原子单元，更新即生效）
    threshold: AtomicU64,
    in_flight: AtomicU64,
    rejected: AtomicU64,
}

impl ConcurrencyLimitGuard {
    pub fn new(resource: impl Into<String>, config: ConcurrencyConfig) -> Self {
        let resource = resource.into();
        debug!(resource = %resource, threshold = config.threshold, "创建并发限制器");
        Self {
            resource,
            threshold: AtomicU64::new(config.threshold),
            in_flight: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 当前生效配置的快照
    pub fn current_config(&self) -> ConcurrencyConfig {
        ConcurrencyConfig::new(self.threshold.load(Ordering::SeqCst))
    }

    /// 动态换入新配置；在途调用不受影响
    pub fn update_config(&self, new_config: ConcurrencyConfig) {
        debug!(
            resource = %self.resource,
            threshold = new_config.threshold,
            "并发限制器配置更新"
        );
        self.threshold.store(new_config.threshold, Ordering::SeqCst);
    }

    /// 统计信息
    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            threshold: self.threshold.load(Ordering::SeqCst),
            rejected_calls: self.rejected.load(Ordering::SeqCst),
        }
    }
}

impl Guard for ConcurrencyLimitGuard {
    fn guard_type(&self) -> GuardType {
        GuardType::Concurrency
    }

    fn try_permit(&self) -> Result<(), ResguardError> {
        let threshold = self.threshold.load(Ordering::SeqCst);
        let occupied = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if occupied > threshold {
            // 超限：回退刚加上的计数
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            trace!(resource = %self.resource, occupied, threshold, "并发限制拒绝");
            return Err(ResguardError::RejectedByConcurrencyLimit {
                resource: self.resource.clone(),
            });
        }
        Ok(())
    }

    fn release(&self, _outcome: Option<&CallOutcome<'_>>) {
        // 无论调用成功、失败还是被下游拒绝，均恰好释放一次
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
