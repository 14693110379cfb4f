//! 固定窗口速率限制器
//!
//! 原子许可计数 + 原子窗口起点。许可立即授予或立即拒绝，
//! 从不排队等待。窗口中途的配置更新只从下一个窗口边界生效，
//! 已被拒绝的调用不会被追认。

use crate::config::RateConfig;
use crate::error::{RateStats, ResguardError};
use crate::guards::{CallOutcome, Guard, GuardType};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// 速率限制守卫
pub struct RateLimitGuard {
    resource: String,
    config: RwLock<Arc<RateConfig>>,
    /// 当前窗口的起点（UNIX 纳秒）
    window_start: AtomicU64,
    /// 当前窗口生效的许可上限（窗口重置时从配置取样）
    active_limit: AtomicU64,
    /// 当前窗口已消耗的许可数
    used: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimitGuard {
    pub fn new(resource: impl Into<String>, config: RateConfig) -> Self {
        let resource = resource.into();
        debug!(
            resource = %resource,
            limit = config.limit_for_period,
            period = ?config.limit_refresh_period,
            "创建速率限制器"
        );
        Self {
            resource,
            window_start: AtomicU64::new(now_nanos()),
            active_limit: AtomicU64::new(config.limit_for_period),
            used: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 当前生效配置的快照
    pub fn current_config(&self) -> Arc<RateConfig> {
        self.config.read().clone()
    }

    /// 动态换入新配置
    ///
    /// 新的许可上限从下一个窗口边界开始生效。
    pub fn update_config(&self, new_config: RateConfig) {
        debug!(
            resource = %self.resource,
            limit = new_config.limit_for_period,
            "速率限制器配置更新"
        );
        *self.config.write() = Arc::new(new_config);
    }

    /// 统计信息
    pub fn stats(&self) -> RateStats {
        RateStats {
            used_in_window: self.used.load(Ordering::SeqCst),
            limit_for_period: self.active_limit.load(Ordering::SeqCst),
            rejected_calls: self.rejected.load(Ordering::SeqCst),
        }
    }

    /// 窗口到期则重置（CAS 竞争中恰好一个线程完成重置）
    fn check_and_reset_window(&self) {
        let now = now_nanos();
        let period_nanos = self.current_config().limit_refresh_period.as_nanos() as u64;

        loop {
            let start = self.window_start.load(Ordering::SeqCst);
            let window_end = start.saturating_add(period_nanos);
            if now < window_end {
                break;
            }

            // 新窗口起点对齐到窗口边界
            let elapsed = now.saturating_sub(start);
            let windows_passed = elapsed / period_nanos.max(1);
            let new_start = start.saturating_add(windows_passed * period_nanos);

            match self.window_start.compare_exchange(
                start,
                new_start,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    // 重置计数并取样新的生效上限
                    self.used.store(0, Ordering::SeqCst);
                    self.active_limit
                        .store(self.current_config().limit_for_period, Ordering::SeqCst);
                    trace!(resource = %self.resource, "速率窗口重置");
                    break;
                }
                Err(_) => continue,
            }
        }
    }
}

impl Guard for RateLimitGuard {
    fn guard_type(&self) -> GuardType {
        GuardType::Rate
    }

    fn try_permit(&self) -> Result<(), ResguardError> {
        self.check_and_reset_window();

        let limit = self.active_limit.load(Ordering::SeqCst);
        loop {
            let used = self.used.load(Ordering::SeqCst);
            if used >= limit {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                trace!(resource = %self.resource, used, limit, "速率限制拒绝");
                return Err(ResguardError::RejectedByRateLimit {
                    resource: self.resource.clone(),
                });
            }
            match self.used.compare_exchange(
                used,
                used + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    fn release(&self, _outcome: Option<&CallOutcome<'_>>) {
        // 许可一经消耗不退还，固定窗口无需完成通知
    }
}
