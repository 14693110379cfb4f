//! 重试执行器
//!
//! 以有界重试包裹底层调用。重试判定基于错误 kind 的
//! include/exclude 列表与尝试次数上限，重试间隔按指数退避并设上限。
//!
//! 重试位于守卫序列之外：守卫按物理尝试逐次评估，
//! 一次被限流的尝试同样消耗守卫许可。异步调用一律不重试。

use crate::config::RetryConfig;
use crate::error::{Fault, ResguardError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// 重试执行器
pub struct RetryExecutor {
    resource: String,
    config: RwLock<Arc<RetryConfig>>,
    /// 实际发生的重试次数（不含首次调用）
    total_retries: AtomicU64,
}

impl RetryExecutor {
    pub fn new(resource: impl Into<String>, config: RetryConfig) -> Self {
        let resource = resource.into();
        debug!(
            resource = %resource,
            max_attempts = config.max_attempts,
            "创建重试执行器"
        );
        Self {
            resource,
            config: RwLock::new(Arc::new(config)),
            total_retries: AtomicU64::new(0),
        }
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 当前生效配置的快照
    pub fn current_config(&self) -> Arc<RetryConfig> {
        self.config.read().clone()
    }

    /// 动态换入新配置
    pub fn update_config(&self, new_config: RetryConfig) {
        debug!(
            resource = %self.resource,
            max_attempts = new_config.max_attempts,
            "重试执行器配置更新"
        );
        *self.config.write() = Arc::new(new_config);
    }

    /// 实际发生的重试次数
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// 该业务失败是否可重试
    fn retryable(&self, config: &RetryConfig, fault: &Fault) -> bool {
        let kind = fault.kind();
        if config
            .exclude_exceptions
            .iter()
            .any(|excluded| excluded == kind)
        {
            return false;
        }
        // include 为空表示全部可重试
        config.include_exceptions.is_empty()
            || config.include_exceptions.iter().any(|included| included == kind)
    }

    /// 以当前重试策略执行一次逻辑调用
    ///
    /// `attempt_fn` 代表一次物理尝试（守卫评估 + 底层调用），
    /// 入参为从 1 开始的尝试序号。守卫拒绝不参与重试，立即向上传播；
    /// 重试耗尽时传播最后一次尝试的错误本身。
    pub fn execute<T>(
        &self,
        mut attempt_fn: impl FnMut(u32) -> Result<T, ResguardError>,
    ) -> Result<T, ResguardError> {
        let config = self.current_config();
        if config.max_attempts == 0 {
            warn!(resource = %self.resource, "重试配置的尝试次数为 0");
            return Err(ResguardError::RetryExhausted {
                resource: self.resource.clone(),
                attempts: 0,
            });
        }

        let mut attempt = 1u32;
        loop {
            match attempt_fn(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let fault = match err.as_fault() {
                        Some(fault) => fault,
                        // 守卫拒绝等非业务失败：不重试
                        None => return Err(err),
                    };
                    if attempt >= config.max_attempts || !self.retryable(&config, fault) {
                        return Err(err);
                    }

                    let delay = config.backoff.delay_for(attempt);
                    trace!(
                        resource = %self.resource,
                        attempt,
                        kind = fault.kind(),
                        delay = ?delay,
                        "调用失败，准备重试"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                }
            }
        }
    }
}
