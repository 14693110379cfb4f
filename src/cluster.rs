//! 守卫集群与执行链
//!
//! 一个集群绑定一个资源标识，持有该资源的全部守卫（0..3 个）、
//! 可选的重试执行器与可选的降级处理器。集群创建后原地变更：
//! 动态重配可增删守卫或替换其配置，不丢失已积累的统计。
//!
//! 执行链对每次物理尝试按固定顺序评估：
//! 并发限制 → 速率限制 → 熔断 → 底层调用。
//! 任一守卫拒绝即短路，已放行的守卫仍按序收到完成通知。

use crate::config::{
    BreakerConfig, ConcurrencyConfig, RateConfig, RetryConfig,
};
use crate::error::{Fault, ResguardError};
use crate::fallback::FallbackHandler;
use crate::guards::{
    Breaker, CallOutcome, ConcurrencyLimitGuard, Guard, GuardType, PredicateRegistry,
    RateLimitGuard,
};
use crate::resource::ResourceId;
use crate::retry::RetryExecutor;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// 按固定顺序执行守卫链并驱动底层调用
///
/// 成功放行的守卫无论结果如何都会按序收到一次 `release`；
/// 某守卫拒绝时，先前放行的守卫以 `None` 释放（调用未执行）。
pub fn run_chain<T>(
    guards: &[Arc<dyn Guard>],
    call: &mut dyn FnMut() -> Result<T, Fault>,
) -> Result<T, ResguardError> {
    for (index, guard) in guards.iter().enumerate() {
        if let Err(rejection) = guard.try_permit() {
            trace!(guard = guard.guard_type().as_str(), "守卫拒绝，执行链短路");
            for granted in &guards[..index] {
                granted.release(None);
            }
            return Err(rejection);
        }
    }

    let started = Instant::now();
    let result = call();
    let elapsed = started.elapsed();

    match &result {
        Ok(_) => {
            let outcome = CallOutcome::success(elapsed);
            for guard in guards {
                guard.release(Some(&outcome));
            }
        }
        Err(fault) => {
            let outcome = CallOutcome::failure(elapsed, fault);
            for guard in guards {
                guard.release(Some(&outcome));
            }
        }
    }

    result.map_err(ResguardError::from)
}

/// 守卫集群
pub struct GuardCluster {
    resource: ResourceId,
    concurrency: RwLock<Option<Arc<ConcurrencyLimitGuard>>>,
    rate: RwLock<Option<Arc<RateLimitGuard>>>,
    breaker: RwLock<Option<Arc<Breaker>>>,
    retry: RwLock<Option<Arc<RetryExecutor>>>,
    fallback: RwLock<Option<Arc<FallbackHandler>>>,
}

impl GuardCluster {
    pub fn new(resource: ResourceId) -> Self {
        debug!(resource = %resource, "创建守卫集群");
        Self {
            resource,
            concurrency: RwLock::new(None),
            rate: RwLock::new(None),
            breaker: RwLock::new(None),
            retry: RwLock::new(None),
            fallback: RwLock::new(None),
        }
    }

    /// 绑定的资源标识
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// 固定顺序的守卫快照：并发 → 速率 → 熔断
    pub fn guards(&self) -> Vec<Arc<dyn Guard>> {
        let mut guards: Vec<Arc<dyn Guard>> = Vec::with_capacity(3);
        if let Some(concurrency) = self.concurrency.read().clone() {
            guards.push(concurrency);
        }
        if let Some(rate) = self.rate.read().clone() {
            guards.push(rate);
        }
        if let Some(breaker) = self.breaker.read().clone() {
            guards.push(breaker);
        }
        guards
    }

    /// 是否存在指定类型的守卫
    pub fn has_guard(&self, guard_type: GuardType) -> bool {
        match guard_type {
            GuardType::Concurrency => self.concurrency.read().is_some(),
            GuardType::Rate => self.rate.read().is_some(),
            GuardType::Breaker => self.breaker.read().is_some(),
        }
    }

    /// 熔断器引用（统计/强制态操作用）
    pub fn breaker(&self) -> Option<Arc<Breaker>> {
        self.breaker.read().clone()
    }

    /// 并发限制器引用
    pub fn concurrency_limiter(&self) -> Option<Arc<ConcurrencyLimitGuard>> {
        self.concurrency.read().clone()
    }

    /// 速率限制器引用
    pub fn rate_limiter(&self) -> Option<Arc<RateLimitGuard>> {
        self.rate.read().clone()
    }

    /// 重试执行器引用
    pub fn retry_executor(&self) -> Option<Arc<RetryExecutor>> {
        self.retry.read().clone()
    }

    /// 降级处理器引用
    pub fn fallback_handler(&self) -> Option<Arc<FallbackHandler>> {
        self.fallback.read().clone()
    }

    /// 无守卫且无重试时集群应从注册表移除
    pub fn is_empty(&self) -> bool {
        self.concurrency.read().is_none()
            && self.rate.read().is_none()
            && self.breaker.read().is_none()
            && self.retry.read().is_none()
    }

    /// 增/删/改并发限制守卫
    pub fn set_concurrency(&self, config: Option<ConcurrencyConfig>) {
        let mut slot = self.concurrency.write();
        match (slot.as_ref(), config) {
            (Some(existing), Some(new_config)) => existing.update_config(new_config),
            (None, Some(new_config)) => {
                *slot = Some(Arc::new(ConcurrencyLimitGuard::new(
                    self.resource.dotted_name(),
                    new_config,
                )));
            }
            (Some(_), None) => {
                debug!(resource = %self.resource, "移除并发限制守卫");
                *slot = None;
            }
            (None, None) => {}
        }
    }

    /// 增/删/改速率限制守卫
    pub fn set_rate(&self, config: Option<RateConfig>) {
        let mut slot = self.rate.write();
        match (slot.as_ref(), config) {
            (Some(existing), Some(new_config)) => existing.update_config(new_config),
            (None, Some(new_config)) => {
                *slot = Some(Arc::new(RateLimitGuard::new(
                    self.resource.dotted_name(),
                    new_config,
                )));
            }
            (Some(_), None) => {
                debug!(resource = %self.resource, "移除速率限制守卫");
                *slot = None;
            }
            (None, None) => {}
        }
    }

    /// 增/删/改熔断守卫
    pub fn set_breaker(&self, config: Option<BreakerConfig>, predicates: &Arc<PredicateRegistry>) {
        let mut slot = self.breaker.write();
        match (slot.as_ref(), config) {
            (Some(existing), Some(new_config)) => existing.update_config(new_config),
            (None, Some(new_config)) => {
                *slot = Some(Arc::new(Breaker::new(
                    self.resource.dotted_name(),
                    new_config,
                    Arc::clone(predicates),
                )));
            }
            (Some(_), None) => {
                debug!(resource = %self.resource, "移除熔断守卫");
                *slot = None;
            }
            (None, None) => {}
        }
    }

    /// 增/删/改重试执行器
    pub fn set_retry(&self, config: Option<RetryConfig>) {
        let mut slot = self.retry.write();
        match (slot.as_ref(), config) {
            (Some(existing), Some(new_config)) => existing.update_config(new_config),
            (None, Some(new_config)) => {
                *slot = Some(Arc::new(RetryExecutor::new(
                    self.resource.dotted_name(),
                    new_config,
                )));
            }
            (Some(_), None) => {
                debug!(resource = %self.resource, "移除重试执行器");
                *slot = None;
            }
            (None, None) => {}
        }
    }

    /// 替换降级处理器
    pub fn set_fallback(&self, handler: Option<FallbackHandler>) {
        *self.fallback.write() = handler.map(Arc::new);
    }

    /// 同步执行受保护调用
    ///
    /// 配置了重试时按物理尝试重复整条守卫链；
    /// 最终错误命中降级条件时以降级结果替换。
    pub fn execute<T: 'static>(
        &self,
        mut call: impl FnMut() -> Result<T, Fault>,
    ) -> Result<T, ResguardError> {
        let retry = self.retry.read().clone();
        let result = match retry {
            Some(retry) => retry.execute(|_attempt| {
                let guards = self.guards();
                run_chain(&guards, &mut call)
            }),
            None => {
                let guards = self.guards();
                run_chain(&guards, &mut call)
            }
        };
        self.apply_fallback(result)
    }

    /// 进入异步调用：同步评估守卫，返回手动完成句柄
    ///
    /// 异步调用不重试。
    pub fn try_enter(&self) -> Result<AsyncEntry, ResguardError> {
        let guards = self.guards();
        for (index, guard) in guards.iter().enumerate() {
            if let Err(rejection) = guard.try_permit() {
                for granted in &guards[..index] {
                    granted.release(None);
                }
                return Err(rejection);
            }
        }
        Ok(AsyncEntry {
            resource: self.resource.dotted_name(),
            guards,
            started: Instant::now(),
            completed: AtomicBool::new(false),
        })
    }

    /// 错误命中降级条件时以降级结果替换
    pub fn apply_fallback<T: 'static>(
        &self,
        result: Result<T, ResguardError>,
    ) -> Result<T, ResguardError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let handler = self.fallback.read().clone();
                match handler {
                    Some(handler) if handler.applies_to(&err) => handler.handle(err),
                    _ => Err(err),
                }
            }
        }
    }
}

/// 异步调用句柄
///
/// 守卫已同步放行；调用方在异步结果落定时调用一个 `end_with_*`
/// 方法交付完成通知。句柄被丢弃而未完成时按取消处理，
/// 保证每个放行守卫恰好收到一次通知。
pub struct AsyncEntry {
    resource: String,
    guards: Vec<Arc<dyn Guard>>,
    started: Instant,
    completed: AtomicBool,
}

impl AsyncEntry {
    /// 无守卫句柄：资源未配置任何守卫时调用直通，完成通知为空操作
    pub(crate) fn unguarded(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            guards: Vec::new(),
            started: Instant::now(),
            completed: AtomicBool::new(false),
        }
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 以成功结束
    pub fn end_with_success(&self) {
        self.finish(None);
    }

    /// 以带值结果结束（值本身不影响守卫统计，成功与否由错误决定）
    pub fn end_with_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::error::Error,
    {
        match result {
            Ok(_) => self.finish(None),
            Err(err) => {
                let fault = Fault::new("AsyncError", err.to_string());
                self.finish(Some(&fault));
            }
        }
    }

    /// 以失败结束
    pub fn end_with_error(&self, fault: &Fault) {
        self.finish(Some(fault));
    }

    fn finish(&self, fault: Option<&Fault>) {
        // 完成通知恰好一次
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let elapsed = self.started.elapsed();
        let outcome = match fault {
            Some(fault) => CallOutcome::failure(elapsed, fault),
            None => CallOutcome::success(elapsed),
        };
        for guard in &self.guards {
            guard.release(Some(&outcome));
        }
    }
}

impl Drop for AsyncEntry {
    fn drop(&mut self) {
        // 未显式完成即取消：释放许可但不产生统计样本
        if !self.completed.swap(true, Ordering::SeqCst) {
            trace!(resource = %self.resource, "异步调用未完成即取消");
            for guard in &self.guards {
                guard.release(None);
            }
        }
    }
}
