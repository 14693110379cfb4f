//! 熔断器实现
//!
//! 五状态熔断器：Closed、Open、HalfOpen、ForcedOpen、ForcedDisabled。
//!
//! # 特性
//!
//! - **环形缓冲统计**: 固定容量的调用结果环，满环后按失败率触发状态转换
//! - **判定策略**: 按异常类型、按耗时、两者任一，或已注册的自定义回调
//! - **运维强制态**: ForcedOpen/ForcedDisabled 绕过统计，仅由重配进出
//! - **低锁开销**: 槽位与计数全部使用原子操作，环替换才加写锁

use crate::config::{BreakerConfig, ForcedState, PredicateKind};
use crate::error::{BreakerState, BreakerStats, ResguardError};
use crate::guards::{CallOutcome, Guard, GuardType};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// 自定义判定回调：返回 true 表示该次调用记为失败
pub type OutcomePredicate = Arc<dyn Fn(&CallOutcome<'_>) -> bool + Send + Sync>;

/// 自定义判定回调注册表
///
/// `PredicateKind::Custom(name)` 按名引用此处注册的回调。
#[derive(Default)]
pub struct PredicateRegistry {
    predicates: RwLock<AHashMap<String, OutcomePredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册自定义判定回调
    pub fn register(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&CallOutcome<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.predicates
            .write()
            .insert(name.into(), Arc::new(predicate));
    }

    fn get(&self, name: &str) -> Option<OutcomePredicate> {
        self.predicates.read().get(name).cloned()
    }
}

// 槽位取值
const SLOT_EMPTY: u8 = 0;
const SLOT_SUCCESS: u8 = 1;
const SLOT_FAILURE: u8 = 2;

/// 调用结果环形缓冲
///
/// 槽位写入使用单槽 swap，计数用原子增减，不加锁。
struct OutcomeRing {
    slots: Vec<AtomicU8>,
    next: AtomicUsize,
    filled: AtomicUsize,
    failures: AtomicUsize,
}

impl OutcomeRing {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(AtomicU8::new(SLOT_EMPTY));
        }
        Self {
            slots,
            next: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 写入一次结果，覆盖最旧槽位，返回 (已填充数, 失败数)
    fn record(&self, failure: bool) -> (usize, usize) {
        let index = self.next.fetch_add(1, Ordering::SeqCst) % self.slots.len();
        let new = if failure { SLOT_FAILURE } else { SLOT_SUCCESS };
        let old = self.slots[index].swap(new, Ordering::SeqCst);

        if old == SLOT_EMPTY {
            self.filled.fetch_add(1, Ordering::SeqCst);
        }
        if old == SLOT_FAILURE {
            self.failures.fetch_sub(1, Ordering::SeqCst);
        }
        if failure {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        (
            self.filled.load(Ordering::SeqCst),
            self.failures.load(Ordering::SeqCst),
        )
    }

    fn snapshot(&self) -> (usize, usize) {
        (
            self.filled.load(Ordering::SeqCst),
            self.failures.load(Ordering::SeqCst),
        )
    }
}

/// 熔断器守卫
pub struct Breaker {
    resource: String,
    config: RwLock<Arc<BreakerConfig>>,
    state: AtomicU8,
    ring: RwLock<OutcomeRing>,
    opened_at: Mutex<Option<Instant>>,
    last_state_change: Mutex<Option<chrono::DateTime<chrono::Utc>>>,
    total_calls: AtomicU64,
    not_permitted: AtomicU64,
    predicates: Arc<PredicateRegistry>,
}

// 状态编码（AtomicU8）
const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;
const STATE_FORCED_OPEN: u8 = 3;
const STATE_FORCED_DISABLED: u8 = 4;

fn decode_state(raw: u8) -> BreakerState {
    match raw {
        STATE_OPEN => BreakerState::Open,
        STATE_HALF_OPEN => BreakerState::HalfOpen,
        STATE_FORCED_OPEN => BreakerState::ForcedOpen,
        STATE_FORCED_DISABLED => BreakerState::ForcedDisabled,
        _ => BreakerState::Closed,
    }
}

fn forced_state_code(forced: ForcedState) -> u8 {
    match forced {
        ForcedState::Open => STATE_FORCED_OPEN,
        ForcedState::Disabled => STATE_FORCED_DISABLED,
    }
}

impl Breaker {
    /// 创建熔断器
    ///
    /// 初始状态为 Closed，除非配置携带强制标记。
    pub fn new(
        resource: impl Into<String>,
        config: BreakerConfig,
        predicates: Arc<PredicateRegistry>,
    ) -> Self {
        let resource = resource.into();
        let initial_state = match config.forced {
            Some(forced) => forced_state_code(forced),
            None => STATE_CLOSED,
        };
        debug!(
            resource = %resource,
            threshold = config.failure_rate_threshold,
            ring_closed = config.ring_buffer_size_closed,
            "创建熔断器"
        );
        Self {
            ring: RwLock::new(OutcomeRing::new(config.ring_buffer_size_closed)),
            resource,
            config: RwLock::new(Arc::new(config)),
            state: AtomicU8::new(initial_state),
            opened_at: Mutex::new(None),
            last_state_change: Mutex::new(Some(chrono::Utc::now())),
            total_calls: AtomicU64::new(0),
            not_permitted: AtomicU64::new(0),
            predicates,
        }
    }

    /// 当前状态
    pub fn state(&self) -> BreakerState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    /// 资源名
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// 当前生效配置的快照
    pub fn current_config(&self) -> Arc<BreakerConfig> {
        self.config.read().clone()
    }

    /// 统计信息
    pub fn stats(&self) -> BreakerStats {
        let ring = self.ring.read();
        let (filled, failures) = ring.snapshot();
        BreakerStats {
            state: self.state(),
            failure_count: failures as u64,
            buffered_calls: filled as u64,
            buffer_capacity: ring.capacity() as u64,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
            last_state_change: *self.last_state_change.lock(),
        }
    }

    /// 动态换入新配置
    ///
    /// 配置快照整体替换；统计保留，除非算法要求重置：
    /// 强制态进出回到 Closed 并清空统计，环容量变化时重建当前环。
    pub fn update_config(&self, new_config: BreakerConfig) {
        let old_config = self.current_config();
        let state = self.state();

        match (state.is_forced(), new_config.forced) {
            // 进入或切换强制态
            (_, Some(forced)) => {
                let code = forced_state_code(forced);
                if self.state.swap(code, Ordering::SeqCst) != code {
                    info!(resource = %self.resource, state = ?decode_state(code), "熔断器进入强制态");
                    self.mark_state_change();
                }
            }
            // 清除强制标记：回到 Closed，统计重新开始
            (true, None) => {
                self.transition(self.state.load(Ordering::SeqCst), STATE_CLOSED, &new_config);
            }
            // 常规更新：环容量变化时重建当前环
            (false, None) => {
                let resized = match state {
                    BreakerState::Closed => {
                        new_config.ring_buffer_size_closed != old_config.ring_buffer_size_closed
                    }
                    BreakerState::HalfOpen => {
                        new_config.ring_buffer_size_half_open
                            != old_config.ring_buffer_size_half_open
                    }
                    _ => false,
                };
                if resized {
                    let capacity = match state {
                        BreakerState::HalfOpen => new_config.ring_buffer_size_half_open,
                        _ => new_config.ring_buffer_size_closed,
                    };
                    *self.ring.write() = OutcomeRing::new(capacity);
                    debug!(resource = %self.resource, capacity, "熔断器环形缓冲重建");
                }
            }
        }

        *self.config.write() = Arc::new(new_config);
    }

    /// 状态转换并按目标状态重建环
    fn transition(&self, from: u8, to: u8, config: &BreakerConfig) -> bool {
        if self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        match to {
            STATE_CLOSED => {
                *self.ring.write() = OutcomeRing::new(config.ring_buffer_size_closed);
            }
            STATE_HALF_OPEN => {
                *self.ring.write() = OutcomeRing::new(config.ring_buffer_size_half_open);
            }
            STATE_OPEN => {
                *self.opened_at.lock() = Some(Instant::now());
            }
            _ => {}
        }
        self.mark_state_change();
        info!(
            resource = %self.resource,
            from = ?decode_state(from),
            to = ?decode_state(to),
            "熔断器状态变更"
        );
        true
    }

    fn mark_state_change(&self) {
        *self.last_state_change.lock() = Some(chrono::Utc::now());
    }

    /// 把一次完成的调用归类为失败与否
    fn classify(&self, config: &BreakerConfig, outcome: &CallOutcome<'_>) -> bool {
        let by_exception = |outcome: &CallOutcome<'_>| match outcome.fault {
            Some(fault) => !config
                .ignore_exceptions
                .iter()
                .any(|kind| kind == fault.kind()),
            None => false,
        };
        let by_latency = |outcome: &CallOutcome<'_>| match config.max_spend_time_ms {
            Some(limit) => outcome.elapsed.as_millis() as u64 > limit,
            None => false,
        };

        match &config.predicate {
            PredicateKind::ByException => by_exception(outcome),
            PredicateKind::ByLatency => by_latency(outcome),
            PredicateKind::ByBoth => by_exception(outcome) || by_latency(outcome),
            PredicateKind::Custom(name) => match self.predicates.get(name) {
                Some(predicate) => predicate(outcome),
                None => {
                    warn!(
                        resource = %self.resource,
                        predicate = %name,
                        "自定义判定回调未注册，退回按异常判定"
                    );
                    by_exception(outcome)
                }
            },
        }
    }

    fn reject(&self, state: BreakerState) -> ResguardError {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
        trace!(resource = %self.resource, state = ?state, "熔断器拒绝请求");
        ResguardError::RejectedByBreaker {
            resource: self.resource.clone(),
            state,
        }
    }
}

impl Guard for Breaker {
    fn guard_type(&self) -> GuardType {
        GuardType::Breaker
    }

    fn try_permit(&self) -> Result<(), ResguardError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match self.state.load(Ordering::SeqCst) {
            STATE_FORCED_DISABLED | STATE_CLOSED | STATE_HALF_OPEN => Ok(()),
            STATE_FORCED_OPEN => Err(self.reject(BreakerState::ForcedOpen)),
            _ => {
                // Open：恢复窗口到期则转入半开试探
                let config = self.current_config();
                let opened_at = *self.opened_at.lock();
                let expired = opened_at
                    .map(|opened| opened.elapsed() >= config.wait_duration_open)
                    .unwrap_or(true);
                if expired {
                    self.transition(STATE_OPEN, STATE_HALF_OPEN, &config);
                    // CAS 失败说明并发者已完成转换，同样放行
                    Ok(())
                } else {
                    Err(self.reject(BreakerState::Open))
                }
            }
        }
    }

    fn release(&self, outcome: Option<&CallOutcome<'_>>) {
        // 下游守卫拒绝时调用未执行，不产生统计样本
        let Some(outcome) = outcome else {
            return;
        };

        let state = self.state.load(Ordering::SeqCst);
        if state != STATE_CLOSED && state != STATE_HALF_OPEN {
            return;
        }

        let config = self.current_config();
        let failure = self.classify(&config, outcome);

        let ring = self.ring.read();
        let capacity = ring.capacity();
        let (filled, failures) = ring.record(failure);
        drop(ring);

        // 满环才计算失败率
        if filled < capacity {
            return;
        }
        let failure_rate = failures as f32 / capacity as f32 * 100.0;

        if failure_rate >= config.failure_rate_threshold {
            self.transition(state, STATE_OPEN, &config);
        } else if state == STATE_HALF_OPEN {
            // 半开环填满且未超阈值：恢复
            self.transition(STATE_HALF_OPEN, STATE_CLOSED, &config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Fault;
    use std::time::Duration;

    fn breaker(config: BreakerConfig) -> Breaker {
        Breaker::new("demo", config, Arc::new(PredicateRegistry::new()))
    }

    fn run_failure(breaker: &Breaker) {
        breaker.try_permit().unwrap();
        let fault = Fault::new("IoError", "boom");
        breaker.release(Some(&CallOutcome::failure(Duration::from_millis(1), &fault)));
    }

    fn run_success(breaker: &Breaker) {
        breaker.try_permit().unwrap();
        breaker.release(Some(&CallOutcome::success(Duration::from_millis(1))));
    }

    #[test]
    fn test_initial_state_closed() {
        let breaker = breaker(BreakerConfig::default());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_opens_exactly_when_ring_full_and_threshold_met() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(4)
            .failure_rate_threshold(50.0)
            .build();
        let breaker = breaker(config);

        // 三次失败：环未满，不得提前熔断
        for _ in 0..3 {
            run_failure(&breaker);
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        // 第四次写入后满环，失败率 100% >= 50%
        run_failure(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(4)
            .failure_rate_threshold(50.0)
            .build();
        let breaker = breaker(config);

        run_failure(&breaker);
        for _ in 0..3 {
            run_success(&breaker);
        }
        // 满环，失败率 25% < 50%
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_until_wait_elapsed() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .wait_duration_open(Duration::from_millis(50))
            .build();
        let breaker = breaker(config);
        run_failure(&breaker);
        run_failure(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.try_permit().unwrap_err();
        assert!(matches!(err, ResguardError::RejectedByBreaker { .. }));

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_permit().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.release(Some(&CallOutcome::success(Duration::from_millis(1))));
    }

    #[test]
    fn test_half_open_recovers_on_clean_buffer() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .ring_buffer_size_half_open(3)
            .wait_duration_open(Duration::from_millis(10))
            .build();
        let breaker = breaker(config);
        run_failure(&breaker);
        run_failure(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        for _ in 0..3 {
            run_success(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_breach() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .ring_buffer_size_half_open(2)
            .wait_duration_open(Duration::from_millis(10))
            .build();
        let breaker = breaker(config);
        run_failure(&breaker);
        run_failure(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        run_failure(&breaker);
        run_failure(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_ignored_exception_not_counted_as_failure() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .ignore_exception("IoError")
            .build();
        let breaker = breaker(config);
        run_failure(&breaker);
        run_failure(&breaker);
        // IoError 在忽略列表内，满环失败率 0%
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_latency_predicate() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .predicate(PredicateKind::ByLatency)
            .max_spend_time_ms(10)
            .build();
        let breaker = breaker(config);

        for _ in 0..2 {
            breaker.try_permit().unwrap();
            breaker.release(Some(&CallOutcome::success(Duration::from_millis(50))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_custom_predicate() {
        let registry = Arc::new(PredicateRegistry::new());
        registry.register("always-fail", |_| true);
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .predicate(PredicateKind::Custom("always-fail".to_string()))
            .build();
        let breaker = Breaker::new("demo", config, registry);

        run_success(&breaker);
        run_success(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_forced_open_never_permits() {
        let config = BreakerConfig::builder().forced(ForcedState::Open).build();
        let breaker = breaker(config);
        assert_eq!(breaker.state(), BreakerState::ForcedOpen);
        assert!(breaker.try_permit().is_err());
    }

    #[test]
    fn test_forced_disabled_always_permits() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(1)
            .forced(ForcedState::Disabled)
            .build();
        let breaker = breaker(config);
        for _ in 0..10 {
            assert!(breaker.try_permit().is_ok());
            let fault = Fault::new("IoError", "boom");
            breaker.release(Some(&CallOutcome::failure(Duration::from_millis(1), &fault)));
        }
        assert_eq!(breaker.state(), BreakerState::ForcedDisabled);
    }

    #[test]
    fn test_clearing_forced_returns_to_closed_with_fresh_stats() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(2)
            .build();
        let breaker = breaker(config.clone());
        run_failure(&breaker);

        let mut forced = config.clone();
        forced.forced = Some(ForcedState::Open);
        breaker.update_config(forced);
        assert_eq!(breaker.state(), BreakerState::ForcedOpen);

        breaker.update_config(config);
        assert_eq!(breaker.state(), BreakerState::Closed);
        let stats = breaker.stats();
        assert_eq!(stats.buffered_calls, 0);
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn test_forced_disabled_after_clearing_forced_open() {
        let base = BreakerConfig::builder().ring_buffer_size_closed(2).build();
        let breaker = breaker(base.clone());

        let mut forced_open = base.clone();
        forced_open.forced = Some(ForcedState::Open);
        breaker.update_config(forced_open);
        breaker.update_config(base.clone());
        assert_eq!(breaker.state(), BreakerState::Closed);

        let mut forced_disabled = base;
        forced_disabled.forced = Some(ForcedState::Disabled);
        breaker.update_config(forced_disabled);
        assert_eq!(breaker.state(), BreakerState::ForcedDisabled);
        assert!(breaker.try_permit().is_ok());
    }

    #[test]
    fn test_config_swap_preserves_statistics() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(4)
            .failure_rate_threshold(80.0)
            .build();
        let breaker = breaker(config.clone());
        run_failure(&breaker);
        run_failure(&breaker);

        // 仅调阈值，环容量不变：统计必须保留
        let mut updated = config;
        updated.failure_rate_threshold = 90.0;
        breaker.update_config(updated);

        let stats = breaker.stats();
        assert_eq!(stats.buffered_calls, 2);
        assert_eq!(stats.failure_count, 2);
    }

    #[test]
    fn test_ring_resize_resets_buffer() {
        let config = BreakerConfig::builder().ring_buffer_size_closed(4).build();
        let breaker = breaker(config.clone());
        run_failure(&breaker);

        let mut updated = config;
        updated.ring_buffer_size_closed = 8;
        breaker.update_config(updated);

        let stats = breaker.stats();
        assert_eq!(stats.buffer_capacity, 8);
        assert_eq!(stats.buffered_calls, 0);
    }

    #[test]
    fn test_concurrent_recording() {
        let config = BreakerConfig::builder()
            .ring_buffer_size_closed(64)
            .failure_rate_threshold(101.0)
            .build();
        let breaker = Arc::new(breaker(config));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    breaker.try_permit().unwrap();
                    breaker.release(Some(&CallOutcome::success(Duration::from_millis(1))));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = breaker.stats();
        assert_eq!(stats.buffered_calls, 64);
        assert_eq!(stats.total_calls, 800);
    }
}
