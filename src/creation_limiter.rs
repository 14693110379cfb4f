//! 守卫创建限额
//!
//! 参数限定资源按参数值派生守卫，值域不可控时可能无限制地
//! 创建守卫实例。创建限额按 (父资源, 守卫类型) 维度封顶：
//! 超出预算的新参数值不再派生守卫，已有守卫不受影响。

use crate::constants::{DEFAULT_MAX_SIZE_LIMIT, MAX_SIZE_LIMIT_ENV};
use crate::guards::GuardType;
use crate::pattern_cache::PatternCache;
use ahash::AHashMap;
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::warn;

lazy_static! {
    /// 进程级全局默认限额，可由环境变量覆盖
    static ref ENV_SIZE_LIMIT: Option<u64> = std::env::var(MAX_SIZE_LIMIT_ENV)
        .ok()
        .and_then(|value| value.parse().ok());
}

/// 创建限额配置
#[derive(Debug, Clone)]
pub struct SizeLimitConfig {
    global_limit: u64,
    /// 按 (维度, 守卫类型) 的精确限额，最高优先级
    overrides: AHashMap<(String, GuardType), u64>,
    /// 按维度的精确限额，对该维度全部守卫类型生效
    resource_limits: AHashMap<String, u64>,
}

impl Default for SizeLimitConfig {
    fn default() -> Self {
        Self::new(ENV_SIZE_LIMIT.unwrap_or(DEFAULT_MAX_SIZE_LIMIT))
    }
}

impl SizeLimitConfig {
    pub fn new(global_limit: u64) -> Self {
        Self {
            global_limit,
            overrides: AHashMap::new(),
            resource_limits: AHashMap::new(),
        }
    }

    /// 为某 (维度, 守卫类型) 单独设限
    pub fn with_override(
        mut self,
        resource: impl Into<String>,
        guard_type: GuardType,
        limit: u64,
    ) -> Self {
        self.overrides.insert((resource.into(), guard_type), limit);
        self
    }

    /// 为某维度（全部守卫类型）单独设限
    pub fn with_resource_limit(mut self, resource: impl Into<String>, limit: u64) -> Self {
        self.resource_limits.insert(resource.into(), limit);
        self
    }

    fn exact_limit(&self, resource: &str, guard_type: GuardType) -> Option<u64> {
        self.overrides
            .get(&(resource.to_string(), guard_type))
            .or_else(|| self.resource_limits.get(resource))
            .copied()
    }
}

/// 创建限额器
///
/// 计数随守卫创建递增、随守卫移除递减，配置可整体替换。
/// 限额解析顺序：(维度, 类型) 精确限额 → 维度精确限额 →
/// 模式键限额 → 全局默认。
pub struct CreationLimiter {
    config: RwLock<SizeLimitConfig>,
    /// 模式键 → 限额，扇出到所有匹配的维度
    patterns: PatternCache<u64>,
    counts: DashMap<(String, GuardType), u64, ahash::RandomState>,
}

impl Default for CreationLimiter {
    fn default() -> Self {
        Self::new(SizeLimitConfig::default())
    }
}

impl CreationLimiter {
    pub fn new(config: SizeLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            patterns: PatternCache::new(),
            counts: DashMap::default(),
        }
    }

    fn limit_for(&self, resource: &str, guard_type: GuardType) -> u64 {
        let config = self.config.read();
        config
            .exact_limit(resource, guard_type)
            .or_else(|| self.patterns.lookup(resource))
            .unwrap_or(config.global_limit)
    }

    /// 申请一个创建名额，成功则计数加一
    pub fn try_acquire(&self, resource: &str, guard_type: GuardType) -> bool {
        let limit = self.limit_for(resource, guard_type);
        let mut entry = self
            .counts
            .entry((resource.to_string(), guard_type))
            .or_insert(0);
        if *entry >= limit {
            warn!(
                resource = resource,
                guard = guard_type.as_str(),
                limit = limit,
                "守卫创建数已达限额，新参数值不再派生守卫"
            );
            return false;
        }
        *entry += 1;
        true
    }

    /// 归还一个名额（对应守卫被移除）
    pub fn release(&self, resource: &str, guard_type: GuardType) {
        if let Some(mut entry) = self.counts.get_mut(&(resource.to_string(), guard_type)) {
            *entry = entry.saturating_sub(1);
        }
    }

    /// 当前已创建数
    pub fn count(&self, resource: &str, guard_type: GuardType) -> u64 {
        self.counts
            .get(&(resource.to_string(), guard_type))
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    /// 整体替换限额配置，已有计数保留
    pub fn update_config(&self, config: SizeLimitConfig) {
        *self.config.write() = config;
    }

    /// 整体替换维度精确限额，全局默认与 (维度, 类型) 覆盖保留
    pub fn update_resource_limits(&self, limits: AHashMap<String, u64>) {
        self.config.write().resource_limits = limits;
    }

    /// 整体替换模式键限额，已创建的守卫不受影响
    pub fn update_pattern_limits(
        &self,
        limits: impl IntoIterator<Item = (String, u64)>,
    ) {
        self.patterns.update_patterns(limits);
    }
}
