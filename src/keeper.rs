//! 门面
//!
//! `Keeper` 是使用方唯一需要接触的入口：注册基线、发起受保护
//! 调用、接收外部配置推送、查询统计、手动操作熔断器。
//!
//! 配置解析顺序（对单个资源）：
//! 资源专属外部配置（精确键或模式键命中）字段级覆盖其分组配置，
//! 叠加结果再与代码内注册的不可变基线合并。

use crate::cluster::{run_chain, AsyncEntry, GuardCluster};
use crate::config::{CompositeConfig, ExternalConfig, GroupExternalConfig};
use crate::creation_limiter::SizeLimitConfig;
use crate::engine::ReconfigEngine;
use crate::error::{
    BreakerStats, ConcurrencyStats, Fault, RateStats, ResguardError,
};
use crate::fallback::{FallbackContext, FallbackRegistry};
use crate::guards::{CallOutcome, Guard, PredicateRegistry};
use crate::merge::combine;
use crate::pattern_cache::{is_pattern_key, PatternCache};
use crate::resource::ResourceId;
use crate::source::{ConfigSource, GroupSource};
use crate::config::ForcedState;
use ahash::AHashMap;
use dashmap::DashSet;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 单个资源的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub resource: String,
    pub breaker: Option<BreakerStats>,
    pub rate: Option<RateStats>,
    pub concurrency: Option<ConcurrencyStats>,
}

/// 防护门面
pub struct Keeper {
    engine: ReconfigEngine,
    predicates: Arc<PredicateRegistry>,
    fallbacks: Arc<FallbackRegistry>,
    /// 精确键的资源专属外部配置
    direct: RwLock<AHashMap<String, ExternalConfig>>,
    /// 模式键的资源专属外部配置
    patterns: PatternCache<ExternalConfig>,
    /// 分组外部配置
    groups: RwLock<AHashMap<String, GroupExternalConfig>>,
    /// 资源 → 归属分组
    group_index: RwLock<AHashMap<String, String>>,
    /// 出现过的全部资源（注册或调用过）
    known: DashSet<ResourceId, ahash::RandomState>,
}

impl Default for Keeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Keeper {
    pub fn new() -> Self {
        Self::with_size_limits(SizeLimitConfig::default())
    }

    pub fn with_size_limits(size_limits: SizeLimitConfig) -> Self {
        let predicates = Arc::new(PredicateRegistry::new());
        let fallbacks = Arc::new(FallbackRegistry::new());
        Self {
            engine: ReconfigEngine::new(
                Arc::clone(&predicates),
                Arc::clone(&fallbacks),
                size_limits,
            ),
            predicates,
            fallbacks,
            direct: RwLock::new(AHashMap::new()),
            patterns: PatternCache::new(),
            groups: RwLock::new(AHashMap::new()),
            group_index: RwLock::new(AHashMap::new()),
            known: DashSet::default(),
        }
    }

    // ========================================================================
    // 注册
    // ========================================================================

    /// 注册资源的不可变基线
    pub fn register(
        &self,
        name: &str,
        config: CompositeConfig,
    ) -> Result<(), ResguardError> {
        let id = ResourceId::from(name);
        self.engine.register(&id, config)?;
        self.ensure_known(&id)?;
        Ok(())
    }

    /// 注册自定义判定函数（熔断 `PredicateKind::Custom` 引用）
    pub fn register_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&CallOutcome<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates.register(name, predicate);
    }

    /// 注册降级函数
    pub fn register_fallback<T, F>(&self, name: impl Into<String>, function: F)
    where
        T: 'static,
        F: Fn(&FallbackContext<'_>) -> Result<T, Fault> + Send + Sync + 'static,
    {
        self.fallbacks.register(name, function);
    }

    // ========================================================================
    // 受保护调用
    // ========================================================================

    /// 同步受保护调用
    ///
    /// 资源无任何配置时调用直通。
    pub fn invoke<T: 'static>(
        &self,
        name: &str,
        call: impl FnMut() -> Result<T, Fault>,
    ) -> Result<T, ResguardError> {
        let id = ResourceId::plain(name);
        self.ensure_known(&id)?;
        match self.engine.get_or_create(&id)? {
            Some(cluster) => cluster.execute(call),
            None => Self::passthrough(call),
        }
    }

    /// 带参数限定的同步受保护调用
    ///
    /// 方法级守卫链在前，每个受治参数对应一条参数级守卫链，
    /// 按给定顺序依次串联。重试与降级取方法级集群的配置。
    pub fn invoke_with_args<T: 'static>(
        &self,
        name: &str,
        args: &[(&str, &str)],
        mut call: impl FnMut() -> Result<T, Fault>,
    ) -> Result<T, ResguardError> {
        let method_id = ResourceId::plain(name);
        self.ensure_known(&method_id)?;
        let method = self.engine.get_or_create(&method_id)?;

        let mut arg_clusters = Vec::new();
        for (arg_name, arg_value) in args {
            let arg_id = ResourceId::arg(name, *arg_name, *arg_value);
            self.ensure_known(&arg_id)?;
            if let Some(cluster) = self.engine.get_or_create(&arg_id)? {
                arg_clusters.push(cluster);
            }
        }
        if method.is_none() && arg_clusters.is_empty() {
            return Self::passthrough(call);
        }

        let mut run_once = move |clusters: &[&Arc<GuardCluster>]| {
            let mut guards: Vec<Arc<dyn Guard>> = Vec::new();
            for cluster in clusters {
                guards.extend(cluster.guards());
            }
            run_chain(&guards, &mut call)
        };

        let chained: Vec<&Arc<GuardCluster>> =
            method.iter().chain(arg_clusters.iter()).collect();
        let retry = method.as_ref().and_then(|c| c.retry_executor());
        let result = match retry {
            Some(retry) => retry.execute(|_attempt| run_once(&chained)),
            None => run_once(&chained),
        };
        match &method {
            Some(cluster) => cluster.apply_fallback(result),
            None => result,
        }
    }

    /// 进入异步受保护调用
    ///
    /// 守卫同步评估：拒绝立即返回错误（异步入口不走降级），
    /// 放行则返回手动完成句柄。异步调用不重试。
    pub fn enter_async(&self, name: &str) -> Result<AsyncEntry, ResguardError> {
        let id = ResourceId::plain(name);
        self.ensure_known(&id)?;
        match self.engine.get_or_create(&id)? {
            Some(cluster) => cluster.try_enter(),
            None => Ok(AsyncEntry::unguarded(name)),
        }
    }

    /// 异步受保护调用：进入、等待、自动交付完成通知
    pub async fn invoke_async<T, F, Fut>(
        &self,
        name: &str,
        call: F,
    ) -> Result<T, ResguardError>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Fault>>,
    {
        let id = ResourceId::plain(name);
        self.ensure_known(&id)?;
        let Some(cluster) = self.engine.get_or_create(&id)? else {
            return call().await.map_err(ResguardError::from);
        };
        let entry = match cluster.try_enter() {
            Ok(entry) => entry,
            Err(rejection) => return cluster.apply_fallback(Err(rejection)),
        };
        let result = call().await;
        match &result {
            Ok(_) => entry.end_with_success(),
            Err(fault) => entry.end_with_error(fault),
        }
        cluster.apply_fallback(result.map_err(ResguardError::from))
    }

    fn passthrough<T>(
        mut call: impl FnMut() -> Result<T, Fault>,
    ) -> Result<T, ResguardError> {
        call().map_err(ResguardError::from)
    }

    // ========================================================================
    // 外部配置推送
    // ========================================================================

    /// 全量替换资源专属外部配置
    ///
    /// 含正则元字符的键作为模式键扇出到所有匹配资源，其余为
    /// 精确键。任一配置含非法时长或未注册降级函数时整体拒绝，
    /// 既有状态不变。
    pub fn update_configs(
        &self,
        configs: AHashMap<String, ExternalConfig>,
    ) -> Result<(), ResguardError> {
        let mut exact = AHashMap::new();
        let mut pattern = Vec::new();
        for (key, config) in configs {
            self.prevalidate(&config)?;
            if is_pattern_key(&key) {
                pattern.push((key, config));
            } else {
                exact.insert(key, config);
            }
        }

        info!(
            exact = exact.len(),
            patterns = pattern.len(),
            "应用外部配置全量推送"
        );
        *self.direct.write() = exact;
        self.patterns.update_patterns(pattern);
        self.refresh_all();
        Ok(())
    }

    /// 全量替换分组外部配置
    pub fn update_group_configs(
        &self,
        groups: AHashMap<String, GroupExternalConfig>,
    ) -> Result<(), ResguardError> {
        for group in groups.values() {
            self.prevalidate(&group.config)?;
        }

        let mut index = AHashMap::new();
        for (group_name, group) in &groups {
            for member in &group.members {
                if let Some(previous) =
                    index.insert(member.clone(), group_name.clone())
                {
                    warn!(
                        resource = %member,
                        first = %previous,
                        second = %group_name,
                        "资源出现在多个分组，后者生效"
                    );
                }
            }
        }

        info!(groups = groups.len(), "应用分组配置全量推送");
        *self.groups.write() = groups;
        *self.group_index.write() = index;
        self.refresh_all();
        Ok(())
    }

    /// 从外部配置源做一次全量对账
    ///
    /// 对每个已知资源拉取其外部配置，并拉取全部分组配置。
    pub fn refresh_from(&self, source: &dyn ConfigSource) -> Result<(), ResguardError> {
        let mut exact = AHashMap::new();
        for id in self.known.iter() {
            if let Some(config) = source.config(id.key()) {
                self.prevalidate(&config)?;
                exact.insert(id.key().dotted_name(), config);
            }
        }
        let mut groups = AHashMap::new();
        for (group_id, group) in source.all_groups() {
            self.prevalidate(&group.config)?;
            groups.insert(group_id.0, group);
        }

        let mut index = AHashMap::new();
        for (group_name, group) in &groups {
            for member in &group.members {
                index.insert(member.clone(), group_name.clone());
            }
        }

        *self.direct.write() = exact;
        *self.groups.write() = groups;
        *self.group_index.write() = index;
        self.refresh_all();
        Ok(())
    }

    /// 从分组归属源重建资源 → 分组索引
    ///
    /// 分组配置本身仍由 `update_group_configs` / `refresh_from` 推送，
    /// 此处只替换归属关系，并对已知资源重算生效配置。
    pub fn rebuild_group_index(&self, source: &dyn GroupSource) {
        let mut index = AHashMap::new();
        for entry in self.known.iter() {
            if let Some(group) = source.group_of(entry.key()) {
                for member in source.members(&group) {
                    index.insert(member.dotted_name(), group.as_str().to_string());
                }
            }
        }
        *self.group_index.write() = index;
        self.refresh_all();
    }

    /// 全量替换守卫创建限额
    ///
    /// 键为参数维度 `parent.argName`，模式键扇出到所有匹配维度。
    /// 仅约束之后的守卫创建，已派生的守卫不受影响。
    pub fn update_size_limits(&self, limits: AHashMap<String, u64>) {
        let mut exact = AHashMap::new();
        let mut pattern = Vec::new();
        for (key, limit) in limits {
            if is_pattern_key(&key) {
                pattern.push((key, limit));
            } else {
                exact.insert(key, limit);
            }
        }
        let limiter = self.engine.creation_limiter();
        limiter.update_resource_limits(exact);
        limiter.update_pattern_limits(pattern);
    }

    /// 推送前校验：时长字段可解析、引用的降级函数已注册
    fn prevalidate(&self, config: &ExternalConfig) -> Result<(), ResguardError> {
        combine(None, Some(config))?;
        if let Some(function) = &config.fallback_function {
            if !self.fallbacks.contains(function) {
                return Err(ResguardError::ConfigError(format!(
                    "降级函数未注册: {}",
                    function
                )));
            }
        }
        Ok(())
    }

    /// 对全部已知资源重算生效配置并下发
    fn refresh_all(&self) {
        for entry in self.known.iter() {
            let id = entry.key().clone();
            let effective = self.effective_external(&id.dotted_name());
            if let Err(err) = self.engine.update(&id, effective) {
                // 推送前已整体校验，单资源失败只可能来自竞态注册
                warn!(resource = %id, error = %err, "资源配置下发失败");
            }
        }
    }

    /// 资源的生效外部配置：专属（精确优先于模式）覆盖分组
    fn effective_external(&self, name: &str) -> Option<ExternalConfig> {
        let own = self
            .direct
            .read()
            .get(name)
            .cloned()
            .or_else(|| self.patterns.lookup(name));
        let group = self.group_index.read().get(name).and_then(|group_name| {
            self.groups
                .read()
                .get(group_name)
                .map(|group| group.config.clone())
        });
        match (own, group) {
            (Some(own), Some(group)) => Some(own.overlay(&group)),
            (Some(own), None) => Some(own),
            (None, Some(group)) => Some(group),
            (None, None) => None,
        }
    }

    /// 资源首次出现时落库生效配置，之后配置推送会覆盖它
    fn ensure_known(&self, id: &ResourceId) -> Result<(), ResguardError> {
        if !self.known.insert(id.clone()) {
            return Ok(());
        }
        debug!(resource = %id, "资源首次出现");
        if let Some(effective) = self.effective_external(&id.dotted_name()) {
            self.engine.update(id, Some(effective))?;
        }
        Ok(())
    }

    // ========================================================================
    // 手动熔断操作
    // ========================================================================

    /// 强制打开指定资源的熔断器
    pub fn force_open(&self, name: &str) -> Result<(), ResguardError> {
        self.set_forced(name, Some(ForcedState::Open))
    }

    /// 强制停用指定资源的熔断器
    pub fn force_disable(&self, name: &str) -> Result<(), ResguardError> {
        self.set_forced(name, Some(ForcedState::Disabled))
    }

    /// 清除强制状态，熔断器回到关闭态重新统计
    pub fn clear_forced(&self, name: &str) -> Result<(), ResguardError> {
        self.set_forced(name, None)
    }

    fn set_forced(
        &self,
        name: &str,
        forced: Option<ForcedState>,
    ) -> Result<(), ResguardError> {
        let id = ResourceId::from(name);
        let breaker = self
            .engine
            .get(&id)
            .and_then(|cluster| cluster.breaker())
            .ok_or_else(|| {
                ResguardError::ConfigError(format!("资源没有熔断器: {}", name))
            })?;
        let mut config = (*breaker.current_config()).clone();
        config.forced = forced;
        breaker.update_config(config);
        Ok(())
    }

    // ========================================================================
    // 统计
    // ========================================================================

    /// 单个资源的统计快照
    pub fn stats(&self, name: &str) -> Option<ResourceStats> {
        let cluster = self.engine.get(&ResourceId::from(name))?;
        Some(Self::snapshot(&cluster))
    }

    /// 全部资源的统计快照
    pub fn all_stats(&self) -> Vec<ResourceStats> {
        let mut stats = Vec::new();
        self.engine
            .for_each_cluster(|cluster| stats.push(Self::snapshot(cluster)));
        stats.sort_by(|a, b| a.resource.cmp(&b.resource));
        stats
    }

    fn snapshot(cluster: &Arc<GuardCluster>) -> ResourceStats {
        ResourceStats {
            resource: cluster.resource().dotted_name(),
            breaker: cluster.breaker().map(|b| b.stats()),
            rate: cluster.rate_limiter().map(|r| r.stats()),
            concurrency: cluster.concurrency_limiter().map(|c| c.stats()),
        }
    }
}
