//! 重配引擎
//!
//! 维护资源 → 守卫集群的注册表，负责：
//! - 首次调用时按"不可变基线 + 外部覆盖层"惰性创建集群；
//! - 外部配置变更时原地增删守卫或替换其配置，不丢统计；
//! - 参数限定资源的守卫创建受创建限额约束；
//! - 合并/校验失败快速报错，既有集群状态保持不变。

use crate::cluster::GuardCluster;
use crate::config::{CompositeConfig, ExternalConfig};
use crate::creation_limiter::{CreationLimiter, SizeLimitConfig};
use crate::error::ResguardError;
use crate::fallback::{FallbackHandler, FallbackRegistry};
use crate::guards::{GuardType, PredicateRegistry};
use crate::merge::combine;
use crate::resource::ResourceId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 重配引擎
pub struct ReconfigEngine {
    clusters: DashMap<String, Arc<GuardCluster>, ahash::RandomState>,
    /// 代码内注册的不可变基线，键为资源点分名
    baselines: DashMap<String, CompositeConfig, ahash::RandomState>,
    /// 当前生效的外部覆盖层，键为资源点分名
    externals: DashMap<String, ExternalConfig, ahash::RandomState>,
    predicates: Arc<PredicateRegistry>,
    fallbacks: Arc<FallbackRegistry>,
    creation_limiter: CreationLimiter,
}

impl ReconfigEngine {
    pub fn new(
        predicates: Arc<PredicateRegistry>,
        fallbacks: Arc<FallbackRegistry>,
        size_limits: SizeLimitConfig,
    ) -> Self {
        Self {
            clusters: DashMap::default(),
            baselines: DashMap::default(),
            externals: DashMap::default(),
            predicates,
            fallbacks,
            creation_limiter: CreationLimiter::new(size_limits),
        }
    }

    /// 注册资源的不可变基线
    ///
    /// 重复注册覆盖旧基线，但不触碰已创建的集群；
    /// 新基线在下一次外部配置应用或集群创建时生效。
    pub fn register(
        &self,
        resource: &ResourceId,
        config: CompositeConfig,
    ) -> Result<(), ResguardError> {
        config.validate()?;
        debug!(resource = %resource, "注册不可变基线");
        self.baselines.insert(resource.dotted_name(), config);
        Ok(())
    }

    /// 已存在的集群
    pub fn get(&self, resource: &ResourceId) -> Option<Arc<GuardCluster>> {
        self.clusters
            .get(&resource.dotted_name())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 遍历全部集群
    pub fn for_each_cluster(&self, mut visit: impl FnMut(&Arc<GuardCluster>)) {
        for entry in self.clusters.iter() {
            visit(entry.value());
        }
    }

    /// 当前集群数
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// 守卫创建限额器
    pub fn creation_limiter(&self) -> &CreationLimiter {
        &self.creation_limiter
    }

    /// 获取或惰性创建集群
    ///
    /// 无任何配置触发时返回 `Ok(None)`，调用直通不受保护。
    pub fn get_or_create(
        &self,
        resource: &ResourceId,
    ) -> Result<Option<Arc<GuardCluster>>, ResguardError> {
        let name = resource.dotted_name();
        if let Some(existing) = self.clusters.get(&name) {
            return Ok(Some(Arc::clone(existing.value())));
        }

        let baseline = self.baselines.get(&name).map(|entry| entry.value().clone());
        let external = self.externals.get(&name).map(|entry| entry.value().clone());
        let Some(mut merged) = combine(baseline.as_ref(), external.as_ref())? else {
            return Ok(None);
        };

        let acquired = if resource.is_arg_qualified() {
            let acquired = self.gate_arg_creation(resource, &mut merged);
            if merged.is_empty() {
                return Ok(None);
            }
            acquired
        } else {
            Vec::new()
        };

        // entry API 保证并发首调用只产生一个集群；
        // 竞争失败或构建失败时归还本线程申请的名额
        let cluster = match self.clusters.entry(name) {
            Entry::Occupied(entry) => {
                self.refund_arg_budget(resource, &acquired);
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                let cluster = Arc::new(GuardCluster::new(resource.clone()));
                if let Err(err) = self.apply(&cluster, Some(&merged)) {
                    self.refund_arg_budget(resource, &acquired);
                    return Err(err);
                }
                info!(resource = %resource, "守卫集群已创建");
                entry.insert(Arc::clone(&cluster));
                cluster
            }
        };
        Ok(Some(cluster))
    }

    /// 应用新的外部配置（`None` 表示该资源的外部配置被撤销）
    ///
    /// 先合并并校验，失败立即返回且不改动任何状态；
    /// 成功后原地更新集群，结果为空时移除集群。
    pub fn update(
        &self,
        resource: &ResourceId,
        external: Option<ExternalConfig>,
    ) -> Result<(), ResguardError> {
        let name = resource.dotted_name();
        let baseline = self.baselines.get(&name).map(|entry| entry.value().clone());
        let merged = combine(baseline.as_ref(), external.as_ref())?;

        match (self.clusters.get(&name), &merged) {
            (Some(entry), Some(merged)) => {
                let cluster = Arc::clone(entry.value());
                drop(entry);
                let mut effective = merged.clone();
                if resource.is_arg_qualified() {
                    self.reconcile_arg_budget(resource, &cluster, &mut effective);
                }
                self.apply(&cluster, Some(&effective))?;
                if cluster.is_empty() {
                    self.remove_cluster(resource, &cluster);
                }
            }
            (Some(entry), None) => {
                let cluster = Arc::clone(entry.value());
                drop(entry);
                if resource.is_arg_qualified() {
                    self.release_arg_budget(resource, &cluster);
                }
                self.apply(&cluster, None)?;
                self.remove_cluster(resource, &cluster);
            }
            (None, _) => {
                // 集群尚未创建：覆盖层落库后待首次调用惰性生效
            }
        }

        // 集群变更成功后才落库覆盖层，失败的推送不留残余
        match external {
            Some(external) => {
                self.externals.insert(name, external);
            }
            None => {
                self.externals.remove(&name);
            }
        }
        Ok(())
    }

    fn remove_cluster(&self, resource: &ResourceId, cluster: &Arc<GuardCluster>) {
        debug_assert!(cluster.is_empty());
        info!(resource = %resource, "守卫集群已移除");
        self.clusters.remove(&resource.dotted_name());
    }

    /// 把合并后的组合配置落到集群上
    ///
    /// 降级处理器先行构建，构建失败时集群不发生任何变化。
    fn apply(
        &self,
        cluster: &GuardCluster,
        merged: Option<&CompositeConfig>,
    ) -> Result<(), ResguardError> {
        let fallback = match merged.and_then(|m| m.fallback.clone()) {
            Some(config) => Some(FallbackHandler::build(
                cluster.resource().dotted_name(),
                config,
                Arc::clone(&self.fallbacks),
            )?),
            None => None,
        };

        cluster.set_concurrency(merged.and_then(|m| m.concurrency));
        cluster.set_rate(merged.and_then(|m| m.rate.clone()));
        cluster.set_breaker(merged.and_then(|m| m.breaker.clone()), &self.predicates);
        cluster.set_retry(merged.and_then(|m| m.retry.clone()));
        cluster.set_fallback(fallback);
        Ok(())
    }

    /// 参数限定集群首次创建：逐守卫类型申请名额，超额的类型不创建
    ///
    /// 预算维度是 `parent.argName`：同一方法的不同参数名互不挤占。
    /// 返回实际申请到的类型，供创建失败时归还。
    fn gate_arg_creation(
        &self,
        resource: &ResourceId,
        merged: &mut CompositeConfig,
    ) -> Vec<GuardType> {
        let Some(scope) = resource.arg_scope() else {
            return Vec::new();
        };
        let mut acquired = Vec::new();
        if merged.concurrency.is_some() {
            if self.creation_limiter.try_acquire(&scope, GuardType::Concurrency) {
                acquired.push(GuardType::Concurrency);
            } else {
                merged.concurrency = None;
            }
        }
        if merged.rate.is_some() {
            if self.creation_limiter.try_acquire(&scope, GuardType::Rate) {
                acquired.push(GuardType::Rate);
            } else {
                merged.rate = None;
            }
        }
        if merged.breaker.is_some() {
            if self.creation_limiter.try_acquire(&scope, GuardType::Breaker) {
                acquired.push(GuardType::Breaker);
            } else {
                merged.breaker = None;
            }
        }
        if merged.is_empty() {
            warn!(resource = %resource, "全部守卫类型均超出创建限额，集群不创建");
        }
        acquired
    }

    /// 集群最终没有落地时，归还已申请的名额
    fn refund_arg_budget(&self, resource: &ResourceId, acquired: &[GuardType]) {
        let Some(scope) = resource.arg_scope() else {
            return;
        };
        for guard_type in acquired {
            self.creation_limiter.release(&scope, *guard_type);
        }
    }

    /// 参数限定集群整体拆除时归还全部名额
    fn release_arg_budget(&self, resource: &ResourceId, cluster: &GuardCluster) {
        let Some(scope) = resource.arg_scope() else {
            return;
        };
        for guard_type in [GuardType::Concurrency, GuardType::Rate, GuardType::Breaker] {
            if cluster.has_guard(guard_type) {
                self.creation_limiter.release(&scope, guard_type);
            }
        }
    }

    /// 参数限定集群更新：新增类型申请名额，移除类型归还名额
    fn reconcile_arg_budget(
        &self,
        resource: &ResourceId,
        cluster: &GuardCluster,
        effective: &mut CompositeConfig,
    ) {
        let Some(scope) = resource.arg_scope() else {
            return;
        };
        let mut reconcile = |guard_type: GuardType, wanted: bool| -> bool {
            let had = cluster.has_guard(guard_type);
            if wanted && !had {
                return self.creation_limiter.try_acquire(&scope, guard_type);
            }
            if !wanted && had {
                self.creation_limiter.release(&scope, guard_type);
            }
            wanted
        };
        if !reconcile(GuardType::Concurrency, effective.concurrency.is_some()) {
            effective.concurrency = None;
        }
        if !reconcile(GuardType::Rate, effective.rate.is_some()) {
            effective.rate = None;
        }
        if !reconcile(GuardType::Breaker, effective.breaker.is_some()) {
            effective.breaker = None;
        }
    }
}
