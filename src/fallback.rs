//! 降级处理实现
//!
//! 按配置把守卫拒绝（以及可选的业务异常）替换为降级结果。
//!
//! # 特性
//!
//! - **三种目标**: 已注册降级函数、字面量返回值、合成错误
//! - **构建期校验**: 处理器在配置应用阶段构建，缺少目标立即报错
//! - **类型安全**: 函数与字面量经类型擦除注册，调用点按返回类型还原，
//!   类型不匹配以 `FallbackInvocationFailed` 呈现，绝不 panic

use crate::config::FallbackConfig;
use crate::error::{Fault, ResguardError};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 降级调用上下文
pub struct FallbackContext<'a> {
    /// 资源名
    pub resource: &'a str,
    /// 触发降级的原始错误
    pub cause: &'a ResguardError,
}

/// 降级函数：按名注册，返回调用方类型的结果
pub type FallbackFn<T> = Arc<dyn Fn(&FallbackContext<'_>) -> Result<T, Fault> + Send + Sync>;

/// 降级函数注册表
///
/// 函数以类型擦除形式存放；取用时按调用点的返回类型还原。
#[derive(Default)]
pub struct FallbackRegistry {
    functions: RwLock<AHashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册降级函数
    pub fn register<T, F>(&self, name: impl Into<String>, function: F)
    where
        T: 'static,
        F: Fn(&FallbackContext<'_>) -> Result<T, Fault> + Send + Sync + 'static,
    {
        let erased: FallbackFn<T> = Arc::new(function);
        self.functions
            .write()
            .insert(name.into(), Box::new(erased));
    }

    /// 是否存在同名函数（不校验类型）
    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    fn get<T: 'static>(&self, name: &str) -> Option<FallbackFn<T>> {
        self.functions
            .read()
            .get(name)
            .and_then(|erased| erased.downcast_ref::<FallbackFn<T>>())
            .cloned()
    }
}

/// 降级处理器
///
/// 在配置应用阶段由 [`FallbackConfig`] 构建一次，之后挂在守卫集群上。
pub struct FallbackHandler {
    resource: String,
    config: FallbackConfig,
    registry: Arc<FallbackRegistry>,
}

// 注册表内是类型擦除的函数，手写 Debug 只暴露资源与配置
impl fmt::Debug for FallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackHandler")
            .field("resource", &self.resource)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FallbackHandler {
    /// 构建降级处理器
    ///
    /// 配置期校验：必须具有降级目标；引用的降级函数必须已注册。
    pub fn build(
        resource: impl Into<String>,
        config: FallbackConfig,
        registry: Arc<FallbackRegistry>,
    ) -> Result<Self, ResguardError> {
        let resource = resource.into();
        if !config.has_target() {
            return Err(ResguardError::FallbackConstructionFailed(format!(
                "资源 {} 的降级配置没有任何目标",
                resource
            )));
        }
        if let Some(name) = &config.target_function {
            if !registry.contains(name) {
                return Err(ResguardError::FallbackConstructionFailed(format!(
                    "降级函数未注册: {}",
                    name
                )));
            }
        }
        debug!(resource = %resource, "构建降级处理器");
        Ok(Self {
            resource,
            config,
            registry,
        })
    }

    /// 当前配置
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// 该错误是否应走降级
    ///
    /// 守卫拒绝总是降级；业务异常仅在配置允许时降级。
    pub fn applies_to(&self, err: &ResguardError) -> bool {
        err.is_rejection() || (self.config.apply_to_business_error && err.as_fault().is_some())
    }

    /// 执行降级，产出调用方类型的结果
    ///
    /// 目标优先级：降级函数 > 字面量 > 合成错误。
    pub fn handle<T: 'static>(&self, cause: ResguardError) -> Result<T, ResguardError> {
        let context = FallbackContext {
            resource: &self.resource,
            cause: &cause,
        };

        if let Some(name) = &self.config.target_function {
            return match self.registry.get::<T>(name) {
                Some(function) => function(&context).map_err(|fault| {
                    ResguardError::FallbackInvocationFailed {
                        reason: format!("降级函数 {} 执行失败: {}", name, fault),
                        cause: Box::new(cause),
                    }
                }),
                None => {
                    warn!(resource = %self.resource, function = %name, "降级函数返回类型不匹配");
                    Err(ResguardError::FallbackInvocationFailed {
                        reason: format!("降级函数 {} 的返回类型不匹配", name),
                        cause: Box::new(cause),
                    })
                }
            };
        }

        if let Some(literal) = &self.config.literal_value {
            let boxed: Box<dyn Any> = Box::new(literal.clone());
            return match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => Err(ResguardError::FallbackInvocationFailed {
                    reason: "字面量降级值与调用返回类型不匹配".to_string(),
                    cause: Box::new(cause),
                }),
            };
        }

        // 合成错误即降级结果本身
        let kind = self
            .config
            .error_kind
            .as_deref()
            .unwrap_or("FallbackError");
        Err(Fault::new(kind, format!("resource {} degraded", self.resource)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<FallbackRegistry> {
        Arc::new(FallbackRegistry::new())
    }

    fn rejection() -> ResguardError {
        ResguardError::RejectedByRateLimit {
            resource: "demo".to_string(),
        }
    }

    #[test]
    fn test_build_requires_target() {
        let err = FallbackHandler::build("demo", FallbackConfig::default(), registry());
        assert!(matches!(
            err.unwrap_err(),
            ResguardError::FallbackConstructionFailed(_)
        ));
    }

    #[test]
    fn test_build_requires_registered_function() {
        let config = FallbackConfig {
            target_function: Some("missing".to_string()),
            ..Default::default()
        };
        let err = FallbackHandler::build("demo", config, registry());
        assert!(matches!(
            err.unwrap_err(),
            ResguardError::FallbackConstructionFailed(_)
        ));
    }

    #[test]
    fn test_function_fallback() {
        let registry = registry();
        registry.register("cached-list", |ctx: &FallbackContext<'_>| {
            assert_eq!(ctx.resource, "demo");
            Ok::<_, Fault>(vec!["cached".to_string()])
        });
        let config = FallbackConfig {
            target_function: Some("cached-list".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry).unwrap();
        let value: Vec<String> = handler.handle(rejection()).unwrap();
        assert_eq!(value, vec!["cached".to_string()]);
    }

    #[test]
    fn test_function_type_mismatch_reported() {
        let registry = registry();
        registry.register("answer", |_: &FallbackContext<'_>| Ok::<_, Fault>(42u32));
        let config = FallbackConfig {
            target_function: Some("answer".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry).unwrap();
        let result: Result<String, _> = handler.handle(rejection());
        assert!(matches!(
            result.unwrap_err(),
            ResguardError::FallbackInvocationFailed { .. }
        ));
    }

    #[test]
    fn test_literal_fallback_for_string_results() {
        let config = FallbackConfig {
            literal_value: Some("degraded".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry()).unwrap();
        let value: String = handler.handle(rejection()).unwrap();
        assert_eq!(value, "degraded");

        let result: Result<u64, _> = handler.handle(rejection());
        assert!(result.is_err());
    }

    #[test]
    fn test_error_kind_fallback() {
        let config = FallbackConfig {
            error_kind: Some("ServiceDegraded".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry()).unwrap();
        let result: Result<String, _> = handler.handle(rejection());
        assert_eq!(result.unwrap_err().as_fault().unwrap().kind(), "ServiceDegraded");
    }

    #[test]
    fn test_handler_debug_shows_resource() {
        let config = FallbackConfig {
            literal_value: Some("x".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry()).unwrap();
        let rendered = format!("{:?}", handler);
        assert!(rendered.contains("FallbackHandler"));
        assert!(rendered.contains("demo"));
    }

    #[test]
    fn test_applies_to_business_error_opt_in() {
        let config = FallbackConfig {
            literal_value: Some("x".to_string()),
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry()).unwrap();
        let business: ResguardError = Fault::new("IoError", "boom").into();
        assert!(!handler.applies_to(&business));
        assert!(handler.applies_to(&rejection()));

        let config = FallbackConfig {
            literal_value: Some("x".to_string()),
            apply_to_business_error: true,
            ..Default::default()
        };
        let handler = FallbackHandler::build("demo", config, registry()).unwrap();
        assert!(handler.applies_to(&business));
    }
}
