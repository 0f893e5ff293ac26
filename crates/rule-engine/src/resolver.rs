//! 条件评估器解析
//!
//! 解析顺序：
//! 1. 登记为外部解析的评估器名交给 [`ExternalResolver`]
//! 2. 缓存（键为 `评估器名<上下文类型>`）
//! 3. 内置评估器或已注册的工厂函数，创建后写入缓存

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Cache, CacheKey};
use crate::context::ContextType;
use crate::error::{Result, RuleError};
use crate::evaluator::{
    ConditionEvaluator, PREDICATE_EVALUATOR, PredicateEvaluator, REGEX_EVALUATOR, RegexEvaluator,
    TypedConditionEvaluator, TypedEvaluator,
};
use crate::events::{DynEventHandler, EventType};

/// 评估器工厂，按上下文类型创建评估器实例
pub type EvaluatorFactory =
    Arc<dyn Fn(&ContextType) -> anyhow::Result<Arc<dyn ConditionEvaluator>> + Send + Sync>;

/// 外部解析器
///
/// 由宿主程序（通常是依赖注入容器）提供，按类别解析评估器，按事件类型解析处理器集合。
#[cfg_attr(test, mockall::automock)]
pub trait ExternalResolver: Send + Sync {
    fn resolve_evaluator(
        &self,
        kind: &str,
        context_type: &ContextType,
    ) -> anyhow::Result<Arc<dyn ConditionEvaluator>>;

    fn resolve_event_handlers(
        &self,
        event_type: &EventType,
    ) -> anyhow::Result<Vec<Arc<dyn DynEventHandler>>>;
}

/// 评估器解析器
pub struct EvaluatorResolver {
    cache: Cache<Arc<dyn ConditionEvaluator>>,
    factories: DashMap<String, EvaluatorFactory>,
    /// 评估器名 -> 外部类别
    external: DashMap<String, String>,
    external_resolver: Option<Arc<dyn ExternalResolver>>,
}

impl EvaluatorResolver {
    pub fn new(lock_timeout: Duration, external_resolver: Option<Arc<dyn ExternalResolver>>) -> Self {
        Self {
            cache: Cache::new("evaluators", lock_timeout),
            factories: DashMap::new(),
            external: DashMap::new(),
            external_resolver,
        }
    }

    /// 注册评估器工厂
    ///
    /// 同名注册会覆盖旧工厂，并移除该名称下已缓存的评估器实例。
    /// 移除按键持锁进行，正由旧工厂创建的实例会在写入后被一并移除。
    #[instrument(skip(self, factory))]
    pub fn register_evaluator<F>(&self, name: &str, factory: F)
    where
        F: Fn(&ContextType) -> anyhow::Result<Arc<dyn ConditionEvaluator>> + Send + Sync + 'static,
    {
        if self.factories.insert(name.to_string(), Arc::new(factory)).is_some() {
            let prefix = format!("{name}<");
            let removed = self
                .cache
                .remove_where(|key| key.item_name.starts_with(&prefix));
            warn!(removed, "评估器工厂被覆盖: {}", name);
        }
        info!("评估器已注册: {}", name);
    }

    /// 注册可默认构造的评估器类型
    pub fn register_evaluator_type<E>(&self, name: &str)
    where
        E: ConditionEvaluator + Default + 'static,
    {
        self.register_evaluator(name, |_: &ContextType| {
            Ok(Arc::new(E::default()) as Arc<dyn ConditionEvaluator>)
        });
    }

    /// 注册面向具体上下文类型的评估器
    pub fn register_typed_evaluator<E, T>(&self, name: &str)
    where
        E: TypedConditionEvaluator<T> + Default,
        T: Serialize + Send + Sync + 'static,
    {
        self.register_evaluator(name, |_: &ContextType| {
            Ok(Arc::new(TypedEvaluator::<E, T>::new(E::default())) as Arc<dyn ConditionEvaluator>)
        });
    }

    /// 登记由外部解析器提供的评估器
    pub fn register_evaluator_for_external_resolution(&self, name: &str, kind: &str) {
        self.external.insert(name.to_string(), kind.to_string());
        info!(kind, "评估器登记为外部解析: {}", name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        name == PREDICATE_EVALUATOR
            || name == REGEX_EVALUATOR
            || self.factories.contains_key(name)
            || self.external.contains_key(name)
    }

    pub fn external_resolver(&self) -> Option<&Arc<dyn ExternalResolver>> {
        self.external_resolver.as_ref()
    }

    /// 已缓存的评估器实例数
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// 解析评估器
    #[instrument(skip(self, context_type), fields(context_type = context_type.short_name()))]
    pub fn resolve(
        &self,
        evaluator_name: &str,
        context_type: &ContextType,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        let external_kind = self.external.get(evaluator_name).map(|k| k.value().clone());
        if let Some(kind) = external_kind {
            return self.resolve_external(evaluator_name, &kind, context_type);
        }

        let key = Self::cache_key(evaluator_name, context_type);
        self.cache
            .get_or_create(&key, || self.create(evaluator_name, context_type))
    }

    fn cache_key(evaluator_name: &str, context_type: &ContextType) -> CacheKey {
        CacheKey::item(format!("{evaluator_name}<{}>", context_type.name()))
    }

    fn resolve_external(
        &self,
        evaluator_name: &str,
        kind: &str,
        context_type: &ContextType,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        let resolver = self.external_resolver.as_ref().ok_or_else(|| {
            RuleError::Configuration(format!(
                "评估器 '{evaluator_name}' 登记为外部解析，但未配置外部解析器"
            ))
        })?;

        resolver
            .resolve_evaluator(kind, context_type)
            .map_err(|e| RuleError::MissingEvaluator {
                name: evaluator_name.to_string(),
                reason: e.to_string(),
            })
    }

    fn create(
        &self,
        evaluator_name: &str,
        context_type: &ContextType,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        debug!("创建评估器实例: {}<{}>", evaluator_name, context_type);

        match evaluator_name {
            PREDICATE_EVALUATOR => return Ok(Arc::new(PredicateEvaluator)),
            REGEX_EVALUATOR => return Ok(Arc::new(RegexEvaluator::default())),
            _ => {}
        }

        let factory = self
            .factories
            .get(evaluator_name)
            .map(|f| f.value().clone())
            .ok_or_else(|| RuleError::MissingConditionEvaluator {
                name: evaluator_name.to_string(),
                context_type: context_type.name().to_string(),
            })?;

        factory(context_type).map_err(|e| RuleError::MissingEvaluator {
            name: evaluator_name.to_string(),
            reason: e.to_string(),
        })
    }
}
