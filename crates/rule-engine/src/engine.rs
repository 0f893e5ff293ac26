//! 规则引擎入口
//!
//! 组合规则缓存、评估器解析器和事件聚合器，对外提供注册、评估、订阅和发布能力。

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cache::{Cache, CacheKey};
use crate::context::{ContextType, RuleContext};
use crate::error::{Result, RuleError};
use crate::evaluator::{ConditionEvaluator, TypedConditionEvaluator};
use crate::events::{DispatchMode, EventAggregator, EventHandler, Subscription};
use crate::executor::RuleExecutor;
use crate::models::Rule;
use crate::resolver::{EvaluatorResolver, ExternalResolver};
use crate::result::RuleResult;
use rules_shared::config::{AppConfig, EngineSettings};

/// 单次评估的选项
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    /// 未指定时使用配置中的默认租户
    pub tenant_id: Option<String>,
    /// 未指定时使用配置中的默认文化
    pub culture_id: Option<String>,
    pub cancellation: Option<CancellationToken>,
}

impl EvaluateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn culture(mut self, culture_id: impl Into<String>) -> Self {
        self.culture_id = Some(culture_id.into());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// 规则引擎
pub struct RulesEngine {
    rules: Cache<Arc<Rule>>,
    resolver: EvaluatorResolver,
    events: EventAggregator,
    settings: EngineSettings,
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RulesEngine {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default(), None)
    }

    pub fn with_settings(
        settings: EngineSettings,
        external_resolver: Option<Arc<dyn ExternalResolver>>,
    ) -> Self {
        let lock_timeout = settings.cache_lock_timeout();

        Self {
            rules: Cache::new("rules", lock_timeout),
            resolver: EvaluatorResolver::new(lock_timeout, external_resolver.clone()),
            events: EventAggregator::new(
                external_resolver,
                settings.resolve_external_event_handlers,
            ),
            settings,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        external_resolver: Option<Arc<dyn ExternalResolver>>,
    ) -> Self {
        Self::with_settings(config.engine.clone(), external_resolver)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // 规则管理
    // ------------------------------------------------------------------

    /// 注册或替换规则
    ///
    /// 未指定租户或文化时使用规则自身的租户和文化。
    #[instrument(skip(self, rule), fields(rule_name = rule.name()))]
    pub fn register_rule(
        &self,
        rule: Rule,
        tenant_id: Option<&str>,
        culture_id: Option<&str>,
    ) -> Result<()> {
        let key = CacheKey::new(
            rule.name(),
            tenant_id.unwrap_or(rule.tenant_id()),
            culture_id.unwrap_or(rule.culture_id()),
        );

        self.rules.upsert(&key, Arc::new(rule))?;
        info!("规则已注册: {}", key);
        Ok(())
    }

    pub fn contains_rule(
        &self,
        rule_name: &str,
        tenant_id: Option<&str>,
        culture_id: Option<&str>,
    ) -> bool {
        self.rules.contains(&self.key(rule_name, tenant_id, culture_id))
    }

    /// 删除规则，删除时的释放失败会返回错误
    pub fn remove_rule(
        &self,
        rule_name: &str,
        tenant_id: Option<&str>,
        culture_id: Option<&str>,
    ) -> Result<bool> {
        let key = self.key(rule_name, tenant_id, culture_id);
        let removed = self.rules.remove(&key)?;
        if removed {
            info!("规则已删除: {}", key);
        }
        Ok(removed)
    }

    /// 获取规则副本，调用方无法修改缓存中的规则
    pub fn try_get_rule(
        &self,
        rule_name: &str,
        tenant_id: Option<&str>,
        culture_id: Option<&str>,
    ) -> Option<Rule> {
        self.rules
            .try_get(&self.key(rule_name, tenant_id, culture_id))
            .map(|rule| (*rule).clone())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 清空全部规则
    pub fn clear_rules(&self) {
        self.rules.clear();
    }

    // ------------------------------------------------------------------
    // 评估
    // ------------------------------------------------------------------

    /// 使用默认租户和文化评估规则
    pub async fn evaluate(&self, rule_name: &str, contexts: &[RuleContext]) -> Result<RuleResult> {
        self.evaluate_with(rule_name, contexts, EvaluateOptions::default())
            .await
    }

    /// 评估规则
    ///
    /// 指定租户下不存在该规则时，回退到默认租户下的同名规则。
    #[instrument(skip(self, contexts, options))]
    pub async fn evaluate_with(
        &self,
        rule_name: &str,
        contexts: &[RuleContext],
        options: EvaluateOptions,
    ) -> Result<RuleResult> {
        let tenant_id = options
            .tenant_id
            .unwrap_or_else(|| self.settings.default_tenant.clone());
        let culture_id = options
            .culture_id
            .unwrap_or_else(|| self.settings.default_culture.clone());
        let cancel = options.cancellation.unwrap_or_default();

        let rule = self.lookup_rule(rule_name, &tenant_id, &culture_id)?;

        RuleExecutor::new(&self.resolver, &self.events)
            .execute(&rule, contexts, &tenant_id, &cancel)
            .await
    }

    fn lookup_rule(&self, rule_name: &str, tenant_id: &str, culture_id: &str) -> Result<Arc<Rule>> {
        let key = CacheKey::new(rule_name, tenant_id, culture_id);
        if let Some(rule) = self.rules.try_get(&key) {
            return Ok(rule);
        }

        if tenant_id != self.settings.default_tenant {
            let fallback = CacheKey::new(rule_name, &self.settings.default_tenant, culture_id);
            if let Some(rule) = self.rules.try_get(&fallback) {
                debug!("使用默认租户下的规则: {}", fallback);
                return Ok(rule);
            }
        }

        Err(RuleError::RuleNotFound {
            key: key.to_string(),
        })
    }

    fn key(&self, rule_name: &str, tenant_id: Option<&str>, culture_id: Option<&str>) -> CacheKey {
        CacheKey::new(
            rule_name,
            tenant_id.unwrap_or(&self.settings.default_tenant),
            culture_id.unwrap_or(&self.settings.default_culture),
        )
    }

    // ------------------------------------------------------------------
    // 评估器
    // ------------------------------------------------------------------

    pub fn register_evaluator<F>(&self, name: &str, factory: F)
    where
        F: Fn(&ContextType) -> anyhow::Result<Arc<dyn ConditionEvaluator>> + Send + Sync + 'static,
    {
        self.resolver.register_evaluator(name, factory);
    }

    pub fn register_evaluator_type<E>(&self, name: &str)
    where
        E: ConditionEvaluator + Default + 'static,
    {
        self.resolver.register_evaluator_type::<E>(name);
    }

    pub fn register_typed_evaluator<E, T>(&self, name: &str)
    where
        E: TypedConditionEvaluator<T> + Default,
        T: Serialize + Send + Sync + 'static,
    {
        self.resolver.register_typed_evaluator::<E, T>(name);
    }

    pub fn register_evaluator_for_external_resolution(&self, name: &str, kind: &str) {
        self.resolver
            .register_evaluator_for_external_resolution(name, kind);
    }

    pub fn resolve(
        &self,
        evaluator_name: &str,
        context_type: &ContextType,
    ) -> Result<Arc<dyn ConditionEvaluator>> {
        self.resolver.resolve(evaluator_name, context_type)
    }

    pub fn resolver(&self) -> &EvaluatorResolver {
        &self.resolver
    }

    // ------------------------------------------------------------------
    // 事件
    // ------------------------------------------------------------------

    pub fn subscribe<E, H>(&self, handler: &Arc<H>) -> Subscription
    where
        E: Send + Sync + 'static,
        H: EventHandler<E>,
    {
        self.events.subscribe::<E, H>(handler)
    }

    pub async fn publish<E>(&self, event: E, cancel: &CancellationToken, mode: DispatchMode)
    where
        E: Send + Sync + 'static,
    {
        self.events.publish(event, cancel, mode).await;
    }

    pub fn events(&self) -> &EventAggregator {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, ConditionSet};

    #[derive(Debug, Serialize)]
    struct Member {
        points: u32,
    }

    fn gold_rule() -> Rule {
        Rule::new("gold", "standard").with_condition_set(
            ConditionSet::new("gold", "gold")
                .with_condition(Condition::predicate(
                    "Points",
                    "m.points >= 1000",
                    |m: &Member| m.points >= 1000,
                    "only @{points} points",
                ))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_register_and_evaluate() {
        let engine = RulesEngine::new();
        engine.register_rule(gold_rule(), None, None).unwrap();

        assert!(engine.contains_rule("gold", None, None));
        assert_eq!(engine.rule_count(), 1);

        let result = engine
            .evaluate("gold", &[RuleContext::new(Member { points: 1500 })])
            .await
            .unwrap();
        assert!(result.is_success);
        assert_eq!(result.value, "gold");

        let result = engine
            .evaluate("gold", &[RuleContext::new(Member { points: 10 })])
            .await
            .unwrap();
        assert_eq!(result.value, "standard");
        assert_eq!(result.failure_messages, vec!["only 10 points".to_string()]);
    }

    #[tokio::test]
    async fn test_rule_not_found() {
        let engine = RulesEngine::new();
        let err = engine
            .evaluate("missing", &[RuleContext::new(Member { points: 1 })])
            .await
            .unwrap_err();

        assert!(matches!(err, RuleError::RuleNotFound { ref key } if key.starts_with("missing|")));
    }

    #[tokio::test]
    async fn test_tenant_specific_rule_and_fallback() {
        let engine = RulesEngine::new();
        engine.register_rule(gold_rule(), None, None).unwrap();
        engine
            .register_rule(
                Rule::new("gold", "tenant-standard").with_condition_set(
                    ConditionSet::new("always", "tenant-gold")
                        .with_condition(Condition::predicate("Any", "true", |_: &Member| true, ""))
                        .unwrap(),
                ),
                Some("tenant-a"),
                None,
            )
            .unwrap();

        let contexts = [RuleContext::new(Member { points: 1 })];

        let tenant_a = engine
            .evaluate_with("gold", &contexts, EvaluateOptions::new().tenant("tenant-a"))
            .await
            .unwrap();
        assert_eq!(tenant_a.value, "tenant-gold");
        assert_eq!(tenant_a.tenant_id, "tenant-a");

        let tenant_b = engine
            .evaluate_with("gold", &contexts, EvaluateOptions::new().tenant("tenant-b"))
            .await
            .unwrap();
        assert_eq!(tenant_b.value, "standard");
        assert_eq!(tenant_b.tenant_id, "tenant-b");
        assert_eq!(tenant_b.rule_tenant_id, "All_Tenants");
    }

    #[test]
    fn test_try_get_rule_returns_copy() {
        let engine = RulesEngine::new();
        engine.register_rule(gold_rule(), None, None).unwrap();

        let copy = engine.try_get_rule("gold", None, None).unwrap();
        let _changed = copy.with_enabled(false);

        let cached = engine.try_get_rule("gold", None, None).unwrap();
        assert!(cached.is_enabled());

        assert!(engine.remove_rule("gold", None, None).unwrap());
        assert!(!engine.remove_rule("gold", None, None).unwrap());
        assert!(engine.try_get_rule("gold", None, None).is_none());
    }

    #[test]
    fn test_from_config_uses_engine_settings() {
        let mut config = AppConfig::default();
        config.engine.default_tenant = "tenant-x".into();

        let engine = RulesEngine::from_config(&config, None);
        engine.register_rule(gold_rule().with_tenant("tenant-x"), None, None).unwrap();

        assert!(engine.contains_rule("gold", None, None));
        assert_eq!(engine.settings().default_tenant, "tenant-x");
    }
}
