//! 规则引擎领域模型
//!
//! - [`Condition`]：绑定到一种上下文类型的最小评估单元
//! - [`ConditionSet`]：按顺序做短路 AND 的条件集合
//! - [`Rule`]：按顺序做短路 OR 的条件集集合
//!
//! 三者构建完成后均不可变；条件在集合中以 `Arc<dyn DynCondition>` 存放，
//! 因此同一个条件集可以混合不同上下文类型的条件。

use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::cache::{CacheKey, Disposable};
use crate::context::{ContextType, RuleContext};
use crate::error::{EvaluationError, Result, RuleError};
use crate::evaluator::PREDICATE_EVALUATOR;
use crate::events::EventDescriptor;
use rules_shared::config::{DEFAULT_CULTURE, DEFAULT_TENANT};

/// 已编译的谓词
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// 条件定义
pub struct Condition<T> {
    name: String,
    to_evaluate: String,
    predicate: Option<Predicate<T>>,
    failure_message: String,
    evaluator_name: String,
    additional_info: BTreeMap<String, String>,
    event: Option<EventDescriptor>,
}

impl<T> Condition<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// 创建由指定评估器执行的条件
    pub fn new(
        name: impl Into<String>,
        to_evaluate: impl Into<String>,
        failure_message: impl Into<String>,
        evaluator_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            to_evaluate: to_evaluate.into(),
            predicate: None,
            failure_message: failure_message.into(),
            evaluator_name: evaluator_name.into(),
            additional_info: BTreeMap::new(),
            event: None,
        }
    }

    /// 创建由内置谓词评估器执行的条件
    ///
    /// `to_evaluate` 保留表达式原文，用于结果追踪和序列化。
    pub fn predicate<F>(
        name: impl Into<String>,
        to_evaluate: impl Into<String>,
        predicate: F,
        failure_message: impl Into<String>,
    ) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(name, to_evaluate, failure_message, PREDICATE_EVALUATOR)
            .with_predicate(Arc::new(predicate))
    }

    pub fn with_predicate(mut self, predicate: Predicate<T>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// 复制调用方提供的附加信息，条件不会与调用方共享同一份集合
    pub fn with_additional_info(mut self, info: &HashMap<String, String>) -> Self {
        self.additional_info
            .extend(info.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }

    pub fn with_event(mut self, event: EventDescriptor) -> Self {
        self.event = Some(event);
        self
    }

    pub fn compiled_predicate(&self) -> Option<&Predicate<T>> {
        self.predicate.as_ref()
    }
}

impl<T> fmt::Debug for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("context_type", &std::any::type_name::<T>())
            .field("to_evaluate", &self.to_evaluate)
            .field("has_predicate", &self.predicate.is_some())
            .field("failure_message", &self.failure_message)
            .field("evaluator_name", &self.evaluator_name)
            .field("additional_info", &self.additional_info)
            .field("event", &self.event)
            .finish()
    }
}

/// 类型擦除后的条件接口
pub trait DynCondition: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn context_type(&self) -> ContextType;

    fn to_evaluate(&self) -> &str;

    fn failure_message(&self) -> &str;

    fn evaluator_name(&self) -> &str;

    fn additional_info(&self) -> &BTreeMap<String, String>;

    fn event(&self) -> Option<&EventDescriptor>;

    fn has_predicate(&self) -> bool;

    /// 对上下文执行已编译的谓词
    ///
    /// 没有谓词时返回 `None`；上下文类型不符时返回 `ContextMismatch`。
    fn test_predicate(&self, context: &RuleContext)
    -> Option<std::result::Result<bool, EvaluationError>>;

    /// 供类型化评估器向下转型为 `Condition<T>`
    fn as_any(&self) -> &dyn Any;
}

impl<T> DynCondition for Condition<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn context_type(&self) -> ContextType {
        ContextType::of::<T>()
    }

    fn to_evaluate(&self) -> &str {
        &self.to_evaluate
    }

    fn failure_message(&self) -> &str {
        &self.failure_message
    }

    fn evaluator_name(&self) -> &str {
        &self.evaluator_name
    }

    fn additional_info(&self) -> &BTreeMap<String, String> {
        &self.additional_info
    }

    fn event(&self) -> Option<&EventDescriptor> {
        self.event.as_ref()
    }

    fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    fn test_predicate(
        &self,
        context: &RuleContext,
    ) -> Option<std::result::Result<bool, EvaluationError>> {
        let predicate = self.predicate.as_ref()?;

        match context.downcast_ref::<T>() {
            Some(data) => Some(Ok(predicate(data))),
            None => Some(Err(EvaluationError::ContextMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: context.context_type().name().to_string(),
            })),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 条件集（AND）
#[derive(Debug, Clone)]
pub struct ConditionSet {
    name: String,
    value: String,
    conditions: Vec<Arc<dyn DynCondition>>,
}

impl ConditionSet {
    /// 创建空条件集，评估前至少需要添加一个条件
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            conditions: Vec::new(),
        }
    }

    /// 追加条件，条件名在集合内必须唯一
    pub fn with_condition<T>(self, condition: Condition<T>) -> Result<Self>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.with_dyn_condition(Arc::new(condition))
    }

    pub fn with_dyn_condition(mut self, condition: Arc<dyn DynCondition>) -> Result<Self> {
        if self.contains(condition.name()) {
            return Err(RuleError::DuplicateCondition {
                set_name: self.name,
                condition_name: condition.name().to_string(),
            });
        }

        self.conditions.push(condition);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 条件集成功时返回的值
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn conditions(&self) -> &[Arc<dyn DynCondition>] {
        &self.conditions
    }

    pub fn contains(&self, condition_name: &str) -> bool {
        self.conditions.iter().any(|c| c.name() == condition_name)
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// 规则定义（OR）
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    tenant_id: String,
    culture_id: String,
    failure_value: String,
    is_enabled: bool,
    event: Option<EventDescriptor>,
    condition_sets: Vec<ConditionSet>,
}

impl Rule {
    pub fn new(name: impl Into<String>, failure_value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_id: DEFAULT_TENANT.to_string(),
            culture_id: DEFAULT_CULTURE.to_string(),
            failure_value: failure_value.into(),
            is_enabled: true,
            event: None,
            condition_sets: Vec::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_culture(mut self, culture_id: impl Into<String>) -> Self {
        self.culture_id = culture_id.into();
        self
    }

    pub fn with_enabled(mut self, is_enabled: bool) -> Self {
        self.is_enabled = is_enabled;
        self
    }

    pub fn with_event(mut self, event: EventDescriptor) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_condition_set(mut self, set: ConditionSet) -> Self {
        self.condition_sets.push(set);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn culture_id(&self) -> &str {
        &self.culture_id
    }

    pub fn failure_value(&self) -> &str {
        &self.failure_value
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn event(&self) -> Option<&EventDescriptor> {
        self.event.as_ref()
    }

    pub fn condition_sets(&self) -> &[ConditionSet] {
        &self.condition_sets
    }

    /// 规则自身的缓存键
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.name, &self.tenant_id, &self.culture_id)
    }

    /// 规则中是否存在指定名称的条件
    pub fn contains_condition(&self, condition_name: &str) -> bool {
        self.condition_sets.iter().any(|s| s.contains(condition_name))
    }

    /// 规则中的条件总数
    pub fn condition_count(&self) -> usize {
        self.condition_sets.iter().map(ConditionSet::len).sum()
    }
}

impl Disposable for Rule {}
