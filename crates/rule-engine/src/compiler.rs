//! 规则编译器
//!
//! 在 JSON 定义和内存中的 [`Rule`] 之间转换。上下文类型和事件类型通过显式注册
//! 与名称对应；谓词表达式由注册时提供的 [`ExpressionCompiler`] 编译，
//! 反向转换时只保留表达式原文。

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::context::ContextType;
use crate::error::{Result, RuleError};
use crate::evaluator::PREDICATE_EVALUATOR;
use crate::events::{DispatchMode, EvaluationEvent, EventDescriptor, EventDetails, WhenType};
use crate::models::{Condition, ConditionSet, DynCondition, Predicate, Rule};
use rules_shared::config::{DEFAULT_CULTURE, DEFAULT_TENANT};

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub rule_name: String,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_culture")]
    pub culture_id: String,
    #[serde(default)]
    pub failure_value: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_event: Option<EventDefinition>,
    pub condition_sets: Vec<ConditionSetDefinition>,
}

/// 条件集定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSetDefinition {
    pub set_name: String,
    #[serde(default)]
    pub set_value: String,
    pub conditions: Vec<ConditionDefinition>,
}

/// 条件定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDefinition {
    pub condition_name: String,
    /// 注册时使用的上下文类型名
    pub context_type_name: String,
    pub to_evaluate: String,
    #[serde(default)]
    pub failure_message: String,
    pub evaluator_name: String,
    /// `to_evaluate` 是否需要编译为谓词
    #[serde(default)]
    pub is_lambda_predicate: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_event: Option<EventDefinition>,
}

/// 事件定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub event_type_name: String,
    #[serde(default)]
    pub event_when_type: WhenType,
    #[serde(default)]
    pub event_dispatch: DispatchMode,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

fn default_culture() -> String {
    DEFAULT_CULTURE.to_string()
}

fn default_enabled() -> bool {
    true
}

/// 表达式编译器，把表达式原文编译为谓词
pub trait ExpressionCompiler<T>: Send + Sync {
    fn compile(&self, expression: &str) -> anyhow::Result<Predicate<T>>;
}

impl<T, F> ExpressionCompiler<T> for F
where
    F: Fn(&str) -> anyhow::Result<Predicate<T>> + Send + Sync,
{
    fn compile(&self, expression: &str) -> anyhow::Result<Predicate<T>> {
        self(expression)
    }
}

type ConditionBuilder = Box<
    dyn Fn(&ConditionDefinition, Option<EventDescriptor>) -> Result<Arc<dyn DynCondition>>
        + Send
        + Sync,
>;

type EventBuilder = Box<dyn Fn(WhenType, DispatchMode) -> EventDescriptor + Send + Sync>;

/// 内置评估事件的注册名
pub const EVALUATION_EVENT: &str = "EvaluationEvent";

/// 规则编译器
pub struct RuleCompiler {
    contexts: HashMap<String, ConditionBuilder>,
    context_names: HashMap<TypeId, String>,
    events: HashMap<String, EventBuilder>,
    event_names: HashMap<TypeId, String>,
}

impl RuleCompiler {
    /// 创建编译器，内置事件类型 [`EvaluationEvent`] 已注册
    pub fn new() -> Self {
        let mut compiler = Self {
            contexts: HashMap::new(),
            context_names: HashMap::new(),
            events: HashMap::new(),
            event_names: HashMap::new(),
        };
        compiler.register_event::<EvaluationEvent>(EVALUATION_EVENT);
        compiler
    }

    /// 注册上下文类型及其表达式编译器
    pub fn register_context<T, C>(&mut self, name: &str, compiler: C) -> &mut Self
    where
        T: Serialize + Send + Sync + 'static,
        C: ExpressionCompiler<T> + 'static,
    {
        let compiler: Arc<dyn ExpressionCompiler<T>> = Arc::new(compiler);
        self.insert_context::<T>(name, Some(compiler))
    }

    /// 注册不需要编译谓词的上下文类型
    pub fn register_context_type<T>(&mut self, name: &str) -> &mut Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.insert_context::<T>(name, None)
    }

    fn insert_context<T>(
        &mut self,
        name: &str,
        compiler: Option<Arc<dyn ExpressionCompiler<T>>>,
    ) -> &mut Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let type_name = name.to_string();

        let builder: ConditionBuilder = Box::new(move |def: &ConditionDefinition, event: Option<EventDescriptor>| {
            let mut condition = Condition::<T>::new(
                &def.condition_name,
                &def.to_evaluate,
                &def.failure_message,
                &def.evaluator_name,
            );

            for (key, value) in &def.additional_info {
                condition = condition.with_info(key, value);
            }

            if def.is_lambda_predicate {
                let compiler = compiler.as_ref().ok_or_else(|| {
                    RuleError::ParseError(format!(
                        "上下文类型 '{}' 未注册表达式编译器，无法编译条件 '{}'",
                        type_name, def.condition_name
                    ))
                })?;
                let predicate = compiler.compile(&def.to_evaluate).map_err(|e| {
                    RuleError::ParseError(format!(
                        "条件 '{}' 的表达式编译失败: {}",
                        def.condition_name, e
                    ))
                })?;
                condition = condition.with_predicate(predicate);
            }

            if let Some(event) = event {
                condition = condition.with_event(event);
            }

            Ok(Arc::new(condition) as Arc<dyn DynCondition>)
        });

        self.contexts.insert(name.to_string(), builder);
        self.context_names
            .insert(TypeId::of::<T>(), name.to_string());
        self
    }

    /// 注册事件类型
    pub fn register_event<E>(&mut self, name: &str) -> &mut Self
    where
        E: From<EventDetails> + Send + Sync + 'static,
    {
        self.events.insert(
            name.to_string(),
            Box::new(|when: WhenType, dispatch: DispatchMode| {
                EventDescriptor::new::<E>(when, dispatch)
            }),
        );
        self.event_names.insert(TypeId::of::<E>(), name.to_string());
        self
    }

    /// 从 JSON 字符串编译规则
    pub fn compile_from_json(&self, json: &str) -> Result<Rule> {
        let definition: RuleDefinition = serde_json::from_str(json)?;
        self.compile(&definition)
    }

    /// 编译规则
    #[instrument(skip(self, definition), fields(rule_name = %definition.rule_name))]
    pub fn compile(&self, definition: &RuleDefinition) -> Result<Rule> {
        self.validate(definition)?;

        let mut rule = Rule::new(&definition.rule_name, &definition.failure_value)
            .with_tenant(&definition.tenant_id)
            .with_culture(&definition.culture_id)
            .with_enabled(definition.is_enabled);

        if let Some(event) = &definition.rule_event {
            rule = rule.with_event(self.build_event(event)?);
        }

        for set_def in &definition.condition_sets {
            let mut set = ConditionSet::new(&set_def.set_name, &set_def.set_value);

            for cond_def in &set_def.conditions {
                let builder = self.contexts.get(&cond_def.context_type_name).ok_or_else(|| {
                    RuleError::ParseError(format!(
                        "未注册的上下文类型: {}",
                        cond_def.context_type_name
                    ))
                })?;

                let event = cond_def
                    .condition_event
                    .as_ref()
                    .map(|e| self.build_event(e))
                    .transpose()?;

                set = set.with_dyn_condition(builder(cond_def, event)?)?;
            }

            rule = rule.with_condition_set(set);
        }

        debug!(conditions = rule.condition_count(), "规则已编译");
        Ok(rule)
    }

    /// 把规则转换回定义
    pub fn decompile(&self, rule: &Rule) -> Result<RuleDefinition> {
        let rule_event = rule.event().map(|e| self.event_definition(e)).transpose()?;

        let condition_sets = rule
            .condition_sets()
            .iter()
            .map(|set| {
                let conditions = set
                    .conditions()
                    .iter()
                    .map(|c| self.condition_definition(c.as_ref()))
                    .collect::<Result<Vec<_>>>()?;

                Ok(ConditionSetDefinition {
                    set_name: set.name().to_string(),
                    set_value: set.value().to_string(),
                    conditions,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RuleDefinition {
            rule_name: rule.name().to_string(),
            tenant_id: rule.tenant_id().to_string(),
            culture_id: rule.culture_id().to_string(),
            failure_value: rule.failure_value().to_string(),
            is_enabled: rule.is_enabled(),
            rule_event,
            condition_sets,
        })
    }

    /// 把规则序列化为 JSON
    pub fn to_json(&self, rule: &Rule) -> Result<String> {
        let definition = self.decompile(rule)?;
        Ok(serde_json::to_string_pretty(&definition)?)
    }

    fn condition_definition(&self, condition: &dyn DynCondition) -> Result<ConditionDefinition> {
        let context_type_name = self.context_name(condition.context_type())?;
        let condition_event = condition
            .event()
            .map(|e| self.event_definition(e))
            .transpose()?;

        Ok(ConditionDefinition {
            condition_name: condition.name().to_string(),
            context_type_name,
            to_evaluate: condition.to_evaluate().to_string(),
            failure_message: condition.failure_message().to_string(),
            evaluator_name: condition.evaluator_name().to_string(),
            is_lambda_predicate: condition.has_predicate(),
            additional_info: condition.additional_info().clone(),
            condition_event,
        })
    }

    fn context_name(&self, context_type: ContextType) -> Result<String> {
        self.context_names
            .get(&context_type.id())
            .cloned()
            .ok_or_else(|| {
                RuleError::ParseError(format!("未注册的上下文类型: {}", context_type.name()))
            })
    }

    fn event_definition(&self, descriptor: &EventDescriptor) -> Result<EventDefinition> {
        let event_type_name = self
            .event_names
            .get(&descriptor.event_type().id())
            .cloned()
            .ok_or_else(|| {
                RuleError::ParseError(format!(
                    "未注册的事件类型: {}",
                    descriptor.event_type().name()
                ))
            })?;

        Ok(EventDefinition {
            event_type_name,
            event_when_type: descriptor.when(),
            event_dispatch: descriptor.dispatch(),
        })
    }

    fn build_event(&self, definition: &EventDefinition) -> Result<EventDescriptor> {
        let builder = self.events.get(&definition.event_type_name).ok_or_else(|| {
            RuleError::ParseError(format!("未注册的事件类型: {}", definition.event_type_name))
        })?;

        Ok(builder(definition.event_when_type, definition.event_dispatch))
    }

    /// 验证规则结构
    fn validate(&self, definition: &RuleDefinition) -> Result<()> {
        if definition.rule_name.trim().is_empty() {
            return Err(RuleError::ParseError("规则名称不能为空".to_string()));
        }

        if definition.condition_sets.is_empty() {
            return Err(RuleError::MissingConditionSets {
                rule_name: definition.rule_name.clone(),
            });
        }

        for set in &definition.condition_sets {
            if set.set_name.trim().is_empty() {
                return Err(RuleError::ParseError(format!(
                    "规则 '{}' 中存在未命名的条件集",
                    definition.rule_name
                )));
            }

            if set.conditions.is_empty() {
                return Err(RuleError::MissingConditions {
                    set_name: set.set_name.clone(),
                });
            }

            let mut names = HashSet::new();
            for condition in &set.conditions {
                self.validate_condition(&set.set_name, condition)?;

                if !names.insert(condition.condition_name.as_str()) {
                    return Err(RuleError::DuplicateCondition {
                        set_name: set.set_name.clone(),
                        condition_name: condition.condition_name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_condition(&self, set_name: &str, condition: &ConditionDefinition) -> Result<()> {
        let path = format!("{}.{}", set_name, condition.condition_name);

        if condition.condition_name.trim().is_empty() {
            return Err(RuleError::ParseError(format!(
                "条件集 '{}' 中存在未命名的条件",
                set_name
            )));
        }

        if condition.evaluator_name.trim().is_empty() {
            return Err(RuleError::ParseError(format!(
                "条件 '{}' 的评估器名称不能为空",
                path
            )));
        }

        // 谓词评估器只能执行已编译的谓词
        if condition.evaluator_name == PREDICATE_EVALUATOR && !condition.is_lambda_predicate {
            return Err(RuleError::ParseError(format!(
                "条件 '{}' 使用 {} 时必须是谓词表达式",
                path, PREDICATE_EVALUATOR
            )));
        }

        Ok(())
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}
