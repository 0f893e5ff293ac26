//! 条件评估器
//!
//! 评估器是执行单个条件的策略对象，由 [`crate::resolver::EvaluatorResolver`] 按
//! "评估器名 + 上下文类型" 创建并缓存。内置两种评估器：
//!
//! - [`PredicateEvaluator`]：执行条件上已编译的谓词
//! - [`RegexEvaluator`]：按属性路径读取上下文字段并做正则匹配
//!
//! 面向具体上下文类型编写的评估器实现 [`TypedConditionEvaluator`]，
//! 再通过 [`TypedEvaluator`] 适配为类型擦除的 [`ConditionEvaluator`]。

use async_trait::async_trait;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::Disposable;
use crate::context::{RuleContext, lookup_path};
use crate::error::EvaluationError;
use crate::models::{Condition, DynCondition};

/// 内置谓词评估器名称
pub const PREDICATE_EVALUATOR: &str = "PredicateConditionEvaluator";

/// 内置正则评估器名称
pub const REGEX_EVALUATOR: &str = "RegexConditionEvaluator";

/// 正则评估器读取的附加信息键
pub const PATTERN_KEY: &str = "Pattern";
pub const IGNORE_CASE_KEY: &str = "IgnoreCase";

/// 单个条件的评估结果
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub is_success: bool,
    pub failure_message: Option<String>,
    pub exception: Option<EvaluationError>,
}

impl EvaluationOutcome {
    pub fn success() -> Self {
        Self {
            is_success: true,
            failure_message: None,
            exception: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            failure_message: Some(message.into()),
            exception: None,
        }
    }

    /// 评估过程中出现故障
    pub fn fault(error: EvaluationError) -> Self {
        Self {
            is_success: false,
            failure_message: None,
            exception: Some(error),
        }
    }

    /// 按布尔结果构造，失败时渲染条件的失败消息
    pub fn from_bool(
        is_success: bool,
        condition: &dyn DynCondition,
        context: &RuleContext,
    ) -> Self {
        if is_success {
            Self::success()
        } else {
            Self::failure(render_failure_message(condition.failure_message(), context))
        }
    }
}

/// 条件评估器
#[async_trait]
pub trait ConditionEvaluator: Disposable + Send + Sync {
    async fn evaluate(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome;
}

/// 面向具体上下文类型的评估器
#[async_trait]
pub trait TypedConditionEvaluator<T>: Send + Sync + 'static
where
    T: Serialize + Send + Sync + 'static,
{
    async fn evaluate(
        &self,
        condition: &Condition<T>,
        data: &T,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome;
}

/// 谓词评估器
#[derive(Debug, Default)]
pub struct PredicateEvaluator;

impl Disposable for PredicateEvaluator {}

#[async_trait]
impl ConditionEvaluator for PredicateEvaluator {
    async fn evaluate(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome {
        if cancel.is_cancelled() {
            return EvaluationOutcome::fault(EvaluationError::Cancelled);
        }

        match condition.test_predicate(context) {
            Some(Ok(passed)) => EvaluationOutcome::from_bool(passed, condition, context),
            Some(Err(e)) => EvaluationOutcome::fault(e),
            None => EvaluationOutcome::fault(EvaluationError::InvalidConfiguration(format!(
                "条件 '{}' 没有已编译的谓词",
                condition.name()
            ))),
        }
    }
}

/// 正则评估器
///
/// `to_evaluate` 是上下文 JSON 快照中的属性路径，正则表达式取自
/// `additional_info["Pattern"]`，`additional_info["IgnoreCase"] = "true"` 时忽略大小写。
#[derive(Debug, Default)]
pub struct RegexEvaluator {
    compiled: DashMap<(String, bool), Arc<Regex>>,
}

impl RegexEvaluator {
    fn regex(&self, pattern: &str, ignore_case: bool) -> Result<Arc<Regex>, EvaluationError> {
        let key = (pattern.to_string(), ignore_case);
        if let Some(regex) = self.compiled.get(&key) {
            return Ok(regex.clone());
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|e| {
                EvaluationError::InvalidConfiguration(format!("无效的正则表达式 '{pattern}': {e}"))
            })?;
        let regex = Arc::new(regex);
        self.compiled.insert(key, regex.clone());

        Ok(regex)
    }

    fn matches(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
    ) -> Result<bool, EvaluationError> {
        let info = condition.additional_info();
        let pattern = info.get(PATTERN_KEY).ok_or_else(|| {
            EvaluationError::InvalidConfiguration(format!(
                "条件 '{}' 缺少附加信息 '{PATTERN_KEY}'",
                condition.name()
            ))
        })?;
        let ignore_case = info
            .get(IGNORE_CASE_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let regex = self.regex(pattern, ignore_case)?;

        let snapshot = context
            .snapshot()
            .map_err(|e| EvaluationError::Serialization(e.to_string()))?;

        let matched = match lookup_path(&snapshot, condition.to_evaluate()) {
            Some(value) => value_as_text(value).is_some_and(|text| regex.is_match(&text)),
            None => {
                debug!(path = condition.to_evaluate(), "正则评估的字段不存在");
                false
            }
        };

        Ok(matched)
    }
}

impl Disposable for RegexEvaluator {}

#[async_trait]
impl ConditionEvaluator for RegexEvaluator {
    async fn evaluate(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome {
        if cancel.is_cancelled() {
            return EvaluationOutcome::fault(EvaluationError::Cancelled);
        }

        match self.matches(condition, context) {
            Ok(matched) => EvaluationOutcome::from_bool(matched, condition, context),
            Err(e) => EvaluationOutcome::fault(e),
        }
    }
}

/// 把 [`TypedConditionEvaluator`] 适配为 [`ConditionEvaluator`]
pub struct TypedEvaluator<E, T> {
    inner: E,
    _marker: PhantomData<fn() -> T>,
}

impl<E, T> TypedEvaluator<E, T> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<E, T> Disposable for TypedEvaluator<E, T> {}

#[async_trait]
impl<E, T> ConditionEvaluator for TypedEvaluator<E, T>
where
    E: TypedConditionEvaluator<T>,
    T: Serialize + Send + Sync + 'static,
{
    async fn evaluate(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome {
        let Some(typed) = condition.as_any().downcast_ref::<Condition<T>>() else {
            return EvaluationOutcome::fault(EvaluationError::ContextMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: condition.context_type().name().to_string(),
            });
        };

        let Some(data) = context.downcast_ref::<T>() else {
            return EvaluationOutcome::fault(EvaluationError::ContextMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: context.context_type().name().to_string(),
            });
        };

        self.inner.evaluate(typed, data, cancel).await
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@\{([^}]+)\}").unwrap());

/// 渲染失败消息模板
///
/// `@{path}` 占位符替换为上下文快照中该路径的值，无法解析的占位符保留原样。
pub fn render_failure_message(template: &str, context: &RuleContext) -> String {
    if !template.contains("@{") {
        return template.to_string();
    }

    let Ok(snapshot) = context.snapshot() else {
        return template.to_string();
    };

    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup_path(&snapshot, caps[1].trim())
                .and_then(value_as_text)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
