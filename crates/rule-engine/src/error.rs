//! 规则引擎错误类型
//!
//! 分为三类：
//! - [`RuleError`]：配置类错误，直接返回给调用方，终止本次调用
//! - [`CacheError`]：缓存加锁超时与显式删除时的释放失败
//! - [`EvaluationError`]：评估期故障，不向上传播，而是记录到结果链中

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则未找到: {key}")]
    RuleNotFound { key: String },

    #[error("条件评估器解析失败: {name} - {reason}")]
    MissingEvaluator { name: String, reason: String },

    #[error("未注册的条件评估器: {name} (上下文类型 {context_type})")]
    MissingConditionEvaluator { name: String, context_type: String },

    #[error("规则 '{rule_name}' 不包含任何条件集")]
    MissingConditionSets { rule_name: String },

    #[error("条件集 '{set_name}' 不包含任何条件")]
    MissingConditions { set_name: String },

    #[error("缺少规则上下文: {0}")]
    MissingRuleContexts(String),

    #[error("上下文绑定的条件在规则 '{rule_name}' 中不存在: {condition_names:?}")]
    UnmatchedContexts {
        rule_name: String,
        condition_names: Vec<String>,
    },

    #[error("条件集 '{set_name}' 中存在重复的条件名: {condition_name}")]
    DuplicateCondition {
        set_name: String,
        condition_name: String,
    },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("规则解析失败: {0}")]
    ParseError(String),

    #[error("缓存错误: {0}")]
    Cache(#[from] CacheError),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("获取缓存键锁超时: {key} ({timeout_ms}ms)")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("释放缓存值失败: {key}")]
    Disposal {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// 评估期故障
///
/// 被捕获到 `ConditionResult` 中，需要在多个结果之间共享，因此实现了 `Clone`。
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("评估已取消")]
    Cancelled,

    #[error("{0}")]
    Resolution(Arc<RuleError>),

    #[error("上下文类型不匹配: 期望 {expected}, 实际 {actual}")]
    ContextMismatch { expected: String, actual: String },

    #[error("评估器配置无效: {0}")]
    InvalidConfiguration(String),

    #[error("上下文序列化失败: {0}")]
    Serialization(String),

    #[error("评估器 panic: {0}")]
    Panicked(String),

    #[error("{0}")]
    Evaluator(Arc<anyhow::Error>),
}

impl EvaluationError {
    /// 包装评估器返回的任意错误
    pub fn evaluator(error: impl Into<anyhow::Error>) -> Self {
        Self::Evaluator(Arc::new(error.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<RuleError> for EvaluationError {
    fn from(error: RuleError) -> Self {
        Self::Resolution(Arc::new(error))
    }
}
