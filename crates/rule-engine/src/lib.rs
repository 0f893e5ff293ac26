//! 规则评估引擎
//!
//! 提供可解释的规则评估能力，支持：
//! - 条件集内短路 AND、条件集之间短路 OR
//! - 按 "评估器名 + 上下文类型" 解析并缓存条件评估器
//! - 条件和规则级别的事件通知（弱引用订阅、分离/汇合两种分发方式）
//! - 规则与 JSON 定义之间的双向转换

pub mod cache;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod models;
pub mod resolver;
pub mod result;

pub use cache::{Cache, CacheKey, Disposable};
pub use compiler::{
    ConditionDefinition, ConditionSetDefinition, EventDefinition, ExpressionCompiler,
    RuleCompiler, RuleDefinition,
};
pub use context::{ContextType, RuleContext, TypeKey};
pub use engine::{EvaluateOptions, RulesEngine};
pub use error::{CacheError, EvaluationError, Result, RuleError};
pub use evaluator::{
    ConditionEvaluator, EvaluationOutcome, PREDICATE_EVALUATOR, REGEX_EVALUATOR,
    TypedConditionEvaluator,
};
pub use events::{
    DispatchMode, DynEventHandler, EvaluationEvent, EventAggregator, EventDescriptor,
    EventDetails, EventHandler, EventType, HandlerAdapter, SenderKind, Subscription, WhenType,
};
pub use executor::RuleExecutor;
pub use models::{Condition, ConditionSet, DynCondition, Predicate, Rule};
pub use resolver::{EvaluatorResolver, ExternalResolver};
pub use result::{ConditionResult, RuleResult};
