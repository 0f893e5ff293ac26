//! 事件通知
//!
//! 条件和规则可以携带 [`EventDescriptor`]，评估结果满足 [`WhenType`] 时由引擎构造事件
//! 并交给 [`EventAggregator`] 分发。

mod aggregator;
mod descriptor;

pub use aggregator::{DynEventHandler, EventAggregator, EventHandler, HandlerAdapter, Subscription};
pub use descriptor::{
    DispatchMode, EvaluationEvent, EventDescriptor, EventDetails, EventType, SenderKind, WhenType,
};
