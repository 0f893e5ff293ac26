//! 事件描述与事件负载

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::TypeKey;

/// 事件类型标识
pub type EventType = TypeKey;

/// 何时发布事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WhenType {
    #[default]
    Never,
    OnSuccess,
    OnFailure,
    OnSuccessOrFailure,
}

impl WhenType {
    /// 根据评估结果判断是否需要发布
    pub fn should_publish(self, is_success: bool) -> bool {
        match self {
            Self::Never => false,
            Self::OnSuccess => is_success,
            Self::OnFailure => !is_success,
            Self::OnSuccessOrFailure => true,
        }
    }
}

/// 事件分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DispatchMode {
    /// 各处理器独立启动，发布方不等待
    #[default]
    Detached,
    /// 启动全部处理器并等待全部完成
    Joined,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "detached"),
            Self::Joined => write!(f, "joined"),
        }
    }
}

/// 事件发送方类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderKind {
    Condition,
    Rule,
}

/// 引擎生成事件时携带的信息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    /// 事件唯一标识（UUID v7）
    pub event_id: String,
    /// 条件名或规则名
    pub sender_name: String,
    pub sender_kind: SenderKind,
    pub tenant_id: String,
    pub is_success: bool,
    pub failure_messages: Vec<String>,
    pub exceptions: Vec<String>,
    /// 评估数据的 JSON 快照
    pub data: Option<Value>,
    /// 快照失败时记录原因，不中断评估
    pub serialization_error: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl EventDetails {
    pub fn new(
        sender_name: impl Into<String>,
        sender_kind: SenderKind,
        tenant_id: impl Into<String>,
        is_success: bool,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            sender_name: sender_name.into(),
            sender_kind,
            tenant_id: tenant_id.into(),
            is_success,
            failure_messages: Vec::new(),
            exceptions: Vec::new(),
            data: None,
            serialization_error: None,
            raised_at: Utc::now(),
        }
    }

    /// 附加数据快照；序列化失败时把错误记录在事件上
    pub fn with_snapshot(mut self, snapshot: Result<Value, serde_json::Error>) -> Self {
        match snapshot {
            Ok(value) => self.data = Some(value),
            Err(e) => self.serialization_error = Some(e.to_string()),
        }
        self
    }
}

/// 内置事件类型，直接携带 [`EventDetails`]
#[derive(Debug, Clone)]
pub struct EvaluationEvent {
    pub details: EventDetails,
}

impl From<EventDetails> for EvaluationEvent {
    fn from(details: EventDetails) -> Self {
        Self { details }
    }
}

type EventFactory = Arc<dyn Fn(EventDetails) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// 条件或规则上的事件描述
#[derive(Clone)]
pub struct EventDescriptor {
    event_type: EventType,
    when: WhenType,
    dispatch: DispatchMode,
    factory: EventFactory,
}

impl EventDescriptor {
    /// 以自定义事件类型创建描述，事件由 [`EventDetails`] 构造
    pub fn new<E>(when: WhenType, dispatch: DispatchMode) -> Self
    where
        E: From<EventDetails> + Send + Sync + 'static,
    {
        Self {
            event_type: EventType::of::<E>(),
            when,
            dispatch,
            factory: Arc::new(|details: EventDetails| {
                Arc::new(E::from(details)) as Arc<dyn Any + Send + Sync>
            }),
        }
    }

    /// 使用内置 [`EvaluationEvent`]
    pub fn evaluation(when: WhenType, dispatch: DispatchMode) -> Self {
        Self::new::<EvaluationEvent>(when, dispatch)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn when(&self) -> WhenType {
        self.when
    }

    pub fn dispatch(&self) -> DispatchMode {
        self.dispatch
    }

    pub fn should_publish(&self, is_success: bool) -> bool {
        self.when.should_publish(is_success)
    }

    /// 构造具体事件值
    pub fn create_event(&self, details: EventDetails) -> Arc<dyn Any + Send + Sync> {
        (self.factory)(details)
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("event_type", &self.event_type.name())
            .field("when", &self.when)
            .field("dispatch", &self.dispatch)
            .finish()
    }
}
