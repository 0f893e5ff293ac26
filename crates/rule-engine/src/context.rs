//! 评估上下文
//!
//! 调用方以任意可序列化的类型提交评估数据，引擎按运行时类型把数据分派给对应条件。
//! 数据在引擎内部以类型擦除的 `Arc<dyn ContextValue>` 传递，需要读取字段
//! （失败消息占位符、正则评估器、事件快照）时通过 serde_json 生成 JSON 快照。

use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 运行时类型标识
///
/// 相等性只比较 `TypeId`，名称仅用于日志和诊断。
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// 完整类型路径，如 `my_app::orders::Order`
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 去掉模块路径后的类型名，如 `Order`
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 条件上下文类型
pub type ContextType = TypeKey;

/// 可作为评估数据的值
///
/// 对所有 `Serialize + Send + Sync + 'static` 类型自动实现。
pub trait ContextValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn context_type(&self) -> ContextType;

    /// 生成 JSON 快照
    fn snapshot(&self) -> Result<Value, serde_json::Error>;
}

impl<T> ContextValue for T
where
    T: Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn context_type(&self) -> ContextType {
        ContextType::of::<T>()
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// 单个评估上下文
///
/// 可选地绑定到某个条件名，绑定后该条件优先使用此上下文。
#[derive(Clone)]
pub struct RuleContext {
    value: Arc<dyn ContextValue>,
    condition_name: Option<String>,
}

impl RuleContext {
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self {
            value,
            condition_name: None,
        }
    }

    /// 创建绑定到指定条件的上下文
    pub fn for_condition<T>(condition_name: impl Into<String>, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            condition_name: Some(condition_name.into()),
        }
    }

    pub fn context_type(&self) -> ContextType {
        self.value.context_type()
    }

    pub fn condition_name(&self) -> Option<&str> {
        self.condition_name.as_deref()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.as_any().downcast_ref::<T>()
    }

    pub fn snapshot(&self) -> Result<Value, serde_json::Error> {
        self.value.snapshot()
    }

    /// 获取字段值（支持点号分隔的路径，如 "customer.address.city"）
    pub fn get_field(&self, path: &str) -> Option<Value> {
        let snapshot = self.snapshot().ok()?;
        lookup_path(&snapshot, path).cloned()
    }
}

impl fmt::Debug for RuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleContext")
            .field("context_type", &self.context_type().name())
            .field("condition_name", &self.condition_name)
            .finish()
    }
}

/// 按点号路径读取 JSON 值
///
/// 支持数组索引访问，如 "items.0.name"；空路径返回根节点。
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }

    let mut current = data;

    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// 为条件选择上下文
///
/// 优先使用显式绑定到该条件名的上下文，否则使用第一个运行时类型匹配的上下文。
pub fn select_context<'a>(
    contexts: &'a [RuleContext],
    condition_name: &str,
    context_type: ContextType,
) -> Option<&'a RuleContext> {
    contexts
        .iter()
        .find(|c| c.condition_name() == Some(condition_name))
        .or_else(|| contexts.iter().find(|c| c.context_type() == context_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Customer {
        name: String,
        age: u32,
        tags: Vec<String>,
    }

    #[derive(Serialize)]
    struct Order {
        amount: f64,
    }

    fn customer(name: &str) -> Customer {
        Customer {
            name: name.to_string(),
            age: 42,
            tags: vec!["vip".to_string(), "frequent".to_string()],
        }
    }

    #[test]
    fn test_type_key_names() {
        let key = ContextType::of::<Customer>();
        assert!(key.name().ends_with("Customer"));
        assert_eq!(key.short_name(), "Customer");
        assert_eq!(key, ContextType::of::<Customer>());
        assert_ne!(key, ContextType::of::<Order>());

        assert_eq!(ContextType::of::<Vec<Order>>().short_name(), "Vec");
    }

    #[test]
    fn test_lookup_path() {
        let data = json!({
            "customer": {"name": "Ada", "orders": [{"id": 1}, {"id": 2}]},
            "total": 99.5
        });

        assert_eq!(lookup_path(&data, "customer.name"), Some(&json!("Ada")));
        assert_eq!(lookup_path(&data, "customer.orders.1.id"), Some(&json!(2)));
        assert_eq!(lookup_path(&data, "total"), Some(&json!(99.5)));
        assert_eq!(lookup_path(&data, ""), Some(&data));
        assert_eq!(lookup_path(&data, "customer.missing"), None);
        assert_eq!(lookup_path(&data, "total.value"), None);
    }

    #[test]
    fn test_rule_context_downcast_and_fields() {
        let ctx = RuleContext::new(customer("Ada"));

        assert_eq!(ctx.context_type(), ContextType::of::<Customer>());
        assert_eq!(ctx.downcast_ref::<Customer>().map(|c| c.age), Some(42));
        assert!(ctx.downcast_ref::<Order>().is_none());
        assert_eq!(ctx.get_field("tags.0"), Some(json!("vip")));
        assert_eq!(ctx.condition_name(), None);
    }

    #[test]
    fn test_select_context_prefers_bound_name() {
        let contexts = vec![
            RuleContext::new(customer("first")),
            RuleContext::new(Order { amount: 10.0 }),
            RuleContext::for_condition("IsSecond", customer("second")),
        ];

        let bound = select_context(&contexts, "IsSecond", ContextType::of::<Customer>()).unwrap();
        assert_eq!(bound.downcast_ref::<Customer>().unwrap().name, "second");

        let by_type = select_context(&contexts, "Other", ContextType::of::<Customer>()).unwrap();
        assert_eq!(by_type.downcast_ref::<Customer>().unwrap().name, "first");

        let order = select_context(&contexts, "Other", ContextType::of::<Order>()).unwrap();
        assert_eq!(order.downcast_ref::<Order>().unwrap().amount, 10.0);

        assert!(select_context(&contexts, "Other", ContextType::of::<String>()).is_none());
    }
}
