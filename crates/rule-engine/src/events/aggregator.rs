//! 事件聚合器
//!
//! 进程内发布/订阅。订阅者以 `Weak` 引用持有，持有方释放处理器后，
//! 下一次发布同类型事件时条目被清理，处理器不会再被调用。
//! 启用外部解析时，每次发布还会向 [`ExternalResolver`] 查询该事件类型的处理器。

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use parking_lot::RwLock;
use rules_shared::observability::metrics::record_event_dispatch;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::descriptor::{DispatchMode, EventType};
use crate::resolver::ExternalResolver;

/// 类型化事件处理器
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static
where
    E: Send + Sync + 'static,
{
    async fn handle(&self, event: Arc<E>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// 类型擦除的事件处理器，外部解析器返回此接口
#[async_trait]
pub trait DynEventHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        event: Arc<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// 把 [`EventHandler`] 适配为 [`DynEventHandler`]
pub struct HandlerAdapter<E, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> E>,
}

impl<E, H> HandlerAdapter<E, H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> DynEventHandler for HandlerAdapter<E, H>
where
    E: Send + Sync + 'static,
    H: EventHandler<E>,
{
    async fn handle_dyn(
        &self,
        event: Arc<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let event = event.downcast::<E>().map_err(|_| {
            anyhow::anyhow!("事件类型不匹配，期望 {}", std::any::type_name::<E>())
        })?;
        self.handler.handle(event, cancel).await
    }
}

type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// 处理器已被释放时返回 `None`
type DispatchFn = Box<
    dyn Fn(&Arc<dyn Any + Send + Sync>, &CancellationToken) -> Option<HandlerFuture> + Send + Sync,
>;

struct Subscriber {
    id: u64,
    dispatch: DispatchFn,
}

type SubscriberMap = HashMap<TypeId, Vec<Subscriber>>;

/// 订阅凭证
///
/// `dispose` 立即移除订阅，可重复调用。凭证被丢弃时不会自动退订，
/// 订阅的生命周期由处理器本身的持有方决定。
pub struct Subscription {
    id: u64,
    event_type: TypeId,
    subscribers: Weak<RwLock<SubscriberMap>>,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(subscribers) = self.subscribers.upgrade() else {
            return;
        };

        let mut map = subscribers.write();
        if let Some(list) = map.get_mut(&self.event_type) {
            list.retain(|s| s.id != self.id);
            if list.is_empty() {
                map.remove(&self.event_type);
            }
        }
        debug!(subscription_id = self.id, "订阅已退订");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// 事件聚合器
#[derive(Clone)]
pub struct EventAggregator {
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: Arc<AtomicU64>,
    external_resolver: Option<Arc<dyn ExternalResolver>>,
    resolve_external: bool,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(None, false)
    }
}

impl EventAggregator {
    /// `resolve_external` 为真且配置了外部解析器时，发布时附加外部处理器
    pub fn new(
        external_resolver: Option<Arc<dyn ExternalResolver>>,
        resolve_external: bool,
    ) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            external_resolver,
            resolve_external,
        }
    }

    /// 订阅事件，聚合器只持有处理器的弱引用
    pub fn subscribe<E, H>(&self, handler: &Arc<H>) -> Subscription
    where
        E: Send + Sync + 'static,
        H: EventHandler<E>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(handler);

        // 订阅按 TypeId::of::<E>() 登记，只会收到运行时类型为 E 的事件
        let dispatch: DispatchFn = Box::new(move |event, cancel| {
            let handler = weak.upgrade()?;
            let event = event.clone();
            let cancel = cancel.clone();
            Some(Box::pin(async move {
                let event = event.downcast::<E>().map_err(|_| {
                    anyhow::anyhow!("事件类型不匹配，期望 {}", std::any::type_name::<E>())
                })?;
                handler.handle(event, cancel).await
            }) as HandlerFuture)
        });

        self.subscribers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Subscriber { id, dispatch });

        debug!(
            subscription_id = id,
            event_type = std::any::type_name::<E>(),
            "事件订阅已添加"
        );

        Subscription {
            id,
            event_type: TypeId::of::<E>(),
            subscribers: Arc::downgrade(&self.subscribers),
            disposed: AtomicBool::new(false),
        }
    }

    /// 指定事件类型当前登记的订阅条目数（含尚未清理的失效条目）
    pub fn subscriber_count<E: 'static>(&self) -> usize {
        self.subscribers
            .read()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// 发布事件
    pub async fn publish<E>(&self, event: E, cancel: &CancellationToken, mode: DispatchMode)
    where
        E: Send + Sync + 'static,
    {
        self.publish_dyn(EventType::of::<E>(), Arc::new(event), cancel, mode)
            .await
    }

    /// 发布类型擦除的事件
    ///
    /// 本地订阅者按事件值的具体运行时类型匹配；`event_type` 用于外部解析和日志。
    #[instrument(
        skip(self, event_type, event, cancel, mode),
        fields(event_type = event_type.short_name(), mode = %mode)
    )]
    pub async fn publish_dyn(
        &self,
        event_type: EventType,
        event: Arc<dyn Any + Send + Sync>,
        cancel: &CancellationToken,
        mode: DispatchMode,
    ) {
        let mut handlers = self.local_handlers(&event, cancel);
        handlers.extend(self.external_handlers(event_type, &event, cancel));

        record_event_dispatch(event_type.short_name(), &mode.to_string(), handlers.len());

        if handlers.is_empty() {
            debug!("没有可用的事件处理器");
            return;
        }

        match mode {
            DispatchMode::Detached => {
                for handler in handlers {
                    tokio::spawn(async move {
                        if let Err(e) = handler.await {
                            warn!(error = %e, "事件处理失败");
                        }
                    });
                }
            }
            DispatchMode::Joined => {
                let tasks: Vec<_> = handlers.into_iter().map(tokio::spawn).collect();

                for result in join_all(tasks).await {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "事件处理失败"),
                        Err(e) => error!(error = %e, "事件处理器异常终止"),
                    }
                }
            }
        }
    }

    fn local_handlers(
        &self,
        event: &Arc<dyn Any + Send + Sync>,
        cancel: &CancellationToken,
    ) -> Vec<HandlerFuture> {
        let runtime_type = (**event).type_id();
        let mut runs = Vec::new();
        let mut pruned = 0usize;

        let mut map = self.subscribers.write();
        if let Some(list) = map.get_mut(&runtime_type) {
            list.retain(|subscriber| match (subscriber.dispatch)(event, cancel) {
                Some(future) => {
                    runs.push(future);
                    true
                }
                None => {
                    pruned += 1;
                    false
                }
            });

            if list.is_empty() {
                map.remove(&runtime_type);
            }
        }

        if pruned > 0 {
            debug!(pruned, "已清理失效的事件订阅");
        }

        runs
    }

    fn external_handlers(
        &self,
        event_type: EventType,
        event: &Arc<dyn Any + Send + Sync>,
        cancel: &CancellationToken,
    ) -> Vec<HandlerFuture> {
        if !self.resolve_external {
            return Vec::new();
        }
        let Some(resolver) = &self.external_resolver else {
            return Vec::new();
        };

        match resolver.resolve_event_handlers(&event_type) {
            Ok(handlers) => handlers
                .into_iter()
                .map(|handler| {
                    let event = event.clone();
                    let cancel = cancel.clone();
                    Box::pin(async move { handler.handle_dyn(event, cancel).await }) as HandlerFuture
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "解析外部事件处理器失败");
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for EventAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAggregator")
            .field("event_types", &self.subscribers.read().len())
            .field("resolve_external", &self.resolve_external)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MockExternalResolver;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct Ping(u32);

    #[derive(Debug)]
    struct Pong;

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<Ping> for Counter {
        async fn handle(&self, event: Arc<Ping>, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.seen.fetch_add(event.0 as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler<Ping> for Failing {
        async fn handle(&self, _event: Arc<Ping>, _cancel: CancellationToken) -> anyhow::Result<()> {
            anyhow::bail!("处理失败")
        }
    }

    #[tokio::test]
    async fn test_joined_publish_reaches_subscribers() {
        let aggregator = EventAggregator::default();
        let counter = Arc::new(Counter::default());
        let _subscription = aggregator.subscribe::<Ping, _>(&counter);

        let cancel = CancellationToken::new();
        aggregator.publish(Ping(2), &cancel, DispatchMode::Joined).await;
        aggregator.publish(Ping(3), &cancel, DispatchMode::Joined).await;
        aggregator.publish(Pong, &cancel, DispatchMode::Joined).await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 5);
    }

    #[derive(Default)]
    struct PongCounter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler<Pong> for PongCounter {
        async fn handle(&self, _event: Arc<Pong>, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_local_routing_uses_runtime_type() {
        let aggregator = EventAggregator::default();
        let pings = Arc::new(Counter::default());
        let pongs = Arc::new(PongCounter::default());
        let _a = aggregator.subscribe::<Ping, _>(&pings);
        let _b = aggregator.subscribe::<Pong, _>(&pongs);

        // 声明的事件类型只用于日志和外部解析
        aggregator
            .publish_dyn(
                EventType::of::<Pong>(),
                Arc::new(Ping(4)),
                &CancellationToken::new(),
                DispatchMode::Joined,
            )
            .await;

        assert_eq!(pings.seen.load(Ordering::SeqCst), 4);
        assert_eq!(pongs.seen.load(Ordering::SeqCst), 0);
        assert_eq!(aggregator.subscriber_count::<Ping>(), 1);
        assert_eq!(aggregator.subscriber_count::<Pong>(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_swallowed() {
        let aggregator = EventAggregator::default();
        let counter = Arc::new(Counter::default());
        let failing = Arc::new(Failing);
        let _a = aggregator.subscribe::<Ping, _>(&failing);
        let _b = aggregator.subscribe::<Ping, _>(&counter);

        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Joined)
            .await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let aggregator = EventAggregator::default();
        let counter = Arc::new(Counter::default());
        let subscription = aggregator.subscribe::<Ping, _>(&counter);

        subscription.dispose();
        subscription.dispose();
        assert!(subscription.is_disposed());
        assert_eq!(aggregator.subscriber_count::<Ping>(), 0);

        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Joined)
            .await;
        assert_eq!(counter.seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_handler_pruned_on_publish() {
        let aggregator = EventAggregator::default();
        let counter = Arc::new(Counter::default());
        let _subscription = aggregator.subscribe::<Ping, _>(&counter);

        drop(counter);
        assert_eq!(aggregator.subscriber_count::<Ping>(), 1);

        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Joined)
            .await;
        assert_eq!(aggregator.subscriber_count::<Ping>(), 0);
    }

    #[tokio::test]
    async fn test_external_handlers() {
        let counter = Arc::new(Counter::default());
        let external_counter = counter.clone();

        let mut resolver = MockExternalResolver::new();
        resolver
            .expect_resolve_event_handlers()
            .withf(|event_type| *event_type == EventType::of::<Ping>())
            .times(1)
            .returning(move |_| {
                Ok(vec![
                    Arc::new(HandlerAdapter::<Ping, _>::new(external_counter.clone()))
                        as Arc<dyn DynEventHandler>,
                ])
            });

        let aggregator = EventAggregator::new(Some(Arc::new(resolver)), true);
        aggregator
            .publish(Ping(4), &CancellationToken::new(), DispatchMode::Joined)
            .await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_external_resolution_failure_means_no_handlers() {
        let mut resolver = MockExternalResolver::new();
        resolver
            .expect_resolve_event_handlers()
            .returning(|_| Err(anyhow::anyhow!("容器已释放")));

        let aggregator = EventAggregator::new(Some(Arc::new(resolver)), true);
        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Joined)
            .await;
    }

    #[tokio::test]
    async fn test_external_resolution_disabled() {
        let mut resolver = MockExternalResolver::new();
        resolver.expect_resolve_event_handlers().never();

        let aggregator = EventAggregator::new(Some(Arc::new(resolver)), false);
        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Detached)
            .await;
    }

    #[tokio::test]
    async fn test_detached_publish_does_not_wait() {
        struct Slow(Arc<AtomicUsize>);

        #[async_trait]
        impl EventHandler<Ping> for Slow {
            async fn handle(&self, _event: Arc<Ping>, _cancel: CancellationToken) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let done = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Slow(done.clone()));
        let aggregator = EventAggregator::default();
        let _subscription = aggregator.subscribe::<Ping, _>(&handler);

        aggregator
            .publish(Ping(1), &CancellationToken::new(), DispatchMode::Detached)
            .await;
        assert_eq!(done.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
