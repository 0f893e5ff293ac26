//! 并发缓存
//!
//! 规则和条件评估器都存放在此缓存中。值按 [`CacheKey`]（名称、租户、文化）寻址，
//! `get_or_create` 通过按键加锁保证同一个键的工厂函数在并发下只执行一次，
//! 不同键之间互不阻塞。

use dashmap::DashMap;
use parking_lot::Mutex;
use rules_shared::config::{DEFAULT_CULTURE, DEFAULT_TENANT};
use rules_shared::observability::metrics::record_cache_lookup;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::CacheError;

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub item_name: String,
    pub tenant_id: String,
    pub culture_id: String,
}

impl CacheKey {
    pub fn new(
        item_name: impl Into<String>,
        tenant_id: impl Into<String>,
        culture_id: impl Into<String>,
    ) -> Self {
        Self {
            item_name: item_name.into(),
            tenant_id: tenant_id.into(),
            culture_id: culture_id.into(),
        }
    }

    /// 使用默认租户和文化
    pub fn item(item_name: impl Into<String>) -> Self {
        Self::new(item_name, DEFAULT_TENANT, DEFAULT_CULTURE)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.item_name, self.tenant_id, self.culture_id)
    }
}

/// 被替换或删除时需要释放资源的缓存值
pub trait Disposable {
    fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
    fn dispose(&self) -> anyhow::Result<()> {
        (**self).dispose()
    }
}

/// 线程安全缓存
pub struct Cache<V> {
    name: &'static str,
    entries: DashMap<CacheKey, V>,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

impl<V> Cache<V>
where
    V: Clone + Disposable,
{
    /// `name` 仅用于日志和指标标签
    pub fn new(name: &'static str, lock_timeout: Duration) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            locks: DashMap::new(),
            lock_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn try_get(&self, key: &CacheKey) -> Option<V> {
        let value = self.entries.get(key).map(|entry| entry.value().clone());
        record_cache_lookup(self.name, value.is_some());
        value
    }

    /// 获取或创建
    ///
    /// 命中时直接返回；未命中时持有该键的锁再检查一次，仍未命中才调用工厂函数。
    /// 在 `lock_timeout` 内拿不到键锁返回 [`CacheError::LockTimeout`]。
    pub fn get_or_create<F, E>(&self, key: &CacheKey, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: From<CacheError>,
    {
        if let Some(value) = self.try_get(key) {
            return Ok(value);
        }

        let created = self.with_key_lock(key, || -> Result<V, E> {
            if let Some(entry) = self.entries.get(key) {
                return Ok(entry.value().clone());
            }

            let value = factory()?;
            self.entries.insert(key.clone(), value.clone());
            debug!(cache = self.name, key = %key, "缓存值已创建");
            Ok(value)
        })?;

        if created.is_err() {
            self.prune_lock(key);
        }
        created
    }

    /// 新增或替换
    ///
    /// 被替换的旧值会被释放，释放失败只记录日志。
    #[instrument(skip(self, key, value), fields(cache = self.name, key = %key))]
    pub fn upsert(&self, key: &CacheKey, value: V) -> Result<(), CacheError> {
        let previous = self.with_key_lock(key, || self.entries.insert(key.clone(), value))?;

        if let Some(previous) = previous {
            if let Err(e) = previous.dispose() {
                warn!(error = %e, "释放被替换的缓存值失败");
            }
        }

        Ok(())
    }

    /// 删除
    ///
    /// 被删除的值会被释放，释放失败以 [`CacheError::Disposal`] 返回，
    /// 此时条目已经从缓存中移除。
    #[instrument(skip(self, key), fields(cache = self.name, key = %key))]
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.with_key_lock(key, || self.entries.remove(key))?;
        self.prune_lock(key);

        match removed {
            Some((_, previous)) => {
                previous.dispose().map_err(|source| CacheError::Disposal {
                    key: key.to_string(),
                    source,
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 按条件删除，返回删除的条目数
    ///
    /// 逐键持锁删除，正在创建中的同名值会先等待其写入再删除。
    /// 释放失败和锁超时只记录日志。
    pub fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let keys: HashSet<CacheKey> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .chain(self.locks.iter().map(|l| l.key().clone()))
            .filter(|key| predicate(key))
            .collect();

        let mut removed = 0;
        for key in keys {
            match self.with_key_lock(&key, || self.entries.remove(&key)) {
                Ok(Some((_, value))) => {
                    removed += 1;
                    if let Err(e) = value.dispose() {
                        warn!(cache = self.name, key = %key, error = %e, "删除缓存值时释放失败");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(cache = self.name, error = %e, "跳过无法加锁的缓存键"),
            }
            self.prune_lock(&key);
        }

        removed
    }

    /// 清空缓存，逐个释放值，释放失败只记录日志
    pub fn clear(&self) {
        let removed = self.remove_where(|_| true);
        debug!(cache = self.name, removed, "缓存已清空");
    }

    /// 持有键锁执行 `f`
    fn with_key_lock<R>(&self, key: &CacheKey, f: impl FnOnce() -> R) -> Result<R, CacheError> {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let _guard = lock
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| self.timeout_error(key))?;
        Ok(f())
    }

    /// 键锁只被锁表持有时移除，锁表大小以存活的键为界
    fn prune_lock(&self, key: &CacheKey) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn timeout_error(&self, key: &CacheKey) -> CacheError {
        warn!(cache = self.name, key = %key, "获取缓存键锁超时");
        CacheError::LockTimeout {
            key: key.to_string(),
            timeout_ms: self.lock_timeout.as_millis() as u64,
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug)]
    struct Tracked {
        id: u32,
        disposals: Arc<AtomicUsize>,
        fail_dispose: bool,
    }

    impl Tracked {
        fn new(id: u32, disposals: &Arc<AtomicUsize>) -> Self {
            Self {
                id,
                disposals: disposals.clone(),
                fail_dispose: false,
            }
        }

        fn failing(mut self) -> Self {
            self.fail_dispose = true;
            self
        }
    }

    impl Disposable for Tracked {
        fn dispose(&self) -> anyhow::Result<()> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            if self.fail_dispose {
                anyhow::bail!("dispose failed for {}", self.id);
            }
            Ok(())
        }
    }

    fn cache() -> Cache<Tracked> {
        Cache::new("test", Duration::from_millis(200))
    }

    #[test]
    fn test_cache_key_defaults() {
        let key = CacheKey::item("rule");
        assert_eq!(key.tenant_id, "All_Tenants");
        assert_eq!(key.culture_id, "en-GB");
        assert_eq!(key.to_string(), "rule|All_Tenants|en-GB");
        assert_ne!(key, CacheKey::new("rule", "tenant-a", "en-GB"));
    }

    #[test]
    fn test_upsert_replaces_and_disposes_previous() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();
        let key = CacheKey::item("k");

        cache.upsert(&key, Tracked::new(1, &disposals)).unwrap();
        cache.upsert(&key, Tracked::new(2, &disposals)).unwrap();

        assert_eq!(cache.try_get(&key).map(|v| v.id), Some(2));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upsert_swallows_disposal_error() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();
        let key = CacheKey::item("k");

        cache
            .upsert(&key, Tracked::new(1, &disposals).failing())
            .unwrap();
        let replaced = cache.upsert(&key, Tracked::new(2, &disposals));

        assert!(replaced.is_ok());
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(cache.try_get(&key).map(|v| v.id), Some(2));
    }

    /// 把日志输出收集到内存
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_swallowed_disposal_error_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();

        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();
        let key = CacheKey::item("logged");

        tracing::subscriber::with_default(subscriber, || {
            cache
                .upsert(&key, Tracked::new(1, &disposals).failing())
                .unwrap();
            cache.upsert(&key, Tracked::new(2, &disposals)).unwrap();
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("释放被替换的缓存值失败"));
        assert!(output.contains("dispose failed for 1"));
    }

    #[test]
    fn test_remove_propagates_disposal_error() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();
        let key = CacheKey::item("k");

        cache
            .upsert(&key, Tracked::new(1, &disposals).failing())
            .unwrap();
        let err = cache.remove(&key).unwrap_err();

        assert!(matches!(err, CacheError::Disposal { .. }));
        assert!(!cache.contains(&key));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_missing_key() {
        let cache = cache();
        assert!(!cache.remove(&CacheKey::item("missing")).unwrap());
    }

    #[test]
    fn test_get_or_create_runs_factory_once_under_contention() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let key = CacheKey::item("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                let disposals = disposals.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_create::<_, CacheError>(&key, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok(Tracked::new(7, &disposals))
                        })
                        .unwrap()
                        .id
                })
            })
            .collect();

        let ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == 7));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_create_factory_error_leaves_cache_empty() {
        let cache = cache();
        let key = CacheKey::item("k");

        let result = cache.get_or_create(&key, || Err(CacheError::LockTimeout {
            key: "factory".into(),
            timeout_ms: 0,
        }));

        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lock_timeout() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(Cache::<Tracked>::new("test", Duration::from_millis(20)));
        let key = CacheKey::item("slow");
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let cache = cache.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            let disposals = disposals.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_create::<_, CacheError>(&key, || {
                        barrier.wait();
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(Tracked::new(1, &disposals))
                    })
                    .map(|v| v.id)
            })
        };

        barrier.wait();
        let err = cache
            .get_or_create::<_, CacheError>(&key, || Ok(Tracked::new(2, &disposals)))
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { timeout_ms: 20, .. }));

        assert_eq!(holder.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_clear_disposes_all() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();

        cache.upsert(&CacheKey::item("a"), Tracked::new(1, &disposals)).unwrap();
        cache
            .upsert(&CacheKey::item("b"), Tracked::new(2, &disposals).failing())
            .unwrap();
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(disposals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lock_entries_pruned_after_remove_and_failed_create() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = cache();

        for i in 0..10 {
            let key = CacheKey::item(format!("k{i}"));
            cache.upsert(&key, Tracked::new(i, &disposals)).unwrap();
            cache.remove(&key).unwrap();
        }
        assert_eq!(cache.locks.len(), 0);

        let key = CacheKey::item("broken");
        let result = cache.get_or_create(&key, || {
            Err(CacheError::LockTimeout {
                key: "factory".into(),
                timeout_ms: 0,
            })
        });
        assert!(result.is_err());
        assert_eq!(cache.locks.len(), 0);

        cache.upsert(&CacheKey::item("live"), Tracked::new(1, &disposals)).unwrap();
        assert_eq!(cache.locks.len(), 1);
        cache.clear();
        assert_eq!(cache.locks.len(), 0);
    }

    #[test]
    fn test_remove_where_waits_for_in_flight_creation() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(Cache::<Tracked>::new("test", Duration::from_secs(2)));
        let key = CacheKey::item("stale<T>");
        let barrier = Arc::new(Barrier::new(2));

        let creator = {
            let cache = cache.clone();
            let key = key.clone();
            let barrier = barrier.clone();
            let disposals = disposals.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_create::<_, CacheError>(&key, || {
                        barrier.wait();
                        std::thread::sleep(Duration::from_millis(150));
                        Ok(Tracked::new(1, &disposals))
                    })
                    .map(|v| v.id)
            })
        };

        barrier.wait();
        cache
            .upsert(&CacheKey::item("other"), Tracked::new(2, &disposals))
            .unwrap();
        let removed = cache.remove_where(|k| k.item_name.starts_with("stale"));

        assert_eq!(creator.join().unwrap().unwrap(), 1);
        assert_eq!(removed, 1);
        assert!(!cache.contains(&key));
        assert!(cache.contains(&CacheKey::item("other")));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
