//! 丰富阶段：资产层级 + 生产上下文（排产、班次、配方）。

use crate::PipelineError;
use async_trait::async_trait;
use domain::AssetRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// 机台当前的生产上下文。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductionContext {
    pub schedule: Option<String>,
    pub shift: Option<String>,
    pub recipe: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ProductionContext {
    pub fn is_empty(&self) -> bool {
        self.schedule.is_none()
            && self.shift.is_none()
            && self.recipe.is_none()
            && self.extra.is_empty()
    }

    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.extra.clone();
        for (key, value) in [
            ("schedule", &self.schedule),
            ("shift", &self.shift),
            ("recipe", &self.recipe),
        ] {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        metadata
    }
}

/// 生产上下文提供者（MES 等外部协作方）。
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context(&self, machine_id: &str) -> Result<Option<ProductionContext>, PipelineError>;
}

/// 无上下文（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn context(&self, _machine_id: &str) -> Result<Option<ProductionContext>, PipelineError> {
        Ok(None)
    }
}

/// 内存上下文表。
#[derive(Debug, Default)]
pub struct StaticContextProvider {
    contexts: RwLock<HashMap<String, ProductionContext>>,
}

impl StaticContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, machine_id: impl Into<String>, context: ProductionContext) {
        self.contexts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(machine_id.into(), context);
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn context(&self, machine_id: &str) -> Result<Option<ProductionContext>, PipelineError> {
        Ok(self
            .contexts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(machine_id)
            .cloned())
    }
}

/// 按机台缓存上下文，过期后重新查询；查询失败按空上下文处理且不缓存。
pub struct CachedContext {
    provider: Arc<dyn ContextProvider>,
    ttl: Duration,
    entries: HashMap<String, (Instant, Arc<ProductionContext>)>,
}

impl CachedContext {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(provider: Arc<dyn ContextProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            entries: HashMap::new(),
        }
    }

    pub async fn get(&mut self, machine_id: &str) -> Arc<ProductionContext> {
        let now = Instant::now();
        if let Some((fetched_at, context)) = self.entries.get(machine_id)
            && now.duration_since(*fetched_at) < self.ttl
        {
            return Arc::clone(context);
        }
        match self.provider.context(machine_id).await {
            Ok(context) => {
                let context = Arc::new(context.unwrap_or_default());
                self.entries
                    .insert(machine_id.to_string(), (now, Arc::clone(&context)));
                context
            }
            Err(err) => {
                warn!(
                    target: "edge.pipeline",
                    machine_id,
                    error = %err,
                    "context_lookup_failed"
                );
                Arc::new(ProductionContext::default())
            }
        }
    }
}

/// 组合资产路径与上下文元数据。
pub(crate) async fn enrichment(
    assets: &AssetRegistry,
    contexts: &mut CachedContext,
    machine_id: &str,
) -> BTreeMap<String, String> {
    let mut metadata = assets
        .resolve(machine_id)
        .map(|path| path.to_metadata())
        .unwrap_or_default();
    let context = contexts.get(machine_id).await;
    metadata.extend(context.to_metadata());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::AssetPath;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ContextProvider for CountingProvider {
        async fn context(
            &self,
            _machine_id: &str,
        ) -> Result<Option<ProductionContext>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Context("mes unreachable".to_string()));
            }
            Ok(Some(ProductionContext {
                shift: Some("B".to_string()),
                ..ProductionContext::default()
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn context_cached_until_ttl() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut cache = CachedContext::new(provider.clone(), CachedContext::DEFAULT_TTL);
        assert_eq!(cache.get("press-01").await.shift.as_deref(), Some("B"));
        cache.get("press-01").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.get("press-01").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lookup_error_gives_empty_context() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut cache = CachedContext::new(provider.clone(), CachedContext::DEFAULT_TTL);
        assert!(cache.get("press-01").await.is_empty());
        cache.get("press-01").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn metadata_combines_assets_and_context() {
        let assets = AssetRegistry::new([AssetPath {
            site: "plant-a".to_string(),
            area: "stamping".to_string(),
            line: "line-1".to_string(),
            cell: "cell-3".to_string(),
            machine: "press-01".to_string(),
        }]);
        let provider = Arc::new(StaticContextProvider::new());
        provider.set(
            "press-01",
            ProductionContext {
                recipe: Some("R-17".to_string()),
                ..ProductionContext::default()
            },
        );
        let mut cache = CachedContext::new(provider, CachedContext::DEFAULT_TTL);
        let metadata = enrichment(&assets, &mut cache, "press-01").await;
        assert_eq!(metadata.get("line").map(String::as_str), Some("line-1"));
        assert_eq!(metadata.get("recipe").map(String::as_str), Some("R-17"));

        let unknown = enrichment(&assets, &mut cache, "lathe-9").await;
        assert!(unknown.is_empty());
    }
}
