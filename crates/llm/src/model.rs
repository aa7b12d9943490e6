use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Static display metadata for one servable model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub vram_required_mb: Option<f64>,
    pub context_window_size: Option<u32>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: None,
            vram_required_mb: None,
            context_window_size: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_vram_required_mb(mut self, vram_required_mb: f64) -> Self {
        self.vram_required_mb = Some(vram_required_mb);
        self
    }

    pub fn with_context_window_size(mut self, context_window_size: u32) -> Self {
        self.context_window_size = Some(context_window_size);
        self
    }
}

pub const DEFAULT_MODEL_ID: &str = "Llama-3.2-1B-Instruct-q4f16_1-MLC";

/// Immutable id -> descriptor mapping built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// Builds a registry from an explicit list. Duplicate ids keep the first entry.
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        let mut unique: Vec<ModelDescriptor> = Vec::with_capacity(models.len());
        for model in models {
            if !unique.iter().any(|existing| existing.id == model.id) {
                unique.push(model);
            }
        }
        Self { models: unique }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_models())
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn find(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.find(model_id).is_some()
    }

    /// Returns the preferred default, falling back to the first registered model.
    pub fn default_model_id(&self) -> &str {
        if self.contains(DEFAULT_MODEL_ID) {
            return DEFAULT_MODEL_ID;
        }

        self.models
            .first()
            .map(|model| model.id.as_str())
            .unwrap_or(DEFAULT_MODEL_ID)
    }

    pub fn display_name<'a>(&'a self, model_id: &'a str) -> &'a str {
        self.find(model_id)
            .map(|model| model.display_name.as_str())
            .unwrap_or(model_id)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

pub fn builtin_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new(DEFAULT_MODEL_ID, "Llama 3.2 1B Instruct")
            .with_description("Small and fast, good default for laptops")
            .with_vram_required_mb(879.04)
            .with_context_window_size(4096),
        ModelDescriptor::new("Llama-3.2-3B-Instruct-q4f16_1-MLC", "Llama 3.2 3B Instruct")
            .with_description("Better answers, roughly twice the memory")
            .with_vram_required_mb(2263.69)
            .with_context_window_size(4096),
        ModelDescriptor::new("Phi-3.5-mini-instruct-q4f16_1-MLC", "Phi 3.5 Mini Instruct")
            .with_description("Strong reasoning for its size")
            .with_vram_required_mb(3672.07)
            .with_context_window_size(4096),
        ModelDescriptor::new("Qwen2.5-1.5B-Instruct-q4f16_1-MLC", "Qwen 2.5 1.5B Instruct")
            .with_description("Multilingual small model")
            .with_vram_required_mb(1629.75)
            .with_context_window_size(4096),
        ModelDescriptor::new("gemma-2-2b-it-q4f16_1-MLC", "Gemma 2 2B Instruct")
            .with_vram_required_mb(1895.3)
            .with_context_window_size(4096),
    ]
}

/// Where a backend keeps whatever it caches while loading a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// Shared for the whole process and reused across engine instances.
    Persistent,
    /// Owned by one engine instance and dropped with it.
    Ephemeral,
}

impl CacheBackend {
    pub fn from_flag(use_persistent_cache: bool) -> Self {
        if use_persistent_cache {
            Self::Persistent
        } else {
            Self::Ephemeral
        }
    }
}

/// Engine-wide configuration handed to `EngineFactory::create_engine`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub model_list: Vec<ModelDescriptor>,
    pub use_persistent_cache: bool,
}

impl AppConfig {
    pub fn new(registry: &ModelRegistry, use_persistent_cache: bool) -> Self {
        Self {
            model_list: registry.models().to_vec(),
            use_persistent_cache,
        }
    }

    pub fn find_model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.model_list.iter().find(|model| model.id == model_id)
    }

    pub fn cache_backend(&self) -> CacheBackend {
        CacheBackend::from_flag(self.use_persistent_cache)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new(&ModelRegistry::builtin(), true)
    }
}

struct CacheEntry {
    model_ids: Vec<String>,
    fetched_at: Instant,
}

/// Served-model catalog cache keyed by endpoint.
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }

    pub async fn get_fresh(&self, endpoint: &str) -> Option<Vec<String>> {
        let entries = self.entries.read().await;
        entries.get(endpoint).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.model_ids.clone())
            } else {
                None
            }
        })
    }

    pub async fn set(&self, endpoint: &str, model_ids: Vec<String>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            endpoint.to_string(),
            CacheEntry {
                model_ids,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

static MODEL_CACHE: OnceLock<Arc<ModelCache>> = OnceLock::new();

pub fn get_model_cache() -> Arc<ModelCache> {
    MODEL_CACHE
        .get_or_init(|| Arc::new(ModelCache::with_default_ttl()))
        .clone()
}

/// Resolves the cache instance matching a cache backend choice.
pub fn model_cache_for(backend: CacheBackend) -> Arc<ModelCache> {
    match backend {
        CacheBackend::Persistent => get_model_cache(),
        CacheBackend::Ephemeral => Arc::new(ModelCache::with_default_ttl()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_default_and_display_names() {
        let registry = ModelRegistry::builtin();

        assert_eq!(registry.default_model_id(), DEFAULT_MODEL_ID);
        assert_eq!(
            registry.display_name(DEFAULT_MODEL_ID),
            "Llama 3.2 1B Instruct"
        );
        assert_eq!(registry.display_name("not-registered"), "not-registered");
    }

    #[test]
    fn registry_drops_duplicate_ids_and_falls_back_to_first_model() {
        let registry = ModelRegistry::new(vec![
            ModelDescriptor::new("a", "First"),
            ModelDescriptor::new("a", "Shadowed"),
            ModelDescriptor::new("b", "Second"),
        ]);

        assert_eq!(registry.models().len(), 2);
        assert_eq!(registry.display_name("a"), "First");
        assert_eq!(registry.default_model_id(), "a");
    }

    #[tokio::test]
    async fn persistent_cache_is_shared_and_ephemeral_is_not() {
        let persistent = model_cache_for(CacheBackend::Persistent);
        persistent
            .set("http://cache-test.invalid", vec!["m".to_string()])
            .await;

        let shared = model_cache_for(CacheBackend::Persistent);
        assert_eq!(
            shared.get_fresh("http://cache-test.invalid").await,
            Some(vec!["m".to_string()])
        );

        let ephemeral = model_cache_for(CacheBackend::Ephemeral);
        assert_eq!(ephemeral.get_fresh("http://cache-test.invalid").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_not_fresh() {
        let cache = ModelCache::new(Duration::ZERO);
        cache.set("endpoint", vec!["m".to_string()]).await;

        assert_eq!(cache.get_fresh("endpoint").await, None);
    }
}
