// =============================================================================
// Source Registry: name → shared data source
// =============================================================================
//
// Built once at startup, read-only afterwards.  Lookups are by exact name;
// a miss is the caller's problem (the orchestrator turns it into a task
// failure).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::DataSource;

/// Immutable mapping from source name to implementation.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn builder() -> SourceRegistryBuilder {
        SourceRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for name in self.names() {
            if let Some(source) = self.sources.get(name) {
                map.entry(&name, &source.kind());
            }
        }
        map.finish()
    }
}

/// Collects registrations; `build` freezes them.
#[derive(Default)]
pub struct SourceRegistryBuilder {
    entries: Vec<(String, Arc<dyn DataSource>)>,
}

impl SourceRegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, source: impl DataSource + 'static) -> Self {
        let source: Arc<dyn DataSource> = Arc::new(source);
        self.entries.push((name.into(), source));
        self
    }

    /// Register an already shared source.
    pub fn register_shared(mut self, name: impl Into<String>, source: Arc<dyn DataSource>) -> Self {
        self.entries.push((name.into(), source));
        self
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn build(self) -> SourceRegistry {
        let mut sources = HashMap::with_capacity(self.entries.len());
        for (name, source) in self.entries {
            let kind = source.kind();
            if let Some(previous) = sources.insert(name.clone(), source) {
                warn!(
                    source = %name,
                    replaced = previous.kind(),
                    by = kind,
                    "data source registered twice; keeping the last one"
                );
            }
        }

        let registry = SourceRegistry { sources };
        info!(sources = ?registry.names(), "source registry built");
        registry
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchParams;
    use crate::error::FetchError;
    use crate::sources::SourceBatch;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl DataSource for Named {
        fn kind(&self) -> &'static str {
            self.0
        }

        async fn fetch(&self, _params: &FetchParams) -> Result<SourceBatch, FetchError> {
            Ok(SourceBatch::default())
        }
    }

    #[test]
    fn lookup_by_exact_name() {
        let registry = SourceRegistry::builder()
            .register("binance", Named("binance"))
            .register("file", Named("file"))
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("binance"));
        assert!(!registry.contains("Binance"));
        assert_eq!(registry.get("file").map(|s| s.kind()), Some("file"));
        assert!(registry.get("kraken").is_none());
        assert_eq!(registry.names(), vec!["binance", "file"]);
    }

    #[test]
    fn last_registration_wins() {
        let registry = SourceRegistry::builder()
            .register("binance", Named("first"))
            .register("binance", Named("second"))
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("binance").map(|s| s.kind()), Some("second"));
    }

    #[test]
    fn empty_registry() {
        let registry = SourceRegistry::builder().build();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
        assert_eq!(format!("{registry:?}"), "{}");
    }
}
