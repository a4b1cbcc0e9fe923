//! Extension catalog: entry points the host knows how to instantiate.
//!
//! A manifest's `entry_point` is a key into this catalog. Hosts register a
//! factory per entry point; bundled extensions also carry their manifest, so
//! they load without a directory on disk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::context::ExtensionContext;
use crate::manifest::ExtensionDescriptor;

/// The code side of an extension.
///
/// `load` runs once, during the load pass, and should only register things
/// through the context. `start` runs after every extension has loaded; `stop`
/// runs during shutdown or unload, in reverse load order. Handlers may keep a
/// clone of the context.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn load(&self, ctx: &Arc<ExtensionContext>) -> parley_core::Result<()>;

    async fn start(&self, _ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
        Ok(())
    }
}

/// Creates a fresh extension instance.
pub type ExtensionFactory = Arc<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Entry points available to the loader.
#[derive(Default, Clone)]
pub struct Catalog {
    factories: BTreeMap<String, ExtensionFactory>,
    bundled: Vec<ExtensionDescriptor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `entry_point`, replacing any previous one.
    pub fn register(&mut self, entry_point: impl Into<String>, factory: ExtensionFactory) {
        let entry_point = entry_point.into();
        info!(entry_point = %entry_point, "Registered extension entry point");
        self.factories.insert(entry_point, factory);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, entry_point: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Extension> + Send + Sync + 'static,
    {
        self.register(entry_point, Arc::new(factory));
        self
    }

    /// Register a built-in extension together with its manifest.
    pub fn bundled<F>(mut self, descriptor: ExtensionDescriptor, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Extension> + Send + Sync + 'static,
    {
        self.register(descriptor.entry_point.clone(), Arc::new(factory));
        self.bundled.retain(|d| d.name != descriptor.name);
        self.bundled.push(descriptor);
        self
    }

    /// A new instance for `entry_point`, if registered.
    pub fn instantiate(&self, entry_point: &str) -> Option<Box<dyn Extension>> {
        self.factories.get(entry_point).map(|factory| factory())
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    pub fn entry_points(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Manifests of built-in extensions.
    pub fn bundled_descriptors(&self) -> &[ExtensionDescriptor] {
        &self.bundled
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("entry_points", &self.entry_points())
            .field("bundled", &self.bundled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl Extension for Nothing {
        async fn load(&self, _ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bundled_registers_entry_point_and_manifest() {
        let descriptor = ExtensionDescriptor::from_toml(
            "name = \"echo\"\nversion = \"0.1.0\"\nentry_point = \"builtin-echo\"",
            "echo",
        )
        .unwrap();
        let catalog = Catalog::new()
            .bundled(descriptor.clone(), || Box::new(Nothing))
            .bundled(descriptor, || Box::new(Nothing));

        assert!(catalog.contains("builtin-echo"));
        assert!(!catalog.contains("echo"));
        assert_eq!(catalog.bundled_descriptors().len(), 1);
        assert!(catalog.instantiate("builtin-echo").is_some());
        assert!(catalog.instantiate("missing").is_none());
    }
}
