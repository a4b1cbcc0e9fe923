//! The extension loader.
//!
//! Loading one extension:
//! 1. instantiate its entry point from the [`Catalog`]
//! 2. declare the manifest's `[config]` settings
//! 3. run `Extension::load`, which stages registrations in its context
//! 4. check the staged capabilities against the manifest declarations
//! 5. commit settings, then capabilities, then subscriptions
//!
//! Any failure rolls back what was committed for that extension and is
//! reported against it. Extensions that require it are skipped.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parley_core::capability::{CapabilityKind, CapabilitySummary, Handler};
use parley_core::error::{CapabilityError, DependencyError, Error, LoadError};
use parley_dispatch::SubscriptionHandle;
use semver::VersionReq;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Extension};
use crate::context::{CoreContext, ExtensionContext, Staged};
use crate::manifest::ExtensionDescriptor;
use crate::resolve::{self, ResolvedExtension};

/// A successfully loaded extension.
#[derive(Clone)]
pub struct LoadedExtension {
    pub descriptor: ExtensionDescriptor,
    pub generation: usize,

    /// Extensions it requires; they cannot be unloaded before it
    pub requires: Vec<String>,

    pub capabilities: Vec<CapabilitySummary>,
    pub subscriptions: Vec<SubscriptionHandle>,
    pub loaded_at: DateTime<Utc>,

    instance: Arc<dyn Extension>,
    context: Arc<ExtensionContext>,
}

impl LoadedExtension {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn context(&self) -> &Arc<ExtensionContext> {
        &self.context
    }

    fn answers_to(&self, name: &str) -> bool {
        self.descriptor.provides().any(|p| p == name)
    }
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("generation", &self.generation)
            .field("capabilities", &self.capabilities.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// An extension that did not make it, and why.
#[derive(Debug)]
pub struct ExtensionFailure {
    pub extension: String,
    pub error: Error,
}

impl std::fmt::Display for ExtensionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.extension, self.error)
    }
}

/// Outcome of a load pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Loaded extension names, in load order
    pub loaded: Vec<String>,

    pub failures: Vec<ExtensionFailure>,
}

impl LoadReport {
    pub fn failed(&self, extension: &str) -> Option<&Error> {
        self.failures
            .iter()
            .find(|f| f.extension == extension)
            .map(|f| &f.error)
    }
}

#[derive(Default)]
struct Loaded {
    by_name: BTreeMap<String, LoadedExtension>,
    order: Vec<String>,
}

/// Loads, starts, stops, and unloads extensions against one [`CoreContext`].
pub struct Loader {
    core: Arc<CoreContext>,
    catalog: Catalog,
    loaded: RwLock<Loaded>,
}

impl Loader {
    pub fn new(core: Arc<CoreContext>, catalog: Catalog) -> Self {
        Self {
            core,
            catalog,
            loaded: RwLock::new(Loaded::default()),
        }
    }

    pub fn core(&self) -> &Arc<CoreContext> {
        &self.core
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ── Load ────────────────────────────────────────────────────────────────

    /// Resolve `descriptors` and load everything loadable, in order.
    ///
    /// Same-generation capabilities become mutually visible when this returns.
    pub async fn load_all(&self, descriptors: &[ExtensionDescriptor]) -> LoadReport {
        let partition = resolve::partition(descriptors);
        let mut report = LoadReport::default();
        let mut failed: BTreeSet<String> = BTreeSet::new();

        for (extension, error) in partition.rejected {
            warn!(extension = %extension, error = %error, "Extension rejected by dependency resolution");
            failed.insert(extension.clone());
            report.failures.push(ExtensionFailure {
                extension,
                error: error.into(),
            });
        }

        for resolved in &partition.order {
            let name = resolved.name().to_string();
            if let Some(ancestor) = resolved.requires.iter().find(|dep| failed.contains(*dep)) {
                let error = DependencyError::FailedAncestor {
                    extension: name.clone(),
                    ancestor: ancestor.clone(),
                };
                warn!(extension = %name, ancestor = %ancestor, "Skipping extension");
                failed.insert(name.clone());
                report.failures.push(ExtensionFailure {
                    extension: name,
                    error: error.into(),
                });
                continue;
            }

            match self.load(resolved).await {
                Ok(_) => report.loaded.push(name),
                Err(e) => {
                    failed.insert(name.clone());
                    report.failures.push(ExtensionFailure {
                        extension: name,
                        error: e.into(),
                    });
                }
            }
        }

        self.core.capabilities.complete_load_pass();
        report.failures.sort_by(|a, b| a.extension.cmp(&b.extension));
        info!(
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "Load pass complete"
        );
        report
    }

    /// Load a single resolved extension.
    pub async fn load(&self, resolved: &ResolvedExtension) -> Result<LoadedExtension, LoadError> {
        let descriptor = &resolved.descriptor;
        let name = descriptor.name.clone();
        if self.loaded.read().await.by_name.contains_key(&name) {
            return Err(LoadError::AlreadyLoaded { extension: name });
        }

        info!(
            extension = %name,
            version = %descriptor.version,
            generation = resolved.generation,
            "Loading extension"
        );

        let instance = self.instantiate(descriptor)?;
        let context = Arc::new(ExtensionContext::new(
            &name,
            descriptor.version.clone(),
            resolved.slot(),
            self.core.clone(),
        ));
        let fresh_namespace = !self.core.settings.namespaces().await.contains(&name);

        let committed = match self.run_load(descriptor, &instance, &context).await {
            Ok(staged) => self.commit(&name, staged).await,
            Err(e) => Err(e),
        };
        let (capabilities, subscriptions) = match committed {
            Ok(done) => done,
            Err(e) => {
                error!(extension = %name, error = %e, "Extension failed to load; rolling back");
                self.rollback(&name, fresh_namespace).await;
                return Err(e);
            }
        };
        context.mark_committed();

        let loaded = LoadedExtension {
            descriptor: descriptor.clone(),
            generation: resolved.generation,
            requires: resolved.requires.clone(),
            capabilities,
            subscriptions,
            loaded_at: Utc::now(),
            instance,
            context,
        };
        let mut state = self.loaded.write().await;
        state.order.push(name.clone());
        state.by_name.insert(name.clone(), loaded.clone());
        info!(
            extension = %name,
            capabilities = loaded.capabilities.len(),
            subscriptions = loaded.subscriptions.len(),
            "Extension loaded"
        );
        Ok(loaded)
    }

    fn instantiate(&self, descriptor: &ExtensionDescriptor) -> Result<Arc<dyn Extension>, LoadError> {
        let made = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.catalog.instantiate(&descriptor.entry_point)
        }));
        match made {
            Ok(Some(instance)) => Ok(Arc::from(instance)),
            Ok(None) => Err(LoadError::UnknownEntryPoint {
                extension: descriptor.name.clone(),
                entry_point: descriptor.entry_point.clone(),
            }),
            Err(_) => Err(LoadError::EntryPointPanicked {
                extension: descriptor.name.clone(),
            }),
        }
    }

    /// Declare manifest settings, run `load`, and validate what it staged.
    async fn run_load(
        &self,
        descriptor: &ExtensionDescriptor,
        instance: &Arc<dyn Extension>,
        context: &Arc<ExtensionContext>,
    ) -> Result<Staged, LoadError> {
        let name = &descriptor.name;
        for (key, schema) in &descriptor.config {
            self.core
                .settings
                .declare(name, key, schema.clone())
                .await
                .map_err(|source| LoadError::Setting {
                    extension: name.clone(),
                    source,
                })?;
        }

        match AssertUnwindSafe(instance.load(context)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(LoadError::EntryPointFailed {
                    extension: name.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(LoadError::EntryPointPanicked {
                    extension: name.clone(),
                });
            }
        }

        let staged = context.take_staged();
        validate_staged(descriptor, &staged)?;
        Ok(staged)
    }

    async fn commit(
        &self,
        name: &str,
        staged: Staged,
    ) -> Result<(Vec<CapabilitySummary>, Vec<SubscriptionHandle>), LoadError> {
        for (key, schema) in staged.settings {
            self.core
                .settings
                .declare(name, &key, schema)
                .await
                .map_err(|source| LoadError::Setting {
                    extension: name.to_string(),
                    source,
                })?;
        }

        let mut capabilities = Vec::with_capacity(staged.capabilities.len());
        for entry in &staged.capabilities {
            self.core
                .capabilities
                .register(entry.clone())
                .await
                .map_err(|source| LoadError::Capability {
                    extension: name.to_string(),
                    source,
                })?;
            capabilities.push(entry.summary());
        }

        let mut subscriptions = Vec::with_capacity(staged.subscriptions.len());
        for sub in staged.subscriptions {
            let trigger = staged
                .capabilities
                .iter()
                .filter(|e| e.name == sub.trigger)
                .filter_map(|e| match &e.handler {
                    Handler::Trigger(t) => Some((&e.version, t.clone())),
                    _ => None,
                })
                .max_by(|a, b| a.0.cmp(b.0))
                .map(|(_, t)| t)
                .ok_or_else(|| unknown_trigger(name, &sub.trigger))?;
            subscriptions.push(self.core.dispatcher.subscribe(
                sub.kind,
                name,
                &sub.trigger,
                trigger,
                sub.priority,
            ));
        }

        debug!(extension = %name, "Committed staged registrations");
        Ok((capabilities, subscriptions))
    }

    async fn rollback(&self, name: &str, remove_settings: bool) {
        let subscriptions = self.core.dispatcher.unsubscribe_owner(name);
        let capabilities = self.core.capabilities.unregister_owner(name).await;
        let settings = if remove_settings {
            self.core.settings.remove_namespace(name).await
        } else {
            0
        };
        debug!(extension = %name, subscriptions, capabilities, settings, "Rolled back extension");
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Run every loaded extension's `start` hook, in load order.
    pub async fn start_all(&self) -> Vec<ExtensionFailure> {
        let extensions = self.extensions().await;
        let mut failures = Vec::new();
        for ext in extensions {
            let name = ext.name().to_string();
            let reason = match AssertUnwindSafe(ext.instance.start(&ext.context))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {
                    debug!(extension = %name, "Extension started");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "start hook panicked".to_string(),
            };
            error!(extension = %name, reason = %reason, "Extension failed to start");
            failures.push(ExtensionFailure {
                error: LoadError::StartFailed {
                    extension: name.clone(),
                    reason,
                }
                .into(),
                extension: name,
            });
        }
        failures
    }

    /// Run every `stop` hook in reverse load order. Failures are logged.
    pub async fn stop_all(&self) {
        let extensions = self.extensions().await;
        for ext in extensions.iter().rev() {
            stop(ext).await;
        }
    }

    /// Stop and remove one extension (by name or alias).
    ///
    /// Refused while another loaded extension requires it.
    pub async fn unload(&self, name: &str) -> parley_core::Result<()> {
        let ext = {
            let mut state = self.loaded.write().await;
            let Some(target) = state
                .by_name
                .values()
                .find(|e| e.answers_to(name))
                .map(|e| e.descriptor.name.clone())
            else {
                return Err(LoadError::NotLoaded {
                    extension: name.to_string(),
                }
                .into());
            };

            let dependents: Vec<String> = state
                .by_name
                .values()
                .filter(|e| e.requires.contains(&target))
                .map(|e| e.descriptor.name.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(DependencyError::HasDependents {
                    extension: target,
                    dependents,
                }
                .into());
            }

            state.order.retain(|n| n != &target);
            match state.by_name.remove(&target) {
                Some(ext) => ext,
                None => {
                    return Err(LoadError::NotLoaded { extension: target }.into());
                }
            }
        };

        stop(&ext).await;
        self.rollback(ext.name(), true).await;
        info!(extension = %ext.name(), "Extension unloaded");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Loaded extensions in load order.
    pub async fn extensions(&self) -> Vec<LoadedExtension> {
        let state = self.loaded.read().await;
        state
            .order
            .iter()
            .filter_map(|n| state.by_name.get(n).cloned())
            .collect()
    }

    /// A loaded extension by name or `implements` alias.
    pub async fn extension(&self, name: &str) -> Option<LoadedExtension> {
        let state = self.loaded.read().await;
        state
            .by_name
            .get(name)
            .or_else(|| state.by_name.values().find(|e| e.answers_to(name)))
            .cloned()
    }
}

async fn stop(ext: &LoadedExtension) {
    match AssertUnwindSafe(ext.instance.stop(&ext.context))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => debug!(extension = %ext.name(), "Extension stopped"),
        Ok(Err(e)) => warn!(extension = %ext.name(), error = %e, "Extension stop hook failed"),
        Err(_) => warn!(extension = %ext.name(), "Extension stop hook panicked"),
    }
}

fn unknown_trigger(extension: &str, trigger: &str) -> LoadError {
    LoadError::Capability {
        extension: extension.to_string(),
        source: CapabilityError::NotFound {
            kind: CapabilityKind::Trigger,
            name: trigger.to_string(),
            requirement: VersionReq::STAR,
        },
    }
}

/// Staged capabilities must match the manifest's declarations exactly, and
/// every subscription must name a staged trigger.
fn validate_staged(descriptor: &ExtensionDescriptor, staged: &Staged) -> Result<(), LoadError> {
    let name = &descriptor.name;
    for entry in &staged.capabilities {
        if !descriptor.declares(entry.kind(), &entry.name, &entry.version) {
            return Err(LoadError::UndeclaredCapability {
                extension: name.clone(),
                kind: entry.kind(),
                name: entry.name.clone(),
                version: entry.version.clone(),
            });
        }
    }

    for decl in &descriptor.capabilities {
        let registered = staged
            .capabilities
            .iter()
            .any(|e| e.kind() == decl.kind && e.name == decl.name && e.version == decl.version);
        if !registered {
            return Err(LoadError::MissingCapability {
                extension: name.clone(),
                kind: decl.kind,
                name: decl.name.clone(),
                version: decl.version.clone(),
            });
        }
    }

    for sub in &staged.subscriptions {
        let staged_trigger = staged
            .capabilities
            .iter()
            .any(|e| e.kind() == CapabilityKind::Trigger && e.name == sub.trigger);
        if !staged_trigger {
            return Err(unknown_trigger(name, &sub.trigger));
        }
    }
    Ok(())
}
