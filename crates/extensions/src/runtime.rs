//! The assembled runtime: core services plus every loaded extension.

use chrono::Utc;
use parley_config::{AppConfig, SettingsRegistry};
use parley_core::capability::CapabilityRegistry;
use parley_core::entity::User;
use parley_core::event::{Event, EventPayload};
use parley_core::storage::StorageBackend;
use parley_dispatch::{DispatchConfig, Dispatcher, ShutdownReport};
use parley_store::{EntityStore, SELF_PLATFORM};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::context::{CORE_SOURCE, CoreContext};
use crate::loader::{ExtensionFailure, LoadReport, LoadedExtension, Loader};
use crate::manifest::{discover, overlay};

/// How to boot a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Root for per-extension storage directories
    pub data_dir: PathBuf,

    /// Scanned for extension manifests; `None` loads only bundled extensions
    pub extension_root: Option<PathBuf>,

    /// Extensions to load; empty loads everything available
    pub enabled: Vec<String>,

    /// Display name of the bot's own user
    pub profile_name: Option<String>,

    pub dispatch: DispatchConfig,

    /// How long shutdown waits for queued events
    pub shutdown_deadline: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("parley"),
            extension_root: None,
            enabled: Vec::new(),
            profile_name: None,
            dispatch: DispatchConfig::default(),
            shutdown_deadline: Duration::from_secs(5),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            data_dir: config.data_dir(),
            extension_root: Some(config.extension_root()),
            enabled: config.extensions.enabled.clone(),
            profile_name: Some(config.profile.name.clone()),
            dispatch: DispatchConfig {
                handler_timeout: Duration::from_secs(config.dispatcher.handler_timeout_secs),
                failure_buffer: config.dispatcher.failure_buffer,
                source_idle: Duration::from_secs(config.dispatcher.source_idle_secs),
            },
            shutdown_deadline: Duration::from_secs(config.dispatcher.shutdown_deadline_secs),
        }
    }
}

/// A running bot.
pub struct Runtime {
    loader: Loader,
    report: LoadReport,
    shutdown_deadline: Duration,
}

impl Runtime {
    /// Build the core, load and start extensions, then publish `Ready`.
    ///
    /// Extension failures never fail the boot; they are collected in
    /// [`report`](Self::report). Only storage being unavailable does.
    pub async fn boot(
        backend: Arc<dyn StorageBackend>,
        catalog: Catalog,
        options: RuntimeOptions,
    ) -> parley_core::Result<Self> {
        let core = Arc::new(CoreContext::new(
            backend,
            options.dispatch.clone(),
            options.data_dir.clone(),
        ));

        let me = core.store.self_user().await?;
        if let Some(name) = &options.profile_name {
            core.store.set_display_name(&me.id, SELF_PLATFORM, name).await?;
        }

        let mut report = LoadReport::default();
        let mut descriptors = catalog.bundled_descriptors().to_vec();
        if let Some(root) = &options.extension_root {
            let discovery = discover(root);
            info!(
                root = %root.display(),
                found = discovery.descriptors.len(),
                invalid = discovery.errors.len(),
                "Discovered extensions"
            );
            overlay(&mut descriptors, discovery.descriptors);
            for error in discovery.errors {
                let extension = match &error {
                    parley_core::LoadError::Manifest { path, .. } => path.clone(),
                    other => other.extension().unwrap_or_default().to_string(),
                };
                report.failures.push(ExtensionFailure {
                    extension,
                    error: error.into(),
                });
            }
        }
        if !options.enabled.is_empty() {
            descriptors.retain(|d| options.enabled.contains(&d.name));
        }

        let loader = Loader::new(core.clone(), catalog);
        let loaded = loader.load_all(&descriptors).await;
        report.loaded = loaded.loaded;
        report.failures.extend(loaded.failures);
        report.failures.extend(loader.start_all().await);

        if let Err(e) = core.dispatcher.publish(Event::new(CORE_SOURCE, EventPayload::Ready)) {
            warn!(error = %e, "Could not publish ready event");
        }
        info!(
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "Runtime ready"
        );

        Ok(Self {
            loader,
            report,
            shutdown_deadline: options.shutdown_deadline,
        })
    }

    pub fn core(&self) -> &Arc<CoreContext> {
        self.loader.core()
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.core().store
    }

    pub fn settings(&self) -> &Arc<SettingsRegistry> {
        &self.core().settings
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.core().capabilities
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core().dispatcher
    }

    /// What loaded and what did not.
    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// The bot's own user.
    pub async fn self_user(&self) -> parley_core::Result<User> {
        Ok(self.store().self_user().await?)
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.core().started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub async fn extensions(&self) -> Vec<LoadedExtension> {
        self.loader.extensions().await
    }

    /// A loaded extension by name or alias.
    pub async fn extension(&self, name: &str) -> Option<LoadedExtension> {
        self.loader.extension(name).await
    }

    pub async fn unload(&self, name: &str) -> parley_core::Result<()> {
        self.loader.unload(name).await
    }

    /// Publish `Shutdown`, drain the dispatcher, then stop extensions in
    /// reverse load order.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down");
        let core = self.core();
        if let Err(e) = core
            .dispatcher
            .publish(Event::new(CORE_SOURCE, EventPayload::Shutdown))
        {
            warn!(error = %e, "Could not publish shutdown event");
        }
        core.shutdown.cancel();

        let report = core.dispatcher.shutdown(self.shutdown_deadline).await;
        self.loader.stop_all().await;
        info!(
            drained = report.drained,
            dropped = report.dropped,
            aborted_actions = report.aborted_actions,
            "Runtime stopped"
        );
        report
    }
}
